//! Conveyor labeling line: concurrent robot workers claim items from
//! passing batches, with fault injection and standby cover.

pub mod claim;
pub mod config;
pub mod error;
pub mod feeder;
pub mod generator;
pub mod logging;
pub mod report;
pub mod shared_state;
pub mod sim;
pub mod sizing;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod worker;
