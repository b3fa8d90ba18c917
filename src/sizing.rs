//! Closed-form estimate of how many primaries a batch needs.

use crate::config::SystemParameters;

/// Primaries needed to label `items` items, assuming each unit works its
/// whole station window at an average reach of a third of the batch size.
pub fn required_workers(params: &SystemParameters, items: usize) -> usize {
    if items == 0 {
        return 0;
    }
    let time_per_station = params.worker_spacing / params.line_speed;
    let time_per_item = (params.batch_size / 3.0) / params.worker_speed;
    let per_worker = ((time_per_station / time_per_item).floor() as usize).max(1);
    items.div_ceil(per_worker)
}
