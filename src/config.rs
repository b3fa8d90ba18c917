//! Line parameters: defaults, TOML file loading, CLI overrides, validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LineError;
use crate::types::{MAX_ITEMS_PER_BATCH, MAX_WORKERS};

const DEFAULT_LINE_SPEED: f64 = 10.0;
const DEFAULT_BATCH_SIZE: f64 = 50.0;
const DEFAULT_LINE_LENGTH: f64 = 300.0;
const DEFAULT_MIN_ITEMS: usize = 10;
const DEFAULT_PRIMARY_WORKERS: usize = 4;
const DEFAULT_STANDBY_WORKERS: usize = 1;
const DEFAULT_TIME_SCALE: f64 = 0.01;
const DEFAULT_BATCHES: usize = 20;

/// Immutable operating parameters for one run. Distances in cm, speeds in cm/s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemParameters {
    pub line_speed: f64,
    pub batch_size: f64,
    pub line_length: f64,
    pub min_items: usize,
    pub max_items: usize,
    /// Chance that an eligible unit fails at the start of a batch cycle.
    pub failure_probability: f64,
    pub worker_speed: f64,
    pub worker_spacing: f64,
    pub batch_spacing: f64,
    pub primary_workers: usize,
    pub standby_workers: usize,
    /// Wall-clock seconds per simulated second.
    pub time_scale: f64,
    pub seed: Option<u64>,
    pub demand_scaling: bool,
}

impl Default for SystemParameters {
    fn default() -> Self {
        ParameterOverrides::default()
            .resolve()
            .expect("default parameters are valid")
    }
}

impl SystemParameters {
    pub fn total_workers(&self) -> usize {
        self.primary_workers + self.standby_workers
    }

    /// Station offset of primary slot `slot`, centred in its spacing window.
    pub fn station_offset(&self, slot: usize) -> f64 {
        (slot as f64 + 0.5) * self.worker_spacing
    }

    /// Simulated seconds a batch spends on the line.
    pub fn transit_secs(&self) -> f64 {
        self.line_length / self.line_speed
    }

    /// Simulated seconds between a retirement and the next publication.
    pub fn batch_gap_secs(&self) -> f64 {
        self.batch_spacing / self.line_speed
    }

    /// Simulated seconds to reach and label an item at `distance` cm.
    pub fn reach_secs(&self, distance: f64) -> f64 {
        distance / self.worker_speed
    }

    /// Convert simulated seconds to a wall-clock sleep.
    pub fn wall(&self, sim_secs: f64) -> Duration {
        let secs = sim_secs * self.time_scale;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    fn validate(&self) -> Result<(), LineError> {
        positive("line_speed", self.line_speed)?;
        positive("batch_size", self.batch_size)?;
        positive("line_length", self.line_length)?;
        positive("worker_speed", self.worker_speed)?;
        positive("worker_spacing", self.worker_spacing)?;
        positive("time_scale", self.time_scale)?;
        if !self.batch_spacing.is_finite() || self.batch_spacing < 0.0 {
            return Err(LineError::invalid("batch_spacing", "must be finite and >= 0"));
        }
        if !(0.0..=1.0).contains(&self.failure_probability) {
            return Err(LineError::invalid(
                "failure_probability",
                format!("must be within [0, 1], got {}", self.failure_probability),
            ));
        }
        if self.min_items == 0 {
            return Err(LineError::invalid("min_items", "must be > 0"));
        }
        if self.max_items < self.min_items {
            return Err(LineError::invalid(
                "max_items",
                format!("{} is below min_items {}", self.max_items, self.min_items),
            ));
        }
        if self.max_items > MAX_ITEMS_PER_BATCH {
            return Err(LineError::CapacityExceeded {
                what: "items per batch",
                requested: self.max_items,
                limit: MAX_ITEMS_PER_BATCH,
            });
        }
        if self.primary_workers == 0 {
            return Err(LineError::invalid("primary_workers", "must be > 0"));
        }
        if self.total_workers() > MAX_WORKERS {
            return Err(LineError::CapacityExceeded {
                what: "workers",
                requested: self.total_workers(),
                limit: MAX_WORKERS,
            });
        }
        let last_station = self.station_offset(self.primary_workers - 1);
        if last_station >= self.line_length {
            return Err(LineError::invalid(
                "worker_spacing",
                format!("last station at {last_station} cm lies past the line end"),
            ));
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), LineError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LineError::invalid(field, format!("must be > 0, got {value}")))
    }
}

/// Partial parameter set from a config file or the command line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterOverrides {
    pub line_speed: Option<f64>,
    pub batch_size: Option<f64>,
    pub line_length: Option<f64>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub failure_probability: Option<f64>,
    pub worker_speed: Option<f64>,
    pub worker_spacing: Option<f64>,
    pub batch_spacing: Option<f64>,
    pub primary_workers: Option<usize>,
    pub standby_workers: Option<usize>,
    pub time_scale: Option<f64>,
    pub seed: Option<u64>,
    pub demand_scaling: Option<bool>,
}

impl ParameterOverrides {
    /// Layer `other` over `self`; values present in `other` win.
    pub fn merge(self, other: ParameterOverrides) -> ParameterOverrides {
        ParameterOverrides {
            line_speed: other.line_speed.or(self.line_speed),
            batch_size: other.batch_size.or(self.batch_size),
            line_length: other.line_length.or(self.line_length),
            min_items: other.min_items.or(self.min_items),
            max_items: other.max_items.or(self.max_items),
            failure_probability: other.failure_probability.or(self.failure_probability),
            worker_speed: other.worker_speed.or(self.worker_speed),
            worker_spacing: other.worker_spacing.or(self.worker_spacing),
            batch_spacing: other.batch_spacing.or(self.batch_spacing),
            primary_workers: other.primary_workers.or(self.primary_workers),
            standby_workers: other.standby_workers.or(self.standby_workers),
            time_scale: other.time_scale.or(self.time_scale),
            seed: other.seed.or(self.seed),
            demand_scaling: other.demand_scaling.or(self.demand_scaling),
        }
    }

    /// Fill defaults, compute derived quantities once, and validate.
    pub fn resolve(self) -> Result<SystemParameters, LineError> {
        let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let line_length = self.line_length.unwrap_or(DEFAULT_LINE_LENGTH);
        let min_items = self.min_items.unwrap_or(DEFAULT_MIN_ITEMS);
        let primary_workers = self.primary_workers.unwrap_or(DEFAULT_PRIMARY_WORKERS);
        let max_items = self
            .max_items
            .unwrap_or_else(|| ((min_items as f64 * 1.2) as usize).max(min_items));
        let worker_spacing = self.worker_spacing.unwrap_or_else(|| {
            if primary_workers == 0 {
                line_length
            } else {
                line_length / primary_workers as f64
            }
        });

        let params = SystemParameters {
            line_speed: self.line_speed.unwrap_or(DEFAULT_LINE_SPEED),
            batch_size,
            line_length,
            min_items,
            max_items,
            failure_probability: self.failure_probability.unwrap_or(0.0),
            worker_speed: self.worker_speed.unwrap_or(batch_size / 10.0),
            worker_spacing,
            batch_spacing: self.batch_spacing.unwrap_or(batch_size * 1.5),
            primary_workers,
            standby_workers: self.standby_workers.unwrap_or(DEFAULT_STANDBY_WORKERS),
            time_scale: self.time_scale.unwrap_or(DEFAULT_TIME_SCALE),
            seed: self.seed,
            demand_scaling: self.demand_scaling.unwrap_or(false),
        };
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RunSection {
    batches: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    line: ParameterOverrides,
    run: RunSection,
}

/// Fully resolved configuration for a run.
#[derive(Clone, Debug, PartialEq)]
pub struct LineConfig {
    pub params: SystemParameters,
    /// File and CLI layers merged, before defaults. Sweeps re-resolve from
    /// here with their own roster sizes.
    pub overrides: ParameterOverrides,
    pub batches: usize,
}

impl LineConfig {
    /// Defaults, then the optional file, then CLI values.
    pub fn load(
        path: Option<&Path>,
        cli: ParameterOverrides,
        cli_batches: Option<usize>,
    ) -> Result<Self, LineError> {
        let file = match path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let overrides = file.line.merge(cli);
        let params = overrides.clone().resolve()?;
        let batches = cli_batches.or(file.run.batches).unwrap_or(DEFAULT_BATCHES);
        if batches == 0 {
            return Err(LineError::invalid("batches", "must be > 0"));
        }
        Ok(Self {
            params,
            overrides,
            batches,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, LineError> {
    let raw = fs::read_to_string(path).map_err(|source| LineError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| LineError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_follow_line_geometry() {
        let params = SystemParameters::default();
        assert_eq!(params.max_items, 12);
        assert_eq!(params.worker_speed, 5.0);
        assert_eq!(params.batch_spacing, 75.0);
        assert_eq!(params.worker_spacing, 75.0);
        assert_eq!(params.station_offset(0), 37.5);
        assert_eq!(params.transit_secs(), 30.0);
    }

    #[test]
    fn cli_values_win_over_file_values() {
        let file = ParameterOverrides {
            line_speed: Some(20.0),
            primary_workers: Some(6),
            ..Default::default()
        };
        let cli = ParameterOverrides {
            primary_workers: Some(3),
            ..Default::default()
        };
        let params = file.merge(cli).resolve().expect("valid");
        assert_eq!(params.line_speed, 20.0);
        assert_eq!(params.primary_workers, 3);
        assert_eq!(params.worker_spacing, 100.0);
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let err = ParameterOverrides {
            failure_probability: Some(1.5),
            ..Default::default()
        }
        .resolve()
        .expect_err("probability above one accepted");
        assert!(matches!(
            err,
            LineError::InvalidParameter {
                field: "failure_probability",
                ..
            }
        ));
    }

    #[test]
    fn rejects_roster_over_ceiling() {
        let err = ParameterOverrides {
            primary_workers: Some(30),
            standby_workers: Some(3),
            ..Default::default()
        }
        .resolve()
        .expect_err("oversized roster accepted");
        assert!(matches!(err, LineError::CapacityExceeded { .. }));
    }

    #[test]
    fn rejects_stations_past_line_end() {
        let err = ParameterOverrides {
            primary_workers: Some(4),
            worker_spacing: Some(100.0),
            ..Default::default()
        }
        .resolve()
        .expect_err("stations past the end accepted");
        assert!(matches!(
            err,
            LineError::InvalidParameter {
                field: "worker_spacing",
                ..
            }
        ));
    }

    #[test]
    fn wall_scales_simulated_seconds() {
        let params = ParameterOverrides {
            time_scale: Some(0.5),
            ..Default::default()
        }
        .resolve()
        .expect("valid");
        assert_eq!(params.wall(2.0), Duration::from_secs(1));
        assert_eq!(params.wall(-1.0), Duration::ZERO);
    }

    #[test]
    fn loads_toml_file_with_run_section() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[line]\nline_speed = 12.5\nstandby_workers = 2\n\n[run]\nbatches = 7"
        )
        .expect("write config");
        let config = LineConfig::load(Some(file.path()), ParameterOverrides::default(), None)
            .expect("config loads");
        assert_eq!(config.params.line_speed, 12.5);
        assert_eq!(config.params.standby_workers, 2);
        assert_eq!(config.batches, 7);
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[line]\nbelt_speed = 3.0").expect("write config");
        let err = LineConfig::load(Some(file.path()), ParameterOverrides::default(), None)
            .expect_err("unknown key accepted");
        assert!(matches!(err, LineError::ConfigParse { .. }));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = LineConfig::load(
            Some(Path::new("/nonexistent/line.toml")),
            ParameterOverrides::default(),
            None,
        )
        .expect_err("missing file accepted");
        assert!(matches!(err, LineError::ConfigRead { .. }));
    }
}
