//! Configuration data model.
//!
//! Parsing the configuration file is, per the design, an external
//! collaborator's concern — the core only needs a concrete type to run
//! against. This follows `zzping-daemon::config::ServerConfig` exactly:
//! a `serde`-derived struct parsed out of a RON document with
//! `ron::de::from_str`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::rc::Rc;

/// One alarm definition. Identity is `(name, kind)`, matching spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmConfig {
    pub name: String,
    pub kind: AlarmKind,
    #[serde(default)]
    pub combine_interval_ms: u64,
    #[serde(default)]
    pub repeat_interval_ms: u64,
    #[serde(default)]
    pub repeat_max: u32,
    #[serde(default)]
    pub pipe_on: Option<String>,
    #[serde(default)]
    pub pipe_off: Option<String>,
    #[serde(default)]
    pub command_on: Option<String>,
    #[serde(default)]
    pub command_off: Option<String>,
    #[serde(default)]
    pub mailsubject: Option<String>,
    #[serde(default)]
    pub mailfrom: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum AlarmKind {
    Down { val_ms: u64 },
    Loss { high: f64, low: f64 },
    Delay { high: f64, low: f64 },
}

impl AlarmKind {
    /// `%A` macro expansion (spec §6).
    pub fn macro_name(&self) -> &'static str {
        match self {
            AlarmKind::Down { .. } => "down",
            AlarmKind::Loss { .. } => "loss",
            AlarmKind::Delay { .. } => "delay",
        }
    }

    /// Alarm identity is `(name, type)` (spec §3) — thresholds may change
    /// across a reload without the alarm losing its identity, so this
    /// compares discriminants only, not threshold values.
    pub fn same_type(&self, other: &AlarmKind) -> bool {
        matches!(
            (self, other),
            (AlarmKind::Down { .. }, AlarmKind::Down { .. })
                | (AlarmKind::Loss { .. }, AlarmKind::Loss { .. })
                | (AlarmKind::Delay { .. }, AlarmKind::Delay { .. })
        )
    }
}

fn default_avg_loss_delay_samples() -> usize {
    5
}
fn default_avg_delay_samples() -> usize {
    20
}
fn default_avg_loss_samples() -> usize {
    50
}
fn default_interval_ms() -> u64 {
    1000
}

/// A monitored target's configuration, matching spec §3's "Configuration
/// handle". Sampling-size defaults (5/20/50) and the probe interval
/// default (1000ms) come from `original_source`'s `target_defaults`,
/// which `spec.md` itself leaves unspecified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub srcip: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_avg_delay_samples")]
    pub avg_delay_samples: usize,
    #[serde(default = "default_avg_loss_delay_samples")]
    pub avg_loss_delay_samples: usize,
    #[serde(default = "default_avg_loss_samples")]
    pub avg_loss_samples: usize,
    #[serde(default)]
    pub force_down: bool,
    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
}

impl TargetConfig {
    pub fn loss_window_len(&self) -> usize {
        self.avg_loss_delay_samples + self.avg_loss_samples
    }
}

fn default_timestamp_format() -> String {
    "%b %d %H:%M:%S".to_string()
}
fn default_pid_file() -> String {
    "/var/run/pingwatch.pid".to_string()
}

/// Top-level configuration. Mirrors `apinger.c`'s `default_config` for
/// the global settings (`timestamp_format`, `pid_file`), extended with
/// the status/time-series flush intervals spec §4.8 schedules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default)]
    pub status_file: Option<String>,
    #[serde(default)]
    pub status_interval_ms: u64,
    #[serde(default)]
    pub timeseries_file: Option<String>,
    #[serde(default)]
    pub timeseries_interval_ms: u64,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    pub fn from_filepath(filepath: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(filepath).map_err(|source| ConfigError::Io {
            path: filepath.to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(contents)?)
    }
}

/// Shared, reference-counted handles into the parsed configuration, used
/// by [`crate::target::Target`] so that a config reload can re-point a
/// target's alarm bindings at the newly loaded objects without copying
/// them (spec §4.4: "alarm bindings are re-pointed to the new alarm
/// configs").
pub type AlarmConfigRef = Rc<AlarmConfig>;
pub type TargetConfigRef = Rc<TargetConfig>;

pub fn share_alarms(alarms: Vec<AlarmConfig>) -> Vec<AlarmConfigRef> {
    alarms.into_iter().map(Rc::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CFG: &str = r#"
        Config(
            status_file: Some("/tmp/pingwatch.status"),
            status_interval_ms: 5000,
            targets: [
                (
                    name: "192.0.2.1",
                    interval_ms: 1000,
                    alarms: [
                        (
                            name: "down",
                            kind: Down(val_ms: 5000),
                            combine_interval_ms: 2000,
                        ),
                        (
                            name: "loss",
                            kind: Loss(high: 60.0, low: 40.0),
                        ),
                    ],
                ),
            ],
        )
    "#;

    #[test]
    fn parses_sample_config() {
        let cfg = Config::from_str(SAMPLE_CFG).expect("should parse");
        assert_eq!(cfg.targets.len(), 1);
        let t = &cfg.targets[0];
        assert_eq!(t.name, "192.0.2.1");
        assert_eq!(t.avg_delay_samples, 20);
        assert_eq!(t.alarms.len(), 2);
        match t.alarms[0].kind {
            AlarmKind::Down { val_ms } => assert_eq!(val_ms, 5000),
            _ => panic!("expected Down"),
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(Config::from_str("").is_err());
    }

    #[test]
    fn from_filepath_missing_file_is_an_error() {
        assert!(matches!(
            Config::from_filepath("/nonexistent/pingwatch.ron"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn from_filepath_reads_real_file() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(tmpfile.as_file_mut(), "{}", SAMPLE_CFG).unwrap();
        let path = tmpfile.into_temp_path();
        let cfg = Config::from_filepath(path.to_str().unwrap()).expect("should parse");
        assert_eq!(cfg.targets.len(), 1);
        path.close().unwrap();
    }
}
