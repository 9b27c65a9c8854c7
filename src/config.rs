use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::limits::DEFAULT_MAX_OCCURRENCES;
use crate::model::MINUTE_MS;

/// Process configuration, read from `SORTIE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub lock_timeout_ms: u64,
    pub max_occurrences: usize,
    pub sweep_interval: Duration,
    pub no_show_grace_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            lock_timeout_ms: 2_000,
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
            sweep_interval: Duration::from_secs(30),
            no_show_grace_minutes: 30,
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

/// Like [`parsed`], but a zero period is as unusable as garbage.
fn nonzero_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    match parsed::<u64>(lookup, key)? {
        0 => {
            tracing::warn!("ignoring {key}=0; the period must be at least one second");
            None
        }
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: lookup("SORTIE_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: parsed(&lookup, "SORTIE_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "SORTIE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            lock_timeout_ms: parsed(&lookup, "SORTIE_LOCK_TIMEOUT_MS").unwrap_or(d.lock_timeout_ms),
            max_occurrences: parsed(&lookup, "SORTIE_MAX_OCCURRENCES").unwrap_or(d.max_occurrences),
            sweep_interval: nonzero_secs(&lookup, "SORTIE_SWEEP_INTERVAL_SECS").unwrap_or(d.sweep_interval),
            no_show_grace_minutes: parsed(&lookup, "SORTIE_NO_SHOW_GRACE_MINUTES")
                .unwrap_or(d.no_show_grace_minutes),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lock_timeout_ms: self.lock_timeout_ms,
            max_occurrences: self.max_occurrences,
            no_show_grace_ms: self.no_show_grace_minutes * MINUTE_MS,
        }
    }
}
