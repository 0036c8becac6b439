//! Engine configuration types.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for the transaction engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Number of worker threads (0 = one per logical core).
    #[builder(default = "0")]
    #[serde(default)]
    pub worker_threads: usize,

    /// Upper bound on worker threads, applied after auto-detection.
    #[builder(default = "8")]
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Maximum number of entries kept on each of the undo and redo stacks.
    #[builder(default = "100")]
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    /// Minimum interval between progress updates from one job, in milliseconds.
    #[builder(default = "100")]
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Maximum candidates tried when generating a collision-free name.
    #[builder(default = "10_000")]
    #[serde(default = "default_name_probe_limit")]
    pub name_probe_limit: usize,

    /// Capacity of the engine event broadcast channel.
    #[builder(default = "1024")]
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_workers() -> usize {
    8
}

fn default_history_depth() -> usize {
    100
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_name_probe_limit() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

/// Reject zero for every setting that must be at least one.
fn check_nonzero(fields: [(&str, Option<usize>); 4]) -> Result<(), String> {
    match fields.into_iter().find(|(_, value)| *value == Some(0)) {
        Some((name, _)) => Err(format!("{name} must be at least 1")),
        None => Ok(()),
    }
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        check_nonzero([
            ("max_workers", self.max_workers),
            ("history_depth", self.history_depth),
            ("name_probe_limit", self.name_probe_limit),
            ("event_capacity", self.event_capacity),
        ])
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Apply the builder's checks to a config that bypassed the builder,
    /// such as one deserialized from a file.
    pub fn validate(&self) -> Result<(), String> {
        check_nonzero([
            ("max_workers", Some(self.max_workers)),
            ("history_depth", Some(self.history_depth)),
            ("name_probe_limit", Some(self.name_probe_limit)),
            ("event_capacity", Some(self.event_capacity)),
        ])
    }

    /// Number of workers the pool should run.
    pub fn effective_workers(&self) -> usize {
        let cap = self.max_workers.max(1);
        let wanted = match self.worker_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        };
        wanted.clamp(1, cap)
    }

    /// Minimum interval between progress updates.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_workers: default_max_workers(),
            history_depth: default_history_depth(),
            progress_interval_ms: default_progress_interval_ms(),
            name_probe_limit: default_name_probe_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}
