//! Configuration options.
//!
//! Applications built on the probe core define their own command line arguments, but the
//! concurrency backbone itself is configured through a separate TOML file that sizes the
//! decoupling queue, the per-thread counter blocks, and each worker-pool stage. The path to the
//! configuration file will typically be a command line argument passed to the application.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads and validates a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = parse_config(&config_str)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// Parses and validates a configuration from a TOML string.
pub fn parse_config(config_str: &str) -> Result<RuntimeConfig> {
    let config: RuntimeConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Returns a default configuration.
///
/// For demonstration purposes only, not tuned for performance:
/// ```toml
/// [queue]
///     capacity = 4096
///     burst_limit = 9999
///     idle_sleep_us = 1000
///
/// [counters]
///     capacity = 64
///     application = "probe"
///     module = "core"
///
/// [[stages]]
///     name = "default"
///     workers = 2
///     queue_size = 1024
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Decoupling queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Per-thread counter settings.
    #[serde(default)]
    pub counters: CountersConfig,

    /// Worker-pool stages, one entry per logical processing stage.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl RuntimeConfig {
    /// Returns the configuration of the stage named `name`, if any.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Checks the cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.counters.capacity == 0 {
            bail!("counters.capacity must be greater than 0");
        }
        let mut names = HashSet::new();
        for stage in self.stages.iter() {
            if !names.insert(stage.name.as_str()) {
                bail!("duplicate stage name: {}", stage.name);
            }
            stage.validate()?;
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            queue: QueueConfig::default(),
            counters: CountersConfig::default(),
            stages: vec![StageConfig::new("default", 2)],
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Decoupling queue options.
///
/// ## Example
/// ```toml
/// [queue]
///     capacity = 65536
///     burst_limit = 9999
///     idle_sleep_us = 1000
///     core = 1
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct QueueConfig {
    /// Number of items the ring buffer can hold. Defaults to `4096`.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Maximum number of items dispatched in one burst before the dispatcher yields. Defaults to
    /// `9999`.
    ///
    /// ## Remarks
    /// The burst limit bounds the time between two yield points of the dispatcher thread under
    /// sustained load. It does not apply while draining on shutdown.
    #[serde(default = "default_burst_limit")]
    pub burst_limit: usize,

    /// Time (in microseconds) the dispatcher sleeps when the ring is empty or a burst has ended.
    /// Defaults to `1000`.
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,

    /// Core the dispatcher thread is pinned to. Defaults to `None` (unpinned).
    #[serde(default)]
    pub core: Option<usize>,
}

impl QueueConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        QueueConfig {
            capacity,
            ..QueueConfig::default()
        }
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("queue.capacity must be greater than 0");
        }
        if self.burst_limit == 0 {
            bail!("queue.burst_limit must be greater than 0");
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: default_queue_capacity(),
            burst_limit: default_burst_limit(),
            idle_sleep_us: default_idle_sleep_us(),
            core: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_burst_limit() -> usize {
    9999
}

fn default_idle_sleep_us() -> u64 {
    1000
}

/* --------------------------------------------------------------------------------- */

/// Per-thread counter options.
///
/// ## Example
/// ```toml
/// [counters]
///     capacity = 128
///     application = "gtp-probe"
///     module = "tickets"
///     host = "probe-01"
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CountersConfig {
    /// Number of counter slots in every per-thread block. Counter indices must be smaller than
    /// this value. Defaults to `64`.
    #[serde(default = "default_counters_capacity")]
    pub capacity: usize,

    /// Application name written to database rows. Defaults to `"probe"`.
    #[serde(default = "default_application")]
    pub application: String,

    /// Module name written to database rows. Defaults to `"core"`.
    #[serde(default = "default_module")]
    pub module: String,

    /// Host name written to database rows. Defaults to the machine hostname.
    #[serde(default)]
    pub host: Option<String>,
}

impl CountersConfig {
    /// Returns the configured host, falling back to the machine hostname.
    pub fn host_or_default(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_owned()),
        }
    }
}

impl Default for CountersConfig {
    fn default() -> Self {
        CountersConfig {
            capacity: default_counters_capacity(),
            application: default_application(),
            module: default_module(),
            host: None,
        }
    }
}

fn default_counters_capacity() -> usize {
    64
}

fn default_application() -> String {
    "probe".to_owned()
}

fn default_module() -> String {
    "core".to_owned()
}

/* --------------------------------------------------------------------------------- */

/// Worker-pool stage options.
///
/// ## Example
/// ```toml
/// [[stages]]
///     name = "tickets"
///     workers = 4
///     queue_size = 2048
///     cores = [2, 3, 4, 5]
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StageConfig {
    /// Stage name. Must be unique across the runtime.
    pub name: String,

    /// Number of worker threads. Defaults to `1`.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of each worker's input queue. Defaults to `1024`.
    #[serde(default = "default_stage_queue_size")]
    pub queue_size: usize,

    /// Cores the worker threads are pinned to, one per worker. Defaults to `None` (unpinned).
    #[serde(default)]
    pub cores: Option<Vec<usize>>,
}

impl StageConfig {
    pub fn new(name: &str, workers: usize) -> Self {
        StageConfig {
            name: name.to_owned(),
            workers,
            queue_size: default_stage_queue_size(),
            cores: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            bail!("stage {}: queue_size must be greater than 0", self.name);
        }
        if let Some(cores) = &self.cores {
            if cores.len() != self.workers {
                bail!(
                    "stage {}: {} cores configured for {} workers",
                    self.name,
                    cores.len(),
                    self.workers
                );
            }
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    1
}

fn default_stage_queue_size() -> usize {
    1024
}
