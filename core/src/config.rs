//! Configuration options.
//!
//! Runtime options are read from a TOML file with one section per concern.
//! The path to the configuration file itself will typically be a command
//! line argument passed to the application embedding the core.
//!
//! ```toml
//! nb_workers = 4
//!
//! [flow]
//!     capacity = 65536
//!     timeout = 60
//!
//! [tcp]
//!     accept_nonsyn = false
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads and validates a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let config_str = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str).context("Invalid config file")?;
    config.validate()?;
    Ok(config)
}

/// Returns the default configuration.
///
/// For demonstration purposes only, not tuned for performance.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of packet processing workers. Each worker owns a private flow
    /// manager instance group. Defaults to `1`.
    #[serde(default = "default_nb_workers")]
    pub nb_workers: usize,

    /// Flow manager settings.
    pub flow: FlowConfig,

    /// Bidirectional TCP tracker settings. The tracker is only instantiated
    /// when this section is present.
    #[serde(default = "default_tcp")]
    pub tcp: Option<TcpTrackerConfig>,
}

impl RuntimeConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.nb_workers == 0 {
            bail!("At least one worker is required");
        }
        self.flow.validate()?;
        if let Some(tcp) = &self.tcp {
            tcp.validate()?;
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            nb_workers: 1,
            flow: FlowConfig::default(),
            tcp: None,
        }
    }
}

fn default_nb_workers() -> usize {
    1
}

fn default_tcp() -> Option<TcpTrackerConfig> {
    None
}

/* --------------------------------------------------------------------------------- */

/// Configurable options for a flow manager.
///
/// ## Example
/// ```toml
/// [flow]
///     capacity = 65536
///     reserve = 64
///     timeout = 60
///     recycle_interval = 1.0
///     cache = true
///     lf = false
///     verbose = 1
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowConfig {
    /// Number of FCBs per worker, rounded up to a power of two.
    /// Defaults to `65536`.
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Bytes of opaque user region reserved per FCB for downstream stages.
    /// Defaults to `0`.
    #[serde(default = "default_reserve")]
    pub reserve: u32,

    /// Seconds before an idle flow is reclaimed. `0` disables expiry.
    /// Defaults to `60`.
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    /// Seconds between recycle passes. Defaults to `1.0`.
    #[serde(default = "default_recycle_interval")]
    pub recycle_interval: f64,

    /// Enables the last-5-tuple shortcut in the classifier. Defaults to
    /// `true`.
    #[serde(default = "default_cache")]
    pub cache: bool,

    /// Defers key release on delete so concurrent readers never observe
    /// recycled key memory. Required when the table is shared across
    /// workers. Defaults to `false`.
    #[serde(default = "default_lf")]
    pub lf: bool,

    /// Logging verbosity: `1` logs drops, `2` logs per-flow lifecycle
    /// events. Defaults to `1`.
    #[serde(default = "default_verbose")]
    pub verbose: u8,
}

impl FlowConfig {
    /// The recycle interval in whole milliseconds, at least one.
    pub(crate) fn recycle_ms(&self) -> u64 {
        ((self.recycle_interval * 1000.0).round() as u64).max(1)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("Flow capacity must be non-zero");
        }
        if !self.recycle_interval.is_finite() || self.recycle_interval <= 0.0 {
            bail!("Recycle interval must be a positive number of seconds");
        }
        if self.timeout > 0 && self.recycle_ms() > self.timeout as u64 * 1000 {
            bail!("Recycle interval must not exceed the flow timeout");
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            capacity: 65536,
            reserve: 0,
            timeout: 60,
            recycle_interval: 1.0,
            cache: true,
            lf: false,
            verbose: 1,
        }
    }
}

fn default_capacity() -> u32 {
    65536
}

fn default_reserve() -> u32 {
    0
}

fn default_timeout() -> u32 {
    60
}

fn default_recycle_interval() -> f64 {
    1.0
}

fn default_cache() -> bool {
    true
}

fn default_lf() -> bool {
    false
}

fn default_verbose() -> u8 {
    1
}

/* --------------------------------------------------------------------------------- */

/// Configurable options for the bidirectional TCP tracker.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpTrackerConfig {
    /// Accept flows that do not start with a SYN (e.g., connections that
    /// predate the tracker). Defaults to `true`.
    #[serde(default = "default_accept_nonsyn")]
    pub accept_nonsyn: bool,

    /// Seconds before an idle tracked flow is reclaimed. Shorter than the
    /// generic flow timeout because the tracker closes most connections
    /// itself. Defaults to `16`.
    #[serde(default = "default_tcp_timeout")]
    pub timeout: u32,

    /// Logging verbosity. Defaults to `0`.
    #[serde(default = "default_tcp_verbose")]
    pub verbose: u8,
}

impl TcpTrackerConfig {
    /// The per-direction flow manager configuration for this tracker.
    pub fn flow_config(&self, capacity: u32) -> FlowConfig {
        FlowConfig {
            capacity,
            timeout: self.timeout,
            ..FlowConfig::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout == 0 {
            bail!("TCP tracker timeout must be non-zero");
        }
        Ok(())
    }
}

impl Default for TcpTrackerConfig {
    fn default() -> Self {
        TcpTrackerConfig {
            accept_nonsyn: true,
            timeout: default_tcp_timeout(),
            verbose: 0,
        }
    }
}

fn default_accept_nonsyn() -> bool {
    true
}

fn default_tcp_timeout() -> u32 {
    16
}

fn default_tcp_verbose() -> u8 {
    0
}
