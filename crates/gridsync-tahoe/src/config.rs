//! Runtime options for gateways
//!
//! Values come from `Default`, a serialized document, or environment
//! overrides. They are resolved once into [`crate::GatewayServices`].

use crate::error::{Result, TahoeError};
use crate::process::LauncherKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// How a running node is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopStrategy {
    /// Send SIGTERM to the pid in `twistd.pid` and remove the file
    Signal,
    /// Ask the daemon itself via `tahoe stop`
    Command,
}

impl StopStrategy {
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            StopStrategy::Signal
        } else {
            StopStrategy::Command
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Explicit `tahoe` executable; `PATH` lookup when unset
    pub executable: Option<PathBuf>,
    /// Readiness polling interval
    pub poll_interval_ms: u64,
    pub stop_strategy: StopStrategy,
    pub launcher: LauncherKind,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            executable: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stop_strategy: StopStrategy::platform_default(),
            launcher: LauncherKind::platform_default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `GRIDSYNC_TAHOE_EXECUTABLE`,
    /// `GRIDSYNC_POLL_INTERVAL_MS`, `GRIDSYNC_STOP_STRATEGY` and
    /// `GRIDSYNC_LAUNCHER`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(exe) = lookup("GRIDSYNC_TAHOE_EXECUTABLE").filter(|v| !v.is_empty()) {
            config.executable = Some(PathBuf::from(exe));
        }
        if let Some(ms) = lookup("GRIDSYNC_POLL_INTERVAL_MS") {
            config.poll_interval_ms = ms.trim().parse().map_err(|_| {
                TahoeError::Config(format!("GRIDSYNC_POLL_INTERVAL_MS is not a number: {ms}"))
            })?;
        }
        if let Some(strategy) = lookup("GRIDSYNC_STOP_STRATEGY") {
            config.stop_strategy = match strategy.trim().to_ascii_lowercase().as_str() {
                "signal" => StopStrategy::Signal,
                "command" => StopStrategy::Command,
                other => {
                    return Err(TahoeError::Config(format!("Unknown stop strategy: {other}")))
                }
            };
        }
        if let Some(launcher) = lookup("GRIDSYNC_LAUNCHER") {
            config.launcher = match launcher.trim().to_ascii_lowercase().as_str() {
                "streaming" => LauncherKind::Streaming,
                "blocking" => LauncherKind::Blocking,
                other => return Err(TahoeError::Config(format!("Unknown launcher: {other}"))),
            };
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
