//! Lifecycle configuration.

use std::time::Duration;

use crate::error::LifecycleError;
use crate::signals::{parse_signal, SignalBindings};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing and signal settings for the restart lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// How long a graceful drain waits for in-flight requests.
    pub grace_period: Duration,
    /// How long a successor has to signal readiness.
    pub startup_timeout: Duration,
    pub signals: SignalBindings,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            signals: SignalBindings::default(),
        }
    }
}

impl LifecycleConfig {
    /// Defaults, overridden by `COUNTERD_DRAIN_TIMEOUT_SECS`,
    /// `COUNTERD_STARTUP_TIMEOUT_SECS` and `COUNTERD_{RESTART,SHUTDOWN,TERMINATE}_SIGNAL`.
    pub fn from_env() -> Result<Self, LifecycleError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, LifecycleError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = var("COUNTERD_DRAIN_TIMEOUT_SECS") {
            config.grace_period = parse_secs("COUNTERD_DRAIN_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("COUNTERD_STARTUP_TIMEOUT_SECS") {
            config.startup_timeout = parse_secs("COUNTERD_STARTUP_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("COUNTERD_RESTART_SIGNAL") {
            config.signals.restart = parse_signal(&raw)?;
        }
        if let Some(raw) = var("COUNTERD_SHUTDOWN_SIGNAL") {
            config.signals.shutdown = parse_signal(&raw)?;
        }
        if let Some(raw) = var("COUNTERD_TERMINATE_SIGNAL") {
            config.signals.terminate = parse_signal(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.startup_timeout.is_zero() {
            return Err(LifecycleError::Config(
                "startup timeout must be greater than zero".to_string(),
            ));
        }
        self.signals.validate()
    }
}

/// Parse a duration given in (possibly fractional) seconds.
pub fn parse_secs(name: &str, raw: &str) -> Result<Duration, LifecycleError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| LifecycleError::Config(format!("{name}: invalid duration {raw:?}")))
}
