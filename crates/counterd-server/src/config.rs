//! Command line and environment configuration.
//!
//! Every flag can also be set through its `COUNTERD_*` environment variable.
//! A successor is started with the same arguments and environment, so it
//! comes up with the configuration of its predecessor.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use counterd_ecdysis::{
    parse_secs, parse_signal, signal_name, LifecycleConfig, LifecycleError, SignalBindings,
};
use tracing::info;

use crate::telemetry::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(name = "counterd")]
#[command(author, version, about = "HTTP counter service with zero-downtime restarts", long_about = None)]
pub struct Cli {
    /// Address to serve on. Repeat the flag (or comma-separate) for several.
    #[arg(
        long = "addr",
        env = "COUNTERD_ADDR",
        value_delimiter = ',',
        default_value = "0.0.0.0:8000"
    )]
    pub addrs: Vec<SocketAddr>,

    /// Seconds a graceful drain waits for in-flight requests.
    #[arg(long, env = "COUNTERD_DRAIN_TIMEOUT_SECS", default_value = "30", value_parser = parse_duration)]
    pub drain_timeout: Duration,

    /// Seconds a successor has to signal readiness during a restart.
    #[arg(long, env = "COUNTERD_STARTUP_TIMEOUT_SECS", default_value = "10", value_parser = parse_duration)]
    pub startup_timeout: Duration,

    /// Signal that triggers a zero-downtime restart.
    #[arg(long, env = "COUNTERD_RESTART_SIGNAL", default_value = "SIGUSR2", value_parser = parse_signal)]
    pub restart_signal: i32,

    /// Signal that triggers a graceful shutdown.
    #[arg(long, env = "COUNTERD_SHUTDOWN_SIGNAL", default_value = "SIGTERM", value_parser = parse_signal)]
    pub shutdown_signal: i32,

    /// Signal that triggers an immediate shutdown.
    #[arg(long, env = "COUNTERD_TERMINATE_SIGNAL", default_value = "SIGINT", value_parser = parse_signal)]
    pub terminate_signal: i32,

    #[arg(long, env = "COUNTERD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

fn parse_duration(raw: &str) -> Result<Duration, LifecycleError> {
    parse_secs("duration", raw)
}

impl Cli {
    /// Lifecycle settings for the restart core.
    pub fn lifecycle_config(&self) -> Result<LifecycleConfig, LifecycleError> {
        let config = LifecycleConfig {
            grace_period: self.drain_timeout,
            startup_timeout: self.startup_timeout,
            signals: SignalBindings {
                restart: self.restart_signal,
                shutdown: self.shutdown_signal,
                terminate: self.terminate_signal,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(addrs = ?self.addrs, "Listen addresses");
        info!(
            drain_timeout_ms = self.drain_timeout.as_millis() as u64,
            startup_timeout_ms = self.startup_timeout.as_millis() as u64,
            restart = %signal_name(self.restart_signal),
            shutdown = %signal_name(self.shutdown_signal),
            terminate = %signal_name(self.terminate_signal),
            "Lifecycle settings"
        );
    }
}
