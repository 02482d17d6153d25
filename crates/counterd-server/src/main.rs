use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use counterd_ecdysis::{Generation, LifecycleConfig};
use tracing::{error, info};

mod config;
mod metrics;
mod server;
mod telemetry;

use config::Cli;
use server::{AppState, HttpHandler};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("counterd starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let lifecycle = cli
        .lifecycle_config()
        .context("Invalid lifecycle configuration")?;
    cli.log_config();

    // Adopt listeners from a parent process (Ecdysis restart), if any. This
    // edits the environment, so it runs before the runtime spawns threads.
    let generation = Arc::new(
        Generation::from_env().context("Failed to inherit listeners from parent process")?,
    );
    info!(
        generation = generation.number(),
        pid = generation.pid(),
        successor = generation.is_successor(),
        "Generation starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(serve(cli, generation, lifecycle))
}

async fn serve(
    cli: Cli,
    generation: Arc<Generation>,
    lifecycle: LifecycleConfig,
) -> Result<ExitCode> {
    let state = AppState::new(Arc::clone(&generation), hostname()?);
    let handler = Arc::new(HttpHandler::new(state));

    for addr in &cli.addrs {
        let listener = match generation.listen(*addr) {
            Ok(listener) => listener,
            Err(e) => {
                generation.fail("listener setup failed");
                return Err(e).with_context(|| format!("Failed to listen on {addr}"));
            }
        };
        generation
            .attach(&listener, Arc::clone(&handler))
            .with_context(|| format!("Failed to serve {}", listener.local_addr()))?;
    }

    // Installs signal handlers, then marks the generation ready.
    let outcome = counterd_ecdysis::run(Arc::clone(&generation), lifecycle).await?;
    if outcome.is_forced() {
        error!(?outcome, "Exiting with requests cut short");
    } else {
        info!(?outcome, "Exiting");
    }

    Ok(ExitCode::from(outcome.exit_code() as u8))
}

/// Name this host answers to in `/` responses.
fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("Unable to get hostname");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}
