//! plane-daemon: model-serving control plane host
//!
//! # Usage
//!
//! ```bash
//! # Run the background tasks until Ctrl-C
//! plane-daemon run --config plane.toml
//!
//! # Print the routing decision for one task
//! plane-daemon route --config plane.toml --task-type code_generation \
//!     --context-length 6000 --estimated-tokens 2000
//!
//! # Validate a config and print the effective values
//! RUST_LOG=debug plane-daemon check-config --config plane.yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use control_plane::{Backend, ControlPlane, Priority, TaskDescriptor};
use plane_daemon::{load_all, Daemon, DaemonChannels};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sweeper, health monitor and config watcher until Ctrl-C
    Run {
        /// Path to the TOML or YAML config file
        #[arg(long)]
        config: PathBuf,
    },
    /// Route a single task and print the decision as JSON
    Route {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        task_type: String,
        #[arg(long, default_value_t = 0)]
        context_length: u32,
        #[arg(long, default_value_t = 0)]
        estimated_tokens: u32,
        /// normal or high
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Force a backend: local or cloud
        #[arg(long)]
        prefer: Option<Backend>,
    },
    /// Validate a config file and print the effective configuration
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run { config } => run(config).await,
        Command::Route {
            config,
            task_type,
            context_length,
            estimated_tokens,
            priority,
            prefer,
        } => {
            let (plane_config, _) = load_all(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let plane = ControlPlane::from_config(plane_config)?;
            let mut task = TaskDescriptor::new(task_type, context_length, estimated_tokens)
                .with_priority(priority);
            task.user_preference = prefer;
            let decision = plane.route(&task)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::CheckConfig { config } => {
            let (plane_config, daemon_config) = load_all(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let effective = serde_json::json!({
                "plane": plane_config,
                "daemon": daemon_config,
            });
            println!("{}", serde_json::to_string_pretty(&effective)?);
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let (plane_config, daemon_config) = load_all(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let plane = Arc::new(ControlPlane::from_config(plane_config)?);
    let mut daemon = Daemon::new(plane, daemon_config, Some(config_path.clone()));
    let DaemonChannels {
        mut unloads,
        mut events,
    } = daemon.start();

    info!(config = %config_path.display(), "plane-daemon running");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            Some(request) = unloads.recv() => emit("unload", &request)?,
            Some(event) = events.recv() => {
                if let control_plane::SupervisorEvent::RestartLimitExceeded { agent_id, attempts } = &event {
                    tracing::error!(agent = %agent_id, attempts, "Operator attention required");
                }
                emit("supervisor", &event)?;
            }
        }
    }

    daemon.shutdown().await;
    Ok(())
}

/// One JSON line on stdout per message for the external collaborators
fn emit<T: Serialize>(channel: &str, payload: &T) -> Result<()> {
    let line = serde_json::json!({ "channel": channel, "payload": payload });
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}
