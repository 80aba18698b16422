//! modelrolld — the ModelRoll canary rollout controller.
//!
//! Single binary for both sides:
//! - `serve` runs the daemon (state store, audit recorder, supervisor,
//!   REST API)
//! - `start`, `abort`, `status`, `audit` talk to a running daemon
//! - `validate-policy` checks a policy file offline
//!
//! # Usage
//!
//! ```text
//! modelrolld serve --config /etc/modelroll/modelrolld.toml
//! modelrolld start --service ranker --stable v1 --candidate v2 --policy canary.toml
//! modelrolld status <rollout-id>
//! ```
//!
//! Exit codes: 0 on success, 2 on conflicts and rejected requests, 1 on
//! internal or transport failures.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use modelroll_core::{PolicyViolation, RolloutTarget};

mod client;
mod commands;
mod config;
mod daemon;
mod router;
mod transport;

use client::{ApiClient, ClientError};
use config::DaemonConfig;

const DEFAULT_FILTER: &str = "info,modelrolld=debug,modelroll=debug";

#[derive(Parser)]
#[command(
    name = "modelrolld",
    about = "ModelRoll: canary rollouts with automatic rollback for ML models",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller daemon.
    Serve {
        /// Path to modelrolld.toml. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the audit store (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Start a rollout.
    Start {
        #[command(flatten)]
        server: ServerArg,
        #[arg(long)]
        service: String,
        /// Version currently serving all traffic.
        #[arg(long)]
        stable: String,
        /// Version to roll out.
        #[arg(long)]
        candidate: String,
        /// Policy file (TOML, or JSON by extension). Uses the daemon default when omitted.
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Force a rollback of an active rollout.
    Abort {
        #[command(flatten)]
        server: ServerArg,
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show one rollout, or list all of them.
    Status {
        #[command(flatten)]
        server: ServerArg,
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the audit trail of a rollout.
    Audit {
        #[command(flatten)]
        server: ServerArg,
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Check a policy file without contacting the daemon.
    ValidatePolicy { path: PathBuf },
}

#[derive(clap::Args)]
struct ServerArg {
    /// Daemon address (host:port).
    #[arg(long, default_value = "127.0.0.1:8470")]
    server: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            daemon::run_serve(config).await
        }
        Command::Start {
            server,
            service,
            stable,
            candidate,
            policy,
        } => {
            let target = RolloutTarget::new(&service, &stable, &candidate);
            target.validate()?;
            commands::start(&ApiClient::new(server.server), target, policy.as_deref()).await
        }
        Command::Abort { server, id, reason } => {
            commands::abort(&ApiClient::new(server.server), &id, reason).await
        }
        Command::Status { server, id, json } => {
            commands::status(&ApiClient::new(server.server), id.as_deref(), json).await
        }
        Command::Audit { server, id, json } => {
            commands::audit(&ApiClient::new(server.server), &id, json).await
        }
        Command::ValidatePolicy { path } => commands::validate_policy(&path),
    }
}

/// 2 for caller mistakes (conflicts, rejected input), 1 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(client) = err.downcast_ref::<ClientError>() {
        return client.exit_code();
    }
    if err.downcast_ref::<PolicyViolation>().is_some() {
        return 2;
    }
    1
}
