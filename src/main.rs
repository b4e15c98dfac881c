//! appserver
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────── Frontend (cluster id N) ─────────────────────────┐
//!  Client ───────▶│ net listener ─▶ http parse ─▶ dispatch ─┬─ local command (pre-auth, 'P') │
//!  Request        │                                          ├─ events ─▶ event listener      │
//!                 │                                          └─ forward ─┐                     │
//!                 │   control socket <N>.ctrl ◀── other Frontends        │                     │
//!                 └──────────────────────────────────────────────────────┼─────────────────────┘
//!                                                                        │ <sessID>.sock
//!                 ┌──────────── Worker (one per session) ────────────────▼─────────────────────┐
//!                 │ load_query ─▶ module command ─▶ render_response ─▶ raw HTTP back to relay  │
//!                 └────────────────────────────────────────────────────────────────────────────┘
//! ```

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use appserver::config::ServerConfig;
use appserver::control::{control_path, send_command, ControlCmd, ControlMessage};
use appserver::lifecycle::startup::{self, Overrides};
use appserver::observability::logging;
use appserver::{demo, events, frontend, worker};

#[derive(Parser)]
#[command(name = "appserver")]
#[command(about = "Multiprocess HTTP application server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Frontend
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override `cluster.id`
        #[arg(long)]
        cluster_id: Option<u32>,

        /// Override `listener.bind_address`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Worker entry point; reads its bootstrap from stdin
    #[command(hide = true)]
    Worker,
    /// Send a control command to a running Frontend
    Ctl {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        cluster_id: u32,

        #[command(subcommand)]
        action: CtlAction,
    },
    /// Post a push event to every listener of a session
    Post {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        session: String,

        data: String,
    },
}

#[derive(Subcommand)]
enum CtlAction {
    /// Liveness check
    Noop,
    /// Kill the Frontend's Workers and stop it
    Shutdown { reason: Option<String> },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Serve {
            config,
            cluster_id,
            bind,
        } => {
            let overrides = Overrides {
                cluster_id,
                bind_address: bind,
            };
            let config = startup::load(config.as_deref(), &overrides)?;
            startup::init_frontend(&config)?;
            tracing::info!("appserver v{} starting", env!("CARGO_PKG_VERSION"));
            let app = demo::application(&config);
            frontend::run(config, app).await?;
        }
        Commands::Worker => {
            if let Err(e) = worker::run_worker(demo::application).await {
                tracing::error!(target: "appserver::worker", error = %e, "Worker failed");
                return Err(e.into());
            }
        }
        Commands::Ctl {
            config,
            cluster_id,
            action,
        } => {
            let config = load_quiet(config)?;
            let cmd = match action {
                CtlAction::Noop => ControlCmd::Noop,
                CtlAction::Shutdown { reason } => ControlCmd::Shutdown {
                    reason: reason.unwrap_or_else(|| "requested by operator".to_string()),
                },
            };
            let path = control_path(&config.paths.sockets, cluster_id);
            match send_command(&path, &ControlMessage::synchronous(cmd)).await? {
                Some(status) => println!("{}", status),
                None => println!("sent"),
            }
        }
        Commands::Post {
            config,
            session,
            data,
        } => {
            let config = load_quiet(config)?;
            let delivered = events::post_event(&config.paths.events, &session, data.as_bytes()).await?;
            println!("{}", delivered);
        }
    }
    Ok(())
}

/// Configuration for the one-shot client commands.
fn load_quiet(path: Option<PathBuf>) -> Result<ServerConfig, Box<dyn Error>> {
    let config = startup::load(path.as_deref(), &Overrides::default())?;
    logging::init(&config.observability.log_level);
    Ok(config)
}
