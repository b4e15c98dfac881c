//! Frontend process: terminates client HTTP and routes to Workers.
//!
//! # Data Flow
//! ```text
//! Listener (TCP, bounded)
//!     → connection.rs (parse, dispatch, relay)   one task per client
//!     → sockets.rs (pooled Worker connections)
//!     → restore.rs (respawn a dead Worker, bounded)
//!
//! Main loop also handles:
//!     Worker exits   → purge own pool, broadcast WORKER_CHLD
//!     Control socket → WORKER_CHLD / SHUTDOWN / NOOP
//!     SIGTERM/SIGINT → stop accepting, drain, exit
//! ```
//!
//! # Design Decisions
//! - Workers survive a Frontend restart; only `SHUTDOWN` terminates them
//! - All shared state lives in `ServerContext`, passed to every task

pub mod connection;
pub mod restore;
pub mod sockets;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::control::{self, reply, ControlCmd, ControlError, ControlMessage, ControlServer};
use crate::http::ResponseOptions;
use crate::lifecycle::{signals, Shutdown, StopReason};
use crate::module::Application;
use crate::net::{ClientSlots, Listener, ListenerError};
use crate::observability::metrics::{record_worker_exit, record_worker_respawn};
use crate::session::SessionStore;
use crate::worker::{Children, ExitNotice, ProcessSpawner, SpawnRequest, WorkerError};

pub use connection::{handle_connection, EVENTS_OP};
pub use restore::{connect_or_respawn, RespawnGate, WorkerLink};
pub use sockets::{SessionSocket, SocketPool};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Process-wide state of one Frontend.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub app: Arc<Application>,
    pub store: SessionStore,
    pub pool: SocketPool,
    pub spawner: ProcessSpawner,
    pub shutdown: Shutdown,
    pub clients: ClientSlots,
    pub opts: ResponseOptions,
    pub respawns: RespawnGate,
}

impl ServerContext {
    pub fn new(config: Arc<ServerConfig>, app: Arc<Application>, spawner: ProcessSpawner) -> Self {
        Self {
            store: SessionStore::new(&config.paths.sessions),
            opts: ResponseOptions::frontend(&config),
            pool: SocketPool::new(),
            shutdown: Shutdown::new(),
            clients: ClientSlots::new(config.listener.max_connections),
            respawns: RespawnGate::new(),
            config,
            app,
            spawner,
        }
    }

    /// Forget a Worker that exited and tell the rest of the cluster.
    fn on_worker_exit(&self, exit: ExitNotice) {
        self.spawner.children().remove(exit.pid);
        let purged = self.pool.purge_pid(exit.pid);
        record_worker_exit();
        tracing::info!(
            target: "appserver::worker",
            pid = exit.pid,
            status = exit.status,
            purged,
            "Worker exited"
        );

        let sockets = self.config.paths.sockets.clone();
        let cluster = self.config.cluster.clone();
        tokio::spawn(async move {
            let msg = ControlMessage::new(ControlCmd::WorkerChld {
                pid: exit.pid,
                status: exit.status,
            });
            control::broadcast(&sockets, cluster.id, cluster.max_size, &msg).await;
        });
    }

    /// Apply a control command. Returns the reply status; a `SHUTDOWN`
    /// also fires the stop notice.
    fn on_control(&self, cmd: &ControlCmd) -> i32 {
        match cmd {
            ControlCmd::WorkerChld { pid, status } => {
                let purged = self.pool.purge_pid(*pid);
                tracing::debug!(target: "appserver::worker", pid, status, purged, "Peer reported worker exit");
                purged as i32
            }
            ControlCmd::Shutdown { reason } => {
                let killed = self.spawner.children().signal_all(libc::SIGTERM);
                tracing::info!(reason = %reason, workers = killed, "Shutdown requested");
                self.shutdown.trigger(StopReason::Control(reason.clone()));
                0
            }
            ControlCmd::Noop => 0,
        }
    }
}

impl WorkerLink for ServerContext {
    type Conn = SessionSocket;

    async fn connect(&self, session_id: &str) -> Result<SessionSocket, WorkerError> {
        let timeout = Duration::from_secs(self.config.worker.spawn_timeout_secs);
        SessionSocket::connect(&self.config.paths.sockets, session_id, self.spawner.children(), timeout).await
    }

    async fn respawn(&self, session_id: &str) -> Result<(), WorkerError> {
        if !self.store.valid_session_id(session_id) {
            return Err(WorkerError::RestoreFailed);
        }
        let session = self.store.load(session_id)?;
        let handle = self
            .spawner
            .spawn(SpawnRequest::Resume {
                session_id: session.id,
                user: session.user,
                pass: session.password,
            })
            .await?;
        record_worker_respawn();
        if handle.session_id != session_id {
            return Err(WorkerError::Spawn(format!("resumed session {} instead", handle.session_id)));
        }
        Ok(())
    }

    fn gate(&self) -> &RespawnGate {
        &self.respawns
    }
}

/// Run a Frontend until a signal or a `SHUTDOWN` command.
pub async fn run(config: ServerConfig, app: Arc<Application>) -> Result<(), FrontendError> {
    let config = Arc::new(config);
    let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
    let spawner = ProcessSpawner::new(Arc::clone(&config), Children::default(), exits_tx);
    let ctx = Arc::new(ServerContext::new(Arc::clone(&config), app, spawner));

    let listener = Listener::bind(&config.listener, ctx.clients.clone()).await?;
    let control = ControlServer::bind(&config.paths.sockets, config.cluster.id)?;
    tracing::info!(
        cluster_id = config.cluster.id,
        control = %control.path().display(),
        "Frontend ready"
    );

    let signal = signals::wait_for_termination();
    tokio::pin!(signal);
    let mut signals_armed = true;
    let mut stop = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, slot)) => {
                    tokio::spawn(handle_connection(Arc::clone(&ctx), stream, slot));
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            Some(exit) = exits_rx.recv() => ctx.on_worker_exit(exit),
            command = control.accept() => match command {
                Ok((msg, mut stream)) => {
                    let status = ctx.on_control(&msg.cmd);
                    if msg.sync {
                        if let Err(e) = reply(&mut stream, status).await {
                            tracing::debug!(error = %e, "Control reply failed");
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Bad control command"),
            },
            sig = &mut signal, if signals_armed => {
                signals_armed = false;
                match sig {
                    Ok(t) => {
                        ctx.shutdown.trigger(StopReason::Signal(t));
                    }
                    Err(e) => tracing::error!(error = %e, "Signal handling unavailable"),
                }
            }
            _ = stop.stopped() => break,
        }
    }

    ctx.clients.close();
    if let Some(reason) = ctx.shutdown.reason() {
        tracing::info!(reason = %reason, "Frontend stopping");
    }
    let open = ctx.clients.drain(DRAIN_TIMEOUT).await;
    if open > 0 {
        tracing::warn!(connections = open, "Abandoning open connections");
    }
    drop(control);
    tracing::info!("Shutdown complete");
    Ok(())
}
