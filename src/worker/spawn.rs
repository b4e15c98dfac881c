//! Worker creation and reaping.
//!
//! # Responsibilities
//! - Re-execute the server binary as a Worker and hand it its bootstrap
//! - Read the fixed-width spawn reply (session ID or failure sentinel)
//! - Await each child's exit and report it to the Frontend loop
//! - Track the PIDs this Frontend spawned so it can signal them on shutdown

use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::WorkerError;
use crate::config::ServerConfig;
use crate::session::SessionStore;

/// Width of the spawn reply.
pub const REPLY_LEN: usize = 10;

const AUTH_SENTINEL: &str = "AUTH";
const FAIL_SENTINEL: &str = "FAIL";

/// What a new Worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpawnRequest {
    /// Authenticate and create a fresh session.
    Login { user: String, pass: String, lang: String },
    /// Re-authenticate and take over an existing session.
    Resume {
        session_id: String,
        user: String,
        pass: String,
    },
}

/// Everything a Worker reads from its stdin at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    pub config: ServerConfig,
    pub request: SpawnRequest,
}

/// The Worker's answer on the spawn pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnReply {
    Session(String),
    Auth,
    Fail,
}

impl SpawnReply {
    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let text = match self {
            SpawnReply::Session(id) => id.as_str(),
            SpawnReply::Auth => AUTH_SENTINEL,
            SpawnReply::Fail => FAIL_SENTINEL,
        };
        let mut out = [b' '; REPLY_LEN];
        let n = text.len().min(REPLY_LEN);
        out[..n].copy_from_slice(&text.as_bytes()[..n]);
        out
    }

    /// Anything that is neither a sentinel nor a well-formed ID is a failure.
    pub fn decode(raw: &[u8; REPLY_LEN]) -> Self {
        let text = std::str::from_utf8(raw).unwrap_or("").trim_end_matches(' ');
        match text {
            AUTH_SENTINEL => SpawnReply::Auth,
            id if SessionStore::is_valid_shape(id) => SpawnReply::Session(id.to_string()),
            _ => SpawnReply::Fail,
        }
    }
}

/// A running Worker as seen by the Frontend that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub pid: u32,
    pub session_id: String,
}

/// A reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    pub pid: u32,
    pub status: i32,
}

/// PIDs of the Workers this Frontend spawned and has not yet reaped.
#[derive(Debug, Clone, Default)]
pub struct Children(Arc<Mutex<HashSet<u32>>>);

impl Children {
    pub fn insert(&self, pid: u32) {
        if let Ok(mut set) = self.0.lock() {
            set.insert(pid);
        }
    }

    pub fn remove(&self, pid: u32) -> bool {
        self.0.lock().map(|mut set| set.remove(&pid)).unwrap_or(false)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.0.lock().map(|set| set.contains(&pid)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `signal` to every tracked child. Returns how many were signalled.
    pub fn signal_all(&self, signal: libc::c_int) -> usize {
        let pids: Vec<u32> = match self.0.lock() {
            Ok(set) => set.iter().copied().collect(),
            Err(_) => return 0,
        };
        pids.into_iter()
            .filter(|&pid| {
                // SAFETY: kill(2) has no memory-safety preconditions.
                let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
                rc == 0
            })
            .count()
    }
}

/// Exit code, or 128 + signal for a killed child.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Start a Worker and wait for its spawn reply.
///
/// On success the child is returned still running; the caller owns reaping.
pub async fn create_worker(config: &ServerConfig, request: &SpawnRequest) -> Result<(Child, WorkerHandle), WorkerError> {
    let exe = match &config.worker.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };

    let mut child = Command::new(&exe)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| WorkerError::Spawn(format!("{}: {}", exe.display(), e)))?;

    let pid = child
        .id()
        .ok_or_else(|| WorkerError::Spawn("child exited immediately".to_string()))?;

    let bootstrap = Bootstrap {
        config: config.clone(),
        request: request.clone(),
    };
    let payload = serde_json::to_vec(&bootstrap).map_err(|e| WorkerError::Spawn(e.to_string()))?;

    let result = async {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdin pipe".to_string()))?;
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdout pipe".to_string()))?;
        let mut raw = [0u8; REPLY_LEN];
        let timeout = Duration::from_secs(config.worker.spawn_timeout_secs);
        match tokio::time::timeout(timeout, stdout.read_exact(&mut raw)).await {
            Err(_) => return Err(WorkerError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WorkerError::Spawn("worker exited before replying".to_string()))
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }
        Ok::<_, WorkerError>(SpawnReply::decode(&raw))
    }
    .await;

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }
    };

    match reply {
        SpawnReply::Session(session_id) => Ok((child, WorkerHandle { pid, session_id })),
        SpawnReply::Auth => {
            let _ = child.wait().await;
            Err(WorkerError::Auth("Invalid user name or password".to_string()))
        }
        SpawnReply::Fail => {
            let _ = child.wait().await;
            Err(WorkerError::Spawn("worker reported failure".to_string()))
        }
    }
}

/// Spawns Workers and reaps them in the background.
#[derive(Clone)]
pub struct ProcessSpawner {
    config: Arc<ServerConfig>,
    children: Children,
    exits: mpsc::UnboundedSender<ExitNotice>,
}

impl ProcessSpawner {
    pub fn new(config: Arc<ServerConfig>, children: Children, exits: mpsc::UnboundedSender<ExitNotice>) -> Self {
        Self {
            config,
            children,
            exits,
        }
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<WorkerHandle, WorkerError> {
        let (mut child, handle) = create_worker(&self.config, &request).await?;
        self.children.insert(handle.pid);
        metrics::counter!("web_workers_spawned_total").increment(1);
        tracing::info!(
            target: "appserver::worker",
            pid = handle.pid,
            session_id = %handle.session_id,
            "Worker spawned"
        );

        let exits = self.exits.clone();
        let pid = handle.pid;
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(target: "appserver::worker", pid, error = %e, "Failed to wait for worker");
                    -1
                }
            };
            let _ = exits.send(ExitNotice { pid, status });
        });
        Ok(handle)
    }
}
