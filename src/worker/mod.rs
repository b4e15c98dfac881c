//! Worker processes.
//!
//! # Data Flow
//! ```text
//! Frontend                              Worker (`appserver worker`)
//!   create_worker ── stdin: Bootstrap ──▶ authenticate / resume session
//!                 ◀─ stdout: 10 bytes ──  bind <sockets>/<id>.sock
//!   connect ───────────────────────────▶ accept, send PID (u32 LE)
//!   save_query ────────────────────────▶ load_query → exec_worker_query
//!   relay ◀──────────────── raw HTTP ──  render_response
//! ```
//!
//! # Design Decisions
//! - A Worker is a separate OS process owning exactly one session
//! - The spawn pipe carries a fixed-width reply so the Frontend never has to
//!   parse variable-length output from a child that may have crashed
//! - Queries are executed one at a time, whichever Frontend connection
//!   they arrive on

pub mod serve;
pub mod spawn;

pub use serve::{exec_worker_query, run_worker, Executed, WorkerState};
pub use spawn::{
    create_worker, Bootstrap, Children, ExitNotice, ProcessSpawner, SpawnReply, SpawnRequest,
    WorkerHandle, REPLY_LEN,
};

use std::path::{Path, PathBuf};

/// Error type for Worker management.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Auth(String),
    #[error("Worker failed to start: {0}")]
    Spawn(String),
    #[error("Session is already served by a running worker")]
    Busy,
    #[error("Worker handshake failed")]
    Handshake,
    #[error("Worker did not respond in time")]
    Timeout,
    #[error("Worker is unreachable")]
    Unreachable,
    #[error("Session could not be restored")]
    RestoreFailed,
    #[error("Malformed worker response: {0}")]
    BadResponse(&'static str),
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// The Worker process is gone and a respawn may help.
    pub fn is_unreachable(&self) -> bool {
        match self {
            WorkerError::Unreachable => true,
            WorkerError::Codec(e) => e.is_broken_pipe(),
            WorkerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Path of the Worker socket for `session_id`.
pub fn socket_path(sockets_dir: &Path, session_id: &str) -> PathBuf {
    sockets_dir.join(format!("{}.sock", session_id))
}
