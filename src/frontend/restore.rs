//! Bounded Worker recovery.
//!
//! When a session's Worker socket refuses connections the Worker is gone but
//! the session file may still be valid. The Frontend then recreates the
//! Worker from the credentials stored in the session and tries again, at
//! most `worker.restore_attempts` times per request.
//!
//! Respawns of one session are serialized through a `RespawnGate`: the
//! holder re-checks the socket before spawning, so requests racing on a dead
//! Worker end up on the single replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::worker::WorkerError;

/// Per-session respawn locks.
#[derive(Debug, Default)]
pub struct RespawnGate {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RespawnGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task is restoring `session_id`.
    pub async fn lock(&self, session_id: &str) -> RespawnGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        RespawnGuard {
            gate: self,
            session_id: session_id.to_string(),
            _held: lock.lock_owned().await,
        }
    }

    /// Sessions with a restore in progress or waiting.
    pub fn pending(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive right to restore one session; the entry is dropped with the
/// last holder.
pub struct RespawnGuard<'a> {
    gate: &'a RespawnGate,
    session_id: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for RespawnGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.gate.locks.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this guard are the only owners left
        if locks.get(&self.session_id).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(&self.session_id);
        }
    }
}

/// How a Frontend reaches the Worker of a session.
#[allow(async_fn_in_trait)]
pub trait WorkerLink {
    type Conn;

    /// Open a connection to the running Worker of `session_id`.
    async fn connect(&self, session_id: &str) -> Result<Self::Conn, WorkerError>;

    /// Start a new Worker for the existing session `session_id`.
    async fn respawn(&self, session_id: &str) -> Result<(), WorkerError>;

    fn gate(&self) -> &RespawnGate;
}

/// Connect to the Worker of `session_id`, respawning it up to `attempts` times.
///
/// Only an unreachable Worker triggers a respawn. A failed respawn (for
/// instance rejected credentials) ends the attempt unless the socket came
/// back meanwhile.
pub async fn connect_or_respawn<L>(link: &L, session_id: &str, attempts: u32) -> Result<L::Conn, WorkerError>
where
    L: WorkerLink,
{
    let mut restored = 0;
    loop {
        match link.connect(session_id).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_unreachable() && restored < attempts => {
                restored += 1;
                let _guard = link.gate().lock(session_id).await;
                match link.connect(session_id).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) if e.is_unreachable() => {}
                    Err(e) => return Err(e),
                }
                tracing::info!(
                    target: "appserver::worker",
                    session_id = %session_id,
                    attempt = restored,
                    "Worker unreachable, respawning"
                );
                if let Err(e) = link.respawn(session_id).await {
                    // a peer Frontend may have restored it first
                    return link.connect(session_id).await.map_err(|_| e);
                }
            }
            Err(e) if e.is_unreachable() => {
                tracing::warn!(target: "appserver::worker", session_id = %session_id, "Worker could not be restored");
                return Err(WorkerError::RestoreFailed);
            }
            Err(e) => return Err(e),
        }
    }
}
