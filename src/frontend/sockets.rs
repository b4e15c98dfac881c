//! Connections from this Frontend to Worker processes.
//!
//! # Responsibilities
//! - Connect to a Worker socket and complete the PID handshake
//! - Keep idle connections per session for reuse
//! - Drop every connection bound to a Worker that exited
//!
//! # Design Decisions
//! - A connection is checked out for exactly one query and checked back in
//!   only after its response was relayed in full
//! - The pool lock is never held across an `.await`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use crate::worker::{socket_path, Children, WorkerError};

/// An open connection to the Worker serving `session_id`.
#[derive(Debug)]
pub struct SessionSocket {
    pub session_id: String,
    pub stream: UnixStream,
    pub worker_pid: u32,
    /// The Worker was spawned by this Frontend.
    pub worker_is_my_child: bool,
    /// Bytes read from the Worker beyond the last response.
    pub buf: Vec<u8>,
    /// Came from the pool rather than a fresh connect.
    pub reused: bool,
}

impl SessionSocket {
    /// Connect to the Worker of `session_id` and read its PID.
    ///
    /// A refused connection means the socket file outlived its Worker; the
    /// file is unlinked and the error reported as unreachable.
    pub async fn connect(
        sockets_dir: &Path,
        session_id: &str,
        children: &Children,
        handshake_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let path = socket_path(sockets_dir, session_id);
        let mut stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!(target: "appserver::worker", path = %path.display(), "Removing stale worker socket");
                let _ = std::fs::remove_file(&path);
                return Err(WorkerError::Unreachable);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(WorkerError::Unreachable),
            Err(e) => return Err(e.into()),
        };

        let mut pid = [0u8; 4];
        match tokio::time::timeout(handshake_timeout, stream.read_exact(&mut pid)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WorkerError::Unreachable),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(WorkerError::Handshake),
        }
        let worker_pid = u32::from_le_bytes(pid);

        Ok(Self {
            session_id: session_id.to_string(),
            stream,
            worker_pid,
            worker_is_my_child: children.contains(worker_pid),
            buf: Vec::new(),
            reused: false,
        })
    }
}

/// Idle Worker connections keyed by session ID.
#[derive(Debug, Default)]
pub struct SocketPool {
    idle: Mutex<HashMap<String, Vec<SessionSocket>>>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<SessionSocket>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn checkout(&self, session_id: &str) -> Option<SessionSocket> {
        let mut idle = self.lock();
        let list = idle.get_mut(session_id)?;
        let mut sock = list.pop()?;
        if list.is_empty() {
            idle.remove(session_id);
        }
        sock.reused = true;
        Some(sock)
    }

    pub fn checkin(&self, sock: SessionSocket) {
        self.lock().entry(sock.session_id.clone()).or_default().push(sock);
    }

    /// Close every connection to Worker `pid`. Returns how many were closed.
    pub fn purge_pid(&self, pid: u32) -> usize {
        let mut idle = self.lock();
        let mut closed = 0;
        idle.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.worker_pid != pid);
            closed += before - list.len();
            !list.is_empty()
        });
        closed
    }

    pub fn purge_session(&self, session_id: &str) -> usize {
        self.lock().remove(session_id).map_or(0, |list| list.len())
    }

    /// Number of idle connections.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    fn fake_worker(dir: &Path, id: &str, pid: u32) {
        let listener = UnixListener::bind(socket_path(dir, id)).unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(&pid.to_le_bytes()).await.unwrap();
            std::future::pending::<()>().await;
        });
    }

    #[tokio::test]
    async fn handshake_reads_pid() {
        let dir = tempfile::tempdir().unwrap();
        fake_worker(dir.path(), "42", 777);
        let children = Children::default();
        children.insert(777);
        let sock = SessionSocket::connect(dir.path(), "42", &children, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sock.worker_pid, 777);
        assert!(sock.worker_is_my_child);
        assert!(!sock.reused);
    }

    #[tokio::test]
    async fn stale_socket_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "9");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        let err = SessionSocket::connect(dir.path(), "9", &Children::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert!(!path.exists());

        let err = SessionSocket::connect(dir.path(), "10", &Children::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unreachable));
    }

    fn pooled(id: &str, pid: u32) -> SessionSocket {
        let (stream, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        stream.set_nonblocking(true).unwrap();
        SessionSocket {
            session_id: id.to_string(),
            stream: UnixStream::from_std(stream).unwrap(),
            worker_pid: pid,
            worker_is_my_child: false,
            buf: Vec::new(),
            reused: false,
        }
    }

    #[tokio::test]
    async fn pool_checkout_and_purge() {
        let pool = SocketPool::new();
        pool.checkin(pooled("1", 100));
        pool.checkin(pooled("1", 100));
        pool.checkin(pooled("2", 200));
        assert_eq!(pool.len(), 3);

        let sock = pool.checkout("1").unwrap();
        assert!(sock.reused);
        assert!(pool.checkout("3").is_none());

        assert_eq!(pool.purge_pid(100), 1);
        assert!(pool.checkout("1").is_none());
        assert_eq!(pool.purge_session("2"), 1);
        assert!(pool.is_empty());
    }
}
