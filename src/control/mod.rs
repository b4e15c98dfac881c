//! Control Channel between cooperating Frontends.
//!
//! # Responsibilities
//! - Fixed-size command encoding (`WORKER_CHLD`, `SHUTDOWN`, `NOOP`)
//! - One Unix socket per cluster member: `<sockets>/<clusterID>.ctrl`
//! - Point-to-point send with optional synchronous status reply
//! - Bounded broadcast to every other member of the cluster
//!
//! # Wire Format
//! ```text
//! offset 0   kind     u8   (1 = WORKER_CHLD, 2 = SHUTDOWN, 3 = NOOP)
//! offset 1   flags    u8   (bit 0: reply requested)
//! offset 2   reserved u16
//! offset 4   payload  [u8; 68]
//!            WORKER_CHLD: pid u32 LE, status i32 LE
//!            SHUTDOWN:    reason, UTF-8, NUL padded
//! ```
//! A reply, when requested, is a single i32 little-endian status.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Size of every encoded command.
pub const CMD_SIZE: usize = 72;

/// Longest shutdown reason carried.
pub const MAX_REASON_LEN: usize = CMD_SIZE - 4;

/// The sender waits for a status reply.
pub const FLAG_SYNC: u8 = 0x01;

const KIND_WORKER_CHLD: u8 = 1;
const KIND_SHUTDOWN: u8 = 2;
const KIND_NOOP: u8 = 3;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Unknown control command {0}")]
    UnknownKind(u8),
    #[error("Shutdown reason is not valid UTF-8")]
    BadReason,
    #[error("Control peer did not reply")]
    NoReply,
    #[error("Control I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCmd {
    /// A Worker exited; drop every socket bound to its PID.
    WorkerChld { pid: u32, status: i32 },
    /// Kill directly spawned Workers, then exit.
    Shutdown { reason: String },
    /// Liveness check.
    Noop,
}

impl ControlCmd {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ControlCmd::WorkerChld { .. } => "worker_chld",
            ControlCmd::Shutdown { .. } => "shutdown",
            ControlCmd::Noop => "noop",
        }
    }
}

/// A command plus its delivery flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub cmd: ControlCmd,
    pub sync: bool,
}

impl ControlMessage {
    pub fn new(cmd: ControlCmd) -> Self {
        Self { cmd, sync: false }
    }

    pub fn synchronous(cmd: ControlCmd) -> Self {
        Self { cmd, sync: true }
    }

    pub fn encode(&self) -> [u8; CMD_SIZE] {
        let mut out = [0u8; CMD_SIZE];
        out[1] = if self.sync { FLAG_SYNC } else { 0 };
        match &self.cmd {
            ControlCmd::WorkerChld { pid, status } => {
                out[0] = KIND_WORKER_CHLD;
                out[4..8].copy_from_slice(&pid.to_le_bytes());
                out[8..12].copy_from_slice(&status.to_le_bytes());
            }
            ControlCmd::Shutdown { reason } => {
                out[0] = KIND_SHUTDOWN;
                // cut on a char boundary
                let mut n = reason.len().min(MAX_REASON_LEN);
                while !reason.is_char_boundary(n) {
                    n -= 1;
                }
                out[4..4 + n].copy_from_slice(&reason.as_bytes()[..n]);
            }
            ControlCmd::Noop => out[0] = KIND_NOOP,
        }
        out
    }

    pub fn decode(raw: &[u8; CMD_SIZE]) -> Result<Self, ControlError> {
        let sync = raw[1] & FLAG_SYNC != 0;
        let word = |at: usize| [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];
        let cmd = match raw[0] {
            KIND_WORKER_CHLD => ControlCmd::WorkerChld {
                pid: u32::from_le_bytes(word(4)),
                status: i32::from_le_bytes(word(8)),
            },
            KIND_SHUTDOWN => {
                let payload = &raw[4..];
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                let reason = std::str::from_utf8(&payload[..end]).map_err(|_| ControlError::BadReason)?;
                ControlCmd::Shutdown {
                    reason: reason.to_string(),
                }
            }
            KIND_NOOP => ControlCmd::Noop,
            other => return Err(ControlError::UnknownKind(other)),
        };
        Ok(Self { cmd, sync })
    }
}

/// Control socket path for `cluster_id`.
pub fn control_path(sockets_dir: &Path, cluster_id: u32) -> PathBuf {
    sockets_dir.join(format!("{}.ctrl", cluster_id))
}

/// Send one command. Returns the peer's status if a reply was requested.
pub async fn send_command(path: &Path, msg: &ControlMessage) -> Result<Option<i32>, ControlError> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(&msg.encode()).await?;
    if !msg.sync {
        return Ok(None);
    }
    let mut reply = [0u8; 4];
    tokio::time::timeout(REPLY_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .map_err(|_| ControlError::NoReply)??;
    Ok(Some(i32::from_le_bytes(reply)))
}

/// Send `msg` to every cluster member except `self_id`.
///
/// Members are contacted up to `max_size`; an absent socket file means no such
/// member. Returns the number of members reached.
pub async fn broadcast(sockets_dir: &Path, self_id: u32, max_size: u32, msg: &ControlMessage) -> usize {
    let mut reached = 0;
    for id in (1..=max_size).filter(|&id| id != self_id) {
        let path = control_path(sockets_dir, id);
        if !path.exists() {
            continue;
        }
        match send_command(&path, msg).await {
            Ok(_) => reached += 1,
            Err(e) => tracing::debug!(cluster_id = id, error = %e, "Control peer unreachable"),
        }
    }
    metrics::counter!("web_control_commands_total", "kind" => msg.cmd.kind_label()).increment(reached as u64);
    reached
}

/// The receiving end of this Frontend's control socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale file.
    pub fn bind(sockets_dir: &Path, cluster_id: u32) -> Result<Self, ControlError> {
        let path = control_path(sockets_dir, cluster_id);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::warn!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next command. The stream is returned for the reply.
    pub async fn accept(&self) -> Result<(ControlMessage, UnixStream), ControlError> {
        let (mut stream, _) = self.listener.accept().await?;
        let mut raw = [0u8; CMD_SIZE];
        tokio::time::timeout(REPLY_TIMEOUT, stream.read_exact(&mut raw))
            .await
            .map_err(|_| ControlError::NoReply)??;
        let msg = ControlMessage::decode(&raw)?;
        metrics::counter!("web_control_commands_total", "kind" => msg.cmd.kind_label()).increment(1);
        Ok((msg, stream))
    }
}

/// Answer a synchronous command.
pub async fn reply(stream: &mut UnixStream, status: i32) -> Result<(), ControlError> {
    stream.write_all(&status.to_le_bytes()).await?;
    Ok(())
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_encoding() {
        let msg = ControlMessage::synchronous(ControlCmd::WorkerChld { pid: 4242, status: -9 });
        let raw = msg.encode();
        assert_eq!(raw.len(), CMD_SIZE);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[1], FLAG_SYNC);
        assert_eq!(ControlMessage::decode(&raw).unwrap(), msg);

        let msg = ControlMessage::new(ControlCmd::Shutdown {
            reason: "maintenance".into(),
        });
        assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn long_reason_is_cut_on_char_boundary() {
        let reason = "é".repeat(40);
        let raw = ControlMessage::new(ControlCmd::Shutdown { reason }).encode();
        match ControlMessage::decode(&raw).unwrap().cmd {
            ControlCmd::Shutdown { reason } => assert_eq!(reason.chars().count(), 34),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_kind() {
        let mut raw = [0u8; CMD_SIZE];
        raw[0] = 9;
        assert!(matches!(ControlMessage::decode(&raw), Err(ControlError::UnknownKind(9))));
    }

    #[tokio::test]
    async fn sync_round_trip_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let server = ControlServer::bind(dir.path(), 2).unwrap();
        let responder = tokio::spawn(async move {
            for _ in 0..2 {
                let (msg, mut stream) = server.accept().await.unwrap();
                if msg.sync {
                    reply(&mut stream, 7).await.unwrap();
                }
            }
        });

        let status = send_command(&control_path(dir.path(), 2), &ControlMessage::synchronous(ControlCmd::Noop))
            .await
            .unwrap();
        assert_eq!(status, Some(7));

        // member 1 is ourselves, 3..=4 do not exist
        let msg = ControlMessage::new(ControlCmd::WorkerChld { pid: 1, status: 0 });
        assert_eq!(broadcast(dir.path(), 1, 4, &msg).await, 1);
        responder.await.unwrap();
    }
}
