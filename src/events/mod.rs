//! Push events.
//!
//! # Data Flow
//! ```text
//! Worker / `appserver post`
//!     → post_event: connect <events>/<sessID>:* , write frame
//!     → listener.rs (in the Frontend): frame → `text/event-stream` client
//! ```
//!
//! # Design Decisions
//! - One Unix socket per listening client, named `<sessID>:<user>:<lang>`
//! - Frames are a u32 little-endian length followed by the payload
//! - Reserved payloads start with a NUL byte, which text events never do

mod listener;

pub use listener::{run_event_listener, ListenerExit, ListenerSettings};

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Asks a listener to step aside for a newer connection.
pub const KILL_PAYLOAD: &[u8] = b"\0kill";

/// Tells listeners their session has ended.
pub const LOGGED_OUT_PAYLOAD: &[u8] = b"\0logged-out";

const KILL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for push-event operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("Invalid listener name")]
    InvalidName,
    #[error("Events may not start with a NUL byte")]
    Reserved,
    #[error("Listener did not answer")]
    NoReply,
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    #[error("Event I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_name_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.len() <= 64
        && !s.bytes().any(|b| b == b'/' || b == b':' || b.is_ascii_control())
}

/// Socket name for a listener of `session_id` as `user` in `lang`.
pub fn listener_name(session_id: &str, user: &str, lang: &str) -> Result<String, EventError> {
    if !crate::session::SessionStore::is_valid_shape(session_id)
        || !is_name_component(user)
        || !is_name_component(lang)
    {
        return Err(EventError::InvalidName);
    }
    Ok(format!("{}:{}:{}", session_id, user, lang))
}

pub fn listener_path(events_dir: &Path, session_id: &str, user: &str, lang: &str) -> Result<PathBuf, EventError> {
    Ok(events_dir.join(listener_name(session_id, user, lang)?))
}

pub(crate) async fn write_frame<W>(w: &mut W, data: &[u8]) -> Result<(), EventError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| EventError::TooLarge(data.len()))?;
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(data);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(r: &mut R, max: usize) -> Result<Vec<u8>, EventError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    if len > max {
        return Err(EventError::TooLarge(len));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(data)
}

/// Deliver `data` to every listener of `session_id`.
///
/// Returns the number of listeners reached. Stale sockets are unlinked.
/// Payloads starting with NUL are reserved for listener control.
pub async fn post_event(events_dir: &Path, session_id: &str, data: &[u8]) -> Result<usize, EventError> {
    if data.first() == Some(&0) {
        return Err(EventError::Reserved);
    }
    deliver(events_dir, session_id, data).await
}

/// Tell every listener of `session_id` that the session has ended.
pub async fn post_logged_out(events_dir: &Path, session_id: &str) -> Result<usize, EventError> {
    deliver(events_dir, session_id, LOGGED_OUT_PAYLOAD).await
}

async fn deliver(events_dir: &Path, session_id: &str, data: &[u8]) -> Result<usize, EventError> {
    if !crate::session::SessionStore::is_valid_shape(session_id) {
        return Err(EventError::InvalidName);
    }
    let prefix = format!("{}:", session_id);
    let mut delivered = 0;

    let mut entries = tokio::fs::read_dir(events_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        match UnixStream::connect(&path).await {
            Ok(mut stream) => match write_frame(&mut stream, data).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(target: "appserver::event", listener = %name, error = %e, "Event delivery failed")
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!(target: "appserver::event", listener = %name, "Removing stale listener socket");
                let _ = tokio::fs::remove_file(&path).await;
            }
            Err(e) => {
                tracing::debug!(target: "appserver::event", listener = %name, error = %e, "Listener unreachable")
            }
        }
    }

    if delivered > 0 {
        metrics::counter!("web_events_posted_total").increment(delivered as u64);
    }
    Ok(delivered)
}

/// Ask the listener bound at `path` to exit.
///
/// Returns its status reply, or `None` if nothing was listening.
pub async fn kill_listener(path: &Path) -> Result<Option<i32>, EventError> {
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            let _ = tokio::fs::remove_file(path).await;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    write_frame(&mut stream, KILL_PAYLOAD).await?;

    let mut reply = [0u8; 4];
    match tokio::time::timeout(KILL_REPLY_TIMEOUT, stream.read_exact(&mut reply)).await {
        Ok(Ok(_)) => Ok(Some(i32::from_le_bytes(reply))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EventError::NoReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn names_are_validated() {
        assert_eq!(listener_name("12", "alice", "en").unwrap(), "12:alice:en");
        assert!(listener_name("1/2", "alice", "en").is_err());
        assert!(listener_name("12", "../x", "en").is_err());
        assert!(listener_name("12", "a:b", "en").is_err());
        assert!(listener_name("12", "alice", "").is_err());
    }

    #[tokio::test]
    async fn frames_are_bounded() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut r: &[u8] = &buf;
        assert_eq!(read_frame(&mut r, 16).await.unwrap(), b"hello");
        let mut r: &[u8] = &buf;
        assert!(matches!(read_frame(&mut r, 4).await, Err(EventError::TooLarge(5))));
    }

    #[tokio::test]
    async fn post_reaches_only_matching_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mine = UnixListener::bind(dir.path().join("7:alice:en")).unwrap();
        let _other = UnixListener::bind(dir.path().join("70:bob:en")).unwrap();

        let reader = tokio::spawn(async move {
            let (mut s, _) = mine.accept().await.unwrap();
            read_frame(&mut s, 1024).await.unwrap()
        });
        let n = post_event(dir.path(), "7", b"ping").await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(reader.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn reserved_payloads_stay_internal() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("7:alice:en")).unwrap();
        for data in [KILL_PAYLOAD, LOGGED_OUT_PAYLOAD, b"\0anything".as_slice()] {
            assert!(matches!(
                post_event(dir.path(), "7", data).await,
                Err(EventError::Reserved)
            ));
        }

        let reader = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            read_frame(&mut s, 1024).await.unwrap()
        });
        assert_eq!(post_logged_out(dir.path(), "7").await.unwrap(), 1);
        assert_eq!(reader.await.unwrap(), LOGGED_OUT_PAYLOAD);
    }

    #[tokio::test]
    async fn kill_missing_listener() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(kill_listener(&dir.path().join("1:a:en")).await.unwrap(), None);
    }
}
