//! `text/event-stream` relay held open by the Frontend.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::{kill_listener, listener_path, read_frame, EventError, KILL_PAYLOAD, LOGGED_OUT_PAYLOAD};
use crate::lifecycle::StopNotice;
use crate::session::{Session, SessionStore};

const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for one event-stream connection.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub events_dir: PathBuf,
    pub ping_interval: Duration,
    pub max_event_size: usize,
    pub server_name: String,
}

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    ClientGone,
    /// A newer connection took over the socket name.
    Replaced,
    LoggedOut,
    Shutdown,
}

enum Incoming {
    Event(Vec<u8>),
    Kill(UnixStream),
    LoggedOut,
}

/// Read the single frame a poster sends on its connection.
async fn read_incoming(mut stream: UnixStream, max: usize) -> Result<Incoming, EventError> {
    let data = tokio::time::timeout(FRAME_READ_TIMEOUT, read_frame(&mut stream, max))
        .await
        .map_err(|_| EventError::NoReply)??;
    Ok(match data.as_slice() {
        KILL_PAYLOAD => Incoming::Kill(stream),
        LOGGED_OUT_PAYLOAD => Incoming::LoggedOut,
        _ => Incoming::Event(data),
    })
}

/// Format one server-sent event.
pub(crate) fn format_event(name: Option<&str>, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if let Some(name) = name {
        out.extend_from_slice(format!("event: {}\n", name).as_bytes());
    }
    let text = String::from_utf8_lossy(data);
    for line in text.split('\n') {
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line.trim_end_matches('\r').as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out
}

/// Stream events for `session` to the client until a terminal condition.
///
/// A stale listener holding the same name is asked to step aside first.
/// The socket path is unlinked on exit unless this listener was replaced.
pub async fn run_event_listener<R, W>(
    settings: &ListenerSettings,
    store: &SessionStore,
    session: &Session,
    lang: &str,
    client_rd: &mut R,
    client_wr: &mut W,
    mut stop: StopNotice,
) -> Result<ListenerExit, EventError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let path = listener_path(&settings.events_dir, &session.id, &session.user, lang)?;
    if let Some(status) = kill_listener(&path).await? {
        tracing::info!(target: "appserver::event", session_id = %session.id, status, "Replaced stale listener");
    }
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(&path)?;
    tracing::info!(target: "appserver::event", session_id = %session.id, path = %path.display(), "Event listener started");

    let head = format!(
        "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\nConnection: close\r\n\r\n: connected\n\n",
        settings.server_name
    );
    client_wr.write_all(head.as_bytes()).await?;
    client_wr.flush().await?;

    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.tick().await;
    let mut scratch = [0u8; 512];
    // frames are read off the select loop so a tick never drops half of one
    let (frames_tx, mut frames) = mpsc::channel(16);

    let exit = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let tx = frames_tx.clone();
                    let max = settings.max_event_size;
                    tokio::spawn(async move {
                        let _ = tx.send(read_incoming(stream, max).await).await;
                    });
                }
                Err(e) => {
                    tracing::debug!(target: "appserver::event", error = %e, "Event accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(incoming) = frames.recv() => match incoming {
                Ok(Incoming::Event(data)) => {
                    client_wr.write_all(&format_event(None, &data)).await?;
                    client_wr.flush().await?;
                }
                Ok(Incoming::Kill(mut stream)) => {
                    let _ = stream.write_all(&0i32.to_le_bytes()).await;
                    break ListenerExit::Replaced;
                }
                Ok(Incoming::LoggedOut) => break ListenerExit::LoggedOut,
                Err(e) => {
                    tracing::debug!(target: "appserver::event", error = %e, "Rejected event frame");
                }
            },
            read = client_rd.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break ListenerExit::ClientGone,
                Ok(_) => {}
            },
            _ = stop.stopped() => break ListenerExit::Shutdown,
            _ = ping.tick() => {
                if !store.valid_session_id(&session.id) {
                    break ListenerExit::LoggedOut;
                }
                client_wr.write_all(b": ping\n\n").await?;
                client_wr.flush().await?;
            }
        }
    };

    if exit != ListenerExit::Replaced {
        let _ = std::fs::remove_file(&path);
    }
    if matches!(exit, ListenerExit::LoggedOut | ListenerExit::Shutdown) {
        let _ = client_wr.write_all(&format_event(Some("logged-out"), b"")).await;
        let _ = client_wr.flush().await;
    }
    tracing::info!(target: "appserver::event", session_id = %session.id, reason = ?exit, "Event listener stopped");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{post_event, write_frame};
    use crate::lifecycle::{Shutdown, StopReason};

    #[test]
    fn event_format() {
        assert_eq!(format_event(None, b"a\nb"), b"data: a\ndata: b\n\n");
        assert_eq!(format_event(Some("logged-out"), b""), b"event: logged-out\ndata: \n\n");
    }

    fn setup() -> (tempfile::TempDir, ListenerSettings, SessionStore, Session) {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join("events");
        let sessions = dir.path().join("sessions");
        std::fs::create_dir_all(&events).unwrap();
        std::fs::create_dir_all(&sessions).unwrap();
        let store = SessionStore::new(&sessions);
        let mut session = Session::new("alice", "pw", "en");
        store.create(&mut session).unwrap();
        let settings = ListenerSettings {
            events_dir: events,
            ping_interval: Duration::from_secs(60),
            max_event_size: 1024,
            server_name: "test".into(),
        };
        (dir, settings, store, session)
    }

    #[tokio::test]
    async fn relays_events_until_logout() {
        let (_dir, settings, store, session) = setup();
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut srv_rd, mut srv_wr) = tokio::io::split(server);
        let shutdown = Shutdown::new();

        let events_dir = settings.events_dir.clone();
        let id = session.id.clone();
        let poster = tokio::spawn(async move {
            // wait for the socket to appear
            let path = events_dir.join(format!("{}:alice:en", id));
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(post_event(&events_dir, &id, b"hello").await.unwrap(), 1);
            // each connection is read on its own; let the event land first
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(crate::events::post_logged_out(&events_dir, &id).await.unwrap(), 1);
        });

        let exit = run_event_listener(&settings, &store, &session, "en", &mut srv_rd, &mut srv_wr, shutdown.subscribe())
            .await
            .unwrap();
        poster.await.unwrap();
        assert_eq!(exit, ListenerExit::LoggedOut);
        drop(srv_rd);
        drop(srv_wr);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Type: text/event-stream"));
        assert!(text.contains("data: hello\n\n"));
        assert!(text.ends_with("event: logged-out\ndata: \n\n"));
        assert!(!settings.events_dir.join(format!("{}:alice:en", session.id)).exists());
    }

    #[tokio::test]
    async fn slow_frames_survive_pings() {
        let (_dir, mut settings, store, session) = setup();
        settings.ping_interval = Duration::from_millis(10);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (mut srv_rd, mut srv_wr) = tokio::io::split(server);
        let shutdown = Shutdown::new();

        let path = settings.events_dir.join(format!("{}:alice:en", session.id));
        let poster = tokio::spawn(async move {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let mut s = UnixStream::connect(&path).await.unwrap();
            s.write_all(&5u32.to_le_bytes()).await.unwrap();
            s.flush().await.unwrap();
            // several pings go out before the payload arrives
            tokio::time::sleep(Duration::from_millis(100)).await;
            s.write_all(b"hello").await.unwrap();
            s.flush().await.unwrap();
            drop(s);

            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut s = UnixStream::connect(&path).await.unwrap();
            write_frame(&mut s, LOGGED_OUT_PAYLOAD).await.unwrap();
        });

        let exit = run_event_listener(&settings, &store, &session, "en", &mut srv_rd, &mut srv_wr, shutdown.subscribe())
            .await
            .unwrap();
        poster.await.unwrap();
        assert_eq!(exit, ListenerExit::LoggedOut);
        drop(srv_rd);
        drop(srv_wr);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(": ping\n\n"));
        assert!(text.contains("data: hello\n\n"));
    }

    #[tokio::test]
    async fn stops_with_the_frontend() {
        let (_dir, settings, store, session) = setup();
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut srv_rd, mut srv_wr) = tokio::io::split(server);
        let shutdown = Shutdown::new();
        shutdown.trigger(StopReason::Control("test".into()));

        let exit = run_event_listener(&settings, &store, &session, "en", &mut srv_rd, &mut srv_wr, shutdown.subscribe())
            .await
            .unwrap();
        assert_eq!(exit, ListenerExit::Shutdown);
        drop(srv_rd);
        drop(srv_wr);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("event: logged-out\ndata: \n\n"));
    }
}
