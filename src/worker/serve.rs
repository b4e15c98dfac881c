//! Worker entry point and serve loop.
//!
//! # Responsibilities
//! - Read the bootstrap, authenticate and create or resume the session
//! - Bind the private socket and answer on the spawn pipe
//! - Accept Frontend connections (PID handshake) and execute their queries
//! - Exit on logout, idle timeout or a termination signal
//!
//! # Design Decisions
//! - Per-connection tasks only decode frames; execution and replies happen
//!   in the serve loop so the session is never touched concurrently

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::spawn::{Bootstrap, SpawnReply, SpawnRequest};
use super::{socket_path, WorkerError};
use crate::codec::load_query;
use crate::config::ServerConfig;
use crate::events;
use crate::http::response::{render_response, write_error, ResponseOptions};
use crate::lifecycle::signals;
use crate::module::{Application, CommandContext, CommandError, PendingEvent};
use crate::query::Query;
use crate::session::{clear_session_cookie, set_session_cookie, Session, SessionError, SessionStore};

/// Operation that creates a session.
pub const OP_LOGIN: &str = "login";
/// Operation that ends a session.
pub const OP_LOGOUT: &str = "logout";

/// Everything a Worker owns while serving.
pub struct WorkerState {
    pub config: Arc<ServerConfig>,
    pub app: Arc<Application>,
    pub store: SessionStore,
    pub session: Session,
    opts: ResponseOptions,
}

/// Result of one executed query.
#[derive(Debug)]
pub struct Executed {
    /// Complete HTTP response, ready to relay.
    pub response: Vec<u8>,
    /// The session ended; the Worker must exit after replying.
    pub logout: bool,
    pub events: Vec<PendingEvent>,
}

impl WorkerState {
    pub fn new(config: Arc<ServerConfig>, app: Arc<Application>, session: Session) -> Self {
        let store = SessionStore::new(&config.paths.sessions);
        let opts = ResponseOptions::worker(&config);
        Self {
            config,
            app,
            store,
            session,
            opts,
        }
    }

    fn run_command(&mut self, op: &str, q: &mut Query, events: &mut Vec<PendingEvent>) -> Result<(), CommandError> {
        let app = Arc::clone(&self.app);
        let (_, cmd) = app
            .lookup(op)
            .ok_or_else(|| CommandError::NotFound(op.to_string()))?;
        let mut ctx = CommandContext::for_worker(&self.config, &mut self.session);
        let result = (cmd.handler)(&mut ctx, q);
        events.extend(ctx.take_events());
        result
    }
}

/// Execute one query against the Worker's session.
pub fn exec_worker_query(state: &mut WorkerState, mut q: Query) -> Executed {
    let op = q
        .op()
        .unwrap_or(state.config.http.default_op.as_str())
        .to_string();
    state.session.touch();
    tracing::info!(
        target: "appserver::query",
        session_id = %state.session.id,
        method = %q.method,
        op = %op,
        ip = %q.user_ip,
        "Query"
    );

    let mut events = Vec::new();
    let mut logout = false;
    let outcome = match op.as_str() {
        OP_LOGOUT => {
            logout = true;
            state.app.sops().logout(&state.session);
            Ok(())
        }
        OP_LOGIN => {
            let landing = state.config.http.default_op.clone();
            if state.app.lookup(&landing).is_some() {
                state.run_command(&landing, &mut q, &mut events)
            } else {
                q.write(b"Logged in\n");
                Ok(())
            }
        }
        _ => state.run_command(&op, &mut q, &mut events),
    };

    if logout {
        q.clear_body();
        state.app.sops().login_page(&mut q, None);
        if let Err(e) = clear_session_cookie(&mut q, &state.config.http) {
            tracing::warn!(target: "appserver::worker", error = %e, "Could not clear session cookie");
        }
        q.set_header("Connection", "close");
        match state.store.remove(&state.session.id) {
            Ok(()) | Err(SessionError::NotFound) => {}
            Err(e) => tracing::warn!(target: "appserver::worker", error = %e, "Could not remove session"),
        }
    } else {
        if let Err(e) = outcome {
            tracing::debug!(target: "appserver::query", op = %op, error = %e, "Command failed");
            let json = q.wants_json();
            write_error(&mut q, e.status(), &e.to_string(), json);
        }
        if let Err(e) = set_session_cookie(&mut q, &state.session.id, &state.config.http) {
            tracing::warn!(target: "appserver::worker", error = %e, "Could not refresh session cookie");
        }
        if let Err(e) = state.store.save(&state.session) {
            tracing::warn!(target: "appserver::worker", session_id = %state.session.id, error = %e, "Could not save session");
        }
    }

    let response = render_response(&mut q, &state.opts).unwrap_or_else(|e| {
        tracing::error!(target: "appserver::query", error = %e, "Response rendering failed");
        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_vec()
    });
    Executed {
        response,
        logout,
        events,
    }
}

async fn send_reply<W: AsyncWrite + Unpin>(out: &mut W, reply: SpawnReply) -> std::io::Result<()> {
    out.write_all(&reply.encode()).await?;
    out.flush().await
}

/// Authenticate and obtain the session named by `request`.
fn establish(app: &Application, config: &ServerConfig, request: SpawnRequest) -> Result<Session, WorkerError> {
    let store = SessionStore::new(&config.paths.sessions);
    match request {
        SpawnRequest::Login { user, pass, lang } => {
            let mut session = Session::new(&user, &pass, &lang);
            app.sops().auth(&mut session, &user, &pass).map_err(WorkerError::Auth)?;
            store.create(&mut session)?;
            Ok(session)
        }
        SpawnRequest::Resume { session_id, user, pass } => {
            if !store.valid_session_id(&session_id) {
                return Err(SessionError::NotFound.into());
            }
            let mut session = store.load(&session_id)?;
            app.sops().auth(&mut session, &user, &pass).map_err(WorkerError::Auth)?;
            Ok(session)
        }
    }
}

/// Bind the session socket. A path that still accepts connections belongs
/// to a live Worker and is left alone; only a refusing path is replaced.
async fn bind_socket(path: &Path) -> Result<UnixListener, WorkerError> {
    match UnixStream::connect(path).await {
        Ok(_) => return Err(WorkerError::Busy),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(target: "appserver::worker", path = %path.display(), "Replaced stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}

/// Point stdin and stdout at `/dev/null` once the spawn reply is out.
/// stderr stays inherited for logging.
fn detach_stdio() -> std::io::Result<()> {
    let null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO] {
        // SAFETY: dup2(2) onto a standard descriptor; `null` is open for the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Worker process main: bootstrap from stdin, reply on stdout, serve.
///
/// `build` creates the application once the configuration has arrived.
pub async fn run_worker<F>(build: F) -> Result<(), WorkerError>
where
    F: FnOnce(&ServerConfig) -> Arc<Application>,
{
    let mut stdout = tokio::io::stdout();
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;

    let bootstrap: Bootstrap = match serde_json::from_slice(&input) {
        Ok(b) => b,
        Err(e) => {
            send_reply(&mut stdout, SpawnReply::Fail).await?;
            return Err(WorkerError::Spawn(format!("invalid bootstrap: {}", e)));
        }
    };
    let config = Arc::new(bootstrap.config);
    crate::observability::logging::init(&config.observability.log_level);
    let app = build(&config);
    let fresh = matches!(bootstrap.request, SpawnRequest::Login { .. });

    let mut session = match establish(&app, &config, bootstrap.request) {
        Ok(session) => session,
        Err(e) => {
            let reply = match e {
                WorkerError::Auth(_) => SpawnReply::Auth,
                _ => SpawnReply::Fail,
            };
            send_reply(&mut stdout, reply).await?;
            return Err(e);
        }
    };
    for module in app.modules() {
        module.session_open(&mut session);
    }

    let path = socket_path(&config.paths.sockets, &session.id);
    let listener = match bind_socket(&path).await {
        Ok(listener) => listener,
        Err(e) => {
            if fresh {
                let _ = SessionStore::new(&config.paths.sessions).remove(&session.id);
            }
            send_reply(&mut stdout, SpawnReply::Fail).await?;
            return Err(e);
        }
    };
    send_reply(&mut stdout, SpawnReply::Session(session.id.clone())).await?;
    drop(stdout);
    if let Err(e) = detach_stdio() {
        tracing::warn!(target: "appserver::worker", error = %e, "Could not detach stdio");
    }
    tracing::info!(
        target: "appserver::worker",
        session_id = %session.id,
        pid = std::process::id(),
        user = %session.user,
        resumed = !fresh,
        "Worker serving"
    );

    let mut state = WorkerState::new(config, app, session);
    let result = serve(&mut state, &listener).await;
    let _ = std::fs::remove_file(&path);
    tracing::info!(target: "appserver::worker", session_id = %state.session.id, "Worker exiting");
    result
}

enum ConnEvent {
    Query(u64, Query),
    Closed(u64),
}

async fn read_queries(id: u64, mut rd: OwnedReadHalf, tx: mpsc::Sender<ConnEvent>) {
    loop {
        match load_query(&mut rd).await {
            Ok(q) => {
                if tx.send(ConnEvent::Query(id, q)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                if !e.is_eof() {
                    tracing::warn!(target: "appserver::worker", connection = id, error = %e, "Dropping frontend connection");
                }
                let _ = tx.send(ConnEvent::Closed(id)).await;
                return;
            }
        }
    }
}

async fn serve(state: &mut WorkerState, listener: &UnixListener) -> Result<(), WorkerError> {
    let (tx, mut rx) = mpsc::channel::<ConnEvent>(16);
    let mut writers: HashMap<u64, OwnedWriteHalf> = HashMap::new();
    let mut next_id = 0u64;

    let idle_limit = Duration::from_secs(state.config.worker.timeout_secs);
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);
    let signal = signals::wait_for_termination();
    tokio::pin!(signal);
    let mut signals_armed = true;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, _) = accepted?;
                if let Err(e) = stream.write_all(&std::process::id().to_le_bytes()).await {
                    tracing::warn!(target: "appserver::worker", error = %e, "PID handshake failed");
                    continue;
                }
                next_id += 1;
                let (rd, wr) = stream.into_split();
                writers.insert(next_id, wr);
                tokio::spawn(read_queries(next_id, rd, tx.clone()));
                tracing::debug!(target: "appserver::worker", connection = next_id, "Frontend connected");
            }
            Some(event) = rx.recv() => match event {
                ConnEvent::Closed(id) => {
                    writers.remove(&id);
                }
                ConnEvent::Query(id, q) => {
                    idle.as_mut().reset(Instant::now() + idle_limit);
                    let executed = exec_worker_query(state, q);

                    if let Some(w) = writers.get_mut(&id) {
                        if let Err(e) = w.write_all(&executed.response).await {
                            tracing::warn!(target: "appserver::worker", connection = id, error = %e, "Reply failed");
                            writers.remove(&id);
                        }
                    }
                    for ev in executed.events {
                        match events::post_event(&state.config.paths.events, &ev.session_id, &ev.data).await {
                            Ok(n) if ev.session_id == state.session.id => state.session.events += n as u64,
                            Ok(_) => {}
                            Err(e) => tracing::debug!(target: "appserver::event", error = %e, "Event not posted"),
                        }
                    }
                    if executed.logout {
                        if let Err(e) = events::post_logged_out(&state.config.paths.events, &state.session.id).await {
                            tracing::debug!(target: "appserver::event", error = %e, "Logout notice not posted");
                        }
                        tracing::info!(target: "appserver::worker", session_id = %state.session.id, "Logged out");
                        return Ok(());
                    }
                }
            },
            _ = &mut idle => {
                tracing::info!(target: "appserver::worker", session_id = %state.session.id, "Idle timeout");
                return Ok(());
            }
            sig = &mut signal, if signals_armed => match sig {
                Ok(t) => {
                    tracing::info!(target: "appserver::worker", signal = ?t, "Terminating on signal");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(target: "appserver::worker", error = %e, "Signal handling unavailable");
                    signals_armed = false;
                }
            },
        }
    }
}
