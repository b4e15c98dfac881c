//! One client connection.
//!
//! # Data Flow
//! ```text
//! read_head → parse_request → read_body → dispatch
//!     OPTIONS            → local 200 with Allow
//!     `events`           → event listener (connection ends with it)
//!     pre-auth / public  → command runs in the Frontend
//!     valid `sess`       → forward to the session's Worker
//!     username+password  → spawn Worker, then forward
//!     otherwise          → login page
//! ```
//!
//! # Design Decisions
//! - Failures before any byte reached the client become an error page;
//!   failures after that are logged and the connection is closed
//! - A pooled Worker connection that turns out dead is replaced once

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Instrument;

use super::restore::connect_or_respawn;
use super::sockets::SessionSocket;
use super::ServerContext;
use crate::codec::save_query;
use crate::events::{self, run_event_listener, ListenerSettings};
use crate::http::relay::{read_worker_head, relay_chunked, relay_content_length};
use crate::http::{error_query, flush_query, parse_request, read_body, read_head, write_error, Framing, HttpError, RelayError, WorkerHead};
use crate::module::{Command, CommandContext};
use crate::net::ClientSlot;
use crate::observability::metrics::record_request;
use crate::observability::tracing::request_span;
use crate::query::{Method, Query};
use crate::session::{clear_session_cookie, SESSION_COOKIE};
use crate::worker::{SpawnRequest, WorkerError};

/// Operation that turns the connection into an event stream.
pub const EVENTS_OP: &str = "events";

const UNAVAILABLE: &str = "The application is unavailable, contact the administrator";
const TIMED_OUT: &str = "The application did not respond in time, contact the administrator";
const SESSION_LOST: &str = "Your session could not be restored, please log in again";

/// Outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Served {
    status: u16,
    keep_alive: bool,
}

/// Serve requests on `stream` until the client or the server ends it.
pub async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, slot: ClientSlot) {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = Vec::new();
    let mut stop = ctx.shutdown.subscribe();
    let idle = Duration::from_secs(ctx.config.http.keep_alive_timeout_secs);
    let peer_ip = slot.peer().ip().to_string();

    loop {
        let head = tokio::select! {
            head = tokio::time::timeout(idle, read_head(&mut rd, &mut buf, ctx.config.http.max_header_size)) => head,
            _ = stop.stopped() => break,
        };
        let head = match head {
            Err(_) => {
                tracing::debug!(client = slot.serial(), "Idle connection timed out");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(head))) => head,
            Ok(Err(e)) => {
                send_http_error(&ctx, &mut wr, &e).await;
                break;
            }
        };

        let method = head
            .split(|&b| b == b' ')
            .next()
            .and_then(|m| std::str::from_utf8(m).ok())
            .unwrap_or("-");
        let span = request_span(method, &peer_ip);
        let keep_alive = serve_request(&ctx, &head, &peer_ip, &mut rd, &mut wr, &mut buf)
            .instrument(span)
            .await;
        if !keep_alive {
            break;
        }
    }

    let _ = wr.shutdown().await;
    tracing::debug!(client = slot.serial(), "Connection finished");
}

async fn serve_request<R, W>(
    ctx: &Arc<ServerContext>,
    head: &[u8],
    peer_ip: &str,
    rd: &mut R,
    wr: &mut W,
    buf: &mut Vec<u8>,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut q = match parse_request(head, peer_ip, &ctx.config) {
        Ok(q) => q,
        Err(e) => return send_http_error(ctx, wr, &e).await,
    };
    if let Err(e) = read_body(rd, buf, &mut q, &ctx.config).await {
        return send_http_error(ctx, wr, &e).await;
    }

    let method = q.method;
    let served = dispatch(ctx, q, rd, wr).await;
    record_request(method.as_str(), served.status);
    tracing::debug!(status = served.status, keep_alive = served.keep_alive, "Request served");
    served.keep_alive
}

/// Answer a request that could not be parsed. Returns whether to keep going.
async fn send_http_error<W>(ctx: &ServerContext, wr: &mut W, e: &HttpError) -> bool
where
    W: AsyncWrite + Unpin,
{
    let status = e.status();
    tracing::debug!(status, error = %e, "Rejected request");
    record_request("-", status);
    let keep_alive = !e.must_close() && ctx.config.http.keep_alive;
    let mut q = error_query(Method::Get, status, &e.to_string(), false, keep_alive);
    flush_query(wr, &mut q, &ctx.opts).await.unwrap_or(false)
}

async fn respond<W>(ctx: &ServerContext, wr: &mut W, mut q: Query) -> Served
where
    W: AsyncWrite + Unpin,
{
    match flush_query(wr, &mut q, &ctx.opts).await {
        Ok(keep_alive) => Served {
            status: q.status(),
            keep_alive,
        },
        Err(e) => {
            tracing::debug!(error = %e, "Client write failed");
            Served {
                status: q.status(),
                keep_alive: false,
            }
        }
    }
}

async fn dispatch<R, W>(ctx: &Arc<ServerContext>, mut q: Query, rd: &mut R, wr: &mut W) -> Served
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if q.method == Method::Options {
        q.set_header("Allow", Method::ALLOWED);
        return respond(ctx, wr, q).await;
    }

    let op = q.op().unwrap_or(ctx.config.http.default_op.as_str()).to_string();
    if op == EVENTS_OP {
        return serve_events(ctx, q, rd, wr).await;
    }
    if let Some(cmd) = ctx.app.pre_auth(&op).copied() {
        return run_local(ctx, cmd, q, wr).await;
    }
    if let Some(cmd) = ctx.app.lookup(&op).map(|(_, c)| *c).filter(Command::is_public) {
        return run_local(ctx, cmd, q, wr).await;
    }

    let cookie = q.get_cookie(SESSION_COOKIE).map(|c| c.value.clone());
    if let Some(id) = cookie.as_deref().filter(|id| ctx.store.valid_session_id(id)) {
        let id = id.to_string();
        return forward_or_fail(ctx, q, &id, wr).await;
    }

    let credentials = match (q.get("username"), q.get("password")) {
        (Ok(user), Ok(pass)) => Some((user.to_string(), pass.to_string())),
        _ => None,
    };
    if let Some((user, pass)) = credentials {
        let _ = q.unset("password");
        let request = SpawnRequest::Login {
            user,
            pass,
            lang: q.lang().to_string(),
        };
        return match ctx.spawner.spawn(request).await {
            Ok(handle) => forward_or_fail(ctx, q, &handle.session_id, wr).await,
            Err(e) => fail_request(ctx, q, e, cookie.is_some(), wr).await,
        };
    }

    if cookie.is_some() {
        login_again(ctx, &mut q, SESSION_LOST, true);
    } else {
        ctx.app.sops().login_page(&mut q, None);
    }
    respond(ctx, wr, q).await
}

/// Run a public or pre-auth command inside the Frontend.
async fn run_local<W>(ctx: &ServerContext, cmd: Command, mut q: Query, wr: &mut W) -> Served
where
    W: AsyncWrite + Unpin,
{
    let (result, pending) = {
        let mut cctx = CommandContext::for_frontend(&ctx.config);
        let result = (cmd.handler)(&mut cctx, &mut q);
        (result, cctx.take_events())
    };
    for ev in pending {
        if let Err(e) = events::post_event(&ctx.config.paths.events, &ev.session_id, &ev.data).await {
            tracing::debug!(target: "appserver::event", error = %e, "Event not posted");
        }
    }
    if let Err(e) = result {
        let json = q.wants_json();
        write_error(&mut q, e.status(), &e.to_string(), json);
    }
    respond(ctx, wr, q).await
}

async fn serve_events<R, W>(ctx: &ServerContext, mut q: Query, rd: &mut R, wr: &mut W) -> Served
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let session = q
        .get_cookie(SESSION_COOKIE)
        .map(|c| c.value.clone())
        .filter(|id| ctx.store.valid_session_id(id))
        .and_then(|id| ctx.store.load(&id).ok());
    let Some(session) = session else {
        let json = q.wants_json();
        write_error(&mut q, 401, "Not logged in", json);
        return respond(ctx, wr, q).await;
    };

    let settings = ListenerSettings {
        events_dir: ctx.config.paths.events.clone(),
        ping_interval: Duration::from_secs(ctx.config.events.ping_interval_secs),
        max_event_size: ctx.config.events.max_event_size,
        server_name: ctx.config.http.server_name.clone(),
    };
    let lang = q.lang().to_string();
    match run_event_listener(&settings, &ctx.store, &session, &lang, rd, wr, ctx.shutdown.subscribe()).await {
        Ok(_) => Served {
            status: 200,
            keep_alive: false,
        },
        Err(e) => {
            tracing::warn!(target: "appserver::event", session_id = %session.id, error = %e, "Event listener failed");
            Served {
                status: 500,
                keep_alive: false,
            }
        }
    }
}

async fn forward_or_fail<W>(ctx: &Arc<ServerContext>, q: Query, session_id: &str, wr: &mut W) -> Served
where
    W: AsyncWrite + Unpin,
{
    match forward(ctx, &q, session_id, wr).await {
        Ok(served) => served,
        Err(e) => fail_request(ctx, q, e, true, wr).await,
    }
}

/// Render a Worker failure that happened before anything was sent.
async fn fail_request<W>(ctx: &ServerContext, mut q: Query, e: WorkerError, had_cookie: bool, wr: &mut W) -> Served
where
    W: AsyncWrite + Unpin,
{
    tracing::warn!(target: "appserver::worker", error = %e, "Request could not be forwarded");
    let json = q.wants_json();
    q.clear_body();
    match &e {
        WorkerError::Auth(msg) => login_again(ctx, &mut q, msg, had_cookie),
        WorkerError::RestoreFailed | WorkerError::Session(_) => login_again(ctx, &mut q, SESSION_LOST, had_cookie),
        WorkerError::Timeout => write_error(&mut q, 504, TIMED_OUT, json),
        _ => write_error(&mut q, 502, UNAVAILABLE, json),
    }
    respond(ctx, wr, q).await
}

fn login_again(ctx: &ServerContext, q: &mut Query, message: &str, had_cookie: bool) {
    ctx.app.sops().login_page(q, Some(message));
    q.set_status(401);
    if had_cookie {
        let _ = clear_session_cookie(q, &ctx.config.http);
    }
}

fn relay_to_worker_error(e: RelayError) -> WorkerError {
    match e {
        RelayError::Timeout => WorkerError::Timeout,
        RelayError::Closed => WorkerError::Unreachable,
        RelayError::Malformed(what) => WorkerError::BadResponse(what),
        RelayError::Io(e) => WorkerError::Io(e),
    }
}

/// Send `q` on `sock` and wait for the response header.
async fn exchange(ctx: &ServerContext, sock: &mut SessionSocket, q: &Query) -> Result<WorkerHead, WorkerError> {
    save_query(&mut sock.stream, q).await?;
    let timeout = Duration::from_secs(ctx.config.worker.response_timeout_secs);
    read_worker_head(&mut sock.stream, &mut sock.buf, ctx.config.http.max_header_size, timeout)
        .await
        .map_err(relay_to_worker_error)
}

/// Forward `q` to the Worker of `session_id` and relay its response.
///
/// `Err` means nothing was written to the client.
async fn forward<W>(ctx: &Arc<ServerContext>, q: &Query, session_id: &str, wr: &mut W) -> Result<Served, WorkerError>
where
    W: AsyncWrite + Unpin,
{
    let attempts = ctx.config.worker.restore_attempts;
    let mut sock = match ctx.pool.checkout(session_id) {
        Some(sock) => sock,
        None => connect_or_respawn(ctx.as_ref(), session_id, attempts).await?,
    };

    let head = loop {
        match exchange(ctx, &mut sock, q).await {
            Ok(head) => break head,
            Err(e) if sock.reused && e.is_unreachable() => {
                tracing::debug!(target: "appserver::worker", session_id = %session_id, "Pooled worker connection is dead");
                sock = connect_or_respawn(ctx.as_ref(), session_id, attempts).await?;
            }
            Err(e) => return Err(e),
        }
    };
    tracing::debug!(
        target: "appserver::worker",
        pid = sock.worker_pid,
        own_child = sock.worker_is_my_child,
        status = head.status,
        "Worker responded"
    );

    let status = head.status;
    let cut = Served {
        status,
        keep_alive: false,
    };
    if let Err(e) = wr.write_all(&head.raw).await {
        tracing::debug!(error = %e, "Client went away");
        return Ok(cut);
    }
    let body = match head.framing {
        _ if q.method == Method::Head => Ok(()),
        Framing::Chunked => relay_chunked(&mut sock.stream, &mut sock.buf, wr).await.map(|_| ()),
        Framing::Length(len) => relay_content_length(&mut sock.stream, &mut sock.buf, wr, len).await,
    };
    if let Err(e) = body {
        tracing::warn!(target: "appserver::worker", session_id = %session_id, error = %e, "Relay failed after headers were sent");
        return Ok(cut);
    }
    if wr.flush().await.is_err() {
        return Ok(cut);
    }

    if head.close {
        ctx.pool.purge_session(session_id);
    } else {
        ctx.pool.checkin(sock);
    }
    Ok(Served {
        status,
        keep_alive: !head.close && q.keep_alive(),
    })
}
