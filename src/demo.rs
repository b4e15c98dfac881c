//! Bundled demo application.
//!
//! Authenticates against `[auth.users]` and registers a handful of commands
//! that exercise every dispatch path: a pre-auth check, a public command,
//! session-gated commands, push events and a chunk-relayed body.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::http::response::escape_html;
use crate::module::{Application, Command, CommandContext, CommandError, Module, SessionOps};
use crate::query::Query;
use crate::session::Session;

/// Largest body `stream` will produce.
const MAX_STREAM_SIZE: u32 = 16 * 1024 * 1024;

/// Build the demo application for `config`.
pub fn application(config: &ServerConfig) -> Arc<Application> {
    Application::new(Box::new(DemoSessionOps {
        users: config.auth.users.clone(),
    }))
    .with_module(Box::new(DemoModule))
    .into_shared()
}

/// Password check against the configured user table.
pub struct DemoSessionOps {
    users: BTreeMap<String, String>,
}

impl SessionOps for DemoSessionOps {
    fn auth(&self, _session: &mut Session, user: &str, pass: &str) -> Result<(), String> {
        match self.users.get(user) {
            Some(expected) if expected == pass => Ok(()),
            _ => Err("Invalid user name or password".to_string()),
        }
    }

    fn login_page(&self, q: &mut Query, error: Option<&str>) {
        q.set_content_type("text/html; charset=utf-8");
        let mut page = String::from("<!DOCTYPE html>\n<html><head><title>Log in</title></head><body>\n");
        if let Some(error) = error {
            let _ = writeln!(page, "<p class=\"error\">{}</p>", escape_html(error));
        }
        page.push_str(
            "<form method=\"post\" action=\"/login\">\n\
<input name=\"username\" placeholder=\"User\">\n\
<input name=\"password\" type=\"password\" placeholder=\"Password\">\n\
<button>Log in</button>\n</form>\n</body></html>\n",
        );
        q.write(page.as_bytes());
    }

    fn pre_auth_commands(&self) -> &[Command] {
        const CMDS: &[Command] = &[Command::new("status", "", status)];
        CMDS
    }

    fn logout(&self, session: &Session) {
        tracing::info!(session_id = %session.id, user = %session.user, queries = session.queries, "User logged out");
    }
}

pub struct DemoModule;

impl Module for DemoModule {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn commands(&self) -> &[Command] {
        const CMDS: &[Command] = &[
            Command::new("index", "", index),
            Command::new("counter", "", counter),
            Command::new("version", "P", version),
            Command::new("stream", "", stream),
            Command::new("notify", "", notify),
        ];
        CMDS
    }

    fn session_open(&self, session: &mut Session) {
        let created = session.created.to_string();
        session.vars.entry("first_login".to_string()).or_insert(created);
    }
}

fn status(_ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    q.set_content_type("text/plain");
    q.write(b"ok\n");
    Ok(())
}

fn version(_ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    q.set_content_type("text/plain");
    q.write(concat!("appserver ", env!("CARGO_PKG_VERSION"), "\n").as_bytes());
    Ok(())
}

fn index(ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    let session = ctx.require_session()?;
    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>Welcome</title></head><body>\n\
<p>Welcome, {}.</p>\n<ul><li><a href=\"/counter\">counter</a></li>\
<li><a href=\"/logout\">log out</a></li></ul>\n</body></html>\n",
        escape_html(&session.user)
    );
    q.write(page.as_bytes());
    Ok(())
}

/// Reports the serving process and how many queries this session made.
fn counter(ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    let pid = ctx.worker_pid().unwrap_or_else(std::process::id);
    let queries = ctx.require_session()?.queries;
    if q.wants_json() {
        q.set_content_type("application/json");
        q.write(serde_json::json!({ "pid": pid, "queries": queries }).to_string().as_bytes());
    } else {
        q.set_content_type("text/plain");
        q.write(format!("pid={} queries={}\n", pid, queries).as_bytes());
    }
    Ok(())
}

fn stream(_ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    let size = match q.find_arg("size") {
        Some(_) => q.get_uint("size")?.min(MAX_STREAM_SIZE),
        None => 256 * 1024,
    } as usize;
    q.set_content_type("text/plain");
    let mut line = 0usize;
    let mut written = 0usize;
    while written < size {
        let text = format!("line {:08}\n", line);
        let take = text.len().min(size - written);
        q.write(&text.as_bytes()[..take]);
        written += take;
        line += 1;
    }
    Ok(())
}

/// Push `msg` to every event listener of the caller's session.
fn notify(ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
    let message = q.get("msg")?.to_string();
    if message.starts_with('\0') {
        return Err(CommandError::Invalid("Events may not start with a NUL byte"));
    }
    let session_id = ctx
        .session()
        .map(|s| s.id.clone())
        .ok_or(CommandError::Forbidden)?;
    ctx.post_event(&session_id, message);
    q.set_content_type("text/plain");
    q.write(b"sent\n");
    Ok(())
}
