//! Pluggable business logic.
//!
//! # Responsibilities
//! - Define the command table a module registers
//! - Define the session operations (authentication, login page)
//! - Resolve operation names to commands
//!
//! # Design Decisions
//! - Commands are plain functions; they run synchronously inside a Worker
//!   (or inside the Frontend for public and pre-auth commands)
//! - The `'P'` flag marks a command public: no session required
//! - Side effects that need I/O (push events) are queued on the context and
//!   performed by the caller after the command returns

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::query::{Query, QueryError};
use crate::session::{Session, SessionError};

/// Flag character marking a command public.
pub const FLAG_PUBLIC: char = 'P';

/// Error returned by a command handler.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Permission denied")]
    Forbidden,
    #[error("No such operation: {0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(&'static str),
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> u16 {
        match self {
            CommandError::Query(_) | CommandError::Invalid(_) => 400,
            CommandError::Forbidden => 403,
            CommandError::NotFound(_) => 404,
            CommandError::Session(_) | CommandError::Failed(_) => 500,
        }
    }
}

pub type CommandFn = fn(&mut CommandContext<'_>, &mut Query) -> Result<(), CommandError>;

/// One entry of a module's command table.
#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub flags: &'static str,
    pub handler: CommandFn,
}

impl Command {
    pub const fn new(name: &'static str, flags: &'static str, handler: CommandFn) -> Self {
        Self {
            name,
            flags,
            handler,
        }
    }

    pub fn is_public(&self) -> bool {
        self.flags.contains(FLAG_PUBLIC)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A push event queued by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub session_id: String,
    pub data: Vec<u8>,
}

/// State handed to a command handler.
pub struct CommandContext<'a> {
    pub config: &'a ServerConfig,
    session: Option<&'a mut Session>,
    worker_pid: Option<u32>,
    events: Vec<PendingEvent>,
}

impl<'a> CommandContext<'a> {
    /// Context for a command served inside a Worker.
    pub fn for_worker(config: &'a ServerConfig, session: &'a mut Session) -> Self {
        Self {
            config,
            session: Some(session),
            worker_pid: Some(std::process::id()),
            events: Vec::new(),
        }
    }

    /// Context for a public or pre-auth command served by the Frontend.
    pub fn for_frontend(config: &'a ServerConfig) -> Self {
        Self {
            config,
            session: None,
            worker_pid: None,
            events: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_deref()
    }

    /// Mutable session access. The Worker saves the record after every query.
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_deref_mut()
    }

    pub fn require_session(&mut self) -> Result<&mut Session, CommandError> {
        self.session.as_deref_mut().ok_or(CommandError::Forbidden)
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker_pid
    }

    /// Queue a push event for every listener of `session_id`.
    pub fn post_event(&mut self, session_id: &str, data: impl Into<Vec<u8>>) {
        self.events.push(PendingEvent {
            session_id: session_id.to_string(),
            data: data.into(),
        });
    }

    pub fn take_events(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.events)
    }
}

/// A unit of business logic registered with the server.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn commands(&self) -> &[Command];

    /// Called in a Worker once its session is established.
    fn session_open(&self, _session: &mut Session) {}
}

/// Session-level hooks supplied by the embedding application.
pub trait SessionOps: Send + Sync {
    /// Verify credentials, filling in the session on success.
    fn auth(&self, session: &mut Session, user: &str, pass: &str) -> Result<(), String>;

    /// Render the login page, optionally with an error message.
    fn login_page(&self, q: &mut Query, error: Option<&str>);

    /// Commands served before authentication.
    fn pre_auth_commands(&self) -> &[Command] {
        &[]
    }

    /// Called in the Worker when the user logs out.
    fn logout(&self, _session: &Session) {}
}

/// Modules plus session operations: everything the core dispatches to.
pub struct Application {
    modules: Vec<Box<dyn Module>>,
    sops: Box<dyn SessionOps>,
}

impl Application {
    pub fn new(sops: Box<dyn SessionOps>) -> Self {
        Self {
            modules: Vec::new(),
            sops,
        }
    }

    pub fn with_module(mut self, module: Box<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn sops(&self) -> &dyn SessionOps {
        self.sops.as_ref()
    }

    pub fn modules(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref())
    }

    /// Find a module command by operation name.
    pub fn lookup(&self, op: &str) -> Option<(&dyn Module, &Command)> {
        self.modules.iter().find_map(|m| {
            m.commands()
                .iter()
                .find(|c| c.name == op)
                .map(|c| (m.as_ref(), c))
        })
    }

    /// Find a command served before authentication.
    pub fn pre_auth(&self, op: &str) -> Option<&Command> {
        self.sops.pre_auth_commands().iter().find(|c| c.name == op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Method;

    struct Sops;

    impl SessionOps for Sops {
        fn auth(&self, _s: &mut Session, user: &str, _p: &str) -> Result<(), String> {
            if user == "ok" {
                Ok(())
            } else {
                Err("denied".into())
            }
        }

        fn login_page(&self, q: &mut Query, _error: Option<&str>) {
            q.write(b"login");
        }

        fn pre_auth_commands(&self) -> &[Command] {
            const CMDS: &[Command] = &[Command::new("register", "", noop)];
            CMDS
        }
    }

    struct Mod;

    impl Module for Mod {
        fn name(&self) -> &'static str {
            "test"
        }

        fn commands(&self) -> &[Command] {
            const CMDS: &[Command] = &[
                Command::new("hello", "P", noop),
                Command::new("secret", "", noop),
            ];
            CMDS
        }
    }

    fn noop(_ctx: &mut CommandContext<'_>, q: &mut Query) -> Result<(), CommandError> {
        q.write(b"ok");
        Ok(())
    }

    #[test]
    fn lookup_and_flags() {
        let app = Application::new(Box::new(Sops)).with_module(Box::new(Mod));
        let (module, cmd) = app.lookup("hello").unwrap();
        assert_eq!(module.name(), "test");
        assert!(cmd.is_public());
        assert!(!app.lookup("secret").unwrap().1.is_public());
        assert!(app.lookup("missing").is_none());
        assert!(app.pre_auth("register").is_some());
        assert!(app.pre_auth("hello").is_none());
    }

    #[test]
    fn context_queues_events() {
        let config = ServerConfig::default();
        let mut session = Session::new("ok", "", "en");
        let mut ctx = CommandContext::for_worker(&config, &mut session);
        ctx.post_event("1", "ping");
        ctx.require_session().unwrap().queries = 5;
        assert_eq!(ctx.session().unwrap().queries, 5);
        assert_eq!(ctx.take_events().len(), 1);

        let mut q = Query::new(Method::Get);
        let mut fctx = CommandContext::for_frontend(&config);
        assert!(matches!(fctx.require_session(), Err(CommandError::Forbidden)));
        noop(&mut fctx, &mut q).unwrap();
        assert_eq!(q.body(), b"ok");
    }
}
