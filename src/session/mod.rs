//! Per-user sessions persisted to disk.
//!
//! # Responsibilities
//! - Generate collision-free numeric session IDs
//! - Persist, load and remove session records by ID
//! - Gate every re-entry path with a shape check and an existence check
//!
//! # Design Decisions
//! - A session file's existence is the proof that the session exists
//! - ID uniqueness across concurrently spawning Workers relies solely on
//!   exclusive file creation; no locks are taken
//! - Records are JSON so modules can extend them through `vars`

mod store;

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};

pub use store::{SessionStore, MAX_ID_ATTEMPTS, SESSION_ID_MAX_LEN};

use crate::config::HttpConfig;
use crate::query::{Cookie, CookieFlags, Query, QueryError};

/// Name of the cookie carrying the session ID.
pub const SESSION_COOKIE: &str = "sess";

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session ID")]
    InvalidId,
    #[error("No such session")]
    NotFound,
    #[error("Session record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Could not allocate a session ID")]
    Exhausted,
    #[error("Session I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            SessionError::NotFound
        } else {
            SessionError::Io(e)
        }
    }
}

/// A durable per-user session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Numeric ID; empty until the record has been created on disk.
    pub id: String,
    pub user: String,
    /// Retained so a respawned Worker can re-authenticate.
    pub password: String,
    pub lang: String,
    /// Creation time (seconds since epoch).
    pub created: i64,
    /// Last query served (seconds since epoch).
    pub last_access: i64,
    /// Push events delivered to this session.
    pub events: u64,
    /// Queries served by the owning Worker.
    pub queries: u64,
    /// Module-defined state.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Session {
    pub fn new(user: &str, password: &str, lang: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: String::new(),
            user: user.to_string(),
            password: password.to_string(),
            lang: lang.to_string(),
            created: now,
            last_access: now,
            events: 0,
            queries: 0,
            vars: BTreeMap::new(),
        }
    }

    /// Record a served query.
    pub fn touch(&mut self) {
        self.queries += 1;
        self.last_access = chrono::Utc::now().timestamp();
    }

    /// Write the record to an already-open file or stream.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), SessionError> {
        serde_json::to_writer(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, SessionError> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn apply_cookie_attrs(cookie: &mut Cookie, http: &HttpConfig) {
    cookie.path = Some(http.cookie_path.clone());
    cookie.domain = http.cookie_domain.clone();
    cookie.flags.insert(CookieFlags::HTTP_ONLY);
    if http.secure_cookies {
        cookie.flags.insert(CookieFlags::SECURE);
    }
}

/// Set the `sess` cookie with a sliding expiry.
pub fn set_session_cookie(q: &mut Query, session_id: &str, http: &HttpConfig) -> Result<(), QueryError> {
    let ttl = chrono::Duration::seconds(http.session_cookie_ttl_secs as i64);
    let cookie = q.set_cookie(SESSION_COOKIE, session_id)?;
    cookie.set_expires_at(chrono::Utc::now() + ttl);
    apply_cookie_attrs(cookie, http);
    Ok(())
}

/// Instruct the client to drop its `sess` cookie.
pub fn clear_session_cookie(q: &mut Query, http: &HttpConfig) -> Result<(), QueryError> {
    let cookie = q.del_cookie(SESSION_COOKIE)?;
    apply_cookie_attrs(cookie, http);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Method;

    #[test]
    fn session_cookie_slides_and_clears() {
        let http = HttpConfig::default();
        let mut q = Query::new(Method::Get);
        set_session_cookie(&mut q, "1234", &http).unwrap();
        let header = &q.set_cookie_headers()[0];
        assert!(header.starts_with("sess=1234;"));
        assert!(header.contains("Path=/"));
        assert!(header.contains("HttpOnly"));
        assert!(!header.contains("1970"));

        clear_session_cookie(&mut q, &http).unwrap();
        let header = &q.set_cookie_headers()[0];
        assert!(header.starts_with("sess=;"));
        assert!(header.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }
}
