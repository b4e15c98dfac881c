//! Session directory access.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Session, SessionError};

/// Longest ID produced (`u32::MAX` has ten digits).
pub const SESSION_ID_MAX_LEN: usize = 10;

/// Upper bound on exclusive-create retries for one new session.
pub const MAX_ID_ATTEMPTS: usize = 1000;

/// Session records stored one file per ID.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True when `id` could be a session ID. Checked before any path is built.
    pub fn is_valid_shape(id: &str) -> bool {
        !id.is_empty() && id.len() <= SESSION_ID_MAX_LEN && id.bytes().all(|b| b.is_ascii_digit())
    }

    /// True only for a well-formed ID whose record exists.
    pub fn valid_session_id(&self, id: &str) -> bool {
        Self::is_valid_shape(id)
            && fs::metadata(self.dir.join(id))
                .map(|m| m.is_file())
                .unwrap_or(false)
    }

    fn path(&self, id: &str) -> Result<PathBuf, SessionError> {
        if !Self::is_valid_shape(id) {
            return Err(SessionError::InvalidId);
        }
        Ok(self.dir.join(id))
    }

    /// Assign a fresh ID to `session` and write its record.
    ///
    /// IDs are drawn at random until an exclusive create succeeds.
    pub fn create(&self, session: &mut Session) -> Result<(), SessionError> {
        let (id, file) = self.create_exclusive(|| rand::random::<u32>().to_string())?;
        session.id = id;
        session.write_to(file)?;
        Ok(())
    }

    fn create_exclusive<F>(&self, mut next_id: F) -> Result<(String, File), SessionError>
    where
        F: FnMut() -> String,
    {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = next_id();
            let path = self.path(&id)?;
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((id, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(session_id = %id, "Session ID collision, retrying");
                    continue;
                }
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        Err(SessionError::Exhausted)
    }

    pub fn load(&self, id: &str) -> Result<Session, SessionError> {
        let path = self.path(id)?;
        let data = fs::read(path)?;
        let session = Session::from_slice(&data)?;
        if session.id != id {
            return Err(SessionError::InvalidId);
        }
        Ok(session)
    }

    /// Rewrite an existing record atomically.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.path(&session.id)?;
        let tmp = self.dir.join(format!(".{}.tmp", session.id));
        session.write_to(File::create(&tmp)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        fs::remove_file(self.path(id)?)?;
        Ok(())
    }
}
