use super::{QueryError, MAX_KEY_LEN};

/// Where an argument came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArgType {
    /// URL query string or path.
    Get = 0,
    /// Request body.
    Post = 1,
}

impl ArgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ArgType::Get),
            1 => Some(ArgType::Post),
            _ => None,
        }
    }
}

/// A request argument. The value may hold arbitrary binary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub key: String,
    pub value: Vec<u8>,
    pub kind: ArgType,
    /// Part content type for multipart uploads.
    pub content_type: Option<String>,
}

impl Argument {
    pub fn new(key: &str, value: Vec<u8>, kind: ArgType) -> Result<Self, QueryError> {
        if !is_valid_key(key) {
            return Err(QueryError::InvalidKey(key.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value,
            kind,
            content_type: None,
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Keys are non-empty, bounded and free of control characters.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && !key.chars().any(char::is_control)
}
