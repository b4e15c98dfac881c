//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, cluster ID within bounds)
//! - Detect conflicting filesystem paths
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::codec::MAX_FRAME_SIZE;
use crate::config::schema::ServerConfig;
use crate::query::{MAX_ARGS, MAX_COOKIES, MAX_LANGS};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration, collecting every error.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if config.cluster.max_size == 0 {
        errors.push(ValidationError::new("cluster.max_size", "must be > 0"));
    }
    if config.cluster.id == 0 || config.cluster.id > config.cluster.max_size {
        errors.push(ValidationError::new(
            "cluster.id",
            format!("must be within 1..={}", config.cluster.max_size),
        ));
    }

    if config.worker.timeout_secs == 0 {
        errors.push(ValidationError::new("worker.timeout_secs", "must be > 0"));
    }
    if config.worker.response_timeout_secs == 0 {
        errors.push(ValidationError::new("worker.response_timeout_secs", "must be > 0"));
    }
    if config.worker.spawn_timeout_secs == 0 {
        errors.push(ValidationError::new("worker.spawn_timeout_secs", "must be > 0"));
    }
    if config.worker.chunk_threshold == 0 {
        errors.push(ValidationError::new("worker.chunk_threshold", "must be > 0"));
    }

    if config.http.max_header_size < 256 {
        errors.push(ValidationError::new("http.max_header_size", "must be at least 256"));
    }
    if config.http.max_url_length == 0 || config.http.max_url_length > config.http.max_header_size {
        errors.push(ValidationError::new(
            "http.max_url_length",
            "must be > 0 and no larger than http.max_header_size",
        ));
    }
    if config.http.max_body_size >= MAX_FRAME_SIZE {
        errors.push(ValidationError::new(
            "http.max_body_size",
            format!("must be below the {} byte frame limit", MAX_FRAME_SIZE),
        ));
    }
    if !crate::http::request::is_valid_op(&config.http.default_op) {
        errors.push(ValidationError::new("http.default_op", "not a valid operation name"));
    }

    if config.events.ping_interval_secs == 0 {
        errors.push(ValidationError::new("events.ping_interval_secs", "must be > 0"));
    }

    if config.limits.max_args > MAX_ARGS {
        errors.push(ValidationError::new(
            "limits.max_args",
            format!("cannot exceed {}", MAX_ARGS),
        ));
    }
    if config.limits.max_cookies > MAX_COOKIES {
        errors.push(ValidationError::new(
            "limits.max_cookies",
            format!("cannot exceed {}", MAX_COOKIES),
        ));
    }
    if config.limits.max_langs > MAX_LANGS {
        errors.push(ValidationError::new(
            "limits.max_langs",
            format!("cannot exceed {}", MAX_LANGS),
        ));
    }

    let paths = &config.paths;
    if paths.sessions == paths.sockets || paths.sessions == paths.events {
        errors.push(ValidationError::new(
            "paths.sessions",
            "must differ from the socket directories",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
