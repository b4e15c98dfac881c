//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! application server. All types derive Serde traits for deserialization from
//! config files. The same structure is handed to every Worker on spawn, so it
//! also derives `Serialize`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for a Frontend (and the Workers it spawns).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listener configuration.
    pub listener: ListenerConfig,

    /// Filesystem layout for sessions and sockets.
    pub paths: PathsConfig,

    /// Worker process settings.
    pub worker: WorkerConfig,

    /// HTTP protocol settings.
    pub http: HttpConfig,

    /// Push-event listener settings.
    pub events: EventsConfig,

    /// Frontend cluster membership.
    pub cluster: ClusterConfig,

    /// Parser ceilings.
    pub limits: LimitsConfig,

    /// Credentials accepted by the bundled authenticator.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Maximum concurrent HTTP connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 1024,
        }
    }
}

/// Directories shared by every process of the cluster.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// One file per session, named by session ID.
    pub sessions: PathBuf,

    /// Worker (`<id>.sock`) and control (`<cluster>.ctrl`) sockets.
    pub sockets: PathBuf,

    /// Push-event listener sockets (`<id>:<user>:<lang>`).
    pub events: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sessions: PathBuf::from("/tmp/appserver/sessions"),
            sockets: PathBuf::from("/tmp/appserver/sockets"),
            events: PathBuf::from("/tmp/appserver/events"),
        }
    }
}

/// Worker process settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle time after which a Worker exits on its own.
    pub timeout_secs: u64,

    /// How long the Frontend waits for a Worker's response header.
    pub response_timeout_secs: u64,

    /// How long the Frontend waits for the spawn handshake.
    pub spawn_timeout_secs: u64,

    /// How many times a dead Worker is respawned for one request.
    pub restore_attempts: u32,

    /// Binary to execute for Workers. Defaults to the running executable.
    pub executable: Option<PathBuf>,

    /// Response bodies larger than this are sent with chunked encoding.
    pub chunk_threshold: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            response_timeout_secs: 30,
            spawn_timeout_secs: 10,
            restore_attempts: 1,
            executable: None,
            chunk_threshold: 32 * 1024,
        }
    }
}

/// HTTP protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Maximum size of the request header block.
    pub max_header_size: usize,

    /// Maximum length of the request target.
    pub max_url_length: usize,

    /// Maximum request body accepted.
    pub max_body_size: usize,

    /// Bodies smaller than this are never deflated.
    pub compression_threshold: usize,

    /// Honor persistent connections.
    pub keep_alive: bool,

    /// Idle time allowed between requests on a persistent connection.
    pub keep_alive_timeout_secs: u64,

    /// Operation served for `/`.
    pub default_op: String,

    /// Sliding lifetime of the `sess` cookie.
    pub session_cookie_ttl_secs: u64,

    /// `Domain` attribute for cookies set by the server.
    pub cookie_domain: Option<String>,

    /// `Path` attribute for cookies set by the server.
    pub cookie_path: String,

    /// Mark server cookies `Secure`.
    pub secure_cookies: bool,

    /// Value of the `Server` response header.
    pub server_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_size: 16 * 1024,
            max_url_length: 2048,
            max_body_size: 8 * 1024 * 1024,
            compression_threshold: 1024,
            keep_alive: true,
            keep_alive_timeout_secs: 60,
            default_op: "index".to_string(),
            session_cookie_ttl_secs: 7 * 24 * 3600,
            cookie_domain: None,
            cookie_path: "/".to_string(),
            secure_cookies: false,
            server_name: concat!("appserver/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Push-event listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Interval between keep-alive pings on an event stream.
    pub ping_interval_secs: u64,

    /// Largest event payload accepted from a poster.
    pub max_event_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            max_event_size: 64 * 1024,
        }
    }
}

/// Frontend cluster membership.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// This Frontend's cluster ID.
    pub id: u32,

    /// Highest cluster ID tried when broadcasting control commands.
    pub max_size: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { id: 1, max_size: 16 }
    }
}

/// Parser ceilings applied to HTTP input.
///
/// The wire codec enforces its own fixed maxima; these may be lower.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_args: usize,
    pub max_cookies: usize,
    pub max_langs: usize,
    pub max_multipart_parts: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_args: crate::query::MAX_ARGS,
            max_cookies: crate::query::MAX_COOKIES,
            max_langs: crate::query::MAX_LANGS,
            max_multipart_parts: 64,
        }
    }
}

/// Credentials accepted by the bundled authenticator.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// user name -> password
    pub users: BTreeMap<String, String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
