//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc within a Frontend
//!     → serialized to every spawned Worker
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, prepare_paths, ConfigError};
pub use schema::{
    AuthConfig, ClusterConfig, EventsConfig, HttpConfig, LimitsConfig, ListenerConfig,
    ObservabilityConfig, PathsConfig, ServerConfig, WorkerConfig,
};
