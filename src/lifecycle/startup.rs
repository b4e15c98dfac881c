//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the configuration file and apply command-line overrides
//! - Re-validate after overrides
//! - Initialize logging, metrics and the shared directories in order
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - A missing config file path means built-in defaults

use std::path::Path;

use crate::config::{load_config, prepare_paths, ConfigError, ServerConfig};
use crate::config::validation::validate_config;
use crate::observability::{logging, metrics};

/// Values given on the command line that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub cluster_id: Option<u32>,
    pub bind_address: Option<String>,
}

/// Load, override and validate the configuration.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(id) = overrides.cluster_id {
        config.cluster.id = id;
    }
    if let Some(addr) = &overrides.bind_address {
        config.listener.bind_address = addr.clone();
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Bring up the ambient subsystems of a Frontend.
pub fn init_frontend(config: &ServerConfig) -> std::io::Result<()> {
    logging::init(&config.observability.log_level);
    prepare_paths(config)?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        cluster_id = config.cluster.id,
        bind_address = %config.listener.bind_address,
        sessions = %config.paths.sessions.display(),
        sockets = %config.paths.sockets.display(),
        "Configuration loaded"
    );
    Ok(())
}
