//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGTERM and SIGINT handlers
//! - Resolve to the signal that arrived first
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Frontends and Workers share this; each decides what termination means

use tokio::signal::unix::{signal, SignalKind};

/// A termination request from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

/// Wait for SIGTERM or SIGINT.
pub async fn wait_for_termination() -> std::io::Result<Termination> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let received = tokio::select! {
        _ = term.recv() => Termination::Terminate,
        _ = int.recv() => Termination::Interrupt,
    };
    tracing::info!(signal = ?received, "Termination signal received");
    Ok(received)
}
