//! Client-facing TCP listener.
//!
//! `accept` first reserves a `ClientSlot`, so at most
//! `listener.max_connections` clients are served at once and further
//! clients wait in the kernel backlog.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use super::connection::{ClientSlot, ClientSlots};
use crate::config::ListenerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Cannot listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("Accept failed: {0}")]
    Accept(std::io::Error),
    #[error("No longer accepting clients")]
    Closed,
}

pub struct Listener {
    inner: TcpListener,
    slots: ClientSlots,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig, slots: ClientSlots) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: config.bind_address.clone(),
            source,
        };
        let inner = TcpListener::bind(config.bind_address.as_str()).await.map_err(bind_err)?;
        let address = inner.local_addr().map_err(bind_err)?;
        tracing::info!(%address, max_connections = slots.free(), "Accepting clients");
        Ok(Self { inner, slots })
    }

    /// Wait for a free slot, then for a client to fill it.
    pub async fn accept(&self) -> Result<(TcpStream, ClientSlot), ListenerError> {
        let reservation = self.slots.reserve().await.ok_or(ListenerError::Closed)?;
        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "TCP_NODELAY not set");
        }
        let slot = reservation.occupy(peer);
        tracing::debug!(client = slot.serial(), peer = %peer, free = self.slots.free(), "Client accepted");
        Ok((stream, slot))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bind_address: &str) -> ListenerConfig {
        ListenerConfig {
            bind_address: bind_address.to_string(),
            max_connections: 1,
        }
    }

    #[tokio::test]
    async fn one_slot_per_client() {
        let slots = ClientSlots::new(1);
        let listener = Listener::bind(&config("127.0.0.1:0"), slots.clone()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, slot) = listener.accept().await.unwrap();
        assert_eq!(slot.peer().ip(), addr.ip());
        assert_eq!(slots.free(), 0);
        assert_eq!(slots.open_count(), 1);

        drop(slot);
        assert_eq!(slots.free(), 1);
    }

    #[tokio::test]
    async fn closed_slots_stop_accepting() {
        let slots = ClientSlots::new(1);
        let listener = Listener::bind(&config("127.0.0.1:0"), slots.clone()).await.unwrap();
        slots.close();
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn unparsable_address_names_itself() {
        let err = Listener::bind(&config("nowhere"), ClientSlots::new(1)).await.err().unwrap();
        assert!(err.to_string().contains("nowhere"));
    }
}
