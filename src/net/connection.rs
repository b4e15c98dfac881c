//! Open client connection accounting.
//!
//! Every accepted client holds a `ClientSlot`. The slot owns one of the
//! `listener.max_connections` permits and counts toward the
//! `web_active_connections` gauge; shutdown waits for the count to reach zero.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::observability::metrics::set_active_connections;

/// Capacity and occupancy of the client side of a Frontend.
#[derive(Debug, Clone)]
pub struct ClientSlots {
    permits: Arc<Semaphore>,
    open: Arc<watch::Sender<u64>>,
    serial: Arc<AtomicU64>,
}

impl ClientSlots {
    pub fn new(max_connections: usize) -> Self {
        let (open, _) = watch::channel(0);
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            open: Arc::new(open),
            serial: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Wait for a free slot. `None` once the slots are closed.
    pub async fn reserve(&self) -> Option<Reservation> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        Some(Reservation {
            permit,
            slots: self.clone(),
        })
    }

    pub fn open_count(&self) -> u64 {
        *self.open.borrow()
    }

    pub fn free(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out slots; pending and future `reserve` calls get `None`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait until every client is gone or `limit` elapses.
    ///
    /// Returns the number of clients still open.
    pub async fn drain(&self, limit: Duration) -> u64 {
        let mut rx = self.open.subscribe();
        let _ = tokio::time::timeout(limit, rx.wait_for(|open| *open == 0)).await;
        self.open_count()
    }

    fn adjust(&self, delta: i64) -> u64 {
        let mut now = 0;
        self.open.send_modify(|open| {
            *open = open.saturating_add_signed(delta);
            now = *open;
        });
        set_active_connections(now);
        now
    }
}

/// A free slot that no client occupies yet.
#[derive(Debug)]
pub struct Reservation {
    permit: OwnedSemaphorePermit,
    slots: ClientSlots,
}

impl Reservation {
    /// Hand the slot to the client at `peer`.
    pub fn occupy(self, peer: SocketAddr) -> ClientSlot {
        self.slots.adjust(1);
        ClientSlot {
            serial: self.slots.serial.fetch_add(1, Ordering::Relaxed),
            peer,
            _permit: self.permit,
            slots: self.slots,
        }
    }
}

/// One open client connection; frees its slot on drop.
#[derive(Debug)]
pub struct ClientSlot {
    serial: u64,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
    slots: ClientSlots,
}

impl ClientSlot {
    /// Process-unique number used in log lines.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let open = self.slots.adjust(-1);
        tracing::trace!(client = self.serial, peer = %self.peer, open, "Client slot released");
    }
}
