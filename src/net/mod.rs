//! Client-side networking.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (reserve a slot, accept)
//!     → connection.rs (ClientSlot held for the connection's lifetime)
//!     → Frontend dispatcher
//! ```

pub mod connection;
pub mod listener;

pub use connection::{ClientSlot, ClientSlots, Reservation};
pub use listener::{Listener, ListenerError};
