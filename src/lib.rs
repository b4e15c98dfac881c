//! Multiprocess HTTP application server.
//!
//! Frontends terminate client HTTP; each authenticated session is served by
//! its own Worker process reached over a Unix socket.

pub mod codec;
pub mod config;
pub mod control;
pub mod demo;
pub mod events;
pub mod frontend;
pub mod http;
pub mod lifecycle;
pub mod module;
pub mod net;
pub mod observability;
pub mod query;
pub mod session;
pub mod worker;

pub use config::ServerConfig;
pub use frontend::ServerContext;
pub use lifecycle::Shutdown;
pub use query::Query;
