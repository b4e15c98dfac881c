//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → request.rs (read header block, parse into Query, read body)
//!     → [frontend dispatch: local command or Worker]
//!     → response.rs (render locally served responses)
//!     → relay.rs (stream Worker responses verbatim)
//!     → Send to client
//! ```

pub mod multipart;
pub mod relay;
pub mod request;
pub mod response;

pub use relay::{Framing, RelayError, WorkerHead};
pub use request::{is_valid_op, parse_request, read_body, read_head, HttpError};
pub use response::{
    error_query, flush_query, render_response, status_text, write_error, ResponseOptions,
};
