//! Per-request correlation.
//!
//! Every client request gets a UUID v4 `request_id`; all events logged while
//! it is handled, including Worker spawn and relay, carry it through the span.

use uuid::Uuid;

/// Span covering one client request.
pub fn request_span(method: &str, peer: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %Uuid::new_v4(),
        method = %method,
        peer = %peer,
    )
}
