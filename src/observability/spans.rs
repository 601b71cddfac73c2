//! Span Helpers
//!
//! Structured spans for the two long-lived units of work: a client session
//! and a survey round.

use tracing::{span, Level, Span};

/// Create a span for one client session
#[inline]
pub fn session_span(client_id: u64, client_addr: &str) -> Span {
    span!(
        Level::INFO,
        "stagger.session",
        client.id = client_id,
        client.address = %client_addr,
    )
}

/// Create a span for one survey round
#[inline]
pub fn survey_span(timestamp: i64) -> Span {
    span!(Level::DEBUG, "stagger.survey", survey.timestamp = timestamp)
}

/// Create a span for delivering a snapshot to the sinks
#[inline]
pub fn output_span(timestamp: i64, sinks: usize) -> Span {
    span!(
        Level::DEBUG,
        "stagger.output",
        snapshot.timestamp = timestamp,
        output.sinks = sinks,
    )
}
