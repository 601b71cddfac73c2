//! Observability
//!
//! Logging goes through `tracing`. The binaries call [`init_tracing`] once at
//! startup; library code only emits events and spans.

pub mod spans;
pub mod tracing_setup;

pub use spans::*;
pub use tracing_setup::{init as init_tracing, InitError};
