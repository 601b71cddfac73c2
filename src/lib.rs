//! Stagger: a pull-based metrics aggregation server.
//!
//! Clients connect and register; on every tick the server asks all of them
//! for their current metrics, merges the answers into one snapshot per
//! interval and hands the snapshot to the output sinks.

pub mod client;
pub mod config;
pub mod io;
pub mod metrics;
pub mod observability;
pub mod output;
pub mod production;
pub mod protocol;

pub use config::ServerConfig;
pub use metrics::{Distribution, StatKey, TimestampedStats};
pub use production::StaggerServer;
pub use protocol::Message;
