//! Metric values and their aggregation
//!
//! - [`Distribution`]: exact, order-independent summary of sampled values
//! - [`StatKey`]: metric name with an optional sorted tag suffix
//! - [`TimestampedStats`]: the aggregated snapshot for one survey timestamp

mod distribution;
mod snapshot;
mod stat_key;

pub use distribution::Distribution;
pub use snapshot::TimestampedStats;
pub use stat_key::StatKey;
