//! Production server: the coordinator and aggregator actors, client sessions,
//! the tick source and the TCP server tying them together.

mod aggregator;
mod connection;
mod coordinator;
mod server;
mod survey;
mod ticker;

pub use aggregator::{
    Aggregator, AggregatorActor, AggregatorEvent, AggregatorHandle, AggregatorMessage, MetricShape,
    MetricShapes,
};
pub use connection::{Session, SessionConfig, SessionError, SessionHandle, SessionState};
pub use coordinator::{
    Coordinator, CoordinatorActor, CoordinatorConfig, CoordinatorHandle, CoordinatorMessage, Peer,
    CLIENTS_METRIC, SURVEY_LATENCY_METRIC, TIMEOUTS_METRIC,
};
pub use server::{ServerError, SnapshotReceiver, StaggerServer};
pub use survey::{ClientId, Completion, Survey, SurveyBook};
pub use ticker::{align, AlignedTicker};

pub(crate) use connection::write_frame;
