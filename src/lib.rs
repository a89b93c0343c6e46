pub mod client;
pub mod error;
pub mod state;
pub mod stream;
pub mod views;

pub use client::{AlertSubscription, TelemetryClient};
pub use error::AppError;
pub use state::IngestStats;
pub use stream::record::{AlertEvent, Metric, RejectedFrame, TelemetryRecord};
pub use stream::types::{
    ClientArgs, ClientConfig, ConnectionState, DecodeFailurePolicy, StreamStatusSnapshot,
};
