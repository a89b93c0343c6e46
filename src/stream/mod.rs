pub mod backoff;
pub mod decoder;
pub mod pipeline;
pub mod record;
pub mod transport;
pub mod types;
pub mod window;

pub const TELEMETRY_STREAM: &str = "telemetry";
pub const ALERT_STREAM: &str = "alerts";
