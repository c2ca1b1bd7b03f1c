pub mod gateway;

pub use gateway::{GatewayMetrics, MetricsSnapshot};
