//! Monitor and metric model of a host, and the manager owning it.

pub mod factory;
pub mod manager;
pub mod metric;
pub mod monitor;

pub use factory::MetricFactory;
pub use manager::TelemetryManager;
pub use metric::{Metric, NumberMetric, StateSetMetric};
pub use monitor::{Monitor, MonitorStore};

use time::OffsetDateTime;

/// Current time in epoch milliseconds, the unit of every collect time.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
