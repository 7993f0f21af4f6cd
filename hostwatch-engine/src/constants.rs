//! Reserved attribute names, metric keys and scheduling constants.

pub const MONITOR_ATTRIBUTE_ID: &str = "id";
pub const MONITOR_ATTRIBUTE_NAME: &str = "name";
pub const MONITOR_ATTRIBUTE_CONNECTOR_ID: &str = "connector_id";
pub const MONITOR_ATTRIBUTE_APPLIES_TO_OS: &str = "applies_to_os";
pub const MONITOR_ATTRIBUTE_PARENT_ID: &str = "parent_id";
pub const MONITOR_ATTRIBUTE_DESCRIPTION: &str = "description";
pub const MONITOR_ATTRIBUTE_LOCATION: &str = "location";
pub const IS_ENDPOINT: &str = "is_endpoint";

pub const HOST_MONITOR_TYPE: &str = "host";
pub const CONNECTOR_MONITOR_TYPE: &str = "connector";

pub const CONNECTOR_STATUS_METRIC_KEY: &str = "metricshub.connector.status";
pub const STATE_SET_METRIC_OK: &str = "ok";
pub const STATE_SET_METRIC_FAILED: &str = "failed";
pub const STATUS_INFORMATION: &str = "StatusInformation";

/// Fixed-priority monitor types, collected sequentially and in this order
/// before every other type.
pub const MONITOR_JOBS_PRIORITY: [&str; 5] = ["host", "enclosure", "blade", "disk_controller", "cpu"];

pub const DEFAULT_MAX_THREADS: usize = 50;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SERIALIZATION_TIMEOUT_SECS: u64 = 120;

pub const TABLE_SEP: &str = ";";

/// Name of the synthetic heartbeat metric of a monitor type.
pub fn present_metric_name(monitor_type: &str) -> String {
    format!("hw.status{{hw.type=\"{monitor_type}\", state=\"present\"}}")
}

/// Name of the protocol availability metric written by the health check.
pub fn protocol_up_metric_name(protocol: &str) -> String {
    format!("metricshub.host.up{{protocol=\"{protocol}\"}}")
}

/// Rank of a monitor type in the fixed priority list, `None` for the remainder.
pub fn monitor_job_priority(monitor_type: &str) -> Option<usize> {
    MONITOR_JOBS_PRIORITY.iter().position(|t| *t == monitor_type)
}
