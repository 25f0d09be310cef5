// ==== Bootstrap metrics ====
/// Counter for errors collected during cluster or partition consumer bootstrap
pub const BOOTSTRAP_FAILURES: &str = "kafka_tail_bootstrap_failures_total";

/// Gauge for partition consumers currently registered with a cluster
pub const OPEN_PARTITION_CONSUMERS: &str = "kafka_tail_open_partition_consumers";

/// Counter for failures closing a partition consumer, consumer or client
pub const CLOSE_ERRORS: &str = "kafka_tail_close_errors_total";

// ==== Forwarding metrics ====
/// Counter for records handed to the sink
pub const MESSAGES_FORWARDED: &str = "kafka_tail_messages_forwarded_total";

/// Counter for failed sink sends
pub const SINK_ERRORS: &str = "kafka_tail_sink_errors_total";

/// Counter for errors returned by a partition consumer's receive loop
pub const RECEIVE_ERRORS: &str = "kafka_tail_receive_errors_total";

/// Gauge for connected sink sessions
pub const ACTIVE_SESSIONS: &str = "kafka_tail_active_sessions";
