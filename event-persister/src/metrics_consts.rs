use metrics::counter;

// ==== Pipeline outcomes ====
/// Counter for every event outcome, labelled by event `kind` and a stable outcome `code`
pub const EVENTS_TOTAL_COUNTER: &str = "persister_events_total";

/// Counter for messages dropped before decoding, labelled by `reason`
pub const MESSAGES_DROPPED_COUNTER: &str = "persister_messages_dropped_total";

/// Counter for messages dropped before being settled, nacked on drop
pub const MESSAGES_UNSETTLED_COUNTER: &str = "persister_messages_unsettled_total";

/// Counter for redelivered messages acked while an identical id was buffered
pub const DUPLICATE_MESSAGES_COUNTER: &str = "persister_duplicate_messages_total";

/// Counter for messages handed from the source to the windowers
pub const MESSAGES_PUMPED_COUNTER: &str = "persister_messages_pumped_total";

/// Histogram for the number of messages per flushed batch
pub const BATCH_SIZE_HISTOGRAM: &str = "persister_batch_size_messages";

/// Histogram for the time spent processing one flushed batch
pub const FLUSH_DURATION_HISTOGRAM: &str = "persister_flush_duration_seconds";

/// Counter for flushes cut short by the flush timeout
pub const FLUSH_TIMEOUTS_COUNTER: &str = "persister_flush_timeouts_total";

// ==== Experiment resolution ====
pub const EXPERIMENT_CACHE_HIT_COUNTER: &str = "persister_experiment_cache_hits_total";
pub const EXPERIMENT_CACHE_MISS_COUNTER: &str = "persister_experiment_cache_misses_total";
/// Counter for lookups that joined an in-flight request instead of issuing their own
pub const EXPERIMENT_LOOKUP_SHARED_COUNTER: &str = "persister_experiment_lookups_shared_total";
pub const EXPERIMENT_LOOKUP_ERRORS_COUNTER: &str = "persister_experiment_lookup_errors_total";

// ==== Linkage ====
/// Counter for goal experiments skipped because the event falls outside their window
pub const GOAL_OUTSIDE_WINDOW_COUNTER: &str = "persister_goal_outside_window_total";
/// Counter for goal experiments skipped because the goal predates the user's evaluation
pub const GOAL_BEFORE_EVALUATION_COUNTER: &str = "persister_goal_before_evaluation_total";

// ==== Warehouse writer ====
/// Counter for rows written, labelled by `table` and `status` (written, retriable, non_retriable)
pub const WAREHOUSE_ROWS_COUNTER: &str = "persister_warehouse_rows_total";
pub const WAREHOUSE_APPEND_DURATION_HISTOGRAM: &str = "persister_warehouse_append_duration_seconds";

// ==== Retry subsystem ====
/// Counter for retry descriptor transitions, labelled by `code`
pub const RETRY_TOTAL_COUNTER: &str = "persister_retry_total";
/// Gauge for descriptors seen by the last full scan
pub const RETRY_PENDING_GAUGE: &str = "persister_retry_pending";
pub const RETRY_SCAN_DURATION_HISTOGRAM: &str = "persister_retry_scan_duration_seconds";

pub fn report_event_outcome(kind: &'static str, code: &'static str) {
    counter!(EVENTS_TOTAL_COUNTER, "kind" => kind, "code" => code).increment(1);
}

pub fn report_retry(code: &'static str) {
    counter!(RETRY_TOTAL_COUNTER, "code" => code).increment(1);
}
