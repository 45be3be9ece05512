// ==== Reconciliation ====
/// Counter for reconcile passes per cluster (label: outcome = ok/error)
pub const RECONCILE_PASSES_COUNTER: &str = "rebalance_operator_reconcile_passes_total";

/// Histogram for the duration of one cluster pass
pub const RECONCILE_DURATION_HISTOGRAM: &str = "rebalance_operator_reconcile_duration_seconds";

/// Counter for failed reconciles (label: error = Error::kind)
pub const RECONCILE_ERRORS_COUNTER: &str = "rebalance_operator_reconcile_errors_total";

// ==== Member IDs ====
/// Counter for pool commits that lost a compare-and-swap against a concurrent edit
pub const ALLOCATION_CONFLICTS_COUNTER: &str = "rebalance_operator_allocation_conflicts_total";

/// Counter for member IDs handed out or reclaimed (label: direction = added/removed)
pub const MEMBER_IDS_CHANGED_COUNTER: &str = "rebalance_operator_member_ids_changed_total";

// ==== Rebalance requests ====
/// Counter for phase transitions (labels: from, to)
pub const PHASE_TRANSITIONS_COUNTER: &str = "rebalance_operator_phase_transitions_total";

/// Counter for request writes that lost a compare-and-swap and were re-applied
pub const REBALANCE_WRITE_CONFLICTS_COUNTER: &str =
    "rebalance_operator_rebalance_write_conflicts_total";

/// Counter for engine calls (labels: call, outcome)
pub const ENGINE_CALLS_COUNTER: &str = "rebalance_operator_engine_calls_total";

// ==== Auto-rebalance ====
/// Counter for auto-rebalance state changes (label: state)
pub const AUTO_REBALANCE_STATE_COUNTER: &str = "rebalance_operator_auto_rebalance_state_total";

/// Counter for auto-created rebalance requests (label: mode)
pub const AUTO_REBALANCE_REQUESTS_CREATED_COUNTER: &str =
    "rebalance_operator_auto_rebalance_requests_created_total";

/// Counter for add-members requests cancelled by a scale-down
pub const AUTO_REBALANCE_PREEMPTED_COUNTER: &str = "rebalance_operator_auto_rebalance_preempted_total";

// ==== Leadership ====
/// Gauge set to 1 while this instance holds the operator lease
pub const IS_LEADER_GAUGE: &str = "rebalance_operator_is_leader";
