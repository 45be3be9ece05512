use std::time::Duration;

use coordination_store::util::split_list;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/rebalance-operator/")]
    pub etcd_prefix: String,

    // ── Health / metrics HTTP ───────────────────────────────────────
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // ── Operator / leader election ──────────────────────────────────
    #[envconfig(default = "rebalance-operator-0")]
    pub operator_name: String,

    #[envconfig(default = "15")]
    pub leader_lease_ttl_secs: i64,

    #[envconfig(default = "5")]
    pub leader_keepalive_interval_secs: u64,

    #[envconfig(default = "5")]
    pub election_retry_interval_secs: u64,

    // ── Reconciliation ──────────────────────────────────────────────
    #[envconfig(default = "30")]
    pub reconcile_interval_secs: u64,

    /// Seconds of silence before /_liveness reports the loop as stalled.
    #[envconfig(default = "300")]
    pub liveness_deadline_secs: u64,

    /// Attempts for a compare-and-swap write (pool allocation, rebalance
    /// status) before the pass fails.
    #[envconfig(default = "3")]
    pub allocation_max_attempts: u32,

    // ── Optimization engine ─────────────────────────────────────────
    #[envconfig(default = "30")]
    pub engine_request_timeout_secs: u64,

    #[envconfig(
        default = "RackAwareGoal,MinTopicLeadersPerBrokerGoal,ReplicaCapacityGoal,DiskCapacityGoal,NetworkInboundCapacityGoal,NetworkOutboundCapacityGoal,CpuCapacityGoal"
    )]
    pub hard_goals: String,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        split_list(&self.etcd_endpoints)
    }

    pub fn hard_goal_list(&self) -> Vec<String> {
        split_list(&self.hard_goals)
    }

    pub fn leader_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.leader_keepalive_interval_secs)
    }

    pub fn election_retry_interval(&self) -> Duration {
        Duration::from_secs(self.election_retry_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn liveness_deadline(&self) -> Duration {
        Duration::from_secs(self.liveness_deadline_secs)
    }

    pub fn engine_request_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_request_timeout_secs)
    }

    pub fn leader_key(&self) -> String {
        format!("{}operator/leader", self.etcd_prefix)
    }
}
