use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer identifier of one cluster member, unique across all pools of a cluster.
pub type MemberId = i32;

// ── Cluster ─────────────────────────────────────────────────────

/// A streaming cluster, stored under `{prefix}clusters/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Present when an optimization engine is deployed next to the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSpec {
    /// Base URL of the engine's REST API.
    pub endpoint: String,
    /// Scale-triggered rebalancing is enabled when this is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rebalance: Option<Vec<AutoRebalanceModeConfig>>,
}

/// Which template, if any, supplies goals for the auto-created request of `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRebalanceModeConfig {
    pub mode: AutoRebalanceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub observed_generation: i64,
    /// Data-holding members recorded by the last successful pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_members: Option<BTreeSet<MemberId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rebalance: Option<AutoRebalanceStatus>,
}

// ── Auto-rebalance status ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoRebalanceMode {
    AddMembers,
    RemoveMembers,
}

impl AutoRebalanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoRebalanceMode::AddMembers => "add-members",
            AutoRebalanceMode::RemoveMembers => "remove-members",
        }
    }

    pub fn rebalance_mode(&self) -> RebalanceMode {
        match self {
            AutoRebalanceMode::AddMembers => RebalanceMode::AddMembers,
            AutoRebalanceMode::RemoveMembers => RebalanceMode::RemoveMembers,
        }
    }
}

impl fmt::Display for AutoRebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoRebalanceState {
    #[default]
    Idle,
    RebalanceOnScaleUp,
    RebalanceOnScaleDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRebalanceModeStatus {
    pub mode: AutoRebalanceMode,
    pub members: BTreeSet<MemberId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRebalanceStatus {
    pub state: AutoRebalanceState,
    /// Pending scale events, at most one entry per mode.
    #[serde(default)]
    pub modes: Vec<AutoRebalanceModeStatus>,
    #[serde(default)]
    pub last_transition_time: i64,
}

impl AutoRebalanceStatus {
    pub fn members(&self, mode: AutoRebalanceMode) -> Option<&BTreeSet<MemberId>> {
        self.modes.iter().find(|m| m.mode == mode).map(|m| &m.members)
    }

    pub fn is_tracked(&self, mode: AutoRebalanceMode) -> bool {
        self.members(mode).is_some()
    }

    pub fn set_members(&mut self, mode: AutoRebalanceMode, members: BTreeSet<MemberId>) {
        match self.modes.iter_mut().find(|m| m.mode == mode) {
            Some(entry) => entry.members = members,
            None => {
                self.modes.push(AutoRebalanceModeStatus { mode, members });
                self.modes.sort_by_key(|m| m.mode);
            }
        }
    }

    pub fn drop_mode(&mut self, mode: AutoRebalanceMode) {
        self.modes.retain(|m| m.mode != mode);
    }
}

// ── Node pools ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds partition data; the only role that takes part in rebalancing.
    Broker,
    /// Coordination only.
    Controller,
}

/// A group of members sharing roles, stored under `{prefix}pools/{cluster}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    pub cluster: String,
    pub roles: BTreeSet<NodeRole>,
    pub replicas: u32,
    #[serde(default)]
    pub member_ids: BTreeSet<MemberId>,
    /// One-shot preference for IDs to use when growing, e.g. `"[5, 20-21]"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_ids: Option<String>,
    /// One-shot preference for IDs to drop when shrinking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_ids: Option<String>,
}

impl NodePool {
    pub fn holds_data(&self) -> bool {
        self.roles.contains(&NodeRole::Broker)
    }
}

// ── Rebalance requests ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceMode {
    #[default]
    Full,
    AddMembers,
    RemoveMembers,
}

impl fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebalanceMode::Full => "full",
            RebalanceMode::AddMembers => "add-members",
            RebalanceMode::RemoveMembers => "remove-members",
        })
    }
}

/// Tuning knobs passed through to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_topics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_partition_movements_per_member: Option<u32>,
    /// Bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_throttle: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceSpec {
    #[serde(default)]
    pub mode: RebalanceMode,
    #[serde(default)]
    pub target_members: Vec<MemberId>,
    /// `None` lets the engine use its default goals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<Vec<String>>,
    #[serde(default)]
    pub skip_hard_goal_check: bool,
    /// Execute the proposal as soon as it is ready, without an `approve` directive.
    #[serde(default)]
    pub auto_approval: bool,
    #[serde(default)]
    pub options: RebalanceOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebalancePhase {
    #[default]
    New,
    PendingProposal,
    ProposalReady,
    Rebalancing,
    Ready,
    NotReady,
    Stopped,
}

impl RebalancePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalancePhase::New => "New",
            RebalancePhase::PendingProposal => "PendingProposal",
            RebalancePhase::ProposalReady => "ProposalReady",
            RebalancePhase::Rebalancing => "Rebalancing",
            RebalancePhase::Ready => "Ready",
            RebalancePhase::NotReady => "NotReady",
            RebalancePhase::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for RebalancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: RebalancePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceStatus {
    #[serde(default)]
    pub phase: RebalancePhase,
    /// Handle of the engine job in flight, if any.
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_result: Option<serde_json::Value>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// One rebalance job, stored under `{prefix}rebalances/{cluster}/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    pub name: String,
    pub cluster: String,
    /// Bumped on every spec change.
    #[serde(default)]
    pub generation: i64,
    /// Raw control directive as attached by a user or the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
    pub spec: RebalanceSpec,
    #[serde(default)]
    pub status: RebalanceStatus,
}

impl RebalanceRequest {
    pub fn new(cluster: &str, name: &str, spec: RebalanceSpec) -> Self {
        Self {
            name: name.to_string(),
            cluster: cluster.to_string(),
            generation: 1,
            directive: None,
            spec,
            status: RebalanceStatus::default(),
        }
    }

    pub fn directive(&self) -> Directive {
        Directive::parse(self.directive.as_deref())
    }

    pub fn is_template(&self) -> bool {
        self.directive() == Directive::Template
    }

    pub fn phase(&self) -> RebalancePhase {
        self.status.phase
    }
}

/// A one-shot user instruction attached to a [`RebalanceRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Approve,
    Stop,
    Refresh,
    /// Marks the request as a goals template; never driven, never cleared.
    Template,
    None,
    Unrecognized(String),
}

impl Directive {
    pub const APPROVE: &'static str = "approve";
    pub const STOP: &'static str = "stop";
    pub const REFRESH: &'static str = "refresh";
    pub const TEMPLATE: &'static str = "template";
    pub const NONE: &'static str = "none";

    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some(Self::NONE) => Directive::None,
            Some(Self::APPROVE) => Directive::Approve,
            Some(Self::STOP) => Directive::Stop,
            Some(Self::REFRESH) => Directive::Refresh,
            Some(Self::TEMPLATE) => Directive::Template,
            Some(other) => Directive::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Approve => f.write_str(Self::APPROVE),
            Directive::Stop => f.write_str(Self::STOP),
            Directive::Refresh => f.write_str(Self::REFRESH),
            Directive::Template => f.write_str(Self::TEMPLATE),
            Directive::None => f.write_str(Self::NONE),
            Directive::Unrecognized(raw) => f.write_str(raw),
        }
    }
}
