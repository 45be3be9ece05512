use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{MemberId, OptimizationSpec, RebalanceMode, RebalanceOptions};

/// Everything the engine needs to compute or execute one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRequest {
    pub mode: RebalanceMode,
    /// Empty for a full-cluster rebalance.
    pub target_members: Vec<MemberId>,
    pub goals: Option<Vec<String>>,
    pub skip_hard_goal_check: bool,
    /// `true` computes a plan only; `false` starts moving partitions.
    pub dry_run: bool,
    pub options: RebalanceOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalPhase {
    /// The plan (or the execution start) is in the response.
    Ready,
    /// Accepted; resume with the returned session token.
    Computing,
    /// The engine has not collected enough metrics yet. Not an error.
    InsufficientData,
    /// The engine rejected the requested goals.
    BadGoals,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposalResponse {
    pub phase: ProposalPhase,
    pub result: Option<Value>,
    pub session_token: Option<String>,
    pub message: Option<String>,
}

impl ProposalResponse {
    pub fn new(phase: ProposalPhase) -> Self {
        Self {
            phase,
            result: None,
            session_token: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    InExecution,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub result: Option<Value>,
    pub message: Option<String>,
}

/// The external optimization engine computing and executing rebalance plans.
#[async_trait]
pub trait OptimizationEngine: Send + Sync {
    /// Submit a proposal, or resume the job behind `session_token`.
    async fn submit_proposal(
        &self,
        request: &ProposalRequest,
        session_token: Option<&str>,
    ) -> Result<ProposalResponse>;

    async fn poll_job(&self, session_token: &str) -> Result<JobStatus>;

    async fn cancel_job(&self, session_token: &str) -> Result<()>;
}

/// Answers which members still hold partition replicas.
#[async_trait]
pub trait MembersInUseChecker: Send + Sync {
    /// Returns the subset of `candidates` that currently holds data.
    async fn members_in_use(&self, candidates: &BTreeSet<MemberId>) -> Result<BTreeSet<MemberId>>;
}

/// Engine collaborators bound to one cluster's optimization endpoint.
#[derive(Clone)]
pub struct EngineHandle {
    pub engine: Arc<dyn OptimizationEngine>,
    pub in_use: Arc<dyn MembersInUseChecker>,
}

/// Builds [`EngineHandle`]s from a cluster's optimization settings.
pub trait EngineConnector: Send + Sync {
    fn connect(&self, optimization: &OptimizationSpec) -> Result<EngineHandle>;
}
