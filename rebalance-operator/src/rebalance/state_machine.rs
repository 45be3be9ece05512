use std::sync::Arc;

use coordination_store::util::now_seconds;
use metrics::counter;

use crate::error::{Error, Result};
use crate::metrics_consts::PHASE_TRANSITIONS_COUNTER;
use crate::rebalance::engine::{
    JobPhase, OptimizationEngine, ProposalPhase, ProposalRequest, ProposalResponse,
};
use crate::types::{Condition, Directive, RebalancePhase, RebalanceRequest};

pub const REASON_INVALID_ANNOTATION: &str = "InvalidAnnotation";

/// Result of one pass over a [`RebalanceRequest`].
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: RebalancePhase,
    pub to: RebalancePhase,
    pub request: RebalanceRequest,
}

/// Drives one rebalance request per call, against an injected engine.
///
/// All progress lives in the request status (phase plus session token), so a
/// pass can be interrupted at any point and the next one resumes the same job.
pub struct RebalanceStateMachine {
    engine: Arc<dyn OptimizationEngine>,
    hard_goals: Vec<String>,
}

enum Step {
    /// Keep the phase, just persist the new status.
    Stay,
    Move(RebalancePhase, Option<String>),
    Invalid(String),
}

impl RebalanceStateMachine {
    pub fn new(engine: Arc<dyn OptimizationEngine>, hard_goals: Vec<String>) -> Self {
        Self { engine, hard_goals }
    }

    pub async fn reconcile(&self, current: &RebalanceRequest) -> Result<Transition> {
        let from = current.phase();
        let directive = current.directive();

        if directive == Directive::Template {
            return Ok(Transition {
                from,
                to: from,
                request: current.clone(),
            });
        }

        let mut request = current.clone();
        let step = match from {
            RebalancePhase::New => self.on_new(&mut request, &directive).await?,
            RebalancePhase::PendingProposal => self.on_pending(&mut request, &directive).await?,
            RebalancePhase::ProposalReady => self.on_proposal_ready(&mut request, &directive).await?,
            RebalancePhase::Rebalancing => self.on_rebalancing(&mut request, &directive).await?,
            RebalancePhase::Ready | RebalancePhase::NotReady | RebalancePhase::Stopped => {
                self.on_terminal(&mut request, &directive).await?
            }
        };

        match step {
            Step::Stay => {}
            Step::Move(to, message) => set_phase(&mut request, to, None, message),
            Step::Invalid(message) => {
                tracing::warn!(
                    cluster = %request.cluster,
                    rebalance = %request.name,
                    phase = %from,
                    directive = %directive,
                    "ignoring directive"
                );
                set_phase(
                    &mut request,
                    from,
                    Some(REASON_INVALID_ANNOTATION.to_string()),
                    Some(message),
                );
            }
        }

        request.directive = None;
        request.status.observed_generation = request.generation;

        let to = request.phase();
        if from != to {
            tracing::info!(
                cluster = %request.cluster,
                rebalance = %request.name,
                from = %from,
                to = %to,
                "rebalance phase transition"
            );
            counter!(PHASE_TRANSITIONS_COUNTER, "from" => from.as_str(), "to" => to.as_str())
                .increment(1);
        }

        Ok(Transition { from, to, request })
    }

    // ── Phase handlers ───────────────────────────────────────────

    async fn on_new(&self, request: &mut RebalanceRequest, directive: &Directive) -> Result<Step> {
        match directive {
            Directive::Stop => Ok(Step::Move(RebalancePhase::Stopped, None)),
            Directive::Approve => Ok(invalid(directive, RebalancePhase::New)),
            Directive::Unrecognized(_) => Ok(unrecognized(directive)),
            _ => self.compute(request).await,
        }
    }

    async fn on_pending(&self, request: &mut RebalanceRequest, directive: &Directive) -> Result<Step> {
        match directive {
            Directive::Stop => {
                self.cancel_outstanding(request).await?;
                Ok(Step::Move(RebalancePhase::Stopped, None))
            }
            Directive::Refresh => self.recompute(request).await,
            Directive::None => {
                let token = request.status.session_token.clone();
                let proposal = self.proposal_request(request, true)?;
                let response = self
                    .engine
                    .submit_proposal(&proposal, token.as_deref())
                    .await?;
                Ok(apply_proposal(request, response))
            }
            Directive::Unrecognized(_) => Ok(unrecognized(directive)),
            _ => Ok(invalid(directive, RebalancePhase::PendingProposal)),
        }
    }

    async fn on_proposal_ready(
        &self,
        request: &mut RebalanceRequest,
        directive: &Directive,
    ) -> Result<Step> {
        match directive {
            Directive::Approve => self.execute(request).await,
            Directive::Refresh => self.compute(request).await,
            Directive::Stop => Ok(Step::Move(RebalancePhase::Stopped, None)),
            Directive::None if request.spec.auto_approval => self.execute(request).await,
            Directive::None => Ok(Step::Stay),
            Directive::Unrecognized(_) => Ok(unrecognized(directive)),
            Directive::Template => Ok(Step::Stay),
        }
    }

    async fn on_rebalancing(
        &self,
        request: &mut RebalanceRequest,
        directive: &Directive,
    ) -> Result<Step> {
        match directive {
            Directive::Stop => {
                self.cancel_outstanding(request).await?;
                Ok(Step::Move(RebalancePhase::Stopped, None))
            }
            Directive::Refresh => self.recompute(request).await,
            Directive::None => self.poll(request).await,
            Directive::Unrecognized(_) => Ok(unrecognized(directive)),
            _ => Ok(invalid(directive, RebalancePhase::Rebalancing)),
        }
    }

    async fn on_terminal(&self, request: &mut RebalanceRequest, directive: &Directive) -> Result<Step> {
        match directive {
            Directive::Refresh => self.compute(request).await,
            Directive::None => Ok(Step::Stay),
            Directive::Unrecognized(_) => Ok(unrecognized(directive)),
            _ => Ok(invalid(directive, request.phase())),
        }
    }

    // ── Engine interactions ──────────────────────────────────────

    /// Ask for a fresh dry-run proposal. Any previous result is dropped.
    async fn compute(&self, request: &mut RebalanceRequest) -> Result<Step> {
        let proposal = self.proposal_request(request, true)?;
        self.submit_dry_run(request, proposal).await
    }

    /// Cancel the outstanding job, then compute again. The new proposal is
    /// validated first so a rejected request keeps its running job.
    async fn recompute(&self, request: &mut RebalanceRequest) -> Result<Step> {
        let proposal = self.proposal_request(request, true)?;
        self.cancel_outstanding(request).await?;
        self.submit_dry_run(request, proposal).await
    }

    async fn submit_dry_run(
        &self,
        request: &mut RebalanceRequest,
        proposal: ProposalRequest,
    ) -> Result<Step> {
        request.status.optimization_result = None;
        request.status.session_token = None;
        let response = self.engine.submit_proposal(&proposal, None).await?;
        Ok(apply_proposal(request, response))
    }

    async fn execute(&self, request: &mut RebalanceRequest) -> Result<Step> {
        let proposal = self.proposal_request(request, false)?;
        let response = self.engine.submit_proposal(&proposal, None).await?;

        match response.phase {
            ProposalPhase::Ready | ProposalPhase::Computing => {
                let token = response.session_token.ok_or_else(|| {
                    Error::Engine("execution started without a session token".to_string())
                })?;
                request.status.session_token = Some(token);
                if response.result.is_some() {
                    request.status.optimization_result = response.result;
                }
                Ok(Step::Move(RebalancePhase::Rebalancing, None))
            }
            _ => Ok(apply_proposal(request, response)),
        }
    }

    async fn poll(&self, request: &mut RebalanceRequest) -> Result<Step> {
        let Some(token) = request.status.session_token.clone() else {
            return Ok(Step::Move(
                RebalancePhase::NotReady,
                Some("rebalance has no session token to resume".to_string()),
            ));
        };

        let status = self.engine.poll_job(&token).await?;
        match status.phase {
            JobPhase::Active | JobPhase::InExecution => Ok(Step::Stay),
            JobPhase::Done => {
                request.status.session_token = None;
                if status.result.is_some() {
                    request.status.optimization_result = status.result;
                }
                Ok(Step::Move(RebalancePhase::Ready, None))
            }
            JobPhase::Error => {
                request.status.session_token = None;
                Ok(Step::Move(
                    RebalancePhase::NotReady,
                    status
                        .message
                        .or_else(|| Some("rebalance execution failed".to_string())),
                ))
            }
        }
    }

    async fn cancel_outstanding(&self, request: &mut RebalanceRequest) -> Result<()> {
        if let Some(token) = request.status.session_token.take() {
            self.engine.cancel_job(&token).await?;
            tracing::info!(
                cluster = %request.cluster,
                rebalance = %request.name,
                session_token = %token,
                "cancelled engine job"
            );
        }
        Ok(())
    }

    fn proposal_request(&self, request: &RebalanceRequest, dry_run: bool) -> Result<ProposalRequest> {
        let spec = &request.spec;
        if let Some(goals) = &spec.goals {
            if !spec.skip_hard_goal_check {
                let missing = missing_hard_goals(goals, &self.hard_goals);
                if !missing.is_empty() {
                    return Err(Error::Validation(format!(
                        "rebalance {} requests goals {:?} which omit the hard goals {:?}; add them or set skipHardGoalCheck",
                        request.name, goals, missing
                    )));
                }
            }
        }

        Ok(ProposalRequest {
            mode: spec.mode,
            target_members: spec.target_members.clone(),
            goals: spec.goals.clone(),
            skip_hard_goal_check: spec.skip_hard_goal_check,
            dry_run,
            options: spec.options.clone(),
        })
    }
}

/// Hard goals that do not appear in `goals`, in configured order.
pub fn missing_hard_goals(goals: &[String], hard_goals: &[String]) -> Vec<String> {
    hard_goals
        .iter()
        .filter(|hard| !goals.contains(hard))
        .cloned()
        .collect()
}

fn apply_proposal(request: &mut RebalanceRequest, response: ProposalResponse) -> Step {
    match response.phase {
        ProposalPhase::Ready => {
            request.status.session_token = None;
            request.status.optimization_result = response.result;
            Step::Move(RebalancePhase::ProposalReady, None)
        }
        ProposalPhase::Computing => {
            request.status.session_token = response.session_token;
            Step::Move(RebalancePhase::PendingProposal, None)
        }
        ProposalPhase::InsufficientData => {
            request.status.session_token = None;
            Step::Move(
                RebalancePhase::PendingProposal,
                response
                    .message
                    .or_else(|| Some("waiting for enough metric samples".to_string())),
            )
        }
        ProposalPhase::BadGoals => {
            request.status.session_token = None;
            Step::Move(RebalancePhase::NotReady, response.message)
        }
    }
}

fn invalid(directive: &Directive, phase: RebalancePhase) -> Step {
    Step::Invalid(format!("directive {directive} has no effect in phase {phase}"))
}

fn unrecognized(directive: &Directive) -> Step {
    Step::Invalid(format!("unrecognized directive {directive}"))
}

/// Replace the condition when the phase or its reason changes.
fn set_phase(
    request: &mut RebalanceRequest,
    phase: RebalancePhase,
    reason: Option<String>,
    message: Option<String>,
) {
    let unchanged = request.status.phase == phase
        && request
            .status
            .condition
            .as_ref()
            .is_some_and(|c| c.reason == reason && c.message == message);
    request.status.phase = phase;
    if unchanged {
        return;
    }
    request.status.condition = Some(Condition {
        kind: phase,
        reason,
        message,
        last_transition_time: now_seconds(),
    });
}
