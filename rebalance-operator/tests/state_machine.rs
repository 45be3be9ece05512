mod common;

use std::sync::Arc;

use common::{goals, HARD_GOALS};
use rebalance_operator::error::Error;
use rebalance_operator::rebalance::{ProposalPhase, ProposalResponse, RebalanceStateMachine};
use rebalance_operator::test_utils::FakeEngine;
use rebalance_operator::types::{RebalanceMode, RebalancePhase, RebalanceRequest, RebalanceSpec};

fn machine(engine: &Arc<FakeEngine>) -> RebalanceStateMachine {
    RebalanceStateMachine::new(engine.clone(), goals(&HARD_GOALS))
}

fn full_rebalance() -> RebalanceRequest {
    RebalanceRequest::new("my-cluster", "my-rebalance", RebalanceSpec::default())
}

fn with_directive(mut request: RebalanceRequest, directive: &str) -> RebalanceRequest {
    request.directive = Some(directive.to_string());
    request
}

#[tokio::test]
async fn new_request_gets_a_ready_proposal() {
    let engine = FakeEngine::new();
    let transition = machine(&engine).reconcile(&full_rebalance()).await.unwrap();

    assert_eq!(transition.from, RebalancePhase::New);
    assert_eq!(transition.to, RebalancePhase::ProposalReady);
    assert!(transition.request.status.optimization_result.is_some());
    assert_eq!(transition.request.status.session_token, None);
    assert_eq!(transition.request.status.observed_generation, 1);

    let submissions = engine.submissions().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0.mode, RebalanceMode::Full);
    assert!(submissions[0].0.dry_run);
}

#[tokio::test]
async fn computing_proposal_is_resumed_with_its_token() {
    let engine = FakeEngine::new();
    let computing = FakeEngine::computing();
    let token = computing.session_token.clone().unwrap();
    engine.script_proposal(computing).await;

    let sm = machine(&engine);
    let pending = sm.reconcile(&full_rebalance()).await.unwrap();
    assert_eq!(pending.to, RebalancePhase::PendingProposal);
    assert_eq!(pending.request.status.session_token.as_deref(), Some(token.as_str()));

    let ready = sm.reconcile(&pending.request).await.unwrap();
    assert_eq!(ready.to, RebalancePhase::ProposalReady);
    assert_eq!(ready.request.status.session_token, None);

    let submissions = engine.submissions().await;
    assert_eq!(submissions[1].1.as_deref(), Some(token.as_str()));
}

#[tokio::test]
async fn insufficient_data_waits_in_pending() {
    let engine = FakeEngine::new();
    engine.script_proposal(FakeEngine::insufficient_data()).await;

    let transition = machine(&engine).reconcile(&full_rebalance()).await.unwrap();
    assert_eq!(transition.to, RebalancePhase::PendingProposal);
    assert_eq!(transition.request.status.session_token, None);
    assert!(transition.request.status.optimization_result.is_none());
}

#[tokio::test]
async fn missing_hard_goals_fail_validation() {
    let engine = FakeEngine::new();
    let mut request = full_rebalance();
    request.spec.goals = Some(goals(&["A", "B", "C"]));

    let err = machine(&engine).reconcile(&request).await.unwrap_err();
    match err {
        Error::Validation(message) => {
            assert!(message.contains("RackAwareGoal"));
            assert!(message.contains("CpuCapacityGoal"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(engine.submissions().await.is_empty());

    request.spec.skip_hard_goal_check = true;
    let transition = machine(&engine).reconcile(&request).await.unwrap();
    assert_eq!(transition.to, RebalancePhase::ProposalReady);
    let submissions = engine.submissions().await;
    assert_eq!(submissions[0].0.goals, Some(goals(&["A", "B", "C"])));
    assert!(submissions[0].0.skip_hard_goal_check);
}

#[tokio::test]
async fn engine_rejecting_goals_is_not_ready() {
    let engine = FakeEngine::new();
    engine
        .script_proposal(ProposalResponse {
            message: Some("Missing hard goals".to_string()),
            ..ProposalResponse::new(ProposalPhase::BadGoals)
        })
        .await;

    let transition = machine(&engine).reconcile(&full_rebalance()).await.unwrap();
    assert_eq!(transition.to, RebalancePhase::NotReady);
    let condition = transition.request.status.condition.unwrap();
    assert_eq!(condition.kind, RebalancePhase::NotReady);
    assert_eq!(condition.message.as_deref(), Some("Missing hard goals"));
}

#[tokio::test]
async fn proposal_waits_for_approval() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;

    let unchanged = sm.reconcile(&ready).await.unwrap();
    assert_eq!(unchanged.to, RebalancePhase::ProposalReady);
    assert_eq!(unchanged.request, ready);

    let approved = sm.reconcile(&with_directive(ready, "approve")).await.unwrap();
    assert_eq!(approved.to, RebalancePhase::Rebalancing);
    assert!(approved.request.status.session_token.is_some());
    assert_eq!(approved.request.directive, None);
    assert_eq!(engine.executions_submitted().await, 1);
}

#[tokio::test]
async fn auto_approval_executes_without_directive() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let mut request = full_rebalance();
    request.spec.auto_approval = true;

    let ready = sm.reconcile(&request).await.unwrap().request;
    let executing = sm.reconcile(&ready).await.unwrap();
    assert_eq!(executing.to, RebalancePhase::Rebalancing);
}

#[tokio::test]
async fn approve_with_insufficient_data_goes_back_to_pending() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;

    engine.script_execution(FakeEngine::insufficient_data()).await;
    let transition = sm.reconcile(&with_directive(ready, "approve")).await.unwrap();
    assert_eq!(transition.to, RebalancePhase::PendingProposal);
    assert_eq!(transition.request.status.session_token, None);
}

#[tokio::test]
async fn execution_runs_until_done() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;
    let token = rebalancing.status.session_token.clone().unwrap();

    let still = sm.reconcile(&rebalancing).await.unwrap();
    assert_eq!(still.to, RebalancePhase::Rebalancing);
    assert_eq!(still.request.status.session_token.as_deref(), Some(token.as_str()));

    engine.complete_job(&token).await;
    let done = sm.reconcile(&still.request).await.unwrap();
    assert_eq!(done.to, RebalancePhase::Ready);
    assert_eq!(done.request.status.session_token, None);
    assert!(done.request.status.optimization_result.is_some());
}

#[tokio::test]
async fn failed_execution_is_not_ready() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;

    engine
        .fail_job(rebalancing.status.session_token.as_deref().unwrap())
        .await;
    let failed = sm.reconcile(&rebalancing).await.unwrap();
    assert_eq!(failed.to, RebalancePhase::NotReady);
    assert_eq!(failed.request.status.session_token, None);
}

#[tokio::test]
async fn rebalancing_without_token_is_not_ready() {
    let engine = FakeEngine::new();
    let mut request = full_rebalance();
    request.status.phase = RebalancePhase::Rebalancing;

    let transition = machine(&engine).reconcile(&request).await.unwrap();
    assert_eq!(transition.to, RebalancePhase::NotReady);
}

#[tokio::test]
async fn stop_cancels_execution() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;
    let token = rebalancing.status.session_token.clone().unwrap();

    let stopped = sm
        .reconcile(&with_directive(rebalancing, "stop"))
        .await
        .unwrap();
    assert_eq!(stopped.to, RebalancePhase::Stopped);
    assert_eq!(stopped.request.status.session_token, None);
    assert_eq!(engine.cancelled().await, vec![token]);
    assert!(engine.running_jobs().await.is_empty());
}

#[tokio::test]
async fn stop_pending_proposal() {
    let engine = FakeEngine::new();
    engine.script_proposal(FakeEngine::computing()).await;
    let sm = machine(&engine);
    let pending = sm.reconcile(&full_rebalance()).await.unwrap().request;

    let stopped = sm.reconcile(&with_directive(pending, "stop")).await.unwrap();
    assert_eq!(stopped.to, RebalancePhase::Stopped);
    assert_eq!(engine.cancelled().await.len(), 1);
}

#[tokio::test]
async fn refresh_restarts_terminal_requests() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    for phase in [
        RebalancePhase::Ready,
        RebalancePhase::NotReady,
        RebalancePhase::Stopped,
    ] {
        let mut request = full_rebalance();
        request.status.phase = phase;

        let idle = sm.reconcile(&request).await.unwrap();
        assert_eq!(idle.to, phase);

        let refreshed = sm
            .reconcile(&with_directive(request, "refresh"))
            .await
            .unwrap();
        assert_eq!(refreshed.to, RebalancePhase::ProposalReady);
    }
}

#[tokio::test]
async fn refresh_while_rebalancing_cancels_first() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;
    let token = rebalancing.status.session_token.clone().unwrap();

    let refreshed = sm
        .reconcile(&with_directive(rebalancing, "refresh"))
        .await
        .unwrap();
    assert_eq!(refreshed.to, RebalancePhase::ProposalReady);
    assert_eq!(engine.cancelled().await, vec![token]);
    assert!(engine.running_jobs().await.is_empty());
}

#[tokio::test]
async fn unrecognized_directive_is_reported_and_cleared() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;

    let transition = sm
        .reconcile(&with_directive(ready, "approved"))
        .await
        .unwrap();
    assert_eq!(transition.to, RebalancePhase::ProposalReady);
    assert_eq!(transition.request.directive, None);
    let condition = transition.request.status.condition.unwrap();
    assert_eq!(condition.reason.as_deref(), Some("InvalidAnnotation"));
    assert_eq!(engine.executions_submitted().await, 0);
}

#[tokio::test]
async fn approve_while_rebalancing_is_invalid() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;

    let transition = sm
        .reconcile(&with_directive(rebalancing, "approve"))
        .await
        .unwrap();
    assert_eq!(transition.to, RebalancePhase::Rebalancing);
    assert_eq!(
        transition.request.status.condition.unwrap().reason.as_deref(),
        Some("InvalidAnnotation")
    );
    assert_eq!(engine.executions_submitted().await, 1);
}

#[tokio::test]
async fn template_is_never_driven() {
    let engine = FakeEngine::new();
    let template = with_directive(full_rebalance(), "template");

    let transition = machine(&engine).reconcile(&template).await.unwrap();
    assert_eq!(transition.request, template);
    assert!(engine.submissions().await.is_empty());
}

#[tokio::test]
async fn engine_outage_keeps_phase() {
    let engine = FakeEngine::new();
    engine.set_unavailable(true);

    let err = machine(&engine).reconcile(&full_rebalance()).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
}

#[tokio::test]
async fn member_modes_carry_targets() {
    let engine = FakeEngine::new();
    let request = RebalanceRequest::new(
        "my-cluster",
        "scale-out",
        RebalanceSpec {
            mode: RebalanceMode::AddMembers,
            target_members: vec![5, 6],
            ..Default::default()
        },
    );

    machine(&engine).reconcile(&request).await.unwrap();
    let submissions = engine.submissions().await;
    assert_eq!(submissions[0].0.mode, RebalanceMode::AddMembers);
    assert_eq!(submissions[0].0.target_members, vec![5, 6]);
}

#[tokio::test]
async fn rejected_refresh_keeps_running_job() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;
    let mut rebalancing = sm
        .reconcile(&with_directive(ready, "approve"))
        .await
        .unwrap()
        .request;
    let token = rebalancing.status.session_token.clone().unwrap();

    rebalancing.spec.goals = Some(goals(&["A", "B", "C"]));
    let err = sm
        .reconcile(&with_directive(rebalancing, "refresh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.cancelled().await.is_empty());
    assert_eq!(engine.running_jobs().await, vec![token]);
}

#[tokio::test]
async fn rejected_refresh_keeps_pending_proposal() {
    let engine = FakeEngine::new();
    engine.script_proposal(FakeEngine::computing()).await;
    let sm = machine(&engine);
    let mut pending = sm.reconcile(&full_rebalance()).await.unwrap().request;

    pending.spec.goals = Some(goals(&["A"]));
    let err = sm
        .reconcile(&with_directive(pending, "refresh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.cancelled().await.is_empty());
    assert_eq!(engine.submissions().await.len(), 1);
}

#[tokio::test]
async fn refresh_recomputes_ready_proposal() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;

    let refreshed = sm
        .reconcile(&with_directive(ready.clone(), "refresh"))
        .await
        .unwrap();
    assert_eq!(refreshed.to, RebalancePhase::ProposalReady);
    assert!(refreshed.request.status.optimization_result.is_some());
    assert_eq!(refreshed.request.directive, None);

    engine.script_proposal(FakeEngine::computing()).await;
    let pending = sm
        .reconcile(&with_directive(ready, "refresh"))
        .await
        .unwrap();
    assert_eq!(pending.to, RebalancePhase::PendingProposal);
    assert!(pending.request.status.optimization_result.is_none());
    assert!(pending.request.status.session_token.is_some());

    let submissions = engine.submissions().await;
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|(request, _)| request.dry_run));
}

#[tokio::test]
async fn stop_new_request() {
    let engine = FakeEngine::new();
    let stopped = machine(&engine)
        .reconcile(&with_directive(full_rebalance(), "stop"))
        .await
        .unwrap();

    assert_eq!(stopped.to, RebalancePhase::Stopped);
    assert_eq!(stopped.request.directive, None);
    assert!(engine.submissions().await.is_empty());
    assert!(engine.cancelled().await.is_empty());
}

#[tokio::test]
async fn stop_ready_proposal() {
    let engine = FakeEngine::new();
    let sm = machine(&engine);
    let ready = sm.reconcile(&full_rebalance()).await.unwrap().request;

    let stopped = sm.reconcile(&with_directive(ready, "stop")).await.unwrap();
    assert_eq!(stopped.to, RebalancePhase::Stopped);
    assert_eq!(engine.executions_submitted().await, 0);
    assert!(engine.cancelled().await.is_empty());
}
