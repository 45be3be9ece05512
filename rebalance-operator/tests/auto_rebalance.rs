mod common;

use std::collections::BTreeSet;

use common::{auto_rebalancing_cluster, broker_pool, ids, Harness, BROKERS, CLUSTER};
use rebalance_operator::error::Error;
use rebalance_operator::types::{
    AutoRebalanceMode, AutoRebalanceModeConfig, AutoRebalanceState, NodeRole, RebalanceMode,
    RebalancePhase, RebalanceRequest, RebalanceSpec,
};

#[tokio::test]
async fn first_pass_only_records_members() {
    let harness = Harness::with_brokers(5).await;

    let cluster = harness.cluster().await;
    assert_eq!(cluster.status.registered_members, Some(ids(&[0, 1, 2, 3, 4])));
    assert_eq!(cluster.status.observed_generation, 1);
    let status = cluster.status.auto_rebalance.unwrap();
    assert_eq!(status.state, AutoRebalanceState::Idle);
    assert!(status.modes.is_empty());
    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
}

#[tokio::test]
async fn scale_down_rebalances_members_in_use() {
    let harness = Harness::with_brokers(5).await;
    harness.in_use.set_in_use([3, 4]).await;

    harness.scale(3).await;
    harness.pass().await.unwrap();

    assert_eq!(harness.members().await, ids(&[0, 1, 2]));
    let status = harness.auto_rebalance().await;
    assert_eq!(status.state, AutoRebalanceState::RebalanceOnScaleDown);
    assert_eq!(
        status.members(AutoRebalanceMode::RemoveMembers),
        Some(&ids(&[3, 4]))
    );

    let request = harness
        .auto_request(AutoRebalanceMode::RemoveMembers)
        .await
        .unwrap();
    assert_eq!(request.spec.mode, RebalanceMode::RemoveMembers);
    assert_eq!(request.spec.target_members, vec![3, 4]);
    assert!(request.spec.auto_approval);

    harness.run_until_idle(6).await;
    let status = harness.auto_rebalance().await;
    assert_eq!(status.state, AutoRebalanceState::Idle);
    assert!(status.modes.is_empty());
    assert!(harness
        .auto_request(AutoRebalanceMode::RemoveMembers)
        .await
        .is_none());
}

#[tokio::test]
async fn scale_down_of_empty_members_needs_no_rebalance() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(4).await;
    harness.pass().await.unwrap();

    assert_eq!(harness.in_use.calls(), 1);
    assert_eq!(harness.auto_rebalance().await.state, AutoRebalanceState::Idle);
    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
}

#[tokio::test]
async fn repeated_scale_up_retargets_one_request() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(7).await;
    harness.pass().await.unwrap();

    let request = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(request.spec.target_members, vec![5, 6]);
    assert_eq!(request.status.phase, RebalancePhase::ProposalReady);
    assert_eq!(
        harness.auto_rebalance().await.state,
        AutoRebalanceState::RebalanceOnScaleUp
    );

    harness.scale(9).await;
    harness.pass().await.unwrap();

    assert_eq!(harness.store.rebalance_names(CLUSTER).await.len(), 1);
    let request = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(request.spec.target_members, vec![5, 6, 7, 8]);
    assert_eq!(request.generation, 2);
    // The refresh was consumed in the same pass and produced a new proposal.
    assert_eq!(request.directive, None);
    let submissions = harness.engine.submissions().await;
    let (last, _) = submissions.last().unwrap();
    assert!(last.dry_run);
    assert_eq!(last.target_members, vec![5, 6, 7, 8]);
    assert_eq!(
        harness.auto_rebalance().await.members(AutoRebalanceMode::AddMembers),
        Some(&ids(&[5, 6, 7, 8]))
    );
}

#[tokio::test]
async fn scale_back_down_replaces_in_flight_add() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(7).await;
    harness.pass().await.unwrap();
    harness.pass().await.unwrap();

    let add = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(add.status.phase, RebalancePhase::Rebalancing);
    let token = add.status.session_token.clone().unwrap();

    harness.in_use.set_in_use([5, 6]).await;
    harness.scale(5).await;
    harness.pass().await.unwrap();

    assert!(harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .is_none());
    assert_eq!(harness.engine.cancelled().await, vec![token]);

    let remove = harness
        .auto_request(AutoRebalanceMode::RemoveMembers)
        .await
        .unwrap();
    assert_eq!(remove.spec.target_members, vec![5, 6]);

    let status = harness.auto_rebalance().await;
    assert_eq!(status.state, AutoRebalanceState::RebalanceOnScaleDown);
    assert!(!status.is_tracked(AutoRebalanceMode::AddMembers));
}

#[tokio::test]
async fn partial_overlap_queues_remaining_add_until_scale_down_finishes() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(7).await;
    harness.pass().await.unwrap();

    // Shrink by one: member 6 goes, member 5 stays new.
    harness.in_use.set_in_use([6]).await;
    harness.scale(6).await;
    harness.pass().await.unwrap();

    let status = harness.auto_rebalance().await;
    assert_eq!(status.state, AutoRebalanceState::RebalanceOnScaleDown);
    assert_eq!(
        status.members(AutoRebalanceMode::AddMembers),
        Some(&ids(&[5]))
    );
    assert!(harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .is_none());

    // Scale down finishes, then the queued add is recreated for member 5.
    for _ in 0..4 {
        harness.engine.complete_all().await;
        harness.pass().await.unwrap();
        if harness
            .auto_request(AutoRebalanceMode::AddMembers)
            .await
            .is_some()
        {
            break;
        }
    }
    let add = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .expect("queued add request recreated");
    assert_eq!(add.spec.target_members, vec![5]);
    assert_eq!(
        harness.auto_rebalance().await.state,
        AutoRebalanceState::RebalanceOnScaleUp
    );

    harness.run_until_idle(6).await;
}

#[tokio::test]
async fn scale_up_then_unused_scale_down_drops_add() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(7).await;
    harness.pass().await.unwrap();

    harness.scale(5).await;
    harness.pass().await.unwrap();

    assert!(harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .is_none());
    assert_eq!(harness.auto_rebalance().await.state, AutoRebalanceState::Idle);
}

#[tokio::test]
async fn missing_mode_config_fails_without_side_effects() {
    let harness = Harness::new();
    let mut cluster = auto_rebalancing_cluster();
    cluster.spec.optimization.as_mut().unwrap().auto_rebalance =
        Some(vec![AutoRebalanceModeConfig {
            mode: AutoRebalanceMode::RemoveMembers,
            template: None,
        }]);
    harness.store.put_cluster(cluster).await;
    harness.store.put_pool(broker_pool(BROKERS, 3)).await;
    harness.pass().await.unwrap();

    harness.scale(4).await;
    let err = harness.pass().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(
        err.to_string(),
        "No auto-rebalancing configuration specified for mode add-members"
    );

    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
    // The delta is not recorded, so the next pass sees it again.
    assert_eq!(
        harness.cluster().await.status.registered_members,
        Some(ids(&[0, 1, 2]))
    );
}

#[tokio::test]
async fn template_supplies_goals() {
    let harness = Harness::new();
    let mut cluster = auto_rebalancing_cluster();
    cluster.spec.optimization.as_mut().unwrap().auto_rebalance =
        Some(vec![AutoRebalanceModeConfig {
            mode: AutoRebalanceMode::AddMembers,
            template: Some("add-template".to_string()),
        }]);
    harness.store.put_cluster(cluster).await;
    harness.store.put_pool(broker_pool(BROKERS, 3)).await;

    let mut template = RebalanceRequest::new(
        CLUSTER,
        "add-template",
        RebalanceSpec {
            goals: Some(common::goals(&["DiskCapacityGoal"])),
            skip_hard_goal_check: true,
            ..Default::default()
        },
    );
    template.directive = Some("template".to_string());
    harness.store.put_rebalance(template.clone()).await;

    harness.pass().await.unwrap();
    harness.scale(4).await;
    harness.pass().await.unwrap();

    let request = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(request.spec.goals, Some(common::goals(&["DiskCapacityGoal"])));
    assert!(request.spec.skip_hard_goal_check);
    assert_eq!(request.status.phase, RebalancePhase::ProposalReady);

    // The template itself is never driven and keeps its directive.
    let stored = harness.store.rebalance(CLUSTER, "add-template").await.unwrap();
    assert_eq!(stored, template);
}

#[tokio::test]
async fn missing_template_is_configuration_error() {
    let harness = Harness::new();
    let mut cluster = auto_rebalancing_cluster();
    for config in cluster
        .spec
        .optimization
        .as_mut()
        .unwrap()
        .auto_rebalance
        .as_mut()
        .unwrap()
    {
        config.template = Some("nope".to_string());
    }
    harness.store.put_cluster(cluster).await;
    harness.store.put_pool(broker_pool(BROKERS, 3)).await;
    harness.pass().await.unwrap();

    harness.scale(4).await;
    let err = harness.pass().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("nope"));
    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
}

#[tokio::test]
async fn failed_rebalance_stays_tracked() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(6).await;
    harness.pass().await.unwrap();
    harness.pass().await.unwrap();

    let token = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap()
        .status
        .session_token
        .unwrap();
    harness.engine.fail_job(&token).await;
    harness.pass().await.unwrap();
    harness.pass().await.unwrap();

    let request = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(request.status.phase, RebalancePhase::NotReady);
    assert_eq!(
        harness.auto_rebalance().await.state,
        AutoRebalanceState::RebalanceOnScaleUp
    );
}

#[tokio::test]
async fn vanished_request_is_recreated() {
    let harness = Harness::with_brokers(5).await;

    harness.scale(6).await;
    harness.pass().await.unwrap();

    let name = rebalance_operator::coordinator::auto_rebalance_name(
        CLUSTER,
        AutoRebalanceMode::AddMembers,
    );
    let version = {
        use rebalance_operator::store::ResourceStore;
        harness
            .store
            .get_rebalance(CLUSTER, &name)
            .await
            .unwrap()
            .unwrap()
            .version
    };
    {
        use rebalance_operator::store::ResourceStore;
        assert!(harness
            .store
            .delete_rebalance(CLUSTER, &name, version)
            .await
            .unwrap());
    }

    harness.pass().await.unwrap();
    let request = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(request.spec.target_members, vec![5]);
}

#[tokio::test]
async fn controller_pools_do_not_count() {
    let harness = Harness::with_brokers(3).await;

    let mut controllers = broker_pool("controllers", 3);
    controllers.roles = BTreeSet::from([NodeRole::Controller]);
    harness.store.put_pool(controllers).await;
    harness.pass().await.unwrap();

    assert_eq!(
        harness
            .store
            .pool(CLUSTER, "controllers")
            .await
            .unwrap()
            .member_ids,
        ids(&[3, 4, 5])
    );
    assert_eq!(harness.auto_rebalance().await.state, AutoRebalanceState::Idle);
    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
}

#[tokio::test]
async fn no_auto_rebalance_status_without_optimization() {
    let harness = Harness::new();
    let mut cluster = auto_rebalancing_cluster();
    cluster.spec.optimization = None;
    harness.store.put_cluster(cluster).await;
    harness.store.put_pool(broker_pool(BROKERS, 3)).await;

    harness.pass().await.unwrap();
    harness.scale(5).await;
    harness.pass().await.unwrap();

    let cluster = harness.cluster().await;
    assert!(cluster.status.auto_rebalance.is_none());
    assert_eq!(cluster.status.registered_members, Some(ids(&[0, 1, 2, 3, 4])));
    assert!(harness.store.rebalance_names(CLUSTER).await.is_empty());
}

#[tokio::test]
async fn unchanged_membership_is_idempotent() {
    let harness = Harness::with_brokers(5).await;
    let writes = harness.store.writes();

    for _ in 0..3 {
        harness.pass().await.unwrap();
    }
    assert_eq!(harness.store.writes(), writes);
    assert!(harness.engine.submissions().await.is_empty());

    // Same while a scale-up job is executing.
    harness.scale(7).await;
    harness.pass().await.unwrap();
    harness.pass().await.unwrap();
    let before = harness
        .auto_request(AutoRebalanceMode::AddMembers)
        .await
        .unwrap();
    assert_eq!(before.status.phase, RebalancePhase::Rebalancing);
    let writes = harness.store.writes();
    let submissions = harness.engine.submissions().await.len();

    for _ in 0..3 {
        harness.pass().await.unwrap();
    }
    assert_eq!(harness.store.writes(), writes);
    assert_eq!(harness.engine.submissions().await.len(), submissions);
    assert_eq!(
        harness.auto_request(AutoRebalanceMode::AddMembers).await,
        Some(before)
    );
}
