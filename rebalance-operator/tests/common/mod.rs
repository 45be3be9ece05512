#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use rebalance_operator::coordinator::auto_rebalance_name;
use rebalance_operator::error::Result;
use rebalance_operator::reconciler::ClusterReconciler;
use rebalance_operator::test_utils::{FakeConnector, FakeEngine, FakeInUseChecker, InMemoryStore};
use rebalance_operator::types::{
    AutoRebalanceMode, AutoRebalanceModeConfig, AutoRebalanceState, AutoRebalanceStatus, Cluster,
    ClusterSpec, ClusterStatus, MemberId, NodePool, NodeRole, OptimizationSpec, RebalanceRequest,
};

pub const CLUSTER: &str = "my-cluster";
pub const BROKERS: &str = "brokers";

pub const HARD_GOALS: [&str; 7] = [
    "RackAwareGoal",
    "MinTopicLeadersPerBrokerGoal",
    "ReplicaCapacityGoal",
    "DiskCapacityGoal",
    "NetworkInboundCapacityGoal",
    "NetworkOutboundCapacityGoal",
    "CpuCapacityGoal",
];

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub engine: Arc<FakeEngine>,
    pub in_use: Arc<FakeInUseChecker>,
    pub connector: Arc<FakeConnector>,
    pub reconciler: ClusterReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let engine = FakeEngine::new();
        let in_use = FakeInUseChecker::new();
        let connector = FakeConnector::new(engine.clone(), in_use.clone());
        let reconciler = reconciler(&store, &connector);
        Self {
            store,
            engine,
            in_use,
            connector,
            reconciler,
        }
    }

    /// A fresh reconciler over the same store and engine, as after a restart.
    pub fn restart(&mut self) {
        self.reconciler = reconciler(&self.store, &self.connector);
    }

    /// Cluster with auto-rebalancing on and one broker pool of `brokers`
    /// members, already past its first pass.
    pub async fn with_brokers(brokers: u32) -> Self {
        let harness = Self::new();
        harness.store.put_cluster(auto_rebalancing_cluster()).await;
        harness.store.put_pool(broker_pool(BROKERS, brokers)).await;
        harness.pass().await.expect("first pass");
        harness
    }

    pub async fn pass(&self) -> Result<()> {
        self.reconciler.reconcile_cluster(CLUSTER).await
    }

    /// Run passes until the auto-rebalance state is idle, completing engine
    /// jobs along the way.
    pub async fn run_until_idle(&self, max_passes: usize) {
        for _ in 0..max_passes {
            self.engine.complete_all().await;
            self.pass().await.expect("pass");
            if self.auto_rebalance().await.state == AutoRebalanceState::Idle
                && self.store.rebalance_names(CLUSTER).await.is_empty()
            {
                return;
            }
        }
        panic!("cluster did not settle within {max_passes} passes");
    }

    pub async fn scale(&self, replicas: u32) {
        self.store.scale_pool(CLUSTER, BROKERS, replicas).await;
    }

    pub async fn cluster(&self) -> Cluster {
        self.store.cluster(CLUSTER).await.expect("cluster exists")
    }

    pub async fn auto_rebalance(&self) -> AutoRebalanceStatus {
        self.cluster()
            .await
            .status
            .auto_rebalance
            .expect("auto-rebalance status")
    }

    pub async fn auto_request(&self, mode: AutoRebalanceMode) -> Option<RebalanceRequest> {
        self.store
            .rebalance(CLUSTER, &auto_rebalance_name(CLUSTER, mode))
            .await
    }

    pub async fn members(&self) -> BTreeSet<MemberId> {
        self.store
            .pool(CLUSTER, BROKERS)
            .await
            .expect("pool exists")
            .member_ids
    }
}

fn reconciler(store: &Arc<InMemoryStore>, connector: &Arc<FakeConnector>) -> ClusterReconciler {
    ClusterReconciler::new(
        store.clone(),
        connector.clone(),
        HARD_GOALS.iter().map(|g| g.to_string()).collect(),
        3,
    )
}

pub fn auto_rebalancing_cluster() -> Cluster {
    Cluster {
        name: CLUSTER.to_string(),
        generation: 1,
        spec: ClusterSpec {
            optimization: Some(OptimizationSpec {
                endpoint: "http://cruise-control:9090".to_string(),
                auto_rebalance: Some(vec![
                    AutoRebalanceModeConfig {
                        mode: AutoRebalanceMode::AddMembers,
                        template: None,
                    },
                    AutoRebalanceModeConfig {
                        mode: AutoRebalanceMode::RemoveMembers,
                        template: None,
                    },
                ]),
            }),
        },
        status: ClusterStatus::default(),
    }
}

pub fn broker_pool(name: &str, replicas: u32) -> NodePool {
    NodePool {
        name: name.to_string(),
        cluster: CLUSTER.to_string(),
        roles: BTreeSet::from([NodeRole::Broker]),
        replicas,
        member_ids: BTreeSet::new(),
        add_ids: None,
        remove_ids: None,
    }
}

pub fn ids(values: &[MemberId]) -> BTreeSet<MemberId> {
    values.iter().copied().collect()
}

pub fn goals(names: &[&str]) -> Vec<String> {
    names.iter().map(|g| g.to_string()).collect()
}
