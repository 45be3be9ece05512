use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use coordination_store::Versioned;
use metrics::{counter, histogram};

use crate::allocator::{allocate, data_members};
use crate::coordinator::AutoRebalanceCoordinator;
use crate::error::{Error, Result};
use crate::metrics_consts::{
    ALLOCATION_CONFLICTS_COUNTER, MEMBER_IDS_CHANGED_COUNTER, REBALANCE_WRITE_CONFLICTS_COUNTER,
    RECONCILE_DURATION_HISTOGRAM, RECONCILE_ERRORS_COUNTER, RECONCILE_PASSES_COUNTER,
};
use crate::rebalance::engine::{EngineConnector, EngineHandle};
use crate::rebalance::state_machine::RebalanceStateMachine;
use crate::store::ResourceStore;
use crate::types::{AutoRebalanceStatus, Cluster, MemberId, NodePool, RebalanceRequest};

/// Runs complete reconcile passes for single clusters.
///
/// A pass allocates member IDs, lets the coordinator react to membership
/// changes, drives every rebalance request of the cluster one step, then
/// records what it saw in the cluster status.
#[derive(Clone)]
pub struct ClusterReconciler {
    store: Arc<dyn ResourceStore>,
    connector: Arc<dyn EngineConnector>,
    hard_goals: Vec<String>,
    cas_max_attempts: u32,
}

impl ClusterReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        connector: Arc<dyn EngineConnector>,
        hard_goals: Vec<String>,
        cas_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            connector,
            hard_goals,
            cas_max_attempts: cas_max_attempts.max(1),
        }
    }

    /// [`Self::reconcile_cluster`] with pass metrics and error logging.
    pub async fn run_pass(&self, cluster: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.reconcile_cluster(cluster).await;
        histogram!(RECONCILE_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => {
                counter!(RECONCILE_PASSES_COUNTER, "outcome" => "ok").increment(1);
            }
            Err(e) => {
                counter!(RECONCILE_PASSES_COUNTER, "outcome" => "error").increment(1);
                counter!(RECONCILE_ERRORS_COUNTER, "error" => e.kind()).increment(1);
                tracing::error!(cluster, error = %e, "reconcile pass failed");
            }
        }
        result
    }

    pub async fn reconcile_cluster(&self, name: &str) -> Result<()> {
        let Some(Versioned {
            value: cluster,
            version,
        }) = self.store.get_cluster(name).await?
        else {
            return Err(Error::NotFound(format!("cluster {name}")));
        };

        let pools = self.allocate_members(name).await?;
        let members = data_members(&pools);

        let handle = match &cluster.spec.optimization {
            Some(optimization) => Some(self.connector.connect(optimization)?),
            None => None,
        };

        let auto_rebalance = match &handle {
            Some(handle) => {
                AutoRebalanceCoordinator::new(self.store.clone(), handle.clone())
                    .reconcile(&cluster, &members)
                    .await?
            }
            None => None,
        };

        let driven = match &handle {
            Some(handle) => self.drive_rebalances(&cluster, handle).await,
            None => {
                self.warn_undriven(&cluster).await?;
                Ok(())
            }
        };

        self.write_status(cluster, version, members, auto_rebalance)
            .await?;
        driven
    }

    /// Advance a single request by one step.
    pub async fn reconcile_rebalance(&self, cluster: &str, name: &str) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(cluster)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster {cluster}")))?
            .value;
        let optimization = cluster.spec.optimization.as_ref().ok_or_else(|| {
            Error::Configuration(format!(
                "cluster {} has no optimization engine configured",
                cluster.name
            ))
        })?;
        let handle = self.connector.connect(optimization)?;
        let request = self
            .store
            .get_rebalance(&cluster.name, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rebalance {name}")))?;
        self.step(&handle, request).await
    }

    /// Allocate member IDs and commit every pool of the cluster atomically,
    /// re-reading and retrying when a concurrent edit wins.
    async fn allocate_members(&self, cluster: &str) -> Result<Vec<NodePool>> {
        for attempt in 1..=self.cas_max_attempts {
            let mut read = self.store.list_pools(cluster).await?;
            read.sort_by(|a, b| a.value.name.cmp(&b.value.name));

            let current: Vec<NodePool> = read.iter().map(|p| p.value.clone()).collect();
            let allocations = allocate(&current)?;

            let mut next = Vec::with_capacity(current.len());
            let mut changed = Vec::new();
            for (pool, allocation) in current.iter().zip(&allocations) {
                let updated = allocation.apply(pool);
                if !allocation.is_unchanged() {
                    tracing::info!(
                        cluster,
                        pool = %pool.name,
                        added = ?allocation.added,
                        removed = ?allocation.removed,
                        "member ids changed"
                    );
                    changed.push(updated.clone());
                }
                next.push(updated);
            }

            if changed.is_empty() {
                return Ok(next);
            }

            if self.store.commit_pools(&read, &changed).await? {
                let added: usize = allocations.iter().map(|a| a.added.len()).sum();
                let removed: usize = allocations.iter().map(|a| a.removed.len()).sum();
                counter!(MEMBER_IDS_CHANGED_COUNTER, "direction" => "added").increment(added as u64);
                counter!(MEMBER_IDS_CHANGED_COUNTER, "direction" => "removed")
                    .increment(removed as u64);
                return Ok(next);
            }

            counter!(ALLOCATION_CONFLICTS_COUNTER).increment(1);
            tracing::warn!(cluster, attempt, "pools changed during allocation, retrying");
        }

        Err(Error::Conflict(format!(
            "pools of cluster {cluster} after {} attempts",
            self.cas_max_attempts
        )))
    }

    /// Step every non-template request. One failing request does not stop
    /// the others; the first error is returned.
    async fn drive_rebalances(&self, cluster: &Cluster, handle: &EngineHandle) -> Result<()> {
        let mut first_error = None;
        for request in self.store.list_rebalances(&cluster.name).await? {
            if request.value.is_template() {
                continue;
            }
            let name = request.value.name.clone();
            if let Err(e) = self.step(handle, request).await {
                tracing::warn!(
                    cluster = %cluster.name,
                    rebalance = %name,
                    error = %e,
                    "rebalance step failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn step(&self, handle: &EngineHandle, request: Versioned<RebalanceRequest>) -> Result<()> {
        let machine = RebalanceStateMachine::new(handle.engine.clone(), self.hard_goals.clone());
        let transition = machine.reconcile(&request.value).await?;
        if transition.request == request.value {
            return Ok(());
        }
        self.persist_step(handle, &request.value, transition.request, request.version)
            .await
    }

    /// Write a stepped request. A lost compare-and-swap re-applies the new
    /// status onto the fresh version, so a job started during the step keeps
    /// its session token. If the request cannot be written at all, a job
    /// started by this step is cancelled.
    async fn persist_step(
        &self,
        handle: &EngineHandle,
        read: &RebalanceRequest,
        mut next: RebalanceRequest,
        mut version: i64,
    ) -> Result<()> {
        for attempt in 1..=self.cas_max_attempts {
            if self.store.update_rebalance(&next, version).await? {
                return Ok(());
            }
            counter!(REBALANCE_WRITE_CONFLICTS_COUNTER).increment(1);
            tracing::warn!(
                cluster = %next.cluster,
                rebalance = %next.name,
                attempt,
                "rebalance changed during step, re-applying status"
            );

            match self.store.get_rebalance(&next.cluster, &next.name).await? {
                Some(fresh) => {
                    next = merge_step(read, next, fresh.value);
                    version = fresh.version;
                }
                None => {
                    self.abandon_started_job(handle, read, &next).await;
                    return Err(Error::NotFound(format!("rebalance {}", next.name)));
                }
            }
        }

        self.abandon_started_job(handle, read, &next).await;
        Err(Error::Conflict(format!(
            "rebalance {} after {} attempts",
            next.name, self.cas_max_attempts
        )))
    }

    async fn abandon_started_job(
        &self,
        handle: &EngineHandle,
        read: &RebalanceRequest,
        next: &RebalanceRequest,
    ) {
        let Some(token) = next.status.session_token.as_deref() else {
            return;
        };
        if read.status.session_token.as_deref() == Some(token) {
            return;
        }
        match handle.engine.cancel_job(token).await {
            Ok(()) => tracing::warn!(
                cluster = %next.cluster,
                rebalance = %next.name,
                session_token = token,
                "cancelled engine job whose status could not be recorded"
            ),
            Err(e) => tracing::error!(
                cluster = %next.cluster,
                rebalance = %next.name,
                session_token = token,
                error = %e,
                "failed to cancel engine job whose status could not be recorded"
            ),
        }
    }

    async fn warn_undriven(&self, cluster: &Cluster) -> Result<()> {
        let pending = self
            .store
            .list_rebalances(&cluster.name)
            .await?
            .into_iter()
            .filter(|r| !r.value.is_template())
            .count();
        if pending > 0 {
            tracing::warn!(
                cluster = %cluster.name,
                pending,
                "cluster has rebalance requests but no optimization engine"
            );
        }
        Ok(())
    }

    async fn write_status(
        &self,
        mut cluster: Cluster,
        version: i64,
        members: BTreeSet<MemberId>,
        auto_rebalance: Option<AutoRebalanceStatus>,
    ) -> Result<()> {
        let before = cluster.status.clone();
        cluster.status.registered_members = Some(members);
        cluster.status.auto_rebalance = auto_rebalance;
        cluster.status.observed_generation = cluster.generation;
        if cluster.status == before {
            return Ok(());
        }
        if !self.store.replace_cluster(&cluster, version).await? {
            return Err(Error::Conflict(format!("cluster {}", cluster.name)));
        }
        Ok(())
    }
}

/// Carry the status produced by a step over to a version written concurrently.
///
/// The concurrent writer owns the spec. The directive is cleared only if it is
/// still the one the step consumed; a newly attached one is kept for the next
/// pass.
fn merge_step(
    read: &RebalanceRequest,
    stepped: RebalanceRequest,
    mut fresh: RebalanceRequest,
) -> RebalanceRequest {
    fresh.status = stepped.status;
    if fresh.directive == read.directive {
        fresh.directive = stepped.directive;
    }
    fresh
}
