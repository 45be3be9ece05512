use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coordination_store::leader_election::{run_as_leader, LeaderElectionConfig};
use metrics::gauge;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::health::OperatorHealth;
use crate::metrics_consts::IS_LEADER_GAUGE;
use crate::reconciler::ClusterReconciler;
use crate::store::ResourceStore;

/// Outcome of reconciling every known cluster once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// The level-triggered driver: while leader, reconcile every cluster on a
/// fixed interval, each cluster in its own task.
pub struct Operator {
    store: Arc<dyn ResourceStore>,
    reconciler: ClusterReconciler,
    interval: Duration,
    health: OperatorHealth,
    leading: AtomicBool,
}

impl Operator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        reconciler: ClusterReconciler,
        interval: Duration,
        health: OperatorHealth,
    ) -> Self {
        Self {
            store,
            reconciler,
            interval,
            health,
            leading: AtomicBool::new(false),
        }
    }

    /// Campaign for leadership and drive clusters while elected, until `cancel`.
    pub async fn run(
        &self,
        client: etcd_client::Client,
        election: LeaderElectionConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.health.set_ready(true);
        tokio::select! {
            result = run_as_leader(client, election, cancel.clone(), |term| self.lead(term)) => result,
            _ = self.standby_heartbeat(cancel.clone()) => Ok(()),
        }
    }

    /// Keep liveness fresh while another instance leads.
    async fn standby_heartbeat(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.leading.load(Ordering::Relaxed) {
                        self.health.report_alive();
                    }
                }
            }
        }
    }

    /// One leadership term.
    pub async fn lead(&self, term: CancellationToken) -> Result<()> {
        self.leading.store(true, Ordering::Relaxed);
        gauge!(IS_LEADER_GAUGE).set(1.0);
        tracing::info!(interval = ?self.interval, "leading, starting reconcile loop");

        let mut ticker = tokio::time::interval(self.interval);
        let result = loop {
            tokio::select! {
                _ = term.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    match self.reconcile_all().await {
                        Ok(summary) => {
                            tracing::debug!(
                                succeeded = summary.succeeded,
                                failed = summary.failed,
                                "reconcile tick finished"
                            );
                            self.health.report_alive();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to list clusters");
                        }
                    }
                }
            }
        };

        gauge!(IS_LEADER_GAUGE).set(0.0);
        self.leading.store(false, Ordering::Relaxed);
        result
    }

    /// Reconcile every cluster once, concurrently, one task per cluster.
    pub async fn reconcile_all(&self) -> Result<PassSummary> {
        let clusters = self.store.list_clusters().await?;

        let mut tasks = JoinSet::new();
        for cluster in clusters {
            let reconciler = self.reconciler.clone();
            let name = cluster.value.name;
            tasks.spawn(async move { reconciler.run_pass(&name).await });
        }

        let mut summary = PassSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => summary.succeeded += 1,
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "reconcile task panicked");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
