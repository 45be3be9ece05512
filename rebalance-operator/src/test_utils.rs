//! In-memory collaborators for exercising whole reconcile passes.
//!
//! `InMemoryStore` mimics etcd's per-key versions, `FakeEngine` plays a
//! scripted optimization engine and `FakeInUseChecker` answers membership
//! queries from a fixed set.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use coordination_store::Versioned;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::rebalance::engine::{
    EngineConnector, EngineHandle, JobPhase, JobStatus, MembersInUseChecker, OptimizationEngine,
    ProposalPhase, ProposalRequest, ProposalResponse,
};
use crate::store::ResourceStore;
use crate::types::{Cluster, MemberId, NodePool, OptimizationSpec, RebalanceRequest};

// ── Store ───────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    clusters: BTreeMap<String, Versioned<Cluster>>,
    pools: BTreeMap<(String, String), Versioned<NodePool>>,
    rebalances: BTreeMap<(String, String), Versioned<RebalanceRequest>>,
    /// Concurrent edits applied just before upcoming `update_rebalance` calls.
    /// `Some` also attaches that directive.
    rebalance_edits: VecDeque<Option<String>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    /// Upcoming `commit_pools` calls that lose against a simulated concurrent edit.
    pool_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

fn bump<T>(slot: Option<&Versioned<T>>, value: T) -> Versioned<T> {
    Versioned::new(value, slot.map_or(1, |v| v.version + 1))
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_cluster(&self, cluster: Cluster) {
        let mut state = self.state.lock().await;
        let next = bump(state.clusters.get(&cluster.name), cluster.clone());
        state.clusters.insert(cluster.name, next);
    }

    pub async fn put_pool(&self, pool: NodePool) {
        let mut state = self.state.lock().await;
        let key = (pool.cluster.clone(), pool.name.clone());
        let next = bump(state.pools.get(&key), pool);
        state.pools.insert(key, next);
    }

    /// Overwrite a request as a user would, bumping its version.
    pub async fn put_rebalance(&self, request: RebalanceRequest) {
        let mut state = self.state.lock().await;
        let key = (request.cluster.clone(), request.name.clone());
        let next = bump(state.rebalances.get(&key), request);
        state.rebalances.insert(key, next);
    }

    pub async fn cluster(&self, name: &str) -> Option<Cluster> {
        let state = self.state.lock().await;
        state.clusters.get(name).map(|v| v.value.clone())
    }

    pub async fn pool(&self, cluster: &str, name: &str) -> Option<NodePool> {
        let state = self.state.lock().await;
        state
            .pools
            .get(&(cluster.to_string(), name.to_string()))
            .map(|v| v.value.clone())
    }

    pub async fn rebalance(&self, cluster: &str, name: &str) -> Option<RebalanceRequest> {
        let state = self.state.lock().await;
        state
            .rebalances
            .get(&(cluster.to_string(), name.to_string()))
            .map(|v| v.value.clone())
    }

    pub async fn rebalance_names(&self, cluster: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .rebalances
            .keys()
            .filter(|(c, _)| c == cluster)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Change a pool's desired replica count.
    pub async fn scale_pool(&self, cluster: &str, name: &str, replicas: u32) {
        if let Some(mut pool) = self.pool(cluster, name).await {
            pool.replicas = replicas;
            self.put_pool(pool).await;
        }
    }

    /// Attach a directive to a request.
    pub async fn set_directive(&self, cluster: &str, name: &str, directive: &str) {
        if let Some(mut request) = self.rebalance(cluster, name).await {
            request.directive = Some(directive.to_string());
            self.put_rebalance(request).await;
        }
    }

    pub fn inject_pool_conflicts(&self, count: usize) {
        self.pool_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` request writes lose against an edit that
    /// changes nothing but the version.
    pub async fn inject_rebalance_conflicts(&self, count: usize) {
        let mut state = self.state.lock().await;
        state.rebalance_edits.extend(std::iter::repeat(None).take(count));
    }

    /// Make the next request write lose against a user attaching `directive`.
    pub async fn inject_rebalance_directive(&self, directive: &str) {
        let mut state = self.state.lock().await;
        state.rebalance_edits.push_back(Some(directive.to_string()));
    }

    /// Number of conditional writes that succeeded.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self, ok: bool) -> bool {
        if ok {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn list_clusters(&self) -> Result<Vec<Versioned<Cluster>>> {
        Ok(self.state.lock().await.clusters.values().cloned().collect())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Versioned<Cluster>>> {
        Ok(self.state.lock().await.clusters.get(name).cloned())
    }

    async fn replace_cluster(&self, cluster: &Cluster, version: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let current = state.clusters.get(&cluster.name).map_or(0, |v| v.version);
        if current != version {
            return Ok(false);
        }
        state.clusters.insert(
            cluster.name.clone(),
            Versioned::new(cluster.clone(), version + 1),
        );
        Ok(self.record_write(true))
    }

    async fn list_pools(&self, cluster: &str) -> Result<Vec<Versioned<NodePool>>> {
        let state = self.state.lock().await;
        Ok(state
            .pools
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn commit_pools(
        &self,
        read: &[Versioned<NodePool>],
        updated: &[NodePool],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;

        let conflicts = self.pool_conflicts.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.pool_conflicts.store(conflicts - 1, Ordering::SeqCst);
            // Somebody else touched the first pool in the meantime.
            if let Some(first) = read.first() {
                let key = (first.value.cluster.clone(), first.value.name.clone());
                if let Some(slot) = state.pools.get_mut(&key) {
                    slot.version += 1;
                }
            }
        }

        let unchanged = read.iter().all(|pool| {
            let key = (pool.value.cluster.clone(), pool.value.name.clone());
            state.pools.get(&key).map_or(0, |v| v.version) == pool.version
        });
        if !unchanged {
            return Ok(false);
        }

        for pool in updated {
            let key = (pool.cluster.clone(), pool.name.clone());
            let next = bump(state.pools.get(&key), pool.clone());
            state.pools.insert(key, next);
        }
        Ok(self.record_write(true))
    }

    async fn get_rebalance(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<Versioned<RebalanceRequest>>> {
        let state = self.state.lock().await;
        Ok(state
            .rebalances
            .get(&(cluster.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_rebalances(&self, cluster: &str) -> Result<Vec<Versioned<RebalanceRequest>>> {
        let state = self.state.lock().await;
        Ok(state
            .rebalances
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create_rebalance(&self, request: &RebalanceRequest) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (request.cluster.clone(), request.name.clone());
        if state.rebalances.contains_key(&key) {
            return Ok(false);
        }
        state
            .rebalances
            .insert(key, Versioned::new(request.clone(), 1));
        Ok(self.record_write(true))
    }

    async fn update_rebalance(&self, request: &RebalanceRequest, version: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (request.cluster.clone(), request.name.clone());
        if let Some(edit) = state.rebalance_edits.pop_front() {
            if let Some(slot) = state.rebalances.get_mut(&key) {
                slot.version += 1;
                if let Some(directive) = edit {
                    slot.value.directive = Some(directive);
                }
            }
        }
        match state.rebalances.get(&key) {
            Some(current) if current.version == version => {
                state
                    .rebalances
                    .insert(key, Versioned::new(request.clone(), version + 1));
                Ok(self.record_write(true))
            }
            _ => Ok(false),
        }
    }

    async fn delete_rebalance(&self, cluster: &str, name: &str, version: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (cluster.to_string(), name.to_string());
        match state.rebalances.get(&key) {
            Some(current) if current.version == version => {
                state.rebalances.remove(&key);
                Ok(self.record_write(true))
            }
            _ => Ok(false),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    /// Scripted answers for dry-run submissions, oldest first.
    proposals: VecDeque<ProposalResponse>,
    /// Scripted answers for executions, oldest first.
    executions: VecDeque<ProposalResponse>,
    jobs: HashMap<String, JobPhase>,
    submissions: Vec<(ProposalRequest, Option<String>)>,
    cancelled: Vec<String>,
}

/// Scripted optimization engine.
///
/// Without a script, a dry run returns a ready proposal and an execution
/// starts a job that stays `InExecution` until [`FakeEngine::complete_job`].
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    unavailable: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script_proposal(&self, response: ProposalResponse) {
        self.state.lock().await.proposals.push_back(response);
    }

    pub async fn script_execution(&self, response: ProposalResponse) {
        self.state.lock().await.executions.push_back(response);
    }

    /// A `Computing` response carrying a fresh token.
    pub fn computing() -> ProposalResponse {
        ProposalResponse {
            session_token: Some(Uuid::new_v4().to_string()),
            ..ProposalResponse::new(ProposalPhase::Computing)
        }
    }

    pub fn insufficient_data() -> ProposalResponse {
        ProposalResponse {
            message: Some("NotEnoughValidWindowsException".to_string()),
            ..ProposalResponse::new(ProposalPhase::InsufficientData)
        }
    }

    pub async fn complete_job(&self, token: &str) {
        self.state
            .lock()
            .await
            .jobs
            .insert(token.to_string(), JobPhase::Done);
    }

    pub async fn fail_job(&self, token: &str) {
        self.state
            .lock()
            .await
            .jobs
            .insert(token.to_string(), JobPhase::Error);
    }

    /// Mark every running job as done.
    pub async fn complete_all(&self) {
        let mut state = self.state.lock().await;
        for phase in state.jobs.values_mut() {
            if matches!(phase, JobPhase::Active | JobPhase::InExecution) {
                *phase = JobPhase::Done;
            }
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn submissions(&self) -> Vec<(ProposalRequest, Option<String>)> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn executions_submitted(&self) -> usize {
        self.state
            .lock()
            .await
            .submissions
            .iter()
            .filter(|(request, _)| !request.dry_run)
            .count()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    /// Tokens of jobs that are still running.
    pub async fn running_jobs(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut tokens: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, phase)| matches!(phase, JobPhase::Active | JobPhase::InExecution))
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Engine("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OptimizationEngine for FakeEngine {
    async fn submit_proposal(
        &self,
        request: &ProposalRequest,
        session_token: Option<&str>,
    ) -> Result<ProposalResponse> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .submissions
            .push((request.clone(), session_token.map(str::to_string)));

        if request.dry_run {
            return Ok(state.proposals.pop_front().unwrap_or_else(|| ProposalResponse {
                result: Some(json!({"numReplicaMovements": request.target_members.len()})),
                ..ProposalResponse::new(ProposalPhase::Ready)
            }));
        }

        let response = state.executions.pop_front().unwrap_or_else(|| ProposalResponse {
            session_token: Some(Uuid::new_v4().to_string()),
            ..ProposalResponse::new(ProposalPhase::Ready)
        });
        if let Some(token) = &response.session_token {
            if matches!(response.phase, ProposalPhase::Ready | ProposalPhase::Computing) {
                state.jobs.insert(token.clone(), JobPhase::InExecution);
            }
        }
        Ok(response)
    }

    async fn poll_job(&self, session_token: &str) -> Result<JobStatus> {
        self.check_available()?;
        let state = self.state.lock().await;
        let phase = state
            .jobs
            .get(session_token)
            .copied()
            .ok_or_else(|| Error::Engine(format!("unknown user task {session_token}")))?;
        Ok(JobStatus {
            phase,
            result: (phase == JobPhase::Done).then(|| json!({"executed": true})),
            message: (phase == JobPhase::Error).then(|| "execution failed".to_string()),
        })
    }

    async fn cancel_job(&self, session_token: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.cancelled.push(session_token.to_string());
        state.jobs.remove(session_token);
        Ok(())
    }
}

// ── In-use checker ──────────────────────────────────────────────

#[derive(Default)]
pub struct FakeInUseChecker {
    in_use: Mutex<BTreeSet<MemberId>>,
    calls: AtomicUsize,
}

impl FakeInUseChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_in_use(&self, members: impl IntoIterator<Item = MemberId>) {
        *self.in_use.lock().await = members.into_iter().collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembersInUseChecker for FakeInUseChecker {
    async fn members_in_use(&self, candidates: &BTreeSet<MemberId>) -> Result<BTreeSet<MemberId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let in_use = self.in_use.lock().await;
        Ok(candidates.intersection(&in_use).copied().collect())
    }
}

/// Hands out the same fakes for every cluster.
pub struct FakeConnector {
    pub engine: Arc<FakeEngine>,
    pub in_use: Arc<FakeInUseChecker>,
}

impl FakeConnector {
    pub fn new(engine: Arc<FakeEngine>, in_use: Arc<FakeInUseChecker>) -> Arc<Self> {
        Arc::new(Self { engine, in_use })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            engine: self.engine.clone(),
            in_use: self.in_use.clone(),
        }
    }
}

impl EngineConnector for FakeConnector {
    fn connect(&self, _optimization: &OptimizationSpec) -> Result<EngineHandle> {
        Ok(self.handle())
    }
}
