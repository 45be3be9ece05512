use std::collections::BTreeSet;
use std::sync::Arc;

use coordination_store::util::now_seconds;
use coordination_store::Versioned;
use metrics::counter;

use crate::error::{Error, Result};
use crate::metrics_consts::{
    AUTO_REBALANCE_PREEMPTED_COUNTER, AUTO_REBALANCE_REQUESTS_CREATED_COUNTER,
    AUTO_REBALANCE_STATE_COUNTER,
};
use crate::rebalance::engine::EngineHandle;
use crate::store::ResourceStore;
use crate::types::{
    AutoRebalanceMode, AutoRebalanceModeConfig, AutoRebalanceState, AutoRebalanceStatus, Cluster,
    Directive, MemberId, RebalancePhase, RebalanceRequest, RebalanceSpec,
};

/// Name of the request the coordinator owns for `mode`.
pub fn auto_rebalance_name(cluster: &str, mode: AutoRebalanceMode) -> String {
    format!("{cluster}-auto-rebalancing-{mode}")
}

/// Turns member-set changes between passes into add/remove rebalance requests.
pub struct AutoRebalanceCoordinator {
    store: Arc<dyn ResourceStore>,
    engine: EngineHandle,
}

/// Work decided from reads only. Nothing is written until config is validated.
#[derive(Default)]
struct Plan {
    /// Finished requests to delete.
    finished: Vec<Versioned<RebalanceRequest>>,
    /// In-flight requests to stop and delete.
    cancelled: Vec<Versioned<RebalanceRequest>>,
}

impl AutoRebalanceCoordinator {
    pub fn new(store: Arc<dyn ResourceStore>, engine: EngineHandle) -> Self {
        Self { store, engine }
    }

    /// Run one coordination pass for `cluster`, whose data-holding members
    /// are now `members`.
    ///
    /// Returns `None` when auto-rebalancing is not configured, in which case
    /// the cluster status must not carry an auto-rebalance section.
    pub async fn reconcile(
        &self,
        cluster: &Cluster,
        members: &BTreeSet<MemberId>,
    ) -> Result<Option<AutoRebalanceStatus>> {
        let Some(configs) = cluster
            .spec
            .optimization
            .as_ref()
            .and_then(|o| o.auto_rebalance.as_ref())
        else {
            return Ok(None);
        };

        let current = cluster.status.auto_rebalance.clone().unwrap_or_default();
        let Some(previous) = cluster.status.registered_members.as_ref() else {
            // First sight of this cluster: nothing to compare against yet.
            return Ok(Some(current));
        };

        let added: BTreeSet<MemberId> = members.difference(previous).copied().collect();
        let removed: BTreeSet<MemberId> = previous.difference(members).copied().collect();

        let mut status = current.clone();
        let mut plan = Plan::default();

        self.observe_tracked(cluster, &mut status, &mut plan).await?;

        if !removed.is_empty() {
            self.plan_scale_down(cluster, &removed, &mut status, &mut plan)
                .await?;
        }

        if !added.is_empty() {
            let mut targets = status
                .members(AutoRebalanceMode::AddMembers)
                .cloned()
                .unwrap_or_default();
            targets.extend(added.iter().copied());
            tracing::info!(
                cluster = %cluster.name,
                added = ?added,
                targets = ?targets,
                "members added, rebalance on scale up"
            );
            status.set_members(AutoRebalanceMode::AddMembers, targets);
        }

        // Validate every mode that needs a request before writing anything.
        let mut specs = Vec::new();
        for mode in self.modes_to_ensure(&status) {
            let config = mode_config(configs, mode)?;
            let spec = self.request_spec(cluster, config).await?;
            specs.push((mode, spec));
        }

        for finished in plan.finished {
            self.delete(finished).await?;
        }
        for cancelled in plan.cancelled {
            self.cancel(cancelled).await?;
        }
        for (mode, spec) in specs {
            let targets = status.members(mode).cloned().unwrap_or_default();
            self.ensure_request(cluster, mode, spec, &targets).await?;
        }

        let state = derive_state(&status);
        if state != current.state {
            tracing::info!(
                cluster = %cluster.name,
                from = ?current.state,
                to = ?state,
                "auto-rebalance state changed"
            );
            counter!(AUTO_REBALANCE_STATE_COUNTER, "state" => state_label(state)).increment(1);
            status.state = state;
            status.last_transition_time = now_seconds();
        }

        Ok(Some(status))
    }

    /// Drop modes whose request finished, and report the ones that failed.
    async fn observe_tracked(
        &self,
        cluster: &Cluster,
        status: &mut AutoRebalanceStatus,
        plan: &mut Plan,
    ) -> Result<()> {
        for tracked in status.modes.clone() {
            let name = auto_rebalance_name(&cluster.name, tracked.mode);
            let Some(request) = self.store.get_rebalance(&cluster.name, &name).await? else {
                continue;
            };
            match request.value.phase() {
                RebalancePhase::Ready => {
                    tracing::info!(
                        cluster = %cluster.name,
                        mode = %tracked.mode,
                        members = ?tracked.members,
                        "auto-rebalance finished"
                    );
                    status.drop_mode(tracked.mode);
                    plan.finished.push(request);
                }
                RebalancePhase::NotReady | RebalancePhase::Stopped => {
                    tracing::warn!(
                        cluster = %cluster.name,
                        rebalance = %name,
                        phase = %request.value.phase(),
                        "auto-rebalance is not progressing, waiting for a refresh"
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn plan_scale_down(
        &self,
        cluster: &Cluster,
        removed: &BTreeSet<MemberId>,
        status: &mut AutoRebalanceStatus,
        plan: &mut Plan,
    ) -> Result<()> {
        let in_use = self.engine.in_use.members_in_use(removed).await?;
        tracing::info!(
            cluster = %cluster.name,
            removed = ?removed,
            in_use = ?in_use,
            "members removed"
        );

        if !in_use.is_empty() {
            let mut targets = status
                .members(AutoRebalanceMode::RemoveMembers)
                .cloned()
                .unwrap_or_default();
            targets.extend(in_use.iter().copied());
            status.set_members(AutoRebalanceMode::RemoveMembers, targets);
        }

        let Some(add_targets) = status.members(AutoRebalanceMode::AddMembers).cloned() else {
            return Ok(());
        };

        let remaining: BTreeSet<MemberId> = add_targets.difference(removed).copied().collect();
        let scaling_down = status.is_tracked(AutoRebalanceMode::RemoveMembers);

        if scaling_down {
            if add_targets == in_use {
                tracing::info!(
                    cluster = %cluster.name,
                    members = ?add_targets,
                    "scale down removes exactly the members being added, cancelling add-members rebalance"
                );
            } else {
                let shared: BTreeSet<MemberId> = add_targets.intersection(&in_use).copied().collect();
                if !shared.is_empty() {
                    tracing::warn!(
                        cluster = %cluster.name,
                        shared = ?shared,
                        queued = ?remaining,
                        "scale down partially overlaps in-flight add-members rebalance"
                    );
                }
            }
        } else if remaining == add_targets {
            return Ok(());
        }

        // Either a scale down preempts the add, or the add lost all its targets.
        if scaling_down || remaining.is_empty() {
            let name = auto_rebalance_name(&cluster.name, AutoRebalanceMode::AddMembers);
            if let Some(request) = self.store.get_rebalance(&cluster.name, &name).await? {
                plan.cancelled.push(request);
            }
        }

        if remaining.is_empty() {
            status.drop_mode(AutoRebalanceMode::AddMembers);
        } else {
            status.set_members(AutoRebalanceMode::AddMembers, remaining);
        }
        Ok(())
    }

    /// Modes that need a live request. Add waits while a scale down is pending.
    fn modes_to_ensure(&self, status: &AutoRebalanceStatus) -> Vec<AutoRebalanceMode> {
        if status.is_tracked(AutoRebalanceMode::RemoveMembers) {
            vec![AutoRebalanceMode::RemoveMembers]
        } else if status.is_tracked(AutoRebalanceMode::AddMembers) {
            vec![AutoRebalanceMode::AddMembers]
        } else {
            Vec::new()
        }
    }

    async fn request_spec(
        &self,
        cluster: &Cluster,
        config: &AutoRebalanceModeConfig,
    ) -> Result<RebalanceSpec> {
        let mut spec = RebalanceSpec {
            mode: config.mode.rebalance_mode(),
            auto_approval: true,
            ..Default::default()
        };

        if let Some(template_name) = &config.template {
            let template = self
                .store
                .get_rebalance(&cluster.name, template_name)
                .await?
                .filter(|t| t.value.is_template())
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "The rebalance template {template_name} for mode {} was not found",
                        config.mode
                    ))
                })?;
            spec.goals = template.value.spec.goals.clone();
            spec.skip_hard_goal_check = template.value.spec.skip_hard_goal_check;
            spec.options = template.value.spec.options.clone();
        }

        Ok(spec)
    }

    /// Create the request for `mode`, or retarget the existing one.
    async fn ensure_request(
        &self,
        cluster: &Cluster,
        mode: AutoRebalanceMode,
        spec: RebalanceSpec,
        targets: &BTreeSet<MemberId>,
    ) -> Result<()> {
        let name = auto_rebalance_name(&cluster.name, mode);
        let target_members: Vec<MemberId> = targets.iter().copied().collect();

        match self.store.get_rebalance(&cluster.name, &name).await? {
            None => {
                let request = RebalanceRequest::new(
                    &cluster.name,
                    &name,
                    RebalanceSpec {
                        target_members,
                        ..spec
                    },
                );
                if !self.store.create_rebalance(&request).await? {
                    return Err(Error::Conflict(format!("rebalance {name}")));
                }
                tracing::info!(
                    cluster = %cluster.name,
                    rebalance = %name,
                    targets = ?targets,
                    "created auto-rebalance request"
                );
                counter!(AUTO_REBALANCE_REQUESTS_CREATED_COUNTER, "mode" => mode.as_str())
                    .increment(1);
            }
            Some(existing) if existing.value.spec.target_members != target_members => {
                let mut request = existing.value;
                request.spec.target_members = target_members;
                request.generation += 1;
                request.directive = Some(Directive::REFRESH.to_string());
                if !self.store.update_rebalance(&request, existing.version).await? {
                    return Err(Error::Conflict(format!("rebalance {name}")));
                }
                tracing::info!(
                    cluster = %cluster.name,
                    rebalance = %name,
                    targets = ?targets,
                    "retargeted auto-rebalance request"
                );
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn delete(&self, request: Versioned<RebalanceRequest>) -> Result<()> {
        let RebalanceRequest { cluster, name, .. } = &request.value;
        if !self
            .store
            .delete_rebalance(cluster, name, request.version)
            .await?
        {
            return Err(Error::Conflict(format!("rebalance {name}")));
        }
        Ok(())
    }

    /// Stop the engine job first, then delete the request tracking it.
    async fn cancel(&self, request: Versioned<RebalanceRequest>) -> Result<()> {
        if let Some(token) = &request.value.status.session_token {
            self.engine.engine.cancel_job(token).await?;
        }
        tracing::info!(
            cluster = %request.value.cluster,
            rebalance = %request.value.name,
            phase = %request.value.phase(),
            "cancelled auto-rebalance request"
        );
        counter!(AUTO_REBALANCE_PREEMPTED_COUNTER).increment(1);
        self.delete(request).await
    }
}

fn mode_config(
    configs: &[AutoRebalanceModeConfig],
    mode: AutoRebalanceMode,
) -> Result<&AutoRebalanceModeConfig> {
    configs.iter().find(|c| c.mode == mode).ok_or_else(|| {
        Error::Configuration(format!(
            "No auto-rebalancing configuration specified for mode {mode}"
        ))
    })
}

pub fn derive_state(status: &AutoRebalanceStatus) -> AutoRebalanceState {
    if status.is_tracked(AutoRebalanceMode::RemoveMembers) {
        AutoRebalanceState::RebalanceOnScaleDown
    } else if status.is_tracked(AutoRebalanceMode::AddMembers) {
        AutoRebalanceState::RebalanceOnScaleUp
    } else {
        AutoRebalanceState::Idle
    }
}

fn state_label(state: AutoRebalanceState) -> &'static str {
    match state {
        AutoRebalanceState::Idle => "idle",
        AutoRebalanceState::RebalanceOnScaleUp => "scale_up",
        AutoRebalanceState::RebalanceOnScaleDown => "scale_down",
    }
}
