use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::id_range::parse_member_ids;
use crate::types::{MemberId, NodePool};

/// Outcome of allocating member IDs for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAllocation {
    pub pool: String,
    pub member_ids: BTreeSet<MemberId>,
    pub added: BTreeSet<MemberId>,
    pub removed: BTreeSet<MemberId>,
    /// The pool's `addIds` directive was used by a growth and must be cleared.
    pub consumed_add_ids: bool,
    /// The pool's `removeIds` directive was used by a shrink and must be cleared.
    pub consumed_remove_ids: bool,
}

impl PoolAllocation {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && !self.consumed_add_ids
            && !self.consumed_remove_ids
    }

    /// Apply the allocation to a copy of `pool`, clearing consumed directives.
    pub fn apply(&self, pool: &NodePool) -> NodePool {
        let mut next = pool.clone();
        next.member_ids = self.member_ids.clone();
        if self.consumed_add_ids {
            next.add_ids = None;
        }
        if self.consumed_remove_ids {
            next.remove_ids = None;
        }
        next
    }
}

struct Plan<'a> {
    pool: &'a NodePool,
    add_ids: Vec<MemberId>,
    remove_ids: Vec<MemberId>,
    member_ids: BTreeSet<MemberId>,
    added: BTreeSet<MemberId>,
    removed: BTreeSet<MemberId>,
}

impl Plan<'_> {
    fn desired(&self) -> usize {
        self.pool.replicas as usize
    }

    fn growth(&self) -> usize {
        self.desired().saturating_sub(self.pool.member_ids.len())
    }

    fn shrink(&self) -> usize {
        self.pool.member_ids.len().saturating_sub(self.desired())
    }
}

/// Compute the member-ID sets of every pool of one cluster.
///
/// Pools are handled in name order. Growth takes directive IDs first and fills
/// the rest with the smallest IDs unused anywhere in the cluster. Directive
/// IDs of all growing pools are reserved before any fill. Shrink drops
/// directive IDs first, then the highest assigned IDs. IDs freed by a shrink
/// are not handed out again in the same pass.
///
/// Results are returned in the order of `pools`.
pub fn allocate(pools: &[NodePool]) -> Result<Vec<PoolAllocation>> {
    let mut plans = Vec::with_capacity(pools.len());
    for pool in pools {
        plans.push(Plan {
            pool,
            add_ids: parse_directive(pool.add_ids.as_deref())?,
            remove_ids: parse_directive(pool.remove_ids.as_deref())?,
            member_ids: pool.member_ids.clone(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        });
    }

    let mut order: Vec<usize> = (0..plans.len()).collect();
    order.sort_by(|a, b| plans[*a].pool.name.cmp(&plans[*b].pool.name));

    let mut used: BTreeSet<MemberId> = pools
        .iter()
        .flat_map(|p| p.member_ids.iter().copied())
        .collect();

    // Reserve explicitly requested IDs.
    for &i in &order {
        let plan = &mut plans[i];
        let growth = plan.growth();
        let wanted: Vec<MemberId> = plan.add_ids.clone();
        for id in wanted {
            if plan.added.len() == growth {
                break;
            }
            if used.insert(id) {
                plan.added.insert(id);
            }
        }
    }

    for &i in &order {
        let plan = &mut plans[i];
        let shrink = plan.shrink();
        if shrink == 0 {
            continue;
        }
        for id in plan.remove_ids.clone() {
            if plan.removed.len() == shrink {
                break;
            }
            if plan.member_ids.contains(&id) {
                plan.removed.insert(id);
            }
        }
        let highest: Vec<MemberId> = plan
            .member_ids
            .iter()
            .rev()
            .filter(|id| !plan.removed.contains(id))
            .take(shrink - plan.removed.len())
            .copied()
            .collect();
        plan.removed.extend(highest);
        let removed = plan.removed.clone();
        plan.member_ids.retain(|id| !removed.contains(id));
    }

    for &i in &order {
        let plan = &mut plans[i];
        let growth = plan.growth();
        let mut candidate: MemberId = 0;
        while plan.added.len() < growth {
            if used.insert(candidate) {
                plan.added.insert(candidate);
            }
            candidate += 1;
        }
        let added = plan.added.clone();
        plan.member_ids.extend(added);
    }

    let allocations: Vec<PoolAllocation> = plans
        .into_iter()
        .map(|plan| PoolAllocation {
            pool: plan.pool.name.clone(),
            consumed_add_ids: plan.pool.add_ids.is_some() && plan.growth() > 0,
            consumed_remove_ids: plan.pool.remove_ids.is_some() && plan.shrink() > 0,
            member_ids: plan.member_ids,
            added: plan.added,
            removed: plan.removed,
        })
        .collect();

    verify(pools, &allocations)?;
    Ok(allocations)
}

fn parse_directive(raw: Option<&str>) -> Result<Vec<MemberId>> {
    match raw {
        Some(raw) => parse_member_ids(raw),
        None => Ok(Vec::new()),
    }
}

fn verify(pools: &[NodePool], allocations: &[PoolAllocation]) -> Result<()> {
    let mut seen: BTreeSet<MemberId> = BTreeSet::new();
    for (pool, allocation) in pools.iter().zip(allocations) {
        if allocation.member_ids.len() != pool.replicas as usize {
            return Err(Error::AllocationConflict(format!(
                "pool {} has {} member ids but wants {} replicas",
                pool.name,
                allocation.member_ids.len(),
                pool.replicas
            )));
        }
        for id in &allocation.member_ids {
            if !seen.insert(*id) {
                return Err(Error::AllocationConflict(format!(
                    "member id {id} of pool {} is assigned to another pool",
                    pool.name
                )));
            }
        }
    }
    Ok(())
}

/// Union of member IDs over pools that hold data.
pub fn data_members<'a>(pools: impl IntoIterator<Item = &'a NodePool>) -> BTreeSet<MemberId> {
    pools
        .into_iter()
        .filter(|p| p.holds_data())
        .flat_map(|p| p.member_ids.iter().copied())
        .collect()
}
