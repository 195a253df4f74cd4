//! Migration Policies
//!
//! After each step every node asks its policy which of its agents should
//! move. Policies see the same cluster-wide loads on every node, so a policy
//! that derives its plan only from the view proposes consistent moves.

use sim_kernel::{AgentCollection, StepSummary};
use sim_types::{Identity, Migration, NodeId, TimePoint};
use std::collections::BTreeMap;

/// What a node knows when proposing migrations.
pub struct ClusterView<'a> {
    pub node: NodeId,
    pub size: usize,
    pub step: &'a StepSummary,
    pub agents: &'a AgentCollection,
    pub locations: &'a BTreeMap<Identity, NodeId>,
    /// Local agent count of every node, in rank order.
    pub loads: &'a [u64],
}

pub trait MigrationPolicy: Send {
    /// Migrations of local agents this node proposes. Proposals with a
    /// foreign source or a missing agent are ignored.
    fn propose(&mut self, view: &ClusterView<'_>) -> Vec<Migration>;
}

/// Never moves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stationary;

impl MigrationPolicy for Stationary {
    fn propose(&mut self, _view: &ClusterView<'_>) -> Vec<Migration> {
        Vec::new()
    }
}

/// Moves agents from nodes above the mean load to nodes below it.
///
/// Overloaded nodes give away their highest identities first. Every node
/// computes the whole plan from the gathered loads and keeps its own part,
/// so two nodes never fill the same deficit.
#[derive(Debug, Clone, Copy)]
pub struct Rebalance {
    /// Imbalance tolerated before anything moves.
    pub tolerance: u64,
}

impl Default for Rebalance {
    fn default() -> Self {
        Self { tolerance: 1 }
    }
}

impl Rebalance {
    /// Agents each node sends, as `(source, target, count)`.
    pub fn plan(&self, loads: &[u64]) -> Vec<(NodeId, NodeId, u64)> {
        let size = loads.len() as u64;
        if size < 2 {
            return Vec::new();
        }
        let total: u64 = loads.iter().sum();
        let share = total.div_ceil(size);

        let mut deficits: Vec<(usize, u64)> = loads
            .iter()
            .enumerate()
            .filter(|(_, load)| **load < share)
            .map(|(rank, load)| (rank, share - load))
            .collect();

        let mut plan = Vec::new();
        let mut receiver = 0;
        for (rank, load) in loads.iter().enumerate() {
            if *load <= share + self.tolerance {
                continue;
            }
            let mut excess = load - share;
            while excess > 0 && receiver < deficits.len() {
                let (target, deficit) = &mut deficits[receiver];
                let moved = excess.min(*deficit);
                plan.push((NodeId(rank as u32), NodeId(*target as u32), moved));
                excess -= moved;
                *deficit -= moved;
                if *deficit == 0 {
                    receiver += 1;
                }
            }
        }
        plan
    }
}

impl MigrationPolicy for Rebalance {
    fn propose(&mut self, view: &ClusterView<'_>) -> Vec<Migration> {
        let mut candidates: Vec<&Identity> = view.agents.local_identities().collect();
        let mut proposals = Vec::new();
        for (source, target, count) in self.plan(view.loads) {
            if source != view.node {
                continue;
            }
            for _ in 0..count {
                let Some(migrant) = candidates.pop() else {
                    break;
                };
                proposals.push(Migration {
                    source,
                    target,
                    migrant: migrant.clone(),
                });
            }
        }
        proposals
    }
}

/// Moves named agents after the step starting at a given time.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    moves: Vec<(TimePoint, Identity, NodeId)>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `agent` to `target` after the step starting at `at`.
    pub fn then(mut self, at: TimePoint, agent: Identity, target: NodeId) -> Self {
        self.moves.push((at, agent, target));
        self
    }
}

impl MigrationPolicy for MigrationPlan {
    fn propose(&mut self, view: &ClusterView<'_>) -> Vec<Migration> {
        self.moves
            .iter()
            .filter(|(at, agent, _)| *at == view.step.interval.lower && view.agents.contains_local(agent))
            .map(|(_, agent, target)| Migration {
                source: view.node,
                target: *target,
                migrant: agent.clone(),
            })
            .collect()
    }
}
