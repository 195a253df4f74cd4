//! Cluster Protocol Records
//!
//! The three fixed records nodes exchange to agree on which node owns which
//! agent. They carry no agent state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::Identity;

/// Rank of a compute node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// By convention the coordinator is rank 0.
    pub const COORDINATOR: NodeId = NodeId(0);

    pub fn is_coordinator(self) -> bool {
        self == Self::COORDINATOR
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Sent to notify all nodes that an agent now lives on `location`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Activation {
    pub location: NodeId,
    pub activated: Identity,
}

/// An agent moving from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Migration {
    pub source: NodeId,
    pub target: NodeId,
    pub migrant: Identity,
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.migrant, self.source, self.target)
    }
}

/// Sent to notify all nodes that an agent was removed from the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Deactivation {
    pub deactivated: Identity,
}
