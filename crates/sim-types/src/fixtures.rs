//! Sample data fixtures for testing.
//!
//! Enable the `test-fixtures` feature to access these helpers.
//!
//! # Example
//!
//! ```ignore
//! // [dev-dependencies]
//! // sim-types = { path = "../sim-types", features = ["test-fixtures"] }
//!
//! use sim_types::fixtures;
//!
//! let ids = fixtures::sibling_identities(3);
//! ```

use crate::{Activation, Identity, Migration, NodeId};

/// `n` children of the identity `[0]`, in creation order.
pub fn sibling_identities(n: u64) -> Vec<Identity> {
    let parent = Identity::from([0]);
    (0..n).map(|digit| parent.child(digit)).collect()
}

/// One activation per identity, all located on `node`.
pub fn activations_on(node: NodeId, identities: &[Identity]) -> Vec<Activation> {
    identities
        .iter()
        .map(|id| Activation {
            location: node,
            activated: id.clone(),
        })
        .collect()
}

/// Moves every identity from `source` to `target`.
pub fn migrations_between(source: NodeId, target: NodeId, identities: &[Identity]) -> Vec<Migration> {
    identities
        .iter()
        .map(|id| Migration {
            source,
            target,
            migrant: id.clone(),
        })
        .collect()
}
