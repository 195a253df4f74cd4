//! Agent Kinds
//!
//! Maps the kind tag of a snapshot back to a concrete agent type so a node
//! can rebuild agents it receives.

use std::collections::BTreeMap;

use crate::agent::{Agent, AgentSnapshot, Migratable};
use crate::error::KernelError;

type Restorer = fn(AgentSnapshot) -> Result<Box<dyn Agent>, KernelError>;

#[derive(Clone, Default)]
pub struct AgentRegistry {
    kinds: BTreeMap<&'static str, Restorer>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Migratable>(&mut self) -> &mut Self {
        self.kinds.insert(A::KIND, restore_as::<A>);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<A: Migratable>(mut self) -> Self {
        self.register::<A>();
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }

    /// Rebuilds an agent from its snapshot and re-registers its callbacks.
    pub fn restore(&self, snapshot: AgentSnapshot) -> Result<Box<dyn Agent>, KernelError> {
        let restorer = self
            .kinds
            .get(snapshot.kind.as_str())
            .ok_or_else(|| KernelError::UnknownKind(snapshot.kind.clone()))?;
        restorer(snapshot)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.kinds.keys()).finish()
    }
}

fn restore_as<A: Migratable>(snapshot: AgentSnapshot) -> Result<Box<dyn Agent>, KernelError> {
    let mut agent: A = serde_json::from_value(snapshot.state)?;
    if agent.identity() != &snapshot.identity {
        return Err(KernelError::IdentityMismatch {
            expected: snapshot.identity,
            found: agent.identity().clone(),
        });
    }
    let communicator = agent.core_mut().communicator_mut();
    communicator.unlock();
    agent.restore()?;
    agent.core_mut().communicator_mut().lock();
    Ok(Box::new(agent))
}
