//! Agent Collection
//!
//! Every node knows the identity of every active agent in the simulation
//! (`global`) but stores only the agents it runs (`local`). Activations and
//! deactivations made on this node are queued for the environment, which
//! announces them to the other nodes.

use serde_json::Value;
use sim_types::{Identity, MessageCode, TimePoint};
use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::agent::Agent;
use crate::error::KernelError;
use crate::message::Message;

/// Output series of one agent, by name.
pub type AgentOutputs = BTreeMap<String, Value>;

#[derive(Default)]
pub struct AgentCollection {
    global: BTreeSet<Identity>,
    local: BTreeMap<Identity, Box<dyn Agent>>,
    activated: Vec<Identity>,
    deactivated: Vec<Identity>,
    retiring: BTreeMap<Identity, Box<dyn Agent>>,
    archive: BTreeMap<Identity, AgentOutputs>,
    /// Message type of every code any agent here handles.
    codes: BTreeMap<MessageCode, (TypeId, &'static str)>,
}

impl AgentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new agent to this node and queues its activation.
    ///
    /// Locks the agent's callback table.
    pub fn activate(&mut self, mut agent: Box<dyn Agent>) -> Result<Identity, KernelError> {
        let identity = agent.identity().clone();
        if self.global.contains(&identity) || self.local.contains_key(&identity) {
            return Err(KernelError::AlreadyActive(identity));
        }
        self.bind_codes(agent.as_ref())?;
        agent.core_mut().communicator_mut().lock();
        self.global.insert(identity.clone());
        self.local.insert(identity.clone(), agent);
        self.activated.push(identity.clone());
        debug!(agent = %identity, "activated");
        Ok(identity)
    }

    /// Removes a local agent and queues its deactivation. Its state lives
    /// until [`finalize`](Self::finalize).
    pub fn deactivate(&mut self, identity: &Identity) -> Result<(), KernelError> {
        let agent = self
            .local
            .remove(identity)
            .ok_or_else(|| KernelError::UnknownAgent(identity.clone()))?;
        self.global.remove(identity);
        self.retiring.insert(identity.clone(), agent);
        self.deactivated.push(identity.clone());
        debug!(agent = %identity, "deactivated");
        Ok(())
    }

    pub fn take_activated(&mut self) -> Vec<Identity> {
        std::mem::take(&mut self.activated)
    }

    pub fn take_deactivated(&mut self) -> Vec<Identity> {
        std::mem::take(&mut self.deactivated)
    }

    /// Archives the outputs of a deactivated agent and drops it.
    pub fn finalize(&mut self, identity: &Identity) -> Result<(), KernelError> {
        let Some(agent) = self.retiring.remove(identity) else {
            return Ok(());
        };
        let outputs = agent.core().producer().to_json()?;
        if !outputs.is_empty() {
            self.archive.insert(identity.clone(), outputs);
        }
        let unprocessed = agent.core().communicator().pending();
        if unprocessed > 0 {
            debug!(agent = %identity, unprocessed, "dropping undelivered messages");
        }
        Ok(())
    }

    /// Records an agent activated on another node.
    pub fn register_remote(&mut self, identity: Identity) -> bool {
        self.global.insert(identity)
    }

    /// Forgets an agent deactivated on another node.
    pub fn forget_remote(&mut self, identity: &Identity) -> bool {
        self.global.remove(identity)
    }

    /// Stores an agent that arrived from another node. It is already known
    /// globally, so no activation is queued.
    pub fn install(&mut self, agent: Box<dyn Agent>) -> Result<Identity, KernelError> {
        let identity = agent.identity().clone();
        if self.local.contains_key(&identity) {
            return Err(KernelError::AlreadyActive(identity));
        }
        self.bind_codes(agent.as_ref())?;
        self.global.insert(identity.clone());
        self.local.insert(identity.clone(), agent);
        Ok(identity)
    }

    /// Records the message types `agent` handles. A code already bound to
    /// another type by any agent on this node is rejected and nothing is
    /// recorded.
    fn bind_codes(&mut self, agent: &dyn Agent) -> Result<(), KernelError> {
        let callbacks = agent.core().communicator().callbacks();
        for (code, type_id, name) in callbacks.bindings() {
            if let Some((bound, existing)) = self.codes.get(&code) {
                if *bound != type_id {
                    return Err(KernelError::MessageCodeCollision {
                        code,
                        existing: *existing,
                        attempted: name,
                    });
                }
            }
        }
        for (code, type_id, name) in callbacks.bindings() {
            self.codes.entry(code).or_insert((type_id, name));
        }
        Ok(())
    }

    /// Removes an agent that has moved to another node.
    pub fn remove_local(&mut self, identity: &Identity) -> Option<Box<dyn Agent>> {
        self.local.remove(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&dyn Agent> {
        self.local.get(identity).map(|a| &**a)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut dyn Agent> {
        match self.local.get_mut(identity) {
            Some(agent) => Some(&mut **agent),
            None => None,
        }
    }

    pub fn downcast_ref<A: Agent>(&self, identity: &Identity) -> Option<&A> {
        self.local
            .get(identity)
            .and_then(|a| (**a).as_any().downcast_ref::<A>())
    }

    pub fn downcast_mut<A: Agent>(&mut self, identity: &Identity) -> Option<&mut A> {
        self.local
            .get_mut(identity)
            .and_then(|a| (**a).as_any_mut().downcast_mut::<A>())
    }

    pub fn contains_local(&self, identity: &Identity) -> bool {
        self.local.contains_key(identity)
    }

    pub fn contains_global(&self, identity: &Identity) -> bool {
        self.global.contains(identity)
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn global_count(&self) -> usize {
        self.global.len()
    }

    pub fn local_identities(&self) -> impl Iterator<Item = &Identity> {
        self.local.keys()
    }

    pub fn global_identities(&self) -> impl Iterator<Item = &Identity> {
        self.global.iter()
    }

    pub(crate) fn local_mut(&mut self) -> &mut BTreeMap<Identity, Box<dyn Agent>> {
        &mut self.local
    }

    /// Activates the children local agents spawned this round.
    pub fn adopt_spawned(&mut self) -> Result<Vec<Identity>, KernelError> {
        let spawned: Vec<Box<dyn Agent>> = self
            .local
            .values_mut()
            .flat_map(|a| a.core_mut().take_spawned())
            .collect();
        spawned.into_iter().map(|a| self.activate(a)).collect()
    }

    /// Deactivates local agents that asked to retire this round.
    pub fn collect_retiring(&mut self) -> Result<Vec<Identity>, KernelError> {
        let retiring: Vec<Identity> = self
            .local
            .iter()
            .filter(|(_, a)| a.core().is_retiring())
            .map(|(id, _)| id.clone())
            .collect();
        for identity in &retiring {
            self.deactivate(identity)?;
        }
        Ok(retiring)
    }

    /// Takes every outgoing message, ordered by sender identity.
    pub fn drain_outboxes(&mut self) -> Vec<Message> {
        let mut senders: Vec<&mut Box<dyn Agent>> =
            self.local.values_mut().chain(self.retiring.values_mut()).collect();
        senders.sort_by(|a, b| a.identity().cmp(b.identity()));
        senders
            .into_iter()
            .flat_map(|a| a.core_mut().communicator_mut().take_outbox())
            .collect()
    }

    /// Appends a message to a local recipient's inbox, handing it back if
    /// the recipient is not on this node.
    pub fn deliver(&mut self, message: Message) -> Result<(), Message> {
        match self.local.get_mut(message.recipient()) {
            Some(agent) => {
                agent.core_mut().communicator_mut().deliver(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Earliest delivery time of any message waiting in a local inbox.
    pub fn earliest_pending(&self) -> Option<TimePoint> {
        self.local
            .values()
            .filter_map(|a| a.core().communicator().next_delivery())
            .min()
    }

    /// Outputs of local agents and of agents deactivated on this node.
    pub fn outputs(&self) -> Result<BTreeMap<Identity, AgentOutputs>, KernelError> {
        let mut outputs = self.archive.clone();
        for (identity, agent) in &self.local {
            let series = agent.core().producer().to_json()?;
            if !series.is_empty() {
                outputs.insert(identity.clone(), series);
            }
        }
        Ok(outputs)
    }
}

impl std::fmt::Debug for AgentCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCollection")
            .field("global", &self.global.len())
            .field("local", &self.local.len())
            .field("activated", &self.activated)
            .field("deactivated", &self.deactivated)
            .field("archived", &self.archive.len())
            .finish()
    }
}
