//! Environments
//!
//! An environment is the platform a model runs on. It decides how agent
//! lifecycle changes are announced, how messages reach their recipients and
//! how nodes agree on the next event. `LocalEnvironment` does all of this
//! inside one process; a distributed environment does it across nodes.

use sim_types::{Identity, NodeId, TimeInterval, TimePoint};
use tracing::{debug, trace};

use crate::collection::AgentCollection;
use crate::error::KernelError;
use crate::message::Message;

/// Result of routing one round of messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Messages appended to inboxes on this node.
    pub delivered: usize,
    /// Messages handed to other nodes.
    pub forwarded: usize,
}

/// What a step settled on, passed to [`Environment::after_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSummary {
    pub interval: TimeInterval,
    pub next_event: TimePoint,
    pub rounds: u64,
    /// End of the simulation.
    pub end: TimePoint,
}

impl StepSummary {
    /// True when no further step will run.
    pub fn is_final(&self) -> bool {
        self.next_event >= self.end
    }
}

pub trait Environment {
    /// Rank of this node. A single-process environment is the coordinator.
    fn node(&self) -> NodeId {
        NodeId::COORDINATOR
    }

    /// Number of nodes taking part in the simulation.
    fn node_count(&self) -> usize {
        1
    }

    fn is_coordinator(&self) -> bool {
        self.node().is_coordinator()
    }

    /// Identity of this node's world entity, `[rank]`. Distinct roots keep
    /// identities minted on different nodes from colliding.
    fn root_identity(&self) -> Identity {
        Identity::from([u64::from(self.node().0)])
    }

    /// File name for the outputs this node writes.
    fn output_file_name(&self) -> String {
        "outputs.jsonl".to_string()
    }

    fn before_step(&mut self, _interval: TimeInterval, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        Ok(())
    }

    fn after_step(&mut self, _step: &StepSummary, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        Ok(())
    }

    /// Applies one activation made on this node.
    fn activate_agent(&mut self, identity: &Identity, agents: &mut AgentCollection) -> Result<(), KernelError>;

    /// Applies one deactivation made on this node.
    fn deactivate_agent(&mut self, identity: &Identity, agents: &mut AgentCollection) -> Result<(), KernelError>;

    /// Applies every queued activation, returning how many there were.
    fn activate(&mut self, agents: &mut AgentCollection) -> Result<usize, KernelError> {
        let activated = agents.take_activated();
        for identity in &activated {
            self.activate_agent(identity, agents)?;
        }
        Ok(activated.len())
    }

    /// Applies every queued deactivation and releases the agents' state.
    fn deactivate(&mut self, agents: &mut AgentCollection) -> Result<usize, KernelError> {
        let deactivated = agents.take_deactivated();
        for identity in &deactivated {
            self.deactivate_agent(identity, agents)?;
            agents.finalize(identity)?;
        }
        Ok(deactivated.len())
    }

    /// Moves every outbox message into its recipient's inbox.
    fn send_messages(&mut self, agents: &mut AgentCollection, interval: TimeInterval) -> Result<Delivery, KernelError> {
        let outgoing = agents.drain_outboxes();
        route_local(agents, outgoing, interval)
    }

    /// Combines this node's earliest next event with every other node's.
    fn agree_next_event(&mut self, candidate: TimePoint) -> Result<TimePoint, KernelError> {
        Ok(candidate)
    }
}

/// Delivers `messages` to local recipients.
///
/// A recipient that is not on this node is a routing failure.
pub fn route_local(
    agents: &mut AgentCollection,
    messages: Vec<Message>,
    interval: TimeInterval,
) -> Result<Delivery, KernelError> {
    let mut delivery = Delivery::default();
    for message in messages {
        trace!(code = %message.code(), sender = %message.sender(), recipient = %message.recipient(), "route");
        if let Err(message) = agents.deliver(message) {
            return Err(KernelError::RecipientNotFound {
                sender: message.sender().clone(),
                recipient: message.recipient().clone(),
                interval,
            });
        }
        delivery.delivered += 1;
    }
    Ok(delivery)
}

/// Single-process environment.
#[derive(Debug, Default)]
pub struct LocalEnvironment {
    activations: u64,
    deactivations: u64,
}

impl LocalEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activations applied so far.
    pub fn activations(&self) -> u64 {
        self.activations
    }

    /// Deactivations applied so far.
    pub fn deactivations(&self) -> u64 {
        self.deactivations
    }
}

impl Environment for LocalEnvironment {
    fn activate_agent(&mut self, identity: &Identity, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        debug!(agent = %identity, "activate");
        self.activations += 1;
        Ok(())
    }

    fn deactivate_agent(&mut self, identity: &Identity, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        debug!(agent = %identity, "deactivate");
        self.deactivations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentCore};
    use crate::message::MessageBody;
    use serde::{Deserialize, Serialize};
    use sim_types::MessageCode;

    struct Idle {
        core: AgentCore,
    }

    impl Agent for Idle {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AgentCore {
            &mut self.core
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello;

    impl MessageBody for Hello {
        const CODE: MessageCode = MessageCode::user(5);
    }

    fn idle(identity: Identity) -> Box<dyn Agent> {
        Box::new(Idle {
            core: AgentCore::new(identity),
        })
    }

    #[test]
    fn test_local_root_identity() {
        let env = LocalEnvironment::new();
        assert_eq!(env.root_identity(), Identity::from([0]));
        assert!(env.is_coordinator());
        assert_eq!(env.node_count(), 1);
    }

    #[test]
    fn test_activate_and_deactivate_counts() {
        let mut env = LocalEnvironment::new();
        let mut agents = AgentCollection::new();
        let a = agents.activate(idle(Identity::from([0, 0]))).unwrap();
        agents.activate(idle(Identity::from([0, 1]))).unwrap();
        assert_eq!(env.activate(&mut agents).unwrap(), 2);
        assert_eq!(env.activations(), 2);

        agents.deactivate(&a).unwrap();
        assert_eq!(env.deactivate(&mut agents).unwrap(), 1);
        assert_eq!(env.deactivations(), 1);
        assert_eq!(agents.local_count(), 1);
    }

    #[test]
    fn test_send_messages_routes_to_inbox() {
        let mut env = LocalEnvironment::new();
        let mut agents = AgentCollection::new();
        let a = agents.activate(idle(Identity::from([0, 0]))).unwrap();
        let b = agents.activate(idle(Identity::from([0, 1]))).unwrap();
        agents.get_mut(&a).unwrap().core_mut().send(b.clone(), 1, 3, Hello).unwrap();

        let interval = TimeInterval::new(1, 5).unwrap();
        let delivery = env.send_messages(&mut agents, interval).unwrap();
        assert_eq!(delivery.delivered, 1);
        assert_eq!(agents.get(&b).unwrap().core().communicator().next_delivery(), Some(3));
    }

    #[test]
    fn test_unknown_recipient_is_routing_failure() {
        let mut env = LocalEnvironment::new();
        let mut agents = AgentCollection::new();
        let a = agents.activate(idle(Identity::from([0, 0]))).unwrap();
        agents
            .get_mut(&a)
            .unwrap()
            .core_mut()
            .send(Identity::from([0, 9]), 0, 0, Hello)
            .unwrap();

        let interval = TimeInterval::new(0, 5).unwrap();
        match env.send_messages(&mut agents, interval) {
            Err(KernelError::RecipientNotFound { sender, recipient, interval: at }) => {
                assert_eq!(sender, a);
                assert_eq!(recipient, Identity::from([0, 9]));
                assert_eq!(at, interval);
            }
            other => panic!("expected routing failure, got {:?}", other),
        }
    }
}
