//! Agents
//!
//! An agent is an entity that acts on its own and reacts to messages. The
//! kernel stores agents as `Box<dyn Agent>`; each concrete type embeds an
//! `AgentCore` with its entity, communicator and outputs.
//!
//! # Example
//!
//! ```
//! use sim_kernel::{Agent, AgentCore, AgentResult, Seed};
//! use sim_types::{Identity, TimeInterval};
//!
//! struct Sleeper {
//!     core: AgentCore,
//! }
//!
//! impl Agent for Sleeper {
//!     fn core(&self) -> &AgentCore {
//!         &self.core
//!     }
//!
//!     fn core_mut(&mut self) -> &mut AgentCore {
//!         &mut self.core
//!     }
//!
//!     fn act(&mut self, interval: TimeInterval, _seed: &mut Seed) -> AgentResult {
//!         Ok(interval.lower + 10)
//!     }
//! }
//!
//! let sleeper = Sleeper { core: AgentCore::new(Identity::from([0, 0])) };
//! assert_eq!(sleeper.describe(), "agent \"0-0\"");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sim_types::{Header, Identity, TimeInterval, TimePoint};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::communicator::{Communicator, Priority, Scheduling};
use crate::entity::Entity;
use crate::error::{AgentResult, KernelError};
use crate::message::{Message, MessageBody};
use crate::outputs::{OutputHandle, Producer};
use crate::seed::Seed;

/// Upcast to `Any` for handler dispatch and downcasting.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub trait Agent: AsAny + Send {
    fn core(&self) -> &AgentCore;

    fn core_mut(&mut self) -> &mut AgentCore;

    fn identity(&self) -> &Identity {
        self.core().identity()
    }

    /// Called once per round after messages are processed. Returns the time
    /// of the agent's next event; the default waits for the end of the step.
    fn act(&mut self, interval: TimeInterval, _seed: &mut Seed) -> AgentResult {
        Ok(interval.upper)
    }

    fn kind(&self) -> &'static str {
        "agent"
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind(), self.identity())
    }

    /// Captures the agent's state for migration to another node.
    fn snapshot(&self) -> Result<AgentSnapshot, KernelError> {
        Err(KernelError::NotMigratable(self.identity().clone()))
    }

    /// Re-creates callbacks and output handles after deserialization.
    fn restore(&mut self) -> Result<(), KernelError> {
        Ok(())
    }

    /// Handles every inbox message due in `interval`.
    fn process_messages(&mut self, interval: TimeInterval, seed: &mut Seed) -> AgentResult {
        let communicator = self.core_mut().communicator_mut();
        let due = communicator.take_due(interval);
        if due.is_empty() {
            return Ok(interval.upper);
        }
        let callbacks = Arc::clone(communicator.callbacks());
        let scheduling = communicator.scheduling();
        callbacks.process_messages(self.as_any_mut(), due, scheduling, interval, seed)
    }
}

/// An agent that can move between nodes.
///
/// Implementors forward `kind` to `KIND` and `snapshot` to
/// [`AgentSnapshot::capture`].
pub trait Migratable: Agent + Serialize + DeserializeOwned {
    const KIND: &'static str;
}

/// Serialized agent state tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub kind: String,
    pub identity: Identity,
    pub state: serde_json::Value,
}

impl AgentSnapshot {
    pub fn capture<A: Agent + Serialize>(agent: &A) -> Result<Self, KernelError> {
        Ok(Self {
            kind: agent.kind().to_string(),
            identity: agent.identity().clone(),
            state: serde_json::to_value(agent)?,
        })
    }
}

/// State every agent carries.
#[derive(Serialize, Deserialize)]
pub struct AgentCore {
    entity: Entity,
    communicator: Communicator,
    producer: Producer,
    #[serde(skip)]
    spawned: Vec<Box<dyn Agent>>,
    #[serde(skip)]
    retiring: bool,
}

impl AgentCore {
    pub fn new(identity: Identity) -> Self {
        Self::with_scheduling(identity, Scheduling::default())
    }

    pub fn with_scheduling(identity: Identity, scheduling: Scheduling) -> Self {
        Self {
            entity: Entity::new(identity),
            communicator: Communicator::new(scheduling),
            producer: Producer::default(),
            spawned: Vec::new(),
            retiring: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.entity.identity()
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn communicator_mut(&mut self) -> &mut Communicator {
        &mut self.communicator
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn register_callback<A, M, F>(
        &mut self,
        priority: Priority,
        description: &'static str,
        handler: F,
    ) -> Result<(), KernelError>
    where
        A: Agent,
        M: MessageBody,
        F: Fn(&mut A, &M, &Header, TimeInterval, &mut Seed) -> AgentResult + Send + Sync + 'static,
    {
        self.communicator
            .register_callback::<A, M, F>(priority, description, handler)
    }

    pub fn create_output<T>(&mut self, name: impl Into<String>) -> Result<OutputHandle<T>, KernelError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.producer.create_output(name)
    }

    /// Sends `body` to `recipient`, to be received at `received`.
    pub fn send<M: MessageBody>(
        &mut self,
        recipient: Identity,
        sent: TimePoint,
        received: TimePoint,
        body: M,
    ) -> Result<(), KernelError> {
        let message = Message::new(self.identity().clone(), recipient, sent, received, body)?;
        self.communicator.send(message);
        Ok(())
    }

    /// Creates a child agent, activated at the end of the current round.
    ///
    /// Returns the child's identity so the parent can message it right away.
    pub fn spawn<A, F>(&mut self, build: F) -> Result<Identity, KernelError>
    where
        A: Agent,
        F: FnOnce(Identity) -> Result<A, KernelError>,
    {
        let identity = self.entity.create_child();
        let agent = build(identity.clone())?;
        if agent.identity() != &identity {
            return Err(KernelError::IdentityMismatch {
                expected: identity,
                found: agent.identity().clone(),
            });
        }
        self.spawned.push(Box::new(agent));
        Ok(identity)
    }

    /// Asks for this agent to be deactivated at the end of the current round.
    pub fn retire(&mut self) {
        self.retiring = true;
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<Box<dyn Agent>> {
        std::mem::take(&mut self.spawned)
    }
}

impl fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCore")
            .field("identity", self.identity())
            .field("children_created", &self.entity.children_created())
            .field("communicator", &self.communicator)
            .field("producer", &self.producer)
            .field("spawned", &self.spawned.len())
            .field("retiring", &self.retiring)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::MessageCode;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick(u32);

    impl MessageBody for Tick {
        const CODE: MessageCode = MessageCode::user(11);
    }

    #[derive(Serialize, Deserialize)]
    struct Counter {
        core: AgentCore,
        ticks: u32,
    }

    impl Counter {
        fn new(identity: Identity) -> Result<Self, KernelError> {
            let mut counter = Self {
                core: AgentCore::new(identity),
                ticks: 0,
            };
            counter.restore()?;
            Ok(counter)
        }

        fn on_tick(&mut self, tick: &Tick, _: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
            self.ticks += tick.0;
            Ok(interval.lower + 2)
        }
    }

    impl Agent for Counter {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AgentCore {
            &mut self.core
        }

        fn kind(&self) -> &'static str {
            Self::KIND
        }

        fn snapshot(&self) -> Result<AgentSnapshot, KernelError> {
            AgentSnapshot::capture(self)
        }

        fn restore(&mut self) -> Result<(), KernelError> {
            self.core.register_callback(0, "count ticks", Self::on_tick)
        }
    }

    impl Migratable for Counter {
        const KIND: &'static str = "counter";
    }

    #[test]
    fn test_process_messages_dispatches_to_concrete_type() {
        let mut counter = Counter::new(Identity::from([0, 1])).unwrap();
        let interval = TimeInterval::new(3, 9).unwrap();
        counter
            .core
            .communicator_mut()
            .deliver(Message::new(Identity::from([0]), Identity::from([0, 1]), 0, 3, Tick(4)).unwrap());
        counter
            .core
            .communicator_mut()
            .deliver(Message::new(Identity::from([0]), Identity::from([0, 1]), 0, 7, Tick(1)).unwrap());

        let boxed: &mut dyn Agent = &mut counter;
        let mut seed = Seed::for_agent(&Identity::from([0, 1]), interval, 0, 0);
        let next = boxed.process_messages(interval, &mut seed).unwrap();
        assert_eq!(next, 5);
        assert_eq!(counter.ticks, 4);
        assert_eq!(counter.core.communicator().pending(), 1);
    }

    #[test]
    fn test_send_validates_delivery_time() {
        let mut core = AgentCore::new(Identity::from([0, 1]));
        assert!(core.send(Identity::from([0, 2]), 5, 5, Tick(1)).is_ok());
        assert!(matches!(
            core.send(Identity::from([0, 2]), 5, 4, Tick(1)),
            Err(KernelError::InvalidDeliveryTime { .. })
        ));
        assert_eq!(core.communicator().outbox().len(), 1);
    }

    #[test]
    fn test_spawn_mints_child_identity() {
        let mut parent = AgentCore::new(Identity::from([0, 1]));
        let child = parent.spawn(Counter::new).unwrap();
        assert_eq!(child, Identity::from([0, 1, 0]));
        let second = parent.spawn(Counter::new).unwrap();
        assert_eq!(second, Identity::from([0, 1, 1]));
        assert_eq!(parent.take_spawned().len(), 2);

        let wrong = parent.spawn(|_| Counter::new(Identity::from([9])));
        assert!(matches!(wrong, Err(KernelError::IdentityMismatch { .. })));
    }

    #[test]
    fn test_snapshot_round_trip_keeps_inbox() {
        let mut counter = Counter::new(Identity::from([0, 3])).unwrap();
        counter.ticks = 12;
        counter
            .core
            .communicator_mut()
            .deliver(Message::new(Identity::from([0]), Identity::from([0, 3]), 0, 20, Tick(2)).unwrap());

        let snapshot = counter.snapshot().unwrap();
        assert_eq!(snapshot.kind, "counter");
        assert_eq!(snapshot.identity, Identity::from([0, 3]));

        let restored: Counter = serde_json::from_value(snapshot.state).unwrap();
        assert_eq!(restored.ticks, 12);
        assert_eq!(restored.core.communicator().next_delivery(), Some(20));
        assert!(restored.core.communicator().callbacks().is_empty());
    }

    #[test]
    fn test_default_agent_is_not_migratable() {
        struct Plain {
            core: AgentCore,
        }
        impl Agent for Plain {
            fn core(&self) -> &AgentCore {
                &self.core
            }
            fn core_mut(&mut self) -> &mut AgentCore {
                &mut self.core
            }
        }
        let plain = Plain {
            core: AgentCore::new(Identity::from([0, 4])),
        };
        assert!(matches!(plain.snapshot(), Err(KernelError::NotMigratable(_))));
    }
}
