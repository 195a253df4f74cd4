//! Communicator
//!
//! Inbox, outbox and the callback table of one agent. Handlers are registered
//! per message type with a priority while the agent is being built; once the
//! agent is activated the table is locked.
//!
//! Message processing within a step:
//! 1. Take every inbox message with `received <= lower`, oldest first
//! 2. Group them by the highest handler priority of their code
//! 3. Process groups from highest priority to lowest, in arrival order or
//!    shuffled within the group when scheduling is random
//! 4. Every handler returns its next event; the minimum over all handlers is
//!    the communicator's next event, capped at the end of the step

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sim_types::{Header, MessageCode, TimeInterval, TimePoint};
use std::any::{type_name, Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::{AgentResult, KernelError};
use crate::message::{Message, MessageBody};
use crate::seed::Seed;

/// Handler priority. Higher values run first.
pub type Priority = i8;

/// Pending messages keyed by delivery time, arrival order within a key.
pub type Inbox = BTreeMap<TimePoint, Vec<Message>>;

/// Order in which due messages of equal priority are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// Arrival order.
    #[default]
    InOrder,
    /// Shuffled with the agent's seed.
    Random,
}

type ErasedHandler = dyn Fn(&mut dyn Any, &Message, TimeInterval, &mut Seed) -> AgentResult + Send + Sync;

#[derive(Clone)]
struct Callback {
    priority: Priority,
    description: &'static str,
    handler: Arc<ErasedHandler>,
}

/// Message handlers of one agent type, keyed by message code.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: BTreeMap<MessageCode, Vec<Callback>>,
    bindings: BTreeMap<MessageCode, (TypeId, &'static str)>,
}

impl CallbackRegistry {
    /// Registers `handler` for messages of type `M` delivered to an `A`.
    pub fn register<A, M, F>(
        &mut self,
        priority: Priority,
        description: &'static str,
        handler: F,
    ) -> Result<(), KernelError>
    where
        A: Any,
        M: MessageBody,
        F: Fn(&mut A, &M, &Header, TimeInterval, &mut Seed) -> AgentResult + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<M>();
        match self.bindings.get(&M::CODE) {
            Some((bound, existing)) if *bound != type_id => {
                return Err(KernelError::MessageCodeCollision {
                    code: M::CODE,
                    existing: *existing,
                    attempted: type_name::<M>(),
                });
            }
            Some(_) => {}
            None => {
                self.bindings.insert(M::CODE, (type_id, type_name::<M>()));
            }
        }

        let erased = move |owner: &mut dyn Any,
                           message: &Message,
                           interval: TimeInterval,
                           seed: &mut Seed|
              -> AgentResult {
            let Some(agent) = owner.downcast_mut::<A>() else {
                return Err(format!("handler for {} expects a {}", type_name::<M>(), type_name::<A>()).into());
            };
            message.with_body(|body: &M| handler(agent, body, message.header(), interval, seed))?
        };

        let entries = self.callbacks.entry(M::CODE).or_default();
        entries.push(Callback {
            priority,
            description,
            handler: Arc::new(erased),
        });
        // stable: equal priorities keep registration order
        entries.sort_by_key(|c| std::cmp::Reverse(c.priority));
        Ok(())
    }

    /// Number of handlers over all codes.
    pub fn len(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Message type bound to each code, as `(code, type, type name)`.
    pub fn bindings(&self) -> impl Iterator<Item = (MessageCode, TypeId, &'static str)> + '_ {
        self.bindings.iter().map(|(code, (type_id, name))| (*code, *type_id, *name))
    }

    /// Highest handler priority for `code`, if any handler exists.
    pub fn priority_of(&self, code: MessageCode) -> Option<Priority> {
        self.callbacks.get(&code)?.first().map(|c| c.priority)
    }

    /// Handler descriptions for `code`, in invocation order.
    pub fn descriptions(&self, code: MessageCode) -> Vec<&'static str> {
        self.callbacks
            .get(&code)
            .map(|entries| entries.iter().map(|c| c.description).collect())
            .unwrap_or_default()
    }

    /// Runs every handler of the message's code, highest priority first.
    ///
    /// Returns the earliest next event any handler asked for, or the end of
    /// the step when the code has no handler.
    pub fn process_message(
        &self,
        owner: &mut dyn Any,
        message: &Message,
        interval: TimeInterval,
        seed: &mut Seed,
    ) -> AgentResult {
        let Some(entries) = self.callbacks.get(&message.code()) else {
            trace!(code = %message.code(), sender = %message.sender(), "no handler, message dropped");
            return Ok(interval.upper);
        };
        let mut first_event = interval.upper;
        for callback in entries {
            let next = (callback.handler)(&mut *owner, message, interval, &mut *seed)?;
            first_event = first_event.min(next);
        }
        Ok(first_event)
    }

    /// Processes due messages grouped by descending priority.
    pub fn process_messages(
        &self,
        owner: &mut dyn Any,
        messages: Vec<Message>,
        scheduling: Scheduling,
        interval: TimeInterval,
        seed: &mut Seed,
    ) -> AgentResult {
        let mut groups: BTreeMap<std::cmp::Reverse<Priority>, Vec<Message>> = BTreeMap::new();
        for message in messages {
            match self.priority_of(message.code()) {
                Some(priority) => groups
                    .entry(std::cmp::Reverse(priority))
                    .or_default()
                    .push(message),
                None => {
                    trace!(code = %message.code(), sender = %message.sender(), "no handler, message dropped");
                }
            }
        }

        let mut first_event = interval.upper;
        for (_, mut group) in groups {
            if scheduling == Scheduling::Random {
                group.shuffle(&mut *seed);
            }
            for message in &group {
                let next = self.process_message(&mut *owner, message, interval, &mut *seed)?;
                first_event = first_event.min(next);
            }
        }
        Ok(first_event)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.callbacks.iter().map(|(code, entries)| {
                (code, entries.iter().map(|c| (c.priority, c.description)).collect::<Vec<_>>())
            }))
            .finish()
    }
}

/// Inbox, outbox and callbacks of one agent.
#[derive(Default, Serialize, Deserialize)]
pub struct Communicator {
    inbox: Inbox,
    scheduling: Scheduling,
    #[serde(skip)]
    outbox: Vec<Message>,
    #[serde(skip)]
    locked: bool,
    #[serde(skip)]
    callbacks: Arc<CallbackRegistry>,
}

impl Communicator {
    pub fn new(scheduling: Scheduling) -> Self {
        Self {
            scheduling,
            ..Self::default()
        }
    }

    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    pub fn set_scheduling(&mut self, scheduling: Scheduling) {
        self.scheduling = scheduling;
    }

    /// Registers a handler. Fails once the agent has been activated.
    pub fn register_callback<A, M, F>(
        &mut self,
        priority: Priority,
        description: &'static str,
        handler: F,
    ) -> Result<(), KernelError>
    where
        A: Any,
        M: MessageBody,
        F: Fn(&mut A, &M, &Header, TimeInterval, &mut Seed) -> AgentResult + Send + Sync + 'static,
    {
        if self.locked {
            return Err(KernelError::CallbacksLocked {
                message: type_name::<M>(),
            });
        }
        Arc::make_mut(&mut self.callbacks).register::<A, M, F>(priority, description, handler)
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    /// Queues an outgoing message for routing at the end of the round.
    pub fn send(&mut self, message: Message) {
        self.outbox.push(message);
    }

    pub fn outbox(&self) -> &[Message] {
        &self.outbox
    }

    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Number of messages waiting in the inbox.
    pub fn pending(&self) -> usize {
        self.inbox.values().map(Vec::len).sum()
    }

    /// Appends a routed message to the inbox.
    pub fn deliver(&mut self, message: Message) {
        self.inbox.entry(message.received()).or_default().push(message);
    }

    /// Earliest delivery time of any waiting message.
    pub fn next_delivery(&self) -> Option<TimePoint> {
        self.inbox.keys().next().copied()
    }

    /// Removes and returns every message with `received <= interval.lower`.
    pub fn take_due(&mut self, interval: TimeInterval) -> Vec<Message> {
        let later = match interval.lower.checked_add(1) {
            Some(bound) => self.inbox.split_off(&bound),
            None => Inbox::new(),
        };
        let due = std::mem::replace(&mut self.inbox, later);
        due.into_values().flatten().collect()
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("pending", &self.pending())
            .field("outbox", &self.outbox.len())
            .field("scheduling", &self.scheduling)
            .field("locked", &self.locked)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sim_types::Identity;

    #[derive(Debug, Serialize, Deserialize)]
    struct Low(u32);
    impl MessageBody for Low {
        const CODE: MessageCode = MessageCode::user(234);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Mid(u32);
    impl MessageBody for Mid {
        const CODE: MessageCode = MessageCode::user(456);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct High(u32);
    impl MessageBody for High {
        const CODE: MessageCode = MessageCode::user(789);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor;
    impl MessageBody for Impostor {
        const CODE: MessageCode = MessageCode::user(789);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u64>,
    }

    fn interval() -> TimeInterval {
        TimeInterval::new(0, 10).unwrap()
    }

    fn message<M: MessageBody>(body: M, received: TimePoint) -> Message {
        Message::new(Identity::from([0]), Identity::from([1]), 0, received, body).unwrap()
    }

    fn recording_registry() -> CallbackRegistry {
        let mut registry = CallbackRegistry::default();
        registry
            .register(0, "low", |r: &mut Recorder, _: &Low, h: &Header, i: TimeInterval, _: &mut Seed| {
                r.seen.push(h.code.0);
                Ok(i.upper)
            })
            .unwrap();
        registry
            .register(5, "mid", |r: &mut Recorder, _: &Mid, h: &Header, _: TimeInterval, _: &mut Seed| {
                r.seen.push(h.code.0);
                Ok(7)
            })
            .unwrap();
        registry
            .register(9, "high", |r: &mut Recorder, _: &High, h: &Header, i: TimeInterval, _: &mut Seed| {
                r.seen.push(h.code.0);
                Ok(i.upper)
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_priority_grouping_in_order() {
        let registry = recording_registry();
        let mut recorder = Recorder::default();
        // interleaved arrivals, three of each
        let mut messages = Vec::new();
        for _ in 0..3 {
            messages.push(message(Low(0), 0));
            messages.push(message(Mid(0), 0));
            messages.push(message(High(0), 0));
        }
        let mut seed = Seed::new(1, 0, 0, 0);
        let next = registry
            .process_messages(&mut recorder, messages, Scheduling::InOrder, interval(), &mut seed)
            .unwrap();
        assert_eq!(recorder.seen, vec![789, 789, 789, 456, 456, 456, 234, 234, 234]);
        assert_eq!(next, 7);
    }

    #[test]
    fn test_random_scheduling_shuffles_within_priority_only() {
        let mut registry = CallbackRegistry::default();
        registry
            .register(1, "tag", |r: &mut Recorder, m: &Mid, _: &Header, i: TimeInterval, _: &mut Seed| {
                r.seen.push(m.0 as u64);
                Ok(i.upper)
            })
            .unwrap();
        registry
            .register(0, "tail", |r: &mut Recorder, _: &Low, _: &Header, i: TimeInterval, _: &mut Seed| {
                r.seen.push(1000);
                Ok(i.upper)
            })
            .unwrap();

        let messages: Vec<Message> = (0..20)
            .map(|n| message(Mid(n), 0))
            .chain(std::iter::once(message(Low(0), 0)))
            .collect();
        let mut recorder = Recorder::default();
        let mut seed = Seed::new(3, 0, 0, 0);
        registry
            .process_messages(&mut recorder, messages, Scheduling::Random, interval(), &mut seed)
            .unwrap();

        assert_eq!(recorder.seen.len(), 21);
        assert_eq!(recorder.seen[20], 1000);
        let mut tagged = recorder.seen[..20].to_vec();
        assert_ne!(tagged, (0..20).collect::<Vec<u64>>());
        tagged.sort();
        assert_eq!(tagged, (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_unhandled_messages_are_dropped() {
        let mut registry = CallbackRegistry::default();
        registry
            .register(0, "low", |_: &mut Recorder, _: &Low, _: &Header, _: TimeInterval, _: &mut Seed| Ok(4))
            .unwrap();
        let mut recorder = Recorder::default();
        let mut seed = Seed::new(1, 0, 0, 0);
        let next = registry
            .process_messages(&mut recorder, vec![message(High(1), 0)], Scheduling::InOrder, interval(), &mut seed)
            .unwrap();
        assert_eq!(next, 10);
    }

    #[test]
    fn test_multiple_handlers_same_code() {
        let mut registry = CallbackRegistry::default();
        registry
            .register(1, "first", |r: &mut Recorder, _: &Low, _: &Header, _: TimeInterval, _: &mut Seed| {
                r.seen.push(1);
                Ok(8)
            })
            .unwrap();
        registry
            .register(3, "second", |r: &mut Recorder, _: &Low, _: &Header, _: TimeInterval, _: &mut Seed| {
                r.seen.push(3);
                Ok(6)
            })
            .unwrap();
        assert_eq!(registry.descriptions(Low::CODE), vec!["second", "first"]);

        let mut recorder = Recorder::default();
        let mut seed = Seed::new(1, 0, 0, 0);
        let next = registry
            .process_message(&mut recorder, &message(Low(0), 0), interval(), &mut seed)
            .unwrap();
        assert_eq!(recorder.seen, vec![3, 1]);
        assert_eq!(next, 6);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_equal_priorities_keep_registration_order() {
        let mut registry = CallbackRegistry::default();
        for (priority, description, tag) in [(0, "a", 1), (10, "b", 2), (0, "c", 3)] {
            registry
                .register(priority, description, move |r: &mut Recorder, _: &Low, _: &Header, i: TimeInterval, _: &mut Seed| {
                    r.seen.push(tag);
                    Ok(i.upper)
                })
                .unwrap();
        }
        assert_eq!(registry.descriptions(Low::CODE), vec!["b", "a", "c"]);

        let mut recorder = Recorder::default();
        let mut seed = Seed::new(1, 0, 0, 0);
        registry
            .process_message(&mut recorder, &message(Low(0), 0), interval(), &mut seed)
            .unwrap();
        assert_eq!(recorder.seen, vec![2, 1, 3]);
    }

    #[test]
    fn test_code_collision_rejected() {
        let mut registry = recording_registry();
        let result = registry.register(
            0,
            "impostor",
            |_: &mut Recorder, _: &Impostor, _: &Header, i: TimeInterval, _: &mut Seed| Ok(i.upper),
        );
        assert!(matches!(result, Err(KernelError::MessageCodeCollision { .. })));
    }

    #[test]
    fn test_registration_locked_after_activation() {
        let mut communicator = Communicator::new(Scheduling::InOrder);
        communicator
            .register_callback(0, "low", |_: &mut Recorder, _: &Low, _: &Header, i: TimeInterval, _: &mut Seed| Ok(i.upper))
            .unwrap();
        communicator.lock();
        let result = communicator
            .register_callback(0, "mid", |_: &mut Recorder, _: &Mid, _: &Header, i: TimeInterval, _: &mut Seed| Ok(i.upper));
        assert!(matches!(result, Err(KernelError::CallbacksLocked { .. })));
        assert_eq!(communicator.callbacks().len(), 1);
    }

    #[test]
    fn test_take_due_keeps_future_messages() {
        let mut communicator = Communicator::default();
        communicator.deliver(message(Low(1), 3));
        communicator.deliver(message(Low(2), 1));
        communicator.deliver(message(Low(3), 5));
        communicator.deliver(message(Low(4), 3));

        let due = communicator.take_due(TimeInterval::new(3, 10).unwrap());
        let received: Vec<TimePoint> = due.iter().map(|m| m.received()).collect();
        assert_eq!(received, vec![1, 3, 3]);
        assert_eq!(communicator.pending(), 1);
        assert_eq!(communicator.next_delivery(), Some(5));
    }

    #[test]
    fn test_handler_errors_propagate() {
        let mut registry = CallbackRegistry::default();
        registry
            .register(0, "fails", |_: &mut Recorder, _: &Low, _: &Header, _: TimeInterval, _: &mut Seed| {
                Err("broken".into())
            })
            .unwrap();
        let mut recorder = Recorder::default();
        let mut seed = Seed::new(1, 0, 0, 0);
        let result = registry.process_message(&mut recorder, &message(Low(0), 0), interval(), &mut seed);
        assert_eq!(result.unwrap_err().to_string(), "broken");
    }
}
