//! Kernel Errors
//!
//! Expected conditions (routing, consistency, capacity) are returned as typed
//! errors. Exhausting an entity's identity space is the only fatal abort.

use sim_types::{Identity, MessageCode, TimeError, TimeInterval, TimePoint};
use thiserror::Error;

use crate::pool::PoolError;

/// Error raised by agent code inside `act` or a message handler.
pub type AgentError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of `act` and message handlers: the time of the next event.
pub type AgentResult = Result<TimePoint, AgentError>;

#[derive(Debug, Error)]
pub enum KernelError {
    /// A message was addressed to an agent no node knows about.
    #[error("recipient {recipient} of message from {sender} not found during {interval}")]
    RecipientNotFound {
        sender: Identity,
        recipient: Identity,
        interval: TimeInterval,
    },

    #[error("agent {0} is already active")]
    AlreadyActive(Identity),

    #[error("agent {0} is not active")]
    UnknownAgent(Identity),

    #[error("agent built for {expected} reported identity {found}")]
    IdentityMismatch { expected: Identity, found: Identity },

    #[error("callback for {message} registered after the agent was activated")]
    CallbacksLocked { message: &'static str },

    #[error("message code {code} is bound to {existing}, cannot bind {attempted}")]
    MessageCodeCollision {
        code: MessageCode,
        existing: &'static str,
        attempted: &'static str,
    },

    #[error("message {code} from {sender} is delivered at {received}, before it is sent at {sent}")]
    InvalidDeliveryTime {
        code: MessageCode,
        sender: Identity,
        sent: TimePoint,
        received: TimePoint,
    },

    #[error("payload of message {code} is not a {expected}")]
    PayloadType {
        code: MessageCode,
        expected: &'static str,
    },

    #[error("agent {agent} reported next event {reported}, before {interval}")]
    EventInPast {
        agent: Identity,
        reported: TimePoint,
        interval: TimeInterval,
    },

    #[error("step {interval} did not converge within {rounds} rounds")]
    RoundLimitExceeded { interval: TimeInterval, rounds: u64 },

    #[error("agent {agent} failed during {interval}: {source}")]
    Agent {
        agent: Identity,
        interval: TimeInterval,
        #[source]
        source: AgentError,
    },

    #[error("agent {0} does not support migration")]
    NotMigratable(Identity),

    #[error("no agent kind '{0}' is registered")]
    UnknownKind(String),

    #[error("step {0} was cancelled")]
    Cancelled(TimeInterval),

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("distributed environment error: {0}")]
    Distributed(#[source] AgentError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
