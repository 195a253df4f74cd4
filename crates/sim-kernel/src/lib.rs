//! Simulation Kernel
//!
//! Discrete-event, agent-based simulation: agents with hierarchical
//! identities exchange timestamped messages, and the model advances time in
//! steps that repeat rounds until no agent has anything left to do at the
//! current time.

pub mod agent;
pub mod collection;
pub mod communicator;
pub mod config;
pub mod demo;
pub mod entity;
pub mod environment;
pub mod error;
pub mod executor;
pub mod message;
pub mod model;
pub mod outputs;
pub mod pool;
pub mod registry;
pub mod seed;

pub use agent::{Agent, AgentCore, AgentSnapshot, AsAny, Migratable};
pub use collection::{AgentCollection, AgentOutputs};
pub use communicator::{CallbackRegistry, Communicator, Inbox, Priority, Scheduling};
pub use config::{
    ClusterConfig, ConfigError, ExecutionConfig, FailurePolicy, KernelConfig, OutputConfig,
    SimulationConfig,
};
pub use entity::Entity;
pub use environment::{route_local, Delivery, Environment, LocalEnvironment, StepSummary};
pub use error::{AgentError, AgentResult, KernelError};
pub use executor::{Evaluation, Executor, StopHandle};
pub use message::{Message, MessageBody};
pub use model::{Model, RunSummary, Scenario};
pub use outputs::{Output, OutputHandle, OutputRecord, OutputWriter, Producer};
pub use pool::{BlockPool, PoolError};
pub use registry::AgentRegistry;
pub use seed::Seed;
