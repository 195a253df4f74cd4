//! Distributed Simulation
//!
//! Runs a simulation model on several nodes that each own part of the
//! agents. Nodes exchange lifecycle records and message batches every round,
//! agree on the next event by minimum reduction and move agents between
//! each other after steps.

pub mod collective;
pub mod environment;
pub mod error;
pub mod migration;
pub mod runner;
pub mod transport;

pub use collective::Collective;
pub use environment::{ClusterStats, DistributedEnvironment, NodeState};
pub use error::ClusterError;
pub use migration::{ClusterView, MigrationPlan, MigrationPolicy, Rebalance, Stationary};
pub use runner::{merge_outputs, Cluster, NodeReport};
pub use transport::{ChannelTransport, Frame, Transport};
