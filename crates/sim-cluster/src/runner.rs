//! Cluster Runner
//!
//! Runs every node of a cluster on its own named thread inside one process
//! and collects what each node ended with.

use sim_kernel::{AgentOutputs, AgentRegistry, KernelConfig, Model, RunSummary, Scenario};
use sim_types::{Identity, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::environment::{ClusterStats, DistributedEnvironment};
use crate::error::ClusterError;
use crate::migration::{MigrationPolicy, Stationary};
use crate::transport::{ChannelTransport, Transport};

type PolicyFactory = Arc<dyn Fn(NodeId) -> Box<dyn MigrationPolicy> + Send + Sync>;

/// What one node ended the run with.
#[derive(Debug)]
pub struct NodeReport {
    pub node: NodeId,
    pub summary: RunSummary,
    pub outputs: BTreeMap<Identity, AgentOutputs>,
    pub local_agents: Vec<Identity>,
    pub stats: ClusterStats,
}

pub struct Cluster {
    config: KernelConfig,
    registry: AgentRegistry,
    policy: PolicyFactory,
}

impl Cluster {
    /// A cluster of `config.cluster.nodes` nodes that can rebuild every agent
    /// kind in `registry`.
    pub fn new(config: KernelConfig, registry: AgentRegistry) -> Self {
        Self {
            config,
            registry,
            policy: Arc::new(|_: NodeId| -> Box<dyn MigrationPolicy> { Box::new(Stationary) }),
        }
    }

    /// Gives each node the policy `factory` builds for it.
    pub fn with_policy<F>(mut self, factory: F) -> Self
    where
        F: Fn(NodeId) -> Box<dyn MigrationPolicy> + Send + Sync + 'static,
    {
        self.policy = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Runs the cluster over an in-process channel mesh.
    pub fn run<S, F>(&self, scenario: F) -> Result<Vec<NodeReport>, ClusterError>
    where
        S: Scenario<DistributedEnvironment<ChannelTransport>>,
        F: Fn(NodeId) -> S + Sync,
    {
        if self.config.cluster.nodes == 0 {
            return Err(ClusterError::Invalid("a cluster needs at least one node".to_string()));
        }
        self.run_on(ChannelTransport::mesh(self.config.cluster.nodes), scenario)
    }

    /// Runs one node per transport. `scenario` builds each node's scenario.
    ///
    /// When nodes fail, the error of the lowest-ranked node that failed on
    /// its own is returned, not one that only saw a peer disappear.
    pub fn run_on<T, S, F>(&self, transports: Vec<T>, scenario: F) -> Result<Vec<NodeReport>, ClusterError>
    where
        T: Transport,
        S: Scenario<DistributedEnvironment<T>>,
        F: Fn(NodeId) -> S + Sync,
    {
        info!(nodes = transports.len(), "cluster starting");
        let scenario = &scenario;
        let results: Vec<Result<NodeReport, ClusterError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = transports
                .into_iter()
                .map(|transport| {
                    let node = transport.node();
                    let handle = std::thread::Builder::new()
                        .name(node.to_string())
                        .spawn_scoped(scope, move || self.run_node(transport, scenario));
                    (node, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(node, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or(Err(ClusterError::NodePanicked(node))),
                    Err(e) => Err(ClusterError::Io(e)),
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => failures.push(e),
            }
        }
        if failures.is_empty() {
            info!(nodes = reports.len(), "cluster complete");
            return Ok(reports);
        }
        for failure in &failures {
            error!(error = %failure, "node failed");
        }
        let root = failures.iter().position(|e| !e.is_consequential()).unwrap_or(0);
        Err(failures.swap_remove(root))
    }

    fn run_node<T, S, F>(&self, transport: T, scenario: &F) -> Result<NodeReport, ClusterError>
    where
        T: Transport,
        S: Scenario<DistributedEnvironment<T>>,
        F: Fn(NodeId) -> S,
    {
        let node = transport.node();
        let environment =
            DistributedEnvironment::new(transport, self.registry.clone(), &self.config.cluster).with_policy((self.policy)(node));
        let mut model = Model::with_environment(&self.config, environment)?;
        let mut scenario = scenario(node);
        let summary = model.run(&mut scenario)?;
        Ok(NodeReport {
            node,
            summary,
            outputs: model.outputs()?,
            local_agents: model.agents().local_identities().cloned().collect(),
            stats: model.environment().stats(),
        })
    }
}

/// Outputs of every node merged by agent identity.
pub fn merge_outputs(reports: &[NodeReport]) -> BTreeMap<Identity, AgentOutputs> {
    let mut merged = BTreeMap::new();
    for report in reports {
        for (identity, outputs) in &report.outputs {
            merged.insert(identity.clone(), outputs.clone());
        }
    }
    merged
}
