//! Configuration loading for the kernel.
//!
//! Simulation, execution, cluster and output settings are loaded from one
//! TOML file. Every section and field is optional.

use serde::{Deserialize, Serialize};
use sim_types::TimePoint;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::communicator::Scheduling;

/// Complete kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Time span and sample number
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Threads and failure handling
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Node count and migration handshake
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Where outputs are written
    #[serde(default)]
    pub output: OutputConfig,
}

impl KernelConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parses configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the configuration as a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.start > self.simulation.end {
            return Err(ConfigError::Invalid(format!(
                "simulation.start {} is after simulation.end {}",
                self.simulation.start, self.simulation.end
            )));
        }
        if self.cluster.nodes == 0 {
            return Err(ConfigError::Invalid("cluster.nodes must be at least 1".into()));
        }
        if self.execution.max_rounds == Some(0) {
            return Err(ConfigError::Invalid("execution.max_rounds must be at least 1".into()));
        }
        Ok(())
    }
}

/// Simulated time span and sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// First time point
    pub start: TimePoint,
    /// Time point at which the simulation stops
    pub end: TimePoint,
    /// Sample number, mixed into every agent seed
    pub sample: u64,
    /// Log a progress line every this many rounds (0 disables)
    pub verbosity: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: 100,
            sample: 0,
            verbosity: 0,
        }
    }
}

/// What happens when an agent's `act` or a handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run with the failure of the smallest failing identity.
    #[default]
    Abort,
    /// Log the failure and deactivate the failing agents.
    Deactivate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker threads evaluating agents (1 evaluates on the calling thread)
    pub threads: usize,
    /// Rounds a single step may take before it is declared stuck
    pub max_rounds: Option<u64>,
    pub failure_policy: FailurePolicy,
    /// Default scheduling for agents built by the bundled scenarios
    pub scheduling: Scheduling,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            max_rounds: Some(10_000),
            failure_policy: FailurePolicy::Abort,
            scheduling: Scheduling::InOrder,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of nodes (1 runs in a single environment)
    pub nodes: usize,
    /// How long a source waits for a migrant's installation acknowledgement
    pub ack_timeout_ms: u64,
    /// Resends of an unacknowledged migrant before the run fails
    pub migration_retries: u32,
    /// Move every agent to the coordinator after the last step
    pub gather_on_finish: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            ack_timeout_ms: 500,
            migration_retries: 3,
            gather_on_finish: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for outputs; nothing is written when unset
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub fn default_config_toml() -> String {
    r#"# Kernel Configuration

[simulation]
start = 0
end = 100
sample = 0
verbosity = 0

[execution]
threads = 1
max_rounds = 10000
failure_policy = "abort"
scheduling = "in_order"

[cluster]
nodes = 1
ack_timeout_ms = 500
migration_retries = 3
gather_on_finish = true

[output]
# directory = "output"
"#
    .to_string()
}
