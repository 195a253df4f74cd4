//! Model
//!
//! Owns the agents and the environment and advances simulated time.
//!
//! Each step covers `[time, end)` and repeats rounds until every node agrees
//! the next event lies beyond the step's lower bound:
//! 1. Evaluate every local agent (process due messages, then act)
//! 2. Activate children spawned this round and announce them
//! 3. Route outgoing messages
//! 4. Deactivate agents that retired this round
//! 5. Agree on the earliest next event over agents and undelivered messages
//!
//! Messages delivered at or before the lower bound therefore trigger another
//! round within the same step.

use sim_types::{Identity, TimeInterval, TimePoint};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};

use crate::agent::Agent;
use crate::collection::{AgentCollection, AgentOutputs};
use crate::communicator::Scheduling;
use crate::config::{FailurePolicy, KernelConfig};
use crate::entity::Entity;
use crate::environment::{Environment, LocalEnvironment, StepSummary};
use crate::error::KernelError;
use crate::executor::{Executor, StopHandle};
use crate::outputs::OutputWriter;

/// Builds the initial population and inspects the final state.
pub trait Scenario<E: Environment = LocalEnvironment> {
    fn initialize(&mut self, model: &mut Model<E>) -> Result<(), KernelError>;

    fn terminate(&mut self, _model: &mut Model<E>) -> Result<(), KernelError> {
        Ok(())
    }
}

/// Totals of a completed run on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub rounds: u64,
    pub messages: u64,
    pub local_agents: usize,
    pub time: TimePoint,
}

pub struct Model<E: Environment = LocalEnvironment> {
    start: TimePoint,
    end: TimePoint,
    time: TimePoint,
    sample: u64,
    world: Entity,
    agents: AgentCollection,
    environment: E,
    executor: Executor,
    max_rounds: Option<u64>,
    failure_policy: FailurePolicy,
    scheduling: Scheduling,
    verbosity: u64,
    output_directory: Option<PathBuf>,
    steps: u64,
    rounds: u64,
    messages: u64,
    span: tracing::Span,
}

impl Model<LocalEnvironment> {
    /// A model running in a single process.
    pub fn new(config: &KernelConfig) -> Result<Self, KernelError> {
        Self::with_environment(config, LocalEnvironment::new())
    }
}

impl<E: Environment> Model<E> {
    pub fn with_environment(config: &KernelConfig, environment: E) -> Result<Self, KernelError> {
        let simulation = &config.simulation;
        TimeInterval::new(simulation.start, simulation.end)?;
        let world = Entity::new(environment.root_identity());
        let span = info_span!("model", sample = simulation.sample, node = %environment.node());
        Ok(Self {
            start: simulation.start,
            end: simulation.end,
            time: simulation.start,
            sample: simulation.sample,
            world,
            agents: AgentCollection::new(),
            environment,
            executor: Executor::new(config.execution.threads)?,
            max_rounds: config.execution.max_rounds,
            failure_policy: config.execution.failure_policy,
            scheduling: config.execution.scheduling,
            verbosity: simulation.verbosity,
            output_directory: config.output.directory.clone(),
            steps: 0,
            rounds: 0,
            messages: 0,
            span,
        })
    }

    pub fn start(&self) -> TimePoint {
        self.start
    }

    pub fn end(&self) -> TimePoint {
        self.end
    }

    /// Current simulated time.
    pub fn time(&self) -> TimePoint {
        self.time
    }

    pub fn sample(&self) -> u64 {
        self.sample
    }

    /// Scheduling configured for agents this model's scenarios build.
    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    pub fn world(&self) -> &Entity {
        &self.world
    }

    pub fn agents(&self) -> &AgentCollection {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut AgentCollection {
        &mut self.agents
    }

    pub fn environment(&self) -> &E {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut E {
        &mut self.environment
    }

    /// Handle to cancel the run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.executor.stop_handle()
    }

    /// Creates a top-level agent as a child of this node's world entity.
    pub fn create<A, F>(&mut self, build: F) -> Result<Identity, KernelError>
    where
        A: Agent,
        F: FnOnce(Identity) -> Result<A, KernelError>,
    {
        let identity = self.world.create_child();
        let agent = build(identity.clone())?;
        if agent.identity() != &identity {
            return Err(KernelError::IdentityMismatch {
                expected: identity,
                found: agent.identity().clone(),
            });
        }
        self.agents.activate(Box::new(agent))
    }

    /// Runs one step over `interval`, returning the agreed next event.
    pub fn step(&mut self, interval: TimeInterval) -> Result<TimePoint, KernelError> {
        let _step = info_span!(parent: &self.span, "step", lower = interval.lower).entered();
        self.environment.before_step(interval, &mut self.agents)?;

        let mut round: u64 = 0;
        let next_event = loop {
            if let Some(limit) = self.max_rounds {
                if round >= limit {
                    return Err(KernelError::RoundLimitExceeded { interval, rounds: round });
                }
            }
            if self.verbosity > 0 && self.rounds % self.verbosity == 0 {
                info!(
                    time = interval.lower,
                    rounds = self.rounds,
                    agents = self.agents.local_count(),
                    "progress"
                );
            }

            let evaluation = self
                .executor
                .evaluate(&mut self.agents, interval, round, self.sample)?;
            if !evaluation.failures.is_empty() {
                match self.failure_policy {
                    FailurePolicy::Abort => {
                        if let Some((_, error)) = evaluation.failures.into_iter().next() {
                            return Err(error);
                        }
                    }
                    FailurePolicy::Deactivate => {
                        // retired after routing, so this round's messages to it still land
                        for (identity, error) in evaluation.failures {
                            warn!(agent = %identity, error = %error, "deactivating failed agent");
                            match self.agents.get_mut(&identity) {
                                Some(agent) => agent.core_mut().retire(),
                                None => return Err(KernelError::UnknownAgent(identity)),
                            }
                        }
                    }
                }
            }

            self.agents.adopt_spawned()?;
            self.environment.activate(&mut self.agents)?;
            let delivery = self.environment.send_messages(&mut self.agents, interval)?;
            self.messages += (delivery.delivered + delivery.forwarded) as u64;
            self.agents.collect_retiring()?;
            self.environment.deactivate(&mut self.agents)?;

            let mut candidate = evaluation.next_event.min(interval.upper);
            if let Some(pending) = self.agents.earliest_pending() {
                candidate = candidate.min(pending.max(interval.lower));
            }
            let agreed = self.environment.agree_next_event(candidate)?;

            round += 1;
            self.rounds += 1;
            debug!(round, candidate, agreed, delivered = delivery.delivered, "round complete");
            if agreed > interval.lower || agreed >= interval.upper {
                break agreed;
            }
        };

        let summary = StepSummary {
            interval,
            next_event,
            rounds: round,
            end: self.end,
        };
        self.environment.after_step(&summary, &mut self.agents)?;
        self.steps += 1;
        debug!(next_event, rounds = round, "step complete");
        Ok(next_event)
    }

    /// Initializes the scenario, steps until the end time and terminates it.
    ///
    /// Outputs are written when an output directory is configured.
    pub fn run<S: Scenario<E>>(&mut self, scenario: &mut S) -> Result<RunSummary, KernelError> {
        let _run = self.span.clone().entered();
        info!(
            start = self.start,
            end = self.end,
            threads = self.executor.threads(),
            "run starting"
        );

        scenario.initialize(self)?;
        while self.time < self.end {
            let interval = TimeInterval::new(self.time, self.end)?;
            self.time = self.step(interval)?;
        }
        scenario.terminate(self)?;

        if let Some(directory) = self.output_directory.clone() {
            self.write_outputs(&directory)?;
        }

        let summary = self.summary();
        info!(
            steps = summary.steps,
            rounds = summary.rounds,
            messages = summary.messages,
            agents = summary.local_agents,
            "run complete"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            steps: self.steps,
            rounds: self.rounds,
            messages: self.messages,
            local_agents: self.agents.local_count(),
            time: self.time,
        }
    }

    /// Outputs of every agent on this node, by identity.
    pub fn outputs(&self) -> Result<BTreeMap<Identity, AgentOutputs>, KernelError> {
        self.agents.outputs()
    }

    /// Writes this node's outputs as JSONL into `directory`.
    pub fn write_outputs(&self, directory: &Path) -> Result<PathBuf, KernelError> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(self.environment.output_file_name());
        let mut writer = OutputWriter::new(&path)?;
        writer.write_all(&self.outputs()?)?;
        writer.flush()?;
        info!(path = %path.display(), records = writer.record_count(), "outputs written");
        Ok(path)
    }
}
