//! Agent Evaluation
//!
//! One round evaluates every local agent independently: process due
//! messages, then act. With more than one thread the agents are spread over
//! a rayon pool. Agents only touch their own state during evaluation, so the
//! outcome does not depend on the thread count.

use rayon::prelude::*;
use sim_types::{Identity, TimeInterval, TimePoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::Agent;
use crate::collection::AgentCollection;
use crate::error::KernelError;
use crate::seed::Seed;

/// Cooperative cancellation flag shared with the executor.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests that the run stop before the next agent is evaluated.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one round.
#[derive(Debug)]
pub struct Evaluation {
    /// Earliest next event over all agents that succeeded.
    pub next_event: TimePoint,
    /// Failed agents in identity order.
    pub failures: Vec<(Identity, KernelError)>,
}

pub struct Executor {
    pool: Option<rayon::ThreadPool>,
    threads: usize,
    stop: StopHandle,
}

impl Executor {
    pub fn new(threads: usize) -> Result<Self, KernelError> {
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("agent-worker-{}", i))
                .build()
                .map_err(|e| KernelError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            pool,
            threads: threads.max(1),
            stop: StopHandle::default(),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Evaluates every local agent for `round` of `interval`.
    pub fn evaluate(
        &self,
        agents: &mut AgentCollection,
        interval: TimeInterval,
        round: u64,
        sample: u64,
    ) -> Result<Evaluation, KernelError> {
        let stop = &self.stop;
        let local = agents.local_mut();
        let mut results: Vec<(Identity, Result<TimePoint, KernelError>)> = match &self.pool {
            None => local
                .iter_mut()
                .map(|(identity, agent)| {
                    let result = evaluate_agent(identity, &mut **agent, interval, round, sample, stop);
                    (identity.clone(), result)
                })
                .collect(),
            Some(pool) => pool.install(|| {
                local
                    .par_iter_mut()
                    .map(|(identity, agent)| {
                        let result = evaluate_agent(identity, &mut **agent, interval, round, sample, stop);
                        (identity.clone(), result)
                    })
                    .collect()
            }),
        };
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut next_event = interval.upper;
        let mut failures = Vec::new();
        for (identity, result) in results {
            match result {
                Ok(next) => next_event = next_event.min(next),
                Err(KernelError::Cancelled(at)) => return Err(KernelError::Cancelled(at)),
                Err(e) => failures.push((identity, e)),
            }
        }
        Ok(Evaluation {
            next_event,
            failures,
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("threads", &self.threads)
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

fn evaluate_agent(
    identity: &Identity,
    agent: &mut dyn Agent,
    interval: TimeInterval,
    round: u64,
    sample: u64,
    stop: &StopHandle,
) -> Result<TimePoint, KernelError> {
    if stop.is_stopped() {
        return Err(KernelError::Cancelled(interval));
    }
    let mut seed = Seed::for_agent(identity, interval, round, sample);
    let failed = |source| KernelError::Agent {
        agent: identity.clone(),
        interval,
        source,
    };
    let from_messages = agent.process_messages(interval, &mut seed).map_err(failed)?;
    let from_act = agent.act(interval, &mut seed).map_err(failed)?;
    let next = from_messages.min(from_act);
    if next < interval.lower {
        return Err(KernelError::EventInPast {
            agent: identity.clone(),
            reported: next,
            interval,
        });
    }
    Ok(next)
}
