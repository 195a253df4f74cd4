//! Distributed Environment
//!
//! Runs one node of a cluster. Every round each node announces its
//! activations and deactivations, trades message batches with every other
//! node and takes part in the minimum reduction of the next event, so all
//! nodes step in lockstep and every node knows where every agent lives.
//!
//! After each step agents may migrate. Migration is a handshake:
//! 1. Sources snapshot the agents they propose to move and tell the targets
//! 2. Targets accept proposals that match their view of agent locations
//! 3. Accepted migrations are broadcast so every node updates its locations
//! 4. Sources send the snapshots, targets install them and acknowledge
//! 5. Sources drop their copy once acknowledged, resending on timeout
//!
//! On the final step every agent can be gathered onto the coordinator.

use sim_kernel::{
    route_local, AgentCollection, AgentRegistry, AgentSnapshot, ClusterConfig, Delivery, Environment,
    KernelError, Message, StepSummary,
};
use sim_types::{Activation, Deactivation, Identity, Migration, NodeId, TimeInterval, TimePoint};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collective::{unexpected, Collective};
use crate::error::ClusterError;
use crate::migration::{ClusterView, MigrationPolicy, Stationary};
use crate::transport::{Frame, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Normal,
    MigratingOut,
    MigratingIn,
}

/// Counters kept by one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub migrations_out: u64,
    pub migrations_in: u64,
    pub resends: u64,
    pub remote_messages: u64,
}

struct Outgoing {
    migration: Migration,
    snapshot: AgentSnapshot,
    attempts: u32,
    acknowledged: bool,
}

pub struct DistributedEnvironment<T> {
    collective: Collective<T>,
    registry: AgentRegistry,
    policy: Box<dyn MigrationPolicy>,
    locations: BTreeMap<Identity, NodeId>,
    relocated: Vec<Activation>,
    state: NodeState,
    ack_timeout: Duration,
    retries: u32,
    gather_on_finish: bool,
    loads: Vec<u64>,
    epoch: u64,
    stats: ClusterStats,
}

impl<T: Transport> DistributedEnvironment<T> {
    pub fn new(transport: T, registry: AgentRegistry, config: &ClusterConfig) -> Self {
        let size = transport.size();
        Self {
            collective: Collective::new(transport),
            registry,
            policy: Box::new(Stationary),
            locations: BTreeMap::new(),
            relocated: Vec::new(),
            state: NodeState::Normal,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            retries: config.migration_retries,
            gather_on_finish: config.gather_on_finish,
            loads: vec![0; size],
            epoch: 0,
            stats: ClusterStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn MigrationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn stats(&self) -> ClusterStats {
        self.stats
    }

    /// Node each known agent lives on.
    pub fn locations(&self) -> &BTreeMap<Identity, NodeId> {
        &self.locations
    }

    pub fn location_of(&self, identity: &Identity) -> Option<NodeId> {
        self.locations.get(identity).copied()
    }

    /// Local agent counts gathered after the last step, in rank order.
    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    fn migrate(&mut self, step: &StepSummary, agents: &mut AgentCollection) -> Result<(), ClusterError> {
        let me = self.node();
        let size = self.node_count();
        self.epoch += 1;
        let epoch = self.epoch;

        let proposals = if step.is_final() && self.gather_on_finish {
            if me.is_coordinator() {
                Vec::new()
            } else {
                agents
                    .local_identities()
                    .map(|migrant| Migration {
                        source: me,
                        target: NodeId::COORDINATOR,
                        migrant: migrant.clone(),
                    })
                    .collect()
            }
        } else {
            let view = ClusterView {
                node: me,
                size,
                step,
                agents: &*agents,
                locations: &self.locations,
                loads: &self.loads,
            };
            self.policy.propose(&view)
        };

        // snapshot at proposal time; the agent does not run again before it leaves
        let mut snapshots: BTreeMap<Migration, AgentSnapshot> = BTreeMap::new();
        for migration in proposals {
            if migration.source != me || migration.target == me || migration.target.index() >= size {
                warn!(%migration, "ignoring malformed migration proposal");
                continue;
            }
            let Some(agent) = agents.get(&migration.migrant) else {
                warn!(%migration, "ignoring proposal for an agent not on this node");
                continue;
            };
            match agent.snapshot() {
                Ok(snapshot) => {
                    snapshots.insert(migration, snapshot);
                }
                Err(KernelError::NotMigratable(_)) => {
                    debug!(%migration, "agent cannot migrate, staying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut per_target: Vec<Vec<Migration>> = (0..size).map(|_| Vec::new()).collect();
        for migration in snapshots.keys() {
            per_target[migration.target.index()].push(migration.clone());
        }
        let received = self
            .collective
            .all_to_all(per_target.into_iter().map(Frame::Proposals).collect())?;

        let mut accepted = Vec::new();
        for (peer, frame) in received.into_iter().enumerate() {
            let proposed = match frame {
                Frame::Proposals(proposed) => proposed,
                other => return Err(unexpected(peer, "proposals", &other)),
            };
            for migration in proposed {
                if migration.target == me && self.locations.get(&migration.migrant) == Some(&migration.source) {
                    accepted.push(migration);
                } else {
                    warn!(%migration, "rejecting migration proposal");
                }
            }
        }

        let announced = self.collective.broadcast(Frame::Accepted(accepted))?;
        let mut migrations = Vec::new();
        for (peer, frame) in announced.into_iter().enumerate() {
            let list = match frame {
                Frame::Accepted(list) => list,
                other => return Err(unexpected(peer, "accepted", &other)),
            };
            migrations.extend(list);
        }
        migrations.sort();
        migrations.dedup();
        if migrations.is_empty() {
            return Ok(());
        }

        for migration in &migrations {
            self.locations.insert(migration.migrant.clone(), migration.target);
        }
        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        for migration in migrations {
            if migration.source == me {
                let snapshot = snapshots
                    .remove(&migration)
                    .ok_or_else(|| ClusterError::Invalid(format!("accepted {} was never proposed", migration)))?;
                outgoing.push(Outgoing {
                    migration,
                    snapshot,
                    attempts: 0,
                    acknowledged: false,
                });
            } else if migration.target == me {
                incoming.push(migration);
            }
        }
        info!(epoch, outgoing = outgoing.len(), incoming = incoming.len(), "migrating agents");
        self.hand_off(epoch, outgoing, incoming, agents)
    }

    fn hand_off(
        &mut self,
        epoch: u64,
        mut outgoing: Vec<Outgoing>,
        incoming: Vec<Migration>,
        agents: &mut AgentCollection,
    ) -> Result<(), ClusterError> {
        let me = self.node();

        if !outgoing.is_empty() {
            self.state = NodeState::MigratingOut;
        }
        for out in &mut outgoing {
            self.collective.expect_ack(epoch, out.migration.clone());
            self.send_migrant(epoch, out)?;
        }

        if !incoming.is_empty() {
            self.state = NodeState::MigratingIn;
        }
        for migration in &incoming {
            // a source only resends once its own incoming migrants are in,
            // so keep our unacknowledged migrants moving while waiting.
            // Targets outwait the source's last resend.
            let mut waits = 0;
            let frame = loop {
                match self
                    .collective
                    .receive_matching(migration.source, Some(self.ack_timeout), |f| f.is_migrant(epoch, migration))
                {
                    Ok(frame) => break frame,
                    Err(ClusterError::Timeout { .. }) if waits <= self.retries + 1 => {
                        waits += 1;
                        self.resend_unacknowledged(epoch, &mut outgoing)?;
                    }
                    Err(ClusterError::Timeout { .. }) => {
                        return Err(ClusterError::MigrantMissing {
                            migration: migration.clone(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            };
            let snapshot = match frame {
                Frame::Migrant { snapshot, .. } => snapshot,
                other => return Err(unexpected(migration.source.index(), "migrant", &other)),
            };
            let agent = self.registry.restore(snapshot)?;
            agents.install(agent)?;
            self.collective.mark_installed(epoch, migration.clone());
            self.collective.send(
                migration.source,
                &Frame::Installed {
                    epoch,
                    migration: migration.clone(),
                },
            )?;
            self.relocated.push(Activation {
                location: me,
                activated: migration.migrant.clone(),
            });
            self.stats.migrations_in += 1;
            debug!(%migration, "migrant installed");
        }

        for index in 0..outgoing.len() {
            while !outgoing[index].acknowledged {
                let migration = outgoing[index].migration.clone();
                match self
                    .collective
                    .receive_matching(migration.target, Some(self.ack_timeout), |f| f.is_installed(epoch, &migration))
                {
                    Ok(_) => outgoing[index].acknowledged = true,
                    Err(ClusterError::Timeout { .. }) => {
                        let out = &mut outgoing[index];
                        if out.attempts > self.retries {
                            return Err(ClusterError::MigrationUnacknowledged {
                                migration,
                                attempts: out.attempts,
                            });
                        }
                        warn!(%migration, attempt = out.attempts + 1, "migrant unacknowledged, resending");
                        self.stats.resends += 1;
                        self.send_migrant(epoch, out)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for out in outgoing {
            self.collective.ack_received(epoch, &out.migration);
            agents.remove_local(&out.migration.migrant);
            self.stats.migrations_out += 1;
            debug!(migration = %out.migration, "migrant handed off");
        }
        self.state = NodeState::Normal;
        Ok(())
    }

    fn send_migrant(&self, epoch: u64, out: &mut Outgoing) -> Result<(), ClusterError> {
        out.attempts += 1;
        self.collective.send(
            out.migration.target,
            &Frame::Migrant {
                epoch,
                migration: out.migration.clone(),
                snapshot: out.snapshot.clone(),
            },
        )
    }

    fn resend_unacknowledged(&mut self, epoch: u64, outgoing: &mut [Outgoing]) -> Result<(), ClusterError> {
        for out in outgoing.iter_mut().filter(|out| !out.acknowledged) {
            let target = out.migration.target;
            let migration = out.migration.clone();
            if self
                .collective
                .take_buffered(target, |f| f.is_installed(epoch, &migration))
                .is_some()
            {
                out.acknowledged = true;
                continue;
            }
            if out.attempts > self.retries {
                return Err(ClusterError::MigrationUnacknowledged {
                    migration,
                    attempts: out.attempts,
                });
            }
            self.stats.resends += 1;
            self.send_migrant(epoch, out)?;
        }
        Ok(())
    }

    fn announce_activations(&mut self, local: Vec<Identity>, agents: &mut AgentCollection) -> Result<usize, ClusterError> {
        let me = self.node();
        let mut records: Vec<Activation> = local
            .into_iter()
            .map(|activated| Activation { location: me, activated })
            .collect();
        records.append(&mut self.relocated);

        let mut applied = 0;
        for (peer, frame) in self.collective.broadcast(Frame::Activations(records))?.into_iter().enumerate() {
            let received = match frame {
                Frame::Activations(received) => received,
                other => return Err(unexpected(peer, "activations", &other)),
            };
            if peer == me.index() {
                continue;
            }
            for record in received {
                debug!(agent = %record.activated, location = %record.location, "remote activation");
                self.locations.insert(record.activated.clone(), record.location);
                agents.register_remote(record.activated);
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn announce_deactivations(&mut self, local: Vec<Identity>, agents: &mut AgentCollection) -> Result<usize, ClusterError> {
        let me = self.node();
        let records: Vec<Deactivation> = local.into_iter().map(|deactivated| Deactivation { deactivated }).collect();

        let mut applied = 0;
        for (peer, frame) in self.collective.broadcast(Frame::Deactivations(records))?.into_iter().enumerate() {
            let received = match frame {
                Frame::Deactivations(received) => received,
                other => return Err(unexpected(peer, "deactivations", &other)),
            };
            if peer == me.index() {
                continue;
            }
            for record in received {
                debug!(agent = %record.deactivated, "remote deactivation");
                self.locations.remove(&record.deactivated);
                agents.forget_remote(&record.deactivated);
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn exchange_messages(
        &mut self,
        agents: &mut AgentCollection,
        interval: TimeInterval,
    ) -> Result<Delivery, ClusterError> {
        let me = self.node();
        let size = self.node_count();
        let mut incoming = Vec::new();
        let mut remote: Vec<Vec<Message>> = (0..size).map(|_| Vec::new()).collect();
        for message in agents.drain_outboxes() {
            if agents.contains_local(message.recipient()) {
                incoming.push(message);
                continue;
            }
            match self.locations.get(message.recipient()) {
                Some(node) if *node != me => remote[node.index()].push(message),
                _ => {
                    return Err(KernelError::RecipientNotFound {
                        sender: message.sender().clone(),
                        recipient: message.recipient().clone(),
                        interval,
                    }
                    .into())
                }
            }
        }
        let forwarded: usize = remote.iter().map(Vec::len).sum();

        for (peer, frame) in self
            .collective
            .all_to_all(remote.into_iter().map(Frame::Messages).collect())?
            .into_iter()
            .enumerate()
        {
            let batch = match frame {
                Frame::Messages(batch) => batch,
                other => return Err(unexpected(peer, "messages", &other)),
            };
            incoming.extend(batch);
        }

        // same order as a single node would deliver in
        incoming.sort_by(|a, b| a.sender().cmp(b.sender()));
        let mut delivery = route_local(agents, incoming, interval)?;
        delivery.forwarded = forwarded;
        self.stats.remote_messages += forwarded as u64;
        Ok(delivery)
    }
}

impl<T: Transport> Environment for DistributedEnvironment<T> {
    fn node(&self) -> NodeId {
        self.collective.node()
    }

    fn node_count(&self) -> usize {
        self.collective.size()
    }

    fn output_file_name(&self) -> String {
        format!("outputs-{}.jsonl", self.node())
    }

    fn activate_agent(&mut self, identity: &Identity, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        debug!(agent = %identity, "activate");
        let me = self.node();
        self.locations.insert(identity.clone(), me);
        Ok(())
    }

    fn deactivate_agent(&mut self, identity: &Identity, _agents: &mut AgentCollection) -> Result<(), KernelError> {
        debug!(agent = %identity, "deactivate");
        self.locations.remove(identity);
        Ok(())
    }

    fn activate(&mut self, agents: &mut AgentCollection) -> Result<usize, KernelError> {
        let local = agents.take_activated();
        for identity in &local {
            self.activate_agent(identity, agents)?;
        }
        let count = local.len();
        self.announce_activations(local, agents)?;
        Ok(count)
    }

    fn deactivate(&mut self, agents: &mut AgentCollection) -> Result<usize, KernelError> {
        let local = agents.take_deactivated();
        for identity in &local {
            self.deactivate_agent(identity, agents)?;
            agents.finalize(identity)?;
        }
        let count = local.len();
        self.announce_deactivations(local, agents)?;
        Ok(count)
    }

    fn send_messages(&mut self, agents: &mut AgentCollection, interval: TimeInterval) -> Result<Delivery, KernelError> {
        Ok(self.exchange_messages(agents, interval)?)
    }

    fn agree_next_event(&mut self, candidate: TimePoint) -> Result<TimePoint, KernelError> {
        Ok(self.collective.all_reduce_min(candidate)?)
    }

    fn after_step(&mut self, step: &StepSummary, agents: &mut AgentCollection) -> Result<(), KernelError> {
        self.loads = self.collective.all_gather(agents.local_count() as u64)?;
        if self.is_coordinator() {
            debug!(time = step.interval.lower, loads = ?self.loads, "agents per node");
        }
        Ok(self.migrate(step, agents)?)
    }
}
