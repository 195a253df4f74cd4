//! Multi-node runs over the in-process mesh: gathering, migration, routing
//! failures and lost migrants.

use serde::{Deserialize, Serialize};
use sim_cluster::{
    merge_outputs, ChannelTransport, Cluster, ClusterError, Frame, MigrationPlan, MigrationPolicy, Rebalance, Transport,
};
use sim_kernel::demo::{market_registry, MarketScenario};
use sim_kernel::{
    Agent, AgentCore, AgentRegistry, AgentResult, AgentSnapshot, Environment, KernelConfig, KernelError, MessageBody,
    Migratable, Model, OutputHandle, Scenario, Seed,
};
use sim_types::{Header, Identity, MessageCode, NodeId, TimeInterval, TimePoint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Ping;

impl MessageBody for Ping {
    const CODE: MessageCode = MessageCode::user(60);
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong;

impl MessageBody for Pong {
    const CODE: MessageCode = MessageCode::user(61);
}

/// Pings its partner once per time point and counts the replies.
#[derive(Serialize, Deserialize)]
struct Pinger {
    core: AgentCore,
    partner: Identity,
    last_ping: Option<TimePoint>,
    replies: u32,
    #[serde(skip)]
    pongs: OutputHandle<u32>,
}

impl Pinger {
    fn new(identity: Identity, partner: Identity) -> Result<Self, KernelError> {
        let mut pinger = Self {
            core: AgentCore::new(identity),
            partner,
            last_ping: None,
            replies: 0,
            pongs: OutputHandle::default(),
        };
        pinger.restore()?;
        Ok(pinger)
    }

    fn on_pong(&mut self, _: &Pong, header: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        self.replies += 1;
        self.pongs.put(header.received, self.replies);
        Ok(interval.upper)
    }
}

impl Agent for Pinger {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }

    fn act(&mut self, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        if self.last_ping != Some(interval.lower) {
            self.last_ping = Some(interval.lower);
            self.core
                .send(self.partner.clone(), interval.lower, interval.lower + 1, Ping)?;
        }
        Ok(interval.lower + 1)
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn snapshot(&self) -> Result<AgentSnapshot, KernelError> {
        AgentSnapshot::capture(self)
    }

    fn restore(&mut self) -> Result<(), KernelError> {
        self.core.register_callback(0, "count pong", Self::on_pong)?;
        self.pongs = self.core.create_output("pongs")?;
        Ok(())
    }
}

impl Migratable for Pinger {
    const KIND: &'static str = "pinger";
}

/// Answers every ping at once.
#[derive(Serialize, Deserialize)]
struct Ponger {
    core: AgentCore,
    #[serde(skip)]
    pings: OutputHandle<TimePoint>,
}

impl Ponger {
    fn new(identity: Identity) -> Result<Self, KernelError> {
        let mut ponger = Self {
            core: AgentCore::new(identity),
            pings: OutputHandle::default(),
        };
        ponger.restore()?;
        Ok(ponger)
    }

    fn on_ping(&mut self, _: &Ping, header: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        self.pings.put(interval.lower, header.sent);
        self.core
            .send(header.sender.clone(), interval.lower, interval.lower, Pong)?;
        Ok(interval.upper)
    }
}

impl Agent for Ponger {
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
        self.core.register_callback(0, "answer ping", Self::on_ping)?;
        self.pings = self.core.create_output("pings")?;
        Ok(())
    }
}

impl Migratable for Ponger {
    const KIND: &'static str = "ponger";
}

fn registry() -> AgentRegistry {
    AgentRegistry::new().with::<Pinger>().with::<Ponger>()
}

/// A pinger on the coordinator, its partner on node 1.
struct PingPong {
    partner: Identity,
}

impl Default for PingPong {
    fn default() -> Self {
        Self {
            partner: Identity::from([1, 0]),
        }
    }
}

impl<E: Environment> Scenario<E> for PingPong {
    fn initialize(&mut self, model: &mut Model<E>) -> Result<(), KernelError> {
        let partner = self.partner.clone();
        if model.environment().is_coordinator() {
            model.create(|identity| Pinger::new(identity, partner))?;
        } else {
            model.create(Ponger::new)?;
        }
        Ok(())
    }
}

/// Every ponger starts on the coordinator.
struct Crowd {
    size: usize,
}

impl<E: Environment> Scenario<E> for Crowd {
    fn initialize(&mut self, model: &mut Model<E>) -> Result<(), KernelError> {
        if model.environment().is_coordinator() {
            for _ in 0..self.size {
                model.create(Ponger::new)?;
            }
        }
        Ok(())
    }
}

/// Drops the first `drops` migrant frames it is asked to send.
struct Lossy<T> {
    inner: T,
    drops: AtomicUsize,
}

impl<T: Transport> Transport for Lossy<T> {
    fn node(&self) -> NodeId {
        self.inner.node()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn send(&self, to: NodeId, frame: &Frame) -> Result<(), ClusterError> {
        if matches!(frame, Frame::Migrant { .. }) {
            let dropped = self
                .drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
            if dropped.is_ok() {
                return Ok(());
            }
        }
        self.inner.send(to, frame)
    }

    fn recv(&self, from: NodeId, timeout: Option<Duration>) -> Result<Frame, ClusterError> {
        self.inner.recv(from, timeout)
    }
}

/// Node 1 loses its first `drops` migrants.
fn lossy_mesh(drops: usize) -> Vec<Lossy<ChannelTransport>> {
    ChannelTransport::mesh(2)
        .into_iter()
        .map(|inner| {
            let drops = if inner.node() == NodeId(1) { drops } else { 0 };
            Lossy {
                inner,
                drops: AtomicUsize::new(drops),
            }
        })
        .collect()
}

fn config(nodes: usize, end: TimePoint) -> KernelConfig {
    let mut config = KernelConfig::default();
    config.simulation.end = end;
    config.cluster.nodes = nodes;
    config.cluster.ack_timeout_ms = 50;
    config
}

fn move_partner_at(at: TimePoint) -> impl Fn(NodeId) -> Box<dyn MigrationPolicy> + Send + Sync + 'static {
    move |_| -> Box<dyn MigrationPolicy> { Box::new(MigrationPlan::new().then(at, Identity::from([1, 0]), NodeId(0))) }
}

fn series_len(outputs: &sim_kernel::AgentOutputs, name: &str) -> usize {
    outputs
        .get(name)
        .and_then(|series| series.as_array())
        .map(Vec::len)
        .unwrap_or(0)
}

#[test]
fn test_market_gathers_on_coordinator() {
    let cluster = Cluster::new(config(3, 5), market_registry());
    let reports = cluster
        .run(|_| MarketScenario {
            traders: 9,
            ..MarketScenario::default()
        })
        .unwrap();

    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].local_agents.len(), 10);
    assert!(reports[1].local_agents.is_empty());
    assert!(reports[2].local_agents.is_empty());
    assert_eq!(reports[1].stats.migrations_out, 3);
    assert_eq!(reports[0].stats.migrations_in, 6);

    // lockstep: every node ran the same steps
    assert!(reports.iter().all(|r| r.summary.steps == reports[0].summary.steps));
    assert!(reports.iter().all(|r| r.summary.time == 5));

    let outputs = merge_outputs(&reports);
    assert_eq!(outputs.len(), 10);
    assert!(outputs.contains_key(&MarketScenario::exchange_identity()));
}

#[test]
fn test_messages_follow_a_migrated_agent() {
    let mut cfg = config(2, 6);
    cfg.cluster.gather_on_finish = false;
    let cluster = Cluster::new(cfg, registry()).with_policy(move_partner_at(2));
    let reports = cluster.run(|_| PingPong::default()).unwrap();

    assert_eq!(
        reports[0].local_agents,
        vec![Identity::from([0, 0]), Identity::from([1, 0])]
    );
    assert!(reports[1].local_agents.is_empty());
    assert_eq!(reports[1].stats.migrations_out, 1);
    assert_eq!(reports[0].stats.migrations_in, 1);
    assert!(reports[0].stats.remote_messages > 0);

    // pings delivered at 1..=5 are answered; outputs recorded before the
    // move travel with the agent
    let outputs = merge_outputs(&reports);
    assert_eq!(series_len(&outputs[&Identity::from([1, 0])], "pings"), 5);
    assert_eq!(series_len(&outputs[&Identity::from([0, 0])], "pongs"), 5);
}

#[test]
fn test_rebalance_spreads_agents() {
    let mut cfg = config(3, 3);
    cfg.cluster.gather_on_finish = false;
    let cluster = Cluster::new(cfg, registry()).with_policy(|_| -> Box<dyn MigrationPolicy> { Box::new(Rebalance { tolerance: 1 }) });
    let reports = cluster.run(|_| Crowd { size: 7 }).unwrap();

    let counts: Vec<usize> = reports.iter().map(|r| r.local_agents.len()).collect();
    assert_eq!(counts, vec![3, 3, 1]);
    assert_eq!(reports[0].stats.migrations_out, 4);
    assert_eq!(
        reports[1].local_agents,
        vec![Identity::from([0, 4]), Identity::from([0, 5]), Identity::from([0, 6])]
    );
    assert_eq!(reports[2].local_agents, vec![Identity::from([0, 3])]);
}

#[test]
fn test_unknown_recipient_fails_the_cluster() {
    let cluster = Cluster::new(config(2, 4), registry());
    let result = cluster.run(|_| PingPong {
        partner: Identity::from([5, 5]),
    });
    match result {
        Err(ClusterError::Kernel(KernelError::RecipientNotFound { sender, recipient, .. })) => {
            assert_eq!(sender, Identity::from([0, 0]));
            assert_eq!(recipient, Identity::from([5, 5]));
        }
        other => panic!("expected routing failure, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_lost_migrant_is_resent() {
    let mut cfg = config(2, 6);
    cfg.cluster.gather_on_finish = false;
    let cluster = Cluster::new(cfg, registry()).with_policy(move_partner_at(2));
    let reports = cluster.run_on(lossy_mesh(1), |_| PingPong::default()).unwrap();

    assert!(reports[1].stats.resends >= 1);
    assert_eq!(reports[0].stats.migrations_in, 1);
    assert!(reports[0].local_agents.contains(&Identity::from([1, 0])));
    let outputs = merge_outputs(&reports);
    assert_eq!(series_len(&outputs[&Identity::from([0, 0])], "pongs"), 5);
}

#[test]
fn test_migrant_never_acknowledged() {
    let mut cfg = config(2, 6);
    cfg.cluster.gather_on_finish = false;
    cfg.cluster.migration_retries = 2;
    let cluster = Cluster::new(cfg, registry()).with_policy(move_partner_at(2));
    let result = cluster.run_on(lossy_mesh(usize::MAX), |_| PingPong::default());
    match result {
        Err(ClusterError::MigrationUnacknowledged { migration, attempts }) => {
            assert_eq!(attempts, 3);
            assert_eq!(migration.migrant, Identity::from([1, 0]));
            assert_eq!(migration.source, NodeId(1));
        }
        other => panic!("expected unacknowledged migration, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_cluster_runs_are_reproducible() {
    let run = || {
        let cluster = Cluster::new(config(2, 8), market_registry()).with_policy(|_| -> Box<dyn MigrationPolicy> { Box::new(Rebalance::default()) });
        merge_outputs(&cluster.run(|_| MarketScenario::default()).unwrap())
    };
    assert_eq!(run(), run());
}

#[test]
fn test_outputs_written_per_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(2, 4);
    cfg.cluster.gather_on_finish = false;
    cfg.output.directory = Some(dir.path().to_path_buf());
    Cluster::new(cfg, registry()).run(|_| PingPong::default()).unwrap();

    for node in 0..2 {
        let path = dir.path().join(format!("outputs-node-{}.jsonl", node));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
    }
}
