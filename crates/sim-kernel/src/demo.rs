//! Market Scenario
//!
//! A small population used by the `kernel_sim` binary and the integration
//! tests: traders send random limit orders to a single exchange, which keeps
//! them in a fixed-capacity book, crosses them and replies with fills. Orders
//! and fills for the same time point settle within one step.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sim_types::{Header, Identity, MessageCode, NodeId, TimeDuration, TimeInterval, TimePoint};

use crate::agent::{Agent, AgentCore, AgentSnapshot, Migratable};
use crate::communicator::Scheduling;
use crate::environment::Environment;
use crate::error::{AgentResult, KernelError};
use crate::message::MessageBody;
use crate::model::{Model, Scenario};
use crate::outputs::OutputHandle;
use crate::pool::{BlockPool, PoolError};
use crate::registry::AgentRegistry;
use crate::seed::Seed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub side: Side,
    pub price: u64,
    pub quantity: u64,
}

impl MessageBody for Order {
    const CODE: MessageCode = MessageCode::user(0x100);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub side: Side,
    pub price: u64,
    pub quantity: u64,
}

impl MessageBody for Fill {
    const CODE: MessageCode = MessageCode::user(0x101);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    pub reason: String,
}

impl MessageBody for Rejected {
    const CODE: MessageCode = MessageCode::user(0x102);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestingOrder {
    owner: Identity,
    side: Side,
    price: u64,
    quantity: u64,
}

/// Collects orders and matches them at the ask price.
#[derive(Serialize, Deserialize)]
pub struct Exchange {
    core: AgentCore,
    book: BlockPool<RestingOrder>,
    pending_match: bool,
    rejected: u64,
    #[serde(skip)]
    volume: OutputHandle<u64>,
    #[serde(skip)]
    rejections: OutputHandle<u64>,
}

impl Exchange {
    pub fn new(identity: Identity, capacity: usize, scheduling: Scheduling) -> Result<Self, KernelError> {
        let mut exchange = Self {
            core: AgentCore::with_scheduling(identity, scheduling),
            book: BlockPool::new(capacity),
            pending_match: false,
            rejected: 0,
            volume: OutputHandle::default(),
            rejections: OutputHandle::default(),
        };
        exchange.restore()?;
        Ok(exchange)
    }

    /// Orders resting in the book.
    pub fn depth(&self) -> usize {
        self.book.len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn on_order(&mut self, order: &Order, header: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        let resting = RestingOrder {
            owner: header.sender.clone(),
            side: order.side,
            price: order.price,
            quantity: order.quantity,
        };
        match self.book.insert(resting) {
            Ok(_) => self.pending_match = true,
            Err(e @ PoolError::Capacity { .. }) => {
                self.rejected += 1;
                self.rejections.put(interval.lower, self.rejected);
                self.core.send(
                    header.sender.clone(),
                    interval.lower,
                    interval.lower,
                    Rejected { reason: e.to_string() },
                )?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(interval.upper)
    }

    fn best(&self, side: Side) -> Option<(u64, RestingOrder)> {
        let mut best: Option<(u64, &RestingOrder)> = None;
        for (index, order) in self.book.iter().filter(|(_, o)| o.side == side) {
            let better = match best {
                None => true,
                Some((_, current)) => match side {
                    Side::Buy => order.price > current.price,
                    Side::Sell => order.price < current.price,
                },
            };
            if better {
                best = Some((index, order));
            }
        }
        best.map(|(index, order)| (index, order.clone()))
    }

    fn reduce(&mut self, index: u64, quantity: u64) -> Result<(), PoolError> {
        let order = self.book.get_mut(index)?;
        order.quantity -= quantity;
        if order.quantity == 0 {
            self.book.remove(index)?;
        }
        Ok(())
    }

    /// Crosses the book until the best bid is below the best ask.
    fn match_orders(&mut self, time: TimePoint) -> Result<u64, KernelError> {
        let mut volume = 0;
        while let (Some((bid_index, bid)), Some((ask_index, ask))) = (self.best(Side::Buy), self.best(Side::Sell)) {
            if bid.price < ask.price {
                break;
            }
            let quantity = bid.quantity.min(ask.quantity);
            let price = ask.price;
            self.core.send(bid.owner, time, time, Fill { side: Side::Buy, price, quantity })?;
            self.core.send(ask.owner, time, time, Fill { side: Side::Sell, price, quantity })?;
            self.reduce(bid_index, quantity)?;
            self.reduce(ask_index, quantity)?;
            volume += quantity;
        }
        Ok(volume)
    }
}

impl Agent for Exchange {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }

    fn act(&mut self, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        if self.pending_match {
            self.pending_match = false;
            let volume = self.match_orders(interval.lower)?;
            if volume > 0 {
                self.volume.put(interval.lower, volume);
            }
        }
        Ok(interval.upper)
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn snapshot(&self) -> Result<AgentSnapshot, KernelError> {
        AgentSnapshot::capture(self)
    }

    fn restore(&mut self) -> Result<(), KernelError> {
        self.core.register_callback(0, "book order", Self::on_order)?;
        self.volume = self.core.create_output("volume")?;
        self.rejections = self.core.create_output("rejections")?;
        Ok(())
    }
}

impl Migratable for Exchange {
    const KIND: &'static str = "exchange";
}

/// Quotes once per period and tracks its position from fills.
#[derive(Serialize, Deserialize)]
pub struct Trader {
    core: AgentCore,
    exchange: Identity,
    period: TimeDuration,
    next_quote: TimePoint,
    position: i64,
    cash: i64,
    rejected: u64,
    #[serde(skip)]
    positions: OutputHandle<i64>,
}

impl Trader {
    pub fn new(
        identity: Identity,
        exchange: Identity,
        period: TimeDuration,
        scheduling: Scheduling,
    ) -> Result<Self, KernelError> {
        let mut trader = Self {
            core: AgentCore::with_scheduling(identity, scheduling),
            exchange,
            period: period.max(1),
            next_quote: 0,
            position: 0,
            cash: 0,
            rejected: 0,
            positions: OutputHandle::default(),
        };
        trader.restore()?;
        Ok(trader)
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn cash(&self) -> i64 {
        self.cash
    }

    fn on_fill(&mut self, fill: &Fill, header: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        let quantity = fill.quantity as i64;
        let notional = quantity * fill.price as i64;
        match fill.side {
            Side::Buy => {
                self.position += quantity;
                self.cash -= notional;
            }
            Side::Sell => {
                self.position -= quantity;
                self.cash += notional;
            }
        }
        self.positions.put(header.received, self.position);
        Ok(interval.upper)
    }

    fn on_rejected(&mut self, rejected: &Rejected, _: &Header, interval: TimeInterval, _: &mut Seed) -> AgentResult {
        tracing::trace!(trader = %self.identity(), reason = %rejected.reason, "order rejected");
        self.rejected += 1;
        Ok(interval.upper)
    }
}

impl Agent for Trader {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }

    fn act(&mut self, interval: TimeInterval, seed: &mut Seed) -> AgentResult {
        if interval.lower >= self.next_quote {
            let side = if seed.gen_bool(0.5) { Side::Buy } else { Side::Sell };
            let order = Order {
                side,
                price: seed.gen_range(95..=105),
                quantity: seed.gen_range(1..=5),
            };
            self.core
                .send(self.exchange.clone(), interval.lower, interval.lower, order)?;
            self.next_quote = interval.lower + self.period;
        }
        Ok(self.next_quote)
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn snapshot(&self) -> Result<AgentSnapshot, KernelError> {
        AgentSnapshot::capture(self)
    }

    fn restore(&mut self) -> Result<(), KernelError> {
        self.core.register_callback(1, "apply fill", Self::on_fill)?;
        self.core.register_callback(0, "count rejection", Self::on_rejected)?;
        self.positions = self.core.create_output("position")?;
        Ok(())
    }
}

impl Migratable for Trader {
    const KIND: &'static str = "trader";
}

/// Every agent kind this scenario creates.
pub fn market_registry() -> AgentRegistry {
    AgentRegistry::new().with::<Exchange>().with::<Trader>()
}

/// One exchange on the coordinator, traders spread evenly over the nodes.
#[derive(Debug, Clone)]
pub struct MarketScenario {
    pub traders: usize,
    pub book_capacity: usize,
    pub period: TimeDuration,
}

impl Default for MarketScenario {
    fn default() -> Self {
        Self {
            traders: 16,
            book_capacity: 64,
            period: 1,
        }
    }
}

impl MarketScenario {
    /// The exchange is the first agent the coordinator creates.
    pub fn exchange_identity() -> Identity {
        Identity::from([u64::from(NodeId::COORDINATOR.0), 0])
    }

    /// Traders created on `node` out of `nodes`.
    pub fn traders_on(&self, node: NodeId, nodes: usize) -> usize {
        let nodes = nodes.max(1);
        self.traders / nodes + usize::from(node.index() < self.traders % nodes)
    }
}

impl<E: Environment> Scenario<E> for MarketScenario {
    fn initialize(&mut self, model: &mut Model<E>) -> Result<(), KernelError> {
        let exchange = Self::exchange_identity();
        let scheduling = model.scheduling();
        if model.environment().is_coordinator() {
            let capacity = self.book_capacity;
            let created = model.create(|identity| Exchange::new(identity, capacity, scheduling))?;
            if created != exchange {
                return Err(KernelError::IdentityMismatch {
                    expected: exchange,
                    found: created,
                });
            }
        }

        let count = self.traders_on(model.environment().node(), model.environment().node_count());
        for _ in 0..count {
            let exchange = exchange.clone();
            let period = self.period;
            model.create(|identity| Trader::new(identity, exchange, period, scheduling))?;
        }
        tracing::info!(node = %model.environment().node(), traders = count, "market initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn run_market(traders: usize, capacity: usize, end: TimePoint) -> Model {
        let mut config = KernelConfig::default();
        config.simulation.end = end;
        let mut model = Model::new(&config).unwrap();
        let mut scenario = MarketScenario {
            traders,
            book_capacity: capacity,
            period: 1,
        };
        model.run(&mut scenario).unwrap();
        model
    }

    #[test]
    fn test_positions_net_to_zero() {
        let model = run_market(8, 64, 20);
        let agents = model.agents();
        let mut net = 0;
        let mut cash = 0;
        for identity in agents.local_identities() {
            if let Some(trader) = agents.downcast_ref::<Trader>(identity) {
                net += trader.position();
                cash += trader.cash();
            }
        }
        assert_eq!(net, 0);
        assert_eq!(cash, 0);
    }

    #[test]
    fn test_orders_settle_within_step() {
        let model = run_market(8, 64, 5);
        // one step per time point: quotes, matching and fills take extra rounds
        assert_eq!(model.summary().steps, 5);
        assert!(model.summary().rounds > 5);
    }

    #[test]
    fn test_full_book_rejects_orders() {
        let model = run_market(6, 2, 10);
        let exchange = model
            .agents()
            .downcast_ref::<Exchange>(&MarketScenario::exchange_identity())
            .unwrap();
        assert!(exchange.depth() <= 2);
        assert!(exchange.rejected() > 0);
    }

    #[test]
    fn test_traders_split_over_nodes() {
        let scenario = MarketScenario {
            traders: 10,
            ..MarketScenario::default()
        };
        let counts: Vec<usize> = (0..3).map(|n| scenario.traders_on(NodeId(n), 3)).collect();
        assert_eq!(counts, vec![4, 3, 3]);
    }

    #[test]
    fn test_trader_snapshot_restores_callbacks() {
        let trader = Trader::new(
            Identity::from([0, 3]),
            MarketScenario::exchange_identity(),
            2,
            Scheduling::InOrder,
        )
        .unwrap();
        let restored = market_registry().restore(trader.snapshot().unwrap()).unwrap();
        assert_eq!(restored.kind(), "trader");
        assert_eq!(restored.core().communicator().callbacks().len(), 2);
    }
}
