//! Node Transport
//!
//! Point-to-point, ordered delivery of [`Frame`]s between the nodes of a
//! cluster. Frames are encoded to bytes so a transport behaves the same
//! whether the nodes share a process or not.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use sim_kernel::{AgentSnapshot, Message};
use sim_types::{Activation, Deactivation, Migration, NodeId, TimePoint};
use std::time::Duration;

use crate::error::ClusterError;

/// Everything one node says to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Activations(Vec<Activation>),
    Deactivations(Vec<Deactivation>),
    /// Migrations the sender proposes to the receiver.
    Proposals(Vec<Migration>),
    /// Migrations the sender accepted as target.
    Accepted(Vec<Migration>),
    Migrant {
        epoch: u64,
        migration: Migration,
        snapshot: AgentSnapshot,
    },
    Installed {
        epoch: u64,
        migration: Migration,
    },
    Messages(Vec<Message>),
    NextEvent(TimePoint),
    Load(u64),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Activations(_) => "activations",
            Frame::Deactivations(_) => "deactivations",
            Frame::Proposals(_) => "proposals",
            Frame::Accepted(_) => "accepted",
            Frame::Migrant { .. } => "migrant",
            Frame::Installed { .. } => "installed",
            Frame::Messages(_) => "messages",
            Frame::NextEvent(_) => "next event",
            Frame::Load(_) => "load",
        }
    }

    pub fn is_migrant(&self, epoch: u64, migration: &Migration) -> bool {
        matches!(self, Frame::Migrant { epoch: e, migration: m, .. } if *e == epoch && m == migration)
    }

    pub fn is_installed(&self, epoch: u64, migration: &Migration) -> bool {
        matches!(self, Frame::Installed { epoch: e, migration: m } if *e == epoch && m == migration)
    }
}

/// Ordered, reliable-unless-wrapped link from one node to every node,
/// itself included.
pub trait Transport: Send {
    fn node(&self) -> NodeId;

    fn size(&self) -> usize;

    fn send(&self, to: NodeId, frame: &Frame) -> Result<(), ClusterError>;

    /// Blocks for the next frame from `from`, at most `timeout` when given.
    fn recv(&self, from: NodeId, timeout: Option<Duration>) -> Result<Frame, ClusterError>;
}

/// Transport over in-process channels, one per ordered pair of nodes.
pub struct ChannelTransport {
    node: NodeId,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Connects `size` nodes to each other. The transport at index `r`
    /// belongs to node `r`.
    pub fn mesh(size: usize) -> Vec<ChannelTransport> {
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ChannelTransport {
                node: NodeId(rank as u32),
                senders,
                receivers,
            })
            .collect()
    }

    fn peer_index(&self, peer: NodeId) -> Result<usize, ClusterError> {
        let index = peer.index();
        if index >= self.senders.len() {
            return Err(ClusterError::Invalid(format!(
                "{} outside a cluster of {}",
                peer,
                self.senders.len()
            )));
        }
        Ok(index)
    }
}

impl Transport for ChannelTransport {
    fn node(&self) -> NodeId {
        self.node
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, to: NodeId, frame: &Frame) -> Result<(), ClusterError> {
        let index = self.peer_index(to)?;
        let bytes = serde_json::to_vec(frame)?;
        self.senders[index]
            .send(bytes)
            .map_err(|_| ClusterError::Disconnected { peer: to })
    }

    fn recv(&self, from: NodeId, timeout: Option<Duration>) -> Result<Frame, ClusterError> {
        let index = self.peer_index(from)?;
        let receiver = &self.receivers[index];
        let bytes = match timeout {
            None => receiver
                .recv()
                .map_err(|_| ClusterError::Disconnected { peer: from })?,
            Some(waited) => match receiver.recv_timeout(waited) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => return Err(ClusterError::Timeout { peer: from, waited }),
                Err(RecvTimeoutError::Disconnected) => return Err(ClusterError::Disconnected { peer: from }),
            },
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("node", &self.node)
            .field("size", &self.senders.len())
            .finish()
    }
}
