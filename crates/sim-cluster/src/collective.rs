//! Collectives
//!
//! Lockstep exchanges every node enters in the same order: all-to-all,
//! broadcast, all-gather and min-reduction. Point-to-point migration
//! frames travel on the same links, so a collective may receive a frame it
//! is not waiting for. Those are buffered per peer until someone asks for
//! them, except for two kinds that are answered on the spot:
//!
//! - a migrant this node already installed is acknowledged again, since the
//!   first acknowledgement may have been lost
//! - an acknowledgement nobody is waiting for any more is dropped

use sim_types::{Migration, NodeId, TimePoint};
use std::collections::{BTreeSet, VecDeque};
use std::mem::discriminant;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::ClusterError;
use crate::transport::{Frame, Transport};

pub struct Collective<T> {
    transport: T,
    buffered: Vec<VecDeque<Frame>>,
    installed: BTreeSet<(u64, Migration)>,
    awaiting: BTreeSet<(u64, Migration)>,
}

impl<T: Transport> Collective<T> {
    pub fn new(transport: T) -> Self {
        let size = transport.size();
        Self {
            transport,
            buffered: (0..size).map(|_| VecDeque::new()).collect(),
            installed: BTreeSet::new(),
            awaiting: BTreeSet::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.transport.node()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn send(&self, to: NodeId, frame: &Frame) -> Result<(), ClusterError> {
        self.transport.send(to, frame)
    }

    /// Frames received but not yet asked for.
    pub fn buffered(&self) -> usize {
        self.buffered.iter().map(VecDeque::len).sum()
    }

    /// Remembers an installed migrant so duplicates are re-acknowledged.
    pub fn mark_installed(&mut self, epoch: u64, migration: Migration) {
        self.installed.insert((epoch, migration));
    }

    /// Starts waiting for the acknowledgement of an outgoing migrant.
    pub fn expect_ack(&mut self, epoch: u64, migration: Migration) {
        self.awaiting.insert((epoch, migration));
    }

    /// Stops waiting for an acknowledgement; later copies are dropped.
    pub fn ack_received(&mut self, epoch: u64, migration: &Migration) {
        self.awaiting.remove(&(epoch, migration.clone()));
    }

    /// Takes a buffered frame from `from` without blocking.
    pub fn take_buffered<P>(&mut self, from: NodeId, wanted: P) -> Option<Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        let queue = self.buffered.get_mut(from.index())?;
        let position = queue.iter().position(wanted)?;
        queue.remove(position)
    }

    /// Receives the next frame from `from` that satisfies `wanted`,
    /// buffering anything else that arrives first.
    pub fn receive_matching<P>(&mut self, from: NodeId, timeout: Option<Duration>, wanted: P) -> Result<Frame, ClusterError>
    where
        P: Fn(&Frame) -> bool,
    {
        if from.index() >= self.buffered.len() {
            return Err(ClusterError::Invalid(format!("no link to {}", from)));
        }
        if let Some(frame) = self.take_buffered(from, &wanted) {
            return Ok(frame);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let frame = match self.transport.recv(from, remaining) {
                Ok(frame) => frame,
                Err(ClusterError::Timeout { peer, .. }) => {
                    return Err(ClusterError::Timeout {
                        peer,
                        waited: timeout.unwrap_or_default(),
                    })
                }
                Err(e) => return Err(e),
            };
            if wanted(&frame) {
                return Ok(frame);
            }
            self.absorb(from, frame)?;
        }
    }

    fn absorb(&mut self, from: NodeId, frame: Frame) -> Result<(), ClusterError> {
        match frame {
            Frame::Migrant { epoch, migration, .. } if self.installed.contains(&(epoch, migration.clone())) => {
                debug!(%migration, "duplicate migrant, acknowledging again");
                self.transport.send(from, &Frame::Installed { epoch, migration })
            }
            Frame::Installed { epoch, migration } if !self.awaiting.contains(&(epoch, migration.clone())) => {
                trace!(%migration, "dropping stale acknowledgement");
                Ok(())
            }
            other => {
                trace!(peer = %from, kind = other.kind(), "buffering frame");
                self.buffered[from.index()].push_back(other);
                Ok(())
            }
        }
    }

    /// Sends `outgoing[r]` to node `r` and returns the frame every node sent
    /// here, in rank order. All frames must be of the same kind.
    pub fn all_to_all(&mut self, outgoing: Vec<Frame>) -> Result<Vec<Frame>, ClusterError> {
        let size = self.size();
        if outgoing.len() != size {
            return Err(ClusterError::Invalid(format!(
                "all-to-all with {} frames in a cluster of {}",
                outgoing.len(),
                size
            )));
        }
        let Some(kind) = outgoing.first().map(discriminant) else {
            return Ok(Vec::new());
        };
        for (peer, frame) in outgoing.iter().enumerate() {
            self.transport.send(NodeId(peer as u32), frame)?;
        }
        (0..size)
            .map(|peer| self.receive_matching(NodeId(peer as u32), None, |f| discriminant(f) == kind))
            .collect()
    }

    /// Sends the same frame to every node.
    pub fn broadcast(&mut self, frame: Frame) -> Result<Vec<Frame>, ClusterError> {
        let outgoing = vec![frame; self.size()];
        self.all_to_all(outgoing)
    }

    /// Minimum of `value` over every node.
    pub fn all_reduce_min(&mut self, value: TimePoint) -> Result<TimePoint, ClusterError> {
        let mut minimum = value;
        for (peer, frame) in self.broadcast(Frame::NextEvent(value))?.into_iter().enumerate() {
            match frame {
                Frame::NextEvent(t) => minimum = minimum.min(t),
                other => return Err(unexpected(peer, "next event", &other)),
            }
        }
        Ok(minimum)
    }

    /// Every node's `value`, in rank order.
    pub fn all_gather(&mut self, value: u64) -> Result<Vec<u64>, ClusterError> {
        self.broadcast(Frame::Load(value))?
            .into_iter()
            .enumerate()
            .map(|(peer, frame)| match frame {
                Frame::Load(v) => Ok(v),
                other => Err(unexpected(peer, "load", &other)),
            })
            .collect()
    }
}

pub(crate) fn unexpected(peer: usize, expected: &'static str, found: &Frame) -> ClusterError {
    ClusterError::UnexpectedFrame {
        peer: NodeId(peer as u32),
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use sim_kernel::AgentSnapshot;
    use sim_types::Identity;

    fn collectives(size: usize) -> Vec<Collective<ChannelTransport>> {
        ChannelTransport::mesh(size).into_iter().map(Collective::new).collect()
    }

    fn migration() -> Migration {
        Migration {
            source: NodeId(1),
            target: NodeId(0),
            migrant: Identity::from([1, 0]),
        }
    }

    #[test]
    fn test_all_reduce_and_gather_across_threads() {
        let results: Vec<(TimePoint, Vec<u64>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = collectives(3)
                .into_iter()
                .map(|mut c| {
                    scope.spawn(move || {
                        let rank = c.node().0 as u64;
                        let min = c.all_reduce_min(10 - rank).unwrap();
                        let loads = c.all_gather(rank * 2).unwrap();
                        (min, loads)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (min, loads) in results {
            assert_eq!(min, 8);
            assert_eq!(loads, vec![0, 2, 4]);
        }
    }

    #[test]
    fn test_unrelated_frames_are_buffered() {
        let mut nodes = collectives(2);
        let second = nodes.pop().unwrap();
        let mut first = nodes.pop().unwrap();

        // node 1 is ahead: its load arrives before the reduction node 0 waits on
        second.send(NodeId(0), &Frame::Load(4)).unwrap();
        second.send(NodeId(0), &Frame::NextEvent(2)).unwrap();

        let frame = first.receive_matching(NodeId(1), None, |f| matches!(f, Frame::NextEvent(_))).unwrap();
        assert!(matches!(frame, Frame::NextEvent(2)));
        assert_eq!(first.buffered(), 1);
        let frame = first.receive_matching(NodeId(1), None, |f| matches!(f, Frame::Load(_))).unwrap();
        assert!(matches!(frame, Frame::Load(4)));
        assert_eq!(first.buffered(), 0);
    }

    #[test]
    fn test_duplicate_migrant_is_acknowledged_again() {
        let mut nodes = collectives(2);
        let mut source = nodes.pop().unwrap();
        let mut target = nodes.pop().unwrap();
        let m = migration();
        target.mark_installed(3, m.clone());
        source.expect_ack(3, m.clone());

        let snapshot = AgentSnapshot {
            kind: "trader".to_string(),
            identity: m.migrant.clone(),
            state: serde_json::Value::Null,
        };
        source
            .send(
                NodeId(0),
                &Frame::Migrant {
                    epoch: 3,
                    migration: m.clone(),
                    snapshot,
                },
            )
            .unwrap();
        source.send(NodeId(0), &Frame::Load(1)).unwrap();

        // absorbed while waiting for something else
        let frame = target.receive_matching(NodeId(1), None, |f| matches!(f, Frame::Load(_))).unwrap();
        assert!(matches!(frame, Frame::Load(1)));
        assert_eq!(target.buffered(), 0);

        let ack = source
            .receive_matching(NodeId(0), Some(Duration::from_secs(1)), |f| f.is_installed(3, &m))
            .unwrap();
        assert!(ack.is_installed(3, &m));
    }

    #[test]
    fn test_stale_acknowledgement_is_dropped() {
        let mut nodes = collectives(2);
        let second = nodes.pop().unwrap();
        let mut first = nodes.pop().unwrap();
        second
            .send(NodeId(0), &Frame::Installed { epoch: 1, migration: migration() })
            .unwrap();
        second.send(NodeId(0), &Frame::Load(9)).unwrap();
        first.receive_matching(NodeId(1), None, |f| matches!(f, Frame::Load(_))).unwrap();
        assert_eq!(first.buffered(), 0);
    }

    #[test]
    fn test_receive_timeout() {
        let mut nodes = collectives(2);
        let mut first = nodes.remove(0);
        let waited = Duration::from_millis(20);
        assert!(matches!(
            first.receive_matching(NodeId(1), Some(waited), |_| true),
            Err(ClusterError::Timeout { waited: w, .. }) if w == waited
        ));
    }

    #[test]
    fn test_all_to_all_rejects_wrong_width() {
        let mut nodes = collectives(2);
        assert!(matches!(
            nodes[0].all_to_all(vec![Frame::Load(1)]),
            Err(ClusterError::Invalid(_))
        ));
    }
}
