//! Ideal NIC fabric.
//!
//! The fabric models one NIC per node and the wire between them:
//!
//! * each node keeps a FIFO of posted DMA receives, matched on tag and
//!   optional source,
//! * transmissions from one node are serialized at `ps_per_byte` and
//!   arrive after a fixed latency, so messages on a link never overtake
//!   each other,
//! * a message finding no posted buffer is held until one is posted; on the
//!   short message queue this also raises [`Notification::NeedRecv`],
//! * GETs read regions registered with [`Nic::reg_mem`] and complete after
//!   a round trip plus the transfer,
//! * loopback messages are handed to the co-located engine after
//!   `loop_latency`.
//!
//! Commands are issued through a [`FabricPort`], the [`Nic`] of one node.
//! Their effects are timed [`FabricEvent`]s which the driver drains with
//! [`Fabric::drain`] and hands back when due.

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::time::Duration;

use msgsim::nic::{
    CompletionKey, LoopMsg, Nic, NodeId, Notification, Packet, VirtNet, WireHeader, SHORT_MSG_Q,
};
use msgsim::request::{iov_len, IoVec, RdvKey};
use msgsim::time::MonotonicTime;

/// Wire parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FabricConfig {
    /// One-way wire latency.
    pub latency: Duration,
    /// Serialization cost of one byte, in picoseconds.
    pub ps_per_byte: u64,
    /// Latency of a loopback message.
    pub loop_latency: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_nanos(500),
            ps_per_byte: 100,
            loop_latency: Duration::from_nanos(100),
        }
    }
}

/// Timed effect of a NIC command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FabricEvent {
    /// A packet reaches the NIC of `dest`.
    Arrive {
        /// Sending node.
        src: NodeId,
        /// Receiving node.
        dest: NodeId,
        /// Virtual network.
        vn: VirtNet,
        /// NIC tag.
        tag: u32,
        /// Packet.
        pkt: Packet,
    },
    /// A notification for the engine of `node`.
    Notify {
        /// Notified node.
        node: NodeId,
        /// Notification.
        n: Notification,
    },
}

/// Entry of the wire log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireEvent {
    /// A packet was written into a posted buffer.
    Delivered {
        /// Delivery time.
        time: MonotonicTime,
        /// Sending node.
        src: NodeId,
        /// Receiving node.
        dest: NodeId,
        /// NIC tag.
        tag: u32,
        /// Bytes delivered.
        len: usize,
        /// Header of the packet.
        hdr: WireHeader,
    },
    /// A GET completed.
    GetDone {
        /// Completion time.
        time: MonotonicTime,
        /// Node that issued the GET.
        node: NodeId,
        /// Node owning the region.
        from: NodeId,
        /// Region key.
        rdv: RdvKey,
        /// Bytes fetched.
        len: usize,
    },
}

impl WireEvent {
    /// Time of the event.
    pub fn time(&self) -> MonotonicTime {
        match self {
            Self::Delivered { time, .. } | Self::GetDone { time, .. } => *time,
        }
    }
}

/// Misuse of the fabric by an engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FabricError {
    /// A command named a node outside the fabric.
    UnknownNode(NodeId),
    /// A GET named a region that was never registered.
    UnknownRegion {
        /// Node that issued the GET.
        node: NodeId,
        /// Node expected to own the region.
        owner: NodeId,
        /// Region key.
        rdv: RdvKey,
    },
    /// A packet is larger than the buffer it was delivered to.
    Overflow {
        /// Receiving node.
        node: NodeId,
        /// NIC tag.
        tag: u32,
        /// Packet length.
        len: usize,
        /// Buffer length.
        capacity: usize,
    },
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "node {} is not attached to the fabric", node),
            Self::UnknownRegion { node, owner, rdv } => write!(
                f,
                "node {} issued a GET for region {:#x} which node {} never registered",
                node,
                rdv.get(),
                owner
            ),
            Self::Overflow {
                node,
                tag,
                len,
                capacity,
            } => write!(
                f,
                "a {}-byte packet with tag {:#x} overflows a {}-byte buffer on node {}",
                len, tag, capacity, node
            ),
        }
    }
}

impl Error for FabricError {}

#[derive(Debug)]
struct PostedRecv {
    src: Option<NodeId>,
    tag: u32,
    capacity: usize,
    key: CompletionKey,
}

impl PostedRecv {
    fn accepts(&self, src: NodeId, tag: u32) -> bool {
        self.tag == tag && self.src.map_or(true, |s| s == src)
    }
}

#[derive(Debug)]
struct Held {
    src: NodeId,
    tag: u32,
    pkt: Packet,
}

#[derive(Debug)]
struct Port {
    posted: VecDeque<PostedRecv>,
    held: VecDeque<Held>,
    tx_free_at: MonotonicTime,
    /// Regions exposed to GETs, by reader and key.
    regions: HashMap<(NodeId, RdvKey), Vec<IoVec>>,
}

impl Port {
    fn new() -> Self {
        Self {
            posted: VecDeque::new(),
            held: VecDeque::new(),
            tx_free_at: MonotonicTime::EPOCH,
            regions: HashMap::new(),
        }
    }
}

/// NICs of all nodes and the wire between them.
#[derive(Debug)]
pub struct Fabric {
    config: FabricConfig,
    ports: Vec<Port>,
    pending: Vec<(MonotonicTime, FabricEvent)>,
    fault: Option<FabricError>,
    log: Vec<WireEvent>,
}

impl Fabric {
    /// Creates a fabric connecting nodes `0..nodes`.
    pub fn new(nodes: usize, config: FabricConfig) -> Self {
        Self {
            config,
            ports: (0..nodes).map(|_| Port::new()).collect(),
            pending: Vec::new(),
            fault: None,
            log: Vec::new(),
        }
    }

    /// Returns the NIC of `node` at time `now`.
    pub fn port(&mut self, node: NodeId, now: MonotonicTime) -> FabricPort<'_> {
        FabricPort {
            fabric: self,
            node,
            now,
        }
    }

    /// Handles the arrival of a packet at the NIC of `dest`.
    pub fn arrive(
        &mut self,
        now: MonotonicTime,
        src: NodeId,
        dest: NodeId,
        tag: u32,
        pkt: Packet,
    ) -> Result<(), FabricError> {
        let port = self.port_mut(dest)?;
        let hit = port.posted.iter().position(|p| p.accepts(src, tag));

        match hit.and_then(|pos| port.posted.remove(pos)) {
            Some(posted) => self.fill(now, src, dest, tag, posted, pkt),
            None => {
                let len = pkt.len();
                port.held.push_back(Held { src, tag, pkt });
                tracing::trace!(src, dest, tag, len, "no buffer posted, packet held");
                if tag == SHORT_MSG_Q {
                    self.notify(now, dest, Notification::NeedRecv { nid: src, tag, len });
                }

                Ok(())
            }
        }
    }

    /// Takes the events produced since the last call.
    pub fn drain(&mut self) -> Vec<(MonotonicTime, FabricEvent)> {
        std::mem::take(&mut self.pending)
    }

    /// Takes the first error raised by a command since the last call.
    pub fn take_fault(&mut self) -> Option<FabricError> {
        self.fault.take()
    }

    /// Deliveries and GET completions, in the order they were decided.
    pub fn log(&self) -> &[WireEvent] {
        &self.log
    }

    /// Number of packets waiting for a buffer on `node`.
    pub fn held(&self, node: NodeId) -> usize {
        self.ports.get(node as usize).map_or(0, |p| p.held.len())
    }

    fn transfer(&self, bytes: usize) -> Duration {
        Duration::from_nanos(bytes as u64 * self.config.ps_per_byte / 1000)
    }

    fn port_mut(&mut self, node: NodeId) -> Result<&mut Port, FabricError> {
        self.ports
            .get_mut(node as usize)
            .ok_or(FabricError::UnknownNode(node))
    }

    fn notify(&mut self, time: MonotonicTime, node: NodeId, n: Notification) {
        self.pending.push((time, FabricEvent::Notify { node, n }));
    }

    fn fill(
        &mut self,
        now: MonotonicTime,
        src: NodeId,
        dest: NodeId,
        tag: u32,
        posted: PostedRecv,
        pkt: Packet,
    ) -> Result<(), FabricError> {
        let len = pkt.len();
        if len > posted.capacity {
            return Err(FabricError::Overflow {
                node: dest,
                tag,
                len,
                capacity: posted.capacity,
            });
        }
        self.log.push(WireEvent::Delivered {
            time: now,
            src,
            dest,
            tag,
            len,
            hdr: pkt.hdr,
        });
        self.notify(
            now,
            dest,
            Notification::RecvDmaDone {
                nid: src,
                tag,
                len,
                key: posted.key,
                hdr: pkt.hdr,
            },
        );

        Ok(())
    }

    fn dma_recv(
        &mut self,
        now: MonotonicTime,
        node: NodeId,
        src: Option<NodeId>,
        tag: u32,
        iov: Vec<IoVec>,
        key: CompletionKey,
    ) -> Result<(), FabricError> {
        let posted = PostedRecv {
            src,
            tag,
            capacity: iov_len(&iov),
            key,
        };
        let port = self.port_mut(node)?;
        let hit = port.held.iter().position(|h| posted.accepts(h.src, h.tag));

        match hit.and_then(|pos| port.held.remove(pos)) {
            Some(held) => self.fill(now, held.src, node, held.tag, posted, held.pkt),
            None => {
                port.posted.push_back(posted);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pio_send(
        &mut self,
        now: MonotonicTime,
        node: NodeId,
        vn: VirtNet,
        dest: NodeId,
        tag: u32,
        pkt: Packet,
        key: CompletionKey,
    ) -> Result<(), FabricError> {
        self.port_mut(dest)?;
        let tx = self.transfer(pkt.len());
        let latency = self.config.latency;

        let port = self.port_mut(node)?;
        let done = port.tx_free_at.max(now) + tx;
        port.tx_free_at = done;

        self.notify(done, node, Notification::SendPioDone(key));
        self.pending.push((
            done + latency,
            FabricEvent::Arrive {
                src: node,
                dest,
                vn,
                tag,
                pkt,
            },
        ));

        Ok(())
    }

    fn get(
        &mut self,
        now: MonotonicTime,
        node: NodeId,
        owner: NodeId,
        rdv: RdvKey,
        iov: Vec<IoVec>,
        key: CompletionKey,
    ) -> Result<(), FabricError> {
        let region = self
            .port_mut(owner)?
            .regions
            .remove(&(node, rdv))
            .ok_or(FabricError::UnknownRegion { node, owner, rdv })?;
        let len = iov_len(&iov).min(iov_len(&region));
        let time = now + self.config.latency * 2 + self.transfer(len);

        self.log.push(WireEvent::GetDone {
            time,
            node,
            from: owner,
            rdv,
            len,
        });
        self.notify(time, node, Notification::GetDone(key));

        Ok(())
    }

    fn reg_mem(&mut self, node: NodeId, reader: NodeId, rdv: RdvKey, iov: Vec<IoVec>) -> Result<(), FabricError> {
        self.port_mut(reader)?;
        self.port_mut(node)?.regions.insert((reader, rdv), iov);

        Ok(())
    }

    fn loop_send(&mut self, now: MonotonicTime, dest: NodeId, msg: LoopMsg) -> Result<(), FabricError> {
        self.port_mut(dest)?;
        self.notify(now + self.config.loop_latency, dest, Notification::Loop(msg));

        Ok(())
    }

    fn record(&mut self, res: Result<(), FabricError>) {
        if let Err(e) = res {
            tracing::error!(error = %e, "fabric fault");
            self.fault.get_or_insert(e);
        }
    }
}

/// The NIC of one node at one point in time.
#[derive(Debug)]
pub struct FabricPort<'a> {
    fabric: &'a mut Fabric,
    node: NodeId,
    now: MonotonicTime,
}

impl Nic for FabricPort<'_> {
    fn dma_recv(&mut self, src: Option<NodeId>, tag: u32, iov: Vec<IoVec>, key: CompletionKey) {
        let res = self.fabric.dma_recv(self.now, self.node, src, tag, iov, key);
        self.fabric.record(res);
    }

    fn pio_send(&mut self, vn: VirtNet, dest: NodeId, tag: u32, pkt: Packet, key: CompletionKey) {
        let res = self
            .fabric
            .pio_send(self.now, self.node, vn, dest, tag, pkt, key);
        self.fabric.record(res);
    }

    fn get(&mut self, nid: NodeId, rdv: RdvKey, iov: Vec<IoVec>, key: CompletionKey) {
        let res = self.fabric.get(self.now, self.node, nid, rdv, iov, key);
        self.fabric.record(res);
    }

    fn reg_mem(&mut self, nid: NodeId, rdv: RdvKey, iov: Vec<IoVec>) {
        let res = self.fabric.reg_mem(self.node, nid, rdv, iov);
        self.fabric.record(res);
    }

    fn loop_send(&mut self, dest: NodeId, msg: LoopMsg) {
        let res = self.fabric.loop_send(self.now, dest, msg);
        self.fabric.record(res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use msgsim::config::EngineConfig;
    use msgsim::engine::{Context, Engine};
    use msgsim::group::Groups;
    use msgsim::heap::SimAddr;
    use msgsim::request::{MatchHeader, COMM_WORLD};

    fn packet(len: usize) -> Packet {
        let hdr = MatchHeader {
            count: len as u32,
            dtype_size: 1,
            rank: 0,
            group: COMM_WORLD,
            tag: 7,
            key: RdvKey::default(),
        };
        Packet {
            hdr: WireHeader::Match(hdr),
            iov: vec![IoVec::new(SimAddr::new(0x100), len)],
        }
    }

    fn at(ns: u64) -> MonotonicTime {
        MonotonicTime::EPOCH + Duration::from_nanos(ns)
    }

    #[test]
    fn link_serializes_transmissions() {
        let mut fabric = Fabric::new(2, FabricConfig::default());
        let key = fabric_key();

        let mut port = fabric.port(0, MonotonicTime::EPOCH);
        port.pio_send(0, 1, SHORT_MSG_Q, packet(1000), key);
        port.pio_send(0, 1, SHORT_MSG_Q, packet(1000), key);

        let arrivals: Vec<_> = fabric
            .drain()
            .into_iter()
            .filter(|(_, e)| matches!(e, FabricEvent::Arrive { .. }))
            .map(|(t, _)| t)
            .collect();

        // 1000 bytes at 100 ps/byte take 100 ns each, then 500 ns of wire.
        assert_eq!(arrivals, vec![at(600), at(700)]);
    }

    #[test]
    fn unposted_short_message_is_held_and_raises_need_recv() {
        let mut fabric = Fabric::new(2, FabricConfig::default());
        let key = fabric_key();

        fabric.arrive(at(10), 0, 1, SHORT_MSG_Q, packet(64)).unwrap();
        assert_eq!(fabric.held(1), 1);
        assert!(matches!(
            fabric.drain().as_slice(),
            [(_, FabricEvent::Notify {
                node: 1,
                n: Notification::NeedRecv { nid: 0, len: 64, .. }
            })]
        ));

        let mut port = fabric.port(1, at(20));
        port.dma_recv(None, SHORT_MSG_Q, vec![IoVec::new(SimAddr::new(0), 128)], key);
        assert_eq!(fabric.held(1), 0);
        assert!(matches!(
            fabric.drain().as_slice(),
            [(t, FabricEvent::Notify {
                node: 1,
                n: Notification::RecvDmaDone { nid: 0, len: 64, .. }
            })] if *t == at(20)
        ));
        assert_eq!(fabric.log().len(), 1);
    }

    #[test]
    fn source_filter_is_honored() {
        let mut fabric = Fabric::new(3, FabricConfig::default());
        let key = fabric_key();

        let mut port = fabric.port(1, MonotonicTime::EPOCH);
        port.dma_recv(Some(2), 0x8001, vec![IoVec::new(SimAddr::new(0), 16)], key);

        fabric.arrive(at(1), 0, 1, 0x8001, packet(0)).unwrap();
        assert_eq!(fabric.held(1), 1);
        // Not a short message: held without NeedRecv.
        assert!(fabric.drain().is_empty());

        fabric.arrive(at(2), 2, 1, 0x8001, packet(0)).unwrap();
        assert_eq!(fabric.drain().len(), 1);
    }

    #[test]
    fn get_requires_registered_region() {
        let mut fabric = Fabric::new(2, FabricConfig::default());
        let key = fabric_key();
        let rdv = RdvKey::rendezvous(3);
        let dst = vec![IoVec::new(SimAddr::new(0), 10_000)];

        fabric
            .port(1, MonotonicTime::EPOCH)
            .get(0, rdv, dst.clone(), key);
        assert_eq!(
            fabric.take_fault(),
            Some(FabricError::UnknownRegion {
                node: 1,
                owner: 0,
                rdv
            })
        );

        fabric
            .port(0, MonotonicTime::EPOCH)
            .reg_mem(1, rdv, vec![IoVec::new(SimAddr::new(0x10), 10_000)]);
        fabric.port(1, MonotonicTime::EPOCH).get(0, rdv, dst, key);
        assert_eq!(fabric.take_fault(), None);

        // Round trip of 1000 ns plus 1000 ns of transfer.
        assert!(matches!(
            fabric.log(),
            [WireEvent::GetDone { time, len: 10_000, .. }] if *time == at(2000)
        ));
    }

    #[test]
    fn overflowing_packet_is_a_fault() {
        let mut fabric = Fabric::new(2, FabricConfig::default());
        let key = fabric_key();

        fabric
            .port(1, MonotonicTime::EPOCH)
            .dma_recv(None, SHORT_MSG_Q, vec![IoVec::new(SimAddr::new(0), 32)], key);
        let res = fabric.arrive(at(1), 0, 1, SHORT_MSG_Q, packet(64));

        assert!(matches!(res, Err(FabricError::Overflow { len: 64, capacity: 32, .. })));
    }

    /// Records the keys of the short buffers an engine posts at init.
    #[derive(Default)]
    struct KeySink(Vec<CompletionKey>);

    impl Nic for KeySink {
        fn dma_recv(&mut self, _: Option<NodeId>, _: u32, _: Vec<IoVec>, key: CompletionKey) {
            self.0.push(key);
        }
        fn pio_send(&mut self, _: VirtNet, _: NodeId, _: u32, _: Packet, _: CompletionKey) {}
        fn get(&mut self, _: NodeId, _: RdvKey, _: Vec<IoVec>, _: CompletionKey) {}
        fn reg_mem(&mut self, _: NodeId, _: RdvKey, _: Vec<IoVec>) {}
        fn loop_send(&mut self, _: NodeId, _: LoopMsg) {}
    }

    fn fabric_key() -> CompletionKey {
        let groups = Groups::world(0, vec![0]);
        let mut engine = Engine::new(0, EngineConfig::default(), groups).unwrap();
        let mut sink = KeySink::default();
        let mut actions = Vec::new();
        let mut cx = Context::new(MonotonicTime::EPOCH, &mut sink, &mut actions);
        engine.init(&mut cx).unwrap();

        sink.0[0]
    }
}
