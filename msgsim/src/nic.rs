//! Interface between the engine and the simulated NIC.
//!
//! The engine issues commands through the [`Nic`] trait and learns about
//! their completion through [`Notification`]s, which the driver feeds back
//! with [`Engine::notify`](crate::engine::Engine::notify). Each command that
//! completes asynchronously carries an opaque [`CompletionKey`] that the NIC
//! hands back unchanged.
//!
//! ```text
//!            dma_recv / pio_send / get / reg_mem / loop_send
//!  ┌────────┐ ──────────────────────────────────────────────► ┌─────┐
//!  │ Engine │                                                 │ NIC │
//!  └────────┘ ◄────────────────────────────────────────────── └─────┘
//!              GetDone / SendPioDone / RecvDmaDone / NeedRecv / Loop
//! ```

use crate::heap::SimAddr;
use crate::request::{iov_len, IoVec, MatchHeader, RdvKey, RequestId};

/// Node identifier.
pub type NodeId = u32;

/// Virtual network (traffic class) identifier.
pub type VirtNet = u8;

/// NIC tag of the queue receiving application headers and eager payloads.
///
/// Lies outside the 16-bit range used by rendezvous acknowledgement tags.
pub const SHORT_MSG_Q: u32 = 0xf00d_0000;

/// Header of a wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireHeader {
    /// Application message header.
    Match(MatchHeader),
    /// Rendezvous acknowledgement.
    Ack(RdvKey),
}

impl WireHeader {
    /// Size of an acknowledgement on the wire.
    pub const ACK_SIZE: usize = 16;
}

/// A message handed to the NIC for transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Header, delivered alongside the data.
    pub hdr: WireHeader,
    /// Regions holding the wire image: header slot first, then payload.
    pub iov: Vec<IoVec>,
}

impl Packet {
    /// Number of bytes on the wire.
    pub fn len(&self) -> usize {
        iov_len(&self.iov)
    }

    /// Returns `true` if the packet carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque token identifying an engine continuation for a NIC command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionKey(pub(crate) Completion);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// A posted short receive buffer was filled.
    ShortBuffer(usize),
    /// A rendezvous acknowledgement arrived for a long send.
    RendezvousAck { req: RequestId, slot: SimAddr },
    /// A header (and eager payload) left the node.
    PioSend {
        hdr: SimAddr,
        payload: Option<SimAddr>,
    },
    /// A rendezvous acknowledgement left the node.
    AckSent { slot: SimAddr },
    /// A GET of a long message completed.
    Get(RequestId),
}

/// Token identifying the sender side of a loopback exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopKey(pub(crate) RequestId);

/// Message exchanged between co-located engines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopMsg {
    /// A send from a co-located rank.
    Request {
        /// Sending node.
        src: NodeId,
        /// Message header.
        hdr: MatchHeader,
        /// Sender buffer.
        iov: Vec<IoVec>,
        /// Sender key, echoed in the response.
        key: LoopKey,
    },
    /// The receiver consumed the matching request.
    Response {
        /// Responding node.
        src: NodeId,
        /// Sender key.
        key: LoopKey,
    },
}

/// Commands the engine issues to its NIC.
pub trait Nic {
    /// Posts a receive buffer for messages with `tag`, optionally restricted
    /// to source `src`.
    fn dma_recv(&mut self, src: Option<NodeId>, tag: u32, iov: Vec<IoVec>, key: CompletionKey);

    /// Transmits `pkt` to `dest` on virtual network `vn`; completion is
    /// reported with [`Notification::SendPioDone`].
    fn pio_send(&mut self, vn: VirtNet, dest: NodeId, tag: u32, pkt: Packet, key: CompletionKey);

    /// Fetches the region registered by `nid` under `rdv` into `iov`;
    /// completion is reported with [`Notification::GetDone`].
    fn get(&mut self, nid: NodeId, rdv: RdvKey, iov: Vec<IoVec>, key: CompletionKey);

    /// Exposes `iov` to GETs from `nid` under `rdv`.
    fn reg_mem(&mut self, nid: NodeId, rdv: RdvKey, iov: Vec<IoVec>);

    /// Delivers `msg` to the engine of co-located node `dest`.
    fn loop_send(&mut self, dest: NodeId, msg: LoopMsg);
}

/// Asynchronous events reported by the NIC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A GET completed.
    GetDone(CompletionKey),
    /// A transmission completed.
    SendPioDone(CompletionKey),
    /// A posted receive buffer was filled.
    RecvDmaDone {
        /// Source node.
        nid: NodeId,
        /// NIC tag of the message.
        tag: u32,
        /// Bytes received.
        len: usize,
        /// Key of the posted buffer.
        key: CompletionKey,
        /// Header of the received message.
        hdr: WireHeader,
    },
    /// A message arrived for which no buffer was posted.
    NeedRecv {
        /// Source node.
        nid: NodeId,
        /// NIC tag of the message.
        tag: u32,
        /// Bytes waiting.
        len: usize,
    },
    /// A loopback message arrived.
    Loop(LoopMsg),
}
