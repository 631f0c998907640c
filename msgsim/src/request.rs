//! Requests and the message header they are matched on.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::heap::SimAddr;
use crate::nic::NodeId;

/// A rank within a communicator.
pub type RankId = u32;

/// Communicator identifier.
pub type Communicator = u32;

/// Wildcard source rank for receives.
pub const ANY_SRC: RankId = RankId::MAX;

/// Wildcard tag for receives.
pub const ANY_TAG: u64 = u64::MAX;

/// The communicator holding every rank.
pub const COMM_WORLD: Communicator = 0;

/// Flag bit carried by every rendezvous key.
pub const LONG_GET_KEY: u16 = 0x8000;

/// Key tying a rendezvous header, its registered region and its
/// acknowledgement together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RdvKey(u16);

impl RdvKey {
    /// Builds a rendezvous key from a sequence number.
    pub const fn rendezvous(seq: u16) -> Self {
        Self((seq & !LONG_GET_KEY) | LONG_GET_KEY)
    }

    /// Recovers a rendezvous key from a NIC tag, if the tag carries one.
    pub fn from_tag(tag: u32) -> Option<Self> {
        u16::try_from(tag)
            .ok()
            .filter(|k| k & LONG_GET_KEY != 0)
            .map(Self)
    }

    /// Returns the raw key.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns `true` if the key designates a rendezvous exchange.
    pub const fn is_rendezvous(self) -> bool {
        self.0 & LONG_GET_KEY != 0
    }

    /// NIC tag used for the acknowledgement of this exchange.
    pub const fn as_tag(self) -> u32 {
        self.0 as u32
    }
}

/// Header carried by every application message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchHeader {
    /// Element count.
    pub count: u32,
    /// Size of one element in bytes.
    pub dtype_size: u32,
    /// Sender rank for messages, wanted source (or [`ANY_SRC`]) for receives.
    pub rank: RankId,
    /// Communicator.
    pub group: Communicator,
    /// Message tag, or [`ANY_TAG`] for receives.
    pub tag: u64,
    /// Rendezvous key, meaningful for long messages only.
    pub key: RdvKey,
}

impl MatchHeader {
    /// Size of the header on the wire and in NIC buffers.
    pub const WIRE_SIZE: usize = 32;

    /// Payload length described by the header.
    pub const fn length(&self) -> usize {
        self.count as usize * self.dtype_size as usize
    }
}

/// Element type of a message buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    /// 1 byte.
    Char,
    /// 4 bytes.
    Int,
    /// 8 bytes.
    Long,
    /// 4 bytes.
    Float,
    /// 8 bytes.
    Double,
    /// 16 bytes.
    Complex,
}

impl Datatype {
    /// Element size in bytes.
    pub const fn size(self) -> u32 {
        match self {
            Self::Char => 1,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Complex => 16,
        }
    }
}

/// A contiguous region of the simulated address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoVec {
    /// Start address.
    pub addr: SimAddr,
    /// Length in bytes.
    pub len: usize,
}

impl IoVec {
    /// Creates a region descriptor.
    pub const fn new(addr: SimAddr, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Total length of a buffer list.
pub fn iov_len(iov: &[IoVec]) -> usize {
    iov.iter().map(|v| v.len).sum()
}

/// Identifier of a request owned by an engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) usize);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Flavor of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Blocking send.
    Send,
    /// Non-blocking send.
    Isend,
    /// Blocking receive.
    Recv,
    /// Non-blocking receive.
    Irecv,
}

impl RequestKind {
    /// Returns `true` for sends.
    pub const fn is_send(self) -> bool {
        matches!(self, Self::Send | Self::Isend)
    }

    /// Returns `true` if the call only returns once the request is done.
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Send | Self::Recv)
    }
}

/// Life-cycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Being prepared by the engine.
    Created,
    /// Rendezvous header sent, waiting for the receiver acknowledgement.
    AwaitingAck,
    /// Loopback request sent, waiting for the loopback response.
    AwaitingLoopback,
    /// Parked on the posted-receive queue.
    Posted,
    /// Matched, delivery in progress.
    Matching,
    /// Matched long message, waiting for the GET to complete.
    AwaitingGet,
    /// Complete.
    Done,
}

/// Information about a matched message, reported to the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatchInfo {
    /// Actual tag.
    pub tag: u64,
    /// Actual source rank.
    pub rank: RankId,
    /// Actual element count.
    pub count: u32,
}

/// Final status of a request, handed back by wait and test calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    /// Request flavor.
    pub kind: RequestKind,
    /// Match information, for receives that matched a message.
    pub info: Option<MatchInfo>,
    /// `true` if the request completed because it was cancelled.
    pub cancelled: bool,
}

/// Node and key a rendezvous acknowledgement must be sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AckTarget {
    pub(crate) nid: NodeId,
    pub(crate) key: RdvKey,
}

/// One pending send or receive.
#[derive(Clone, Debug)]
pub struct Request {
    kind: RequestKind,
    pub(crate) hdr: MatchHeader,
    pub(crate) iov: Vec<IoVec>,
    /// Destination rank of sends.
    pub(crate) peer: RankId,
    /// Tag bits ignored when matching a receive.
    pub(crate) ignore: u64,
    state: RequestState,
    fini_delay: Duration,
    pub(crate) resp: Option<MatchInfo>,
    pub(crate) ack: Option<AckTarget>,
    cancelled: bool,
}

impl Request {
    pub(crate) fn new(
        kind: RequestKind,
        hdr: MatchHeader,
        iov: Vec<IoVec>,
        peer: RankId,
        ignore: u64,
    ) -> Self {
        Self {
            kind,
            hdr,
            iov,
            peer,
            ignore,
            state: RequestState::Created,
            fini_delay: Duration::ZERO,
            resp: None,
            ack: None,
            cancelled: false,
        }
    }

    /// Request flavor.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Header of the message (sends) or wanted header (receives).
    pub fn header(&self) -> &MatchHeader {
        &self.hdr
    }

    /// Total buffer length.
    pub fn length(&self) -> usize {
        iov_len(&self.iov)
    }

    /// Returns `true` once the request has completed.
    pub fn is_done(&self) -> bool {
        self.state == RequestState::Done
    }

    /// Delay the waiter pays when it collects the request.
    pub fn fini_delay(&self) -> Duration {
        self.fini_delay
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    /// Completes request `id`; completing twice is a protocol error.
    pub(crate) fn set_done(
        &mut self,
        id: RequestId,
        fini_delay: Duration,
    ) -> Result<(), EngineError> {
        if self.is_done() {
            return Err(EngineError::InvalidState {
                req: id,
                state: self.state,
            });
        }
        self.state = RequestState::Done;
        self.fini_delay = fini_delay;

        Ok(())
    }

    /// Completes the request as cancelled unless it is already done.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.state = RequestState::Done;
        self.fini_delay = Duration::ZERO;
        self.cancelled = true;

        true
    }

    /// Final status.
    pub fn status(&self) -> Status {
        Status {
            kind: self.kind,
            info: self.resp,
            cancelled: self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_keys_carry_flag() {
        let key = RdvKey::rendezvous(3);
        assert!(key.is_rendezvous());
        assert_eq!(key.get(), 0x8003);
        assert_eq!(RdvKey::rendezvous(0xffff), RdvKey::rendezvous(0x7fff));

        assert_eq!(RdvKey::from_tag(key.as_tag()), Some(key));
        assert_eq!(RdvKey::from_tag(0x0003), None);
        assert_eq!(RdvKey::from_tag(0x1_8003), None);
    }

    #[test]
    fn request_completes_once() {
        let hdr = MatchHeader {
            count: 4,
            dtype_size: 4,
            ..MatchHeader::default()
        };
        let iov = vec![IoVec::new(SimAddr::new(0x10), 16)];
        let mut req = Request::new(RequestKind::Irecv, hdr, iov, ANY_SRC, 0);

        assert_eq!(req.length(), hdr.length());
        let id = RequestId(3);
        assert_eq!(req.set_done(id, Duration::from_nanos(5)), Ok(()));
        assert_eq!(
            req.set_done(id, Duration::ZERO),
            Err(EngineError::InvalidState {
                req: id,
                state: RequestState::Done
            })
        );
        assert!(!req.cancel());
        assert_eq!(req.fini_delay(), Duration::from_nanos(5));
        assert!(!req.status().cancelled);
    }
}
