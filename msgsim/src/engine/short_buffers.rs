//! Short receive buffers and the messages they turn into.

use crate::heap::SimAddr;
use crate::nic::{Completion, CompletionKey, LoopKey, NodeId, SHORT_MSG_Q};
use crate::request::{IoVec, MatchHeader};

use super::{Context, Engine, EngineError};

/// A short receive buffer: a header slot and a payload region.
#[derive(Clone, Debug)]
pub(crate) struct ShortRecvBuffer {
    hdr_slot: SimAddr,
    payload: IoVec,
}

impl ShortRecvBuffer {
    fn iov(&self) -> Vec<IoVec> {
        vec![IoVec::new(self.hdr_slot, MatchHeader::WIRE_SIZE), self.payload]
    }
}

/// A send from a co-located rank.
#[derive(Clone, Debug)]
pub(crate) struct LoopRequest {
    pub(crate) src: NodeId,
    pub(crate) hdr: MatchHeader,
    pub(crate) key: LoopKey,
}

/// A message waiting to be matched.
#[derive(Clone, Debug)]
pub(crate) enum Msg {
    /// Received by the NIC into a short buffer.
    Wire {
        hdr: MatchHeader,
        buf: ShortRecvBuffer,
    },
    /// Handed over by a co-located engine.
    Loopback(LoopRequest),
}

impl Msg {
    pub(crate) fn hdr(&self) -> &MatchHeader {
        match self {
            Self::Wire { hdr, .. } => hdr,
            Self::Loopback(req) => &req.hdr,
        }
    }
}

impl Engine {
    /// Posts one more short buffer, unless the pool is full.
    ///
    /// Returns `false` if the pool was full.
    pub(super) fn post_short_buffer(&mut self, cx: &mut Context<'_>) -> Result<bool, EngineError> {
        if self.short_buffers.len() >= self.config.max_posted_short_buffers {
            return Ok(false);
        }

        let payload_len = self.config.short_msg_length + MatchHeader::WIRE_SIZE;
        let heap = self.heap_mut()?;
        let hdr_slot = heap.alloc(MatchHeader::WIRE_SIZE)?;
        let payload = IoVec::new(heap.alloc(payload_len)?, payload_len);

        let buf = ShortRecvBuffer { hdr_slot, payload };
        let iov = buf.iov();
        let slot = self.short_buffers.insert(buf);
        self.stats.short_buffers_posted += 1;

        tracing::trace!(
            node = self.node,
            slot,
            posted = self.short_buffers.len(),
            "short buffer posted"
        );
        cx.nic().dma_recv(
            None,
            SHORT_MSG_Q,
            iov,
            CompletionKey(Completion::ShortBuffer(slot)),
        );

        Ok(true)
    }

    /// Returns the regions of a consumed short buffer to the heap.
    pub(super) fn release_short_buffer(&mut self, buf: ShortRecvBuffer) -> Result<(), EngineError> {
        let heap = self.heap_mut()?;
        heap.free(buf.hdr_slot)?;
        heap.free(buf.payload.addr)?;

        Ok(())
    }

    /// Pays a `NeedRecv` credit back by posting buffers, within the cap on
    /// NIC-requested buffers. Credits that do not fit are kept for later.
    pub(super) fn pay_need_recv(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        while self.need_recv > 0 && self.nic_requested_short < self.config.max_unexpected_msg {
            if !self.post_short_buffer(cx)? {
                break;
            }
            self.need_recv -= 1;
            self.nic_requested_short += 1;
            self.stats.need_recv_buffers += 1;
        }

        Ok(())
    }

    /// Opportunistic top-up done on every receive: pays a NIC-requested or
    /// loopback credit back if one is outstanding, and posts a fresh buffer
    /// otherwise.
    pub(super) fn replenish_short_buffers(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.short_buffers.len() >= self.config.max_posted_short_buffers {
            return Ok(());
        }

        if self.nic_requested_short > 0 {
            self.nic_requested_short -= 1;
        } else if self.recv_looped > 0 {
            self.recv_looped -= 1;
        } else {
            self.post_short_buffer(cx)?;
        }

        Ok(())
    }
}
