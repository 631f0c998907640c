//! Send path: eager, rendezvous and loopback.

use std::time::Duration;

use crate::app::{CallReturn, MsgArgs};
use crate::nic::{Completion, CompletionKey, LoopKey, LoopMsg, Packet, WireHeader, SHORT_MSG_Q};
use crate::request::{IoVec, MatchHeader, RequestId, RequestKind, RequestState};
use crate::wait::WaitSet;

use super::{Context, Engine, EngineError, StepKind};

impl Engine {
    pub(super) fn enter_send(
        &mut self,
        kind: RequestKind,
        args: MsgArgs,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        if self.heap.is_none() {
            return Err(EngineError::NotInitialized);
        }
        self.exit_delay = self.timing.send_state_delay();

        let req = self.new_request(kind, args)?;
        let dest = self.nid_of(req.hdr.group, req.peer)?;
        let len = req.length();
        let id = RequestId(self.requests.insert(req));
        self.stats.sends += 1;

        let delay = self.timing.tx_delay(len);
        if self.is_local(dest) {
            tracing::debug!(node = self.node, %id, len, dest, "loopback send");
            self.stats.loopback_sends += 1;
            cx.schedule(delay, StepKind::SendLoop(id));
        } else {
            tracing::debug!(node = self.node, %id, len, dest, "send");
            cx.schedule(delay, StepKind::SendSetup(id));
        }

        Ok(())
    }

    /// Writes the header into its NIC slot.
    pub(super) fn send_write_header(
        &mut self,
        id: RequestId,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        self.request_mut(id)?;
        cx.schedule(
            self.timing.memwrite_delay(MatchHeader::WIRE_SIZE),
            StepKind::SendHdrWritten(id),
        );

        Ok(())
    }

    /// Pins a long payload or copies a short one.
    pub(super) fn send_stage_payload(
        &mut self,
        id: RequestId,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        let len = self.request_mut(id)?.length();
        let delay = if self.timing.is_short(len) {
            self.timing.tx_memcpy_delay(len)
        } else {
            self.timing.reg_region_delay(len)
        };
        cx.schedule(delay, StepKind::SendTransmit(id));

        Ok(())
    }

    /// Hands the message to the NIC.
    pub(super) fn send_transmit(
        &mut self,
        id: RequestId,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        let (len, group, peer) = {
            let req = self.request_mut(id)?;
            (req.length(), req.hdr.group, req.peer)
        };
        let dest = self.nid_of(group, peer)?;
        let short = self.timing.is_short(len);
        let key = if short { None } else { Some(self.gen_key()) };
        let vn = self.config.rendezvous_virtual_network;
        let fini_delay = self.timing.send_fini_delay(len);

        let heap = self.heap.as_mut().ok_or(EngineError::NotInitialized)?;
        let hdr_slot = heap.alloc(MatchHeader::WIRE_SIZE)?;
        let req = self
            .requests
            .get_mut(id.0)
            .ok_or(EngineError::UnknownRequest(id))?;
        let mut iov = vec![IoVec::new(hdr_slot, MatchHeader::WIRE_SIZE)];

        let completion = match key {
            None => {
                let payload = if len > 0 {
                    let addr = heap.alloc(len)?;
                    iov.push(IoVec::new(addr, len));
                    Some(addr)
                } else {
                    None
                };
                req.set_done(id, fini_delay)?;
                self.stats.eager_sends += 1;

                Completion::PioSend {
                    hdr: hdr_slot,
                    payload,
                }
            }
            Some(key) => {
                req.hdr.key = key;
                req.set_state(RequestState::AwaitingAck);
                let ack_slot = heap.alloc(WireHeader::ACK_SIZE)?;
                cx.nic().dma_recv(
                    Some(dest),
                    key.as_tag(),
                    vec![IoVec::new(ack_slot, WireHeader::ACK_SIZE)],
                    CompletionKey(Completion::RendezvousAck {
                        req: id,
                        slot: ack_slot,
                    }),
                );
                cx.nic().reg_mem(dest, key, req.iov.clone());
                self.stats.rendezvous_sends += 1;

                Completion::PioSend {
                    hdr: hdr_slot,
                    payload: None,
                }
            }
        };

        tracing::trace!(node = self.node, %id, len, dest, short, "transmit");
        let pkt = Packet {
            hdr: WireHeader::Match(req.hdr),
            iov,
        };
        cx.nic()
            .pio_send(vn, dest, SHORT_MSG_Q, pkt, CompletionKey(completion));

        self.send_exit(id, cx)
    }

    /// Hands the message to the co-located peer engine.
    pub(super) fn send_loop(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let src = self.node;
        let (hdr, iov, group, peer) = {
            let req = self.request_mut(id)?;
            req.set_state(RequestState::AwaitingLoopback);
            (req.hdr, req.iov.clone(), req.hdr.group, req.peer)
        };
        let dest = self.nid_of(group, peer)?;
        cx.nic().loop_send(
            dest,
            LoopMsg::Request {
                src,
                hdr,
                iov,
                key: LoopKey(id),
            },
        );

        self.send_exit(id, cx)
    }

    /// Returns to the caller: blocking sends turn into a wait on their own
    /// request, non-blocking ones return the request handle.
    fn send_exit(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.request_mut(id)?.kind().is_blocking() {
            self.enter_wait(WaitSet::one(id), cx)
        } else {
            self.exit(CallReturn::Posted(id), Duration::ZERO, cx);
            Ok(())
        }
    }
}
