//! Queue processing, delivery and NIC notifications.
//!
//! Queues are drained by whichever context holds the [`ActiveContext`]
//! token: the application while it waits, tests or makes progress, or the
//! interrupt context while the application is blocked. A drain runs in
//! this order:
//!
//! 1. outstanding `NeedRecv` credits are paid back with fresh short buffers,
//! 2. rendezvous acknowledgements complete their sends,
//! 3. loopback responses complete their sends,
//! 4. then exactly one of: one completed GET is acknowledged, or the batch
//!    of arrived messages is matched against the posted receives (messages
//!    without a receive are parked on the unexpected queue), or nothing.
//!
//! Steps 1 to 3 cost no simulated time.

use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use crate::app::CallReturn;
use crate::nic::{
    Completion, CompletionKey, LoopKey, LoopMsg, NodeId, Packet, WireHeader, SHORT_MSG_Q,
};
use crate::request::{AckTarget, IoVec, MatchHeader, MatchInfo, RdvKey, RequestId, RequestState};

use super::matching::search_posted;
use super::short_buffers::LoopRequest;
use super::wait::WaitCtx;
use super::{Context, Engine, EngineError, Msg, StepKind};

/// Who resumes once the queues are drained.
#[derive(Debug)]
pub(super) enum Owner {
    /// A wait or test call.
    Wait(WaitCtx),
    /// A progress call.
    Progress,
    /// The interrupt context.
    Interrupt,
}

/// Bounded unit of work of a drain.
#[derive(Debug)]
pub(super) enum Work {
    Idle,
    /// Acknowledgement of a completed GET.
    LongGetFini(RequestId),
    /// Batch of arrived messages being matched.
    ShortList {
        pending: VecDeque<Msg>,
        current: Option<(Msg, Option<RequestId>)>,
    },
}

/// Exclusive right to drain the queues.
#[derive(Debug)]
pub(super) struct ActiveContext {
    owner: Owner,
    work: Work,
}

impl ActiveContext {
    fn new(owner: Owner) -> Self {
        Self {
            owner,
            work: Work::Idle,
        }
    }

    pub(super) fn owner_name(&self) -> &'static str {
        match self.owner {
            Owner::Wait(_) => "wait",
            Owner::Progress => "progress",
            Owner::Interrupt => "interrupt",
        }
    }
}

/// Where a delivery continues once the message is in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Origin {
    /// A receive call that found its message on the unexpected queue.
    Recv,
    /// A drain matching arrived messages.
    ShortList,
}

/// A matched message being delivered to its receive.
#[derive(Debug)]
pub(super) struct Delivery {
    pub(super) req: RequestId,
    pub(super) msg: Msg,
    pub(super) origin: Origin,
}

impl Engine {
    /// Starts a drain on behalf of `owner`.
    pub(super) fn process_queues(&mut self, owner: Owner, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::ContextBusy);
        }
        let mut ctx = ActiveContext::new(owner);

        self.pay_need_recv(cx)?;
        while let Some(id) = self.long_acks.pop_front() {
            self.process_long_ack(id)?;
        }
        while let Some(key) = self.loop_resps.pop_front() {
            self.process_loop_resp(key)?;
        }

        tracing::trace!(
            node = self.node,
            owner = ctx.owner_name(),
            arrived = self.arrived.len(),
            long_get_fini = self.long_get_fini.len(),
            "process queues"
        );

        if let Some(id) = self.long_get_fini.pop_front() {
            ctx.work = Work::LongGetFini(id);
            self.active = Some(ctx);
            cx.schedule(self.timing.send_ack_delay(), StepKind::LongGetFiniAck);
        } else if !self.arrived.is_empty() {
            ctx.work = Work::ShortList {
                pending: mem::take(&mut self.arrived),
                current: None,
            };
            self.active = Some(ctx);
            self.short_list_next(cx)?;
        } else {
            self.active = Some(ctx);
            cx.schedule(Duration::ZERO, StepKind::QueuesDone);
        }

        Ok(())
    }

    /// Releases the drain token and resumes its owner.
    pub(super) fn queues_done(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let ctx = self
            .active
            .take()
            .ok_or(EngineError::InvalidStep("queues done without an active context"))?;

        match ctx.owner {
            Owner::Wait(w) => self.process_wait(w, cx),
            Owner::Progress => {
                self.exit(CallReturn::Progress, Duration::ZERO, cx);
                Ok(())
            }
            Owner::Interrupt => {
                let w = self
                    .int_ctx
                    .take()
                    .ok_or(EngineError::InvalidStep("interrupt finished with no blocked wait"))?;
                self.process_wait(w, cx)
            }
        }
    }

    /// Requests the interrupt context; the request is remembered if the
    /// application is not blocked or the queues are busy.
    pub(super) fn run_interrupt_ctx(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.int_ctx.is_none() || self.active.is_some() {
            if !self.missed_interrupt {
                self.stats.missed_interrupts += 1;
            }
            self.missed_interrupt = true;
            tracing::trace!(node = self.node, "interrupt missed");

            return Ok(());
        }

        self.stats.interrupts += 1;
        self.process_queues(Owner::Interrupt, cx)
    }

    /// Blocks the application on `w` and replays a missed interrupt.
    pub(super) fn enable_int(&mut self, w: WaitCtx, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.int_ctx.is_some() {
            return Err(EngineError::ContextBusy);
        }
        self.int_ctx = Some(w);

        if mem::take(&mut self.missed_interrupt) {
            self.stats.replayed_interrupts += 1;
            tracing::trace!(node = self.node, "replaying missed interrupt");
            self.run_interrupt_ctx(cx)?;
        }

        Ok(())
    }

    fn process_long_ack(&mut self, id: RequestId) -> Result<(), EngineError> {
        let req = self.request_mut(id)?;
        if req.state() != RequestState::AwaitingAck {
            return Err(EngineError::InvalidState {
                req: id,
                state: req.state(),
            });
        }
        let len = req.length();
        let delay = self.timing.send_fini_delay(len);
        self.request_mut(id)?.set_done(id, delay)?;
        tracing::trace!(node = self.node, %id, "rendezvous acknowledged");

        Ok(())
    }

    fn process_loop_resp(&mut self, key: LoopKey) -> Result<(), EngineError> {
        let id = key.0;
        let req = self.request_mut(id)?;
        if req.state() != RequestState::AwaitingLoopback {
            return Err(EngineError::InvalidState {
                req: id,
                state: req.state(),
            });
        }
        req.set_done(id, Duration::ZERO)?;

        Ok(())
    }

    /// Sends the acknowledgement of a completed GET and completes the
    /// receive.
    pub(super) fn long_get_fini_ack(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let ctx = self
            .active
            .as_mut()
            .ok_or(EngineError::InvalidStep("GET acknowledgement without an active context"))?;
        let Work::LongGetFini(id) = mem::replace(&mut ctx.work, Work::Idle) else {
            return Err(EngineError::InvalidStep("no GET being acknowledged"));
        };

        let req = self.request_mut(id)?;
        let ack = req.ack.take().ok_or(EngineError::InvalidState {
            req: id,
            state: req.state(),
        })?;
        let len = req.length();
        let delay = self.timing.recv_fini_delay(len);
        self.request_mut(id)?.set_done(id, delay)?;

        let vn = self.config.ack_virtual_network;
        let slot = self.heap_mut()?.alloc(WireHeader::ACK_SIZE)?;
        let pkt = Packet {
            hdr: WireHeader::Ack(ack.key),
            iov: vec![IoVec::new(slot, WireHeader::ACK_SIZE)],
        };
        tracing::trace!(node = self.node, %id, dest = ack.nid, "rendezvous ack");
        cx.nic().pio_send(
            vn,
            ack.nid,
            ack.key.as_tag(),
            pkt,
            CompletionKey(Completion::AckSent { slot }),
        );
        cx.schedule(Duration::ZERO, StepKind::QueuesDone);

        Ok(())
    }

    /// Walks the posted queue for the next arrived message of the batch.
    fn short_list_next(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let ctx = self
            .active
            .as_mut()
            .ok_or(EngineError::InvalidStep("short list without an active context"))?;
        let Work::ShortList { pending, current } = &mut ctx.work else {
            return Err(EngineError::InvalidStep("no short list being processed"));
        };

        match pending.pop_front() {
            Some(msg) => {
                let walk = search_posted(&mut self.posted, &self.requests, msg.hdr())?;
                *current = Some((msg, walk.found));
                self.stats.sample_posted(self.posted.len());
                cx.schedule(
                    self.timing.match_delay(walk.examined),
                    StepKind::ShortListWalked,
                );
            }
            None => cx.schedule(Duration::ZERO, StepKind::QueuesDone),
        }

        Ok(())
    }

    /// Delivers the current arrival, or parks it on the unexpected queue.
    pub(super) fn short_list_walked(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let ctx = self
            .active
            .as_mut()
            .ok_or(EngineError::InvalidStep("short list without an active context"))?;
        let Work::ShortList { current, .. } = &mut ctx.work else {
            return Err(EngineError::InvalidStep("no short list being processed"));
        };
        let (msg, found) = current
            .take()
            .ok_or(EngineError::InvalidStep("no arrival being matched"))?;

        match found {
            Some(id) => {
                self.request_mut(id)?.set_state(RequestState::Matching);
                let len = msg.hdr().length();
                self.delivery = Some(Delivery {
                    req: id,
                    msg,
                    origin: Origin::ShortList,
                });
                cx.schedule(self.timing.rx_delay(len), StepKind::DeliverRx);

                Ok(())
            }
            None => {
                tracing::trace!(node = self.node, hdr = ?msg.hdr(), "unexpected message");
                self.unexpected.push_back(msg);
                self.stats.unexpected += 1;
                self.stats.sample_unexpected(self.unexpected.len());

                self.short_list_next(cx)
            }
        }
    }

    /// Records the match and copies short and loopback payloads.
    pub(super) fn deliver_rx(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let d = self
            .delivery
            .as_ref()
            .ok_or(EngineError::InvalidStep("no delivery in progress"))?;
        let hdr = *d.msg.hdr();
        let id = d.req;
        let copy = matches!(d.msg, Msg::Loopback(_)) || self.timing.is_short(hdr.length());

        self.request_mut(id)?.resp = Some(MatchInfo {
            tag: hdr.tag,
            rank: hdr.rank,
            count: hdr.count,
        });

        if copy {
            cx.schedule(
                self.timing.rx_memcpy_delay(hdr.length()),
                StepKind::DeliverCopied,
            );
            Ok(())
        } else {
            self.deliver_finish(cx)
        }
    }

    /// Completes a short or loopback delivery, or starts the GET of a long
    /// message.
    pub(super) fn deliver_finish(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let Delivery { req: id, msg, origin } = self
            .delivery
            .take()
            .ok_or(EngineError::InvalidStep("no delivery in progress"))?;
        self.stats.matched += 1;

        match msg {
            Msg::Loopback(LoopRequest { src, key, .. }) => {
                self.request_mut(id)?.set_done(id, Duration::ZERO)?;
                cx.nic().loop_send(
                    src,
                    LoopMsg::Response {
                        src: self.node,
                        key,
                    },
                );
            }
            Msg::Wire { hdr, buf } => {
                let len = hdr.length();
                if self.timing.is_short(len) {
                    let delay = self.timing.recv_fini_delay(len);
                    self.request_mut(id)?.set_done(id, delay)?;
                } else {
                    let nid = self.nid_of(hdr.group, hdr.rank)?;
                    let req = self.request_mut(id)?;
                    req.set_state(RequestState::AwaitingGet);
                    req.ack = Some(AckTarget { nid, key: hdr.key });
                    let iov = req.iov.clone();
                    tracing::trace!(node = self.node, %id, nid, len, "get");
                    cx.nic()
                        .get(nid, hdr.key, iov, CompletionKey(Completion::Get(id)));
                }
                self.release_short_buffer(buf)?;
            }
        }

        match origin {
            Origin::Recv => self.recv_exit(id, cx),
            Origin::ShortList => self.short_list_next(cx),
        }
    }

    pub(super) fn notify_get_done(
        &mut self,
        key: CompletionKey,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        let Completion::Get(id) = key.0 else {
            return Err(EngineError::InvalidCompletion("GET done"));
        };
        let state = self.request_mut(id)?.state();
        if state != RequestState::AwaitingGet {
            return Err(EngineError::InvalidState { req: id, state });
        }
        self.long_get_fini.push_back(id);

        self.run_interrupt_ctx(cx)
    }

    pub(super) fn notify_send_pio_done(
        &mut self,
        key: CompletionKey,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        match key.0 {
            Completion::PioSend { hdr, payload } => {
                let heap = self.heap_mut()?;
                heap.free(hdr)?;
                if let Some(addr) = payload {
                    heap.free(addr)?;
                }

                Ok(())
            }
            Completion::AckSent { slot } => {
                self.heap_mut()?.free(slot)?;

                self.run_interrupt_ctx(cx)
            }
            _ => Err(EngineError::InvalidCompletion("PIO send done")),
        }
    }

    pub(super) fn notify_recv_dma_done(
        &mut self,
        nid: NodeId,
        tag: u32,
        len: usize,
        key: CompletionKey,
        hdr: WireHeader,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        match (key.0, hdr) {
            (Completion::ShortBuffer(slot), WireHeader::Match(hdr)) => {
                if tag != SHORT_MSG_Q {
                    return Err(EngineError::InvalidTag(tag));
                }
                let buf = self
                    .short_buffers
                    .try_remove(slot)
                    .ok_or(EngineError::InvalidCompletion("short buffer not posted"))?;
                tracing::trace!(node = self.node, nid, len, tag = hdr.tag, "short message arrived");
                debug_assert!(len <= MatchHeader::WIRE_SIZE + self.config.short_msg_length);
                self.arrived.push_back(Msg::Wire { hdr, buf });

                self.run_interrupt_ctx(cx)
            }
            (Completion::RendezvousAck { req, slot }, WireHeader::Ack(key)) => {
                if RdvKey::from_tag(tag) != Some(key) {
                    return Err(EngineError::InvalidTag(tag));
                }
                self.heap_mut()?.free(slot)?;
                self.long_acks.push_back(req);

                self.run_interrupt_ctx(cx)
            }
            _ => Err(EngineError::InvalidCompletion("DMA receive done")),
        }
    }

    pub(super) fn notify_need_recv(
        &mut self,
        nid: NodeId,
        tag: u32,
        len: usize,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        if tag != SHORT_MSG_Q {
            return Err(EngineError::InvalidTag(tag));
        }
        tracing::trace!(node = self.node, nid, len, "need recv");
        self.need_recv += 1;

        self.run_interrupt_ctx(cx)
    }

    pub(super) fn loop_handler(&mut self, msg: LoopMsg, cx: &mut Context<'_>) -> Result<(), EngineError> {
        match msg {
            LoopMsg::Request { src, hdr, key, .. } => {
                tracing::trace!(node = self.node, src, tag = hdr.tag, "loopback request");
                self.recv_looped += 1;
                self.arrived
                    .push_back(Msg::Loopback(LoopRequest { src, hdr, key }));
            }
            LoopMsg::Response { src, key } => {
                tracing::trace!(node = self.node, src, "loopback response");
                self.loop_resps.push_back(key);
            }
        }

        self.run_interrupt_ctx(cx)
    }
}
