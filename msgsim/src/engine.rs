//! The point-to-point message engine.
//!
//! One [`Engine`] runs per simulated rank. It turns application calls
//! (send, receive, wait, test, cancel, progress) into NIC commands and
//! delays, and matches incoming messages against posted receives.
//!
//! # Execution model
//!
//! The engine never blocks and never holds closures. Every entry point
//! receives a [`Context`] and leaves its continuation in the context outbox
//! as an [`Action`]: either a [`Step`] to run again after a delay, or a
//! [`CallReturn`] to hand back to the application after a delay. The driver
//! turns these actions into events and calls [`Engine::dispatch`] when a
//! step is due. NIC completions come back through [`Engine::notify`].
//!
//! # Protocols
//!
//! Messages up to `short_msg_length` bytes are sent eagerly: header and a
//! copy of the payload travel in one wire message and land in a short
//! buffer pre-posted by the receiver.
//!
//! ```text
//!  sender                                  receiver
//!    │ tx setup, header write, copy          │
//!    │ pio_send(header + payload) ─────────► │ short buffer filled
//!    │ request done                          │ matched, copied, done
//! ```
//!
//! Longer messages use a rendezvous: only the header travels eagerly, the
//! receiver fetches the payload with a GET and acknowledges it.
//!
//! ```text
//!  sender                                  receiver
//!    │ tx setup, header write, pin           │
//!    │ dma_recv(ack), reg_mem(buffer)        │
//!    │ pio_send(header) ───────────────────► │ matched
//!    │ ◄──────────────────────────────────── │ get(buffer)
//!    │ ◄──────────────────────────────────── │ ack, request done
//!    │ request done                          │
//! ```
//!
//! Sends to a co-located rank bypass the wire and the heap: they are handed
//! to the peer engine with [`Nic::loop_send`] and completed by its response.
//!
//! # Interrupt context
//!
//! NIC completions never run matching logic themselves. They queue their
//! work and request the interrupt context, which only runs while the
//! application is blocked in a wait and no other context is draining the
//! queues. A request arriving while a context is busy is remembered and
//! replayed the next time the engine blocks.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use slab::Slab;

use crate::app::{Call, CallReturn, MsgArgs};
use crate::config::EngineConfig;
use crate::group::Groups;
use crate::heap::HeapAddrs;
use crate::nic::{LoopKey, Nic, NodeId, Notification};
use crate::request::{
    iov_len, MatchHeader, RankId, RdvKey, Request, RequestId, RequestKind, ANY_SRC,
};
use crate::stats::EngineStats;
use crate::time::MonotonicTime;
use crate::timing::MsgTiming;
use crate::wait::WaitSet;

mod error;
mod matching;
mod queues;
mod recv;
mod send;
mod short_buffers;
mod wait;

pub use error::{EngineError, FatalError};

use queues::{ActiveContext, Delivery};
use short_buffers::{Msg, ShortRecvBuffer};
use wait::WaitCtx;

/// An engine continuation.
///
/// Steps are opaque to the driver, which only stores them and hands them
/// back to [`Engine::dispatch`] when due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step(pub(crate) StepKind);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepKind {
    /// Transmit setup paid; write the header.
    SendSetup(RequestId),
    /// Header written; pin or copy the payload.
    SendHdrWritten(RequestId),
    /// Payload ready; hand the message to the NIC.
    SendTransmit(RequestId),
    /// Transmit setup paid; hand the message to the co-located peer.
    SendLoop(RequestId),
    /// Receive post paid; pin a long buffer or start matching.
    RecvPosted(RequestId),
    /// Long receive buffer pinned; start matching.
    RecvPinned(RequestId),
    /// Unexpected queue walked.
    RecvWalked(RequestId),
    /// Receive setup paid for the current delivery.
    DeliverRx,
    /// Payload of the current delivery copied.
    DeliverCopied,
    /// Posted queue walked for the current arrival.
    ShortListWalked,
    /// Acknowledgement delay of a completed GET paid.
    LongGetFiniAck,
    /// Queue drain finished.
    QueuesDone,
    /// Completion delay of a collected request paid.
    WaitFini,
    /// Buffer of a collected request unpinned.
    WaitUnpinned,
}

/// Continuation left by an engine entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run `step` after `delay`.
    Schedule {
        /// Delay from the current time.
        delay: Duration,
        /// Continuation.
        step: Step,
    },
    /// Resume the application with `ret` after `delay`.
    Return {
        /// Delay from the current time.
        delay: Duration,
        /// Value returned by the call.
        ret: CallReturn,
    },
}

/// Per-invocation environment of an engine entry point.
pub struct Context<'a> {
    time: MonotonicTime,
    nic: &'a mut dyn Nic,
    actions: &'a mut Vec<Action>,
}

impl<'a> Context<'a> {
    /// Creates a context at `time`, issuing NIC commands to `nic` and
    /// pushing continuations to `actions`.
    pub fn new(time: MonotonicTime, nic: &'a mut dyn Nic, actions: &'a mut Vec<Action>) -> Self {
        Self { time, nic, actions }
    }

    /// Current simulation time.
    pub fn time(&self) -> MonotonicTime {
        self.time
    }

    pub(crate) fn nic(&mut self) -> &mut (dyn Nic + 'a) {
        &mut *self.nic
    }

    pub(crate) fn schedule(&mut self, delay: Duration, step: StepKind) {
        self.actions.push(Action::Schedule {
            delay,
            step: Step(step),
        });
    }

    pub(crate) fn return_to_caller(&mut self, delay: Duration, ret: CallReturn) {
        self.actions.push(Action::Return { delay, ret });
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// Message engine of one rank.
pub struct Engine {
    node: NodeId,
    rank: RankId,
    config: EngineConfig,
    timing: MsgTiming,
    groups: Groups,
    heap: Option<HeapAddrs>,

    requests: Slab<Request>,
    /// Receives waiting for a message.
    posted: VecDeque<RequestId>,
    /// Messages received but not yet matched against `posted`.
    arrived: VecDeque<Msg>,
    /// Messages that matched no posted receive.
    unexpected: VecDeque<Msg>,
    /// Short buffers currently posted to the NIC.
    short_buffers: Slab<ShortRecvBuffer>,
    long_get_fini: VecDeque<RequestId>,
    long_acks: VecDeque<RequestId>,
    loop_resps: VecDeque<LoopKey>,

    /// Outstanding `NeedRecv` credits.
    need_recv: usize,
    /// Buffers posted in answer to `NeedRecv` and not yet paid back.
    nic_requested_short: usize,
    /// Loopback messages received and not yet paid back.
    recv_looped: usize,
    next_key: u16,

    missed_interrupt: bool,
    active: Option<ActiveContext>,
    int_ctx: Option<WaitCtx>,
    waiting: Option<WaitCtx>,
    delivery: Option<Delivery>,

    exit_delay: Duration,
    in_call: bool,
    stats: EngineStats,
}

impl Engine {
    /// Creates the engine of `node`, whose communicators are `groups`.
    pub fn new(node: NodeId, config: EngineConfig, groups: Groups) -> Result<Self, EngineError> {
        config.validate()?;
        let rank = groups.world_rank().ok_or(EngineError::NoWorld)?;
        let timing = MsgTiming::new(
            config.short_msg_length,
            config.send_ack_delay_ns,
            &config.timing,
        );

        Ok(Self {
            node,
            rank,
            config,
            timing,
            groups,
            heap: None,
            requests: Slab::new(),
            posted: VecDeque::new(),
            arrived: VecDeque::new(),
            unexpected: VecDeque::new(),
            short_buffers: Slab::new(),
            long_get_fini: VecDeque::new(),
            long_acks: VecDeque::new(),
            loop_resps: VecDeque::new(),
            need_recv: 0,
            nic_requested_short: 0,
            recv_looped: 0,
            next_key: 0,
            missed_interrupt: false,
            active: None,
            int_ctx: None,
            waiting: None,
            delivery: None,
            exit_delay: Duration::ZERO,
            in_call: false,
            stats: EngineStats::default(),
        })
    }

    /// Node the engine runs on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// World rank of the engine.
    pub fn rank(&self) -> RankId {
        self.rank
    }

    /// Latency model, for installing custom latency functions.
    pub fn timing_mut(&mut self) -> &mut MsgTiming {
        &mut self.timing
    }

    /// Looks a live request up.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id.0)
    }

    /// Number of short buffers currently posted to the NIC.
    pub fn posted_short_buffers(&self) -> usize {
        self.short_buffers.len()
    }

    /// Current statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Logs and returns the final statistics.
    pub fn finish(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.posted_depth = self.posted.len();
        stats.unexpected_depth = self.unexpected.len();

        tracing::info!(
            node = self.node,
            rank = self.rank,
            sends = stats.sends,
            recvs = stats.recvs,
            matched = stats.matched,
            posted = stats.posted_depth,
            unexpected = stats.unexpected_depth,
            max_posted = stats.max_posted_depth,
            max_unexpected = stats.max_unexpected_depth,
            short_buffers = self.short_buffers.len(),
            interrupts = stats.interrupts,
            missed_interrupts = stats.missed_interrupts,
            "engine finished"
        );

        stats
    }

    /// Executes an application call.
    ///
    /// Exactly one [`Action::Return`] is eventually produced for the call,
    /// possibly by a later [`dispatch`](Self::dispatch). Issuing a call
    /// before the previous one has returned is a fatal error.
    pub fn call(&mut self, call: Call, cx: &mut Context<'_>) -> Result<(), FatalError> {
        let event = format!("{:?}", call);
        self.enter_call(call, cx)
            .map_err(|e| self.fatal(event, e))
    }

    /// Initializes the heap and posts the initial short buffers.
    pub fn init(&mut self, cx: &mut Context<'_>) -> Result<(), FatalError> {
        self.call(Call::Init, cx)
    }

    /// Runs a continuation previously left in the context outbox.
    pub fn dispatch(&mut self, step: Step, cx: &mut Context<'_>) -> Result<(), FatalError> {
        self.run_step(step.0, cx)
            .map_err(|e| self.fatal(format!("{:?}", step.0), e))
    }

    /// Handles a NIC notification.
    pub fn notify(&mut self, n: Notification, cx: &mut Context<'_>) -> Result<(), FatalError> {
        let event = format!("{:?}", n);
        let res = match n {
            Notification::GetDone(key) => self.notify_get_done(key, cx),
            Notification::SendPioDone(key) => self.notify_send_pio_done(key, cx),
            Notification::RecvDmaDone {
                nid,
                tag,
                len,
                key,
                hdr,
            } => self.notify_recv_dma_done(nid, tag, len, key, hdr, cx),
            Notification::NeedRecv { nid, tag, len } => self.notify_need_recv(nid, tag, len, cx),
            Notification::Loop(msg) => self.loop_handler(msg, cx),
        };

        res.map_err(|e| self.fatal(event, e))
    }

    fn enter_call(&mut self, call: Call, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.in_call {
            return Err(EngineError::CallInProgress);
        }
        self.in_call = true;
        self.exit_delay = Duration::ZERO;

        match call {
            Call::Init => self.enter_init(cx),
            Call::Send(args) => self.enter_send(RequestKind::Send, args, cx),
            Call::Isend(args) => self.enter_send(RequestKind::Isend, args, cx),
            Call::Recv(args) => self.enter_recv(RequestKind::Recv, args, cx),
            Call::Irecv(args) => self.enter_recv(RequestKind::Irecv, args, cx),
            Call::Wait(req) => self.enter_wait(WaitSet::one(req), cx),
            Call::WaitAny(reqs) => {
                self.exit_delay = self.timing.waitany_state_delay();
                self.enter_wait(WaitSet::any(reqs), cx)
            }
            Call::WaitAll(reqs) => {
                self.exit_delay = self.timing.waitall_state_delay();
                self.enter_wait(WaitSet::all(reqs), cx)
            }
            Call::Test(req) => self.enter_test(WaitSet::one(req), cx),
            Call::TestAny(reqs) => self.enter_test(WaitSet::any(reqs), cx),
            Call::Cancel(req) => self.enter_cancel(req, cx),
            Call::MakeProgress => self.enter_make_progress(cx),
            Call::Compute(delay) => {
                self.exit(CallReturn::Computed, delay, cx);
                Ok(())
            }
        }
    }

    fn enter_init(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.heap.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        self.heap = Some(HeapAddrs::new(
            self.config.heap_start(),
            self.config.heap_length(),
        ));
        for _ in 0..self.config.min_posted_short_buffers {
            self.post_short_buffer(cx)?;
        }
        tracing::debug!(
            node = self.node,
            short_buffers = self.short_buffers.len(),
            "engine initialized"
        );

        self.exit(CallReturn::Init, Duration::ZERO, cx);

        Ok(())
    }

    fn run_step(&mut self, step: StepKind, cx: &mut Context<'_>) -> Result<(), EngineError> {
        match step {
            StepKind::SendSetup(id) => self.send_write_header(id, cx),
            StepKind::SendHdrWritten(id) => self.send_stage_payload(id, cx),
            StepKind::SendTransmit(id) => self.send_transmit(id, cx),
            StepKind::SendLoop(id) => self.send_loop(id, cx),
            StepKind::RecvPosted(id) => self.recv_posted(id, cx),
            StepKind::RecvPinned(id) => self.recv_search_unexpected(id, cx),
            StepKind::RecvWalked(id) => self.recv_walked(id, cx),
            StepKind::DeliverRx => self.deliver_rx(cx),
            StepKind::DeliverCopied => self.deliver_finish(cx),
            StepKind::ShortListWalked => self.short_list_walked(cx),
            StepKind::LongGetFiniAck => self.long_get_fini_ack(cx),
            StepKind::QueuesDone => self.queues_done(cx),
            StepKind::WaitFini => self.wait_fini(cx),
            StepKind::WaitUnpinned => self.wait_unpinned(cx),
        }
    }

    /// Hands `ret` back to the application after the call's exit delay plus
    /// `delay`.
    fn exit(&mut self, ret: CallReturn, delay: Duration, cx: &mut Context<'_>) {
        tracing::trace!(node = self.node, ?ret, "call returns");
        cx.return_to_caller(self.exit_delay + delay, ret);
        self.exit_delay = Duration::ZERO;
        self.in_call = false;
    }

    /// Builds a request from call arguments.
    fn new_request(&self, kind: RequestKind, args: MsgArgs) -> Result<Request, EngineError> {
        let group = self
            .groups
            .get(args.group)
            .ok_or(EngineError::UnknownCommunicator(args.group))?;

        let peer_known = group.node_of(args.peer).is_some();
        if !(peer_known || (!kind.is_send() && args.peer == ANY_SRC)) {
            return Err(EngineError::UnknownRank {
                group: args.group,
                rank: args.peer,
            });
        }

        let dtype_size = args.dtype.size();
        let len = iov_len(&args.iov);
        if len % dtype_size as usize != 0 {
            return Err(EngineError::PartialElement { len, dtype_size });
        }
        let count = u32::try_from(len / dtype_size as usize)
            .map_err(|_| EngineError::MessageTooLong(len))?;

        let hdr = MatchHeader {
            count,
            dtype_size,
            rank: if kind.is_send() {
                group.my_rank()
            } else {
                args.peer
            },
            group: args.group,
            tag: args.tag,
            key: RdvKey::default(),
        };

        Ok(Request::new(kind, hdr, args.iov, args.peer, args.ignore))
    }

    fn request_mut(&mut self, id: RequestId) -> Result<&mut Request, EngineError> {
        self.requests
            .get_mut(id.0)
            .ok_or(EngineError::UnknownRequest(id))
    }

    fn heap_mut(&mut self) -> Result<&mut HeapAddrs, EngineError> {
        self.heap.as_mut().ok_or(EngineError::NotInitialized)
    }

    /// Node hosting `rank` of communicator `group`.
    fn nid_of(&self, group: u32, rank: RankId) -> Result<NodeId, EngineError> {
        self.groups
            .get(group)
            .ok_or(EngineError::UnknownCommunicator(group))?
            .node_of(rank)
            .ok_or(EngineError::UnknownRank { group, rank })
    }

    /// Returns `true` if `nid` shares the host of this engine.
    fn is_local(&self, nid: NodeId) -> bool {
        nid / self.config.nics_per_node == self.node / self.config.nics_per_node
    }

    /// Next rendezvous key.
    fn gen_key(&mut self) -> RdvKey {
        let key = RdvKey::rendezvous(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);

        key
    }

    fn fatal(&self, event: String, error: EngineError) -> FatalError {
        let state = format!(
            "posted={} arrived={} unexpected={} short_buffers={} requests={} active={} blocked={} missed_interrupt={}",
            self.posted.len(),
            self.arrived.len(),
            self.unexpected.len(),
            self.short_buffers.len(),
            self.requests.len(),
            self.active.as_ref().map_or("none", ActiveContext::owner_name),
            self.int_ctx.is_some(),
            self.missed_interrupt,
        );
        tracing::error!(
            node = self.node,
            rank = self.rank,
            %event,
            %state,
            %error,
            "fatal engine error"
        );

        FatalError {
            node: self.node,
            rank: self.rank,
            event,
            state,
            error,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("node", &self.node)
            .field("rank", &self.rank)
            .field("posted", &self.posted.len())
            .field("unexpected", &self.unexpected.len())
            .field("short_buffers", &self.short_buffers.len())
            .finish_non_exhaustive()
    }
}
