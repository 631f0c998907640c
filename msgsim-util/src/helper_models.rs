//! Helper models.
//!
//! This module contains application models useful for bench assembly and
//! scenario tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use msgsim::app::{Application, Call, CallReturn, MsgArgs};
use msgsim::heap::SimAddr;
use msgsim::request::{Datatype, RankId, RequestId};
use msgsim::time::MonotonicTime;

/// Operation of a [`Script`].
///
/// Requests are referred to by position: `n` designates the request created
/// by the `n`-th non-blocking call of the script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Issues a call as is.
    Call(Call),
    /// Waits for the `n`-th request.
    Wait(usize),
    /// Waits for any of the listed requests.
    WaitAny(Vec<usize>),
    /// Waits for all the listed requests.
    WaitAll(Vec<usize>),
    /// Tests the `n`-th request.
    Test(usize),
    /// Tests the listed requests for any completion.
    TestAny(Vec<usize>),
    /// Cancels the `n`-th request.
    Cancel(usize),
}

/// Time-stamped returns observed by a [`Script`].
///
/// The journal is shared: a clone taken before the script is handed to a
/// bench sees the entries recorded during the run.
#[derive(Clone, Debug, Default)]
pub struct Journal(Rc<RefCell<Vec<(MonotonicTime, CallReturn)>>>);

impl Journal {
    /// Copy of all entries.
    pub fn entries(&self) -> Vec<(MonotonicTime, CallReturn)> {
        self.0.borrow().clone()
    }

    /// Copy of the returned values, without their times.
    pub fn returns(&self) -> Vec<CallReturn> {
        self.0.borrow().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, time: MonotonicTime, ret: CallReturn) {
        self.0.borrow_mut().push((time, ret));
    }
}

/// An application running a fixed list of operations.
#[derive(Debug)]
pub struct Script {
    ops: VecDeque<Op>,
    handles: Vec<RequestId>,
    journal: Journal,
}

impl Script {
    /// Creates a script running `ops` in order.
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops: ops.into(),
            handles: Vec::new(),
            journal: Journal::default(),
        }
    }

    /// Handle on the journal of returns.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn handle(&self, n: usize) -> Option<RequestId> {
        let h = self.handles.get(n).copied();
        if h.is_none() {
            tracing::error!(position = n, posted = self.handles.len(), "no such request in script");
        }

        h
    }

    fn handles(&self, ns: &[usize]) -> Option<Vec<RequestId>> {
        ns.iter().map(|&n| self.handle(n)).collect()
    }

    /// Resolves the next operation; a dangling request position ends the
    /// script.
    fn next_call(&mut self) -> Option<Call> {
        let call = match self.ops.pop_front()? {
            Op::Call(call) => call,
            Op::Wait(n) => Call::Wait(self.handle(n)?),
            Op::WaitAny(ns) => Call::WaitAny(self.handles(&ns)?),
            Op::WaitAll(ns) => Call::WaitAll(self.handles(&ns)?),
            Op::Test(n) => Call::Test(self.handle(n)?),
            Op::TestAny(ns) => Call::TestAny(self.handles(&ns)?),
            Op::Cancel(n) => Call::Cancel(self.handle(n)?),
        };

        Some(call)
    }
}

impl Application for Script {
    fn start(&mut self, _time: MonotonicTime) -> Option<Call> {
        self.next_call()
    }

    fn resume(&mut self, ret: CallReturn, time: MonotonicTime) -> Option<Call> {
        if let CallReturn::Posted(id) = ret {
            self.handles.push(id);
        }
        self.journal.push(time, ret);

        self.next_call()
    }
}

/// One side of a ping-pong exchange.
///
/// The initiator sends then receives, the responder receives then sends,
/// `iterations` times, with blocking calls and an optional compute phase
/// before each send.
#[derive(Debug)]
pub struct PingPong {
    peer: RankId,
    initiator: bool,
    buf: SimAddr,
    len: u32,
    iterations: usize,
    think: Duration,
    issued: usize,
    computed: bool,
}

impl PingPong {
    /// Tag used by all messages.
    pub const TAG: u64 = 0x70;

    /// Creates the side that sends first.
    pub fn initiator(peer: RankId, len: u32, iterations: usize) -> Self {
        Self::new(peer, true, len, iterations)
    }

    /// Creates the side that receives first.
    pub fn responder(peer: RankId, len: u32, iterations: usize) -> Self {
        Self::new(peer, false, len, iterations)
    }

    fn new(peer: RankId, initiator: bool, len: u32, iterations: usize) -> Self {
        Self {
            peer,
            initiator,
            buf: SimAddr::new(0x4000_0000),
            len,
            iterations,
            think: Duration::ZERO,
            issued: 0,
            computed: false,
        }
    }

    /// Computes for `think` before every send.
    pub fn with_think_time(mut self, think: Duration) -> Self {
        self.think = think;
        self
    }

    fn next_call(&mut self) -> Option<Call> {
        if self.issued == 2 * self.iterations {
            return None;
        }
        let sending = (self.issued % 2 == 0) == self.initiator;
        if sending && !self.think.is_zero() && !self.computed {
            self.computed = true;
            return Some(Call::Compute(self.think));
        }
        self.computed = false;
        self.issued += 1;

        let args = MsgArgs::new(self.buf, self.len, Datatype::Char, self.peer, Self::TAG);
        Some(if sending {
            Call::Send(args)
        } else {
            Call::Recv(args)
        })
    }
}

impl Application for PingPong {
    fn start(&mut self, _time: MonotonicTime) -> Option<Call> {
        self.next_call()
    }

    fn resume(&mut self, _ret: CallReturn, _time: MonotonicTime) -> Option<Call> {
        self.next_call()
    }
}
