//! Application-facing calls.
//!
//! An [`Application`] drives one rank: it issues one [`Call`] at a time and
//! is resumed with the matching [`CallReturn`] once the engine is done with
//! the call. Applications are plain state machines with no access to the
//! engine, which keeps the one-outstanding-call rule structural.

use std::fmt;
use std::time::Duration;

use crate::heap::SimAddr;
use crate::request::{iov_len, Communicator, Datatype, IoVec, RankId, RequestId, COMM_WORLD};
use crate::time::MonotonicTime;
use crate::wait::WaitOutcome;

/// Buffer and envelope of a send or receive call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgArgs {
    /// Buffer regions.
    pub iov: Vec<IoVec>,
    /// Element type.
    pub dtype: Datatype,
    /// Destination rank (sends) or wanted source rank (receives).
    pub peer: RankId,
    /// Tag.
    pub tag: u64,
    /// Tag bits ignored when matching a receive.
    pub ignore: u64,
    /// Communicator.
    pub group: Communicator,
}

impl MsgArgs {
    /// Contiguous buffer of `count` elements on the world communicator.
    pub fn new(addr: SimAddr, count: u32, dtype: Datatype, peer: RankId, tag: u64) -> Self {
        let len = count as usize * dtype.size() as usize;
        Self::vectored(vec![IoVec::new(addr, len)], dtype, peer, tag)
    }

    /// Scatter/gather buffer on the world communicator.
    pub fn vectored(iov: Vec<IoVec>, dtype: Datatype, peer: RankId, tag: u64) -> Self {
        Self {
            iov,
            dtype,
            peer,
            tag,
            ignore: 0,
            group: COMM_WORLD,
        }
    }

    /// Sets the communicator.
    pub fn with_group(mut self, group: Communicator) -> Self {
        self.group = group;
        self
    }

    /// Sets the tag bits ignored when matching.
    pub fn with_ignore(mut self, ignore: u64) -> Self {
        self.ignore = ignore;
        self
    }

    /// Total buffer length.
    pub fn len(&self) -> usize {
        iov_len(&self.iov)
    }

    /// Returns `true` if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A call into the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// Sets up the heap and posts the initial short buffers.
    Init,
    /// Blocking send.
    Send(MsgArgs),
    /// Non-blocking send.
    Isend(MsgArgs),
    /// Blocking receive.
    Recv(MsgArgs),
    /// Non-blocking receive.
    Irecv(MsgArgs),
    /// Waits for one request.
    Wait(RequestId),
    /// Waits for any of the requests.
    WaitAny(Vec<RequestId>),
    /// Waits for all the requests.
    WaitAll(Vec<RequestId>),
    /// Polls one request.
    Test(RequestId),
    /// Polls a set of requests for any completion.
    TestAny(Vec<RequestId>),
    /// Cancels a request.
    Cancel(RequestId),
    /// Drains the engine queues once.
    MakeProgress,
    /// Computes for the given duration.
    Compute(Duration),
}

/// Value a call returns to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallReturn {
    /// Initialization completed.
    Init,
    /// A non-blocking call created a request.
    Posted(RequestId),
    /// A blocking call or a wait completed.
    Done(WaitOutcome),
    /// A test completed; `flag` tells whether the tested set was satisfied.
    Test {
        /// Set satisfied.
        flag: bool,
        /// Requests collected by the test.
        outcome: WaitOutcome,
    },
    /// A cancel completed.
    Cancel {
        /// `true` if the request was cancelled before completing.
        cancelled: bool,
    },
    /// A progress call completed.
    Progress,
    /// A compute call completed.
    Computed,
}

/// Model of the application running on one rank.
pub trait Application {
    /// Called once initialization has returned; returns the first call, or
    /// `None` if the application has nothing to do.
    fn start(&mut self, time: MonotonicTime) -> Option<Call>;

    /// Called when the previous call returns; returns the next call, or
    /// `None` once the application has finished.
    fn resume(&mut self, ret: CallReturn, time: MonotonicTime) -> Option<Call>;
}

impl fmt::Debug for dyn Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application").finish_non_exhaustive()
    }
}
