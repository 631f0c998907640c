//! Sets of requests a caller waits on.
//!
//! A [`WaitSet`] is satisfied when its single request completes
//! ([`WaitKind::One`]), when any one request completes ([`WaitKind::Any`]),
//! or when every request has completed ([`WaitKind::All`]). The engine
//! repeatedly asks the set for the next finished request with
//! [`WaitSet::take_finished`] and records each collected request's status.

use crate::request::{RequestId, Status};

/// Completion rule of a wait set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// Wait on a single request.
    One,
    /// Wait until any request completes.
    Any,
    /// Wait until every request completes.
    All,
}

/// One collected request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Position of the request in the waited list.
    pub index: usize,
    /// Request handle.
    pub req: RequestId,
    /// Final status.
    pub status: Status,
}

/// Result of a wait or test call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Completion rule of the call.
    pub kind: WaitKind,
    /// Requests collected by the call, in collection order.
    pub completed: Vec<Completion>,
}

impl WaitOutcome {
    /// Status of the first collected request.
    pub fn first(&self) -> Option<&Status> {
        self.completed.first().map(|c| &c.status)
    }
}

/// Requests still being waited on, with their original positions.
#[derive(Clone, Debug)]
pub struct WaitSet {
    kind: WaitKind,
    pending: Vec<(usize, RequestId)>,
    completed: Vec<Completion>,
}

impl WaitSet {
    /// Waits on a single request.
    pub fn one(req: RequestId) -> Self {
        Self::new(WaitKind::One, vec![req])
    }

    /// Waits until any of `reqs` completes.
    pub fn any(reqs: Vec<RequestId>) -> Self {
        Self::new(WaitKind::Any, reqs)
    }

    /// Waits until all of `reqs` complete.
    pub fn all(reqs: Vec<RequestId>) -> Self {
        Self::new(WaitKind::All, reqs)
    }

    fn new(kind: WaitKind, reqs: Vec<RequestId>) -> Self {
        Self {
            kind,
            pending: reqs.into_iter().enumerate().collect(),
            completed: Vec::new(),
        }
    }

    /// Completion rule.
    pub fn kind(&self) -> WaitKind {
        self.kind
    }

    /// Requests not yet collected.
    pub fn pending(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.pending.iter().map(|&(_, r)| r)
    }

    /// Removes and returns the first pending request for which `is_done`
    /// holds, together with its position.
    ///
    /// For [`WaitKind::Any`], a hit also drops every other pending request so
    /// that the set is satisfied.
    pub fn take_finished(
        &mut self,
        mut is_done: impl FnMut(RequestId) -> bool,
    ) -> Option<(usize, RequestId)> {
        let pos = self.pending.iter().position(|&(_, r)| is_done(r))?;
        let hit = self.pending.remove(pos);
        if self.kind == WaitKind::Any {
            self.pending.clear();
        }

        Some(hit)
    }

    /// Records the status of a collected request.
    pub fn record(&mut self, index: usize, req: RequestId, status: Status) {
        self.completed.push(Completion { index, req, status });
    }

    /// Returns `true` once the completion rule is satisfied.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consumes the set into the outcome reported to the caller.
    pub fn into_outcome(self) -> WaitOutcome {
        WaitOutcome {
            kind: self.kind,
            completed: self.completed,
        }
    }
}
