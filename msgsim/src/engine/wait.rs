//! Wait, test, cancel and progress calls.

use std::time::Duration;

use crate::app::CallReturn;
use crate::request::{Request, RequestId, RequestState};
use crate::wait::WaitSet;

use super::queues::Owner;
use super::{Context, Engine, EngineError, StepKind};

/// Whether the caller blocks until the set is satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum WaitMode {
    Block,
    Test,
}

/// A wait or test call in progress.
#[derive(Debug)]
pub(crate) struct WaitCtx {
    set: WaitSet,
    mode: WaitMode,
    /// Request being collected, with its position in the set.
    collecting: Option<(usize, RequestId, Request)>,
}

impl WaitCtx {
    fn new(set: WaitSet, mode: WaitMode) -> Self {
        Self {
            set,
            mode,
            collecting: None,
        }
    }
}

impl Engine {
    pub(super) fn enter_wait(&mut self, set: WaitSet, cx: &mut Context<'_>) -> Result<(), EngineError> {
        self.check_wait_set(&set)?;
        tracing::debug!(node = self.node, kind = ?set.kind(), "wait");

        self.process_queues(Owner::Wait(WaitCtx::new(set, WaitMode::Block)), cx)
    }

    pub(super) fn enter_test(&mut self, set: WaitSet, cx: &mut Context<'_>) -> Result<(), EngineError> {
        self.check_wait_set(&set)?;
        tracing::debug!(node = self.node, kind = ?set.kind(), "test");

        self.process_queues(Owner::Wait(WaitCtx::new(set, WaitMode::Test)), cx)
    }

    pub(super) fn enter_make_progress(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        tracing::debug!(node = self.node, "make progress");

        self.process_queues(Owner::Progress, cx)
    }

    /// Cancels a receive that is still posted; a request that was already
    /// matched or completed is left untouched.
    pub(super) fn enter_cancel(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let state = self
            .requests
            .get(id.0)
            .ok_or(EngineError::UnknownRequest(id))?
            .state();

        let cancelled = match self.posted.iter().position(|&r| r == id) {
            Some(pos) if state == RequestState::Posted => {
                self.posted.remove(pos);
                self.stats.sample_posted(self.posted.len());
                self.stats.cancelled += 1;
                self.request_mut(id)?.cancel()
            }
            _ => false,
        };
        tracing::debug!(node = self.node, %id, cancelled, "cancel");

        self.exit(CallReturn::Cancel { cancelled }, Duration::ZERO, cx);

        Ok(())
    }

    fn check_wait_set(&self, set: &WaitSet) -> Result<(), EngineError> {
        match set.pending().find(|r| !self.requests.contains(r.0)) {
            Some(r) => Err(EngineError::UnknownRequest(r)),
            None => Ok(()),
        }
    }

    /// Collects the next finished request of the set, or blocks, or
    /// returns.
    pub(super) fn process_wait(&mut self, mut w: WaitCtx, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let requests = &self.requests;
        let hit = w
            .set
            .take_finished(|r| requests.get(r.0).is_some_and(Request::is_done));

        match hit {
            Some((index, id)) => {
                let req = self
                    .requests
                    .try_remove(id.0)
                    .ok_or(EngineError::UnknownRequest(id))?;
                let delay = req.fini_delay();
                w.collecting = Some((index, id, req));
                self.waiting = Some(w);
                cx.schedule(delay, StepKind::WaitFini);

                Ok(())
            }
            None if w.set.is_done() => {
                let outcome = w.set.into_outcome();
                let ret = match w.mode {
                    WaitMode::Block => CallReturn::Done(outcome),
                    WaitMode::Test => CallReturn::Test {
                        flag: true,
                        outcome,
                    },
                };
                self.exit(ret, Duration::ZERO, cx);

                Ok(())
            }
            None => match w.mode {
                WaitMode::Block => self.enable_int(w, cx),
                WaitMode::Test => {
                    let ret = CallReturn::Test {
                        flag: false,
                        outcome: w.set.into_outcome(),
                    };
                    self.exit(ret, Duration::ZERO, cx);

                    Ok(())
                }
            },
        }
    }

    /// Unpins the buffer of a collected long receive.
    pub(super) fn wait_fini(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let mut w = self
            .waiting
            .take()
            .ok_or(EngineError::InvalidStep("no wait collecting a request"))?;
        let (index, id, req) = w
            .collecting
            .take()
            .ok_or(EngineError::InvalidStep("no request being collected"))?;
        w.set.record(index, id, req.status());

        let len = req.length();
        if self.timing.is_short(len) {
            return self.process_wait(w, cx);
        }

        // Long sends were registered for the peer's GET but their unpin is
        // not charged.
        let unpin_len = if req.kind().is_send() { 0 } else { len };
        self.waiting = Some(w);
        cx.schedule(self.timing.reg_region_delay(unpin_len), StepKind::WaitUnpinned);

        Ok(())
    }

    pub(super) fn wait_unpinned(&mut self, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let w = self
            .waiting
            .take()
            .ok_or(EngineError::InvalidStep("no wait collecting a request"))?;

        self.process_wait(w, cx)
    }
}
