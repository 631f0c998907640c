//! Receive path.

use std::time::Duration;

use crate::app::{CallReturn, MsgArgs};
use crate::request::{RequestId, RequestKind, RequestState};
use crate::wait::WaitSet;

use super::matching::search_unexpected;
use super::queues::{Delivery, Origin};
use super::{Context, Engine, EngineError, StepKind};

impl Engine {
    pub(super) fn enter_recv(
        &mut self,
        kind: RequestKind,
        args: MsgArgs,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        if self.heap.is_none() {
            return Err(EngineError::NotInitialized);
        }
        self.exit_delay = self.timing.recv_state_delay();

        self.replenish_short_buffers(cx)?;

        let req = self.new_request(kind, args)?;
        let len = req.length();
        let id = RequestId(self.requests.insert(req));
        self.stats.recvs += 1;

        tracing::debug!(node = self.node, %id, len, "recv");
        cx.schedule(self.timing.rx_post_delay(len), StepKind::RecvPosted(id));

        Ok(())
    }

    /// Pins a long buffer before matching.
    pub(super) fn recv_posted(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        let len = self.request_mut(id)?.length();
        if self.timing.is_short(len) {
            self.recv_search_unexpected(id, cx)
        } else {
            cx.schedule(self.timing.reg_region_delay(len), StepKind::RecvPinned(id));
            Ok(())
        }
    }

    /// Looks for an already arrived message.
    pub(super) fn recv_search_unexpected(
        &mut self,
        id: RequestId,
        cx: &mut Context<'_>,
    ) -> Result<(), EngineError> {
        let req = self
            .requests
            .get_mut(id.0)
            .ok_or(EngineError::UnknownRequest(id))?;
        let walk = search_unexpected(&mut self.unexpected, &req.hdr, req.ignore);

        if let Some(msg) = walk.found {
            req.set_state(RequestState::Matching);
            self.stats.sample_unexpected(self.unexpected.len());
            self.delivery = Some(Delivery {
                req: id,
                msg,
                origin: Origin::Recv,
            });
        }
        cx.schedule(
            self.timing.match_delay(walk.examined),
            StepKind::RecvWalked(id),
        );

        Ok(())
    }

    /// Delivers the message found in the unexpected queue, or parks the
    /// receive on the posted queue.
    pub(super) fn recv_walked(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        match &self.delivery {
            Some(d) if d.req == id => {
                let len = d.msg.hdr().length();
                cx.schedule(self.timing.rx_delay(len), StepKind::DeliverRx);

                Ok(())
            }
            _ => {
                self.request_mut(id)?.set_state(RequestState::Posted);
                self.posted.push_back(id);
                self.stats.sample_posted(self.posted.len());
                tracing::trace!(node = self.node, %id, posted = self.posted.len(), "recv posted");

                self.recv_exit(id, cx)
            }
        }
    }

    /// Returns to the caller once the receive has been matched or posted.
    pub(super) fn recv_exit(&mut self, id: RequestId, cx: &mut Context<'_>) -> Result<(), EngineError> {
        if self.request_mut(id)?.kind().is_blocking() {
            self.enter_wait(WaitSet::one(id), cx)
        } else {
            self.exit(CallReturn::Posted(id), Duration::ZERO, cx);
            Ok(())
        }
    }
}
