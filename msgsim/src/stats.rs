//! Engine statistics.

/// Counters maintained by an engine and reported by
/// [`Engine::finish`](crate::engine::Engine::finish).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Send calls.
    pub sends: u64,
    /// Sends that used the eager protocol.
    pub eager_sends: u64,
    /// Sends that used the rendezvous protocol.
    pub rendezvous_sends: u64,
    /// Sends to a co-located rank.
    pub loopback_sends: u64,
    /// Receive calls.
    pub recvs: u64,
    /// Messages matched to a receive.
    pub matched: u64,
    /// Messages parked on the unexpected queue.
    pub unexpected: u64,
    /// Requests cancelled.
    pub cancelled: u64,
    /// Current posted-receive queue depth.
    pub posted_depth: usize,
    /// Largest posted-receive queue depth.
    pub max_posted_depth: usize,
    /// Current unexpected queue depth.
    pub unexpected_depth: usize,
    /// Largest unexpected queue depth.
    pub max_unexpected_depth: usize,
    /// Short buffers posted to the NIC.
    pub short_buffers_posted: u64,
    /// Short buffers posted in answer to `NeedRecv`.
    pub need_recv_buffers: u64,
    /// Interrupt contexts run.
    pub interrupts: u64,
    /// Interrupts deferred because a context was busy.
    pub missed_interrupts: u64,
    /// Deferred interrupts replayed.
    pub replayed_interrupts: u64,
}

impl EngineStats {
    pub(crate) fn sample_posted(&mut self, depth: usize) {
        self.posted_depth = depth;
        self.max_posted_depth = self.max_posted_depth.max(depth);
    }

    pub(crate) fn sample_unexpected(&mut self, depth: usize) {
        self.unexpected_depth = depth;
        self.max_unexpected_depth = self.max_unexpected_depth.max(depth);
    }
}
