//! Latency model of the message engine.
//!
//! Every cost the engine charges is derived from [`MsgTiming`], which
//! combines a handful of pluggable per-length latency functions with fixed
//! constants. Latency functions implement [`LatencyModel`]; the serializable
//! [`LatencyMod`] covers the usual shapes (fixed, linear, piecewise linear)
//! and custom models can be installed with the `set_*` methods.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::{from_ns, from_ps};

/// Page size used by the region registration cost model.
pub const PAGE_SIZE: usize = 4096;

/// A latency as a function of a message length.
pub trait LatencyModel: fmt::Debug {
    /// Returns the latency in nanoseconds for a transfer of `bytes`.
    fn latency_ns(&self, bytes: usize) -> u64;
}

/// One segment of a [`LatencyMod::Range`] function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStep {
    /// Smallest length to which this segment applies.
    pub from_bytes: usize,
    /// Fixed part of the latency.
    pub base_ns: u64,
    /// Per-byte part of the latency, in picoseconds.
    pub ps_per_byte: u64,
}

/// A configurable latency function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatencyMod {
    /// Constant latency.
    Fixed {
        /// Latency in nanoseconds.
        ns: u64,
    },
    /// `base_ns + bytes * ps_per_byte / 1000`.
    Linear {
        /// Fixed part of the latency.
        base_ns: u64,
        /// Per-byte part of the latency, in picoseconds.
        ps_per_byte: u64,
    },
    /// Piecewise linear function; the last segment whose `from_bytes` does
    /// not exceed the length applies, and lengths below the first segment
    /// cost nothing.
    Range {
        /// Segments, in increasing `from_bytes` order.
        steps: Vec<LatencyStep>,
    },
}

impl LatencyMod {
    /// A function that always returns zero.
    pub const fn zero() -> Self {
        Self::Fixed { ns: 0 }
    }
}

impl Default for LatencyMod {
    fn default() -> Self {
        Self::zero()
    }
}

impl LatencyModel for LatencyMod {
    fn latency_ns(&self, bytes: usize) -> u64 {
        match self {
            Self::Fixed { ns } => *ns,
            Self::Linear {
                base_ns,
                ps_per_byte,
            } => base_ns + bytes as u64 * ps_per_byte / 1000,
            Self::Range { steps } => steps
                .iter()
                .take_while(|s| s.from_bytes <= bytes)
                .last()
                .map_or(0, |s| s.base_ns + bytes as u64 * s.ps_per_byte / 1000),
        }
    }
}

/// Serializable description of the engine latencies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Transmit setup cost, charged when a send enters the engine.
    pub tx_setup: LatencyMod,
    /// Receive setup cost, charged before a matched message is delivered.
    pub rx_setup: LatencyMod,
    /// Cost of posting a receive, if any.
    pub rx_post: Option<LatencyMod>,
    /// Host-to-NIC copy cost.
    pub tx_memcpy: LatencyMod,
    /// NIC-to-host copy cost.
    pub rx_memcpy: LatencyMod,
    /// Send completion cost, paid by the waiter.
    pub tx_fini: LatencyMod,
    /// Receive completion cost, paid by the waiter.
    pub rx_fini: LatencyMod,
    /// Cost of examining one queue entry while matching.
    pub match_delay_ns: u64,
    /// Fixed cost of registering (pinning) a non-empty region.
    pub reg_region_base_ns: u64,
    /// Per-page registration cost above the crossover length.
    pub reg_region_per_page_ns: u64,
    /// Length above which registration is also charged per page.
    pub reg_region_xover_length: usize,
    /// Exit delay of send calls, in picoseconds.
    pub send_state_delay_ps: u64,
    /// Exit delay of receive calls, in picoseconds.
    pub recv_state_delay_ps: u64,
    /// Exit delay of wait-all calls, in picoseconds.
    pub waitall_state_delay_ps: u64,
    /// Exit delay of wait-any calls, in picoseconds.
    pub waitany_state_delay_ps: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tx_setup: LatencyMod::Fixed { ns: 100 },
            rx_setup: LatencyMod::Fixed { ns: 100 },
            rx_post: None,
            tx_memcpy: LatencyMod::Linear {
                base_ns: 0,
                ps_per_byte: 100,
            },
            rx_memcpy: LatencyMod::Linear {
                base_ns: 0,
                ps_per_byte: 100,
            },
            tx_fini: LatencyMod::zero(),
            rx_fini: LatencyMod::zero(),
            match_delay_ns: 1,
            reg_region_base_ns: 0,
            reg_region_per_page_ns: 0,
            reg_region_xover_length: PAGE_SIZE,
            send_state_delay_ps: 0,
            recv_state_delay_ps: 0,
            waitall_state_delay_ps: 0,
            waitany_state_delay_ps: 0,
        }
    }
}

/// Engine latency model.
#[derive(Debug)]
pub struct MsgTiming {
    short_msg_length: usize,
    send_ack_delay: Duration,
    tx_setup: Box<dyn LatencyModel>,
    rx_setup: Box<dyn LatencyModel>,
    rx_post: Option<Box<dyn LatencyModel>>,
    tx_memcpy: Box<dyn LatencyModel>,
    rx_memcpy: Box<dyn LatencyModel>,
    tx_fini: Box<dyn LatencyModel>,
    rx_fini: Box<dyn LatencyModel>,
    match_delay_ns: u64,
    reg_region_base_ns: u64,
    reg_region_per_page_ns: u64,
    reg_region_xover_length: usize,
    send_state_delay: Duration,
    recv_state_delay: Duration,
    waitall_state_delay: Duration,
    waitany_state_delay: Duration,
}

impl MsgTiming {
    /// Builds the model from its serializable description.
    pub fn new(short_msg_length: usize, send_ack_delay_ns: u64, config: &TimingConfig) -> Self {
        fn boxed(m: &LatencyMod) -> Box<dyn LatencyModel> {
            Box::new(m.clone())
        }

        Self {
            short_msg_length,
            send_ack_delay: from_ns(send_ack_delay_ns),
            tx_setup: boxed(&config.tx_setup),
            rx_setup: boxed(&config.rx_setup),
            rx_post: config.rx_post.as_ref().map(boxed),
            tx_memcpy: boxed(&config.tx_memcpy),
            rx_memcpy: boxed(&config.rx_memcpy),
            tx_fini: boxed(&config.tx_fini),
            rx_fini: boxed(&config.rx_fini),
            match_delay_ns: config.match_delay_ns,
            reg_region_base_ns: config.reg_region_base_ns,
            reg_region_per_page_ns: config.reg_region_per_page_ns,
            reg_region_xover_length: config.reg_region_xover_length,
            send_state_delay: from_ps(config.send_state_delay_ps),
            recv_state_delay: from_ps(config.recv_state_delay_ps),
            waitall_state_delay: from_ps(config.waitall_state_delay_ps),
            waitany_state_delay: from_ps(config.waitany_state_delay_ps),
        }
    }

    /// Replaces the transmit setup function.
    pub fn set_tx_setup(&mut self, model: impl LatencyModel + 'static) {
        self.tx_setup = Box::new(model);
    }

    /// Replaces the receive setup function.
    pub fn set_rx_setup(&mut self, model: impl LatencyModel + 'static) {
        self.rx_setup = Box::new(model);
    }

    /// Replaces the receive post function.
    pub fn set_rx_post(&mut self, model: impl LatencyModel + 'static) {
        self.rx_post = Some(Box::new(model));
    }

    /// Replaces the host-to-NIC copy function.
    pub fn set_tx_memcpy(&mut self, model: impl LatencyModel + 'static) {
        self.tx_memcpy = Box::new(model);
    }

    /// Replaces the NIC-to-host copy function.
    pub fn set_rx_memcpy(&mut self, model: impl LatencyModel + 'static) {
        self.rx_memcpy = Box::new(model);
    }

    /// Replaces the send completion function.
    pub fn set_tx_fini(&mut self, model: impl LatencyModel + 'static) {
        self.tx_fini = Box::new(model);
    }

    /// Replaces the receive completion function.
    pub fn set_rx_fini(&mut self, model: impl LatencyModel + 'static) {
        self.rx_fini = Box::new(model);
    }

    /// Largest payload sent with the eager protocol.
    pub fn short_msg_length(&self) -> usize {
        self.short_msg_length
    }

    /// Returns `true` if a message of `len` bytes uses the eager protocol.
    pub fn is_short(&self, len: usize) -> bool {
        len <= self.short_msg_length
    }

    /// Transmit setup cost.
    pub fn tx_delay(&self, len: usize) -> Duration {
        from_ns(self.tx_setup.latency_ns(len))
    }

    /// Receive setup cost.
    pub fn rx_delay(&self, len: usize) -> Duration {
        from_ns(self.rx_setup.latency_ns(len))
    }

    /// Receive post cost, zero if no post function is configured.
    pub fn rx_post_delay(&self, len: usize) -> Duration {
        self.rx_post
            .as_ref()
            .map_or(Duration::ZERO, |m| from_ns(m.latency_ns(len)))
    }

    /// Host-to-NIC copy cost.
    pub fn tx_memcpy_delay(&self, len: usize) -> Duration {
        from_ns(self.tx_memcpy.latency_ns(len))
    }

    /// NIC-to-host copy cost.
    pub fn rx_memcpy_delay(&self, len: usize) -> Duration {
        from_ns(self.rx_memcpy.latency_ns(len))
    }

    /// Cost of writing a header of `len` bytes.
    pub fn memwrite_delay(&self, len: usize) -> Duration {
        self.tx_memcpy_delay(len)
    }

    /// Cost of registering or unregistering a region of `len` bytes.
    pub fn reg_region_delay(&self, len: usize) -> Duration {
        let mut ns = 0;
        if len > 0 {
            ns += self.reg_region_base_ns;
        }
        if len > self.reg_region_xover_length {
            ns += (len / PAGE_SIZE) as u64 * self.reg_region_per_page_ns;
        }
        from_ns(ns)
    }

    /// Cost of a queue walk that examined `count` entries.
    pub fn match_delay(&self, count: usize) -> Duration {
        from_ns(count as u64 * self.match_delay_ns)
    }

    /// Send completion cost.
    pub fn send_fini_delay(&self, len: usize) -> Duration {
        from_ns(self.tx_fini.latency_ns(len))
    }

    /// Receive completion cost.
    pub fn recv_fini_delay(&self, len: usize) -> Duration {
        from_ns(self.rx_fini.latency_ns(len))
    }

    /// Delay before a rendezvous acknowledgement is sent.
    pub fn send_ack_delay(&self) -> Duration {
        self.send_ack_delay
    }

    /// Exit delay of send calls.
    pub fn send_state_delay(&self) -> Duration {
        self.send_state_delay
    }

    /// Exit delay of receive calls.
    pub fn recv_state_delay(&self) -> Duration {
        self.recv_state_delay
    }

    /// Exit delay of wait-all calls.
    pub fn waitall_state_delay(&self) -> Duration {
        self.waitall_state_delay
    }

    /// Exit delay of wait-any calls.
    pub fn waitany_state_delay(&self) -> Duration {
        self.waitany_state_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PerByte(u64);

    impl LatencyModel for PerByte {
        fn latency_ns(&self, bytes: usize) -> u64 {
            self.0 * bytes as u64
        }
    }

    #[test]
    fn latency_mod_shapes() {
        let linear = LatencyMod::Linear {
            base_ns: 10,
            ps_per_byte: 500,
        };
        assert_eq!(linear.latency_ns(0), 10);
        assert_eq!(linear.latency_ns(1000), 510);

        let range = LatencyMod::Range {
            steps: vec![
                LatencyStep {
                    from_bytes: 8,
                    base_ns: 100,
                    ps_per_byte: 0,
                },
                LatencyStep {
                    from_bytes: 4096,
                    base_ns: 200,
                    ps_per_byte: 1000,
                },
            ],
        };
        assert_eq!(range.latency_ns(4), 0);
        assert_eq!(range.latency_ns(8), 100);
        assert_eq!(range.latency_ns(4095), 100);
        assert_eq!(range.latency_ns(4096), 200 + 4096);
    }

    #[test]
    fn reg_region_cost() {
        let config = TimingConfig {
            reg_region_base_ns: 50,
            reg_region_per_page_ns: 10,
            ..TimingConfig::default()
        };
        let timing = MsgTiming::new(4096, 0, &config);

        assert_eq!(timing.reg_region_delay(0), Duration::ZERO);
        assert_eq!(timing.reg_region_delay(4096), from_ns(50));
        assert_eq!(timing.reg_region_delay(3 * 4096), from_ns(50 + 30));
    }

    #[test]
    fn match_and_threshold() {
        let timing = MsgTiming::new(4096, 0, &TimingConfig::default());

        assert_eq!(timing.match_delay(0), Duration::ZERO);
        assert_eq!(timing.match_delay(7), from_ns(7));
        assert_eq!(timing.short_msg_length(), 4096);
        assert!(timing.is_short(4096));
        assert!(!timing.is_short(4097));
    }

    #[test]
    fn custom_latency_model() {
        let mut timing = MsgTiming::new(64, 0, &TimingConfig::default());
        timing.set_tx_setup(PerByte(3));
        assert_eq!(timing.tx_delay(10), from_ns(30));
        assert_eq!(timing.rx_post_delay(10), Duration::ZERO);
        timing.set_rx_post(LatencyMod::Fixed { ns: 9 });
        assert_eq!(timing.rx_post_delay(10), from_ns(9));

        timing.set_tx_memcpy(PerByte(2));
        timing.set_rx_memcpy(LatencyMod::Fixed { ns: 11 });
        assert_eq!(timing.tx_memcpy_delay(10), from_ns(20));
        assert_eq!(timing.memwrite_delay(4), from_ns(8));
        assert_eq!(timing.rx_memcpy_delay(10), from_ns(11));
    }

    #[test]
    fn state_delays_are_in_picoseconds() {
        let config = TimingConfig {
            send_state_delay_ps: 2500,
            waitany_state_delay_ps: 999,
            ..TimingConfig::default()
        };
        let timing = MsgTiming::new(64, 0, &config);
        assert_eq!(timing.send_state_delay(), from_ns(2));
        assert_eq!(timing.waitany_state_delay(), Duration::ZERO);
    }
}
