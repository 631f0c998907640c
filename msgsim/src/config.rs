//! Engine configuration.
//!
//! [`EngineConfig`] can be built in code, starting from
//! [`EngineConfig::default`], or decoded from a CBOR document with
//! [`EngineConfig::from_cbor`]. Missing fields take their default value.

use std::error::Error;
use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::heap::{align_up, SimAddr};
use crate::nic::VirtNet;
use crate::request::MatchHeader;
use crate::timing::TimingConfig;

/// Engine parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on short buffers posted in answer to `NeedRecv` notifications.
    pub max_unexpected_msg: usize,
    /// Cap on simultaneously posted short buffers.
    pub max_posted_short_buffers: usize,
    /// Short buffers posted at initialization.
    pub min_posted_short_buffers: usize,
    /// Largest payload sent with the eager protocol.
    pub short_msg_length: usize,
    /// Delay before a rendezvous acknowledgement is sent.
    pub send_ack_delay_ns: u64,
    /// Virtual network of rendezvous acknowledgements.
    pub ack_virtual_network: VirtNet,
    /// Virtual network of application headers and eager payloads.
    pub rendezvous_virtual_network: VirtNet,
    /// Number of consecutive node ids sharing one host.
    pub nics_per_node: u32,
    /// Start of the engine heap.
    pub heap_base: u64,
    /// Latency model.
    pub timing: TimingConfig,
}

impl EngineConfig {
    /// Decodes a configuration from a CBOR document.
    pub fn from_cbor<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self =
            ciborium::from_reader(reader).map_err(|e| ConfigError::Decode(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    /// Checks parameter consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_posted_short_buffers > self.max_posted_short_buffers {
            return Err(ConfigError::ShortBufferBounds {
                min: self.min_posted_short_buffers,
                max: self.max_posted_short_buffers,
            });
        }
        if self.nics_per_node == 0 {
            return Err(ConfigError::Invalid("nics_per_node must be at least 1"));
        }
        if self.short_msg_length == 0 {
            return Err(ConfigError::Invalid("short_msg_length must be non-zero"));
        }

        Ok(())
    }

    /// Start address of the heap.
    pub fn heap_start(&self) -> SimAddr {
        SimAddr::new(self.heap_base)
    }

    /// Heap size needed to back twice the maximum number of posted short
    /// buffers, header and payload regions included.
    pub fn heap_length(&self) -> usize {
        let hdr = align_up(MatchHeader::WIRE_SIZE + 16);
        let payload = align_up(self.short_msg_length + MatchHeader::WIRE_SIZE + 16);

        2 * self.max_posted_short_buffers * (hdr + payload)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_unexpected_msg: 32,
            max_posted_short_buffers: 512,
            min_posted_short_buffers: 5,
            short_msg_length: 4096,
            send_ack_delay_ns: 0,
            ack_virtual_network: 0,
            rendezvous_virtual_network: 0,
            nics_per_node: 1,
            heap_base: 0x1000,
            timing: TimingConfig::default(),
        }
    }
}

/// An invalid or undecodable configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The document could not be decoded.
    Decode(String),
    /// The minimum number of posted short buffers exceeds the maximum.
    ShortBufferBounds {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Another parameter is out of range.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "could not decode the configuration: {}", e),
            Self::ShortBufferBounds { min, max } => write!(
                f,
                "min_posted_short_buffers ({}) exceeds max_posted_short_buffers ({})",
                min, max
            ),
            Self::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl Error for ConfigError {}
