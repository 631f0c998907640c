use std::error::Error;
use std::fmt;

use crate::config::ConfigError;
use crate::heap::HeapError;
use crate::nic::NodeId;
use crate::request::{Communicator, RankId, RequestId, RequestState};

/// A protocol-usage or resource error detected by the engine.
///
/// None of these errors is recoverable: they denote a modeling bug or a
/// miscomputed resource size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Heap allocation or release failed.
    Heap(HeapError),
    /// Invalid configuration.
    Config(ConfigError),
    /// The groups do not include the world communicator.
    NoWorld,
    /// A call other than `Init` was made before initialization.
    NotInitialized,
    /// `Init` was called twice.
    AlreadyInitialized,
    /// A call was made before the previous one returned.
    CallInProgress,
    /// The request does not exist.
    UnknownRequest(RequestId),
    /// The communicator does not exist.
    UnknownCommunicator(Communicator),
    /// The rank does not belong to the communicator.
    UnknownRank {
        /// Communicator.
        group: Communicator,
        /// Rank.
        rank: RankId,
    },
    /// The message element count does not fit in a header.
    MessageTooLong(usize),
    /// The buffer length is not a whole number of elements.
    PartialElement {
        /// Buffer length in bytes.
        len: usize,
        /// Element size.
        dtype_size: u32,
    },
    /// A request was found in a state that cannot receive the event.
    InvalidState {
        /// Request.
        req: RequestId,
        /// Its current state.
        state: RequestState,
    },
    /// A continuation ran with no context or slot to act upon.
    InvalidStep(&'static str),
    /// A notification carried a completion key that cannot occur for it.
    InvalidCompletion(&'static str),
    /// A notification carried an unexpected NIC tag.
    InvalidTag(u32),
    /// A second context tried to claim the queues.
    ContextBusy,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(e) => fmt::Display::fmt(e, f),
            Self::Config(e) => fmt::Display::fmt(e, f),
            Self::NoWorld => f.write_str("the world communicator is missing"),
            Self::NotInitialized => f.write_str("the engine was not initialized"),
            Self::AlreadyInitialized => f.write_str("the engine was already initialized"),
            Self::CallInProgress => {
                f.write_str("a call was issued before the previous call returned")
            }
            Self::UnknownRequest(req) => write!(f, "unknown request {}", req),
            Self::UnknownCommunicator(c) => write!(f, "unknown communicator {}", c),
            Self::UnknownRank { group, rank } => {
                write!(f, "rank {} is not a member of communicator {}", rank, group)
            }
            Self::MessageTooLong(len) => write!(f, "a {} bytes message is too long", len),
            Self::PartialElement { len, dtype_size } => write!(
                f,
                "a {} bytes buffer does not hold a whole number of {} bytes elements",
                len, dtype_size
            ),
            Self::InvalidState { req, state } => {
                write!(f, "request {} cannot be in state {:?} here", req, state)
            }
            Self::InvalidStep(what) => write!(f, "invalid continuation: {}", what),
            Self::InvalidCompletion(what) => write!(f, "invalid completion key: {}", what),
            Self::InvalidTag(tag) => write!(f, "unexpected NIC tag {:#x}", tag),
            Self::ContextBusy => f.write_str("the queues are already being processed"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Heap(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HeapError> for EngineError {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// A fatal engine error with the diagnostic needed to locate it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalError {
    /// Node of the failing engine.
    pub node: NodeId,
    /// World rank of the failing engine.
    pub rank: RankId,
    /// Call, step or notification being processed.
    pub event: String,
    /// Summary of the engine queues and contexts.
    pub state: String,
    /// Underlying error.
    pub error: EngineError,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} (rank {}): {} while processing {} [{}]",
            self.node, self.rank, self.error, self.event, self.state
        )
    }
}

impl Error for FatalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}
