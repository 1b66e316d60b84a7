//! # Runtime Error Types
//!
//! Every recoverable failure the runtime surfaces to callers. Storage-level
//! failures from `tessera_core` are wrapped transparently, so `?` works
//! across the crate boundary.

use thiserror::Error;

use tessera_core::StoreError;

use crate::entity::EntityId;
use crate::event::EventId;
use crate::program::ProgramId;
use crate::system::SystemId;

/// Errors surfaced by the Tessera runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A program id was never created.
    #[error("unknown program: {0:?}")]
    UnknownProgram(ProgramId),

    /// An entity id was never allocated or is already freed.
    #[error("unknown entity: {0:?}")]
    UnknownEntity(EntityId),

    /// An event id was never created.
    #[error("unknown event: {0:?}")]
    UnknownEvent(EventId),

    /// A system id was never created, or it belongs to a different program
    /// than the event it was subscribed to.
    #[error("unknown system: {0:?}")]
    UnknownSystem(SystemId),

    /// A required attribute field was missing.
    #[error("attribute incomplete: {0}")]
    AttrIncomplete(&'static str),

    /// A cross join would produce more tuples than the configured ceiling.
    #[error("cross join over {expected} tuples exceeds ceiling of {ceiling}")]
    InvalidJoin {
        /// Expected tuple count of the product.
        expected: u64,
        /// The configured refusal threshold.
        ceiling: u64,
    },

    /// A buffered send found the event's ring at capacity. Non-fatal; the
    /// caller chooses whether to retry or drop.
    #[error("event queue full: {0:?}")]
    EventQueueFull(EventId),

    /// A synchronous send re-entered an event already being dispatched on
    /// this thread.
    #[error("reentrant synchronous send on event {0:?}")]
    ReentrantSend(EventId),

    /// A message payload did not match the event's declared size.
    #[error("message size mismatch: expected {expected} bytes, got {got}")]
    MessageSize {
        /// The event's declared `message_size`.
        expected: usize,
        /// Length of the payload the caller provided.
        got: usize,
    },

    /// The universe is not in the `Running` state.
    #[error("universe is not running")]
    NotRunning,

    /// A storage-level failure (unknown component, duplicate add under the
    /// strict policy, record size mismatch).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
