//! # Storage Error Types
//!
//! Failures surfaced by the data layer. The runtime crate wraps these in
//! its own error enum.

use thiserror::Error;

use crate::component::ComponentId;

/// Errors from component storage and the component registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A component id was never registered or is out of range.
    #[error("unknown component: {0:?}")]
    UnknownComponent(ComponentId),

    /// Strict add policy: the entity already has this component.
    #[error("entity {entity} already has component {component:?}")]
    DuplicateComponent {
        /// Entity that already holds the record.
        entity: u64,
        /// Component that was added twice.
        component: ComponentId,
    },

    /// A record buffer did not match the component's declared size.
    #[error("record size mismatch: expected {expected} bytes, got {got}")]
    RecordSize {
        /// The component's declared `data_size`.
        expected: usize,
        /// Length of the buffer the caller provided.
        got: usize,
    },

    /// A required attribute field was missing or zero.
    #[error("component attribute incomplete: {0}")]
    AttrIncomplete(&'static str),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
