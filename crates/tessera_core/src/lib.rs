//! # Tessera Core
//!
//! The data layer of the Tessera engine: sparse-set containers and
//! raw-record component storage.
//!
//! ## Architecture Rules
//!
//! 1. **Dense iteration** - Every container keeps its live records in one
//!    contiguous buffer; iteration never chases pointers
//! 2. **Stable addressing** - Entities are plain 64-bit keys; a sparse
//!    index maps them to dense slots, so handles survive any amount of
//!    churn elsewhere in the map
//! 3. **O(1) removal** - Erase swaps the victim with the last dense slot;
//!    nothing shifts
//!
//! This crate knows nothing about systems, events, or threads. The runtime
//! crate composes these containers into registries and schedulers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::ComponentRegistry;
//!
//! let registry = ComponentRegistry::new();
//! let position = registry.create(12)?; // 12-byte records
//! registry.add(entity, position, bytemuck::bytes_of(&pos))?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bytes;
pub mod component;
pub mod error;
pub mod sparse;

pub use bytes::ByteMap;
pub use component::{AddPolicy, ComponentId, ComponentRegistry, ComponentStore, SharedStore};
pub use error::{StoreError, StoreResult};
pub use sparse::{SparseMap, SparseSet};
