//! # Tessera Runtime
//!
//! The engine runtime: entity lifecycle, the join engine, the system
//! scheduler, and the program/event runtime, built on the storage layer in
//! `tessera_core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         UNIVERSE                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Component   │  │   Entity     │  │   Program    │      │
//! │  │  Registry    │  │   Registry   │  │   Table      │      │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘      │
//! │         │                 │                 │               │
//! │         └────────┬────────┴────────┬────────┘               │
//! │                  │                 │                        │
//! │           ┌──────▼──────┐   ┌──────▼──────┐                │
//! │           │ Join Engine │   │ Event Bus   │                │
//! │           │ (tuples)    │   │ (MPSC ring) │                │
//! │           └─────────────┘   └─────────────┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading Model
//!
//! - Within one program, systems run sequentially on one thread, so no locks
//!   inside a transform
//! - Attached programs advance under [`Universe::tick`]; detached programs
//!   get a dedicated worker thread
//! - Programs talk to each other through buffered events only, never
//!   shared mutable state
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_runtime::{ComponentAttr, EntityAttr, SystemAttr, Universe};
//!
//! let universe = Universe::new();
//! let position = universe.component_create(ComponentAttr::new(12))?;
//! let player = universe.entity_create(
//!     &EntityAttr::new().with_component(position, bytemuck::bytes_of(&spawn)),
//! )?;
//! universe.system_create(
//!     SystemAttr::new()
//!         .with_source(position)
//!         .with_sink(position)
//!         .with_transform(|tuple, frame| { /* integrate */ }),
//! )?;
//! universe.start()?;
//! universe.tick()?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod entity;
pub mod error;
pub mod event;
pub mod join;
pub mod program;
pub mod system;
pub mod universe;

pub use entity::{EntityAttr, EntityId};
pub use error::{RuntimeError, RuntimeResult};
pub use event::{Channel, EventAttr, EventId};
pub use join::{Instance, Join};
pub use program::ProgramId;
pub use system::{Frame, StageBuffer, SystemAttr, SystemId, Trigger};
pub use universe::{ComponentAttr, Universe, UniverseConfig};

// The storage layer's public vocabulary, re-exported for embedders.
pub use tessera_core::{AddPolicy, ComponentId, StoreError};
