//! # Entity Registry
//!
//! Allocates entity ids and tracks which components each entity holds.
//!
//! Creation and destruction are two-phase: the request is recorded
//! immediately, the structural change lands at the next scheduler boundary.
//! That is what keeps iteration safe: a system can request a destroy while
//! walking the very storage the entity lives in, and the dense order it is
//! iterating does not move under it.
//!
//! Ids are monotonic and never recycled within a run.

use bytemuck::{Pod, Zeroable};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_core::{ComponentId, ComponentRegistry, SparseMap, SparseSet};

use crate::error::{RuntimeError, RuntimeResult};

/// Identifier of an entity. 64-bit, monotonically assigned, never reused
/// within one universe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// The raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Requested contents of a new entity: `(component, initial record)` pairs.
#[derive(Clone, Debug, Default)]
pub struct EntityAttr {
    /// Components to attach at creation, with their initial records.
    pub components: Vec<(ComponentId, Vec<u8>)>,
}

impl EntityAttr {
    /// Creates an empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component with its initial record bytes.
    #[must_use]
    pub fn with_component(mut self, component: ComponentId, record: &[u8]) -> Self {
        self.components.push((component, record.to_vec()));
        self
    }
}

/// A lifecycle transition ready to be published on the built-in events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LifecycleEmit {
    /// The entity became live this boundary.
    Created(EntityId),
    /// The entity was torn down this boundary.
    Destroyed(EntityId),
}

struct PendingCreate {
    id: EntityId,
    components: Vec<(ComponentId, Box<[u8]>)>,
}

/// Allocates entities and orchestrates their staged lifecycle.
pub struct EntityRegistry {
    next_id: AtomicU64,
    /// Live entities; value is the set of component ids each holds.
    live: RwLock<SparseMap<SparseSet>>,
    /// Entities with a destroy staged for the next boundary.
    doomed: RwLock<SparseSet>,
    pending_create: Mutex<Vec<PendingCreate>>,
    pending_destroy: Mutex<Vec<EntityId>>,
    /// Serializes destroy requests so staging and the doomed set stay
    /// consistent per entity.
    destroy_mu: Mutex<()>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            live: RwLock::new(SparseMap::new()),
            doomed: RwLock::new(SparseSet::new()),
            pending_create: Mutex::new(Vec::new()),
            pending_destroy: Mutex::new(Vec::new()),
            destroy_mu: Mutex::new(()),
        }
    }
}

impl EntityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Returns `true` if `entity` is live (created and not yet torn down).
    #[must_use]
    pub fn is_live(&self, entity: EntityId) -> bool {
        self.live.read().contains(entity.0)
    }

    /// The component ids `entity` currently holds, in dense order.
    #[must_use]
    pub fn components_of(&self, entity: EntityId) -> Option<Vec<ComponentId>> {
        self.live
            .read()
            .get(entity.0)
            .map(|set| set.iter().map(ComponentId).collect())
    }

    /// Allocates an id and stages the entity for creation at the next
    /// scheduler boundary. The id is valid immediately; the components (and
    /// the `CreateEntityEvent`) land at the boundary.
    ///
    /// The attr's components are validated against `components` up front so
    /// a bad request fails here rather than half-applying later.
    ///
    /// # Errors
    ///
    /// `AttrIncomplete` for an empty component list; `UnknownComponent` or
    /// `RecordSize` for a bad `(component, record)` pair.
    pub fn create(
        &self,
        components: &ComponentRegistry,
        attr: &EntityAttr,
    ) -> RuntimeResult<EntityId> {
        if attr.components.is_empty() {
            return Err(RuntimeError::AttrIncomplete("component_list"));
        }
        let mut staged = Vec::with_capacity(attr.components.len());
        for (component, record) in &attr.components {
            let store = components.store(*component)?;
            let expected = store.read().data_size();
            if record.len() != expected {
                return Err(tessera_core::StoreError::RecordSize {
                    expected,
                    got: record.len(),
                }
                .into());
            }
            staged.push((*component, record.clone().into_boxed_slice()));
        }

        let id = EntityId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pending_create.lock().push(PendingCreate {
            id,
            components: staged,
        });
        Ok(id)
    }

    /// Stages `entity` for destruction at the next scheduler boundary.
    /// Idempotent for an already-doomed entity.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the id was never allocated.
    pub fn destroy(&self, entity: EntityId) -> RuntimeResult<()> {
        let _serial = self.destroy_mu.lock();
        if entity.0 >= self.next_id.load(Ordering::Relaxed) {
            return Err(RuntimeError::UnknownEntity(entity));
        }
        if self.doomed.read().contains(entity.0) {
            return Ok(());
        }
        if !self.live.read().contains(entity.0) {
            // Not live: either still pending creation (fine, the destroy
            // lands after the create) or already torn down.
            let pending = self
                .pending_create
                .lock()
                .iter()
                .any(|create| create.id == entity);
            if !pending {
                return Err(RuntimeError::UnknownEntity(entity));
            }
        }
        self.doomed.write().insert(entity.0);
        self.pending_destroy.lock().push(entity);
        Ok(())
    }

    /// Attaches `component` to a live `entity`, copying `record` into its
    /// store. This is the immediate form used by the staging flush.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` for dead entities; storage errors pass through.
    pub fn add_component(
        &self,
        components: &ComponentRegistry,
        entity: EntityId,
        component: ComponentId,
        record: &[u8],
    ) -> RuntimeResult<()> {
        let mut live = self.live.write();
        let Some(membership) = live.get_mut(entity.0) else {
            return Err(RuntimeError::UnknownEntity(entity));
        };
        components.add(entity.0, component, record)?;
        membership.insert(component.0);
        Ok(())
    }

    /// Detaches `component` from a live `entity`. Idempotent on the
    /// component.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` for dead entities; `UnknownComponent` passes
    /// through.
    pub fn remove_component(
        &self,
        components: &ComponentRegistry,
        entity: EntityId,
        component: ComponentId,
    ) -> RuntimeResult<()> {
        let mut live = self.live.write();
        let Some(membership) = live.get_mut(entity.0) else {
            return Err(RuntimeError::UnknownEntity(entity));
        };
        components.remove(entity.0, component)?;
        membership.remove(component.0);
        Ok(())
    }

    /// Applies every staged create and destroy, in request order, creates
    /// first. Returns the lifecycle transitions to publish, in the order
    /// they were applied.
    ///
    /// Destruction removes the entity's components before freeing the row;
    /// the id is never returned to the allocator.
    pub(crate) fn flush_lifecycle(&self, components: &ComponentRegistry) -> Vec<LifecycleEmit> {
        let creates = std::mem::take(&mut *self.pending_create.lock());
        let destroys = std::mem::take(&mut *self.pending_destroy.lock());
        let mut emits = Vec::with_capacity(creates.len() + destroys.len());

        for pending in creates {
            {
                let mut live = self.live.write();
                live.insert(pending.id.0, SparseSet::new());
            }
            for (component, record) in pending.components {
                if let Err(err) =
                    self.add_component(components, pending.id, component, &record)
                {
                    tracing::warn!(
                        entity = pending.id.0,
                        component = component.0,
                        %err,
                        "dropping staged component add"
                    );
                }
            }
            emits.push(LifecycleEmit::Created(pending.id));
        }

        for entity in destroys {
            emits.push(LifecycleEmit::Destroyed(entity));
            let membership = {
                let mut live = self.live.write();
                live.remove(entity.0)
            };
            if let Some(membership) = membership {
                for component in membership.iter() {
                    if let Err(err) = components.remove(entity.0, ComponentId(component)) {
                        tracing::warn!(entity = entity.0, component, %err, "destroy sweep");
                    }
                }
            }
            self.doomed.write().remove(entity.0);
        }

        emits
    }
}
