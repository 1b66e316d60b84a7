//! # Component Storage & Registry
//!
//! A component is a fixed-size record type. The registry owns one
//! [`ComponentStore`] per registered component and hands out
//! [`ComponentId`]s in registration order.
//!
//! ## Locking
//!
//! Each store sits behind its own `RwLock`. Readers (system iteration) take
//! shared guards for the span of one invocation; writers (staging flushes)
//! take the exclusive guard only while applying their batch. The registry's
//! outer lock protects the store table itself and is held just long enough
//! to clone out an `Arc`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bytes::ByteMap;
use crate::error::{StoreError, StoreResult};

/// Identifier of a registered component type, assigned in registration
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ComponentId(pub u64);

impl ComponentId {
    /// The id as a table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What to do when a component is added to an entity that already has it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddPolicy {
    /// Overwrite the existing record and log a warning.
    #[default]
    Overwrite,
    /// Fail with [`StoreError::DuplicateComponent`].
    Strict,
}

/// Dense storage for one component type: entity id -> raw record.
#[derive(Debug)]
pub struct ComponentStore {
    id: ComponentId,
    cells: ByteMap,
}

impl ComponentStore {
    fn new(id: ComponentId, data_size: usize) -> Self {
        Self {
            id,
            cells: ByteMap::new(data_size),
        }
    }

    /// The component this store belongs to.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    /// Declared record size in bytes.
    #[inline]
    #[must_use]
    pub const fn data_size(&self) -> usize {
        self.cells.record_size()
    }

    /// Number of entities holding this component.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if no entity holds this component.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns `true` if `entity` holds this component.
    #[inline]
    #[must_use]
    pub fn contains(&self, entity: u64) -> bool {
        self.cells.contains(entity)
    }

    /// Borrows the record for `entity`.
    #[inline]
    #[must_use]
    pub fn get(&self, entity: u64) -> Option<&[u8]> {
        self.cells.get(entity)
    }

    /// Mutably borrows the record for `entity`.
    #[inline]
    pub fn get_mut(&mut self, entity: u64) -> Option<&mut [u8]> {
        self.cells.get_mut(entity)
    }

    /// Entity stored at dense slot `slot`.
    #[inline]
    #[must_use]
    pub fn entity_at(&self, slot: usize) -> Option<u64> {
        self.cells.key_at(slot)
    }

    /// Record stored at dense slot `slot`.
    #[inline]
    #[must_use]
    pub fn record_at(&self, slot: usize) -> Option<&[u8]> {
        self.cells.record_at(slot)
    }

    /// Copies `record` in for `entity`, honoring `policy` when the entity
    /// already has one.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecordSize`] on a wrong-length record;
    /// [`StoreError::DuplicateComponent`] under [`AddPolicy::Strict`].
    pub fn insert(&mut self, entity: u64, record: &[u8], policy: AddPolicy) -> StoreResult<()> {
        if self.cells.contains(entity) {
            match policy {
                AddPolicy::Overwrite => {
                    tracing::warn!(
                        entity,
                        component = self.id.0,
                        "component added twice; overwriting existing record"
                    );
                }
                AddPolicy::Strict => {
                    return Err(StoreError::DuplicateComponent {
                        entity,
                        component: self.id,
                    });
                }
            }
        }
        self.cells.insert(entity, record)
    }

    /// Removes the record for `entity`. Idempotent; returns whether a
    /// record existed.
    pub fn erase(&mut self, entity: u64) -> bool {
        self.cells.erase(entity)
    }

    /// Iterates `(entity, record)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.cells.iter()
    }
}

/// Shared handle to one component's store.
pub type SharedStore = Arc<RwLock<ComponentStore>>;

/// Owns every component store and assigns component ids.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    policy: AddPolicy,
    stores: RwLock<Vec<SharedStore>>,
}

impl ComponentRegistry {
    /// Creates an empty registry with the default (overwrite) add policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry with an explicit add policy.
    #[must_use]
    pub fn with_policy(policy: AddPolicy) -> Self {
        Self {
            policy,
            stores: RwLock::new(Vec::new()),
        }
    }

    /// The registry's add policy.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> AddPolicy {
        self.policy
    }

    /// Number of registered components.
    #[must_use]
    pub fn count(&self) -> usize {
        self.stores.read().len()
    }

    /// Registers a new component of `data_size`-byte records.
    ///
    /// # Errors
    ///
    /// [`StoreError::AttrIncomplete`] if `data_size` is zero.
    pub fn create(&self, data_size: usize) -> StoreResult<ComponentId> {
        if data_size == 0 {
            return Err(StoreError::AttrIncomplete("data_size"));
        }
        let mut stores = self.stores.write();
        let id = ComponentId(stores.len() as u64);
        stores.push(Arc::new(RwLock::new(ComponentStore::new(id, data_size))));
        Ok(id)
    }

    /// Clones out the shared handle for `component`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownComponent`] for unregistered ids.
    pub fn store(&self, component: ComponentId) -> StoreResult<SharedStore> {
        self.stores
            .read()
            .get(component.index())
            .cloned()
            .ok_or(StoreError::UnknownComponent(component))
    }

    /// Copies `record` into `component`'s store for `entity`.
    ///
    /// # Errors
    ///
    /// Unknown component, wrong record size, or (strict policy) duplicate
    /// add.
    pub fn add(&self, entity: u64, component: ComponentId, record: &[u8]) -> StoreResult<()> {
        let store = self.store(component)?;
        let mut guard = store.write();
        guard.insert(entity, record, self.policy)
    }

    /// Removes `component` from `entity`. Idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownComponent`] for unregistered ids.
    pub fn remove(&self, entity: u64, component: ComponentId) -> StoreResult<bool> {
        let store = self.store(component)?;
        let removed = store.write().erase(entity);
        Ok(removed)
    }

    /// Returns `true` if `entity` holds `component`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownComponent`] for unregistered ids.
    pub fn contains(&self, entity: u64, component: ComponentId) -> StoreResult<bool> {
        let store = self.store(component)?;
        let present = store.read().contains(entity);
        Ok(present)
    }

    /// Copies out the record for `(entity, component)`, if present.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownComponent`] for unregistered ids.
    pub fn find(&self, entity: u64, component: ComponentId) -> StoreResult<Option<Vec<u8>>> {
        let store = self.store(component)?;
        let guard = store.read();
        Ok(guard.get(entity).map(<[u8]>::to_vec))
    }

    /// Runs `f` over the record for `(entity, component)` without copying.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownComponent`] for unregistered ids.
    pub fn with_record<R>(
        &self,
        entity: u64,
        component: ComponentId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> StoreResult<Option<R>> {
        let store = self.store(component)?;
        let guard = store.read();
        Ok(guard.get(entity).map(f))
    }

    /// Removes `entity`'s record from every store that has one.
    pub fn remove_all(&self, entity: u64) {
        let stores = self.stores.read();
        for store in stores.iter() {
            store.write().erase(entity);
        }
    }
}
