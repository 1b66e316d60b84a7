//! # Join Engine
//!
//! Binds a system's source components into one stream of instance tuples.
//!
//! ## Modes
//!
//! - **Inner**: walk the smallest source, probe the rest, emit only
//!   entities present in every source
//! - **Left**: walk the first source, probe the rest, absent records come
//!   through as `None`
//! - **Cross**: full Cartesian product, outermost = first source; refused
//!   when the expected tuple count exceeds the configured ceiling
//!
//! The stream is lazy: tuples are handed to the visitor one at a time,
//! nothing is materialized. It is also stable for the span of one system
//! invocation: mutations requested by the running system are staged, so
//! the dense order being walked cannot move.

use tessera_core::ComponentStore;

use crate::entity::EntityId;
use crate::error::{RuntimeError, RuntimeResult};

/// How a system's source components are bound into tuples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Join {
    /// Entities present in every source.
    #[default]
    Inner,
    /// Every entity of the first source; the rest optional.
    Left,
    /// Cartesian product of all sources.
    Cross,
}

/// One element of a join tuple: a component record bound to an entity for
/// the duration of a single system invocation.
#[derive(Clone, Copy, Debug)]
pub struct Instance<'a> {
    entity: EntityId,
    component: tessera_core::ComponentId,
    record: Option<&'a [u8]>,
}

impl<'a> Instance<'a> {
    /// The entity this record belongs to.
    #[inline]
    #[must_use]
    pub const fn entity(&self) -> EntityId {
        self.entity
    }

    /// The component this record came from.
    #[inline]
    #[must_use]
    pub const fn component(&self) -> tessera_core::ComponentId {
        self.component
    }

    /// The record bytes; `None` for an absent secondary in a left join.
    #[inline]
    #[must_use]
    pub const fn record(&self) -> Option<&'a [u8]> {
        self.record
    }

    /// Copies the record into `buf`. Returns `false` (and copies nothing)
    /// if the record is absent.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the record.
    pub fn read_into(&self, buf: &mut [u8]) -> bool {
        match self.record {
            Some(record) => {
                buf[..record.len()].copy_from_slice(record);
                true
            }
            None => false,
        }
    }
}

/// Streams the join of `sources` to `visit`, one tuple at a time.
///
/// `sources` are the read-locked stores of the system's source components,
/// in declaration order. Tuples are emitted in that same order regardless
/// of which source drives the iteration.
///
/// # Errors
///
/// `InvalidJoin` when a cross join's expected product exceeds `ceiling`.
pub(crate) fn for_each_tuple<'a>(
    sources: &[&'a ComponentStore],
    join: Join,
    ceiling: u64,
    mut visit: impl FnMut(&[Instance<'a>]),
) -> RuntimeResult<()> {
    if sources.is_empty() {
        return Ok(());
    }
    match join {
        Join::Inner => {
            inner_join(sources, &mut visit);
            Ok(())
        }
        Join::Left => {
            left_join(sources, &mut visit);
            Ok(())
        }
        Join::Cross => cross_join(sources, ceiling, &mut visit),
    }
}

fn inner_join<'a>(sources: &[&'a ComponentStore], visit: &mut impl FnMut(&[Instance<'a>])) {
    // Walk the smallest source; an empty one short-circuits the whole join.
    let driver = (0..sources.len())
        .min_by_key(|&i| sources[i].len())
        .expect("sources checked non-empty");
    if sources[driver].is_empty() {
        return;
    }

    let mut tuple = Vec::with_capacity(sources.len());
    for slot in 0..sources[driver].len() {
        let entity = sources[driver]
            .entity_at(slot)
            .expect("slot within dense bounds");
        tuple.clear();
        let mut complete = true;
        for source in sources {
            match source.get(entity) {
                Some(record) => tuple.push(Instance {
                    entity: EntityId(entity),
                    component: source.id(),
                    record: Some(record),
                }),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            visit(&tuple);
        }
    }
}

fn left_join<'a>(sources: &[&'a ComponentStore], visit: &mut impl FnMut(&[Instance<'a>])) {
    let primary = sources[0];
    let mut tuple = Vec::with_capacity(sources.len());
    for slot in 0..primary.len() {
        let entity = primary.entity_at(slot).expect("slot within dense bounds");
        tuple.clear();
        tuple.push(Instance {
            entity: EntityId(entity),
            component: primary.id(),
            record: primary.record_at(slot),
        });
        for source in &sources[1..] {
            tuple.push(Instance {
                entity: EntityId(entity),
                component: source.id(),
                record: source.get(entity),
            });
        }
        visit(&tuple);
    }
}

fn cross_join<'a>(
    sources: &[&'a ComponentStore],
    ceiling: u64,
    visit: &mut impl FnMut(&[Instance<'a>]),
) -> RuntimeResult<()> {
    let mut expected: u64 = 1;
    for source in sources {
        expected = expected.saturating_mul(source.len() as u64);
    }
    if expected > ceiling {
        return Err(RuntimeError::InvalidJoin { expected, ceiling });
    }
    if expected == 0 {
        return Ok(());
    }

    // Odometer over dense slots; the first source is the outermost digit.
    let mut slots = vec![0usize; sources.len()];
    let mut tuple = Vec::with_capacity(sources.len());
    loop {
        tuple.clear();
        for (source, &slot) in sources.iter().zip(slots.iter()) {
            let entity = source.entity_at(slot).expect("slot within dense bounds");
            tuple.push(Instance {
                entity: EntityId(entity),
                component: source.id(),
                record: source.record_at(slot),
            });
        }
        visit(&tuple);

        // Advance from the innermost digit.
        let mut digit = sources.len();
        loop {
            if digit == 0 {
                return Ok(());
            }
            digit -= 1;
            slots[digit] += 1;
            if slots[digit] < sources[digit].len() {
                break;
            }
            slots[digit] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ComponentRegistry;

    /// Builds two stores: `pos` on entities 0..3, `vel` on entities 0 and 2.
    fn two_stores() -> (ComponentRegistry, tessera_core::ComponentId, tessera_core::ComponentId)
    {
        let registry = ComponentRegistry::new();
        let pos = registry.create(1).unwrap();
        let vel = registry.create(1).unwrap();
        for entity in 0..3u64 {
            registry.add(entity, pos, &[entity as u8]).unwrap();
        }
        registry.add(0, vel, &[10]).unwrap();
        registry.add(2, vel, &[12]).unwrap();
        (registry, pos, vel)
    }

    #[test]
    fn test_inner_join_intersection() {
        let (registry, pos, vel) = two_stores();
        let pos_store = registry.store(pos).unwrap();
        let vel_store = registry.store(vel).unwrap();
        let pos_guard = pos_store.read();
        let vel_guard = vel_store.read();

        let mut seen = Vec::new();
        for_each_tuple(&[&pos_guard, &vel_guard], Join::Inner, 1024, |tuple| {
            assert_eq!(tuple.len(), 2);
            assert_eq!(tuple[0].component(), pos);
            assert_eq!(tuple[1].component(), vel);
            seen.push(tuple[0].entity().0);
        })
        .unwrap();

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2]);
    }

    #[test]
    fn test_inner_join_empty_source() {
        let registry = ComponentRegistry::new();
        let a = registry.create(1).unwrap();
        let b = registry.create(1).unwrap();
        registry.add(0, a, &[1]).unwrap();

        let a_store = registry.store(a).unwrap();
        let b_store = registry.store(b).unwrap();
        let a_guard = a_store.read();
        let b_guard = b_store.read();

        let mut count = 0;
        for_each_tuple(&[&a_guard, &b_guard], Join::Inner, 1024, |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_left_join_absent_secondaries() {
        let (registry, pos, vel) = two_stores();
        let pos_store = registry.store(pos).unwrap();
        let vel_store = registry.store(vel).unwrap();
        let pos_guard = pos_store.read();
        let vel_guard = vel_store.read();

        let mut rows = Vec::new();
        for_each_tuple(&[&pos_guard, &vel_guard], Join::Left, 1024, |tuple| {
            rows.push((tuple[0].entity().0, tuple[1].record().is_some()));
        })
        .unwrap();

        rows.sort_unstable();
        assert_eq!(rows, vec![(0, true), (1, false), (2, true)]);
    }

    #[test]
    fn test_cross_join_product_order() {
        let registry = ComponentRegistry::new();
        let a = registry.create(1).unwrap();
        let b = registry.create(1).unwrap();
        for entity in [0u64, 1] {
            registry.add(entity, a, &[entity as u8]).unwrap();
        }
        for entity in [5u64, 6] {
            registry.add(entity, b, &[entity as u8]).unwrap();
        }

        let a_store = registry.store(a).unwrap();
        let b_store = registry.store(b).unwrap();
        let a_guard = a_store.read();
        let b_guard = b_store.read();

        let mut pairs = Vec::new();
        for_each_tuple(&[&a_guard, &b_guard], Join::Cross, 1024, |tuple| {
            pairs.push((tuple[0].entity().0, tuple[1].entity().0));
        })
        .unwrap();

        // First source is outermost
        assert_eq!(pairs, vec![(0, 5), (0, 6), (1, 5), (1, 6)]);
    }

    #[test]
    fn test_cross_join_ceiling_refused() {
        let registry = ComponentRegistry::new();
        let a = registry.create(1).unwrap();
        let b = registry.create(1).unwrap();
        for entity in 0..4u64 {
            registry.add(entity, a, &[0]).unwrap();
            registry.add(entity, b, &[0]).unwrap();
        }

        let a_store = registry.store(a).unwrap();
        let b_store = registry.store(b).unwrap();
        let a_guard = a_store.read();
        let b_guard = b_store.read();

        let err = for_each_tuple(&[&a_guard, &b_guard], Join::Cross, 15, |_| {}).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::InvalidJoin {
                expected: 16,
                ceiling: 15
            }
        );
    }

    #[test]
    fn test_instance_read_into() {
        let (registry, pos, _) = two_stores();
        let store = registry.store(pos).unwrap();
        let guard = store.read();

        let mut buf = [0u8; 1];
        for_each_tuple(&[&guard], Join::Inner, 1024, |tuple| {
            assert!(tuple[0].read_into(&mut buf));
            assert_eq!(buf[0], tuple[0].entity().0 as u8);
        })
        .unwrap();
    }
}
