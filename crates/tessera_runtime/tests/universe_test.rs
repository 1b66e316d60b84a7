//! End-to-end scenarios driving the whole runtime through the public
//! handle API: storage round-trips, scheduling order, joins, staging, and
//! the program/event runtime.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use tessera_runtime::{
    ComponentAttr, EntityAttr, EntityId, EventAttr, Join, RuntimeError, SystemAttr, Trigger,
    Universe, UniverseConfig,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Vec3 {
    x: f32,
    y: f32,
    z: f32,
}

impl Vec3 {
    const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

fn read_vec3(universe: &Universe, entity: EntityId, component: tessera_runtime::ComponentId) -> Vec3 {
    let bytes = universe
        .component_find(entity, component)
        .unwrap()
        .expect("record present");
    // Records are raw bytes; nothing guarantees f32 alignment.
    bytemuck::pod_read_unaligned(&bytes)
}

/// Basic ECS round-trip: a loop system integrates a position for ten
/// ticks.
#[test]
fn test_loop_system_integrates_position() {
    let universe = Universe::new();
    let pos = universe.component_create(ComponentAttr::new(12)).unwrap();

    let entity = universe
        .entity_create(
            &EntityAttr::new().with_component(pos, bytemuck::bytes_of(&Vec3::new(1.0, 2.0, 3.0))),
        )
        .unwrap();

    universe
        .system_create(
            SystemAttr::new()
                .with_source(pos)
                .with_sink(pos)
                .with_transform(move |tuple, frame| {
                    let mut value: Vec3 = bytemuck::pod_read_unaligned(tuple[0].record().unwrap());
                    value.x += 0.1;
                    frame
                        .stage()
                        .insert(tuple[0].entity(), pos, bytemuck::bytes_of(&value));
                }),
        )
        .unwrap();

    universe.start().unwrap();
    for _ in 0..10 {
        universe.tick().unwrap();
    }

    let value = read_vec3(&universe, entity, pos);
    assert!((value.x - 2.0).abs() < 1e-4, "x = {}", value.x);
    assert!((value.y - 2.0).abs() < f32::EPSILON);
    universe.stop().unwrap();
}

/// Priority ordering: the higher-priority system's write is observed by
/// the lower-priority one in the same tick; swapping priorities flips the
/// outcome.
#[test]
fn test_priority_order_decides_final_value() {
    fn run(priority_set: i16, priority_add: i16) -> u32 {
        let universe = Universe::new();
        let value = universe.component_create(ComponentAttr::new(4)).unwrap();
        let entity = universe
            .entity_create(&EntityAttr::new().with_component(value, &0u32.to_le_bytes()))
            .unwrap();

        universe
            .system_create(
                SystemAttr::new()
                    .with_source(value)
                    .with_sink(value)
                    .with_priority(priority_set)
                    .with_transform(move |tuple, frame| {
                        frame
                            .stage()
                            .insert(tuple[0].entity(), value, &1u32.to_le_bytes());
                    }),
            )
            .unwrap();
        universe
            .system_create(
                SystemAttr::new()
                    .with_source(value)
                    .with_sink(value)
                    .with_priority(priority_add)
                    .with_transform(move |tuple, frame| {
                        let current = u32::from_le_bytes(
                            tuple[0].record().unwrap().try_into().unwrap(),
                        );
                        frame
                            .stage()
                            .insert(tuple[0].entity(), value, &(current + 1).to_le_bytes());
                    }),
            )
            .unwrap();

        universe.start().unwrap();
        universe.tick().unwrap();

        let bytes = universe.component_find(entity, value).unwrap().unwrap();
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    // set runs first, add sees the 1 it wrote
    assert_eq!(run(10, 5), 2);
    // add runs first over the initial 0, then set clobbers it
    assert_eq!(run(5, 10), 1);
}

/// Buffered cross-program delivery: messages enqueued from another
/// program's system all arrive during one tick of the owning program.
#[test]
fn test_buffered_event_crosses_programs() {
    let universe = Universe::new();
    let worker = universe.create_program("worker").unwrap();
    let event = universe
        .event_create(EventAttr::new(4).with_program(worker))
        .unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let observed = Arc::clone(&counter);
    let handler = universe
        .system_create(
            SystemAttr::new()
                .with_program(worker)
                .with_trigger(Trigger::Event)
                .with_callback(move |frame| {
                    assert_eq!(frame.event().map(<[u8]>::len), Some(4));
                    observed.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .unwrap();
    universe.event_subscribe(event, handler).unwrap();

    // A system on the default program produces into the worker's queue.
    let channel = universe.open_channel(event).unwrap();
    universe
        .system_create(SystemAttr::new().with_callback(move |_frame| {
            for n in 0u32..3 {
                channel.send(&n.to_le_bytes()).unwrap();
            }
        }))
        .unwrap();

    universe.start().unwrap();
    universe.run_program(tessera_runtime::ProgramId(0)).unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 0); // not drained yet

    universe.run_program(worker).unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 3);
}

/// Inner join emits exactly the intersection, once per tick.
#[test]
fn test_inner_join_binds_intersection_only() {
    let universe = Universe::new();
    let pos = universe.component_create(ComponentAttr::new(12)).unwrap();
    let vel = universe.component_create(ComponentAttr::new(12)).unwrap();

    let zero = Vec3::new(0.0, 0.0, 0.0);
    let both = universe
        .entity_create(
            &EntityAttr::new()
                .with_component(pos, bytemuck::bytes_of(&zero))
                .with_component(vel, bytemuck::bytes_of(&zero)),
        )
        .unwrap();
    universe
        .entity_create(&EntityAttr::new().with_component(pos, bytemuck::bytes_of(&zero)))
        .unwrap();
    universe
        .entity_create(&EntityAttr::new().with_component(vel, bytemuck::bytes_of(&zero)))
        .unwrap();

    let invocations = Arc::new(AtomicU32::new(0));
    let bound_to = Arc::new(AtomicU64::new(u64::MAX));
    let hits = Arc::clone(&invocations);
    let seen = Arc::clone(&bound_to);
    universe
        .system_create(
            SystemAttr::new()
                .with_source(pos)
                .with_source(vel)
                .with_join(Join::Inner)
                .with_transform(move |tuple, _frame| {
                    hits.fetch_add(1, Ordering::Relaxed);
                    seen.store(tuple[0].entity().0, Ordering::Relaxed);
                    assert_eq!(tuple[0].entity(), tuple[1].entity());
                }),
        )
        .unwrap();

    universe.start().unwrap();
    universe.tick().unwrap();
    assert_eq!(invocations.load(Ordering::Relaxed), 1);
    assert_eq!(bound_to.load(Ordering::Relaxed), both.0);

    universe.tick().unwrap();
    assert_eq!(invocations.load(Ordering::Relaxed), 2);
}

/// A remove staged mid-iteration does not disturb the current pass; the
/// entity is gone the following tick.
#[test]
fn test_staged_remove_lands_after_the_pass() {
    let universe = Universe::new();
    let pos = universe.component_create(ComponentAttr::new(12)).unwrap();

    let zero = Vec3::new(0.0, 0.0, 0.0);
    for _ in 0..3 {
        universe
            .entity_create(&EntityAttr::new().with_component(pos, bytemuck::bytes_of(&zero)))
            .unwrap();
    }

    let per_tick = Arc::new(Mutex::new(Vec::new()));
    let tallies = Arc::clone(&per_tick);
    universe
        .system_create(
            SystemAttr::new()
                .with_source(pos)
                .with_sink(pos)
                .with_transform(move |tuple, frame| {
                    let mut tallies = tallies.lock();
                    let tick = frame.tick() as usize;
                    if tallies.len() <= tick {
                        tallies.resize(tick + 1, 0u32);
                    }
                    tallies[tick] += 1;
                    // First tuple of the first tick removes its own record.
                    if frame.tick() == 0 && tallies[0] == 1 {
                        frame.stage().remove(tuple[0].entity(), pos);
                    }
                }),
        )
        .unwrap();

    universe.start().unwrap();
    universe.tick().unwrap();
    universe.tick().unwrap();

    let tallies = per_tick.lock();
    // The removing pass still visited all three tuples of its dense order.
    assert_eq!(*tallies, vec![3, 2]);
}

/// A detached program keeps ticking on its worker until joined.
#[test]
fn test_detached_program_runs_until_joined() {
    let universe = Universe::new();
    let background = universe.create_program("background").unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    let ticks = Arc::clone(&counter);
    universe
        .system_create(
            SystemAttr::new()
                .with_program(background)
                .with_callback(move |_frame| {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .unwrap();

    universe.start().unwrap();
    universe.detach_program(background).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    universe.join_program(background).unwrap();

    let after_join = counter.load(Ordering::Relaxed);
    assert!(after_join > 0);

    // Joined: nothing advances the program until the ticker does.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::Relaxed), after_join);

    // Re-attached: the universe ticker advances it again.
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), after_join + 1);
    universe.stop().unwrap();
}

/// Buffered delivery is FIFO per event.
#[test]
fn test_buffered_delivery_is_fifo() {
    let universe = Universe::new();
    let event = universe.event_create(EventAttr::new(1)).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::clone(&order);
    let handler = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |frame| {
                    received.lock().push(frame.event().unwrap()[0]);
                }),
        )
        .unwrap();
    universe.event_subscribe(event, handler).unwrap();

    universe.start().unwrap();
    for byte in [3u8, 1, 4, 1, 5] {
        universe.event_send(event, &[byte]).unwrap();
    }
    universe.tick().unwrap();

    assert_eq!(*order.lock(), vec![3, 1, 4, 1, 5]);
}

/// A full ring refuses the send; the caller may retry after a drain.
#[test]
fn test_queue_full_is_surfaced_to_sender() {
    let universe = Universe::with_config(UniverseConfig {
        event_queue_capacity: 2,
        ..UniverseConfig::default()
    });
    let event = universe.event_create(EventAttr::new(1)).unwrap();
    universe.start().unwrap();

    universe.event_send(event, &[1]).unwrap();
    universe.event_send(event, &[2]).unwrap();
    assert_eq!(
        universe.event_send(event, &[3]).unwrap_err(),
        RuntimeError::EventQueueFull(event)
    );

    universe.tick().unwrap(); // drains (no subscribers)
    universe.event_send(event, &[3]).unwrap();
}

/// Synchronous sends run subscribers inline, without a tick.
#[test]
fn test_sync_send_dispatches_inline() {
    let universe = Universe::new();
    let event = universe.event_create(EventAttr::new(4)).unwrap();

    let total = Arc::new(AtomicU32::new(0));
    let sum = Arc::clone(&total);
    let handler = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |frame| {
                    let n = u32::from_le_bytes(frame.event().unwrap().try_into().unwrap());
                    sum.fetch_add(n, Ordering::Relaxed);
                }),
        )
        .unwrap();
    universe.event_subscribe(event, handler).unwrap();

    universe.start().unwrap();
    universe.event_send_sync(event, &7u32.to_le_bytes()).unwrap();
    assert_eq!(total.load(Ordering::Relaxed), 7);
}

/// Unsubscribing restores the table: no further deliveries.
#[test]
fn test_unsubscribe_stops_delivery() {
    let universe = Universe::new();
    let event = universe.event_create(EventAttr::new(1)).unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let hits = Arc::clone(&counter);
    let handler = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |_frame| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .unwrap();
    universe.event_subscribe(event, handler).unwrap();
    universe.start().unwrap();

    universe.event_send(event, &[0]).unwrap();
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1);

    universe.event_unsubscribe(event, handler).unwrap();
    universe.event_send(event, &[0]).unwrap();
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

/// Disabled systems are skipped but keep their place and subscriptions.
#[test]
fn test_disable_enable_roundtrip() {
    let universe = Universe::new();
    let event = universe.event_create(EventAttr::new(1)).unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let hits = Arc::clone(&counter);
    let handler = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |_frame| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .unwrap();
    universe.event_subscribe(event, handler).unwrap();
    universe.start().unwrap();

    universe.system_disable(handler).unwrap();
    universe.event_send(event, &[0]).unwrap();
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    universe.system_enable(handler).unwrap();
    universe.event_send(event, &[0]).unwrap();
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

/// The built-in lifecycle events publish entity ids at the boundary.
#[test]
fn test_entity_lifecycle_events_are_published() {
    let universe = Universe::new();
    let pos = universe.component_create(ComponentAttr::new(12)).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let created_log = Arc::clone(&log);
    let destroyed_log = Arc::clone(&log);

    let on_created = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |frame| {
                    let id: EntityId = bytemuck::pod_read_unaligned(frame.event().unwrap());
                    created_log.lock().push(("created", id));
                }),
        )
        .unwrap();
    let on_destroyed = universe
        .system_create(
            SystemAttr::new()
                .with_trigger(Trigger::Event)
                .with_callback(move |frame| {
                    let id: EntityId = bytemuck::pod_read_unaligned(frame.event().unwrap());
                    destroyed_log.lock().push(("destroyed", id));
                }),
        )
        .unwrap();
    universe
        .event_subscribe(universe.entity_created_event(), on_created)
        .unwrap();
    universe
        .event_subscribe(universe.entity_destroyed_event(), on_destroyed)
        .unwrap();

    universe.start().unwrap();
    let entity = universe
        .entity_create(
            &EntityAttr::new()
                .with_component(pos, bytemuck::bytes_of(&Vec3::new(0.0, 0.0, 0.0))),
        )
        .unwrap();
    universe.tick().unwrap();
    assert_eq!(*log.lock(), vec![("created", entity)]);
    assert!(universe.entity_alive(entity));

    universe.entity_destroy(entity).unwrap();
    universe.tick().unwrap();
    assert_eq!(
        *log.lock(),
        vec![("created", entity), ("destroyed", entity)]
    );
    assert!(!universe.entity_alive(entity));
    assert_eq!(universe.component_find(entity, pos).unwrap(), None);
}

/// A panic inside a loop transform terminates that program's tick only:
/// later programs still get their turn in the same cycle, and the
/// universe stays valid for subsequent ticks.
#[test]
fn test_panicking_transform_does_not_poison_universe() {
    let universe = Universe::new();
    let faulty = universe.create_program("faulty").unwrap();
    let steady = universe.create_program("steady").unwrap();

    let pos = universe.component_create(ComponentAttr::new(12)).unwrap();
    universe
        .entity_create(
            &EntityAttr::new()
                .with_component(pos, bytemuck::bytes_of(&Vec3::new(0.0, 0.0, 0.0))),
        )
        .unwrap();

    universe
        .system_create(
            SystemAttr::new()
                .with_program(faulty)
                .with_source(pos)
                .with_transform(|_tuple, _frame| panic!("transform bug")),
        )
        .unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let ticks = Arc::clone(&counter);
    universe
        .system_create(
            SystemAttr::new()
                .with_program(steady)
                .with_callback(move |_frame| {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .unwrap();

    universe.start().unwrap();

    // faulty runs (and panics) before steady in program-id order; steady
    // must still get its turn this cycle.
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1);

    // The universe is not poisoned: the next tick runs normally.
    universe.tick().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    universe.stop().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 3);
}

/// Detach and join leave the program table as it was.
#[test]
fn test_detach_join_program_count_roundtrip() {
    let universe = Universe::new();
    let baseline = universe.program_count();

    let scratch = universe.create_program("scratch").unwrap();
    assert_eq!(universe.program_count(), baseline + 1);

    universe.start().unwrap();
    universe.detach_program(scratch).unwrap();
    universe.join_program(scratch).unwrap();
    assert_eq!(universe.program_count(), baseline + 1);
    universe.stop().unwrap();
}
