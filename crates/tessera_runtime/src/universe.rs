//! # Universe
//!
//! The process-wide runtime instance: it owns the component registry, the
//! entity registry, and the program table, and exposes the whole handle
//! API. Everything user code touches is a plain 64-bit id; records are only
//! ever borrowed inside a single system invocation.
//!
//! ## Lifecycle
//!
//! ```text
//! Universe::new()  ->  CREATED   (declare programs/components/systems/events)
//! start()          ->  RUNNING   (tick / run_program / sends allowed)
//! stop()           ->  STOPPED   (workers joined, queues drained)
//! ```
//!
//! Detached programs share the universe internals through an `Arc`; the
//! universe itself is not a global; embedders own it like any other value.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use tessera_core::{AddPolicy, ComponentId, ComponentRegistry, SparseMap};

use crate::entity::{EntityAttr, EntityId, EntityRegistry};
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::{Channel, Event, EventAttr, EventId, SyncGuard};
use crate::program::{Program, ProgramId};
use crate::system::{System, SystemAttr, SystemId};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Tunables for a universe. The defaults suit a typical game loop.
#[derive(Clone, Copy, Debug)]
pub struct UniverseConfig {
    /// Capacity of each event's buffered ring.
    pub event_queue_capacity: usize,
    /// Maximum expected tuple count a cross join may produce before it is
    /// refused with `InvalidJoin`.
    pub cross_join_ceiling: u64,
    /// What happens when a component is added to an entity that already
    /// has it.
    pub add_policy: AddPolicy,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            cross_join_ceiling: 1 << 20,
            add_policy: AddPolicy::Overwrite,
        }
    }
}

/// Everything needed to register a component.
#[derive(Clone, Copy, Debug, Default)]
pub struct ComponentAttr {
    /// Fixed record size in bytes. Must be non-zero.
    pub data_size: usize,
    /// Program the component is declared under. Informational; storage is
    /// shared universe-wide; `None` means the default program.
    pub program: Option<ProgramId>,
}

impl ComponentAttr {
    /// Creates an attribute set for `data_size`-byte records.
    #[must_use]
    pub fn new(data_size: usize) -> Self {
        Self {
            data_size,
            program: None,
        }
    }

    /// Declares the component under `program`.
    #[must_use]
    pub fn with_program(mut self, program: ProgramId) -> Self {
        self.program = Some(program);
        self
    }
}

/// Shared runtime state; detached workers hold an `Arc` of this.
pub(crate) struct Inner {
    pub(crate) config: UniverseConfig,
    state: AtomicU8,
    pub(crate) components: ComponentRegistry,
    pub(crate) entities: EntityRegistry,
    programs: RwLock<Vec<Arc<Program>>>,
    events: RwLock<SparseMap<Arc<Event>>>,
    systems: RwLock<SparseMap<Arc<System>>>,
    next_event: AtomicU64,
    next_system: AtomicU64,
    /// Built-in event carrying the id of each entity that became live.
    pub(crate) entity_created: EventId,
    /// Built-in event carrying the id of each destroyed entity.
    pub(crate) entity_destroyed: EventId,
}

impl Inner {
    pub(crate) fn program(&self, id: ProgramId) -> RuntimeResult<Arc<Program>> {
        self.programs
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(RuntimeError::UnknownProgram(id))
    }

    pub(crate) fn event(&self, id: EventId) -> RuntimeResult<Arc<Event>> {
        self.events
            .read()
            .get(id.0)
            .cloned()
            .ok_or(RuntimeError::UnknownEvent(id))
    }

    pub(crate) fn system(&self, id: SystemId) -> RuntimeResult<Arc<System>> {
        self.systems
            .read()
            .get(id.0)
            .cloned()
            .ok_or(RuntimeError::UnknownSystem(id))
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn ensure_running(&self) -> RuntimeResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning)
        }
    }

    fn ensure_not_stopped(&self) -> RuntimeResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_STOPPED {
            Err(RuntimeError::NotRunning)
        } else {
            Ok(())
        }
    }

    /// Runs one tick of `program`, containing a panic from user code so
    /// one program cannot take the rest of the cycle down with it. The
    /// panicking program loses the remainder of its tick; it is logged
    /// and gets a fresh tick next cycle.
    fn run_program_tick_contained(&self, program: &Program) -> RuntimeResult<()> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.run_program_tick(program))) {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    program = program.id.0,
                    "program tick panicked; skipping it for this cycle"
                );
                Ok(())
            }
        }
    }

    /// Signals every detached worker and waits for it to finish its
    /// current tick. A panicked worker is reaped, not propagated.
    fn join_all_workers(&self) {
        let programs = self.programs.read().clone();
        for program in programs {
            Self::join_worker(&program);
        }
    }

    fn join_worker(program: &Program) {
        let handle = program.worker.lock().take();
        if let Some(handle) = handle {
            program.stopping.store(true, Ordering::Release);
            if handle.join().is_err() {
                tracing::warn!(
                    program = program.id.0,
                    "detached program worker panicked; reaping"
                );
            }
            program.stopping.store(false, Ordering::Release);
            program.attached.store(true, Ordering::Release);
        }
    }
}

/// The engine runtime. See the [module docs](self) for the lifecycle.
pub struct Universe {
    inner: Arc<Inner>,
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl Universe {
    /// Creates a universe with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(UniverseConfig::default())
    }

    /// Creates a universe with an explicit configuration.
    ///
    /// The default program (id 0) and the built-in entity lifecycle events
    /// exist from the start.
    #[must_use]
    pub fn with_config(config: UniverseConfig) -> Self {
        let default_program = Arc::new(Program::new(ProgramId(0), "default"));

        let entity_created = EventId(0);
        let entity_destroyed = EventId(1);
        let message_size = std::mem::size_of::<EntityId>();
        let mut events = SparseMap::new();
        for id in [entity_created, entity_destroyed] {
            events.insert(
                id.0,
                Arc::new(Event::new(
                    id,
                    ProgramId(0),
                    message_size,
                    config.event_queue_capacity,
                )),
            );
            default_program.add_event(id);
        }

        Self {
            inner: Arc::new(Inner {
                config,
                state: AtomicU8::new(STATE_CREATED),
                components: ComponentRegistry::with_policy(config.add_policy),
                entities: EntityRegistry::new(),
                programs: RwLock::new(vec![default_program]),
                events: RwLock::new(events),
                systems: RwLock::new(SparseMap::new()),
                next_event: AtomicU64::new(2),
                next_system: AtomicU64::new(0),
                entity_created,
                entity_destroyed,
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Transitions `CREATED -> RUNNING`.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the universe already started or stopped.
    pub fn start(&self) -> RuntimeResult<()> {
        self.inner
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| RuntimeError::NotRunning)
    }

    /// Joins detached workers, drains every program once, and transitions
    /// to `STOPPED`.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the universe was not running. A failure from the
    /// final drain ticks is reported after the shutdown completes; a
    /// panicking program forfeits its final drain but cannot block the
    /// shutdown.
    pub fn stop(&self) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        self.inner.join_all_workers();

        let mut first_err = None;
        let programs = self.inner.programs.read().clone();
        for program in programs {
            if let Err(err) = self.inner.run_program_tick_contained(&program) {
                first_err.get_or_insert(err);
            }
        }
        self.inner.state.store(STATE_STOPPED, Ordering::Release);
        first_err.map_or(Ok(()), Err)
    }

    /// Runs one tick of every attached program, in program-id order. This
    /// is the universe's `loop` operation; `loop` is a Rust keyword.
    ///
    /// Detached programs are skipped; their workers advance them. Programs
    /// advance independently: a panic inside one program's systems
    /// terminates that program's tick only, is logged, and the remaining
    /// programs still get their turn. The universe stays valid and the
    /// next `tick` runs normally.
    ///
    /// # Errors
    ///
    /// `NotRunning` outside the running state; otherwise the first
    /// `Result` failure from any program's tick, after every program had
    /// its turn.
    pub fn tick(&self) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let mut first_err = None;
        let programs = self.inner.programs.read().clone();
        for program in programs {
            if program.is_attached() {
                if let Err(err) = self.inner.run_program_tick_contained(&program) {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Programs
    // =========================================================================

    /// Creates a program, or returns the existing id when `name` is
    /// already taken (names are unique).
    ///
    /// # Errors
    ///
    /// `NotRunning` after `stop`.
    pub fn create_program(&self, name: &str) -> RuntimeResult<ProgramId> {
        self.inner.ensure_not_stopped()?;
        let mut programs = self.inner.programs.write();
        if let Some(existing) = programs.iter().find(|p| p.name() == name) {
            return Ok(existing.id());
        }
        let id = ProgramId(programs.len() as u64);
        programs.push(Arc::new(Program::new(id, name)));
        tracing::debug!(program = id.0, name, "program created");
        Ok(id)
    }

    /// Number of programs, including the default program.
    #[must_use]
    pub fn program_count(&self) -> usize {
        self.inner.programs.read().len()
    }

    /// Runs one tick of `program` on the calling thread.
    ///
    /// Callers must not race a detached worker for the same program; the
    /// per-program single-thread discipline is theirs to keep once they
    /// drive programs by hand. A panic in the program's systems propagates
    /// to the caller (there is no other program here to shield); the
    /// universe itself stays valid.
    ///
    /// # Errors
    ///
    /// `NotRunning`, `UnknownProgram`, or the tick's first failure.
    pub fn run_program(&self, program: ProgramId) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let program = self.inner.program(program)?;
        self.inner.run_program_tick(&program)
    }

    /// Moves `program` onto a dedicated worker thread that ticks it in a
    /// loop until joined. Idempotent for an already-detached program.
    ///
    /// # Errors
    ///
    /// `NotRunning` or `UnknownProgram`.
    pub fn detach_program(&self, program: ProgramId) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let program = self.inner.program(program)?;

        let mut worker = program.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        program.attached.store(false, Ordering::Release);
        program.stopping.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let worker_program = Arc::clone(&program);
        let handle = std::thread::Builder::new()
            .name(format!("tessera-program-{}", program.id().0))
            .spawn(move || {
                while !worker_program.stopping.load(Ordering::Acquire) {
                    // Errors were already reported per invocation; a worker
                    // keeps ticking until joined.
                    let _ = inner.run_program_tick(&worker_program);
                    std::thread::yield_now();
                }
            })
            .expect("spawning a program worker thread");
        *worker = Some(handle);
        tracing::info!(program = program.id().0, "program detached");
        Ok(())
    }

    /// Signals `program`'s worker to stop, waits for it to finish its
    /// current tick, and re-attaches the program to the universe ticker.
    /// A no-op for programs that were never detached.
    ///
    /// # Errors
    ///
    /// `NotRunning` or `UnknownProgram`.
    pub fn join_program(&self, program: ProgramId) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let program = self.inner.program(program)?;
        Inner::join_worker(&program);
        tracing::info!(program = program.id().0, "program joined");
        Ok(())
    }

    // =========================================================================
    // Components & Entities
    // =========================================================================

    /// Registers a component type.
    ///
    /// # Errors
    ///
    /// `AttrIncomplete` for a zero `data_size`; `UnknownProgram` when the
    /// attr names a program that does not exist.
    pub fn component_create(&self, attr: ComponentAttr) -> RuntimeResult<ComponentId> {
        self.inner.ensure_not_stopped()?;
        if attr.data_size == 0 {
            return Err(RuntimeError::AttrIncomplete("data_size"));
        }
        if let Some(program) = attr.program {
            self.inner.program(program)?;
        }
        Ok(self.inner.components.create(attr.data_size)?)
    }

    /// Copies out the record for `(entity, component)`, if present.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` for unregistered ids.
    pub fn component_find(
        &self,
        entity: EntityId,
        component: ComponentId,
    ) -> RuntimeResult<Option<Vec<u8>>> {
        Ok(self.inner.components.find(entity.0, component)?)
    }

    /// Allocates an entity and stages its creation; the components (and
    /// the built-in `entity_created` message) land at the next scheduler
    /// boundary.
    ///
    /// # Errors
    ///
    /// `AttrIncomplete` for an empty component list; `UnknownComponent` or
    /// a record-size mismatch for a bad pair.
    pub fn entity_create(&self, attr: &EntityAttr) -> RuntimeResult<EntityId> {
        self.inner.ensure_not_stopped()?;
        self.inner.entities.create(&self.inner.components, attr)
    }

    /// Stages `entity` for destruction at the next scheduler boundary.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` for ids that were never allocated.
    pub fn entity_destroy(&self, entity: EntityId) -> RuntimeResult<()> {
        self.inner.ensure_not_stopped()?;
        self.inner.entities.destroy(entity)
    }

    /// Returns `true` if `entity` is live.
    #[must_use]
    pub fn entity_alive(&self, entity: EntityId) -> bool {
        self.inner.entities.is_live(entity)
    }

    /// The built-in event publishing ids of entities that became live.
    #[must_use]
    pub fn entity_created_event(&self) -> EventId {
        self.inner.entity_created
    }

    /// The built-in event publishing ids of destroyed entities.
    #[must_use]
    pub fn entity_destroyed_event(&self) -> EventId {
        self.inner.entity_destroyed
    }

    // =========================================================================
    // Systems
    // =========================================================================

    /// Creates a system under its attr's program (default program when
    /// unset). Systems start enabled.
    ///
    /// # Errors
    ///
    /// `AttrIncomplete` when neither transform nor callback is set;
    /// `UnknownProgram` / `UnknownComponent` for bad references.
    pub fn system_create(&self, attr: SystemAttr) -> RuntimeResult<SystemId> {
        self.inner.ensure_not_stopped()?;
        if attr.transform.is_none() && attr.callback.is_none() {
            return Err(RuntimeError::AttrIncomplete("transform or callback"));
        }
        let program = self.inner.program(attr.program.unwrap_or(ProgramId(0)))?;
        for component in attr.sources.iter().chain(attr.sinks.iter()) {
            self.inner.components.store(*component)?;
        }

        let id = SystemId(self.inner.next_system.fetch_add(1, Ordering::Relaxed));
        let system = Arc::new(System::from_attr(id, program.id(), attr));
        self.inner.systems.write().insert(id.0, Arc::clone(&system));
        program.add_system(system);
        Ok(id)
    }

    /// Re-enables a disabled system.
    ///
    /// # Errors
    ///
    /// `UnknownSystem` for ids that were never created.
    pub fn system_enable(&self, system: SystemId) -> RuntimeResult<()> {
        self.inner.system(system)?.set_enabled(true);
        Ok(())
    }

    /// Disables a system. It is skipped by the scheduler but keeps its
    /// subscriptions and its place in the order.
    ///
    /// # Errors
    ///
    /// `UnknownSystem` for ids that were never created.
    pub fn system_disable(&self, system: SystemId) -> RuntimeResult<()> {
        self.inner.system(system)?.set_enabled(false);
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Creates an event under its attr's program (default program when
    /// unset).
    ///
    /// # Errors
    ///
    /// `AttrIncomplete` for a zero `message_size`; `UnknownProgram` for a
    /// bad program reference.
    pub fn event_create(&self, attr: EventAttr) -> RuntimeResult<EventId> {
        self.inner.ensure_not_stopped()?;
        if attr.message_size == 0 {
            return Err(RuntimeError::AttrIncomplete("message_size"));
        }
        let program = self.inner.program(attr.program.unwrap_or(ProgramId(0)))?;

        let id = EventId(self.inner.next_event.fetch_add(1, Ordering::Relaxed));
        let event = Arc::new(Event::new(
            id,
            program.id(),
            attr.message_size,
            self.inner.config.event_queue_capacity,
        ));
        self.inner.events.write().insert(id.0, event);
        program.add_event(id);
        Ok(id)
    }

    /// Copies `message` into `event`'s ring for delivery on the owning
    /// program's next drain.
    ///
    /// # Errors
    ///
    /// `NotRunning`, `UnknownEvent`, `MessageSize`, or `EventQueueFull`
    /// (non-fatal; retry or drop, the queue drains every tick).
    pub fn event_send(&self, event: EventId, message: &[u8]) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        self.inner.event(event)?.enqueue(message)
    }

    /// Delivers `message` to every subscribed system inline, on the
    /// calling thread, in priority order, before returning.
    ///
    /// # Errors
    ///
    /// `ReentrantSend` when the event is already being dispatched on this
    /// thread; otherwise the first failure from a subscriber invocation.
    pub fn event_send_sync(&self, event: EventId, message: &[u8]) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let event = self.inner.event(event)?;
        event.check_size(message)?;
        let _guard = SyncGuard::enter(event.id())?;

        let program = self.inner.program(event.program())?;
        let mut first_err = None;
        for system in self.inner.resolve_subscribers(&event, None) {
            if system.is_enabled() {
                if let Err(err) = self.inner.invoke_system(&program, &system, Some(message)) {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Subscribes `system` to `event`. Idempotent. The system must belong
    /// to the event's program; cross-program delivery is what buffered
    /// sends are for.
    ///
    /// # Errors
    ///
    /// `UnknownEvent`; `UnknownSystem` for a missing or foreign system.
    pub fn event_subscribe(&self, event: EventId, system: SystemId) -> RuntimeResult<()> {
        self.inner.ensure_not_stopped()?;
        let event = self.inner.event(event)?;
        let subscriber = self.inner.system(system)?;
        if subscriber.program() != event.program() {
            return Err(RuntimeError::UnknownSystem(system));
        }
        event.subscribe(system);
        Ok(())
    }

    /// Removes `system` from `event`'s subscriber table. Idempotent.
    ///
    /// # Errors
    ///
    /// `UnknownEvent` or `UnknownSystem`.
    pub fn event_unsubscribe(&self, event: EventId, system: SystemId) -> RuntimeResult<()> {
        self.inner.ensure_not_stopped()?;
        let event = self.inner.event(event)?;
        self.inner.system(system)?;
        event.unsubscribe(system);
        Ok(())
    }

    /// Drains `event`'s buffered messages now, on the calling thread.
    ///
    /// # Errors
    ///
    /// `NotRunning`, `UnknownEvent`, or the drain's first failure.
    pub fn event_flush(&self, event: EventId) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let event = self.inner.event(event)?;
        let program = self.inner.program(event.program())?;
        self.inner.drain_event(&program, &event)
    }

    /// Drains every event owned by `program`, in creation order.
    ///
    /// # Errors
    ///
    /// `NotRunning`, `UnknownProgram`, or the first drain failure.
    pub fn event_flushall(&self, program: ProgramId) -> RuntimeResult<()> {
        self.inner.ensure_running()?;
        let program = self.inner.program(program)?;
        let mut first_err = None;
        for event_id in program.events_snapshot() {
            let event = self.inner.event(event_id)?;
            if let Err(err) = self.inner.drain_event(&program, &event) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Opens a cloneable cross-thread sender for `event`'s buffered queue.
    ///
    /// # Errors
    ///
    /// `UnknownEvent`.
    pub fn open_channel(&self, event: EventId) -> RuntimeResult<Channel> {
        self.inner.ensure_not_stopped()?;
        Ok(self.inner.event(event)?.channel())
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        // Workers hold an Arc of the internals; reap them so a dropped
        // universe cannot leave threads spinning. User code does not run
        // here; final drains belong to an explicit stop().
        if self.inner.is_running() {
            self.inner.join_all_workers();
            self.inner.state.store(STATE_STOPPED, Ordering::Release);
        }
    }
}
