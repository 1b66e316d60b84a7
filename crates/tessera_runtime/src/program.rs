//! # Programs & Scheduler
//!
//! A program is a scheduling unit: an ordered list of systems, the events
//! it owns, and (when detached) a dedicated worker thread. All systems of
//! one program run sequentially on one thread; that is the invariant that
//! lets transforms hold records without locks.
//!
//! ## Tick sequence
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ 1. LIFECYCLE BOUNDARY                                    │
//! │    └─ apply staged entity creates/destroys, publish      │
//! │       CreateEntityEvent / DestroyEntityEvent             │
//! │ 2. LOOP PASS                                             │
//! │    └─ invoke Loop systems, descending priority,          │
//! │       staging flushed after each invocation              │
//! │ 3. EVENT DRAIN                                           │
//! │    └─ per event (creation order), per message (FIFO),    │
//! │       invoke Event subscribers in priority order         │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use tessera_core::ComponentStore;

use crate::entity::LifecycleEmit;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::{Event, EventId};
use crate::join::for_each_tuple;
use crate::system::{Frame, StageBuffer, System, Trigger};
use crate::universe::Inner;

/// Identifier of a program, assigned in creation order. Program 0 is the
/// universe's default program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProgramId(pub u64);

/// A logical scheduling unit owning systems and events.
pub struct Program {
    pub(crate) id: ProgramId,
    pub(crate) name: String,
    /// Kept sorted: descending priority, creation order within ties.
    systems: RwLock<Vec<Arc<System>>>,
    /// Owned events, in creation order.
    events: RwLock<Vec<EventId>>,
    /// `true` while the universe ticker advances this program.
    pub(crate) attached: AtomicBool,
    pub(crate) ticks: AtomicU64,
    pub(crate) stopping: AtomicBool,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl Program {
    pub(crate) fn new(id: ProgramId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            systems: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            attached: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// The program's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ProgramId {
        self.id
    }

    /// The program's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticks completed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Returns `true` while the universe ticker advances this program.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    pub(crate) fn add_system(&self, system: Arc<System>) {
        let mut systems = self.systems.write();
        systems.push(system);
        // Stable sort: creation order survives within equal priorities.
        systems.sort_by_key(|s| Reverse(s.priority));
    }

    pub(crate) fn systems_snapshot(&self) -> Vec<Arc<System>> {
        self.systems.read().clone()
    }

    pub(crate) fn add_event(&self, event: EventId) {
        self.events.write().push(event);
    }

    pub(crate) fn events_snapshot(&self) -> Vec<EventId> {
        self.events.read().clone()
    }
}

impl Inner {
    /// Runs one full tick of `program` on the calling thread.
    ///
    /// Every system still gets its turn when one fails with an error; the
    /// first error is reported after the tick completes. A panic in user
    /// code is different: it unwinds out here and terminates the tick.
    /// Callers that advance more than one program contain it per program
    /// (the universe ticker via `catch_unwind`, detached workers via
    /// their thread boundary).
    ///
    /// # Errors
    ///
    /// The first failure from a system invocation (for example a refused
    /// cross join).
    pub(crate) fn run_program_tick(&self, program: &Program) -> RuntimeResult<()> {
        let mut first_err = None;

        self.publish_lifecycle();

        for system in program.systems_snapshot() {
            if system.trigger == Trigger::Loop && system.is_enabled() {
                let result = self.invoke_system(program, &system, None);
                collect_err(&mut first_err, result);
            }
        }

        for event_id in program.events_snapshot() {
            if let Ok(event) = self.event(event_id) {
                let result = self.drain_event(program, &event);
                collect_err(&mut first_err, result);
            }
        }

        program.ticks.fetch_add(1, Ordering::Relaxed);
        first_err.map_or(Ok(()), Err)
    }

    /// Applies staged entity creates/destroys and publishes the lifecycle
    /// messages on the built-in events.
    pub(crate) fn publish_lifecycle(&self) {
        for emit in self.entities.flush_lifecycle(&self.components) {
            let (event_id, entity) = match emit {
                LifecycleEmit::Created(entity) => (self.entity_created, entity),
                LifecycleEmit::Destroyed(entity) => (self.entity_destroyed, entity),
            };
            let Ok(event) = self.event(event_id) else {
                continue;
            };
            if let Err(err) = event.enqueue(bytemuck::bytes_of(&entity)) {
                tracing::warn!(entity = entity.0, %err, "dropping entity lifecycle message");
            }
        }
    }

    /// Delivers every message currently buffered on `event` to its
    /// event-triggered subscribers, FIFO, priority order per message.
    ///
    /// Only the messages present when the drain starts are delivered;
    /// anything a handler enqueues on the same event waits for the next
    /// tick, which keeps one tick's drain bounded.
    pub(crate) fn drain_event(&self, program: &Program, event: &Event) -> RuntimeResult<()> {
        let pending = event.pending();
        if pending == 0 {
            return Ok(());
        }
        let subscribers = self.resolve_subscribers(event, Some(Trigger::Event));
        let mut first_err = None;

        for _ in 0..pending {
            let Some(message) = event.dequeue() else {
                break;
            };
            for system in &subscribers {
                if system.is_enabled() {
                    let result = self.invoke_system(program, system, Some(&message));
                    collect_err(&mut first_err, result);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Resolves an event's subscriber ids into systems, sorted by
    /// descending priority with creation-order tie-breaks. `trigger`
    /// filters to one firing rule (the buffered drain path delivers only
    /// to event-triggered systems; the synchronous path to all).
    pub(crate) fn resolve_subscribers(
        &self,
        event: &Event,
        trigger: Option<Trigger>,
    ) -> Vec<Arc<System>> {
        let mut systems: Vec<Arc<System>> = event
            .subscribers()
            .into_iter()
            .filter_map(|id| self.system(id).ok())
            .filter(|system| trigger.is_none_or(|t| system.trigger == t))
            .collect();
        systems.sort_by_key(|s| (Reverse(s.priority), s.id.0));
        systems
    }

    /// Invokes one system: the per-tuple transform over its join stream,
    /// then the callback. Staged mutations are applied after the user code
    /// returns, before the next system runs.
    pub(crate) fn invoke_system(
        &self,
        program: &Program,
        system: &System,
        message: Option<&[u8]>,
    ) -> RuntimeResult<()> {
        let mut stage = StageBuffer::new();
        let mut result = Ok(());
        {
            // A system cannot re-enter itself (possible through nested
            // synchronous sends); skip rather than deadlock on its state.
            let Some(mut state) = system.state.try_lock() else {
                tracing::warn!(system = system.id.0, "skipping re-entrant invocation");
                return Ok(());
            };
            let mut frame = Frame {
                tick: program.ticks.load(Ordering::Relaxed),
                event: message,
                state: state.as_mut(),
                stage: &mut stage,
            };

            if let Some(transform) = &system.transform {
                if !system.sources.is_empty() {
                    // The Arcs must outlive the read guards; both live for
                    // exactly this invocation.
                    let mut stores = Vec::with_capacity(system.sources.len());
                    for component in &system.sources {
                        stores.push(self.components.store(*component)?);
                    }
                    let guards: Vec<_> = stores.iter().map(|store| store.read()).collect();
                    let refs: Vec<&ComponentStore> = guards.iter().map(|g| &**g).collect();

                    result = for_each_tuple(
                        &refs,
                        system.join,
                        self.config.cross_join_ceiling,
                        |tuple| transform(tuple, &mut frame),
                    );
                }
            }
            if let Some(callback) = &system.callback {
                callback(&mut frame);
            }
        }
        stage.apply(&self.components, &self.entities);
        result
    }
}

fn collect_err(first: &mut Option<RuntimeError>, result: RuntimeResult<()>) {
    if let Err(err) = result {
        if first.is_none() {
            *first = Some(err);
        }
    }
}
