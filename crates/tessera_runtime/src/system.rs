//! # Systems, Frames, and Staging
//!
//! A system is user code bound to a program: a per-tuple `transform` over
//! the join of its source components, a once-per-invocation `callback`, or
//! both. Systems fire on the program tick (`Loop`) or per drained message
//! (`Event`).
//!
//! Mutations a system requests while running are not applied in place;
//! they are recorded in a [`StageBuffer`] and flushed at the invocation
//! boundary, before the next system runs. That single rule is what makes
//! in-system iteration safe without locks.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use tessera_core::{ComponentId, ComponentRegistry};

use crate::entity::{EntityId, EntityRegistry};
use crate::join::{Instance, Join};
use crate::program::ProgramId;

/// Identifier of a system, assigned in creation order across the universe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SystemId(pub u64);

/// When a system fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Trigger {
    /// Once per program tick.
    #[default]
    Loop,
    /// Once per drained message on each subscribed event.
    Event,
}

/// Per-tuple user function: the join tuple plus the frame context.
pub type Transform = dyn Fn(&[Instance<'_>], &mut Frame<'_>) + Send + Sync;

/// Once-per-invocation user function.
pub type Callback = dyn Fn(&mut Frame<'_>) + Send + Sync;

/// Everything needed to create a system.
///
/// `transform` or `callback` must be set; a missing `program` means the
/// universe's default program.
#[derive(Default)]
pub struct SystemAttr {
    /// Program the system runs under; `None` targets the default program.
    pub program: Option<ProgramId>,
    /// Components read-captured into the join stream.
    pub sources: Vec<ComponentId>,
    /// Components the system writes through staging.
    pub sinks: Vec<ComponentId>,
    /// Per-tuple function.
    pub transform: Option<Box<Transform>>,
    /// Once-per-invocation function.
    pub callback: Option<Box<Callback>>,
    /// Firing rule.
    pub trigger: Trigger,
    /// Scheduling priority; higher runs earlier. Ties break by creation
    /// order.
    pub priority: i16,
    /// Join mode over `sources`.
    pub join: Join,
    /// Opaque user state handed back through the frame.
    pub state: Option<Box<dyn Any + Send>>,
}

impl SystemAttr {
    /// Creates an attribute set with defaults: default program, no
    /// sources, `Loop` trigger, priority 0, inner join.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets `program` instead of the default program.
    #[must_use]
    pub fn with_program(mut self, program: ProgramId) -> Self {
        self.program = Some(program);
        self
    }

    /// Appends a source component.
    #[must_use]
    pub fn with_source(mut self, component: ComponentId) -> Self {
        self.sources.push(component);
        self
    }

    /// Appends a sink component.
    #[must_use]
    pub fn with_sink(mut self, component: ComponentId) -> Self {
        self.sinks.push(component);
        self
    }

    /// Sets the per-tuple transform.
    #[must_use]
    pub fn with_transform(
        mut self,
        f: impl Fn(&[Instance<'_>], &mut Frame<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Box::new(f));
        self
    }

    /// Sets the once-per-invocation callback.
    #[must_use]
    pub fn with_callback(mut self, f: impl Fn(&mut Frame<'_>) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Sets the firing rule.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the join mode.
    #[must_use]
    pub fn with_join(mut self, join: Join) -> Self {
        self.join = join;
        self
    }

    /// Attaches opaque user state.
    #[must_use]
    pub fn with_state(mut self, state: impl Any + Send) -> Self {
        self.state = Some(Box::new(state));
        self
    }
}

/// A registered system. Created through the universe; addressed by id.
pub struct System {
    pub(crate) id: SystemId,
    pub(crate) program: ProgramId,
    pub(crate) sources: Vec<ComponentId>,
    #[allow(dead_code)] // declarative; flushes resolve components per op
    pub(crate) sinks: Vec<ComponentId>,
    pub(crate) transform: Option<Box<Transform>>,
    pub(crate) callback: Option<Box<Callback>>,
    pub(crate) trigger: Trigger,
    pub(crate) priority: i16,
    pub(crate) join: Join,
    pub(crate) enabled: AtomicBool,
    pub(crate) state: Mutex<Box<dyn Any + Send>>,
}

impl System {
    pub(crate) fn from_attr(id: SystemId, program: ProgramId, attr: SystemAttr) -> Self {
        Self {
            id,
            program,
            sources: attr.sources,
            sinks: attr.sinks,
            transform: attr.transform,
            callback: attr.callback,
            trigger: attr.trigger,
            priority: attr.priority,
            join: attr.join,
            enabled: AtomicBool::new(true),
            state: Mutex::new(attr.state.unwrap_or_else(|| Box::new(()))),
        }
    }

    /// The system's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> SystemId {
        self.id
    }

    /// The program this system runs under.
    #[inline]
    #[must_use]
    pub const fn program(&self) -> ProgramId {
        self.program
    }

    /// Scheduling priority.
    #[inline]
    #[must_use]
    pub const fn priority(&self) -> i16 {
        self.priority
    }

    /// Returns `true` unless the system has been disabled.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// One staged mutation, recorded in request order.
#[derive(Debug)]
enum StagedOp {
    Insert {
        entity: EntityId,
        component: ComponentId,
        record: Box<[u8]>,
    },
    Remove {
        entity: EntityId,
        component: ComponentId,
    },
    Destroy {
        entity: EntityId,
    },
}

/// Collects the mutations a system requests during one invocation.
///
/// The buffer is flushed after the invocation returns and before the next
/// system runs. Flushing applies ops in request order, except that a
/// remove always wins over an insert staged in the same invocation for
/// the same `(entity, component)`.
#[derive(Debug, Default)]
pub struct StageBuffer {
    ops: Vec<StagedOp>,
}

impl StageBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stages a component insert (or overwrite) for `entity`.
    pub fn insert(&mut self, entity: EntityId, component: ComponentId, record: &[u8]) {
        self.ops.push(StagedOp::Insert {
            entity,
            component,
            record: record.into(),
        });
    }

    /// Stages a component remove for `entity`.
    pub fn remove(&mut self, entity: EntityId, component: ComponentId) {
        self.ops.push(StagedOp::Remove { entity, component });
    }

    /// Stages the destruction of `entity`.
    pub fn destroy(&mut self, entity: EntityId) {
        self.ops.push(StagedOp::Destroy { entity });
    }

    /// Returns `true` if nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every staged op. Failures are logged and skipped; one bad
    /// op must not sink the rest of the batch.
    pub(crate) fn apply(&mut self, components: &ComponentRegistry, entities: &EntityRegistry) {
        if self.ops.is_empty() {
            return;
        }
        let removed: HashSet<(EntityId, ComponentId)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                StagedOp::Remove { entity, component } => Some((*entity, *component)),
                _ => None,
            })
            .collect();

        for op in self.ops.drain(..) {
            let result = match op {
                StagedOp::Insert {
                    entity,
                    component,
                    record,
                } => {
                    if removed.contains(&(entity, component)) {
                        continue;
                    }
                    entities.add_component(components, entity, component, &record)
                }
                StagedOp::Remove { entity, component } => {
                    entities.remove_component(components, entity, component)
                }
                StagedOp::Destroy { entity } => entities.destroy(entity),
            };
            if let Err(err) = result {
                tracing::warn!(%err, "dropping staged mutation");
            }
        }
    }
}

/// Context handed to every system invocation.
pub struct Frame<'a> {
    pub(crate) tick: u64,
    pub(crate) event: Option<&'a [u8]>,
    pub(crate) state: &'a mut (dyn Any + Send),
    pub(crate) stage: &'a mut StageBuffer,
}

impl Frame<'_> {
    /// The owning program's tick counter at invocation time.
    #[inline]
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// The message being delivered, on the event-drain path.
    #[inline]
    #[must_use]
    pub fn event(&self) -> Option<&[u8]> {
        self.event
    }

    /// Downcasts the system's user state.
    #[must_use]
    pub fn state<T: 'static>(&mut self) -> Option<&mut T> {
        self.state.downcast_mut::<T>()
    }

    /// The staging handle for this invocation's mutations.
    #[inline]
    pub fn stage(&mut self) -> &mut StageBuffer {
        self.stage
    }
}
