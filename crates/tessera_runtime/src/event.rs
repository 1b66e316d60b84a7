//! # Event Bus
//!
//! Typed message channels between systems and programs.
//!
//! ## Delivery
//!
//! - **Buffered** (`send`): the message is copied into the event's bounded
//!   MPSC ring and delivered during the owning program's next drain phase,
//!   FIFO per event. A full ring fails the send with `EventQueueFull`;
//!   the sender decides whether to retry or drop.
//! - **Synchronous** (`send_sync` on the universe): subscribers run inline
//!   on the caller's thread before the send returns. Re-entering an event
//!   already being dispatched on the same thread is detected and refused.
//!
//! Cross-program and cross-thread producers use a [`Channel`], a cloneable
//! sender bound to one event.

use std::cell::RefCell;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use crate::error::{RuntimeError, RuntimeResult};
use crate::program::ProgramId;
use crate::system::SystemId;

/// Identifier of an event, assigned in creation order across the universe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EventId(pub u64);

/// Everything needed to create an event.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventAttr {
    /// Program that owns (and drains) the event; `None` targets the
    /// default program.
    pub program: Option<ProgramId>,
    /// Fixed size of every message, in bytes. Must be non-zero.
    pub message_size: usize,
}

impl EventAttr {
    /// Creates an attribute set for `message_size`-byte messages on the
    /// default program.
    #[must_use]
    pub fn new(message_size: usize) -> Self {
        Self {
            program: None,
            message_size,
        }
    }

    /// Targets `program` instead of the default program.
    #[must_use]
    pub fn with_program(mut self, program: ProgramId) -> Self {
        self.program = Some(program);
        self
    }
}

/// A typed message channel owned by one program.
pub struct Event {
    id: EventId,
    program: ProgramId,
    message_size: usize,
    tx: Sender<Box<[u8]>>,
    rx: Receiver<Box<[u8]>>,
    subscribers: RwLock<Vec<SystemId>>,
}

impl Event {
    pub(crate) fn new(id: EventId, program: ProgramId, message_size: usize, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            id,
            program,
            message_size,
            tx,
            rx,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The event's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// The program that drains this event.
    #[inline]
    #[must_use]
    pub const fn program(&self) -> ProgramId {
        self.program
    }

    /// Fixed message size in bytes.
    #[inline]
    #[must_use]
    pub const fn message_size(&self) -> usize {
        self.message_size
    }

    /// Number of buffered messages waiting to be drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn check_size(&self, message: &[u8]) -> RuntimeResult<()> {
        if message.len() != self.message_size {
            return Err(RuntimeError::MessageSize {
                expected: self.message_size,
                got: message.len(),
            });
        }
        Ok(())
    }

    /// Copies `message` into the ring for the next drain.
    ///
    /// # Errors
    ///
    /// `MessageSize` for a wrong-length payload; `EventQueueFull` when the
    /// ring is at capacity.
    pub(crate) fn enqueue(&self, message: &[u8]) -> RuntimeResult<()> {
        self.check_size(message)?;
        match self.tx.try_send(message.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::EventQueueFull(self.id)),
            // The registry owns the receiver for the event's lifetime.
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::UnknownEvent(self.id)),
        }
    }

    /// Pops one buffered message, if any.
    pub(crate) fn dequeue(&self) -> Option<Box<[u8]>> {
        self.rx.try_recv().ok()
    }

    /// Adds `system` to the subscriber table. Idempotent.
    pub(crate) fn subscribe(&self, system: SystemId) {
        let mut subscribers = self.subscribers.write();
        if !subscribers.contains(&system) {
            subscribers.push(system);
        }
    }

    /// Removes `system` from the subscriber table. Idempotent.
    pub(crate) fn unsubscribe(&self, system: SystemId) {
        self.subscribers.write().retain(|&id| id != system);
    }

    /// Snapshot of the subscriber table, in subscription order.
    pub(crate) fn subscribers(&self) -> Vec<SystemId> {
        self.subscribers.read().clone()
    }

    /// Creates a cross-thread sender bound to this event.
    pub(crate) fn channel(&self) -> Channel {
        Channel {
            event: self.id,
            message_size: self.message_size,
            tx: self.tx.clone(),
        }
    }
}

/// A cloneable producer handle for one event's buffered queue.
///
/// Channels work from any thread and keep working while the owning program
/// is detached; delivery still happens on that program's drain phase.
#[derive(Clone)]
pub struct Channel {
    event: EventId,
    message_size: usize,
    tx: Sender<Box<[u8]>>,
}

impl Channel {
    /// The event this channel feeds.
    #[inline]
    #[must_use]
    pub const fn event(&self) -> EventId {
        self.event
    }

    /// Copies `message` into the event's ring.
    ///
    /// # Errors
    ///
    /// `MessageSize` for a wrong-length payload; `EventQueueFull` when the
    /// ring is at capacity.
    pub fn send(&self, message: &[u8]) -> RuntimeResult<()> {
        if message.len() != self.message_size {
            return Err(RuntimeError::MessageSize {
                expected: self.message_size,
                got: message.len(),
            });
        }
        match self.tx.try_send(message.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::EventQueueFull(self.event)),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::UnknownEvent(self.event)),
        }
    }
}

thread_local! {
    /// Events currently being synchronously dispatched on this thread.
    static SYNC_IN_FLIGHT: RefCell<Vec<EventId>> = const { RefCell::new(Vec::new()) };
}

/// RAII marker for a synchronous dispatch in progress on this thread.
///
/// Construction fails if the event is already on this thread's dispatch
/// stack; that is a reentrant send, which would otherwise recurse without
/// bound.
#[derive(Debug)]
pub(crate) struct SyncGuard {
    event: EventId,
}

impl SyncGuard {
    pub(crate) fn enter(event: EventId) -> RuntimeResult<Self> {
        SYNC_IN_FLIGHT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&event) {
                return Err(RuntimeError::ReentrantSend(event));
            }
            stack.push(event);
            Ok(Self { event })
        })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        SYNC_IN_FLIGHT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(top) = stack.iter().rposition(|&id| id == self.event) {
                stack.remove(top);
            }
        });
    }
}
