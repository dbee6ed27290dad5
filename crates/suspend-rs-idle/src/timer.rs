//! Cancelable one-shot timers for a single-threaded event loop.
//!
//! A [`TimerQueue`] owns a bounded pool of timer slots. Each slot is held by
//! exactly one [`TimerHandle`], which arms and disarms it; dropping the
//! handle frees the slot, so a timer never outlives its owner. The loop asks
//! [`TimerQueue::next_deadline`] how long it may sleep and pulls due timers
//! with [`TimerQueue::pop_expired`], one at a time, so a timer disarmed by
//! an earlier expiry in the same turn does not fire.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;

use crate::clock::Timestamp;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer slots exhausted ({capacity} in use)")]
    Exhausted { capacity: usize },
}

struct Slot<T> {
    token: T,
    deadline: Option<Timestamp>,
}

struct QueueInner<T> {
    slots: HashMap<u64, Slot<T>>,
    next_id: u64,
    capacity: usize,
}

/// Pool of timers, each identified by a caller-chosen token.
pub struct TimerQueue<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
}

impl<T> Clone for TimerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for TimerQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TimerQueue")
            .field("slots", &inner.slots.len())
            .field("capacity", &inner.capacity)
            .finish()
    }
}

impl<T: Clone> TimerQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                slots: HashMap::new(),
                next_id: 0,
                capacity,
            })),
        }
    }

    /// Allocate a disarmed timer that yields `token` when it expires.
    pub fn create(&self, token: T) -> Result<TimerHandle<T>, TimerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.slots.len() >= inner.capacity {
            return Err(TimerError::Exhausted {
                capacity: inner.capacity,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(
            id,
            Slot {
                token,
                deadline: None,
            },
        );

        Ok(TimerHandle {
            id,
            queue: Rc::downgrade(&self.inner),
        })
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner
            .borrow()
            .slots
            .values()
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// Disarm and return the earliest timer due at `now`, if any.
    pub fn pop_expired(&self, now: Timestamp) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        let (id, _) = inner
            .slots
            .iter()
            .filter_map(|(id, slot)| slot.deadline.map(|deadline| (*id, deadline)))
            .filter(|(_, deadline)| *deadline <= now)
            .min_by_key(|(id, deadline)| (*deadline, *id))?;

        let slot = inner.slots.get_mut(&id)?;
        slot.deadline = None;
        Some(slot.token.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn armed_count(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .values()
            .filter(|slot| slot.deadline.is_some())
            .count()
    }
}

/// Exclusive owner of one timer slot.
pub struct TimerHandle<T> {
    id: u64,
    queue: Weak<RefCell<QueueInner<T>>>,
}

impl<T> TimerHandle<T> {
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot<T>) -> R) -> Option<R> {
        let queue = self.queue.upgrade()?;
        let mut inner = queue.borrow_mut();
        let result = inner.slots.get_mut(&self.id).map(f);
        result
    }

    /// Fire at `deadline`, replacing any earlier deadline.
    pub fn arm(&self, deadline: Timestamp) {
        self.with_slot(|slot| slot.deadline = Some(deadline));
    }

    pub fn disarm(&self) {
        self.with_slot(|slot| slot.deadline = None);
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.with_slot(|slot| slot.deadline).flatten()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }
}

impl<T> std::fmt::Debug for TimerHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .finish()
    }
}

impl<T> Drop for TimerHandle<T> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().slots.remove(&self.id);
        }
    }
}
