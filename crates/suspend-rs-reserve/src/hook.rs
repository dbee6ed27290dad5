//! Multi-subscriber notification points.
//!
//! A [`Hook`] fans one event out to every connected callback. Dispatch runs
//! over a snapshot of the subscriber list, so callbacks may connect new
//! subscribers or drop their own (or anyone's) [`HookSlot`] mid-dispatch.
//! A subscriber dropped during dispatch is not called afterwards.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::warn;

type Callback<A> = Rc<RefCell<dyn FnMut(&A)>>;

struct HookInner<A> {
    next_id: u64,
    slots: Vec<(u64, Callback<A>)>,
}

pub struct Hook<A> {
    inner: Rc<RefCell<HookInner<A>>>,
}

impl<A> Clone for Hook<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Hook<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("subscribers", &self.inner.borrow().slots.len())
            .finish()
    }
}

impl<A: 'static> Default for Hook<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> Hook<A> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(HookInner {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Subscribe `callback`. It stays connected until the returned slot is dropped.
    #[must_use = "dropping the slot disconnects the callback"]
    pub fn connect<F>(&self, callback: F) -> HookSlot<A>
    where
        F: FnMut(&A) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;

        let callback: Callback<A> = Rc::new(RefCell::new(callback));
        inner.slots.push((id, callback));

        HookSlot {
            id,
            hook: Rc::downgrade(&self.inner),
        }
    }

    /// Invoke every subscriber with `payload`, in connection order.
    pub fn fire(&self, payload: &A) {
        let snapshot: Vec<(u64, Callback<A>)> = self
            .inner
            .borrow()
            .slots
            .iter()
            .map(|(id, callback)| (*id, Rc::clone(callback)))
            .collect();

        for (id, callback) in snapshot {
            if !self.is_connected(id) {
                continue;
            }
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(payload),
                Err(_) => warn!("Hook subscriber {} re-entered its own dispatch, skipped", id),
            }
        }
    }

    fn is_connected(&self, id: u64) -> bool {
        self.inner.borrow().slots.iter().any(|(slot, _)| *slot == id)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Subscription handle returned by [`Hook::connect`].
pub struct HookSlot<A> {
    id: u64,
    hook: Weak<RefCell<HookInner<A>>>,
}

impl<A> HookSlot<A> {
    pub fn disconnect(self) {}
}

impl<A> std::fmt::Debug for HookSlot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSlot").field("id", &self.id).finish()
    }
}

impl<A> Drop for HookSlot<A> {
    fn drop(&mut self) {
        if let Some(inner) = self.hook.upgrade() {
            inner.borrow_mut().slots.retain(|(id, _)| *id != self.id);
        }
    }
}
