// Shared per-device reservation watchers
//
// Several subsystems may care whether the same device is reserved. They all
// get the same wrapper out of the registry, keyed by device name, and each
// subscribes to the wrapper's hook instead of owning a monitor.
use std::cell::RefCell;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

use crate::bus::{BusSignal, ReservationBus};
use crate::hook::Hook;
use crate::monitor::ReservationMonitor;
use crate::shared::SharedRegistry;

const KEY_PREFIX: &str = "reservation-wrapper@";

fn wrapper_key(device_name: &str) -> String {
    format!("{}{}", KEY_PREFIX, device_name)
}

/// One device's reservation state, shared between subscribers.
///
/// The monitor is absent when there is no bus or the watch failed; such a
/// wrapper reports the device as never reserved.
pub struct ReservationWrapper {
    device_name: String,
    monitor: RefCell<Option<ReservationMonitor>>,
    hook: Hook<bool>,
}

impl std::fmt::Debug for ReservationWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationWrapper")
            .field("device_name", &self.device_name)
            .field("monitor", &self.monitor.borrow())
            .field("hook", &self.hook)
            .finish()
    }
}

impl ReservationWrapper {
    fn new(bus: Option<&Rc<dyn ReservationBus>>, device_name: &str) -> Self {
        let monitor = match bus {
            None => {
                debug!("No reservation transport, {} is unprotected", device_name);
                None
            }
            Some(bus) => match ReservationMonitor::watch(Rc::clone(bus), device_name, None) {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    warn!("Failed to watch reservation of {}: {}", device_name, e);
                    None
                }
            },
        };

        Self {
            device_name: device_name.to_string(),
            monitor: RefCell::new(monitor),
            hook: Hook::new(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_busy(&self) -> bool {
        self.monitor
            .borrow()
            .as_ref()
            .is_some_and(ReservationMonitor::is_busy)
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.borrow().is_some()
    }

    /// Fires with the new busy state on every reservation transition.
    pub fn hook(&self) -> &Hook<bool> {
        &self.hook
    }

    fn handle_signal(&self, signal: &BusSignal) {
        let changed = match self.monitor.borrow_mut().as_mut() {
            None => false,
            Some(monitor) => match signal {
                BusSignal::OwnerChanged(change) => monitor.handle_owner_changed(change),
                BusSignal::TransportLost => monitor.handle_transport_lost(),
            },
        };

        if changed {
            let busy = self.is_busy();
            self.hook.fire(&busy);
        }
    }
}

type Shared = Rc<RefCell<SharedRegistry<ReservationWrapper>>>;

/// Process-wide table of reservation wrappers. Clones share the same table.
#[derive(Clone)]
pub struct ReservationRegistry {
    bus: Option<Rc<dyn ReservationBus>>,
    shared: Shared,
}

impl std::fmt::Debug for ReservationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationRegistry")
            .field("has_bus", &self.bus.is_some())
            .field("entries", &self.shared.borrow())
            .finish()
    }
}

impl ReservationRegistry {
    pub fn new(bus: Option<Rc<dyn ReservationBus>>) -> Self {
        Self {
            bus,
            shared: Rc::new(RefCell::new(SharedRegistry::new())),
        }
    }

    /// Reference the wrapper for `device_name`, creating it on first use.
    pub fn get(&self, device_name: &str) -> ReservationRef {
        let key = wrapper_key(device_name);
        let bus = self.bus.as_ref();
        let wrapper = self
            .shared
            .borrow_mut()
            .acquire(&key, || ReservationWrapper::new(bus, device_name));

        ReservationRef {
            key,
            wrapper,
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn ref_count(&self, device_name: &str) -> usize {
        self.shared.borrow().ref_count(&wrapper_key(device_name))
    }

    pub fn len(&self) -> usize {
        self.shared.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.borrow().is_empty()
    }

    /// Feed a bus signal to every wrapper.
    ///
    /// Each wrapper is pinned by the snapshot while its hook runs, so a
    /// subscriber may drop the last reference from inside its callback.
    pub fn handle_signal(&self, signal: &BusSignal) {
        let wrappers = self.shared.borrow().values();
        for wrapper in wrappers {
            wrapper.handle_signal(signal);
        }
    }
}

/// A counted reference to a [`ReservationWrapper`]. Dropping it unrefs.
pub struct ReservationRef {
    key: String,
    wrapper: Rc<ReservationWrapper>,
    shared: Weak<RefCell<SharedRegistry<ReservationWrapper>>>,
}

impl ReservationRef {
    pub fn unref(self) {}

    /// Whether both references point at the same wrapper instance.
    pub fn ptr_eq(&self, other: &ReservationRef) -> bool {
        Rc::ptr_eq(&self.wrapper, &other.wrapper)
    }
}

impl Deref for ReservationRef {
    type Target = ReservationWrapper;

    fn deref(&self) -> &ReservationWrapper {
        &self.wrapper
    }
}

impl std::fmt::Debug for ReservationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationRef").field("key", &self.key).finish()
    }
}

impl Drop for ReservationRef {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let released = shared.borrow_mut().release(&self.key);
        if released.is_some() {
            debug!("Released reservation wrapper {}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{owner_change, FakeBus};
    use std::cell::Cell;

    fn registry_with(bus: &Rc<FakeBus>) -> ReservationRegistry {
        let bus: Rc<dyn ReservationBus> = bus.clone();
        ReservationRegistry::new(Some(bus))
    }

    #[test]
    fn test_get_shares_wrapper() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        let registry = registry_with(&bus);

        let a = registry.get("Audio0");
        let b = registry.get("Audio0");
        let c = registry.get("Audio1");

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(registry.ref_count("Audio0"), 2);
        assert_eq!(bus.matches.borrow().len(), 2);
    }

    #[test]
    fn test_unref_tears_down_once() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        let registry = registry_with(&bus);

        let a = registry.get("Audio0");
        let b = registry.get("Audio0");
        a.unref();
        assert_eq!(bus.removed.get(), 0);
        assert_eq!(registry.ref_count("Audio0"), 1);

        b.unref();
        assert_eq!(bus.removed.get(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_hook_fires_on_transition() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        let registry = registry_with(&bus);
        let wrapper = registry.get("Audio0");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let _slot = {
            let seen = Rc::clone(&seen);
            wrapper.hook().connect(move |busy| seen.borrow_mut().push(*busy))
        };

        registry.handle_signal(&owner_change("Audio0", Some(":1.42")));
        registry.handle_signal(&owner_change("Audio0", Some(":1.43")));
        registry.handle_signal(&owner_change("Audio0", None));

        assert_eq!(*seen.borrow(), vec![true, false]);
    }

    #[test]
    fn test_subscriber_drops_last_reference_in_callback() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        let registry = registry_with(&bus);

        let holder: Rc<RefCell<Option<ReservationRef>>> =
            Rc::new(RefCell::new(Some(registry.get("Audio0"))));
        let calls = Rc::new(Cell::new(0));
        let slot = {
            let held = Rc::clone(&holder);
            let calls = Rc::clone(&calls);
            let guard = holder.borrow();
            let wrapper = guard.as_ref().unwrap();
            let slot = wrapper.hook().connect(move |_| {
                calls.set(calls.get() + 1);
                held.borrow_mut().take();
            });
            slot
        };

        registry.handle_signal(&owner_change("Audio0", Some(":1.42")));

        assert_eq!(calls.get(), 1);
        assert!(registry.is_empty());
        assert_eq!(bus.removed.get(), 1);
        drop(slot);
    }

    #[test]
    fn test_no_bus_means_never_busy() {
        let registry = ReservationRegistry::new(None);
        let wrapper = registry.get("Audio0");
        assert!(!wrapper.has_monitor());
        assert!(!wrapper.is_busy());
        registry.handle_signal(&BusSignal::TransportLost);
        assert!(!wrapper.is_busy());
    }

    #[test]
    fn test_failed_watch_is_not_fatal() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        bus.fail_owner_query.set(true);
        let registry = registry_with(&bus);

        let wrapper = registry.get("Audio0");
        assert!(!wrapper.has_monitor());
        assert_eq!(registry.ref_count("Audio0"), 1);
    }

    #[test]
    fn test_transport_lost_notifies_busy_subscribers() {
        let bus = Rc::new(FakeBus::new(":1.5"));
        bus.set_owner("Audio0", ":1.9");
        let registry = registry_with(&bus);
        let wrapper = registry.get("Audio0");
        assert!(wrapper.is_busy());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let _slot = {
            let seen = Rc::clone(&seen);
            wrapper.hook().connect(move |busy| seen.borrow_mut().push(*busy))
        };
        registry.handle_signal(&BusSignal::TransportLost);

        assert_eq!(*seen.borrow(), vec![false]);
        assert!(!wrapper.is_busy());
    }
}
