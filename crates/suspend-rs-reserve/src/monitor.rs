// Watches who owns a device reservation name
use std::rc::Rc;
use tracing::{debug, warn};

use crate::bus::{service_name, OwnerChange, ReservationBus};
use crate::ReserveError;

pub type ChangeCallback = Box<dyn FnMut(&ReservationMonitor)>;

/// Tracks whether a device is reserved by a process other than us.
///
/// The state only changes in reaction to ownership signals handed to
/// [`ReservationMonitor::handle_owner_changed`]; [`ReservationMonitor::is_busy`]
/// never goes to the bus. Dropping the monitor removes its bus match.
pub struct ReservationMonitor {
    device_name: String,
    service_name: String,
    own_name: String,
    busy: bool,
    // `None` once the transport is lost
    bus: Option<Rc<dyn ReservationBus>>,
    callback: Option<ChangeCallback>,
}

impl std::fmt::Debug for ReservationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationMonitor")
            .field("device_name", &self.device_name)
            .field("busy", &self.busy)
            .field("connected", &self.bus.is_some())
            .finish()
    }
}

impl ReservationMonitor {
    pub fn watch(
        bus: Rc<dyn ReservationBus>,
        device_name: &str,
        callback: Option<ChangeCallback>,
    ) -> Result<Self, ReserveError> {
        if device_name.is_empty() || device_name.contains('/') {
            return Err(ReserveError::InvalidName(device_name.to_string()));
        }

        let service_name = service_name(device_name);
        let own_name = bus.unique_name().map_err(|e| match e {
            ReserveError::Name(_) => e,
            other => ReserveError::Name(other.to_string()),
        })?;

        bus.add_match(&service_name)?;
        let owner = match bus.name_owner(&service_name) {
            Ok(owner) => owner,
            Err(e) => {
                if let Err(remove_err) = bus.remove_match(&service_name) {
                    debug!("Failed to remove match for {}: {}", service_name, remove_err);
                }
                return Err(e);
            }
        };

        let busy = owned_by_other(owner.as_deref(), &own_name);
        debug!(
            "Watching reservation of {} (owner {:?}, busy {})",
            device_name, owner, busy
        );

        Ok(Self {
            device_name: device_name.to_string(),
            service_name,
            own_name,
            busy,
            bus: Some(bus),
            callback,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    pub fn set_callback(&mut self, callback: Option<ChangeCallback>) {
        self.callback = callback;
    }

    /// Apply an ownership signal. Returns `true` if the busy state flipped.
    pub fn handle_owner_changed(&mut self, change: &OwnerChange) -> bool {
        if self.bus.is_none() || change.name != self.service_name {
            return false;
        }

        let busy = owned_by_other(change.new_owner.as_deref(), &self.own_name);
        self.set_busy(busy)
    }

    /// The bus is gone for good. Fails open: the device counts as free.
    pub fn handle_transport_lost(&mut self) -> bool {
        if self.bus.take().is_none() {
            return false;
        }
        warn!(
            "Reservation transport lost, treating {} as not reserved",
            self.device_name
        );
        self.set_busy(false)
    }

    fn set_busy(&mut self, busy: bool) -> bool {
        if busy == self.busy {
            return false;
        }

        self.busy = busy;
        debug!(
            "Reservation of {} is now {}",
            self.device_name,
            if busy { "held by another process" } else { "free" }
        );

        if let Some(mut callback) = self.callback.take() {
            callback(self);
            if self.callback.is_none() {
                self.callback = Some(callback);
            }
        }
        true
    }
}

fn owned_by_other(owner: Option<&str>, own_name: &str) -> bool {
    matches!(owner, Some(owner) if !owner.is_empty() && owner != own_name)
}

impl Drop for ReservationMonitor {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.take() {
            if let Err(e) = bus.remove_match(&self.service_name) {
                debug!("Failed to remove match for {}: {}", self.service_name, e);
            }
        }
    }
}
