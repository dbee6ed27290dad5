// Session bus access for device reservation names
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use zbus::blocking::fdo::DBusProxy;
use zbus::blocking::Connection;
use zbus::names::{BusName, UniqueName};
use zbus::MatchRule;

use crate::ReserveError;

pub const SERVICE_PREFIX: &str = "org.freedesktop.ReserveDevice1.";
const DBUS_NAME: &str = "org.freedesktop.DBus";

/// Well-known bus name that is owned while `device_name` is reserved.
pub fn service_name(device_name: &str) -> String {
    format!("{}{}", SERVICE_PREFIX, device_name)
}

/// Ownership of a bus name moved from `old_owner` to `new_owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

/// What the bus delivers to the reservation watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    OwnerChanged(OwnerChange),
    /// The connection is gone; no further signals will arrive.
    TransportLost,
}

/// The parts of the message bus a reservation watcher needs.
pub trait ReservationBus {
    /// Our own unique connection name.
    fn unique_name(&self) -> Result<String, ReserveError>;

    /// Current owner of `service`, `None` if nobody owns it.
    fn name_owner(&self, service: &str) -> Result<Option<String>, ReserveError>;

    /// Start receiving ownership changes of `service`.
    fn add_match(&self, service: &str) -> Result<(), ReserveError>;

    fn remove_match(&self, service: &str) -> Result<(), ReserveError>;
}

/// [`ReservationBus`] backed by a blocking zbus session connection.
pub struct ZbusBus {
    connection: Connection,
}

impl std::fmt::Debug for ZbusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZbusBus")
            .field("unique_name", &self.connection.unique_name().map(|n| n.to_string()))
            .finish()
    }
}

fn transport_error(e: impl std::fmt::Display) -> ReserveError {
    ReserveError::Transport(e.to_string())
}

impl ZbusBus {
    pub fn session() -> Result<Self, ReserveError> {
        info!("Connecting to D-Bus session bus for device reservation");
        let connection = Connection::session().map_err(transport_error)?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    fn proxy(&self) -> Result<DBusProxy<'static>, ReserveError> {
        DBusProxy::new(&self.connection).map_err(transport_error)
    }

    fn owner_changed_rule(service: &str) -> Result<MatchRule<'_>, ReserveError> {
        MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(DBUS_NAME)
            .and_then(|b| b.interface(DBUS_NAME))
            .and_then(|b| b.member("NameOwnerChanged"))
            .and_then(|b| b.arg(0, service))
            .map(|b| b.build())
            .map_err(|e| ReserveError::InvalidName(format!("{}: {}", service, e)))
    }

    /// Forward every `NameOwnerChanged` signal into `tx` from a background
    /// thread. `BusSignal::TransportLost` is sent once the stream ends.
    pub fn spawn_signal_pump(
        &self,
        tx: UnboundedSender<BusSignal>,
    ) -> Result<JoinHandle<()>, ReserveError> {
        let connection = self.connection.clone();

        std::thread::Builder::new()
            .name("reserve-bus".to_string())
            .spawn(move || {
                let proxy = match DBusProxy::new(&connection) {
                    Ok(proxy) => proxy,
                    Err(e) => {
                        warn!("Failed to create D-Bus proxy for signal pump: {}", e);
                        let _ = tx.send(BusSignal::TransportLost);
                        return;
                    }
                };
                let signals = match proxy.receive_name_owner_changed() {
                    Ok(signals) => signals,
                    Err(e) => {
                        warn!("Failed to subscribe to NameOwnerChanged: {}", e);
                        let _ = tx.send(BusSignal::TransportLost);
                        return;
                    }
                };

                for signal in signals {
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(e) => {
                            debug!("Malformed NameOwnerChanged signal: {}", e);
                            continue;
                        }
                    };
                    let old_owner: &Option<UniqueName<'_>> = args.old_owner();
                    let new_owner: &Option<UniqueName<'_>> = args.new_owner();
                    let change = OwnerChange {
                        name: args.name().to_string(),
                        old_owner: old_owner.as_ref().map(|o| o.to_string()),
                        new_owner: new_owner.as_ref().map(|o| o.to_string()),
                    };
                    if tx.send(BusSignal::OwnerChanged(change)).is_err() {
                        debug!("Reservation signal receiver closed");
                        return;
                    }
                }

                warn!("D-Bus signal stream ended, reservation watching disabled");
                let _ = tx.send(BusSignal::TransportLost);
            })
            .map_err(transport_error)
    }
}

impl ReservationBus for ZbusBus {
    fn unique_name(&self) -> Result<String, ReserveError> {
        self.connection
            .unique_name()
            .map(|name| name.to_string())
            .ok_or_else(|| ReserveError::Name("connection has no unique name".to_string()))
    }

    fn name_owner(&self, service: &str) -> Result<Option<String>, ReserveError> {
        let name = BusName::try_from(service)
            .map_err(|e| ReserveError::InvalidName(format!("{}: {}", service, e)))?;

        match self.proxy()?.get_name_owner(name) {
            Ok(owner) => Ok(Some(owner.to_string())),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => Ok(None),
            Err(e) => Err(transport_error(e)),
        }
    }

    fn add_match(&self, service: &str) -> Result<(), ReserveError> {
        let rule = Self::owner_changed_rule(service)?;
        self.proxy()?.add_match_rule(rule).map_err(transport_error)
    }

    fn remove_match(&self, service: &str) -> Result<(), ReserveError> {
        let rule = Self::owner_changed_rule(service)?;
        self.proxy()?.remove_match_rule(rule).map_err(transport_error)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name() {
        assert_eq!(service_name("Audio0"), "org.freedesktop.ReserveDevice1.Audio0");
    }

    #[test]
    fn test_owner_changed_rule_mentions_service() {
        let rule = ZbusBus::owner_changed_rule("org.freedesktop.ReserveDevice1.Audio0").unwrap();
        let text = rule.to_string();
        assert!(text.contains("NameOwnerChanged"));
        assert!(text.contains("org.freedesktop.ReserveDevice1.Audio0"));
    }
}
