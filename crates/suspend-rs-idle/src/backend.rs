// The audio server as seen by the idle suspend engine
use std::fmt;
use thiserror::Error;

use crate::cause::SuspendCause;

/// Device property overriding the idle timeout, in seconds. Negative values
/// exempt the device from idle suspend.
pub const TIMEOUT_PROPERTY: &str = "module-suspend-on-idle.timeout";

/// Device property naming the reservation lock that guards the device.
pub const RESERVATION_PROPERTY: &str = "device.reservation.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Sink,
    Source,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Sink => f.write_str("Sink"),
            DeviceKind::Source => f.write_str("Source"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Running,
    Idle,
    Suspended,
    Unlinked,
}

impl DeviceState {
    /// Whether the device is open (running or idle, not suspended).
    pub fn is_opened(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Idle)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Failed to change suspend state of {device}: {reason}")]
    SuspendFailed { device: DeviceId, reason: String },
}

/// Operations the engine needs from the audio server.
pub trait AudioBackend {
    /// Every sink and source currently known.
    fn devices(&self) -> Vec<DeviceId>;

    fn device_kind(&self, device: DeviceId) -> Option<DeviceKind>;

    /// Human readable name, used for logging.
    fn device_name(&self, device: DeviceId) -> String;

    /// The sink a monitor source mirrors, `None` for anything else.
    fn monitor_of(&self, source: DeviceId) -> Option<DeviceId>;

    /// Streams currently keeping `device` from being suspended. For a sink
    /// this includes recordings from its monitor source. `ignore` is left
    /// out of the count.
    fn busy_stream_count(&self, device: DeviceId, ignore: Option<StreamId>) -> u32;

    fn suspend_causes(&self, device: DeviceId) -> SuspendCause;

    /// Set or clear `cause` on `device`. Other causes are untouched.
    fn set_suspended(
        &mut self,
        device: DeviceId,
        suspend: bool,
        cause: SuspendCause,
    ) -> Result<(), BackendError>;

    fn property(&self, device: DeviceId, key: &str) -> Option<String>;

    /// Hint that idle memory may be returned to the system.
    fn reclaim_idle_memory(&mut self);
}
