//! Suspend audio sinks and sources that have been idle for too long.
//!
//! Every sink and every source that is not a monitor gets a
//! [`DeviceIdleTracker`]. When the last stream using a device goes away the
//! tracker starts counting down; once the timeout passes the device is
//! suspended with [`SuspendCause::IDLE`]. New activity lifts that suspend.
//!
//! Devices may additionally carry a reservation name. While another
//! process owns the reservation the device stays suspended with
//! [`SuspendCause::RESERVATION`].
//!
//! The engine is single threaded. [`SuspendCoordinator`] is fed events
//! synchronously; [`driver::run`] wraps it in a tokio loop that also owns
//! the timer deadlines.

pub mod backend;
pub mod cause;
pub mod clock;
pub mod coordinator;
pub mod driver;
pub mod event;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod timer;
pub mod tracker;

pub use backend::{
    AudioBackend, BackendError, DeviceId, DeviceKind, DeviceState, StreamId, RESERVATION_PROPERTY,
    TIMEOUT_PROPERTY,
};
pub use cause::SuspendCause;
pub use clock::{Clock, ManualClock, Timestamp, TokioClock};
pub use coordinator::SuspendCoordinator;
pub use driver::{run, DriverInput};
pub use event::{LifecycleEvent, StreamDirection, StreamInfo, StreamState};
#[cfg(any(test, feature = "testing"))]
pub use memory::{BackendCall, MemoryBackend};
pub use timer::{TimerError, TimerHandle, TimerQueue};
pub use tracker::{DeviceIdleTracker, TimeoutPolicy, TrackerError};
