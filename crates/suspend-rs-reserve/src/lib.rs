//! Device reservation monitoring.
//!
//! Another process may claim exclusive use of an audio device by owning the
//! `org.freedesktop.ReserveDevice1.<device>` name on the session bus. This
//! crate watches those names and shares one watcher per device between any
//! number of interested subscribers.

pub mod bus;
pub mod hook;
pub mod monitor;
pub mod shared;
pub mod wrapper;

use thiserror::Error;

pub use bus::{BusSignal, OwnerChange, ReservationBus, ZbusBus};
pub use hook::{Hook, HookSlot};
pub use monitor::ReservationMonitor;
pub use shared::SharedRegistry;
pub use wrapper::{ReservationRef, ReservationRegistry, ReservationWrapper};

/// Error types for reservation operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    #[error("Bus transport unavailable: {0}")]
    Transport(String),

    #[error("Bus name query failed: {0}")]
    Name(String),

    #[error("Invalid device name: {0:?}")]
    InvalidName(String),
}
