// Device and stream lifecycle notifications
use crate::backend::{DeviceId, DeviceState, StreamId};

/// Playback streams feed a sink, record streams read from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Playback,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Corked,
    Running,
    /// Playback only: all queued data has been played.
    Drained,
    Unlinked,
}

impl StreamState {
    /// Whether a stream in this state keeps its device busy.
    pub fn is_active(self, direction: StreamDirection) -> bool {
        match self {
            StreamState::Running => true,
            StreamState::Drained => direction == StreamDirection::Playback,
            StreamState::Init | StreamState::Corked | StreamState::Unlinked => false,
        }
    }
}

/// Snapshot of a stream at the time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub direction: StreamDirection,
    /// The device the stream is attached to, if any.
    pub device: Option<DeviceId>,
    pub state: StreamState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    DeviceStateChanged { device: DeviceId, state: DeviceState },
    /// A stream is being set up on `device`; its parameters are being fixed.
    StreamFixate(StreamInfo),
    StreamUnlink(StreamInfo),
    /// A stream is about to leave its current device.
    StreamMoveStart(StreamInfo),
    /// A stream has arrived on its new device.
    StreamMoveFinish(StreamInfo),
    StreamStateChanged(StreamInfo),
    ReservationChanged { device: DeviceId, busy: bool },
}
