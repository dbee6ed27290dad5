//! In-memory audio server model.
//!
//! [`MemoryBackend`] keeps sinks, sources and streams in plain maps and
//! records every suspend request it receives. Clones share state, so a
//! test can hand one clone to a coordinator and inspect the other.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::backend::{AudioBackend, BackendError, DeviceId, DeviceKind, DeviceState, StreamId};
use crate::cause::SuspendCause;
use crate::event::{StreamDirection, StreamInfo, StreamState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Suspend { device: DeviceId, cause: SuspendCause },
    Resume { device: DeviceId, cause: SuspendCause },
    ReclaimIdleMemory,
}

#[derive(Debug)]
struct MemoryDevice {
    name: String,
    kind: DeviceKind,
    monitor_of: Option<DeviceId>,
    monitor_source: Option<DeviceId>,
    properties: HashMap<String, String>,
    causes: SuspendCause,
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: BTreeMap<DeviceId, MemoryDevice>,
    streams: BTreeMap<StreamId, StreamInfo>,
    calls: Vec<BackendCall>,
    failing: HashSet<DeviceId>,
    next_device: u32,
    next_stream: u32,
}

impl MemoryState {
    fn insert_device(
        &mut self,
        name: &str,
        kind: DeviceKind,
        monitor_of: Option<DeviceId>,
    ) -> DeviceId {
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        self.devices.insert(
            id,
            MemoryDevice {
                name: name.to_string(),
                kind,
                monitor_of,
                monitor_source: None,
                properties: HashMap::new(),
                causes: SuspendCause::empty(),
            },
        );
        id
    }

    fn busy_on(&self, device: DeviceId, ignore: Option<StreamId>) -> u32 {
        let count = self
            .streams
            .values()
            .filter(|s| s.device == Some(device) && Some(s.id) != ignore)
            .filter(|s| s.state.is_active(s.direction))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink together with its `<name>.monitor` source.
    pub fn add_sink(&self, name: &str) -> DeviceId {
        let mut state = self.state.borrow_mut();
        let sink = state.insert_device(name, DeviceKind::Sink, None);
        let monitor_name = format!("{}.monitor", name);
        let monitor = state.insert_device(&monitor_name, DeviceKind::Source, Some(sink));
        if let Some(device) = state.devices.get_mut(&sink) {
            device.monitor_source = Some(monitor);
        }
        sink
    }

    pub fn add_source(&self, name: &str) -> DeviceId {
        self.state
            .borrow_mut()
            .insert_device(name, DeviceKind::Source, None)
    }

    pub fn monitor_source(&self, sink: DeviceId) -> Option<DeviceId> {
        self.state
            .borrow()
            .devices
            .get(&sink)
            .and_then(|device| device.monitor_source)
    }

    /// Remove a device (and a sink's monitor). Streams on it are detached.
    pub fn remove_device(&self, device: DeviceId) {
        let mut state = self.state.borrow_mut();
        let Some(removed) = state.devices.remove(&device) else {
            return;
        };
        let mut gone = vec![device];
        if let Some(monitor) = removed.monitor_source {
            state.devices.remove(&monitor);
            gone.push(monitor);
        }
        for stream in state.streams.values_mut() {
            if stream.device.is_some_and(|d| gone.contains(&d)) {
                stream.device = None;
            }
        }
    }

    pub fn set_property(&self, device: DeviceId, key: &str, value: &str) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device) {
            device.properties.insert(key.to_string(), value.to_string());
        }
    }

    pub fn add_stream(
        &self,
        direction: StreamDirection,
        device: DeviceId,
        stream_state: StreamState,
    ) -> StreamInfo {
        let mut state = self.state.borrow_mut();
        let id = StreamId(state.next_stream);
        state.next_stream += 1;
        let info = StreamInfo {
            id,
            direction,
            device: Some(device),
            state: stream_state,
        };
        state.streams.insert(id, info);
        info
    }

    pub fn stream(&self, stream: StreamId) -> Option<StreamInfo> {
        self.state.borrow().streams.get(&stream).copied()
    }

    pub fn set_stream_state(
        &self,
        stream: StreamId,
        stream_state: StreamState,
    ) -> Option<StreamInfo> {
        let mut state = self.state.borrow_mut();
        let info = state.streams.get_mut(&stream)?;
        info.state = stream_state;
        Some(*info)
    }

    pub fn move_stream(&self, stream: StreamId, to: DeviceId) -> Option<StreamInfo> {
        let mut state = self.state.borrow_mut();
        let info = state.streams.get_mut(&stream)?;
        info.device = Some(to);
        Some(*info)
    }

    /// Drop a stream, returning its last snapshot marked as unlinked.
    pub fn remove_stream(&self, stream: StreamId) -> Option<StreamInfo> {
        let mut info = self.state.borrow_mut().streams.remove(&stream)?;
        info.state = StreamState::Unlinked;
        Some(info)
    }

    pub fn device_state(&self, device: DeviceId) -> DeviceState {
        let state = self.state.borrow();
        match state.devices.get(&device) {
            None => DeviceState::Unlinked,
            Some(d) if !d.causes.is_empty() => DeviceState::Suspended,
            Some(_) if self.busy_stream_count(device, None) > 0 => DeviceState::Running,
            Some(_) => DeviceState::Idle,
        }
    }

    /// Make suspend requests for `device` fail.
    pub fn set_failing(&self, device: DeviceId, failing: bool) {
        let mut state = self.state.borrow_mut();
        if failing {
            state.failing.insert(device);
        } else {
            state.failing.remove(&device);
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.borrow().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut self.state.borrow_mut().calls)
    }

    pub fn count_calls(&self, call: &BackendCall) -> usize {
        self.state.borrow().calls.iter().filter(|c| *c == call).count()
    }
}

impl AudioBackend for MemoryBackend {
    fn devices(&self) -> Vec<DeviceId> {
        self.state.borrow().devices.keys().copied().collect()
    }

    fn device_kind(&self, device: DeviceId) -> Option<DeviceKind> {
        self.state.borrow().devices.get(&device).map(|d| d.kind)
    }

    fn device_name(&self, device: DeviceId) -> String {
        self.state
            .borrow()
            .devices
            .get(&device)
            .map_or_else(|| device.to_string(), |d| d.name.clone())
    }

    fn monitor_of(&self, source: DeviceId) -> Option<DeviceId> {
        self.state
            .borrow()
            .devices
            .get(&source)
            .and_then(|d| d.monitor_of)
    }

    fn busy_stream_count(&self, device: DeviceId, ignore: Option<StreamId>) -> u32 {
        let state = self.state.borrow();
        let Some(d) = state.devices.get(&device) else {
            return 0;
        };
        let own = state.busy_on(device, ignore);
        let monitor = d
            .monitor_source
            .map_or(0, |monitor| state.busy_on(monitor, ignore));
        own.saturating_add(monitor)
    }

    fn suspend_causes(&self, device: DeviceId) -> SuspendCause {
        self.state
            .borrow()
            .devices
            .get(&device)
            .map_or(SuspendCause::empty(), |d| d.causes)
    }

    fn set_suspended(
        &mut self,
        device: DeviceId,
        suspend: bool,
        cause: SuspendCause,
    ) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        if state.failing.contains(&device) {
            return Err(BackendError::SuspendFailed {
                device,
                reason: "device refused".to_string(),
            });
        }
        let d = state
            .devices
            .get_mut(&device)
            .ok_or(BackendError::UnknownDevice(device))?;
        d.causes.set(cause, suspend);

        let call = if suspend {
            BackendCall::Suspend { device, cause }
        } else {
            BackendCall::Resume { device, cause }
        };
        state.calls.push(call);
        Ok(())
    }

    fn property(&self, device: DeviceId, key: &str) -> Option<String> {
        self.state
            .borrow()
            .devices
            .get(&device)
            .and_then(|d| d.properties.get(key).cloned())
    }

    fn reclaim_idle_memory(&mut self) {
        self.state
            .borrow_mut()
            .calls
            .push(BackendCall::ReclaimIdleMemory);
    }
}
