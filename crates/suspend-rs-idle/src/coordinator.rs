//! Routes lifecycle events to per-device idle trackers.
//!
//! The coordinator creates a [`DeviceIdleTracker`] for every sink and every
//! real source (monitor sources never get one; their streams count against
//! the sink they mirror) and decides, per event, whether the affected
//! device just became idle or busy.
//!
//! Reservation locks are an independent input: while another process holds
//! a device's reservation, the device is suspended with
//! [`SuspendCause::RESERVATION`], and once the lock is released the device
//! starts a fresh idle countdown. Reservation hooks only post into a
//! mailbox, which the coordinator drains after every handled event.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

use suspend_rs_config::SuspendConfig;
use suspend_rs_reserve::{BusSignal, HookSlot, ReservationRef, ReservationRegistry};

use crate::backend::{
    AudioBackend, DeviceId, DeviceKind, DeviceState, StreamId, RESERVATION_PROPERTY,
    TIMEOUT_PROPERTY,
};
use crate::cause::SuspendCause;
use crate::clock::{Clock, Timestamp};
use crate::event::{LifecycleEvent, StreamInfo};
use crate::timer::TimerQueue;
use crate::tracker::{DeviceIdleTracker, TimeoutPolicy};

type Mailbox = Rc<RefCell<VecDeque<LifecycleEvent>>>;

struct ReservationBinding {
    // Declared first so the hook is disconnected before the reference is dropped.
    _slot: HookSlot<bool>,
    reservation: ReservationRef,
}

pub struct SuspendCoordinator<B: AudioBackend> {
    backend: B,
    clock: Rc<dyn Clock>,
    timers: TimerQueue<DeviceId>,
    trackers: HashMap<DeviceId, DeviceIdleTracker>,
    exempt: HashSet<DeviceId>,
    registry: ReservationRegistry,
    reservations: HashMap<DeviceId, ReservationBinding>,
    mailbox: Mailbox,
    global_timeout: Duration,
    watch_reservations: bool,
}

impl<B: AudioBackend> std::fmt::Debug for SuspendCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendCoordinator")
            .field("trackers", &self.trackers)
            .field("exempt", &self.exempt)
            .field("reservations", &self.reservations.len())
            .field("global_timeout", &self.global_timeout)
            .finish()
    }
}

impl<B: AudioBackend> SuspendCoordinator<B> {
    pub fn new(
        backend: B,
        clock: Rc<dyn Clock>,
        registry: ReservationRegistry,
        config: &SuspendConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            timers: TimerQueue::with_capacity(config.timer_capacity),
            trackers: HashMap::new(),
            exempt: HashSet::new(),
            registry,
            reservations: HashMap::new(),
            mailbox: Rc::new(RefCell::new(VecDeque::new())),
            global_timeout: config.global_timeout(),
            watch_reservations: config.reservation,
        }
    }

    /// Pick up every device the backend already has, sinks first.
    pub fn start(&mut self) {
        let devices = self.backend.devices();
        let (sinks, sources): (Vec<DeviceId>, Vec<DeviceId>) = devices
            .into_iter()
            .partition(|d| self.backend.device_kind(*d) == Some(DeviceKind::Sink));

        info!(
            "Idle suspend starting with {} sinks and {} sources, timeout {} seconds",
            sinks.len(),
            sources.len(),
            self.global_timeout.as_secs()
        );
        for device in sinks.into_iter().chain(sources) {
            self.on_device_added(device);
        }
        self.drain_mailbox();
    }

    pub fn handle(&mut self, event: LifecycleEvent) {
        self.dispatch(event);
        self.drain_mailbox();
    }

    pub fn handle_bus_signal(&mut self, signal: &BusSignal) {
        self.registry.handle_signal(signal);
        self.drain_mailbox();
    }

    /// Run the idle handler of every tracker whose countdown is due.
    pub fn dispatch_timers(&mut self) {
        let now = self.clock.now();
        while let Some(device) = self.timers.pop_expired(now) {
            match self.trackers.get_mut(&device) {
                Some(tracker) => tracker.on_timeout(&mut self.backend),
                None => debug!("Idle timer for vanished device {}", device),
            }
        }
        self.drain_mailbox();
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    fn dispatch(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::DeviceAdded(device) => self.on_device_added(device),
            LifecycleEvent::DeviceRemoved(device) => self.on_device_removed(device),
            LifecycleEvent::DeviceStateChanged { device, state } => {
                self.on_device_state_changed(device, state)
            }
            LifecycleEvent::StreamFixate(stream) => self.on_stream_fixate(&stream),
            LifecycleEvent::StreamUnlink(stream) => self.on_stream_unlink(&stream),
            LifecycleEvent::StreamMoveStart(stream) => self.on_stream_move_start(&stream),
            LifecycleEvent::StreamMoveFinish(stream) => self.on_stream_move_finish(&stream),
            LifecycleEvent::StreamStateChanged(stream) => self.on_stream_state_changed(&stream),
            LifecycleEvent::ReservationChanged { device, busy } => {
                self.on_reservation_changed(device, busy)
            }
        }
    }

    fn drain_mailbox(&mut self) {
        loop {
            let next = self.mailbox.borrow_mut().pop_front();
            match next {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    pub fn on_device_added(&mut self, device: DeviceId) {
        if self.trackers.contains_key(&device) || self.exempt.contains(&device) {
            debug!("Device {} is already managed", device);
            return;
        }

        let Some(kind) = self.backend.device_kind(device) else {
            warn!("Not managing unknown device {}", device);
            return;
        };
        let name = self.backend.device_name(device);

        if kind == DeviceKind::Source && self.backend.monitor_of(device).is_some() {
            debug!("Source {} is a monitor, its sink governs it", name);
            return;
        }

        self.bind_reservation(device);

        let property = self.backend.property(device, TIMEOUT_PROPERTY);
        let policy = TimeoutPolicy::from_property(property.as_deref());
        let Some(timeout) = policy.resolve(self.global_timeout) else {
            info!("{} {} is exempt from idle suspend", kind, name);
            self.exempt.insert(device);
            return;
        };

        let now = self.clock.now();
        match DeviceIdleTracker::new(device, timeout, &self.timers, &self.backend, now) {
            Ok(tracker) => {
                debug!(
                    "Tracking {} {} with a {} second timeout",
                    kind,
                    name,
                    timeout.as_secs()
                );
                self.trackers.insert(device, tracker);
            }
            Err(e) => warn!("Not suspending {} {} on idle: {}", kind, name, e),
        }
    }

    pub fn on_device_removed(&mut self, device: DeviceId) {
        let tracked = self.trackers.remove(&device).is_some();
        let exempt = self.exempt.remove(&device);
        let reserved = self.reservations.remove(&device).is_some();
        if tracked || exempt || reserved {
            debug!("Device {} removed, no longer managed", device);
        }
    }

    fn bind_reservation(&mut self, device: DeviceId) {
        if !self.watch_reservations {
            return;
        }
        let Some(name) = self.backend.property(device, RESERVATION_PROPERTY) else {
            return;
        };

        let reservation = self.registry.get(&name);
        let mailbox = Rc::clone(&self.mailbox);
        let slot = reservation.hook().connect(move |busy| {
            mailbox
                .borrow_mut()
                .push_back(LifecycleEvent::ReservationChanged { device, busy: *busy });
        });

        if reservation.is_busy() {
            self.mailbox
                .borrow_mut()
                .push_back(LifecycleEvent::ReservationChanged { device, busy: true });
        }
        self.reservations.insert(
            device,
            ReservationBinding {
                _slot: slot,
                reservation,
            },
        );
    }

    /// The device a stream's activity is accounted to: monitor sources
    /// resolve to their sink.
    fn resolve(&self, stream: &StreamInfo) -> Option<DeviceId> {
        let device = stream.device?;
        Some(self.backend.monitor_of(device).unwrap_or(device))
    }

    fn is_idle(&self, device: DeviceId, ignore: Option<StreamId>) -> bool {
        self.backend.busy_stream_count(device, ignore) == 0
    }

    fn restart_if_idle(&mut self, device: DeviceId, ignore: Option<StreamId>) {
        if !self.is_idle(device, ignore) {
            return;
        }
        let now = self.clock.now();
        if let Some(tracker) = self.trackers.get_mut(&device) {
            tracker.restart(&self.backend, now);
        }
    }

    fn resume(&mut self, device: DeviceId) {
        if let Some(tracker) = self.trackers.get_mut(&device) {
            tracker.resume(&mut self.backend);
        }
    }

    /// A stream is being set up. The device is resumed even for streams
    /// that start corked, since their setup needs the device parameters;
    /// if nothing ends up using it, the countdown starts over.
    pub fn on_stream_fixate(&mut self, stream: &StreamInfo) {
        let Some(device) = self.resolve(stream) else {
            return;
        };
        let now = self.clock.now();
        let Some(tracker) = self.trackers.get_mut(&device) else {
            return;
        };

        tracker.resume(&mut self.backend);
        if self.backend.busy_stream_count(device, None) == 0 {
            tracker.restart(&self.backend, now);
        }
    }

    pub fn on_stream_unlink(&mut self, stream: &StreamInfo) {
        if let Some(device) = self.resolve(stream) {
            self.restart_if_idle(device, Some(stream.id));
        }
    }

    pub fn on_stream_move_start(&mut self, stream: &StreamInfo) {
        if let Some(device) = self.resolve(stream) {
            self.restart_if_idle(device, Some(stream.id));
        }
    }

    pub fn on_stream_move_finish(&mut self, stream: &StreamInfo) {
        if !stream.state.is_active(stream.direction) {
            return;
        }
        if let Some(device) = self.resolve(stream) {
            self.resume(device);
        }
    }

    pub fn on_stream_state_changed(&mut self, stream: &StreamInfo) {
        if !stream.state.is_active(stream.direction) {
            return;
        }
        if let Some(device) = self.resolve(stream) {
            self.resume(device);
        }
    }

    pub fn on_device_state_changed(&mut self, device: DeviceId, state: DeviceState) {
        if state.is_opened() {
            self.restart_if_idle(device, None);
        }
    }

    pub fn on_reservation_changed(&mut self, device: DeviceId, busy: bool) {
        if !self.reservations.contains_key(&device) {
            debug!("Reservation change for unmanaged device {}", device);
            return;
        }
        let name = self.backend.device_name(device);

        if busy {
            info!("{} is reserved by another process, suspending", name);
        } else {
            info!("Reservation of {} released", name);
        }
        if let Err(e) = self
            .backend
            .set_suspended(device, busy, SuspendCause::RESERVATION)
        {
            warn!("Failed to apply reservation state to {}: {}", name, e);
        }

        if !busy {
            self.restart_if_idle(device, None);
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn tracker(&self, device: DeviceId) -> Option<&DeviceIdleTracker> {
        self.trackers.get(&device)
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_exempt(&self, device: DeviceId) -> bool {
        self.exempt.contains(&device)
    }

    pub fn reservation(&self, device: DeviceId) -> Option<&ReservationRef> {
        self.reservations
            .get(&device)
            .map(|binding| &binding.reservation)
    }

    pub fn timers(&self) -> &TimerQueue<DeviceId> {
        &self.timers
    }

    /// Lift the idle and reservation suspends this coordinator caused,
    /// release every tracker and reservation, and hand the backend back.
    pub fn shutdown(mut self) -> B {
        info!("Idle suspend shutting down");
        for (_, tracker) in self.trackers.drain() {
            tracker.lift_idle_suspend(&mut self.backend);
        }
        for (device, _binding) in self.reservations.drain() {
            if !self
                .backend
                .suspend_causes(device)
                .contains(SuspendCause::RESERVATION)
            {
                continue;
            }
            if let Err(e) = self
                .backend
                .set_suspended(device, false, SuspendCause::RESERVATION)
            {
                warn!(
                    "Failed to lift reservation suspend of {}: {}",
                    self.backend.device_name(device),
                    e
                );
            }
        }
        self.mailbox.borrow_mut().clear();
        self.backend
    }
}
