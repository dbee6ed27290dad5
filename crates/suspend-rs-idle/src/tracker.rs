//! Per-device idle countdown.
//!
//! A [`DeviceIdleTracker`] governs one sink or source. While nothing keeps
//! the device busy it counts down the idle timeout; when the countdown
//! expires the device is suspended with [`SuspendCause::IDLE`]. Activity
//! cancels the countdown and lifts an idle suspend, and only that one: a
//! device suspended for other reasons stays suspended.
//!
//! The tracker never decides on its own when activity starts or stops. The
//! coordinator calls [`DeviceIdleTracker::restart`] once a device has become
//! idle and [`DeviceIdleTracker::resume`] once it is in use again.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{AudioBackend, DeviceId, DeviceKind};
use crate::cause::SuspendCause;
use crate::clock::Timestamp;
use crate::timer::{TimerError, TimerHandle, TimerQueue};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Failed to allocate idle timer: {0}")]
    Timer(#[from] TimerError),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// How a device's timeout property affects idle suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Use the configured global timeout.
    Default,
    Override(Duration),
    /// Never suspend this device for idleness.
    Exempt,
}

impl TimeoutPolicy {
    /// Interpret the per-device timeout property (whole seconds).
    pub fn from_property(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().parse::<i32>()) {
            Some(Ok(secs)) if secs < 0 => TimeoutPolicy::Exempt,
            Some(Ok(secs)) => {
                TimeoutPolicy::Override(Duration::from_secs(u64::from(secs.unsigned_abs())))
            }
            _ => TimeoutPolicy::Default,
        }
    }

    /// The effective timeout, `None` for exempt devices.
    pub fn resolve(self, global: Duration) -> Option<Duration> {
        match self {
            TimeoutPolicy::Default => Some(global),
            TimeoutPolicy::Override(timeout) => Some(timeout),
            TimeoutPolicy::Exempt => None,
        }
    }
}

pub struct DeviceIdleTracker {
    sink: Option<DeviceId>,
    source: Option<DeviceId>,
    timeout: Duration,
    last_use: Option<Timestamp>,
    timer: TimerHandle<DeviceId>,
}

impl std::fmt::Debug for DeviceIdleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdleTracker")
            .field("sink", &self.sink)
            .field("source", &self.source)
            .field("timeout", &self.timeout)
            .field("last_use", &self.last_use)
            .field("deadline", &self.timer.deadline())
            .finish()
    }
}

impl DeviceIdleTracker {
    /// Start tracking `device`. The countdown starts right away if nothing
    /// is using the device.
    pub fn new(
        device: DeviceId,
        timeout: Duration,
        timers: &TimerQueue<DeviceId>,
        backend: &dyn AudioBackend,
        now: Timestamp,
    ) -> Result<Self, TrackerError> {
        let kind = backend
            .device_kind(device)
            .ok_or(TrackerError::UnknownDevice(device))?;
        let timer = timers.create(device)?;
        let (sink, source) = match kind {
            DeviceKind::Sink => (Some(device), None),
            DeviceKind::Source => (None, Some(device)),
        };

        let mut tracker = Self {
            sink,
            source,
            timeout,
            last_use: None,
            timer,
        };

        if tracker
            .roles()
            .any(|(_, role)| backend.busy_stream_count(role, None) == 0)
        {
            tracker.restart(backend, now);
        }

        Ok(tracker)
    }

    fn roles(&self) -> impl Iterator<Item = (DeviceKind, DeviceId)> {
        let sink = self.sink.map(|d| (DeviceKind::Sink, d));
        let source = self.source.map(|d| (DeviceKind::Source, d));
        sink.into_iter().chain(source)
    }

    /// The device this tracker was created for.
    pub fn device(&self) -> Option<DeviceId> {
        self.sink.or(self.source)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_use(&self) -> Option<Timestamp> {
        self.last_use
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.timer.deadline()
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// The device went idle: (re)start the countdown from `now`.
    pub fn restart(&mut self, backend: &dyn AudioBackend, now: Timestamp) {
        self.last_use = Some(now);
        self.timer.arm(now.saturating_add(self.timeout));

        for (kind, device) in self.roles() {
            debug!(
                "{} {} becomes idle, timeout in {} seconds.",
                kind,
                backend.device_name(device),
                self.timeout.as_secs()
            );
        }
    }

    /// The device is in use: stop the countdown and undo an idle suspend.
    pub fn resume(&mut self, backend: &mut dyn AudioBackend) {
        self.timer.disarm();

        for (kind, device) in self.roles() {
            if !backend.suspend_causes(device).is_idle() {
                continue;
            }
            debug!(
                "{} {} becomes busy, resuming.",
                kind,
                backend.device_name(device)
            );
            if let Err(e) = backend.set_suspended(device, false, SuspendCause::IDLE) {
                warn!("Failed to resume {} {}: {}", kind, backend.device_name(device), e);
            }
        }
    }

    /// The countdown expired.
    pub fn on_timeout(&mut self, backend: &mut dyn AudioBackend) {
        self.timer.disarm();

        for (kind, device) in self.roles() {
            if backend.busy_stream_count(device, None) > 0
                || backend.suspend_causes(device).is_idle()
            {
                continue;
            }

            info!(
                "{} {} idle for too long, suspending ...",
                kind,
                backend.device_name(device)
            );
            match backend.set_suspended(device, true, SuspendCause::IDLE) {
                Ok(()) => backend.reclaim_idle_memory(),
                Err(e) => {
                    warn!("Failed to suspend {} {}: {}", kind, backend.device_name(device), e)
                }
            }
        }
    }

    /// Undo any idle suspend this tracker put in place, before it goes away.
    pub fn lift_idle_suspend(&self, backend: &mut dyn AudioBackend) {
        for (kind, device) in self.roles() {
            if !backend.suspend_causes(device).is_idle() {
                continue;
            }
            if let Err(e) = backend.set_suspended(device, false, SuspendCause::IDLE) {
                warn!("Failed to resume {} {}: {}", kind, backend.device_name(device), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StreamDirection, StreamState};
    use crate::memory::{BackendCall, MemoryBackend};

    const FIVE: Duration = Duration::from_secs(5);

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_micros(s * 1_000_000)
    }

    #[test]
    fn test_timeout_policy_parsing() {
        assert_eq!(TimeoutPolicy::from_property(None), TimeoutPolicy::Default);
        assert_eq!(
            TimeoutPolicy::from_property(Some("30")),
            TimeoutPolicy::Override(Duration::from_secs(30))
        );
        assert_eq!(
            TimeoutPolicy::from_property(Some("0")),
            TimeoutPolicy::Override(Duration::ZERO)
        );
        assert_eq!(TimeoutPolicy::from_property(Some("-1")), TimeoutPolicy::Exempt);
        assert_eq!(TimeoutPolicy::from_property(Some("soon")), TimeoutPolicy::Default);
        assert_eq!(TimeoutPolicy::Exempt.resolve(FIVE), None);
        assert_eq!(TimeoutPolicy::Default.resolve(FIVE), Some(FIVE));
    }

    #[test]
    fn test_idle_device_armed_at_construction() {
        let backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);

        let tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(1)).unwrap();

        assert_eq!(tracker.deadline(), Some(secs(6)));
        assert_eq!(tracker.last_use(), Some(secs(1)));
        assert_eq!(tracker.device(), Some(sink));
    }

    #[test]
    fn test_busy_device_not_armed_at_construction() {
        let backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        backend.add_stream(StreamDirection::Playback, sink, StreamState::Running);
        let timers = TimerQueue::with_capacity(4);

        let tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();
        assert!(!tracker.is_armed());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_timer_exhaustion_fails_construction() {
        let backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(0);

        let err = DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap_err();
        assert_eq!(err, TrackerError::Timer(TimerError::Exhausted { capacity: 0 }));
    }

    #[test]
    fn test_unknown_device_fails_construction() {
        let backend = MemoryBackend::new();
        let timers = TimerQueue::with_capacity(4);

        let err =
            DeviceIdleTracker::new(DeviceId(42), FIVE, &timers, &backend, secs(0)).unwrap_err();
        assert_eq!(err, TrackerError::UnknownDevice(DeviceId(42)));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_refused_suspend_is_retried_on_next_countdown() {
        let mut backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let mut tracker = DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        backend.set_failing(sink, true);
        assert_eq!(timers.pop_expired(secs(5)), Some(sink));
        tracker.on_timeout(&mut backend);
        assert!(!tracker.is_armed());
        assert!(!backend.suspend_causes(sink).is_idle());
        assert!(backend.calls().is_empty());

        // A resume against the refusing device is a no-op without an idle cause.
        tracker.resume(&mut backend);
        assert!(!backend.suspend_causes(sink).is_idle());

        backend.set_failing(sink, false);
        tracker.restart(&backend, secs(7));
        assert_eq!(tracker.deadline(), Some(secs(12)));
        assert_eq!(timers.pop_expired(secs(12)), Some(sink));
        tracker.on_timeout(&mut backend);
        assert_eq!(backend.suspend_causes(sink), SuspendCause::IDLE);
        assert_eq!(
            backend.count_calls(&BackendCall::Suspend { device: sink, cause: SuspendCause::IDLE }),
            1
        );
    }

    #[test]
    fn test_resume_then_restart_gives_fresh_countdown() {
        let mut backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let mut tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        tracker.resume(&mut backend);
        tracker.restart(&backend, secs(2));

        assert_eq!(timers.armed_count(), 1);
        assert_eq!(tracker.deadline(), Some(secs(7)));
    }

    #[test]
    fn test_restart_then_resume_leaves_disarmed() {
        let mut backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let mut tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        tracker.restart(&backend, secs(1));
        tracker.resume(&mut backend);
        assert!(!tracker.is_armed());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_timeout_suspends_once_and_resume_is_idempotent() {
        let mut backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let mut tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        assert_eq!(timers.pop_expired(secs(5)), Some(sink));
        tracker.on_timeout(&mut backend);
        tracker.on_timeout(&mut backend);
        assert_eq!(
            backend.take_calls(),
            vec![
                BackendCall::Suspend { device: sink, cause: SuspendCause::IDLE },
                BackendCall::ReclaimIdleMemory,
            ]
        );

        tracker.resume(&mut backend);
        tracker.resume(&mut backend);
        assert_eq!(
            backend.take_calls(),
            vec![BackendCall::Resume { device: sink, cause: SuspendCause::IDLE }]
        );
    }

    #[test]
    fn test_timeout_with_busy_streams_does_not_suspend() {
        let mut backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let mut tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        for _ in 0..3 {
            backend.add_stream(StreamDirection::Playback, sink, StreamState::Running);
            tracker.on_timeout(&mut backend);
            assert!(backend.calls().is_empty());
        }
    }

    #[test]
    fn test_resume_leaves_other_causes() {
        let mut backend = MemoryBackend::new();
        let source = backend.add_source("mic");
        backend.set_suspended(source, true, SuspendCause::USER).unwrap();
        backend.take_calls();
        let timers = TimerQueue::with_capacity(4);
        let mut tracker =
            DeviceIdleTracker::new(source, FIVE, &timers, &backend, secs(0)).unwrap();

        tracker.resume(&mut backend);
        assert!(backend.calls().is_empty());
        assert_eq!(backend.suspend_causes(source), SuspendCause::USER);
    }

    #[test]
    fn test_drop_cancels_timer() {
        let backend = MemoryBackend::new();
        let sink = backend.add_sink("speakers");
        let timers = TimerQueue::with_capacity(4);
        let tracker =
            DeviceIdleTracker::new(sink, FIVE, &timers, &backend, secs(0)).unwrap();

        drop(tracker);
        assert!(timers.is_empty());
        assert_eq!(timers.pop_expired(secs(100)), None);
    }
}
