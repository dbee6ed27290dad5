//! Shared helpers for the idle suspend integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use suspend_rs_config::SuspendConfig;
use suspend_rs_idle::{ManualClock, MemoryBackend, SuspendCoordinator};
use suspend_rs_reserve::bus::service_name;
use suspend_rs_reserve::{BusSignal, OwnerChange, ReservationBus, ReservationRegistry, ReserveError};

pub const SEC: u64 = 1_000_000;

/// Route engine logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Session bus stand-in with a mutable owner table.
#[derive(Debug)]
pub struct TestBus {
    pub own_name: String,
    pub owners: RefCell<HashMap<String, String>>,
}

impl TestBus {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            own_name: ":1.1".to_string(),
            owners: RefCell::new(HashMap::new()),
        })
    }

    /// Give `device_name` to `owner` and return the matching signal.
    pub fn claim(&self, device_name: &str, owner: &str) -> BusSignal {
        self.owners
            .borrow_mut()
            .insert(service_name(device_name), owner.to_string());
        BusSignal::OwnerChanged(OwnerChange {
            name: service_name(device_name),
            old_owner: None,
            new_owner: Some(owner.to_string()),
        })
    }

    pub fn release(&self, device_name: &str) -> BusSignal {
        let old_owner = self.owners.borrow_mut().remove(&service_name(device_name));
        BusSignal::OwnerChanged(OwnerChange {
            name: service_name(device_name),
            old_owner,
            new_owner: None,
        })
    }
}

impl ReservationBus for TestBus {
    fn unique_name(&self) -> Result<String, ReserveError> {
        Ok(self.own_name.clone())
    }

    fn name_owner(&self, service: &str) -> Result<Option<String>, ReserveError> {
        Ok(self.owners.borrow().get(service).cloned())
    }

    fn add_match(&self, _service: &str) -> Result<(), ReserveError> {
        Ok(())
    }

    fn remove_match(&self, _service: &str) -> Result<(), ReserveError> {
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: SuspendCoordinator<MemoryBackend>,
    pub backend: MemoryBackend,
    pub clock: ManualClock,
    pub registry: ReservationRegistry,
}

impl Harness {
    pub fn new(bus: Option<Rc<TestBus>>) -> Self {
        Self::with_config(bus, &SuspendConfig::default())
    }

    pub fn with_config(bus: Option<Rc<TestBus>>, config: &SuspendConfig) -> Self {
        init_tracing();
        let backend = MemoryBackend::new();
        let clock = ManualClock::new();
        let bus = bus.map(|bus| bus as Rc<dyn ReservationBus>);
        let registry = ReservationRegistry::new(bus);
        let coordinator = SuspendCoordinator::new(
            backend.clone(),
            Rc::new(clock.clone()),
            registry.clone(),
            config,
        );
        Self {
            coordinator,
            backend,
            clock,
            registry,
        }
    }

    /// Move the clock to `secs` and run whatever timers are due.
    pub fn at(&mut self, secs: u64) {
        self.clock
            .set(suspend_rs_idle::Timestamp::from_micros(secs * SEC));
        self.coordinator.dispatch_timers();
    }
}
