// Async event loop feeding a coordinator
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use suspend_rs_reserve::BusSignal;

use crate::backend::AudioBackend;
use crate::clock::TokioClock;
use crate::coordinator::SuspendCoordinator;
use crate::event::LifecycleEvent;

/// Input delivered to [`run`] by the audio server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverInput {
    Lifecycle(LifecycleEvent),
    Shutdown,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive `coordinator` until a shutdown is requested or the input channel
/// closes, then shut it down and return the backend.
///
/// The coordinator must have been created with a clone of `clock`, so that
/// its timer deadlines map onto tokio instants. Bus signals arrive on a
/// separate channel, typically fed by [`suspend_rs_reserve::ZbusBus::spawn_signal_pump`];
/// when that channel closes the loop keeps running without it.
pub async fn run<B: AudioBackend>(
    mut coordinator: SuspendCoordinator<B>,
    clock: TokioClock,
    mut inputs: UnboundedReceiver<DriverInput>,
    mut bus_signals: UnboundedReceiver<BusSignal>,
) -> B {
    coordinator.start();
    let mut bus_open = true;

    loop {
        let deadline = coordinator.next_deadline().map(|ts| clock.instant_at(ts));

        tokio::select! {
            biased;

            input = inputs.recv() => match input {
                Some(DriverInput::Lifecycle(event)) => {
                    debug!("Lifecycle event: {:?}", event);
                    coordinator.handle(event);
                }
                Some(DriverInput::Shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
                None => {
                    info!("Event source closed");
                    break;
                }
            },

            signal = bus_signals.recv(), if bus_open => match signal {
                Some(signal) => coordinator.handle_bus_signal(&signal),
                None => {
                    debug!("Bus signal channel closed");
                    bus_open = false;
                }
            },

            _ = sleep_until_deadline(deadline) => coordinator.dispatch_timers(),
        }
    }

    coordinator.shutdown()
}
