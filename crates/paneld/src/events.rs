//! In-process event bus.
//!
//! Components announce state changes (settings edited, display dimmed,
//! sensor readings) and control requests (sleep, wake) here instead of
//! calling each other directly. Delivery is best-effort: a listener that
//! falls behind loses the oldest events and is told how many it missed.

use tokio::sync::broadcast;
use tracing::debug;

use crate::sensors::SensorReading;

/// Capacity of the broadcast ring; slow listeners lag past this
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The settings store was edited; re-read configuration
    SettingsChanged,

    /// The broker asked for the display to dim
    SleepRequested,

    /// The broker asked for the display to wake
    WakeRequested,

    /// The display entered the dimmed state
    Dimmed,

    /// The display left the dimmed state
    Awake,

    /// A sensor produced a new raw value
    SensorChanged(SensorReading),

    /// A sensor value passed the change-significance filter
    SensorPublishWorthy(SensorReading),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Announce an event; having no listeners is not an error
    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event published with no listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
