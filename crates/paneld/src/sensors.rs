//! Ambient light and proximity monitoring.
//!
//! The light sensor is always sampled; proximity only on models that have
//! one. Each changed value is announced as [`BusEvent::SensorChanged`], and
//! values that pass the significance filter additionally as
//! [`BusEvent::SensorPublishWorthy`].

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::DeviceModel;
use crate::device::Hardware;
use crate::events::BusEvent;
use crate::events::EventBus;

/// Relative change in lux needed before a reading is worth publishing
pub const LIGHT_PUBLISH_THRESHOLD: f32 = 0.04;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SensorKind {
    Light,
    Proximity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub value: f32,
    pub timestamp: SystemTime,
}

impl SensorReading {
    fn now(kind: SensorKind, value: f32) -> Self {
        Self {
            kind,
            value,
            timestamp: SystemTime::now(),
        }
    }
}

/// Whether a light reading differs enough from the last published one
pub fn light_publish_worthy(last_published: Option<f32>, current: f32) -> bool {
    match last_published {
        None => true,
        Some(last) if last == 0.0 => current != 0.0,
        Some(last) => ((current - last) / last).abs() >= LIGHT_PUBLISH_THRESHOLD,
    }
}

#[derive(Debug, Default)]
struct SensorState {
    last_lux: Option<f32>,
    last_published_lux: Option<f32>,
    last_distance: Option<f32>,
}

pub struct SensorMonitor {
    hardware: Arc<dyn Hardware>,
    proximity_supported: bool,
    poll_interval: Duration,
    bus: EventBus,
    state: Mutex<SensorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SensorMonitor {
    pub fn new(
        hardware: Arc<dyn Hardware>,
        model: &DeviceModel,
        poll_interval: Duration,
        bus: EventBus,
    ) -> Self {
        Self {
            hardware,
            proximity_supported: model.has_proximity_sensor,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            bus,
            state: Mutex::new(SensorState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn proximity_supported(&self) -> bool {
        self.proximity_supported
    }

    /// Last measured ambient light, 0 before the first reading
    pub fn last_lux(&self) -> f32 {
        self.state().last_lux.unwrap_or(0.0)
    }

    /// Last measured distance; reports max range (nothing near) until measured
    pub fn last_distance(&self) -> f32 {
        self.state()
            .last_distance
            .unwrap_or_else(|| self.max_range())
    }

    pub fn max_range(&self) -> f32 {
        self.hardware.proximity_max_range()
    }

    /// Record a light measurement
    pub fn on_light(&self, lux: f32) {
        let publish = {
            let mut state = self.state();
            if state.last_lux == Some(lux) {
                return;
            }
            state.last_lux = Some(lux);

            let worthy = light_publish_worthy(state.last_published_lux, lux);
            if worthy {
                state.last_published_lux = Some(lux);
            }
            worthy
        };

        let reading = SensorReading::now(SensorKind::Light, lux);
        self.bus.publish(BusEvent::SensorChanged(reading));
        if publish {
            debug!("Light reading {} is publish-worthy", lux);
            self.bus.publish(BusEvent::SensorPublishWorthy(reading));
        }
    }

    /// Record a proximity measurement; every change is publish-worthy
    pub fn on_proximity(&self, distance: f32) {
        {
            let mut state = self.state();
            if state.last_distance == Some(distance) {
                return;
            }
            state.last_distance = Some(distance);
        }

        let reading = SensorReading::now(SensorKind::Proximity, distance);
        self.bus.publish(BusEvent::SensorChanged(reading));
        self.bus.publish(BusEvent::SensorPublishWorthy(reading));
    }

    /// Start sampling the sensors
    pub fn start(self: &Arc<Self>) {
        let mut kinds = vec![SensorKind::Light];
        if self.proximity_supported {
            kinds.push(SensorKind::Proximity);
        } else {
            info!("No proximity sensor on this model");
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for kind in kinds {
            let monitor = Arc::clone(self);
            tasks.push(tokio::spawn(async move { monitor.poll(kind).await }));
        }
    }

    async fn poll(&self, kind: SensorKind) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failing = false;

        info!("Polling {} sensor every {:?}", kind, self.poll_interval);
        loop {
            interval.tick().await;

            let result = match kind {
                SensorKind::Light => self.hardware.light_level(),
                SensorKind::Proximity => self.hardware.proximity(),
            };

            match result {
                Ok(value) => {
                    failing = false;
                    match kind {
                        SensorKind::Light => self.on_light(value),
                        SensorKind::Proximity => self.on_proximity(value),
                    }
                }
                Err(e) if !failing => {
                    warn!("Failed to read {} sensor: {}", kind, e);
                    failing = true;
                }
                Err(e) => debug!("Failed to read {} sensor: {}", kind, e),
            }
        }
    }

    /// Stop sampling
    pub fn stop(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if !tasks.is_empty() {
            info!("Stopping sensor monitor");
        }
        for task in tasks {
            task.abort();
        }
    }
}
