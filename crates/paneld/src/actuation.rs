//! Screen power: the idle timer and the awake/dimmed state machine.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Hardware;
use crate::events::BusEvent;
use crate::events::EventBus;
use crate::mqtt::SessionManager;
use crate::sensors::SensorMonitor;
use crate::settings::SettingsStore;
use crate::settings::keys;

/// At or below this lux the display runs at minimum brightness
pub const LUX_FLOOR: f32 = 30.0;

/// At or above this lux the display runs at full brightness
pub const LUX_CEILING: f32 = 500.0;

/// How close (relative to max range) something must be to count as present
const PROXIMITY_MARGIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DimState {
    Awake,
    Dimmed,
}

/// Brightness for an ambient light level, linear between the floor and ceiling
pub fn brightness_for_lux(lux: f32, min_brightness: u8) -> u8 {
    if lux <= LUX_FLOOR {
        return min_brightness;
    }
    if lux >= LUX_CEILING {
        return 255;
    }

    let min = f64::from(min_brightness);
    let slope = (255.0 - min) / f64::from(LUX_CEILING - LUX_FLOOR);
    let computed = min + slope * f64::from(lux - LUX_FLOOR);
    computed.round().clamp(0.0, 255.0) as u8
}

fn clamp_brightness(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

#[derive(Debug)]
struct ActuationState {
    dim: DimState,
    last_interaction: Instant,
    keep_alive: bool,
}

pub struct ActuationController {
    settings: Arc<SettingsStore>,
    hardware: Arc<dyn Hardware>,
    sensors: Arc<SensorMonitor>,
    session: Arc<SessionManager>,
    bus: EventBus,
    state: Mutex<ActuationState>,
}

impl ActuationController {
    pub fn new(
        settings: Arc<SettingsStore>,
        hardware: Arc<dyn Hardware>,
        sensors: Arc<SensorMonitor>,
        session: Arc<SessionManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            settings,
            hardware,
            sensors,
            session,
            bus,
            state: Mutex::new(ActuationState {
                dim: DimState::Awake,
                last_interaction: Instant::now(),
                keep_alive: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ActuationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dim_state(&self) -> DimState {
        self.state().dim
    }

    pub fn keep_alive_active(&self) -> bool {
        self.state().keep_alive
    }

    /// Time since the last recognised interaction
    pub fn idle_for(&self) -> Duration {
        self.state().last_interaction.elapsed()
    }

    fn reset_idle_clock(&self) {
        self.state().last_interaction = Instant::now();
    }

    /// Brightness the display should have while awake
    pub fn target_brightness(&self) -> u8 {
        if self.settings.get_bool(keys::AUTOMATIC_BRIGHTNESS) {
            let min = clamp_brightness(self.settings.get_int(keys::MIN_BRIGHTNESS));
            brightness_for_lux(self.sensors.last_lux(), min)
        } else {
            clamp_brightness(self.settings.get_int(keys::BRIGHTNESS))
        }
    }

    async fn apply_brightness(&self, value: u8) {
        debug!("Setting brightness to {}", value);
        if let Err(e) = self.hardware.set_brightness(value) {
            warn!("Failed to set brightness: {}", e);
        }
        self.session.publish_brightness(value).await;
    }

    /// Enter the dimmed state; no-op if already dimmed
    pub async fn dim(&self) {
        {
            let mut state = self.state();
            if state.dim == DimState::Dimmed {
                debug!("Already dimmed");
                return;
            }
            state.dim = DimState::Dimmed;
        }

        let level = clamp_brightness(self.settings.get_int(keys::SCREEN_SAVER_MIN_BRIGHTNESS));
        info!("Dimming screen to brightness {}", level);
        self.apply_brightness(level).await;
        self.session.publish_sleeping(true).await;
        self.bus.publish(BusEvent::Dimmed);
    }

    /// Leave the dimmed state; no-op if already awake
    pub async fn wake(&self) {
        {
            let mut state = self.state();
            if state.dim == DimState::Awake {
                return;
            }
            state.dim = DimState::Awake;
            state.last_interaction = Instant::now();
        }

        let level = self.target_brightness();
        info!("Waking screen to brightness {}", level);
        self.apply_brightness(level).await;
        self.session.publish_sleeping(false).await;
        self.bus.publish(BusEvent::Awake);
    }

    /// A button press or touch: reset the idle clock and wake if dimmed
    pub async fn on_interaction(&self) {
        self.reset_idle_clock();
        if self.dim_state() == DimState::Dimmed {
            self.wake().await;
        }
    }

    /// Suspend (or resume) idle dimming
    pub async fn set_keep_alive(&self, enabled: bool) {
        let dimmed = {
            let mut state = self.state();
            state.keep_alive = enabled;
            if !enabled {
                state.last_interaction = Instant::now();
            }
            state.dim == DimState::Dimmed
        };

        info!("Keep-alive {}", if enabled { "enabled" } else { "disabled" });
        if enabled && dimmed {
            self.wake().await;
        }
    }

    /// Periodic check that dims the display once it has been idle long enough
    pub async fn idle_check(&self) {
        if !self.settings.get_bool(keys::SCREEN_SAVER_ENABLED) {
            return;
        }

        let delay = Duration::from_secs(self.settings.get_int(keys::SCREEN_SAVER_DELAY).max(0) as u64);
        let should_dim = {
            let state = self.state();
            !state.keep_alive
                && state.dim == DimState::Awake
                && state.last_interaction.elapsed() > delay
        };

        if should_dim {
            self.dim().await;
        }
    }

    /// A proximity reading; anything close wakes the display if enabled
    pub async fn on_proximity(&self, distance: f32) {
        let max_range = self.sensors.max_range();
        let wake = self.settings.get_bool(keys::WAKE_ON_PROXIMITY)
            && self.dim_state() == DimState::Dimmed
            && distance < max_range - PROXIMITY_MARGIN;

        if wake {
            debug!("Proximity {} within range, waking", distance);
            self.wake().await;
        }

        // Any proximity event counts as interaction
        self.reset_idle_clock();
    }

    /// A publish-worthy light reading adjusts brightness live while awake
    pub async fn on_light(&self, lux: f32) {
        if self.dim_state() == DimState::Dimmed {
            return;
        }
        if !self.settings.get_bool(keys::AUTOMATIC_BRIGHTNESS) {
            return;
        }

        let min = clamp_brightness(self.settings.get_int(keys::MIN_BRIGHTNESS));
        self.apply_brightness(brightness_for_lux(lux, min)).await;
    }

    /// Settings changed: re-apply brightness if awake
    pub async fn on_settings_changed(&self) {
        if self.dim_state() == DimState::Awake {
            self.apply_brightness(self.target_brightness()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::test_context;

    #[test]
    fn test_brightness_curve() {
        assert_eq!(brightness_for_lux(30.0, 48), 48);
        assert_eq!(brightness_for_lux(0.0, 48), 48);
        assert_eq!(brightness_for_lux(500.0, 48), 255);
        assert_eq!(brightness_for_lux(10_000.0, 48), 255);
        // 48 + 207 / 2 = 151.5
        assert_eq!(brightness_for_lux(265.0, 48), 152);
        assert_eq!(brightness_for_lux(265.0, 0), 128);
    }

    #[tokio::test]
    async fn test_dim_and_wake_are_idempotent() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;
        let mut rx = t.ctx.bus.subscribe();

        actuation.wake().await;
        assert!(rx.try_recv().is_err());

        actuation.dim().await;
        actuation.dim().await;
        assert_eq!(actuation.dim_state(), DimState::Dimmed);
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 10);
        assert_eq!(rx.try_recv().unwrap(), BusEvent::Dimmed);
        assert!(rx.try_recv().is_err());

        actuation.wake().await;
        actuation.wake().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);
        assert_eq!(rx.try_recv().unwrap(), BusEvent::Awake);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wake_uses_light_curve_or_fixed_brightness() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;

        t.ctx.sensors.on_light(265.0);
        actuation.dim().await;
        actuation.wake().await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 152);

        t.ctx.settings.set(keys::AUTOMATIC_BRIGHTNESS, false).unwrap();
        t.ctx.settings.set(keys::BRIGHTNESS, 200i64).unwrap();
        actuation.dim().await;
        actuation.wake().await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_check_dims_after_delay() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;
        t.ctx.settings.set(keys::SCREEN_SAVER_DELAY, 10i64).unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);

        tokio::time::advance(Duration::from_secs(2)).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Dimmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_check_respects_disable_and_keep_alive() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;
        t.ctx.settings.set(keys::SCREEN_SAVER_DELAY, 1i64).unwrap();

        t.ctx.settings.set(keys::SCREEN_SAVER_ENABLED, false).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);

        t.ctx.settings.set(keys::SCREEN_SAVER_ENABLED, true).unwrap();
        actuation.set_keep_alive(true).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);

        // Clearing keep-alive restarts the idle clock
        actuation.set_keep_alive(false).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);
        tokio::time::advance(Duration::from_secs(2)).await;
        actuation.idle_check().await;
        assert_eq!(actuation.dim_state(), DimState::Dimmed);
    }

    #[tokio::test]
    async fn test_keep_alive_wakes_dimmed_display() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;

        actuation.dim().await;
        actuation.set_keep_alive(true).await;
        assert_eq!(actuation.dim_state(), DimState::Awake);
        assert!(actuation.keep_alive_active());
    }

    #[tokio::test]
    async fn test_interaction_wakes() {
        let t = test_context("Blake");
        let actuation = &t.ctx.actuation;

        actuation.dim().await;
        actuation.on_interaction().await;
        assert_eq!(actuation.dim_state(), DimState::Awake);
    }

    #[tokio::test]
    async fn test_proximity_wake_needs_setting_and_range() {
        let t = test_context("Atlantis");
        let actuation = &t.ctx.actuation;

        actuation.dim().await;
        actuation.on_proximity(0.0).await;
        assert_eq!(actuation.dim_state(), DimState::Dimmed);

        t.ctx.settings.set(keys::WAKE_ON_PROXIMITY, true).unwrap();
        // max range 5.0, so 4.6 is not close enough
        actuation.on_proximity(4.6).await;
        assert_eq!(actuation.dim_state(), DimState::Dimmed);

        actuation.on_proximity(4.0).await;
        assert_eq!(actuation.dim_state(), DimState::Awake);
    }

    #[tokio::test]
    async fn test_light_adjusts_only_while_awake_with_auto() {
        let t = test_context("Stargate");
        let actuation = &t.ctx.actuation;

        actuation.on_light(500.0).await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 255);
        actuation.on_light(30.0).await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 48);

        actuation.dim().await;
        actuation.on_light(500.0).await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), 10);

        actuation.wake().await;
        t.ctx.settings.set(keys::AUTOMATIC_BRIGHTNESS, false).unwrap();
        let before = *t.hardware.brightness.lock().unwrap();
        actuation.on_light(500.0).await;
        assert_eq!(*t.hardware.brightness.lock().unwrap(), before);
    }
}
