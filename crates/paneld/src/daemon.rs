//! Component wiring and the event pumps that connect them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::actuation::ActuationController;
use crate::api::HttpService;
use crate::config::Config;
use crate::device::DeviceModel;
use crate::device::Hardware;
use crate::device::RebootPolicy;
use crate::events::BusEvent;
use crate::events::EventBus;
use crate::input::InputEvent;
use crate::mqtt::MqttClient;
use crate::mqtt::SessionManager;
use crate::sensors::SensorKind;
use crate::sensors::SensorMonitor;
use crate::settings::SettingsStore;
use crate::settings::keys;

/// Everything the daemon's components share, built once at startup
pub struct Context {
    pub settings: Arc<SettingsStore>,
    pub hardware: Arc<dyn Hardware>,
    pub model: &'static DeviceModel,
    pub device_name: String,
    pub bus: EventBus,
    pub sensors: Arc<SensorMonitor>,
    pub session: Arc<SessionManager>,
    pub actuation: Arc<ActuationController>,
    pub reboot: RebootPolicy,
    /// Where the watchdog looks for running processes
    pub proc_root: PathBuf,
}

impl Context {
    pub fn new(
        config: &Config,
        settings: Arc<SettingsStore>,
        hardware: Arc<dyn Hardware>,
        client: Box<dyn MqttClient>,
    ) -> Arc<Self> {
        let model = DeviceModel::lookup(&config.device.model);
        info!(
            "Running on {} ({}), {} buttons, proximity: {}",
            model.friendly_name, model.product_code, model.buttons, model.has_proximity_sensor
        );

        let bus = EventBus::new();
        let reboot = RebootPolicy::new();

        let sensors = Arc::new(SensorMonitor::new(
            Arc::clone(&hardware),
            model,
            Duration::from_millis(config.sensors.poll_interval_ms.max(1)),
            bus.clone(),
        ));

        let session = Arc::new(SessionManager::new(
            client,
            &config.mqtt,
            Arc::clone(&settings),
            Arc::clone(&hardware),
            Arc::clone(&sensors),
            model,
            &config.device.name,
            bus.clone(),
            reboot,
        ));

        let actuation = Arc::new(ActuationController::new(
            Arc::clone(&settings),
            Arc::clone(&hardware),
            Arc::clone(&sensors),
            Arc::clone(&session),
            bus.clone(),
        ));

        Arc::new(Self {
            settings,
            hardware,
            model,
            device_name: config.device.name.clone(),
            bus,
            sensors,
            session,
            actuation,
            reboot,
            proc_root: PathBuf::from("/proc"),
        })
    }
}

async fn handle_bus_event(ctx: &Context, http: Option<&HttpService>, event: BusEvent) {
    match event {
        BusEvent::SettingsChanged => {
            debug!("Settings changed, re-reading configuration");
            ctx.session.check_config_and_connect().await;
            ctx.actuation.on_settings_changed().await;
            if let Some(http) = http {
                http.reconcile().await;
            }
        }
        BusEvent::SleepRequested => ctx.actuation.dim().await,
        BusEvent::WakeRequested => ctx.actuation.wake().await,
        BusEvent::Dimmed | BusEvent::Awake => debug!("Display {:?}", event),
        BusEvent::SensorChanged(reading) => {
            trace!("{} reading {}", reading.kind, reading.value);
        }
        BusEvent::SensorPublishWorthy(reading) => match reading.kind {
            SensorKind::Light => {
                ctx.session.publish_lux(reading.value).await;
                ctx.actuation.on_light(reading.value).await;
            }
            SensorKind::Proximity => {
                ctx.session.publish_proximity(reading.value).await;
                ctx.actuation.on_proximity(reading.value).await;
            }
        },
    }
}

/// Route bus events to the components that react to them.
///
/// Runs until the bus closes.
pub async fn run_bus(
    ctx: Arc<Context>,
    http: Option<Arc<HttpService>>,
    mut rx: broadcast::Receiver<BusEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => handle_bus_event(&ctx, http.as_deref(), event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event dispatcher lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Event bus closed");
}

/// Route recognised input to the display and the broker.
///
/// Runs until the gesture loop stops.
pub async fn handle_input(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<InputEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            InputEvent::Interaction => ctx.actuation.on_interaction().await,
            InputEvent::Gesture(gesture) => {
                ctx.session
                    .publish_button_event(gesture.button, gesture.kind)
                    .await;
            }
            InputEvent::UnknownKey(key) => {
                debug!("Unmapped key {} pressed={}", key.code, key.pressed);
                if ctx.settings.get_bool(keys::DEBUG_KEYS) {
                    ctx.session.publish_unknown_key(key.code, key.pressed).await;
                }
            }
        }
    }
    debug!("Input stream closed");
}

#[cfg(test)]
pub(crate) struct TestContext {
    pub ctx: Arc<Context>,
    pub hardware: Arc<crate::device::MemoryHardware>,
    pub mqtt: crate::mqtt::client::MockMqttClient,
}

/// A context over in-memory hardware and a recording broker client.
///
/// Nothing is started: no sensor polling, scheduler or event pumps.
#[cfg(test)]
pub(crate) fn test_context(model: &str) -> TestContext {
    let mut config = Config::default();
    config.device.model = model.to_string();

    let hardware = Arc::new(crate::device::MemoryHardware::default());
    let mqtt = crate::mqtt::client::MockMqttClient::new();
    let ctx = Context::new(
        &config,
        Arc::new(SettingsStore::in_memory()),
        Arc::clone(&hardware) as Arc<dyn Hardware>,
        Box::new(mqtt.clone()),
    );

    TestContext { ctx, hardware, mqtt }
}
