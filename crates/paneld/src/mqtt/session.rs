use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rumqttc::QoS;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::client::ClientEvent;
use super::client::ConnectOptions;
use super::client::MqttClient;
use super::client::MqttMessage;
use super::discovery::DiscoveryDocument;
use super::discovery::HelloDocument;
use super::topics::Command;
use super::topics::Topics;
use crate::config::MqttConfig;
use crate::device;
use crate::device::DeviceModel;
use crate::device::Hardware;
use crate::device::HardwareError;
use crate::device::RebootPolicy;
use crate::events::BusEvent;
use crate::events::EventBus;
use crate::input::GestureKind;
use crate::sensors::SensorMonitor;
use crate::settings::SettingsStore;
use crate::settings::keys;
use crate::watchdog;

/// Delay before a failed connect is retried
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Pause between the broker accepting us and the first subscribe
const SETTLE_DELAY: Duration = Duration::from_millis(150);

/// Client ids that were shipped as defaults and must be replaced
const PLACEHOLDER_IDS: &[&str] = &["shellyelevate", "shellywalldisplay", "paneld"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Four random hex digits
fn random_suffix() -> String {
    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.write_u128(nanos);
    hasher.write_u32(std::process::id());
    format!("{:04x}", hasher.finish() & 0xffff)
}

/// Load the persisted client id, generating and storing one if needed
pub fn ensure_client_id(settings: &SettingsStore, prefix: &str) -> String {
    let current = settings.get_string(keys::MQTT_CLIENT_ID);
    if current.len() > 2 && !PLACEHOLDER_IDS.contains(&current.as_str()) {
        return current;
    }

    let generated = format!("{}-{}", prefix, random_suffix());
    info!("Generated MQTT client id {}", generated);
    if let Err(e) = settings.set(keys::MQTT_CLIENT_ID, generated.clone()) {
        warn!("Failed to persist MQTT client id: {}", e);
    }
    generated
}

/// Owns the broker connection: connect and retry, status publishing, and
/// inbound command routing.
pub struct SessionManager {
    client: tokio::sync::Mutex<Box<dyn MqttClient>>,
    topics: Topics,
    keep_alive: Duration,

    settings: Arc<SettingsStore>,
    hardware: Arc<dyn Hardware>,
    sensors: Arc<SensorMonitor>,
    model: &'static DeviceModel,
    device_name: String,
    bus: EventBus,
    reboot: RebootPolicy,

    state: Mutex<ConnectionState>,
    /// Broker, username and password are all set
    valid: AtomicBool,
    /// A client event loop exists and is reconnecting on its own
    transport_open: AtomicBool,
    retry_armed: AtomicBool,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Box<dyn MqttClient>,
        config: &MqttConfig,
        settings: Arc<SettingsStore>,
        hardware: Arc<dyn Hardware>,
        sensors: Arc<SensorMonitor>,
        model: &'static DeviceModel,
        device_name: &str,
        bus: EventBus,
        reboot: RebootPolicy,
    ) -> Self {
        let client_id = ensure_client_id(&settings, &config.topic_prefix);
        let topics = Topics::new(&config.topic_prefix, &config.discovery_prefix, &client_id);

        Self {
            client: tokio::sync::Mutex::new(client),
            topics,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            settings,
            hardware,
            sensors,
            model,
            device_name: device_name.to_string(),
            bus,
            reboot,
            state: Mutex::new(ConnectionState::Disconnected),
            valid: AtomicBool::new(false),
            transport_open: AtomicBool::new(false),
            retry_armed: AtomicBool::new(false),
            retry_task: Mutex::new(None),
            events_task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        self.topics.client_id()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("MQTT state {} -> {}", *current, state);
            *current = state;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.get_bool(keys::MQTT_ENABLED)
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_armed.load(Ordering::SeqCst)
    }

    /// Relays both the model advertises and the hardware exposes
    pub fn relay_count(&self) -> usize {
        usize::from(self.model.relays).min(self.hardware.relay_count())
    }

    pub fn hello_document(&self) -> HelloDocument {
        HelloDocument::new(self.model)
    }

    /// Re-read the broker settings and connect if they are usable.
    ///
    /// Runs at start and on every settings change.
    pub async fn check_config_and_connect(self: &Arc<Self>) {
        if !self.is_enabled() {
            self.valid.store(false, Ordering::SeqCst);
            if self.transport_open.load(Ordering::SeqCst) {
                info!("MQTT disabled, closing connection");
            }
            self.disconnect().await;
            return;
        }

        let valid = !self.settings.get_string(keys::MQTT_BROKER).is_empty()
            && !self.settings.get_string(keys::MQTT_USERNAME).is_empty()
            && !self.settings.get_string(keys::MQTT_PASSWORD).is_empty();
        self.valid.store(valid, Ordering::SeqCst);

        if !valid {
            info!("MQTT enabled but broker credentials incomplete");
            return;
        }

        self.connect();
    }

    /// Start a connect attempt unless one is running or a connection exists
    pub fn connect(self: &Arc<Self>) {
        if !self.valid.load(Ordering::SeqCst)
            || self.transport_open.load(Ordering::SeqCst)
            || self.retry_pending()
        {
            return;
        }

        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Connecting;
        }

        debug!("Connecting...");
        let session = Arc::clone(self);
        tokio::spawn(async move { session.do_connect().await });
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            broker: self.settings.get_string(keys::MQTT_BROKER),
            port: u16::try_from(self.settings.get_int(keys::MQTT_PORT)).unwrap_or(1883),
            client_id: self.client_id().to_string(),
            username: self.settings.get_string(keys::MQTT_USERNAME),
            password: self.settings.get_string(keys::MQTT_PASSWORD),
            keep_alive: self.keep_alive,
            will_topic: self.topics.status(),
            will_payload: "offline".to_string(),
        }
    }

    /// Enabled with a usable broker configuration
    fn may_connect(&self) -> bool {
        self.is_enabled() && self.valid.load(Ordering::SeqCst)
    }

    async fn do_connect(self: Arc<Self>) {
        if !self.may_connect() {
            debug!("MQTT disabled before connect started");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let options = self.connect_options();
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            options.broker, options.port, options.client_id
        );

        let result = {
            let mut client = self.client.lock().await;
            client.connect(&options).await
        };

        match result {
            Ok(events) => {
                self.transport_open.store(true, Ordering::SeqCst);
                if !self.may_connect() {
                    // Disabled while the handshake ran; nothing was announced yet
                    if self.transport_open.swap(false, Ordering::SeqCst) {
                        info!("MQTT disabled during connect, closing connection");
                        let mut client = self.client.lock().await;
                        if let Err(e) = client.disconnect().await {
                            error!("Error disconnecting MQTT client: {}", e);
                        }
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }

                let session = Arc::clone(&self);
                let task = tokio::spawn(async move { session.process_events(events).await });
                if let Some(old) = lock(&self.events_task).replace(task) {
                    old.abort();
                }
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                if self.may_connect() {
                    error!("Connect failed, scheduling retry in {:?}: {}", RETRY_DELAY, e);
                    self.schedule_retry();
                } else {
                    error!("Connect failed: {}", e);
                }
            }
        }
    }

    /// Arm the single retry timer; a pending retry absorbs further failures
    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_armed.swap(true, Ordering::SeqCst) {
            debug!("Retry already scheduled");
            return;
        }

        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            session.retry_armed.store(false, Ordering::SeqCst);
            session.connect();
        });
        if let Some(old) = lock(&self.retry_task).replace(task) {
            old.abort();
        }
    }

    /// Periodic liveness check: reconnect if nothing else will
    pub fn check_liveness(self: &Arc<Self>) {
        if !self.is_enabled() || !self.valid.load(Ordering::SeqCst) {
            return;
        }
        if self.state() == ConnectionState::Disconnected
            && !self.retry_pending()
            && !self.transport_open.load(Ordering::SeqCst)
        {
            info!("MQTT not connected, reconnecting");
            self.connect();
        }
    }

    async fn process_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected => {
                    info!("Connected to MQTT broker");
                    self.set_state(ConnectionState::Connected);
                    self.on_connected().await;
                }
                ClientEvent::Disconnected(reason) => {
                    warn!("Disconnected from MQTT broker: {}", reason);
                    self.set_state(ConnectionState::Disconnected);
                }
                ClientEvent::Message(msg) => self.handle_message(msg).await,
            }
        }
        debug!("MQTT event stream closed");
    }

    async fn on_connected(self: &Arc<Self>) {
        tokio::time::sleep(SETTLE_DELAY).await;
        if self.state() != ConnectionState::Connected {
            return;
        }

        {
            let mut client = self.client.lock().await;
            for topic in [self.topics.command_filter(), self.topics.hub_status()] {
                if let Err(e) = client.subscribe(&topic).await {
                    error!("Failed to subscribe to {}: {}", topic, e);
                }
            }
        }

        self.publish_status().await;
    }

    /// Full status publish: hello, discovery, online, then staggered telemetry
    pub async fn publish_status(self: &Arc<Self>) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        self.publish_hello().await;
        self.publish_discovery().await;
        self.publish(&self.topics.status(), "online", QoS::AtLeastOnce, true)
            .await;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let step = Duration::from_millis(50);

            tokio::time::sleep(step).await;
            session.publish_temp_and_hum().await;

            tokio::time::sleep(step).await;
            for num in 0..session.relay_count() {
                match session.hardware.relay(num) {
                    Ok(on) => session.publish_relay(num, on).await,
                    Err(e) => debug!("Relay {} unavailable: {}", num, e),
                }
            }

            tokio::time::sleep(step).await;
            session.publish_lux(session.sensors.last_lux()).await;

            tokio::time::sleep(step).await;
            match session.hardware.brightness() {
                Ok(value) => session.publish_brightness(value).await,
                Err(e) => debug!("Brightness unavailable: {}", e),
            }

            tokio::time::sleep(step).await;
            if session.model.has_proximity_sensor {
                session
                    .publish_proximity(session.sensors.last_distance())
                    .await;
            }

            tokio::time::sleep(step).await;
            session.publish_sleeping(false).await;
        });
    }

    async fn publish_hello(&self) {
        match serde_json::to_string(&self.hello_document()) {
            Ok(json) => {
                self.publish(&self.topics.hello(), json, QoS::AtLeastOnce, false)
                    .await
            }
            Err(e) => error!("Error encoding hello: {}", e),
        }
    }

    async fn publish_discovery(&self) {
        let doc = DiscoveryDocument::build(&self.topics, self.model, &self.device_name);
        match serde_json::to_string(&doc) {
            Ok(json) => {
                info!("Publishing discovery with {} components", doc.cmps.len());
                self.publish(&self.topics.discovery_config(), json, QoS::AtLeastOnce, true)
                    .await
            }
            Err(e) => error!("Error encoding discovery document: {}", e),
        }
    }

    /// Publish if connected; otherwise log and drop
    pub async fn publish(&self, topic: &str, payload: impl AsRef<[u8]>, qos: QoS, retain: bool) {
        if self.state() != ConnectionState::Connected {
            debug!("Publish skipped, client not connected: {}", topic);
            return;
        }

        let mut client = self.client.lock().await;
        if let Err(e) = client.publish(topic, payload.as_ref(), qos, retain).await {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }

    pub async fn publish_temp_and_hum(&self) {
        match device::read_climate(self.hardware.as_ref(), self.model) {
            Ok(climate) => {
                self.publish_temperature(climate.temperature).await;
                self.publish_humidity(climate.humidity).await;
            }
            Err(e) => debug!("Climate sensor unavailable: {}", e),
        }
    }

    pub async fn publish_temperature(&self, celsius: f64) {
        self.publish(
            &self.topics.temperature(),
            format!("{:.1}", celsius),
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_humidity(&self, percent: f64) {
        self.publish(
            &self.topics.humidity(),
            format!("{:.0}", percent),
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_lux(&self, lux: f32) {
        self.publish(&self.topics.lux(), lux.to_string(), QoS::AtLeastOnce, false)
            .await;
    }

    pub async fn publish_brightness(&self, value: u8) {
        self.publish(
            &self.topics.brightness(),
            value.to_string(),
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_proximity(&self, distance: f32) {
        self.publish(
            &self.topics.proximity(),
            distance.to_string(),
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_relay(&self, num: usize, on: bool) {
        self.publish(
            &self.topics.relay_state(num),
            if on { "ON" } else { "OFF" },
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_sleeping(&self, sleeping: bool) {
        self.publish(
            &self.topics.sleeping(),
            if sleeping { "ON" } else { "OFF" },
            QoS::AtLeastOnce,
            false,
        )
        .await;
    }

    pub async fn publish_button_event(&self, button: u8, kind: GestureKind) {
        let payload = json!({ "event_type": kind.to_string() }).to_string();
        self.publish(
            &self.topics.button_event(button),
            payload,
            QoS::AtLeastOnce,
            false,
        )
        .await;
        info!("Published button {} event: {}", button, kind);
    }

    pub async fn publish_unknown_key(&self, key_code: u16, pressed: bool) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let payload = json!({
            "key_code": key_code,
            "pressed": pressed,
            "timestamp": timestamp as u64,
        })
        .to_string();
        self.publish(&self.topics.unknown_key(), payload, QoS::AtLeastOnce, false)
            .await;
    }

    /// Switch a relay and report its new state
    pub async fn switch_relay(&self, num: usize, on: bool) -> Result<bool, HardwareError> {
        if num >= self.relay_count() {
            return Err(HardwareError::Unsupported(format!("relay {}", num)));
        }
        self.hardware.set_relay(num, on)?;
        let state = self.hardware.relay(num).unwrap_or(on);
        self.publish_relay(num, state).await;
        Ok(state)
    }

    /// Route a message from a subscription
    pub async fn handle_message(self: &Arc<Self>, msg: MqttMessage) {
        let Some(command) = self.topics.parse_command(&msg.topic) else {
            return;
        };
        let payload = String::from_utf8_lossy(&msg.payload);
        debug!("Command {:?} with payload {:?}", command, payload);

        match command {
            Command::Update => self.publish_status().await,
            Command::HubStatus => {
                if payload.trim() == "online" {
                    info!("Hub came online, republishing status");
                    self.publish_status().await;
                }
            }
            Command::Relay(num) => {
                let on = payload.contains("ON");
                if let Err(e) = self.switch_relay(num, on).await {
                    warn!("Failed to switch relay {}: {}", num, e);
                }
            }
            Command::Refresh => self.bus.publish(BusEvent::SettingsChanged),
            Command::Sleep => self.bus.publish(BusEvent::SleepRequested),
            Command::Wake => self.bus.publish(BusEvent::WakeRequested),
            Command::Reboot => {
                if let Err(e) = self.reboot.reboot(self.hardware.as_ref()) {
                    warn!("Reboot rejected: {}", e);
                }
            }
            Command::RestartApp => {
                let target = self.settings.get_string(keys::WATCHDOG_TARGET);
                if target.is_empty() {
                    warn!("Restart requested but no watchdog target configured");
                } else if let Err(e) = watchdog::launch(&target) {
                    warn!("Failed to restart {}: {}", target, e);
                }
            }
        }
    }

    /// Retract discovery, announce offline, and close the connection
    pub async fn disconnect(&self) {
        if let Some(task) = lock(&self.retry_task).take() {
            task.abort();
        }
        self.retry_armed.store(false, Ordering::SeqCst);

        if !self.transport_open.swap(false, Ordering::SeqCst) {
            // An in-flight attempt settles its own state
            if self.state() != ConnectionState::Connecting {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }

        info!("Disconnecting from MQTT broker");
        self.publish(&self.topics.discovery_config(), "", QoS::AtLeastOnce, true)
            .await;
        self.publish(&self.topics.status(), "offline", QoS::AtLeastOnce, true)
            .await;

        self.set_state(ConnectionState::Disconnected);
        {
            let mut client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                error!("Error disconnecting MQTT client: {}", e);
            }
        }

        if let Some(task) = lock(&self.events_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
