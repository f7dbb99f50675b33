use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// How long the initial connect may take before it counts as failed
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT message received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Connection lifecycle notifications delivered by a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The broker accepted the connection (initially or after a reconnect)
    Connected,
    /// The transport dropped; the client keeps trying to reconnect
    Disconnected(String),
    Message(MqttMessage),
}

/// Everything needed to open a broker connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub will_topic: String,
    pub will_payload: String,
}

fn not_connected() -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "no broker session; connect first",
    ))
}

/// Broker transport used by the session manager
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the broker, returning the stream of connection events.
    ///
    /// The first event on a successful connect is [`ClientEvent::Connected`].
    async fn connect(
        &mut self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>, Box<dyn Error + Send>>;

    /// Subscribe to an MQTT topic
    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Close the connection and stop reconnecting
    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>>;
}

/// Split a broker setting such as `tcp://host` into a bare host
fn broker_host(broker: &str) -> &str {
    broker
        .split_once("://")
        .map_or(broker, |(_, host)| host)
        .trim_end_matches('/')
}

/// Real MQTT client implementation using rumqttc
#[derive(Default)]
pub struct RumqttcClient {
    client: Option<AsyncClient>,

    /// Set before a graceful disconnect so the event loop stops retrying
    closing: Arc<AtomicBool>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            broker_host(&options.broker),
            options.port,
        );

        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(options.username.clone(), options.password.clone());
        mqtt_options.set_last_will(LastWill::new(
            options.will_topic.clone(),
            options.will_payload.clone(),
            QoS::AtLeastOnce,
            true,
        ));

        // Allow large MQTT packets (2 MiB) for discovery payloads
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        mqtt_options
    }

    fn stop_event_loop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>, Box<dyn Error + Send>> {
        self.stop_event_loop();
        self.client = None;

        let (client, mut event_loop) = AsyncClient::new(Self::mqtt_options(options), 10);

        // Drive the event loop until the broker answers
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(Box::new(std::io::Error::new(
                                std::io::ErrorKind::ConnectionRefused,
                                format!("Broker refused connection: {:?}", ack.code),
                            )) as Box<dyn Error + Send>)
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(Box::new(e) as Box<dyn Error + Send>),
                }
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(elapsed) => return Err(Box::new(elapsed)),
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::Connected);

        let closing = Arc::new(AtomicBool::new(false));
        self.closing = closing.clone();

        // Spawn background task to poll event loop; rumqttc reconnects on the next poll
        let task = tokio::spawn(async move {
            let mut connected = true;
            loop {
                let event = match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        ClientEvent::Message(MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        })
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        ClientEvent::Connected
                    }
                    Ok(_) => {
                        // Ignore other events (puback, pingresp, etc.)
                        continue;
                    }
                    Err(e) => {
                        if closing.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!("MQTT event loop error: {}", e);
                        let reported = connected;
                        connected = false;
                        // Sleep briefly before retrying
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if !reported {
                            continue;
                        }
                        ClientEvent::Disconnected(e.to_string())
                    }
                };

                // Send to channel; if receiver dropped, exit
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.event_loop_task = Some(task);

        Ok(event_rx)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
        let client = self.client.as_ref().ok_or_else(not_connected)?;

        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>> {
        let client = self.client.as_ref().ok_or_else(not_connected)?;

        client
            .publish(topic, qos, retain, payload.to_vec())
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        self.closing.store(true, Ordering::SeqCst);

        let Some(client) = self.client.take() else {
            return Ok(());
        };

        let result = client
            .disconnect()
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>);

        // Let the event loop flush the queued publishes and the disconnect
        if let Some(task) = self.event_loop_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("MQTT event loop did not stop in time");
            }
        }

        result
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        self.stop_event_loop();
    }
}

/// Everything a [`MockMqttClient`] has been asked to do
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockLog {
    pub connects: usize,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, QoS, bool)>,
    pub disconnects: usize,
    /// When set, every connect attempt fails
    pub fail_connect: bool,
    /// Sender feeding the session's event stream after a successful connect
    pub events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

#[cfg(test)]
impl MockLog {
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, ..)| t == topic)
            .map(|(_, payload, ..)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.iter().map(|(t, ..)| t.clone()).collect()
    }
}

/// Mock MQTT client for testing; clones share one [`MockLog`]
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockMqttClient {
    pub log: Arc<std::sync::Mutex<MockLog>>,
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }

    /// Deliver an event as if it came from the broker
    pub fn inject(&self, event: ClientEvent) {
        if let Some(events) = &self.log().events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(
        &mut self,
        _options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>, Box<dyn Error + Send>> {
        let mut log = self.log();
        log.connects += 1;
        if log.fail_connect {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock broker unavailable",
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ClientEvent::Connected);
        log.events = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
        self.log().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.log()
            .published
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        let mut log = self.log();
        log.disconnects += 1;
        log.events = None;
        Ok(())
    }
}
