//! Broker session, topic layout and Home Assistant discovery.

pub mod client;
pub mod discovery;
pub mod session;
pub mod topics;

pub use client::ClientEvent;
pub use client::ConnectOptions;
pub use client::MqttClient;
pub use client::MqttMessage;
pub use client::RumqttcClient;
pub use discovery::DiscoveryDocument;
pub use discovery::HelloDocument;
pub use session::ConnectionState;
pub use session::SessionManager;
pub use topics::Command;
pub use topics::Topics;
