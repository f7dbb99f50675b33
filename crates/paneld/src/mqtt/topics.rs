//! Topic layout for one device.
//!
//! Every device topic lives under `{topic_prefix}/{client_id}/`; discovery
//! and hub availability live under the discovery prefix.

/// A command addressed to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-run the full status publish
    Update,
    /// Switch a relay; payload containing `ON` means on
    Relay(usize),
    Sleep,
    Wake,
    Reboot,
    /// Re-read configuration
    Refresh,
    /// Relaunch the supervised application
    RestartApp,
    /// The hub announced its own availability
    HubStatus,
}

#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
    discovery_prefix: String,
    client_id: String,
}

impl Topics {
    pub fn new(topic_prefix: &str, discovery_prefix: &str, client_id: &str) -> Self {
        Self {
            base: format!("{}/{}", topic_prefix, client_id),
            discovery_prefix: discovery_prefix.to_string(),
            client_id: client_id.to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn device(&self, leaf: &str) -> String {
        format!("{}/{}", self.base, leaf)
    }

    fn indexed(&self, leaf: &str, num: usize) -> String {
        if num > 0 {
            format!("{}/{}_{}", self.base, leaf, num)
        } else {
            self.device(leaf)
        }
    }

    /// Wildcard covering every device topic
    pub fn command_filter(&self) -> String {
        self.device("#")
    }

    pub fn status(&self) -> String {
        self.device("status")
    }

    pub fn temperature(&self) -> String {
        self.device("temp")
    }

    pub fn humidity(&self) -> String {
        self.device("hum")
    }

    pub fn lux(&self) -> String {
        self.device("lux")
    }

    pub fn brightness(&self) -> String {
        self.device("bri")
    }

    pub fn proximity(&self) -> String {
        self.device("proximity")
    }

    pub fn relay_state(&self, num: usize) -> String {
        self.indexed("relay_state", num)
    }

    pub fn relay_command(&self, num: usize) -> String {
        self.indexed("relay_command", num)
    }

    pub fn update(&self) -> String {
        self.device("update")
    }

    pub fn hello(&self) -> String {
        self.device("hello")
    }

    pub fn button_event(&self, button: u8) -> String {
        format!("{}/button_event/{}", self.base, button)
    }

    pub fn sleep(&self) -> String {
        self.device("sleep")
    }

    pub fn wake(&self) -> String {
        self.device("wake")
    }

    pub fn reboot(&self) -> String {
        self.device("reboot")
    }

    pub fn refresh(&self) -> String {
        self.device("refresh")
    }

    pub fn restart_app(&self) -> String {
        self.device("restart_app")
    }

    pub fn sleeping(&self) -> String {
        self.device("sleeping")
    }

    pub fn unknown_key(&self) -> String {
        self.device("unknown_key")
    }

    pub fn discovery_config(&self) -> String {
        format!("{}/device/{}/config", self.discovery_prefix, self.client_id)
    }

    pub fn hub_status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    /// Classify an inbound topic; our own telemetry echoes yield `None`
    pub fn parse_command(&self, topic: &str) -> Option<Command> {
        if topic == self.hub_status() {
            return Some(Command::HubStatus);
        }

        let leaf = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        match leaf {
            "update" => Some(Command::Update),
            "sleep" => Some(Command::Sleep),
            "wake" => Some(Command::Wake),
            "reboot" => Some(Command::Reboot),
            "refresh" => Some(Command::Refresh),
            "restart_app" => Some(Command::RestartApp),
            "relay_command" => Some(Command::Relay(0)),
            _ => leaf
                .strip_prefix("relay_command_")
                .and_then(|n| n.parse().ok())
                .map(Command::Relay),
        }
    }
}
