//! Home Assistant device discovery and the hello document.
//!
//! The discovery document uses the single-topic device form
//! (`<prefix>/device/<id>/config`) with abbreviated keys: `dev` for the
//! device block, `o` for origin, `cmps` for components and `p` for each
//! component's platform.

use std::collections::BTreeMap;

use serde::Serialize;

use super::topics::Topics;
use crate::device::DeviceModel;
use crate::input::GestureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Sensor,
    Event,
    Switch,
    Button,
    BinarySensor,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    pub ids: String,
    pub name: String,
    pub mf: String,
    pub mdl: String,
    pub sw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Origin {
    pub name: String,
    pub sw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub p: Platform,
    pub name: String,
    pub unique_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
}

impl Component {
    fn new(p: Platform, name: impl Into<String>, unique_id: String) -> Self {
        Self {
            p,
            name: name.into(),
            unique_id,
            state_topic: None,
            command_topic: None,
            device_class: None,
            unit_of_measurement: None,
            event_types: None,
        }
    }

    fn sensor(id: String, name: &str, topic: String, class: &str, unit: &str) -> Self {
        Self {
            state_topic: Some(topic),
            device_class: Some(class.to_string()),
            unit_of_measurement: Some(unit.to_string()),
            ..Self::new(Platform::Sensor, name, id)
        }
    }

    fn button(id: String, name: &str, command_topic: String, class: Option<&str>) -> Self {
        Self {
            command_topic: Some(command_topic),
            device_class: class.map(str::to_string),
            ..Self::new(Platform::Button, name, id)
        }
    }
}

/// Capability description published to the hub on every connect
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub dev: DeviceBlock,
    pub o: Origin,
    pub cmps: BTreeMap<String, Component>,
    pub availability_topic: String,
}

impl DiscoveryDocument {
    pub fn build(topics: &Topics, model: &DeviceModel, device_name: &str) -> Self {
        let id = topics.client_id();
        let version = env!("CARGO_PKG_VERSION").to_string();
        let mut cmps = BTreeMap::new();
        let mut add = |component: Component| {
            cmps.insert(component.unique_id.clone(), component);
        };

        add(Component::sensor(
            format!("{}_temp", id),
            "Temperature",
            topics.temperature(),
            "temperature",
            "°C",
        ));
        add(Component::sensor(
            format!("{}_hum", id),
            "Humidity",
            topics.humidity(),
            "humidity",
            "%",
        ));
        add(Component::sensor(
            format!("{}_lux", id),
            "Light",
            topics.lux(),
            "illuminance",
            "lx",
        ));
        if model.has_proximity_sensor {
            add(Component::sensor(
                format!("{}_proximity", id),
                "Proximity",
                topics.proximity(),
                "distance",
                "cm",
            ));
        }

        let event_types: Vec<String> = [GestureKind::Single, GestureKind::Double, GestureKind::Long]
            .iter()
            .map(ToString::to_string)
            .collect();
        for button in 1..=model.buttons {
            add(Component {
                state_topic: Some(topics.button_event(button)),
                device_class: Some("button".to_string()),
                event_types: Some(event_types.clone()),
                ..Component::new(
                    Platform::Event,
                    format!("Button {}", button),
                    format!("{}_button_{}_event", id, button),
                )
            });
        }

        for num in 0..usize::from(model.relays) {
            let (unique_id, name) = if num > 0 {
                (format!("{}_relay_{}", id, num), format!("Relay {}", num))
            } else {
                (format!("{}_relay", id), "Relay".to_string())
            };
            add(Component {
                state_topic: Some(topics.relay_state(num)),
                command_topic: Some(topics.relay_command(num)),
                device_class: Some("outlet".to_string()),
                ..Component::new(Platform::Switch, name, unique_id)
            });
        }

        add(Component::button(
            format!("{}_sleep", id),
            "Sleep",
            topics.sleep(),
            None,
        ));
        add(Component::button(
            format!("{}_wake", id),
            "Wake",
            topics.wake(),
            None,
        ));
        add(Component::button(
            format!("{}_reboot", id),
            "Reboot",
            topics.reboot(),
            Some("restart"),
        ));
        add(Component::button(
            format!("{}_restart_app", id),
            "Restart App",
            topics.restart_app(),
            Some("restart"),
        ));

        add(Component {
            state_topic: Some(topics.sleeping()),
            ..Component::new(
                Platform::BinarySensor,
                "Sleeping",
                format!("{}_sleeping", id),
            )
        });

        Self {
            dev: DeviceBlock {
                ids: id.to_string(),
                name: device_name.to_string(),
                mf: "Shelly".to_string(),
                mdl: model.friendly_name.to_string(),
                sw: version.clone(),
            },
            o: Origin {
                name: env!("CARGO_PKG_NAME").to_string(),
                sw: version,
            },
            cmps,
            availability_topic: topics.status(),
        }
    }
}

/// Identity summary published on `hello` and served at `/`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloDocument {
    pub name: String,
    pub version: String,
    pub model_name: String,
    pub proximity: bool,
    pub num_of_buttons: u8,
    pub num_of_inputs: u8,
}

impl HelloDocument {
    pub fn new(model: &DeviceModel) -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_name: model.id.to_string(),
            proximity: model.has_proximity_sensor,
            num_of_buttons: model.buttons,
            num_of_inputs: model.relays,
        }
    }
}
