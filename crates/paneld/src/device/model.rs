//! Per-model calibration table.

use serde::Serialize;

/// Static description of one device model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    /// Stable identifier matched against the configured model
    pub id: &'static str,
    pub friendly_name: &'static str,
    pub product_code: &'static str,
    pub has_proximity_sensor: bool,
    pub temperature_offset: f64,
    pub humidity_offset: f64,
    pub buttons: u8,
    pub relays: u8,
}

const STARGATE: DeviceModel = DeviceModel {
    id: "Stargate",
    friendly_name: "Shelly Wall Display",
    product_code: "SAWD-0A1XX10EU1",
    has_proximity_sensor: false,
    temperature_offset: -2.7,
    humidity_offset: 7.0,
    buttons: 0,
    relays: 1,
};

pub const MODELS: &[DeviceModel] = &[
    STARGATE,
    DeviceModel {
        id: "Atlantis",
        friendly_name: "Shelly Wall Display 2",
        product_code: "SAWD-1A1XX10EU1",
        has_proximity_sensor: true,
        temperature_offset: -1.1,
        humidity_offset: 3.0,
        buttons: 0,
        relays: 1,
    },
    DeviceModel {
        id: "Pegasus",
        friendly_name: "Shelly Wall Display X2",
        product_code: "SAWD-2A1XX10EU1",
        has_proximity_sensor: true,
        temperature_offset: -2.6,
        humidity_offset: 8.0,
        buttons: 0,
        relays: 1,
    },
    DeviceModel {
        id: "Blake",
        friendly_name: "Shelly Wall Display XL",
        product_code: "SAWD-3A1XE10EU2",
        has_proximity_sensor: true,
        temperature_offset: -1.2,
        humidity_offset: 10.0,
        buttons: 4,
        relays: 1,
    },
    DeviceModel {
        id: "Maverick",
        friendly_name: "Shelly Wall Display U1",
        product_code: "SAWD-4A1XE10US0",
        has_proximity_sensor: true,
        temperature_offset: 0.0,
        humidity_offset: 0.0,
        buttons: 0,
        relays: 1,
    },
    DeviceModel {
        id: "Jenna",
        friendly_name: "Shelly Wall Display X2i",
        product_code: "SAWD-5A1XX10EU0",
        has_proximity_sensor: true,
        temperature_offset: 0.0,
        humidity_offset: 0.0,
        buttons: 0,
        relays: 1,
    },
    DeviceModel {
        id: "Cally",
        friendly_name: "Shelly Wall Display XLi",
        product_code: "SAWD-6A1XX10EU0",
        has_proximity_sensor: true,
        temperature_offset: 0.0,
        humidity_offset: 0.0,
        buttons: 4,
        relays: 1,
    },
];

impl DeviceModel {
    /// Look up a model by id, falling back to the base model
    pub fn lookup(id: &str) -> &'static DeviceModel {
        MODELS
            .iter()
            .find(|m| m.id.eq_ignore_ascii_case(id))
            .unwrap_or_else(|| {
                tracing::warn!("Unknown device model {:?}, using {}", id, STARGATE.id);
                &MODELS[0]
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_model() {
        let model = DeviceModel::lookup("Blake");
        assert_eq!(model.buttons, 4);
        assert!(model.has_proximity_sensor);
        assert_eq!(model.humidity_offset, 10.0);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(DeviceModel::lookup("pegasus").id, "Pegasus");
    }

    #[test]
    fn test_unknown_model_falls_back_to_base() {
        let model = DeviceModel::lookup("Nonexistent");
        assert_eq!(model.id, "Stargate");
        assert!(!model.has_proximity_sensor);
    }
}
