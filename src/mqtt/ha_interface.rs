use serde::Serialize;

use crate::mbus::DecodedFrame;
use crate::templates::ResolvedField;

/* The state topic carries the bare number */
pub const VALUE_TEMPLATE: &str = "{{ value_json }}";

/// Groups all sensors of one meter into a single Home Assistant device
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl HaDevice {
    pub fn from_frame(meter_name: &str, frame: &DecodedFrame) -> Self {
        return HaDevice {
            identifiers: vec![frame.serial_number.to_string()],
            name: meter_name.to_string(),
            manufacturer: frame.manufacturer.clone(),
            model: frame.device_type.clone(),
        };
    }

    pub fn serial_number(&self) -> &str {
        return self.identifiers.first().map(|s| s.as_str()).unwrap_or_default();
    }
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

pub fn state_topic(topic_prefix: &str, meter_name: &str, sensor_name: &str) -> String {
    return format!("{topic_prefix}/{meter_name}/{sensor_name}/state");
}

/// Unique as long as sensor names are unique within a template
pub fn unique_id(sensor_name: &str, serial_number: &str) -> String {
    return format!("{sensor_name}_{serial_number}");
}

/// Discovery message for one published field of a meter
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct HaDiscover {
    pub device: HaDevice,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    #[serde(rename = "unit_of_measurement", skip_serializing_if = "is_none_str")]
    pub unit: String,
    pub value_template: String,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(device: &HaDevice, meter_name: &str, topic_prefix: &str, discovery_prefix: &str, resolved: &ResolvedField) -> Self {
        let sensor_name = &resolved.field.name;
        let unique_id = unique_id(sensor_name, device.serial_number());

        return HaDiscover {
            discover_topic: format!("{discovery_prefix}/sensor/{unique_id}/config"),
            device: device.clone(),
            device_class: resolved.field.device_class.clone(),
            name: sensor_name.clone(),
            state_topic: state_topic(topic_prefix, meter_name, sensor_name),
            unique_id,
            unit: resolved.field.unit.clone(),
            value_template: VALUE_TEMPLATE.to_string(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbus::DataRecord;
    use crate::templates::FieldDescriptor;

    fn frame(serial_number: u32) -> DecodedFrame {
        return DecodedFrame {
            serial_number,
            manufacturer: "ELS".to_string(),
            device_type: "Water".to_string(),
            data_records: vec![DataRecord::new(12.5, "m³")],
            ..Default::default()
        };
    }

    fn volume() -> FieldDescriptor {
        return FieldDescriptor {
            publish: true,
            name: "volume".to_string(),
            device_class: "water".to_string(),
            unit: "m³".to_string(),
        };
    }

    #[test]
    fn test_build_discover() {
        let f = frame(12345678);
        let field = volume();
        let resolved = ResolvedField { index: 0, record: &f.data_records[0], field: &field };
        let device = HaDevice::from_frame("kitchen", &f);

        let disc = HaDiscover::new(&device, "kitchen", "home/meters", "homeassistant", &resolved);
        assert_eq!(disc.unique_id, "volume_12345678");
        assert_eq!(disc.state_topic, "home/meters/kitchen/volume/state");
        assert_eq!(disc.discover_topic, "homeassistant/sensor/volume_12345678/config");
        assert_eq!(disc.device.identifiers, vec!["12345678"]);
        assert_eq!(disc.device.model, "Water");

        let json: serde_json::Value = serde_json::to_value(&disc).unwrap();
        assert_eq!(json["device"]["name"], "kitchen");
        assert_eq!(json["device_class"], "water");
        assert_eq!(json["unit_of_measurement"], "m³");
        assert_eq!(json["value_template"], "{{ value_json }}");
        assert!(json.get("discover_topic").is_none());
    }

    #[test]
    fn test_empty_metadata_is_omitted() {
        let f = frame(1);
        let field = FieldDescriptor { publish: true, name: "counter".to_string(), ..Default::default() };
        let resolved = ResolvedField { index: 0, record: &f.data_records[0], field: &field };
        let device = HaDevice::from_frame("hall", &f);

        let json = serde_json::to_value(HaDiscover::new(&device, "hall", "p", "homeassistant", &resolved)).unwrap();
        assert!(json.get("device_class").is_none());
        assert!(json.get("unit_of_measurement").is_none());
    }

    #[test]
    fn test_unique_id_is_deterministic() {
        assert_eq!(unique_id("volume", "42"), unique_id("volume", "42"));
        assert_ne!(unique_id("volume", "42"), unique_id("volume", "43"));
        assert_ne!(unique_id("volume", "42"), unique_id("energy", "42"));
    }
}
