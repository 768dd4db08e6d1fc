// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Device telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role a device plays in a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    TempSensor,
    ActHeating,
    ActCooling,
    ActVentilation,
}

impl DeviceType {
    /// Reports whether this role is an actuator.
    pub fn is_actuator(&self) -> bool {
        !matches!(self, DeviceType::TempSensor)
    }
}

/// The measurement payload of a telemetry message.
///
/// Which fields are present depends on the device's role: sensors report
/// `temperature`, actuators report `actuator_state` and power/energy. Unknown
/// fields in the wire envelope are dropped on decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuator_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_kwh: Option<f64>,
}

/// A single telemetry message as produced on `device.readings.<zone>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: String,
    pub device_type: DeviceType,
    pub zone_id: String,
    pub timestamp: DateTime<Utc>,
    pub reading: ReadingBody,
}

impl DeviceReading {
    /// Reports whether the measurement is consistent with the device's
    /// declared role: sensors must carry a finite temperature, actuators a
    /// state bit. Inconsistent readings are discarded by the aggregator.
    pub fn is_well_formed(&self) -> bool {
        match self.device_type {
            DeviceType::TempSensor => self
                .reading
                .temperature
                .map_or(false, |t| t.is_finite()),
            DeviceType::ActHeating | DeviceType::ActCooling | DeviceType::ActVentilation => {
                self.reading.actuator_state.is_some()
            }
        }
    }
}

/// A reading as it appears inside an [`crate::AggregatedEpoch`], stripped of
/// the wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReading {
    pub device_id: String,
    pub zone_id: String,
    pub device_type: DeviceType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuator_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_kwh: Option<f64>,
}

impl From<DeviceReading> for AggregatedReading {
    fn from(r: DeviceReading) -> AggregatedReading {
        AggregatedReading {
            device_id: r.device_id,
            zone_id: r.zone_id,
            device_type: r.device_type,
            timestamp: r.timestamp,
            temperature: r.reading.temperature,
            actuator_state: r.reading.actuator_state,
            power_w: r.reading.power_w,
            energy_kwh: r.reading.energy_kwh,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{DeviceReading, DeviceType, ReadingBody};

    fn sensor_reading(temperature: Option<f64>) -> DeviceReading {
        DeviceReading {
            device_id: "t-1".into(),
            device_type: DeviceType::TempSensor,
            zone_id: "A".into(),
            timestamp: Utc::now(),
            reading: ReadingBody {
                temperature,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_device_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeviceType::TempSensor).unwrap(),
            "\"temp_sensor\""
        );
        assert_eq!(
            serde_json::to_string(&DeviceType::ActVentilation).unwrap(),
            "\"act_ventilation\""
        );
    }

    #[test]
    fn test_non_finite_temperatures_are_malformed() {
        assert!(sensor_reading(Some(21.5)).is_well_formed());
        assert!(!sensor_reading(Some(f64::NAN)).is_well_formed());
        assert!(!sensor_reading(Some(f64::INFINITY)).is_well_formed());
        assert!(!sensor_reading(None).is_well_formed());
    }

    #[test]
    fn test_actuator_requires_state() {
        let mut r = sensor_reading(None);
        r.device_type = DeviceType::ActHeating;
        assert!(!r.is_well_formed());
        r.reading.actuator_state = Some(true);
        assert!(r.is_well_formed());
    }

    #[test]
    fn test_envelope_overhead_is_stripped() {
        let raw = serde_json::json!({
            "deviceId": "t-9",
            "deviceType": "temp_sensor",
            "zoneId": "A",
            "timestamp": "2026-03-01T12:00:00Z",
            "reading": {"temperature": 20.0, "traceId": "abc"},
            "logLevel": "debug",
        });
        let r: DeviceReading = serde_json::from_value(raw).unwrap();
        assert_eq!(r.reading.temperature, Some(20.0));
    }
}
