use serde::{Serialize, Serializer};

/// Value reported by a DS18B20 that dropped off the bus.
pub const DEVICE_DISCONNECTED_C: f32 = -127.0;
pub const MIN_VALID_TEMP_C: f32 = -55.0;
pub const MAX_VALID_TEMP_C: f32 = 125.0;

pub fn format_rom_address(rom: [u8; 8]) -> String {
    crate::ota::hex_digest(&rom)
}

pub fn is_valid_celsius(temp_c: f32) -> bool {
    temp_c.is_finite() && (MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(&temp_c)
}

/// When to look for probes on the one-wire bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeScan {
    pub wanted: usize,
    pub boot_attempts: u32,
}

impl ProbeScan {
    pub fn new(wanted: u8, boot_attempts: u32) -> Self {
        Self {
            wanted: usize::from(wanted),
            boot_attempts,
        }
    }

    /// Boot scanning stops as soon as one probe answers. Probes still
    /// missing are picked up by `needs_rescan` before later reads.
    pub fn retry_at_boot(&self, attempt: u32, found: usize) -> bool {
        found == 0 && attempt < self.boot_attempts
    }

    pub fn needs_rescan(&self, found: usize) -> bool {
        found < self.wanted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub address: String,
    pub celsius: Option<f32>,
}

impl SensorReading {
    pub fn new(address: impl Into<String>, raw_celsius: Option<f32>) -> Self {
        Self {
            address: address.into(),
            celsius: raw_celsius.filter(|temp| is_valid_celsius(*temp)),
        }
    }
}

/// Flat `address_N` / `temperature_N` report, numbered from 1 in bus order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureReport {
    pub readings: Vec<SensorReading>,
}

impl TemperatureReport {
    pub fn new(readings: Vec<SensorReading>) -> Self {
        Self { readings }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (index, reading) in self.readings.iter().enumerate() {
            let n = index + 1;
            object.insert(
                format!("address_{n}"),
                serde_json::Value::String(reading.address.clone()),
            );
            let temperature = reading
                .celsius
                .and_then(|temp| serde_json::Number::from_f64(round_hundredths(temp)))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
            object.insert(format!("temperature_{n}"), temperature);
        }
        serde_json::Value::Object(object)
    }
}

impl Serialize for TemperatureReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

fn round_hundredths(temp_c: f32) -> f64 {
    (f64::from(temp_c) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn rom_address_is_lowercase_hex() {
        let rom = [0x28, 0xFF, 0x4C, 0x1A, 0x05, 0x16, 0x03, 0xB2];
        assert_eq!(format_rom_address(rom), "28ff4c1a051603b2");
    }

    #[test]
    fn disconnected_sensor_reads_as_none() {
        let reading = SensorReading::new("28ff", Some(DEVICE_DISCONNECTED_C));
        assert_eq!(reading.celsius, None);

        let reading = SensorReading::new("28ff", Some(f32::NAN));
        assert_eq!(reading.celsius, None);

        let reading = SensorReading::new("28ff", Some(24.5));
        assert_eq!(reading.celsius, Some(24.5));
    }

    #[test]
    fn report_uses_numbered_keys() {
        let report = TemperatureReport::new(vec![
            SensorReading::new("28aa000000000001", Some(26.25)),
            SensorReading::new("28aa000000000002", None),
        ]);

        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(
            value,
            json!({
                "address_1": "28aa000000000001",
                "temperature_1": 26.25,
                "address_2": "28aa000000000002",
                "temperature_2": null,
            })
        );
    }

    #[test]
    fn report_keys_keep_bus_order() {
        let report = TemperatureReport::new(vec![
            SensorReading::new("28aa000000000001", Some(26.25)),
            SensorReading::new("28aa000000000002", Some(31.0)),
        ]);

        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"address_1":"28aa000000000001","temperature_1":26.25,"address_2":"28aa000000000002","temperature_2":31.0}"#
        );
    }

    #[test]
    fn boot_scan_stops_at_first_probe() {
        let scan = ProbeScan::new(2, 10);

        assert!(scan.retry_at_boot(1, 0));
        assert!(!scan.retry_at_boot(1, 1));
        assert!(!scan.retry_at_boot(10, 0));

        assert!(scan.needs_rescan(1));
        assert!(!scan.needs_rescan(2));
    }

    #[test]
    fn empty_report_is_empty_object() {
        let report = TemperatureReport::default();
        assert!(report.is_empty());
        assert_eq!(serde_json::to_string(&report).unwrap(), "{}");
    }
}
