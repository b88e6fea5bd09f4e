use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub temperature_publish_interval_ms: u64,
    pub state_publish_interval_ms: u64,
    pub valve_switch_timeout_ms: u64,
    pub mqtt_retry_delay_ms: u64,
    pub wifi_connect_attempts: u32,
    pub wifi_retry_delay_ms: u64,
    pub wifi_restart_grace_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            temperature_publish_interval_ms: 30_000,
            state_publish_interval_ms: 10_000,
            valve_switch_timeout_ms: 120_000,
            mqtt_retry_delay_ms: 5_000,
            wifi_connect_attempts: 10,
            wifi_retry_delay_ms: 5_000,
            wifi_restart_grace_ms: 300_000,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        self.temperature_publish_interval_ms =
            self.temperature_publish_interval_ms.clamp(5_000, 3_600_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 600_000);
        if self.valve_switch_timeout_ms == 0 {
            self.valve_switch_timeout_ms = defaults.valve_switch_timeout_ms;
        }
        if self.wifi_connect_attempts == 0 {
            self.wifi_connect_attempts = defaults.wifi_connect_attempts;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub one_wire_pin: i32,
    pub relay_regular_pin: i32,
    pub relay_solar_pin: i32,
    pub feedback_regular_pin: i32,
    pub feedback_solar_pin: i32,
    pub sensor_count: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            one_wire_pin: 15,
            relay_regular_pin: 18,
            relay_solar_pin: 19,
            feedback_regular_pin: 25,
            feedback_solar_pin: 26,
            sensor_count: 2,
        }
    }
}

impl HardwareConfig {
    pub fn pins(&self) -> [i32; 5] {
        [
            self.one_wire_pin,
            self.relay_regular_pin,
            self.relay_solar_pin,
            self.feedback_regular_pin,
            self.feedback_solar_pin,
        ]
    }

    pub fn sanitize(&mut self) {
        let pins = self.pins();
        let has_negative = pins.iter().any(|pin| *pin < 0);
        let has_duplicate = pins
            .iter()
            .enumerate()
            .any(|(i, pin)| pins[i + 1..].contains(pin));

        if has_negative || has_duplicate {
            let sensor_count = self.sensor_count;
            *self = Self::default();
            self.sensor_count = sensor_count;
        }

        self.sensor_count = self.sensor_count.clamp(1, 8);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    #[serde(default = "default_client_id")]
    pub mqtt_client_id: String,
    pub ota_password: String,
}

fn default_client_id() -> String {
    "ESP32-PoolControl".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: default_client_id(),
            ota_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.hardware.sanitize();
        if self.network.mqtt_client_id.trim().is_empty() {
            self.network.mqtt_client_id = default_client_id();
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    pub mqtt_pass_set: bool,
    #[serde(rename = "mqttClientId")]
    pub mqtt_client_id: String,
    #[serde(rename = "otaPasswordSet")]
    pub ota_password_set: bool,
}

impl From<&NetworkConfig> for NetworkConfigView {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            wifi_ssid: network.wifi_ssid.clone(),
            wifi_pass_set: !network.wifi_pass.is_empty(),
            mqtt_host: network.mqtt_host.clone(),
            mqtt_port: network.mqtt_port,
            mqtt_user: network.mqtt_user.clone(),
            mqtt_pass_set: !network.mqtt_pass.is_empty(),
            mqtt_client_id: network.mqtt_client_id.clone(),
            ota_password_set: !network.ota_password.is_empty(),
        }
    }
}

/// Body of `PUT /api/network`. Omitted secrets keep their stored value.
#[derive(Debug, Deserialize)]
pub struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser", default)]
    pub mqtt_user: String,
    #[serde(rename = "mqttPass", default)]
    pub mqtt_pass: Option<String>,
    #[serde(rename = "mqttClientId", default)]
    pub mqtt_client_id: Option<String>,
    #[serde(rename = "otaPassword", default)]
    pub ota_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NetworkUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub network: NetworkConfigView,
}

pub fn validate_network_update(update: &NetworkConfigUpdate) -> Result<(), &'static str> {
    if update.wifi_ssid.trim().is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    if update.wifi_ssid.len() > 32 {
        return Err("wifiSsid must be at most 32 bytes");
    }
    if update.wifi_pass.as_ref().is_some_and(|pass| pass.len() > 64) {
        return Err("wifiPass must be at most 64 bytes");
    }
    if update.mqtt_host.trim().is_empty() {
        return Err("mqttHost cannot be empty");
    }
    if update.mqtt_port == 0 {
        return Err("mqttPort must be between 1 and 65535");
    }
    if update
        .mqtt_client_id
        .as_ref()
        .is_some_and(|id| id.trim().is_empty())
    {
        return Err("mqttClientId cannot be empty");
    }

    Ok(())
}

/// Merges a validated update into `network` and reports whether the device
/// must restart to pick it up.
pub fn apply_network_update(
    network: &mut NetworkConfig,
    update: NetworkConfigUpdate,
) -> NetworkUpdateResponse {
    let previous = network.clone();

    network.wifi_ssid = update.wifi_ssid.trim().to_string();
    if let Some(pass) = update.wifi_pass {
        network.wifi_pass = pass;
    }
    network.mqtt_host = update.mqtt_host.trim().to_string();
    network.mqtt_port = update.mqtt_port;
    network.mqtt_user = update.mqtt_user;
    if let Some(pass) = update.mqtt_pass {
        network.mqtt_pass = pass;
    }
    if let Some(client_id) = update.mqtt_client_id {
        network.mqtt_client_id = client_id.trim().to_string();
    }
    if let Some(pass) = update.ota_password {
        network.ota_password = pass;
    }

    NetworkUpdateResponse {
        restart_required: network_restart_required(&previous, network),
        network: NetworkConfigView::from(&*network),
    }
}

fn network_restart_required(previous: &NetworkConfig, current: &NetworkConfig) -> bool {
    previous.wifi_ssid != current.wifi_ssid
        || previous.wifi_pass != current.wifi_pass
        || previous.mqtt_host != current.mqtt_host
        || previous.mqtt_port != current.mqtt_port
        || previous.mqtt_user != current.mqtt_user
        || previous.mqtt_pass != current.mqtt_pass
        || previous.mqtt_client_id != current.mqtt_client_id
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn update() -> NetworkConfigUpdate {
        NetworkConfigUpdate {
            wifi_ssid: "garden".to_string(),
            wifi_pass: None,
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: None,
            mqtt_client_id: None,
            ota_password: None,
        }
    }

    #[test]
    fn duplicate_pins_restore_defaults() {
        let mut hardware = HardwareConfig {
            relay_solar_pin: 18,
            sensor_count: 3,
            ..HardwareConfig::default()
        };

        hardware.sanitize();

        assert_eq!(
            hardware,
            HardwareConfig {
                sensor_count: 3,
                ..HardwareConfig::default()
            }
        );
    }

    #[test]
    fn sensor_count_is_clamped() {
        let mut hardware = HardwareConfig {
            sensor_count: 0,
            ..HardwareConfig::default()
        };
        hardware.sanitize();
        assert_eq!(hardware.sensor_count, 1);

        hardware.sensor_count = 40;
        hardware.sanitize();
        assert_eq!(hardware.sensor_count, 8);
    }

    #[test]
    fn old_blob_without_new_sections_loads() {
        let raw = r#"{"network":{"wifi_ssid":"garden","wifi_pass":"x","mqtt_host":"broker",
            "mqtt_port":1883,"mqtt_user":"","mqtt_pass":"","ota_password":""}}"#;

        let mut runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();
        runtime.sanitize();

        assert_eq!(runtime.network.mqtt_client_id, "ESP32-PoolControl");
        assert_eq!(runtime.hardware, HardwareConfig::default());
        assert_eq!(runtime.controller.temperature_publish_interval_ms, 30_000);
    }

    #[test]
    fn network_update_validation() {
        assert_eq!(validate_network_update(&update()), Ok(()));

        let mut bad = update();
        bad.wifi_ssid = "  ".to_string();
        assert_eq!(
            validate_network_update(&bad),
            Err("wifiSsid cannot be empty")
        );

        let mut bad = update();
        bad.mqtt_port = 0;
        assert_eq!(
            validate_network_update(&bad),
            Err("mqttPort must be between 1 and 65535")
        );

        let mut bad = update();
        bad.mqtt_client_id = Some(String::new());
        assert_eq!(
            validate_network_update(&bad),
            Err("mqttClientId cannot be empty")
        );
    }

    #[test]
    fn omitted_secrets_are_kept() {
        let mut network = NetworkConfig {
            wifi_ssid: "garden".to_string(),
            wifi_pass: "secret".to_string(),
            mqtt_pass: "broker-secret".to_string(),
            ..NetworkConfig::default()
        };

        let response = apply_network_update(&mut network, update());

        assert!(!response.restart_required);
        assert_eq!(network.wifi_pass, "secret");
        assert_eq!(network.mqtt_pass, "broker-secret");
        assert!(response.network.wifi_pass_set);
    }

    #[test]
    fn changed_broker_requires_restart() {
        let mut network = NetworkConfig {
            wifi_ssid: "garden".to_string(),
            ..NetworkConfig::default()
        };
        let mut change = update();
        change.mqtt_host = "broker.local".to_string();

        let response = apply_network_update(&mut network, change);

        assert!(response.restart_required);
        assert_eq!(network.mqtt_host, "broker.local");
    }

    #[test]
    fn ota_password_change_does_not_require_restart() {
        let mut network = NetworkConfig {
            wifi_ssid: "garden".to_string(),
            ..NetworkConfig::default()
        };
        let mut change = update();
        change.ota_password = Some("letmein".to_string());

        let response = apply_network_update(&mut network, change);

        assert!(!response.restart_required);
        assert!(response.network.ota_password_set);
    }
}
