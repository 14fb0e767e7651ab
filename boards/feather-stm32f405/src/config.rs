//! Build-time link configuration
//!
//! Credentials and the server endpoint are taken from the build
//! environment so they stay out of the source tree:
//!
//! ```text
//! WIFI_SSID=... WIFI_PASSWORD=... SERVER_HOST=10.0.0.5 SERVER_PORT=1883 cargo embed
//! ```
//!
//! Unset variables fall back to the placeholders of [`NetConfig::default`].

use esp_link_core::{MqttIdentity, NetConfig};

/// Parse a decimal port number at compile time
const fn parse_port(s: &str, fallback: u16) -> u16 {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return fallback;
    }
    let mut value: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < b'0' || b > b'9' {
            return fallback;
        }
        value = value * 10 + (b - b'0') as u32;
        if value > u16::MAX as u32 {
            return fallback;
        }
        i += 1;
    }
    value as u16
}

const fn env_or(value: Option<&'static str>, fallback: &'static str) -> &'static str {
    match value {
        Some(v) => v,
        None => fallback,
    }
}

const DEFAULT_PORT: u16 = 1883;

const SERVER_PORT: u16 = match option_env!("SERVER_PORT") {
    Some(port) => parse_port(port, DEFAULT_PORT),
    None => DEFAULT_PORT,
};

/// Link configuration for this build
pub fn net_config(client_id: &'static str) -> NetConfig {
    let defaults = NetConfig::default();
    NetConfig {
        ap_ssid: env_or(option_env!("WIFI_SSID"), defaults.ap_ssid),
        ap_password: env_or(option_env!("WIFI_PASSWORD"), defaults.ap_password),
        server_host: env_or(option_env!("SERVER_HOST"), defaults.server_host),
        server_port: SERVER_PORT,
        device_id: client_id,
        mqtt: MqttIdentity {
            client_id,
            username: env_or(option_env!("MQTT_USERNAME"), defaults.mqtt.username),
            password: env_or(option_env!("MQTT_PASSWORD"), defaults.mqtt.password),
            ..defaults.mqtt
        },
    }
}
