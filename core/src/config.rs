//! Link configuration structures
//!
//! Values are plain `&'static str` storage baked into the firmware image;
//! nothing here is treated as a secret beyond that.

use core::fmt::Write;

use heapless::String;

/// Base response timeout unit of the ESP8266 AT firmware, in milliseconds
pub const ESP8266_MAX_TIMEOUT_MS: u32 = 0x0fff;

/// Retry budget of a mandatory bring-up step
pub const ESP8266_MAX_RETRY_TIME: u8 = 10;

/// Longest topic [`NetConfig::device_topic`] builds
pub const TOPIC_CAPACITY: usize = 64;

/// Access point, server endpoint and device identity
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// SSID of the access point to join
    pub ap_ssid: &'static str,
    /// WPA passphrase of the access point
    pub ap_password: &'static str,
    /// Server host name or dotted IPv4 address, passed verbatim to `AT+CIPSTART`
    pub server_host: &'static str,
    /// Server TCP port
    pub server_port: u16,
    /// Human-readable device name
    pub device_id: &'static str,
    /// Identity presented to the MQTT broker
    pub mqtt: MqttIdentity,
}

impl NetConfig {
    /// Topic `device/{device_id}/{subtopic}` for this node.
    ///
    /// Returns `None` if either part holds an MQTT wildcard or a NUL, or
    /// the topic exceeds [`TOPIC_CAPACITY`].
    pub fn device_topic(&self, subtopic: &str) -> Option<String<TOPIC_CAPACITY>> {
        let forbidden = |s: &str| s.is_empty() || s.contains(['+', '#', '\0']);
        if forbidden(self.device_id) || forbidden(subtopic) {
            return None;
        }

        let mut topic = String::new();
        write!(topic, "device/{}/{}", self.device_id, subtopic).ok()?;
        Some(topic)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "SSID",
            ap_password: "PASS",
            server_host: "192.168.1.1",
            server_port: 1883,
            device_id: "esp8266-node",
            mqtt: MqttIdentity::default(),
        }
    }
}

/// MQTT session identity handed to the external MQTT codec
#[derive(Debug, Clone, Copy)]
pub struct MqttIdentity {
    pub client_id: &'static str,
    pub username: &'static str,
    pub password: &'static str,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
}

impl MqttIdentity {
    /// User name for CONNECT, absent when left empty
    pub fn user_name(&self) -> Option<&'static str> {
        (!self.username.is_empty()).then_some(self.username)
    }

    /// Password for CONNECT.
    ///
    /// Only sent together with a user name, as MQTT 3.1.1 brokers reject
    /// a password flag without the user name flag.
    pub fn password(&self) -> Option<&'static str> {
        self.user_name()?;
        (!self.password.is_empty()).then_some(self.password)
    }
}

impl Default for MqttIdentity {
    fn default() -> Self {
        Self {
            client_id: "ID",
            username: "USER",
            password: "PASS",
            keep_alive_secs: 60,
        }
    }
}

/// Timeouts, delays and retry limits of the bring-up pipeline
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    /// Base timeout for query and mode-switch commands
    pub base_timeout_ms: u32,
    /// Timeout for plain configuration commands
    pub short_timeout_ms: u32,
    /// Multiplier applied to `base_timeout_ms` for AP join and TCP open
    pub extended_factor: u32,
    /// Attempts after the first one before a mandatory step gives up
    pub max_retries: u8,
    /// Fixed pause between two attempts of the same step
    pub retry_backoff_ms: u32,
    /// Pause after every completed step
    pub step_settle_ms: u32,
    /// How long the reset line is held low
    pub reset_pulse_ms: u32,
    /// How long to wait for the boot banner after releasing reset
    pub reset_wait_ms: u32,
    /// Pause after the boot banner before the first command
    pub reset_settle_ms: u32,
}

impl LinkTiming {
    /// Timeout for the AP join and TCP open composites
    pub const fn extended_timeout_ms(&self) -> u32 {
        self.base_timeout_ms.saturating_mul(self.extended_factor)
    }

    /// Retry budget of the informational query steps
    pub const fn optional_retries(&self) -> u8 {
        self.max_retries / 2
    }
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            base_timeout_ms: ESP8266_MAX_TIMEOUT_MS,
            short_timeout_ms: 1000,
            extended_factor: 3,
            max_retries: ESP8266_MAX_RETRY_TIME,
            retry_backoff_ms: 100,
            step_settle_ms: 100,
            reset_pulse_ms: 500,
            reset_wait_ms: 500,
            reset_settle_ms: 2000,
        }
    }
}
