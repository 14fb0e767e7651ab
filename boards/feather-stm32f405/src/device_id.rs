//! Device identifier for the MQTT session
//!
//! The STM32F405 carries a factory-programmed 96-bit unique ID that is
//! stable across reboots; it names this node on the broker.

use heapless::String;

const CLIENT_ID_PREFIX: &str = "esp-link-";

/// Prefix (9 chars) + 24 hex chars
pub const CLIENT_ID_MAX_LEN: usize = 33;

const _: () = assert!(CLIENT_ID_PREFIX.len() + 24 == CLIENT_ID_MAX_LEN);

/// 24-character hex rendering of the 96-bit UID
pub fn uid_hex() -> &'static str {
    embassy_stm32::uid::uid_hex()
}

/// MQTT client ID in the form `esp-link-{uid}`
pub fn mqtt_client_id() -> String<CLIENT_ID_MAX_LEN> {
    let mut client_id = String::<CLIENT_ID_MAX_LEN>::new();
    // CLIENT_ID_MAX_LEN is exactly prefix + UID
    let pushed = client_id
        .push_str(CLIENT_ID_PREFIX)
        .and_then(|()| client_id.push_str(uid_hex()));
    debug_assert!(pushed.is_ok(), "client ID capacity too small");
    client_id
}
