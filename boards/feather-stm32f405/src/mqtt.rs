//! MQTT v5.0 session over the ESP8266 transparent-mode link
//!
//! The modem already holds the TCP connection to the broker, so
//! `rust-mqtt` runs directly on [`RawLink`]: every packet it writes goes
//! out on USART3 verbatim and every idle-line frame is read back as
//! broker data.
//!
//! Once connected the session publishes a telemetry message to
//! `device/{device_id}/telemetry` at half the keep-alive interval. Any
//! client packet restarts the broker's keep-alive timer, so no separate
//! PINGREQ is needed. The first failed publish ends the session and hands
//! control back to the link task, which brings the modem up again.
//!
//! # Memory Management
//!
//! Uses the bump allocator pattern from `rust-mqtt` for no_std
//! compatibility, with a 2KB packet buffer on the link task's stack.

#![allow(unsafe_code)] // TopicName::new_unchecked on a validated topic

use core::fmt::Write as _;

use defmt::{error, info, Debug2Format, Format};
use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;
use esp_link_core::{MqttIdentity, NetConfig, RawLink};
use heapless::String;
use rtic_monotonics::stm32::prelude::*;
use rust_mqtt::{
    buffer::BumpBuffer,
    client::{
        options::{ConnectOptions, PublicationOptions, TopicReference},
        Client,
    },
    config::{KeepAlive, SessionExpiryInterval},
    types::{MqttBinary, MqttString, QoS, TopicName},
    Bytes,
};

use crate::Mono;

/// MQTT packet buffer size: 2KB for packet assembly
const MQTT_BUFFER_SIZE: usize = 2048;

/// Telemetry payload buffer
const PAYLOAD_CAPACITY: usize = 128;

/// Publish interval when the broker keep-alive is disabled
const IDLE_PUBLISH_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum SessionError {
    /// The client ID is not a valid MQTT string
    ClientId,
    /// User name or password is not a valid MQTT field
    Credentials,
    /// The telemetry topic could not be built from the device ID
    Topic,
    /// CONNECT was not acknowledged
    ConnectFailed,
    /// The telemetry payload did not fit its buffer
    Payload,
    /// A PUBLISH could not be written to the link
    PublishFailed,
}

fn keep_alive(secs: u16) -> KeepAlive {
    if secs == 0 {
        KeepAlive::Infinite
    } else {
        KeepAlive::Seconds(secs)
    }
}

/// Seconds between two telemetry messages.
///
/// Half the keep-alive, so the broker always sees traffic well inside its
/// 1.5x grace period.
fn publish_interval_secs(identity: &MqttIdentity) -> u64 {
    match identity.keep_alive_secs {
        0 => IDLE_PUBLISH_SECS,
        secs => u64::from(secs / 2).max(1),
    }
}

fn telemetry_payload(msg_id: u32) -> Result<String<PAYLOAD_CAPACITY>, SessionError> {
    let mut payload = String::new();
    write!(
        payload,
        "{{\"msg_id\":{},\"uptime_secs\":{}}}",
        msg_id,
        Instant::now().as_secs()
    )
    .map_err(|_| {
        error!("Failed to format telemetry payload");
        SessionError::Payload
    })?;
    Ok(payload)
}

/// Open an MQTT session on `link` and publish telemetry on it.
///
/// Returns only when the session could not be established or the link
/// stopped accepting packets.
pub async fn run_session<T, D, const N: usize>(
    link: RawLink<'_, T, D, N>,
    net: &NetConfig,
) -> Result<(), SessionError>
where
    T: Write,
    D: DelayNs,
{
    let identity = &net.mqtt;
    info!("MQTT client ID: {}", identity.client_id);

    let topic = net.device_topic("telemetry").ok_or_else(|| {
        error!("Device ID {} does not form a valid topic", net.device_id);
        SessionError::Topic
    })?;

    let mut mqtt_buffer = [0u8; MQTT_BUFFER_SIZE];
    let mut buffer = BumpBuffer::new(&mut mqtt_buffer);
    let mut mqtt_client = Client::<'_, _, _, 1, 1, 1, 0>::new(&mut buffer);

    let user_name = identity
        .user_name()
        .map(|name| MqttString::new(name.into()))
        .transpose()
        .map_err(|e| {
            error!("Invalid MQTT user name: {:?}", Debug2Format(&e));
            SessionError::Credentials
        })?;
    let password = identity
        .password()
        .map(|password| MqttBinary::new(Bytes::from(password.as_bytes())))
        .transpose()
        .map_err(|e| {
            error!("Invalid MQTT password: {:?}", Debug2Format(&e));
            SessionError::Credentials
        })?;

    let connect_opts = ConnectOptions {
        session_expiry_interval: SessionExpiryInterval::EndOnDisconnect,
        clean_start: true,
        keep_alive: keep_alive(identity.keep_alive_secs),
        will: None,
        user_name,
        password,
    };

    let client_id = MqttString::new(identity.client_id.into()).map_err(|e| {
        error!(
            "Failed to create MQTT client ID string: {:?}",
            Debug2Format(&e)
        );
        SessionError::ClientId
    })?;

    mqtt_client
        .connect(link, &connect_opts, Some(client_id))
        .await
        .map_err(|e| {
            error!("MQTT connect failed: {:?}", Debug2Format(&e));
            SessionError::ConnectFailed
        })?;

    info!("MQTT connection established over ESP8266");

    let interval = publish_interval_secs(identity);
    let mut msg_id = 0u32;

    loop {
        Mono::delay(interval.secs()).await;
        msg_id = msg_id.wrapping_add(1);

        let payload = telemetry_payload(msg_id)?;

        // SAFETY: device_topic() rejects '+', '#' and NUL in both topic
        // levels and builds the fixed `device/{id}/{subtopic}` shape.
        let topic_name = unsafe {
            TopicName::new_unchecked(MqttString::new(topic.as_str().into()).map_err(|e| {
                error!("Failed to create MQTT topic string: {:?}", Debug2Format(&e));
                SessionError::Topic
            })?)
        };

        let pub_options = PublicationOptions {
            retain: false,
            message_expiry_interval: None,
            topic: TopicReference::Name(topic_name),
            qos: QoS::AtMostOnce,
        };

        match mqtt_client
            .publish(&pub_options, Bytes::from(payload.as_bytes()))
            .await
        {
            Ok(packet_id) => info!(
                "Telemetry #{} published to {} (packet_id: {})",
                msg_id,
                topic.as_str(),
                packet_id
            ),
            Err(e) => {
                error!(
                    "Failed to publish telemetry #{}: {:?}",
                    msg_id,
                    Debug2Format(&e)
                );
                return Err(SessionError::PublishFailed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_interval_stays_inside_keep_alive() {
        let identity = MqttIdentity::default();
        assert_eq!(publish_interval_secs(&identity), 30);

        let short = MqttIdentity {
            keep_alive_secs: 1,
            ..MqttIdentity::default()
        };
        assert_eq!(publish_interval_secs(&short), 1);

        let disabled = MqttIdentity {
            keep_alive_secs: 0,
            ..MqttIdentity::default()
        };
        assert_eq!(publish_interval_secs(&disabled), IDLE_PUBLISH_SECS);
    }
}
