//! Platform-agnostic ESP8266 link logic
//!
//! This crate brings up and maintains the WiFi/TCP link of a UART-attached
//! ESP8266 running the stock AT firmware. It has NO hardware dependencies:
//! boards hand in an `embedded-io-async` writer for the TX side, an
//! `embedded-hal` output pin for the reset line, an `embedded-hal-async`
//! delay, and feed received frames from their idle-line interrupt.
//!
//! - **`frame`**: idle-line framed receiver shared with interrupt context
//! - **`transaction`**: one command/response exchange (send, wait, match)
//! - **`bringup`**: ordered connection pipeline with per-step retries
//! - **`link`**: raw transparent-mode transport for an external MQTT codec
//! - **`config`**: credentials, endpoints and timing
//! - **`error`**: error enum shared by all of the above
//!
//! ## Data flow
//!
//! ```text
//! IDLE irq -> FrameReceiver -> TransactionEngine -> BringUp -> caller
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(warnings)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bringup;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod transaction;

#[cfg(test)]
pub(crate) mod mock;

pub use bringup::{BringUp, LinkState, RetryBudget, Step, TransparentMode};
pub use config::{LinkTiming, MqttIdentity, NetConfig, TOPIC_CAPACITY};
pub use error::LinkError;
pub use frame::{FrameReceiver, RxFrame, RX_CAPACITY};
pub use link::RawLink;
pub use transaction::{CommandSpec, Outcome, TransactionEngine};

/// Receiver sized for the ESP8266 UART link.
pub type Esp8266Receiver = FrameReceiver<RX_CAPACITY>;
