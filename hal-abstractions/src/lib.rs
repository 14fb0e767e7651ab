//! Hardware abstraction traits for IoT firmware
//!
//! This crate defines traits that abstract over hardware differences
//! between boards. BSPs implement these traits.
//!
//! Serial transmit, GPIO and delays are covered by `embedded-io-async`,
//! `embedded-hal` and `embedded-hal-async`; only the pieces those crates
//! do not model live here.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(warnings)]

pub mod idle_rx;

pub use idle_rx::IdleLineRx;
