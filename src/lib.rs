#![cfg_attr(not(test), no_std)]

//! nRF52820 S140 BLE Sensor Peripheral Library
//!
//! Host-testable core of the sensor peripheral firmware, organized as:
//!
//! - `ble`: GAP identity/advertising/connection handling, GATT registry,
//!   access dispatch, subscriptions and the session engine that ties them
//!   together behind the `HostStack` boundary
//! - `services`: the concrete GATT table (heart rate, automation IO) and the
//!   access handlers that back it
//! - `config`: compile-time constants and the runtime `SessionConfig`
//! - `error`: startup error aggregation

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod ble;
pub mod config;
pub mod error;
pub mod services;
