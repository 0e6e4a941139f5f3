//! BLE Protocol Implementation
//!
//! GAP identity, advertising and connection handling, the GATT attribute
//! registry with its access dispatcher, subscription tracking, and the
//! session engine that composes them behind the [`host::HostStack`] boundary.

pub mod access;
pub mod advertising;
pub mod connection;
pub mod events;
pub mod gap_state;
pub mod host;
pub mod identity;
pub mod notifications;
pub mod registry;
pub mod session;
#[cfg(feature = "embedded")]
pub mod softdevice;
