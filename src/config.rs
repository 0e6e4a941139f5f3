//! Application-wide constants and compile-time configuration.
//!
//! Timing parameters, GAP presentation and capacity limits live here so they
//! can be tuned in one place. [`SessionConfig`] carries the subset that the
//! session engine takes at runtime.

// GAP identity

/// Advertised device name.
pub const DEVICE_NAME: &str = "henri-lok";

/// Maximum stored device name length.
pub const MAX_DEVICE_NAME_LEN: usize = 32;

/// Prefer a random static identity address over the public one.
pub const PREFER_PRIVACY: bool = false;

/// GAP appearance: generic tag.
pub const APPEARANCE_GENERIC_TAG: u16 = 0x0200;

/// Advertised TX power level (dBm).
pub const ADV_TX_POWER_DBM: i8 = 0;

/// URI carried in the scan response. The scheme is encoded separately as
/// [`URI_SCHEME_HTTPS`].
pub const IDENTITY_URI: &str = "//espressif.com";

/// URI scheme name string code point for "https:".
pub const URI_SCHEME_HTTPS: u8 = 0x17;

// Advertising

/// Advertising interval window in milliseconds.
pub const ADV_INTERVAL_MIN_MS: u32 = 500;
pub const ADV_INTERVAL_MAX_MS: u32 = 510;

/// Convert milliseconds to advertising interval units (0.625 ms).
pub const fn adv_interval_units(ms: u32) -> u32 {
    ms * 1000 / 625
}

// Connection

/// Slave latency requested right after a connection is established.
pub const PREFERRED_SLAVE_LATENCY: u16 = 3;

/// Default ATT MTU before any exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// HCI reason used when this side terminates a link.
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;

// GATT capacities

/// Maximum number of services in the attribute table.
pub const MAX_SERVICES: usize = 4;

/// Maximum number of characteristics across all services.
pub const MAX_CHARACTERISTICS: usize = 8;

/// Attribute table limit of the host stack (declarations, values, CCCDs).
pub const MAX_ATTRIBUTES: usize = 32;

/// Largest characteristic value (default ATT MTU minus opcode and handle).
pub const MAX_VALUE_LEN: usize = (DEFAULT_ATT_MTU as usize) - 3;

// Heart rate producer

/// Sampling period of the heart rate producer (ms).
pub const HEART_RATE_PERIOD_MS: u64 = 1000;

/// Simulated heart rate range: `BASE + random % SPAN`.
pub const HEART_RATE_BASE_BPM: u8 = 60;
pub const HEART_RATE_SPAN_BPM: u8 = 21;

/// Runtime configuration consumed by the session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub device_name: &'static str,
    pub preferred_privacy: bool,
    pub appearance: u16,
    pub tx_power_dbm: i8,
    pub uri: &'static str,
    /// Advertising interval window (0.625 ms units).
    pub adv_interval_min: u32,
    pub adv_interval_max: u32,
    pub preferred_slave_latency: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME,
            preferred_privacy: PREFER_PRIVACY,
            appearance: APPEARANCE_GENERIC_TAG,
            tx_power_dbm: ADV_TX_POWER_DBM,
            uri: IDENTITY_URI,
            adv_interval_min: adv_interval_units(ADV_INTERVAL_MIN_MS),
            adv_interval_max: adv_interval_units(ADV_INTERVAL_MAX_MS),
            preferred_slave_latency: PREFERRED_SLAVE_LATENCY,
        }
    }
}
