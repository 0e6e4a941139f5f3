//! BLE Advertising Controller
//!
//! Composes the legacy advertising and scan response payloads from the
//! device identity and drives advertising start/stop through the host stack.
//! Payloads are composed once at startup so size errors surface before the
//! radio is ever enabled.

use heapless::Vec;

use crate::ble::host::HostStack;
use crate::ble::identity::{AddressType, BdAddr, DeviceIdentity};
use crate::config::{SessionConfig, URI_SCHEME_HTTPS};

/// Maximum advertising data length (legacy PDU)
pub const MAX_ADV_DATA_LEN: usize = 31;

/// Encoded AD payload
pub type AdvPayload = Vec<u8, MAX_ADV_DATA_LEN>;

/// Flags AD field bits
pub mod ad_flags {
    pub const LE_GENERAL_DISCOVERABLE: u8 = 0x02;
    pub const BR_EDR_NOT_SUPPORTED: u8 = 0x04;
}

/// AD type codes (Bluetooth Assigned Numbers)
mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const APPEARANCE: u8 = 0x19;
    pub const ADVERTISING_INTERVAL: u8 = 0x1A;
    pub const LE_DEVICE_ADDRESS: u8 = 0x1B;
    pub const LE_ROLE: u8 = 0x1C;
    pub const URI: u8 = 0x24;
}

/// LE Role: only peripheral role supported
pub const LE_ROLE_PERIPHERAL_ONLY: u8 = 0x00;

/// Single AD structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdStructure<'a> {
    Flags(u8),
    CompleteLocalName(&'a str),
    TxPowerLevel(i8),
    Appearance(u16),
    LeRole(u8),
    LeDeviceAddress { address: BdAddr, address_type: AddressType },
    /// Advertising interval (0.625ms units)
    AdvertisingInterval(u16),
    Uri { scheme: u8, body: &'a str },
}

impl AdStructure<'_> {
    /// Append the length-type-value encoding of this structure.
    pub fn encode(&self, out: &mut AdvPayload) -> Result<(), AdvertisingError> {
        let mut scratch = [0u8; MAX_ADV_DATA_LEN];
        let (ty, body): (u8, &[u8]) = match *self {
            AdStructure::Flags(flags) => {
                scratch[0] = flags;
                (ad_type::FLAGS, &scratch[..1])
            }
            AdStructure::CompleteLocalName(name) => (ad_type::COMPLETE_LOCAL_NAME, name.as_bytes()),
            AdStructure::TxPowerLevel(dbm) => {
                scratch[0] = dbm as u8;
                (ad_type::TX_POWER_LEVEL, &scratch[..1])
            }
            AdStructure::Appearance(appearance) => {
                scratch[..2].copy_from_slice(&appearance.to_le_bytes());
                (ad_type::APPEARANCE, &scratch[..2])
            }
            AdStructure::LeRole(role) => {
                scratch[0] = role;
                (ad_type::LE_ROLE, &scratch[..1])
            }
            AdStructure::LeDeviceAddress { address, address_type } => {
                scratch[..6].copy_from_slice(&address.bytes());
                scratch[6] = address_type.ad_type_flag();
                (ad_type::LE_DEVICE_ADDRESS, &scratch[..7])
            }
            AdStructure::AdvertisingInterval(interval) => {
                scratch[..2].copy_from_slice(&interval.to_le_bytes());
                (ad_type::ADVERTISING_INTERVAL, &scratch[..2])
            }
            AdStructure::Uri { scheme, body } => {
                let bytes = body.as_bytes();
                if bytes.len() + 1 > scratch.len() {
                    return Err(AdvertisingError::DataTooLarge);
                }
                scratch[0] = scheme;
                scratch[1..=bytes.len()].copy_from_slice(bytes);
                (ad_type::URI, &scratch[..=bytes.len()])
            }
        };

        if body.len() + 2 > out.capacity() - out.len() {
            return Err(AdvertisingError::DataTooLarge);
        }
        out.push(body.len() as u8 + 1).map_err(|_| AdvertisingError::DataTooLarge)?;
        out.push(ty).map_err(|_| AdvertisingError::DataTooLarge)?;
        out.extend_from_slice(body).map_err(|_| AdvertisingError::DataTooLarge)
    }
}

/// Encode a sequence of AD structures into one payload.
pub fn encode(structures: &[AdStructure<'_>]) -> Result<AdvPayload, AdvertisingError> {
    let mut out = AdvPayload::new();
    for s in structures {
        s.encode(&mut out)?;
    }
    Ok(out)
}

/// Advertising errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvertisingError {
    /// Payload exceeds the legacy 31 byte limit
    DataTooLarge,
    StartFailed,
}

/// Connectable mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnMode {
    NonConnectable,
    Undirected,
}

/// Discoverable mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscMode {
    NonDiscoverable,
    Limited,
    General,
}

/// Advertising parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertisingParams {
    pub conn_mode: ConnMode,
    pub disc_mode: DiscMode,
    /// Interval window (0.625ms units)
    pub interval_min: u32,
    pub interval_max: u32,
    /// Advertising duration in 10ms units, `None` advertises until stopped
    pub timeout: Option<u16>,
}

/// Everything the host needs to start advertising
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingRequest<'a> {
    pub params: AdvertisingParams,
    pub own_address_type: AddressType,
    pub adv_data: &'a [u8],
    pub scan_data: &'a [u8],
}

/// Owns the composed payloads and parameters
pub struct Advertiser {
    adv_data: AdvPayload,
    scan_data: AdvPayload,
    params: AdvertisingParams,
    own_address_type: AddressType,
}

impl Advertiser {
    /// Compose both payloads for the given identity.
    pub fn new(identity: &DeviceIdentity, config: &SessionConfig) -> Result<Self, AdvertisingError> {
        let adv_data = encode(&[
            AdStructure::Flags(ad_flags::LE_GENERAL_DISCOVERABLE | ad_flags::BR_EDR_NOT_SUPPORTED),
            AdStructure::TxPowerLevel(config.tx_power_dbm),
            AdStructure::Appearance(config.appearance),
            AdStructure::LeRole(LE_ROLE_PERIPHERAL_ONLY),
            AdStructure::CompleteLocalName(identity.name.as_str()),
        ])
        .map_err(|e| {
            error!("ADV: Advertising data too large");
            e
        })?;

        let interval = u16::try_from(config.adv_interval_min).unwrap_or(u16::MAX);
        let scan_data = encode(&[
            AdStructure::LeDeviceAddress {
                address: identity.address,
                address_type: identity.address_type,
            },
            AdStructure::AdvertisingInterval(interval),
            AdStructure::Uri {
                scheme: URI_SCHEME_HTTPS,
                body: config.uri,
            },
        ])
        .map_err(|e| {
            error!("ADV: Scan response data too large");
            e
        })?;

        debug!(
            "ADV: Composed {} bytes advertising data, {} bytes scan response",
            adv_data.len(),
            scan_data.len()
        );

        Ok(Self {
            adv_data,
            scan_data,
            params: AdvertisingParams {
                conn_mode: ConnMode::Undirected,
                disc_mode: DiscMode::General,
                interval_min: config.adv_interval_min,
                interval_max: config.adv_interval_max,
                timeout: None,
            },
            own_address_type: identity.address_type,
        })
    }

    pub fn adv_data(&self) -> &[u8] {
        &self.adv_data
    }

    pub fn scan_data(&self) -> &[u8] {
        &self.scan_data
    }

    pub fn params(&self) -> &AdvertisingParams {
        &self.params
    }

    pub fn request(&self) -> AdvertisingRequest<'_> {
        AdvertisingRequest {
            params: self.params,
            own_address_type: self.own_address_type,
            adv_data: &self.adv_data,
            scan_data: &self.scan_data,
        }
    }

    /// Start undirected connectable, general discoverable advertising.
    pub fn start<H: HostStack + ?Sized>(&self, host: &H) -> Result<(), AdvertisingError> {
        host.start_advertising(&self.request()).map_err(|e| {
            error!("ADV: Failed to start advertising: {:?}", e);
            AdvertisingError::StartFailed
        })?;
        info!("ADV: Advertising started");
        Ok(())
    }

    pub fn stop<H: HostStack + ?Sized>(&self, host: &H) {
        match host.stop_advertising() {
            Ok(()) => info!("ADV: Advertising stopped"),
            Err(e) => warn!("ADV: Failed to stop advertising: {:?}", e),
        }
    }

    /// Advertising ended on its own. Re-arm unless a link is active.
    pub fn on_completion<H: HostStack + ?Sized>(&self, host: &H, link_active: bool) -> Result<bool, AdvertisingError> {
        if link_active {
            debug!("ADV: Advertising complete while connected");
            return Ok(false);
        }
        self.start(host)?;
        Ok(true)
    }
}
