//! Device Identity
//!
//! Resolves the own BLE address and advertised name once at startup.

use core::fmt;

use heapless::String;

use crate::ble::host::HostStack;
use crate::config::MAX_DEVICE_NAME_LEN;

/// BLE device address, bytes in host stack order
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BdAddr {
    fn format(&self, f: defmt::Formatter) {
        let a = &self.0;
        defmt::write!(
            f,
            "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            a[0],
            a[1],
            a[2],
            a[3],
            a[4],
            a[5]
        )
    }
}

/// Own/peer address type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AddressType {
    Public = 0,
    RandomStatic = 1,
    RandomPrivateResolvable = 2,
    RandomPrivateNonResolvable = 3,
}

impl AddressType {
    /// Address type byte as carried in the LE Bluetooth Device Address AD field
    /// (0 = public, 1 = random).
    pub const fn ad_type_flag(self) -> u8 {
        match self {
            AddressType::Public => 0,
            _ => 1,
        }
    }
}

/// Identity resolution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentityError {
    AddressUnavailable,
    AddressTypeInferenceFailed,
    NameRejected,
}

/// Own address, address type and advertised name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub name: String<MAX_DEVICE_NAME_LEN>,
}

/// Bring up the device identity.
///
/// Ensures an identity address exists, infers the own-address type, copies
/// the address and sets the GAP device name. Names longer than
/// [`MAX_DEVICE_NAME_LEN`] are truncated at a character boundary.
pub fn resolve_identity<H: HostStack + ?Sized>(
    host: &H,
    name: &str,
    preferred_privacy: bool,
) -> Result<DeviceIdentity, IdentityError> {
    host.ensure_address(preferred_privacy).map_err(|e| {
        error!("GAP: No identity address available: {:?}", e);
        IdentityError::AddressUnavailable
    })?;

    let address_type = host.infer_address_type(preferred_privacy).map_err(|e| {
        error!("GAP: Failed to infer address type: {:?}", e);
        IdentityError::AddressTypeInferenceFailed
    })?;

    let address = host.copy_address(address_type).map_err(|e| {
        error!("GAP: Failed to copy device address: {:?}", e);
        IdentityError::AddressUnavailable
    })?;

    let name = truncate_name(name);
    host.set_device_name(name.as_str()).map_err(|e| {
        error!("GAP: Device name rejected: {:?}", e);
        IdentityError::NameRejected
    })?;

    info!("GAP: Device address {} ({:?})", address, address_type);

    Ok(DeviceIdentity {
        address,
        address_type,
        name,
    })
}

fn truncate_name(name: &str) -> String<MAX_DEVICE_NAME_LEN> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            warn!("GAP: Device name truncated to {} bytes", out.len());
            break;
        }
    }
    out
}
