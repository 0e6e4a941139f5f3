//! Startup error aggregation
//!
//! Every failure that aborts bring-up before advertising begins is folded
//! into [`StartupError`]. Runtime failures are handled per event and never
//! reach this type.

use crate::ble::advertising::AdvertisingError;
use crate::ble::identity::IdentityError;
use crate::ble::registry::RegistryError;

/// Fatal startup errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartupError {
    /// Own address or device name could not be established
    Identity(IdentityError),
    /// The attribute table was rejected or registered inconsistently
    Registration(RegistryError),
    /// Advertising payloads could not be composed or advertising did not start
    Advertising(AdvertisingError),
}

impl From<IdentityError> for StartupError {
    fn from(e: IdentityError) -> Self {
        StartupError::Identity(e)
    }
}

impl From<RegistryError> for StartupError {
    fn from(e: RegistryError) -> Self {
        StartupError::Registration(e)
    }
}

impl From<AdvertisingError> for StartupError {
    fn from(e: AdvertisingError) -> Self {
        StartupError::Advertising(e)
    }
}

impl core::fmt::Display for StartupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StartupError::Identity(e) => write!(f, "identity: {:?}", e),
            StartupError::Registration(e) => write!(f, "registration: {:?}", e),
            StartupError::Advertising(e) => write!(f, "advertising: {:?}", e),
        }
    }
}
