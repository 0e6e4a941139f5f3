//! Host Stack Boundary
//!
//! Outbound operations the session engine needs from the BLE host stack.
//! The firmware implements this over the SoftDevice; tests use a recording
//! mock. Every call is non-blocking: the engine may invoke them while it
//! holds the session lock.

use crate::ble::advertising::AdvertisingRequest;
use crate::ble::gap_state::ConnectionParams;
use crate::ble::identity::{AddressType, BdAddr};
use crate::ble::registry::{RegistrationEvent, ServiceDescriptor};

/// Errors reported by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostError {
    /// The connection handle does not refer to a live link
    NotConnected,
    /// The stack cannot accept the request right now
    Busy,
    /// Out of buffers or attribute table space
    NoResources,
    /// Rejected with a stack-specific status code
    Rejected(u32),
}

/// Live connection descriptor as reported by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionDescriptor {
    pub conn_handle: u16,
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    /// Current connection interval (1.25ms units)
    pub conn_interval: u16,
    pub slave_latency: u16,
    /// Supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

/// Outbound host stack operations
pub trait HostStack {
    /// Make sure an identity address exists, generating a random static one
    /// when `prefer_random` is set and none is configured.
    fn ensure_address(&self, prefer_random: bool) -> Result<(), HostError>;

    /// Determine which own-address type advertising will use.
    fn infer_address_type(&self, privacy: bool) -> Result<AddressType, HostError>;

    /// Copy the own address of the given type.
    fn copy_address(&self, address_type: AddressType) -> Result<BdAddr, HostError>;

    fn set_device_name(&self, name: &str) -> Result<(), HostError>;

    /// Register the attribute table. Assigned handles are reported through
    /// `on_event` in declaration order before this returns.
    fn register_services(
        &self,
        services: &[ServiceDescriptor<'_>],
        on_event: &mut dyn FnMut(RegistrationEvent),
    ) -> Result<(), HostError>;

    fn start_advertising(&self, request: &AdvertisingRequest<'_>) -> Result<(), HostError>;

    fn stop_advertising(&self) -> Result<(), HostError>;

    fn find_connection(&self, conn_handle: u16) -> Option<ConnectionDescriptor>;

    fn update_conn_params(&self, conn_handle: u16, params: &ConnectionParams) -> Result<(), HostError>;

    /// Ask the stack to terminate a link. Completion arrives as a disconnect event.
    fn terminate(&self, conn_handle: u16, reason: u8) -> Result<(), HostError>;

    fn notify(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError>;

    /// Queue an indication. The confirmation arrives as a notify-tx event.
    fn indicate(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError>;

    /// Update the stack-side copy of an attribute value, used for reads the
    /// stack answers without calling back into the engine.
    fn set_value(&self, value_handle: u16, data: &[u8]) -> Result<(), HostError>;
}

impl<T: HostStack + ?Sized> HostStack for &T {
    fn ensure_address(&self, prefer_random: bool) -> Result<(), HostError> {
        (**self).ensure_address(prefer_random)
    }

    fn infer_address_type(&self, privacy: bool) -> Result<AddressType, HostError> {
        (**self).infer_address_type(privacy)
    }

    fn copy_address(&self, address_type: AddressType) -> Result<BdAddr, HostError> {
        (**self).copy_address(address_type)
    }

    fn set_device_name(&self, name: &str) -> Result<(), HostError> {
        (**self).set_device_name(name)
    }

    fn register_services(
        &self,
        services: &[ServiceDescriptor<'_>],
        on_event: &mut dyn FnMut(RegistrationEvent),
    ) -> Result<(), HostError> {
        (**self).register_services(services, on_event)
    }

    fn start_advertising(&self, request: &AdvertisingRequest<'_>) -> Result<(), HostError> {
        (**self).start_advertising(request)
    }

    fn stop_advertising(&self) -> Result<(), HostError> {
        (**self).stop_advertising()
    }

    fn find_connection(&self, conn_handle: u16) -> Option<ConnectionDescriptor> {
        (**self).find_connection(conn_handle)
    }

    fn update_conn_params(&self, conn_handle: u16, params: &ConnectionParams) -> Result<(), HostError> {
        (**self).update_conn_params(conn_handle, params)
    }

    fn terminate(&self, conn_handle: u16, reason: u8) -> Result<(), HostError> {
        (**self).terminate(conn_handle, reason)
    }

    fn notify(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        (**self).notify(conn_handle, value_handle, data)
    }

    fn indicate(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        (**self).indicate(conn_handle, value_handle, data)
    }

    fn set_value(&self, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        (**self).set_value(value_handle, data)
    }
}
