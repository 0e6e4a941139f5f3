//! GAP State
//!
//! Connection state, link information and connection parameters of the
//! single peripheral link.

use crate::ble::host::ConnectionDescriptor;
use crate::ble::identity::{AddressType, BdAddr};
use crate::config::DEFAULT_ATT_MTU;

/// Peripheral connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Idle,
    Advertising,
    Connected(u16),
    /// Local termination requested, waiting for the disconnect event
    Disconnecting(u16),
}

impl ConnectionState {
    /// Handle of the link, while one exists
    pub const fn conn_handle(self) -> Option<u16> {
        match self {
            ConnectionState::Connected(h) | ConnectionState::Disconnecting(h) => Some(h),
            _ => None,
        }
    }

    pub const fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Connection parameters structure (matches SoftDevice ble_gap_conn_params_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct ConnectionParams {
    pub min_conn_interval: u16, // Connection interval minimum (1.25ms units)
    pub max_conn_interval: u16, // Connection interval maximum (1.25ms units)
    pub slave_latency: u16,     // Slave latency
    pub conn_sup_timeout: u16,  // Connection supervisory timeout (10ms units)
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            min_conn_interval: 24, // 30ms
            max_conn_interval: 40, // 50ms
            slave_latency: 0,
            conn_sup_timeout: 400, // 4s
        }
    }
}

impl ConnectionParams {
    /// Keep the current interval and supervision timeout, request a new latency.
    pub const fn pinned(desc: &ConnectionDescriptor, slave_latency: u16) -> Self {
        Self {
            min_conn_interval: desc.conn_interval,
            max_conn_interval: desc.conn_interval,
            slave_latency,
            conn_sup_timeout: desc.supervision_timeout,
        }
    }
}

/// Information about the active link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkInfo {
    pub conn_handle: u16,
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    pub mtu: u16,
    /// Current interval (1.25ms units)
    pub conn_interval: u16,
    pub slave_latency: u16,
    /// Supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl LinkInfo {
    /// Link with unknown peer and default MTU
    pub const fn new(conn_handle: u16) -> Self {
        Self {
            conn_handle,
            peer_address: BdAddr::new([0; 6]),
            peer_address_type: AddressType::Public,
            mtu: DEFAULT_ATT_MTU,
            conn_interval: 0,
            slave_latency: 0,
            supervision_timeout: 0,
        }
    }

    /// Refresh peer and timing fields from the live descriptor. MTU is kept.
    pub fn refresh(&mut self, desc: &ConnectionDescriptor) {
        self.peer_address = desc.peer_address;
        self.peer_address_type = desc.peer_address_type;
        self.conn_interval = desc.conn_interval;
        self.slave_latency = desc.slave_latency;
        self.supervision_timeout = desc.supervision_timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            conn_handle: 1,
            peer_address: BdAddr::new([9, 8, 7, 6, 5, 4]),
            peer_address_type: AddressType::RandomStatic,
            conn_interval: 36,
            slave_latency: 0,
            supervision_timeout: 500,
        }
    }

    #[test]
    fn pinned_params_keep_interval_and_timeout() {
        let p = ConnectionParams::pinned(&descriptor(), 3);
        assert_eq!(p.min_conn_interval, 36);
        assert_eq!(p.max_conn_interval, 36);
        assert_eq!(p.slave_latency, 3);
        assert_eq!(p.conn_sup_timeout, 500);
    }

    #[test]
    fn refresh_preserves_mtu() {
        let mut link = LinkInfo::new(1);
        link.mtu = 185;
        link.refresh(&descriptor());
        assert_eq!(link.mtu, 185);
        assert_eq!(link.conn_interval, 36);
        assert_eq!(link.peer_address_type, AddressType::RandomStatic);
    }

    #[test]
    fn state_handle_accessor() {
        assert_eq!(ConnectionState::Idle.conn_handle(), None);
        assert_eq!(ConnectionState::Advertising.conn_handle(), None);
        assert_eq!(ConnectionState::Connected(4).conn_handle(), Some(4));
        assert_eq!(ConnectionState::Disconnecting(4).conn_handle(), Some(4));
        assert!(!ConnectionState::Disconnecting(4).is_connected());
    }
}
