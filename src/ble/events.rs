//! Host Stack Events
//!
//! Inbound events delivered by the host stack to the session engine.

use crate::ble::access::Access;
use crate::ble::notifications::TxStatus;

/// Event delivered by the host stack
#[derive(Debug)]
pub enum HostEvent<'a> {
    /// Connection attempt finished. `status` is an HCI status, 0 on success.
    Connect { status: u8, conn_handle: u16 },
    Disconnect { conn_handle: u16, reason: u8 },
    ConnParamsUpdated { conn_handle: u16, status: u8 },
    AdvertisingComplete { reason: u8 },
    NotifyTx {
        conn_handle: u16,
        attr_handle: u16,
        status: TxStatus,
        indication: bool,
    },
    Subscribe {
        conn_handle: u16,
        /// Value handle of the characteristic
        attr_handle: u16,
        prev_notify: bool,
        cur_notify: bool,
        prev_indicate: bool,
        cur_indicate: bool,
    },
    MtuUpdated { conn_handle: u16, channel_id: u16, mtu: u16 },
    Access {
        conn_handle: u16,
        attr_handle: u16,
        access: Access<'a>,
    },
}

impl HostEvent<'_> {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Connect { .. } => "connect",
            HostEvent::Disconnect { .. } => "disconnect",
            HostEvent::ConnParamsUpdated { .. } => "conn_update",
            HostEvent::AdvertisingComplete { .. } => "adv_complete",
            HostEvent::NotifyTx { .. } => "notify_tx",
            HostEvent::Subscribe { .. } => "subscribe",
            HostEvent::MtuUpdated { .. } => "mtu",
            HostEvent::Access { .. } => "access",
        }
    }
}
