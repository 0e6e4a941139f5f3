//! Connection State Machine
//!
//! Tracks the single peripheral link: `Idle -> Advertising -> Connected ->
//! Advertising`. Advertising is re-armed after a failed connect, a
//! disconnect, or an advertising timeout. Runs under the session lock; the
//! host calls it makes are non-blocking.

use crate::ble::advertising::{Advertiser, AdvertisingError};
use crate::ble::gap_state::{ConnectionParams, ConnectionState, LinkInfo};
use crate::ble::host::HostStack;
use crate::config::HCI_REMOTE_USER_TERMINATED;

/// HCI status reported for a successful connection
pub const HCI_SUCCESS: u8 = 0x00;

/// Connection errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    NotConnected,
    TerminateFailed,
}

/// Result of a connect event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectOutcome {
    Established(u16),
    /// Connection attempt failed, advertising re-armed
    Failed,
    /// Extra link while one is active; asked to terminate
    Rejected { existing: u16, extra: u16 },
}

/// Result of a disconnect event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectOutcome {
    /// The active link went down
    Released(u16),
    /// A link other than the active one went down
    Stray(u16),
}

/// Single-link GAP connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMachine {
    state: ConnectionState,
    link: Option<LinkInfo>,
    preferred_slave_latency: u16,
}

impl ConnectionMachine {
    pub const fn new(preferred_slave_latency: u16) -> Self {
        Self {
            state: ConnectionState::Idle,
            link: None,
            preferred_slave_latency,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&self) -> Option<&LinkInfo> {
        self.link.as_ref()
    }

    /// Handle of the connected link, if any
    pub fn connected_handle(&self) -> Option<u16> {
        match self.state {
            ConnectionState::Connected(h) => Some(h),
            _ => None,
        }
    }

    /// Start advertising unless a link exists.
    pub fn start_advertising<H: HostStack + ?Sized>(
        &mut self,
        host: &H,
        advertiser: &Advertiser,
    ) -> Result<(), AdvertisingError> {
        if self.state.conn_handle().is_some() {
            debug!("GAP: Not advertising, link active");
            return Ok(());
        }
        self.rearm(host, advertiser)
    }

    pub fn stop_advertising<H: HostStack + ?Sized>(&mut self, host: &H, advertiser: &Advertiser) {
        if self.state == ConnectionState::Advertising {
            advertiser.stop(host);
            self.state = ConnectionState::Idle;
        }
    }

    pub fn on_connect<H: HostStack + ?Sized>(
        &mut self,
        status: u8,
        conn_handle: u16,
        host: &H,
        advertiser: &Advertiser,
    ) -> ConnectOutcome {
        if status != HCI_SUCCESS {
            warn!("GAP: Connection failed, status {}", status);
            if self.state.conn_handle().is_none() {
                let _ = self.rearm(host, advertiser);
            }
            return ConnectOutcome::Failed;
        }

        if let Some(existing) = self.state.conn_handle() {
            warn!(
                "GAP: Rejecting connection {} while {} is active",
                conn_handle,
                existing
            );
            if let Err(e) = host.terminate(conn_handle, HCI_REMOTE_USER_TERMINATED) {
                warn!("GAP: Failed to terminate extra link {}: {:?}", conn_handle, e);
            }
            return ConnectOutcome::Rejected {
                existing,
                extra: conn_handle,
            };
        }

        self.state = ConnectionState::Connected(conn_handle);
        let mut link = LinkInfo::new(conn_handle);

        match host.find_connection(conn_handle) {
            Some(desc) => {
                link.refresh(&desc);
                info!(
                    "GAP: Connected {} peer {} interval {} latency {} timeout {}",
                    conn_handle,
                    desc.peer_address,
                    desc.conn_interval,
                    desc.slave_latency,
                    desc.supervision_timeout
                );

                let params = ConnectionParams::pinned(&desc, self.preferred_slave_latency);
                if let Err(e) = host.update_conn_params(conn_handle, &params) {
                    warn!("GAP: Connection parameter update failed: {:?}", e);
                }
            }
            None => {
                warn!("GAP: No descriptor for connection {}", conn_handle);
            }
        }

        self.link = Some(link);
        ConnectOutcome::Established(conn_handle)
    }

    pub fn on_disconnect<H: HostStack + ?Sized>(
        &mut self,
        conn_handle: u16,
        reason: u8,
        host: &H,
        advertiser: &Advertiser,
    ) -> DisconnectOutcome {
        if self.state.conn_handle() != Some(conn_handle) {
            debug!("GAP: Disconnect of inactive link {} (reason {})", conn_handle, reason);
            return DisconnectOutcome::Stray(conn_handle);
        }

        info!("GAP: Disconnected {} (reason {})", conn_handle, reason);
        self.link = None;
        self.state = ConnectionState::Idle;
        let _ = self.rearm(host, advertiser);
        DisconnectOutcome::Released(conn_handle)
    }

    pub fn on_params_updated<H: HostStack + ?Sized>(&mut self, conn_handle: u16, status: u8, host: &H) {
        if status != HCI_SUCCESS {
            warn!("GAP: Parameter update on {} failed, status {}", conn_handle, status);
        }

        let Some(link) = self.link.as_mut().filter(|l| l.conn_handle == conn_handle) else {
            debug!("GAP: Parameter update for inactive link {}", conn_handle);
            return;
        };

        match host.find_connection(conn_handle) {
            Some(desc) => {
                link.refresh(&desc);
                info!(
                    "GAP: Connection {} updated: interval {} latency {} timeout {}",
                    conn_handle,
                    desc.conn_interval,
                    desc.slave_latency,
                    desc.supervision_timeout
                );
            }
            None => warn!("GAP: No descriptor for connection {}", conn_handle),
        }
    }

    pub fn on_mtu_updated(&mut self, conn_handle: u16, mtu: u16) {
        match self.link.as_mut().filter(|l| l.conn_handle == conn_handle) {
            Some(link) => {
                link.mtu = mtu;
                info!("GAP: MTU for {} is {}", conn_handle, mtu);
            }
            None => debug!("GAP: MTU update for inactive link {}", conn_handle),
        }
    }

    pub fn on_advertising_complete<H: HostStack + ?Sized>(&mut self, reason: u8, host: &H, advertiser: &Advertiser) {
        info!("GAP: Advertising complete, reason {}", reason);
        let link_active = self.state.conn_handle().is_some();
        match advertiser.on_completion(host, link_active) {
            Ok(true) => self.state = ConnectionState::Advertising,
            Ok(false) => {}
            Err(_) => self.state = ConnectionState::Idle,
        }
    }

    /// Terminate the active link. The disconnect event completes the transition.
    pub fn disconnect<H: HostStack + ?Sized>(&mut self, host: &H) -> Result<(), ConnectionError> {
        let ConnectionState::Connected(conn_handle) = self.state else {
            return Err(ConnectionError::NotConnected);
        };

        host.terminate(conn_handle, HCI_REMOTE_USER_TERMINATED).map_err(|e| {
            error!("GAP: Failed to terminate {}: {:?}", conn_handle, e);
            ConnectionError::TerminateFailed
        })?;

        info!("GAP: Disconnecting {}", conn_handle);
        self.state = ConnectionState::Disconnecting(conn_handle);
        Ok(())
    }

    /// Start advertising; a failed start leaves the machine Idle.
    fn rearm<H: HostStack + ?Sized>(&mut self, host: &H, advertiser: &Advertiser) -> Result<(), AdvertisingError> {
        let result = advertiser.start(host);
        self.state = match result {
            Ok(()) => ConnectionState::Advertising,
            Err(_) => ConnectionState::Idle,
        };
        result
    }
}
