//! BLE Session Engine
//!
//! Owns the identity, attribute registry and advertiser, and keeps all
//! mutable session state (connection, link, subscriptions, backing values)
//! behind a single blocking mutex. Host events enter through
//! [`SessionEngine::handle_event`]; producer tasks push values through
//! [`SessionEngine::publish`].
//!
//! The publish path checks the subscription and sends within one lock
//! section, so a value can never go out to a connection whose disconnect has
//! already been processed. Access handlers run outside the lock.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::ble::access::{self, Access, AccessError, ValueBuffer};
use crate::ble::advertising::{Advertiser, AdvertisingError};
use crate::ble::connection::{ConnectOutcome, ConnectionError, ConnectionMachine, DisconnectOutcome};
use crate::ble::events::HostEvent;
use crate::ble::gap_state::{ConnectionState, LinkInfo};
use crate::ble::host::HostStack;
use crate::ble::identity::{resolve_identity, DeviceIdentity};
use crate::ble::notifications::{
    Cccd, IndicationStatus, PublishFailure, PublishResult, SubscriptionMode, SubscriptionState, SubscriptionTable,
    TxStatus,
};
use crate::ble::registry::{AttributeRegistry, CharacteristicId, ServiceDescriptor};
use crate::config::{SessionConfig, MAX_CHARACTERISTICS};
use crate::error::StartupError;

/// Mutable session state, guarded by the engine's mutex
struct SessionState {
    connection: ConnectionMachine,
    subscriptions: SubscriptionTable,
    values: Vec<ValueBuffer, MAX_CHARACTERISTICS>,
}

/// BLE peripheral session engine
pub struct SessionEngine<'a, M: RawMutex, H: HostStack> {
    host: H,
    identity: DeviceIdentity,
    registry: AttributeRegistry<'a>,
    advertiser: Advertiser,
    state: Mutex<M, RefCell<SessionState>>,
}

impl<'a, M: RawMutex, H: HostStack> SessionEngine<'a, M, H> {
    /// Resolve the identity, register the attribute table and compose the
    /// advertising payloads. Advertising is not started.
    pub fn startup(host: H, services: &[ServiceDescriptor<'a>], config: &SessionConfig) -> Result<Self, StartupError> {
        let identity = resolve_identity(&host, config.device_name, config.preferred_privacy)?;
        let registry = AttributeRegistry::build(services, &host)?;
        let advertiser = Advertiser::new(&identity, config)?;

        let mut values = Vec::new();
        for (_, c) in registry.iter() {
            let mut value = ValueBuffer::new();
            // width is validated against the buffer capacity
            let _ = value.resize(c.width as usize, 0);
            let _ = values.push(value);
        }

        let state = SessionState {
            connection: ConnectionMachine::new(config.preferred_slave_latency),
            subscriptions: SubscriptionTable::from_registry(&registry),
            values,
        };

        info!("SESSION: Ready as {}", identity.name.as_str());

        Ok(Self {
            host,
            identity,
            registry,
            advertiser,
            state: Mutex::new(RefCell::new(state)),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Process one host event. Only attribute access can fail; the error
    /// carries the ATT code to return to the client.
    pub fn handle_event(&self, event: HostEvent<'_>) -> Result<(), AccessError> {
        trace!("SESSION: Event {}", event.name());

        match event {
            HostEvent::Connect { status, conn_handle } => {
                let outcome =
                    self.with_state(|st| st.connection.on_connect(status, conn_handle, &self.host, &self.advertiser));
                if let ConnectOutcome::Established(h) = outcome {
                    debug!("SESSION: Link {} established", h);
                }
            }
            HostEvent::Disconnect { conn_handle, reason } => {
                self.with_state(|st| {
                    st.subscriptions.clear_connection(conn_handle);
                    match st.connection.on_disconnect(conn_handle, reason, &self.host, &self.advertiser) {
                        DisconnectOutcome::Released(h) => debug!("SESSION: Link {} released", h),
                        DisconnectOutcome::Stray(h) => debug!("SESSION: Stray link {} closed", h),
                    }
                });
            }
            HostEvent::ConnParamsUpdated { conn_handle, status } => {
                self.with_state(|st| st.connection.on_params_updated(conn_handle, status, &self.host));
            }
            HostEvent::AdvertisingComplete { reason } => {
                self.with_state(|st| st.connection.on_advertising_complete(reason, &self.host, &self.advertiser));
            }
            HostEvent::NotifyTx {
                conn_handle,
                attr_handle,
                status,
                indication,
            } => {
                if let TxStatus::Failed(code) = status {
                    warn!(
                        "SESSION: Notify tx failed on {} attr {} status {}",
                        conn_handle,
                        attr_handle,
                        code
                    );
                }
                if indication {
                    self.with_state(|st| st.subscriptions.on_tx_result(attr_handle, status));
                }
            }
            HostEvent::Subscribe {
                conn_handle,
                attr_handle,
                prev_notify,
                cur_notify,
                prev_indicate,
                cur_indicate,
            } => {
                debug!(
                    "SESSION: Subscribe conn {} attr {} notify {}->{} indicate {}->{}",
                    conn_handle,
                    attr_handle,
                    prev_notify,
                    cur_notify,
                    prev_indicate,
                    cur_indicate
                );
                self.with_state(|st| {
                    let connected = st.connection.connected_handle();
                    st.subscriptions
                        .on_subscribe(attr_handle, conn_handle, cur_notify, cur_indicate, connected);
                });
            }
            HostEvent::MtuUpdated {
                conn_handle,
                channel_id,
                mtu,
            } => {
                debug!("SESSION: MTU channel {}", channel_id);
                self.with_state(|st| st.connection.on_mtu_updated(conn_handle, mtu));
            }
            HostEvent::Access {
                conn_handle,
                attr_handle,
                access,
            } => {
                return self.on_access(conn_handle, attr_handle, access).map_err(|e| {
                    warn!("SESSION: Access to {} rejected: {:?}", attr_handle, e);
                    e
                });
            }
        }

        Ok(())
    }

    fn on_access(&self, conn_handle: u16, attr_handle: u16, access: Access<'_>) -> Result<(), AccessError> {
        if let Some((id, characteristic)) = self.registry.by_value_handle(attr_handle) {
            access::validate(characteristic, &access)?;

            return match access {
                Access::Read { out } => {
                    let stored = self.with_state(|st| st.values.get(id.index()).cloned().unwrap_or_default());
                    access::render_read(characteristic, &stored, out)
                }
                Access::Write { data } => {
                    access::apply_write(characteristic, data)?;
                    self.with_state(|st| {
                        if let Some(value) = st.values.get_mut(id.index()) {
                            value.clear();
                            // width equals the payload length, which fits
                            let _ = value.extend_from_slice(data);
                        }
                    });
                    Ok(())
                }
            };
        }

        if let Some((id, characteristic)) = self.registry.by_cccd_handle(attr_handle) {
            return match access {
                Access::Read { out } => {
                    let state = self.subscription(id).unwrap_or(SubscriptionState::Unsubscribed);
                    out.clear();
                    out.extend_from_slice(&Cccd::from_state(state).encode())
                        .map_err(|_| AccessError::InsufficientResources)
                }
                Access::Write { data } => {
                    let cccd = Cccd::decode(data).ok_or(AccessError::InvalidLength)?;
                    self.with_state(|st| {
                        let connected = st.connection.connected_handle();
                        st.subscriptions.on_subscribe(
                            characteristic.value_handle,
                            conn_handle,
                            cccd.notify,
                            cccd.indicate,
                            connected,
                        );
                    });
                    Ok(())
                }
            };
        }

        Err(AccessError::AttributeNotFound)
    }

    /// Push a new value to the subscribed client.
    ///
    /// With no subscriber the value is neither stored nor sent.
    pub fn publish(&self, id: CharacteristicId, value: &[u8]) -> PublishResult {
        let Some(characteristic) = self.registry.get(id) else {
            return PublishResult::Failed {
                reason: PublishFailure::UnknownCharacteristic,
            };
        };
        if !characteristic.properties.is_subscribable() {
            return PublishResult::Failed {
                reason: PublishFailure::NotSubscribable,
            };
        }
        if value.len() != characteristic.width as usize {
            return PublishResult::Failed {
                reason: PublishFailure::InvalidLength,
            };
        }

        let value_handle = characteristic.value_handle;

        self.with_state(|st| {
            let Some(entry) = st.subscriptions.get_mut(id) else {
                return PublishResult::Skipped;
            };
            let SubscriptionState::Subscribed { conn_handle, mode } = entry.state else {
                return PublishResult::Skipped;
            };

            if let Some(stored) = st.values.get_mut(id.index()) {
                stored.clear();
                let _ = stored.extend_from_slice(value);
            }

            let sent = match mode {
                SubscriptionMode::Notify => self.host.notify(conn_handle, value_handle, value),
                SubscriptionMode::Indicate => self.host.indicate(conn_handle, value_handle, value),
            };

            match sent {
                Ok(()) => {
                    if mode == SubscriptionMode::Indicate {
                        entry.indication = IndicationStatus::Pending;
                    }
                    PublishResult::Sent { mode }
                }
                Err(e) => {
                    warn!("SESSION: Publish on {} failed: {:?}", value_handle, e);
                    PublishResult::Failed {
                        reason: PublishFailure::Host(e),
                    }
                }
            }
        })
    }

    pub fn start_advertising(&self) -> Result<(), AdvertisingError> {
        self.with_state(|st| st.connection.start_advertising(&self.host, &self.advertiser))
    }

    pub fn stop_advertising(&self) {
        self.with_state(|st| st.connection.stop_advertising(&self.host, &self.advertiser));
    }

    /// Terminate the active link. Its subscriptions are dropped right away.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.with_state(|st| {
            let conn_handle = st.connection.connected_handle();
            st.connection.disconnect(&self.host)?;
            if let Some(h) = conn_handle {
                st.subscriptions.clear_connection(h);
            }
            Ok(())
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.with_state(|st| st.connection.state())
    }

    pub fn link(&self) -> Option<LinkInfo> {
        self.with_state(|st| st.connection.link().copied())
    }

    pub fn subscription(&self, id: CharacteristicId) -> Option<SubscriptionState> {
        self.with_state(|st| st.subscriptions.get(id).map(|e| e.state))
    }

    pub fn indication_status(&self, id: CharacteristicId) -> Option<IndicationStatus> {
        self.with_state(|st| st.subscriptions.get(id).map(|e| e.indication))
    }

    /// Current backing value
    pub fn value(&self, id: CharacteristicId) -> Option<ValueBuffer> {
        self.with_state(|st| st.values.get(id.index()).cloned())
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &AttributeRegistry<'a> {
        &self.registry
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}
