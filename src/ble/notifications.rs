//! Subscription & Indication Tracking
//!
//! One entry per Notify/Indicate characteristic recording whether a client is
//! subscribed, on which connection and in which mode, plus the outcome of the
//! last indication. Entries are only ever subscribed to the connected handle.

use heapless::Vec;

use crate::ble::host::HostError;
use crate::ble::registry::{AttributeRegistry, CharacteristicId, Properties};
use crate::config::MAX_CHARACTERISTICS;

/// CCCD bit: notifications enabled
pub const CCCD_NOTIFY: u16 = 0x0001;
/// CCCD bit: indications enabled
pub const CCCD_INDICATE: u16 = 0x0002;

/// Delivery mode of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionMode {
    Notify,
    Indicate,
}

/// Per-characteristic subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed { conn_handle: u16, mode: SubscriptionMode },
}

/// Outcome of the last indication sent for a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IndicationStatus {
    Idle,
    Pending,
    Failed(u16),
}

/// Transmit status reported by a notify-tx event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Handed to the link layer
    Queued,
    /// Indication confirmed by the client
    Acknowledged,
    Failed(u16),
}

/// Decoded CCCD value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cccd {
    pub notify: bool,
    pub indicate: bool,
}

impl Cccd {
    /// Decode a CCCD write. Anything but two bytes is malformed.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 2] = data.try_into().ok()?;
        let bits = u16::from_le_bytes(bytes);
        Some(Self {
            notify: bits & CCCD_NOTIFY != 0,
            indicate: bits & CCCD_INDICATE != 0,
        })
    }

    pub fn encode(self) -> [u8; 2] {
        let mut bits = 0u16;
        if self.notify {
            bits |= CCCD_NOTIFY;
        }
        if self.indicate {
            bits |= CCCD_INDICATE;
        }
        bits.to_le_bytes()
    }

    /// CCCD value reflecting a subscription state
    pub fn from_state(state: SubscriptionState) -> Self {
        match state {
            SubscriptionState::Unsubscribed => Self::default(),
            SubscriptionState::Subscribed { mode, .. } => Self {
                notify: mode == SubscriptionMode::Notify,
                indicate: mode == SubscriptionMode::Indicate,
            },
        }
    }
}

/// Requested subscription change after applying the characteristic's properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionChange {
    Subscribe(SubscriptionMode),
    Unsubscribe,
    /// Only modes the characteristic does not declare were requested
    Unsupported,
}

/// Pick the delivery mode. Indicate wins when both are requested and supported.
pub fn select_mode(properties: Properties, notify: bool, indicate: bool) -> SubscriptionChange {
    if !notify && !indicate {
        return SubscriptionChange::Unsubscribe;
    }
    if indicate && properties.contains(Properties::INDICATE) {
        SubscriptionChange::Subscribe(SubscriptionMode::Indicate)
    } else if notify && properties.contains(Properties::NOTIFY) {
        SubscriptionChange::Subscribe(SubscriptionMode::Notify)
    } else {
        SubscriptionChange::Unsupported
    }
}

/// Why a publish did not reach the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishFailure {
    UnknownCharacteristic,
    /// Characteristic is neither notifiable nor indicatable
    NotSubscribable,
    /// Value length differs from the characteristic width
    InvalidLength,
    Host(HostError),
}

/// Result of a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishResult {
    Sent { mode: SubscriptionMode },
    /// No subscriber; nothing stored or sent
    Skipped,
    Failed { reason: PublishFailure },
}

/// Subscription entry for one Notify/Indicate characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscriptionEntry {
    pub id: CharacteristicId,
    pub value_handle: u16,
    pub properties: Properties,
    pub state: SubscriptionState,
    pub indication: IndicationStatus,
}

/// Subscription table, created all-unsubscribed from the registry
#[derive(Debug, Clone)]
pub struct SubscriptionTable {
    entries: Vec<SubscriptionEntry, MAX_CHARACTERISTICS>,
}

impl SubscriptionTable {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn from_registry(registry: &AttributeRegistry<'_>) -> Self {
        let mut entries = Vec::new();
        for (id, c) in registry.iter().filter(|(_, c)| c.properties.is_subscribable()) {
            // Registry and table share the same capacity
            let _ = entries.push(SubscriptionEntry {
                id,
                value_handle: c.value_handle,
                properties: c.properties,
                state: SubscriptionState::Unsubscribed,
                indication: IndicationStatus::Idle,
            });
        }
        Self { entries }
    }

    pub fn get(&self, id: CharacteristicId) -> Option<&SubscriptionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: CharacteristicId) -> Option<&mut SubscriptionEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn by_value_handle_mut(&mut self, value_handle: u16) -> Option<&mut SubscriptionEntry> {
        self.entries.iter_mut().find(|e| e.value_handle == value_handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.entries.iter()
    }

    /// Apply a subscribe event. `connected` is the current connection handle.
    ///
    /// Returns the new state when the entry changed.
    pub fn on_subscribe(
        &mut self,
        value_handle: u16,
        conn_handle: u16,
        notify: bool,
        indicate: bool,
        connected: Option<u16>,
    ) -> Option<SubscriptionState> {
        if connected != Some(conn_handle) {
            warn!("NOTIFY: Subscribe from inactive connection {} ignored", conn_handle);
            return None;
        }

        let Some(entry) = self.by_value_handle_mut(value_handle) else {
            warn!("NOTIFY: Subscribe for unknown attribute {} ignored", value_handle);
            return None;
        };

        let state = match select_mode(entry.properties, notify, indicate) {
            SubscriptionChange::Subscribe(mode) => SubscriptionState::Subscribed { conn_handle, mode },
            SubscriptionChange::Unsubscribe => SubscriptionState::Unsubscribed,
            SubscriptionChange::Unsupported => {
                warn!("NOTIFY: Unsupported subscription mode for attribute {}", value_handle);
                return None;
            }
        };

        if state == SubscriptionState::Unsubscribed {
            entry.indication = IndicationStatus::Idle;
        }
        entry.state = state;
        info!("NOTIFY: Attribute {} now {:?}", value_handle, state);
        Some(state)
    }

    /// Unsubscribe every entry owned by the connection. Returns how many changed.
    pub fn clear_connection(&mut self, conn_handle: u16) -> usize {
        let mut cleared = 0;
        for entry in self.entries.iter_mut() {
            if let SubscriptionState::Subscribed { conn_handle: h, .. } = entry.state {
                if h == conn_handle {
                    entry.state = SubscriptionState::Unsubscribed;
                    entry.indication = IndicationStatus::Idle;
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            debug!("NOTIFY: Cleared {} subscriptions of connection {}", cleared, conn_handle);
        }
        cleared
    }

    /// Record a notify-tx result for an indication.
    pub fn on_tx_result(&mut self, value_handle: u16, status: TxStatus) {
        let Some(entry) = self.by_value_handle_mut(value_handle) else {
            return;
        };
        entry.indication = match status {
            TxStatus::Queued => return,
            TxStatus::Acknowledged => IndicationStatus::Idle,
            TxStatus::Failed(code) => {
                warn!("NOTIFY: Indication on {} failed, status {}", value_handle, code);
                IndicationStatus::Failed(code)
            }
        };
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_decode() {
        assert_eq!(Cccd::decode(&[0x00, 0x00]), Some(Cccd { notify: false, indicate: false }));
        assert_eq!(Cccd::decode(&[0x01, 0x00]), Some(Cccd { notify: true, indicate: false }));
        assert_eq!(Cccd::decode(&[0x02, 0x00]), Some(Cccd { notify: false, indicate: true }));
        assert_eq!(Cccd::decode(&[0x03, 0x00]), Some(Cccd { notify: true, indicate: true }));
        assert_eq!(Cccd::decode(&[0x01]), None);
        assert_eq!(Cccd::decode(&[0x01, 0x00, 0x00]), None);
    }

    #[test]
    fn cccd_reflects_state() {
        let state = SubscriptionState::Subscribed {
            conn_handle: 1,
            mode: SubscriptionMode::Indicate,
        };
        assert_eq!(Cccd::from_state(state).encode(), [0x02, 0x00]);
        assert_eq!(Cccd::from_state(SubscriptionState::Unsubscribed).encode(), [0x00, 0x00]);
    }

    #[test]
    fn indicate_wins_when_both_requested() {
        let both = Properties::NOTIFY | Properties::INDICATE;
        assert_eq!(
            select_mode(both, true, true),
            SubscriptionChange::Subscribe(SubscriptionMode::Indicate)
        );
        assert_eq!(
            select_mode(Properties::NOTIFY, true, true),
            SubscriptionChange::Subscribe(SubscriptionMode::Notify)
        );
    }

    #[test]
    fn undeclared_mode_is_unsupported() {
        assert_eq!(select_mode(Properties::INDICATE, true, false), SubscriptionChange::Unsupported);
        assert_eq!(select_mode(Properties::INDICATE, false, false), SubscriptionChange::Unsubscribe);
    }

    fn table() -> SubscriptionTable {
        let mut t = SubscriptionTable::new();
        t.entries
            .push(SubscriptionEntry {
                id: CharacteristicId(0),
                value_handle: 3,
                properties: Properties::READ | Properties::INDICATE,
                state: SubscriptionState::Unsubscribed,
                indication: IndicationStatus::Idle,
            })
            .unwrap();
        t
    }

    #[test]
    fn subscribe_requires_connected_handle() {
        let mut t = table();
        assert_eq!(t.on_subscribe(3, 2, false, true, Some(1)), None);
        assert_eq!(t.on_subscribe(3, 1, false, true, None), None);
        assert_eq!(t.get(CharacteristicId(0)).unwrap().state, SubscriptionState::Unsubscribed);

        let state = t.on_subscribe(3, 1, false, true, Some(1));
        assert_eq!(
            state,
            Some(SubscriptionState::Subscribed {
                conn_handle: 1,
                mode: SubscriptionMode::Indicate
            })
        );
    }

    #[test]
    fn clear_connection_only_touches_owner() {
        let mut t = table();
        t.on_subscribe(3, 1, false, true, Some(1));
        assert_eq!(t.clear_connection(2), 0);
        assert_eq!(t.clear_connection(1), 1);
        assert_eq!(t.get(CharacteristicId(0)).unwrap().state, SubscriptionState::Unsubscribed);
    }

    #[test]
    fn tx_failure_is_surfaced() {
        let mut t = table();
        t.get_mut(CharacteristicId(0)).unwrap().indication = IndicationStatus::Pending;
        t.on_tx_result(3, TxStatus::Queued);
        assert_eq!(t.get(CharacteristicId(0)).unwrap().indication, IndicationStatus::Pending);
        t.on_tx_result(3, TxStatus::Failed(0x0D));
        assert_eq!(t.get(CharacteristicId(0)).unwrap().indication, IndicationStatus::Failed(0x0D));
        t.on_tx_result(3, TxStatus::Acknowledged);
        assert_eq!(t.get(CharacteristicId(0)).unwrap().indication, IndicationStatus::Idle);
    }
}
