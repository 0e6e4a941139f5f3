//! GATT Attribute Registry
//!
//! Static service/characteristic table, validated against the host stack's
//! attribute budget and then registered once at startup. Handles assigned by
//! the host are recorded here and never change afterwards.

use core::ops::BitOr;

use heapless::Vec;

use crate::ble::access::AccessHandler;
use crate::ble::host::HostStack;
use crate::config::{MAX_ATTRIBUTES, MAX_CHARACTERISTICS, MAX_SERVICES, MAX_VALUE_LEN};

/// Client Characteristic Configuration descriptor UUID
pub const CCCD_UUID: u16 = 0x2902;

/// Handle value reserved for "not yet assigned"
pub const UNASSIGNED_HANDLE: u16 = 0x0000;

/// Service or characteristic UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleUuid {
    Uuid16(u16),
    /// Little-endian byte order, as carried on air
    Uuid128([u8; 16]),
}

/// Characteristic properties (matches BLE specification bit layout)
pub mod char_properties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// Set of characteristic property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Properties(u8);

impl Properties {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(char_properties::READ);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(char_properties::WRITE_WITHOUT_RESPONSE);
    pub const WRITE: Self = Self(char_properties::WRITE);
    pub const NOTIFY: Self = Self(char_properties::NOTIFY);
    pub const INDICATE: Self = Self(char_properties::INDICATE);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Write with or without response
    pub const fn can_write(self) -> bool {
        self.0 & (char_properties::WRITE | char_properties::WRITE_WITHOUT_RESPONSE) != 0
    }

    /// Notify or Indicate, which both require a CCCD
    pub const fn is_subscribable(self) -> bool {
        self.0 & (char_properties::NOTIFY | char_properties::INDICATE) != 0
    }
}

impl BitOr for Properties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Characteristic declaration supplied by the application
#[derive(Clone, Copy)]
pub struct CharacteristicDescriptor<'a> {
    pub uuid: BleUuid,
    pub properties: Properties,
    /// Exact value width in bytes
    pub width: u8,
    pub handler: &'a dyn AccessHandler,
}

/// Primary service declaration supplied by the application
#[derive(Clone, Copy)]
pub struct ServiceDescriptor<'a> {
    pub uuid: BleUuid,
    pub characteristics: &'a [CharacteristicDescriptor<'a>],
}

/// Handle assignment reported by the host stack during registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationEvent {
    Service { uuid: BleUuid, handle: u16 },
    Characteristic { uuid: BleUuid, def_handle: u16, value_handle: u16 },
    Descriptor { uuid: BleUuid, handle: u16 },
}

/// Why the host-side registration could not be reconciled with the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationFailure {
    /// Event kind does not match the next expected declaration
    OutOfOrder,
    UuidMismatch,
    /// Zero handle assigned
    InvalidHandle,
    /// Handle already assigned to another attribute
    DuplicateHandle,
    /// More events than declarations
    UnexpectedEvent,
    /// Registration finished with declarations left unassigned
    MissingAssignment,
    HostRejected,
}

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistryError {
    ServicesFull,
    CharacteristicsFull,
    AttributeTableFull,
    EmptyProperties,
    DuplicateUuid,
    InvalidWidth,
    RegistrationFailed { reason: RegistrationFailure },
}

/// Opaque characteristic identifier (index into the registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicId(pub u8);

impl CharacteristicId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisteredService {
    pub uuid: BleUuid,
    pub handle: u16,
}

/// Registered characteristic with its host-assigned handles
#[derive(Clone, Copy)]
pub struct RegisteredCharacteristic<'a> {
    pub service_handle: u16,
    pub uuid: BleUuid,
    pub properties: Properties,
    pub width: u8,
    pub def_handle: u16,
    pub value_handle: u16,
    pub cccd_handle: Option<u16>,
    pub handler: &'a dyn AccessHandler,
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegistryStats {
    pub services: usize,
    pub characteristics: usize,
    pub attributes: usize,
}

/// Immutable attribute registry built at startup
pub struct AttributeRegistry<'a> {
    services: Vec<RegisteredService, MAX_SERVICES>,
    characteristics: Vec<RegisteredCharacteristic<'a>, MAX_CHARACTERISTICS>,
    attributes: usize,
}

impl<'a> AttributeRegistry<'a> {
    /// Validate the table, register it with the host and record the handles.
    pub fn build<H: HostStack + ?Sized>(
        services: &[ServiceDescriptor<'a>],
        host: &H,
    ) -> Result<Self, RegistryError> {
        let attributes = validate(services)?;

        let mut builder = Builder::new(services);
        let registered = host.register_services(services, &mut |event| builder.consume(event));

        if let Err(e) = registered {
            error!("GATT: Host rejected attribute table: {:?}", e);
            return Err(RegistryError::RegistrationFailed {
                reason: RegistrationFailure::HostRejected,
            });
        }

        let registry = builder.finish(attributes).map_err(|reason| {
            error!("GATT: Registration failed: {:?}", reason);
            RegistryError::RegistrationFailed { reason }
        })?;

        info!(
            "GATT: Registered {} services, {} characteristics, {} attributes",
            registry.services.len(),
            registry.characteristics.len(),
            registry.attributes
        );

        Ok(registry)
    }

    pub fn get(&self, id: CharacteristicId) -> Option<&RegisteredCharacteristic<'a>> {
        self.characteristics.get(id.index())
    }

    pub fn by_value_handle(&self, handle: u16) -> Option<(CharacteristicId, &RegisteredCharacteristic<'a>)> {
        if handle == UNASSIGNED_HANDLE {
            return None;
        }
        self.iter().find(|(_, c)| c.value_handle == handle)
    }

    pub fn by_cccd_handle(&self, handle: u16) -> Option<(CharacteristicId, &RegisteredCharacteristic<'a>)> {
        if handle == UNASSIGNED_HANDLE {
            return None;
        }
        self.iter().find(|(_, c)| c.cccd_handle == Some(handle))
    }

    /// First characteristic with the given UUID
    pub fn find(&self, uuid: BleUuid) -> Option<CharacteristicId> {
        self.iter().find(|(_, c)| c.uuid == uuid).map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CharacteristicId, &RegisteredCharacteristic<'a>)> {
        self.characteristics
            .iter()
            .enumerate()
            .map(|(i, c)| (CharacteristicId(i as u8), c))
    }

    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.characteristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            services: self.services.len(),
            characteristics: self.characteristics.len(),
            attributes: self.attributes,
        }
    }
}

/// Check the table against the registry limits. Returns the attribute count.
pub fn validate(services: &[ServiceDescriptor<'_>]) -> Result<usize, RegistryError> {
    if services.len() > MAX_SERVICES {
        return Err(RegistryError::ServicesFull);
    }

    let mut characteristics = 0usize;
    let mut attributes = 0usize;

    for service in services {
        attributes += 1;

        for (i, c) in service.characteristics.iter().enumerate() {
            if c.properties.is_empty() {
                return Err(RegistryError::EmptyProperties);
            }
            if c.width == 0 || c.width as usize > MAX_VALUE_LEN {
                return Err(RegistryError::InvalidWidth);
            }
            if service.characteristics[..i].iter().any(|o| o.uuid == c.uuid) {
                return Err(RegistryError::DuplicateUuid);
            }

            characteristics += 1;
            attributes += attribute_count(c.properties);
        }
    }

    if characteristics > MAX_CHARACTERISTICS {
        return Err(RegistryError::CharacteristicsFull);
    }
    if attributes > MAX_ATTRIBUTES {
        return Err(RegistryError::AttributeTableFull);
    }

    Ok(attributes)
}

/// Declaration + value, plus a CCCD for subscribable characteristics
const fn attribute_count(properties: Properties) -> usize {
    if properties.is_subscribable() {
        3
    } else {
        2
    }
}

/// What the next registration event must describe
#[derive(Clone, Copy)]
enum Expect {
    Service { service: usize },
    Characteristic { service: usize, index: usize },
    Cccd,
}

/// Consumes the ordered registration event stream
struct Builder<'s, 'a> {
    services: &'s [ServiceDescriptor<'a>],
    registered_services: Vec<RegisteredService, MAX_SERVICES>,
    characteristics: Vec<RegisteredCharacteristic<'a>, MAX_CHARACTERISTICS>,
    used_handles: Vec<u16, MAX_ATTRIBUTES>,
    next: Option<Expect>,
    failure: Option<RegistrationFailure>,
}

impl<'s, 'a> Builder<'s, 'a> {
    fn new(services: &'s [ServiceDescriptor<'a>]) -> Self {
        Self {
            services,
            registered_services: Vec::new(),
            characteristics: Vec::new(),
            used_handles: Vec::new(),
            next: if services.is_empty() {
                None
            } else {
                Some(Expect::Service { service: 0 })
            },
            failure: None,
        }
    }

    fn consume(&mut self, event: RegistrationEvent) {
        if self.failure.is_some() {
            return;
        }
        debug!("GATT: Registration event {:?}", event);
        if let Err(reason) = self.apply(event) {
            self.failure = Some(reason);
        }
    }

    fn apply(&mut self, event: RegistrationEvent) -> Result<(), RegistrationFailure> {
        let expect = self.next.ok_or(RegistrationFailure::UnexpectedEvent)?;

        match (expect, event) {
            (Expect::Service { service }, RegistrationEvent::Service { uuid, handle }) => {
                if self.services[service].uuid != uuid {
                    return Err(RegistrationFailure::UuidMismatch);
                }
                self.claim(handle)?;
                self.registered_services
                    .push(RegisteredService { uuid, handle })
                    .map_err(|_| RegistrationFailure::UnexpectedEvent)?;
                self.next = self.after_characteristic(service, 0);
            }
            (
                Expect::Characteristic { service, index },
                RegistrationEvent::Characteristic {
                    uuid,
                    def_handle,
                    value_handle,
                },
            ) => {
                let desc = self.services[service].characteristics[index];
                if desc.uuid != uuid {
                    return Err(RegistrationFailure::UuidMismatch);
                }
                self.claim(def_handle)?;
                self.claim(value_handle)?;

                let service_handle = self
                    .registered_services
                    .last()
                    .map(|s| s.handle)
                    .ok_or(RegistrationFailure::OutOfOrder)?;

                self.characteristics
                    .push(RegisteredCharacteristic {
                        service_handle,
                        uuid,
                        properties: desc.properties,
                        width: desc.width,
                        def_handle,
                        value_handle,
                        cccd_handle: None,
                        handler: desc.handler,
                    })
                    .map_err(|_| RegistrationFailure::UnexpectedEvent)?;

                self.next = if desc.properties.is_subscribable() {
                    Some(Expect::Cccd)
                } else {
                    self.after_characteristic(service, index + 1)
                };
            }
            (Expect::Cccd, RegistrationEvent::Descriptor { uuid, handle }) => {
                if uuid != BleUuid::Uuid16(CCCD_UUID) {
                    return Err(RegistrationFailure::UuidMismatch);
                }
                self.claim(handle)?;

                let (service, index) = self.position_of_last()?;
                let last = self
                    .characteristics
                    .last_mut()
                    .ok_or(RegistrationFailure::OutOfOrder)?;
                last.cccd_handle = Some(handle);
                self.next = self.after_characteristic(service, index + 1);
            }
            _ => return Err(RegistrationFailure::OutOfOrder),
        }

        Ok(())
    }

    /// Record a handle, rejecting zero and repeats
    fn claim(&mut self, handle: u16) -> Result<(), RegistrationFailure> {
        if handle == UNASSIGNED_HANDLE {
            return Err(RegistrationFailure::InvalidHandle);
        }
        if self.used_handles.contains(&handle) {
            return Err(RegistrationFailure::DuplicateHandle);
        }
        self.used_handles
            .push(handle)
            .map_err(|_| RegistrationFailure::UnexpectedEvent)
    }

    /// Service index and characteristic index of the last registered characteristic
    fn position_of_last(&self) -> Result<(usize, usize), RegistrationFailure> {
        let service = self
            .registered_services
            .len()
            .checked_sub(1)
            .ok_or(RegistrationFailure::OutOfOrder)?;
        let before: usize = self.services[..service]
            .iter()
            .map(|s| s.characteristics.len())
            .sum();
        let index = self
            .characteristics
            .len()
            .checked_sub(before + 1)
            .ok_or(RegistrationFailure::OutOfOrder)?;
        Ok((service, index))
    }

    fn after_characteristic(&self, service: usize, index: usize) -> Option<Expect> {
        if index < self.services[service].characteristics.len() {
            Some(Expect::Characteristic { service, index })
        } else if service + 1 < self.services.len() {
            Some(Expect::Service { service: service + 1 })
        } else {
            None
        }
    }

    fn finish(self, attributes: usize) -> Result<AttributeRegistry<'a>, RegistrationFailure> {
        if let Some(reason) = self.failure {
            return Err(reason);
        }
        if self.next.is_some() {
            return Err(RegistrationFailure::MissingAssignment);
        }
        Ok(AttributeRegistry {
            services: self.registered_services,
            characteristics: self.characteristics,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::access::DefaultHandler;

    static PLAIN: DefaultHandler = DefaultHandler;

    fn chr(uuid: u16, properties: Properties, width: u8) -> CharacteristicDescriptor<'static> {
        CharacteristicDescriptor {
            uuid: BleUuid::Uuid16(uuid),
            properties,
            width,
            handler: &PLAIN,
        }
    }

    #[test]
    fn properties_compose() {
        let p = Properties::READ | Properties::INDICATE;
        assert_eq!(p.bits(), 0x22);
        assert!(p.can_read());
        assert!(!p.can_write());
        assert!(p.is_subscribable());
        assert!((Properties::WRITE_WITHOUT_RESPONSE).can_write());
    }

    #[test]
    fn validate_counts_attributes() {
        let chars = [chr(0x2A37, Properties::READ | Properties::INDICATE, 2), chr(0x2A38, Properties::READ, 1)];
        let services = [ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x180D),
            characteristics: &chars,
        }];
        assert_eq!(validate(&services), Ok(1 + 3 + 2));
    }

    fn svc<'a>(characteristics: &'a [CharacteristicDescriptor<'a>]) -> [ServiceDescriptor<'a>; 1] {
        [ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x1800),
            characteristics,
        }]
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let empty = [chr(0x2A00, Properties::NONE, 1)];
        let wide = [chr(0x2A00, Properties::READ, 21)];
        let zero = [chr(0x2A00, Properties::READ, 0)];
        let dup = [chr(0x2A00, Properties::READ, 1), chr(0x2A00, Properties::WRITE, 1)];

        assert_eq!(validate(&svc(&empty)), Err(RegistryError::EmptyProperties));
        assert_eq!(validate(&svc(&wide)), Err(RegistryError::InvalidWidth));
        assert_eq!(validate(&svc(&zero)), Err(RegistryError::InvalidWidth));
        assert_eq!(validate(&svc(&dup)), Err(RegistryError::DuplicateUuid));
    }

    #[test]
    fn validate_enforces_capacities() {
        let services = [ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x1800),
            characteristics: &[],
        }; MAX_SERVICES + 1];
        assert_eq!(validate(&services), Err(RegistryError::ServicesFull));

        let many = [
            chr(0x2A01, Properties::READ | Properties::NOTIFY, 1),
            chr(0x2A02, Properties::READ | Properties::NOTIFY, 1),
            chr(0x2A03, Properties::READ | Properties::NOTIFY, 1),
            chr(0x2A04, Properties::READ | Properties::NOTIFY, 1),
            chr(0x2A05, Properties::READ | Properties::NOTIFY, 1),
        ];
        // 3 services x (1 + 5 x 3) attributes, 15 characteristics
        let services = [ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x1800),
            characteristics: &many,
        }; 3];
        assert_eq!(validate(&services), Err(RegistryError::CharacteristicsFull));

        let services = [
            ServiceDescriptor {
                uuid: BleUuid::Uuid16(0x1800),
                characteristics: &many,
            },
            ServiceDescriptor {
                uuid: BleUuid::Uuid16(0x1801),
                characteristics: &many[..3],
            },
        ];
        // 8 characteristics, 1 + 15 + 1 + 9 = 26 attributes: within limits
        assert_eq!(validate(&services), Ok(26));
    }
}
