//! Common test utilities for host-side session tests
//!
//! - `MockHost`: a recording `HostStack` with sequential handle assignment
//! - fixture access handlers and service tables
//! - helpers to bring an engine up and drive connection events
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

pub use nrf52820_sensor_peripheral::ble::access::{
    Access, AccessError, AccessHandler, AccessOp, DefaultHandler, HandlerError, ValueBuffer,
};
pub use nrf52820_sensor_peripheral::ble::advertising::{AdvertisingError, AdvertisingRequest};
pub use nrf52820_sensor_peripheral::ble::connection::ConnectionError;
pub use nrf52820_sensor_peripheral::ble::events::HostEvent;
pub use nrf52820_sensor_peripheral::ble::gap_state::{ConnectionParams, ConnectionState};
pub use nrf52820_sensor_peripheral::ble::host::{ConnectionDescriptor, HostError, HostStack};
pub use nrf52820_sensor_peripheral::ble::identity::{AddressType, BdAddr, IdentityError};
pub use nrf52820_sensor_peripheral::ble::notifications::{
    IndicationStatus, PublishFailure, PublishResult, SubscriptionMode, SubscriptionState, TxStatus,
};
pub use nrf52820_sensor_peripheral::ble::registry::{
    BleUuid, CharacteristicDescriptor, CharacteristicId, Properties, RegistrationEvent, RegistrationFailure,
    RegistryError, ServiceDescriptor, CCCD_UUID,
};
pub use nrf52820_sensor_peripheral::ble::session::SessionEngine;
pub use nrf52820_sensor_peripheral::config::SessionConfig;

pub type TestEngine = SessionEngine<'static, CriticalSectionRawMutex, MockHost>;

pub const DEVICE_ADDRESS: [u8; 6] = [0xC0, 0xFF, 0xEE, 0x12, 0x34, 0x56];

// Handles assigned by `MockHost` to the fixture table
pub const HRM_VALUE_HANDLE: u16 = 3;
pub const HRM_CCCD_HANDLE: u16 = 4;
pub const LED_VALUE_HANDLE: u16 = 7;
pub const STATUS_VALUE_HANDLE: u16 = 9;
pub const STATUS_CCCD_HANDLE: u16 = 10;

// Characteristic ids in declaration order
pub const HRM: CharacteristicId = CharacteristicId(0);
pub const LED: CharacteristicId = CharacteristicId(1);
pub const STATUS: CharacteristicId = CharacteristicId(2);

/// Outbound call recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    SetDeviceName(String),
    StartAdvertising { adv_data: Vec<u8>, scan_data: Vec<u8> },
    StopAdvertising,
    UpdateConnParams { conn_handle: u16, params: ConnectionParams },
    Terminate { conn_handle: u16, reason: u8 },
    Notify { conn_handle: u16, value_handle: u16, data: Vec<u8> },
    Indicate { conn_handle: u16, value_handle: u16, data: Vec<u8> },
    SetValue { value_handle: u16, data: Vec<u8> },
    /// Test marker: the engine has processed this link's disconnect
    Disconnected { conn_handle: u16 },
}

/// Failure injection for startup
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub fail_address: bool,
    pub fail_address_type: bool,
    pub fail_name: bool,
    pub reject_registration: bool,
    /// Replayed instead of the sequential assignment
    pub registration_script: Option<Vec<RegistrationEvent>>,
}

/// Recording host stack
pub struct MockHost {
    config: MockConfig,
    calls: Mutex<Vec<HostCall>>,
    connections: Mutex<Vec<ConnectionDescriptor>>,
    fail_start: AtomicBool,
    fail_param_update: AtomicBool,
    send_error: Mutex<Option<HostError>>,
    next_interval: AtomicU32,
}

impl MockHost {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_param_update: AtomicBool::new(false),
            send_error: Mutex::new(None),
            next_interval: AtomicU32::new(24),
        }
    }

    pub fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn advertising_starts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::StartAdvertising { .. }))
            .count()
    }

    /// Notify and Indicate calls, in order
    pub fn sends(&self) -> Vec<HostCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, HostCall::Notify { .. } | HostCall::Indicate { .. }))
            .collect()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_param_update(&self, fail: bool) {
        self.fail_param_update.store(fail, Ordering::SeqCst);
    }

    pub fn set_send_error(&self, error: Option<HostError>) {
        *self.send_error.lock().unwrap() = error;
    }

    /// Make a link visible to `find_connection`
    pub fn add_connection(&self, conn_handle: u16) -> ConnectionDescriptor {
        let desc = ConnectionDescriptor {
            conn_handle,
            peer_address: BdAddr::new([conn_handle as u8, 0x22, 0x33, 0x44, 0x55, 0x66]),
            peer_address_type: AddressType::RandomStatic,
            conn_interval: self.next_interval.load(Ordering::SeqCst) as u16,
            slave_latency: 0,
            supervision_timeout: 400,
        };
        let mut conns = self.connections.lock().unwrap();
        conns.retain(|c| c.conn_handle != conn_handle);
        conns.push(desc);
        desc
    }

    pub fn remove_connection(&self, conn_handle: u16) {
        self.connections.lock().unwrap().retain(|c| c.conn_handle != conn_handle);
    }

    /// Change the parameters reported for a live link
    pub fn update_connection(&self, conn_handle: u16, conn_interval: u16, slave_latency: u16) {
        for c in self.connections.lock().unwrap().iter_mut() {
            if c.conn_handle == conn_handle {
                c.conn_interval = conn_interval;
                c.slave_latency = slave_latency;
            }
        }
    }

    fn sequential_registration(services: &[ServiceDescriptor<'_>], on_event: &mut dyn FnMut(RegistrationEvent)) {
        let mut next = 1u16;
        for service in services {
            on_event(RegistrationEvent::Service {
                uuid: service.uuid,
                handle: next,
            });
            next += 1;
            for c in service.characteristics {
                on_event(RegistrationEvent::Characteristic {
                    uuid: c.uuid,
                    def_handle: next,
                    value_handle: next + 1,
                });
                next += 2;
                if c.properties.is_subscribable() {
                    on_event(RegistrationEvent::Descriptor {
                        uuid: BleUuid::Uuid16(CCCD_UUID),
                        handle: next,
                    });
                    next += 1;
                }
            }
        }
    }

    fn send(&self, call: HostCall) -> Result<(), HostError> {
        if let Some(e) = *self.send_error.lock().unwrap() {
            return Err(e);
        }
        self.record(call);
        Ok(())
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStack for MockHost {
    fn ensure_address(&self, _prefer_random: bool) -> Result<(), HostError> {
        if self.config.fail_address {
            return Err(HostError::Rejected(0x02));
        }
        Ok(())
    }

    fn infer_address_type(&self, _privacy: bool) -> Result<AddressType, HostError> {
        if self.config.fail_address_type {
            return Err(HostError::Rejected(0x03));
        }
        Ok(AddressType::Public)
    }

    fn copy_address(&self, _address_type: AddressType) -> Result<BdAddr, HostError> {
        Ok(BdAddr::new(DEVICE_ADDRESS))
    }

    fn set_device_name(&self, name: &str) -> Result<(), HostError> {
        if self.config.fail_name {
            return Err(HostError::Rejected(0x07));
        }
        self.record(HostCall::SetDeviceName(name.to_string()));
        Ok(())
    }

    fn register_services(
        &self,
        services: &[ServiceDescriptor<'_>],
        on_event: &mut dyn FnMut(RegistrationEvent),
    ) -> Result<(), HostError> {
        if self.config.reject_registration {
            return Err(HostError::NoResources);
        }
        match &self.config.registration_script {
            Some(script) => script.iter().for_each(|e| on_event(*e)),
            None => Self::sequential_registration(services, on_event),
        }
        Ok(())
    }

    fn start_advertising(&self, request: &AdvertisingRequest<'_>) -> Result<(), HostError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HostError::Busy);
        }
        self.record(HostCall::StartAdvertising {
            adv_data: request.adv_data.to_vec(),
            scan_data: request.scan_data.to_vec(),
        });
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), HostError> {
        self.record(HostCall::StopAdvertising);
        Ok(())
    }

    fn find_connection(&self, conn_handle: u16) -> Option<ConnectionDescriptor> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.conn_handle == conn_handle)
            .copied()
    }

    fn update_conn_params(&self, conn_handle: u16, params: &ConnectionParams) -> Result<(), HostError> {
        if self.fail_param_update.load(Ordering::SeqCst) {
            return Err(HostError::Rejected(0x12));
        }
        self.record(HostCall::UpdateConnParams {
            conn_handle,
            params: *params,
        });
        Ok(())
    }

    fn terminate(&self, conn_handle: u16, reason: u8) -> Result<(), HostError> {
        self.record(HostCall::Terminate { conn_handle, reason });
        Ok(())
    }

    fn notify(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        self.send(HostCall::Notify {
            conn_handle,
            value_handle,
            data: data.to_vec(),
        })
    }

    fn indicate(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        self.send(HostCall::Indicate {
            conn_handle,
            value_handle,
            data: data.to_vec(),
        })
    }

    fn set_value(&self, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        self.record(HostCall::SetValue {
            value_handle,
            data: data.to_vec(),
        });
        Ok(())
    }
}

/// Output-style handler recording every applied write
#[derive(Default)]
pub struct RecordingHandler {
    level: Mutex<Option<bool>>,
    writes: AtomicU32,
}

impl RecordingHandler {
    pub fn level(&self) -> Option<bool> {
        *self.level.lock().unwrap()
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl AccessHandler for RecordingHandler {
    fn write(&self, data: &[u8]) -> Result<(), HandlerError> {
        match data {
            [level] => {
                *self.level.lock().unwrap() = Some(*level != 0);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(HandlerError::Rejected),
        }
    }
}

pub static DEFAULT_HANDLER: DefaultHandler = DefaultHandler;

pub const LED_UUID: BleUuid = BleUuid::Uuid128([
    0x23, 0xd1, 0xbc, 0xea, 0x5f, 0x78, 0x23, 0x15, 0xde, 0xef, 0x12, 0x12, 0x25, 0x15, 0x00, 0x00,
]);

/// Fixture attribute table and the handlers behind it
pub struct Fixture {
    pub led: &'static RecordingHandler,
    pub services: &'static [ServiceDescriptor<'static>],
}

/// Heart rate (Read|Indicate, 2 bytes), LED (Write, 1 byte) and a status
/// characteristic (Read|Notify|Indicate, 4 bytes). Every call leaks a fresh
/// set of handlers so tests stay independent.
pub fn fixture() -> Fixture {
    let led: &'static RecordingHandler = Box::leak(Box::default());

    let hrm: &'static [CharacteristicDescriptor<'static>] = Box::leak(Box::new([CharacteristicDescriptor {
        uuid: BleUuid::Uuid16(0x2A37),
        properties: Properties::READ | Properties::INDICATE,
        width: 2,
        handler: &DEFAULT_HANDLER,
    }]));

    let io: &'static [CharacteristicDescriptor<'static>] = Box::leak(Box::new([
        CharacteristicDescriptor {
            uuid: LED_UUID,
            properties: Properties::WRITE,
            width: 1,
            handler: led,
        },
        CharacteristicDescriptor {
            uuid: BleUuid::Uuid16(0x2A56),
            properties: Properties::READ | Properties::NOTIFY | Properties::INDICATE,
            width: 4,
            handler: &DEFAULT_HANDLER,
        },
    ]));

    let services: &'static [ServiceDescriptor<'static>] = Box::leak(Box::new([
        ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x180D),
            characteristics: hrm,
        },
        ServiceDescriptor {
            uuid: BleUuid::Uuid16(0x1815),
            characteristics: io,
        },
    ]));

    Fixture { led, services }
}

pub fn start_with(host: MockHost) -> (TestEngine, Fixture) {
    let fixture = fixture();
    let engine = match SessionEngine::startup(host, fixture.services, &SessionConfig::default()) {
        Ok(engine) => engine,
        Err(e) => panic!("startup failed: {:?}", e),
    };
    (engine, fixture)
}

/// Engine started and advertising
pub fn advertising_engine() -> (TestEngine, Fixture) {
    let (engine, fixture) = start_with(MockHost::new());
    engine.start_advertising().unwrap();
    (engine, fixture)
}

pub fn connect(engine: &TestEngine, conn_handle: u16) {
    engine.host().add_connection(conn_handle);
    engine
        .handle_event(HostEvent::Connect {
            status: 0,
            conn_handle,
        })
        .unwrap();
}

pub fn disconnect(engine: &TestEngine, conn_handle: u16, reason: u8) {
    engine.host().remove_connection(conn_handle);
    engine
        .handle_event(HostEvent::Disconnect { conn_handle, reason })
        .unwrap();
    engine.host().record(HostCall::Disconnected { conn_handle });
}

pub fn subscribe(engine: &TestEngine, conn_handle: u16, attr_handle: u16, notify: bool, indicate: bool) {
    engine
        .handle_event(HostEvent::Subscribe {
            conn_handle,
            attr_handle,
            prev_notify: false,
            cur_notify: notify,
            prev_indicate: false,
            cur_indicate: indicate,
        })
        .unwrap();
}

pub fn write(engine: &TestEngine, conn_handle: u16, attr_handle: u16, data: &[u8]) -> Result<(), AccessError> {
    engine.handle_event(HostEvent::Access {
        conn_handle,
        attr_handle,
        access: Access::Write { data },
    })
}

pub fn read(engine: &TestEngine, conn_handle: u16, attr_handle: u16) -> Result<Vec<u8>, AccessError> {
    let mut out = ValueBuffer::new();
    engine.handle_event(HostEvent::Access {
        conn_handle,
        attr_handle,
        access: Access::Read { out: &mut out },
    })?;
    Ok(out.to_vec())
}
