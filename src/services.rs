//! GATT Services
//!
//! The sensor peripheral's attribute table: Heart Rate (0x180D) with an
//! indicatable measurement, and Automation IO (0x1815) with two write-only
//! LED outputs. Also holds the access handlers behind those characteristics
//! and the heart rate producer step.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::signal::Signal;

use crate::ble::access::{AccessHandler, HandlerError, ValueBuffer};
use crate::ble::host::HostStack;
use crate::ble::notifications::{PublishFailure, PublishResult};
use crate::ble::registry::{BleUuid, CharacteristicDescriptor, CharacteristicId, Properties, ServiceDescriptor};
use crate::ble::session::SessionEngine;
use crate::config::{HEART_RATE_BASE_BPM, HEART_RATE_SPAN_BPM};

pub const HEART_RATE_SERVICE_UUID: BleUuid = BleUuid::Uuid16(0x180D);
pub const HEART_RATE_MEASUREMENT_UUID: BleUuid = BleUuid::Uuid16(0x2A37);
pub const AUTOMATION_IO_SERVICE_UUID: BleUuid = BleUuid::Uuid16(0x1815);

pub const LED1_UUID: BleUuid = BleUuid::Uuid128([
    0x23, 0xd1, 0xbc, 0xea, 0x5f, 0x78, 0x23, 0x15, 0xde, 0xef, 0x12, 0x12, 0x25, 0x15, 0x00, 0x00,
]);
pub const LED2_UUID: BleUuid = BleUuid::Uuid128([
    0x24, 0xd1, 0xbc, 0xea, 0x5f, 0x78, 0x23, 0x15, 0xde, 0xef, 0x12, 0x12, 0x25, 0x15, 0x00, 0x00,
]);

/// Heart rate measurement width: flags byte + 8-bit bpm
pub const HEART_RATE_MEASUREMENT_LEN: u8 = 2;

/// Simulated heart rate sensor
pub struct HeartRateMonitor {
    bpm: AtomicU8,
}

impl HeartRateMonitor {
    pub const fn new() -> Self {
        Self {
            bpm: AtomicU8::new(HEART_RATE_BASE_BPM),
        }
    }

    /// Take a new sample from a random byte.
    pub fn sample(&self, random: u8) -> u8 {
        let bpm = HEART_RATE_BASE_BPM + random % HEART_RATE_SPAN_BPM;
        self.bpm.store(bpm, Ordering::Relaxed);
        bpm
    }

    pub fn bpm(&self) -> u8 {
        self.bpm.load(Ordering::Relaxed)
    }

    /// Heart Rate Measurement value: flags (8-bit format) then bpm
    pub fn measurement(&self) -> [u8; 2] {
        [0x00, self.bpm()]
    }
}

impl Default for HeartRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessHandler for HeartRateMonitor {
    // Reads see the latest sample even when nobody is subscribed
    fn read(&self, _stored: &[u8], out: &mut ValueBuffer) -> Result<(), HandlerError> {
        out.extend_from_slice(&self.measurement())
            .map_err(|_| HandlerError::Overflow)
    }
}

/// LED output driven by GATT writes
pub struct LedOutput {
    name: &'static str,
    on: AtomicBool,
    changed: Signal<CriticalSectionRawMutex, bool>,
}

impl LedOutput {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            on: AtomicBool::new(false),
            changed: Signal::new(),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    /// Set the output. Setting the current level again is a no-op.
    pub fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::Relaxed) != on {
            info!("LED: {} turned {}", self.name, if on { "on" } else { "off" });
            self.changed.signal(on);
        }
    }

    /// Wait until the output level changes.
    pub async fn wait_change(&self) -> bool {
        self.changed.wait().await
    }
}

impl AccessHandler for LedOutput {
    fn read(&self, _stored: &[u8], out: &mut ValueBuffer) -> Result<(), HandlerError> {
        out.push(self.is_on() as u8).map_err(|_| HandlerError::Overflow)
    }

    fn write(&self, data: &[u8]) -> Result<(), HandlerError> {
        match data {
            [level] => {
                self.set(*level != 0);
                Ok(())
            }
            _ => Err(HandlerError::Rejected),
        }
    }
}

pub static HEART_RATE: HeartRateMonitor = HeartRateMonitor::new();
pub static LED1: LedOutput = LedOutput::new("LED1");
pub static LED2: LedOutput = LedOutput::new("LED2");

static HEART_RATE_CHARACTERISTICS: [CharacteristicDescriptor<'static>; 1] = [CharacteristicDescriptor {
    uuid: HEART_RATE_MEASUREMENT_UUID,
    properties: Properties::READ.union(Properties::INDICATE),
    width: HEART_RATE_MEASUREMENT_LEN,
    handler: &HEART_RATE,
}];

static AUTOMATION_IO_CHARACTERISTICS: [CharacteristicDescriptor<'static>; 2] = [
    CharacteristicDescriptor {
        uuid: LED1_UUID,
        properties: Properties::WRITE,
        width: 1,
        handler: &LED1,
    },
    CharacteristicDescriptor {
        uuid: LED2_UUID,
        properties: Properties::WRITE,
        width: 1,
        handler: &LED2,
    },
];

/// Attribute table registered at startup
pub static SERVICES: [ServiceDescriptor<'static>; 2] = [
    ServiceDescriptor {
        uuid: HEART_RATE_SERVICE_UUID,
        characteristics: &HEART_RATE_CHARACTERISTICS,
    },
    ServiceDescriptor {
        uuid: AUTOMATION_IO_SERVICE_UUID,
        characteristics: &AUTOMATION_IO_CHARACTERISTICS,
    },
];

/// One producer step: sample the monitor, mirror the measurement into the
/// stack's attribute table and publish it.
///
/// The mirror runs on every sample so stack-served reads stay current while
/// nobody is subscribed.
pub fn publish_heart_rate<M: RawMutex, H: HostStack>(
    engine: &SessionEngine<'_, M, H>,
    id: CharacteristicId,
    monitor: &HeartRateMonitor,
    random: u8,
) -> PublishResult {
    let bpm = monitor.sample(random);
    let measurement = monitor.measurement();

    if let Some(characteristic) = engine.registry().get(id) {
        if let Err(e) = engine.host().set_value(characteristic.value_handle, &measurement) {
            warn!("HRM: Attribute value update failed: {:?}", e);
        }
    }

    let result = engine.publish(id, &measurement);

    match result {
        PublishResult::Sent { .. } => debug!("HRM: Sent {} bpm", bpm),
        PublishResult::Skipped => trace!("HRM: {} bpm, no subscriber", bpm),
        PublishResult::Failed {
            reason: PublishFailure::Host(e),
        } => warn!("HRM: Indication rejected: {:?}", e),
        PublishResult::Failed { reason } => error!("HRM: Publish failed: {:?}", reason),
    }

    result
}
