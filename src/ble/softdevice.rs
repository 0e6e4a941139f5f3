//! SoftDevice Host Adapter
//!
//! Implements [`HostStack`] over nrf-softdevice and pumps SoftDevice
//! connection and GATT events into the session engine. Advertising requests
//! from the engine are handed to [`run_peripheral`] through a signal, since
//! nrf-softdevice advertises from an async context.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties as SdProperties};
use nrf_softdevice::ble::gatt_server::{self, CharacteristicHandles, WriteOp};
use nrf_softdevice::ble::peripheral::{self, AdvertiseError, ConnectableAdvertisement};
use nrf_softdevice::ble::{self as sd_ble, Connection, Uuid};
use nrf_softdevice::{raw, RawError, Softdevice};

use crate::ble::access::Access;
use crate::ble::advertising::{AdvPayload, AdvertisingRequest};
use crate::ble::events::HostEvent;
use crate::ble::gap_state::ConnectionParams;
use crate::ble::host::{ConnectionDescriptor, HostError, HostStack};
use crate::ble::identity::{AddressType, BdAddr};
use crate::ble::notifications::TxStatus;
use crate::ble::registry::{BleUuid, Properties, RegistrationEvent, ServiceDescriptor, CCCD_UUID};
use crate::ble::session::SessionEngine;
use crate::config::{MAX_CHARACTERISTICS, MAX_VALUE_LEN};

/// HCI "unspecified error"; the SoftDevice does not report the disconnect reason here
const HCI_REASON_UNSPECIFIED: u8 = 0x1F;

/// Advertising command for the peripheral task
#[derive(Clone)]
enum AdvCommand {
    Start {
        adv_data: AdvPayload,
        scan_data: AdvPayload,
        interval: u32,
        timeout: Option<u16>,
    },
    Stop,
}

/// Exclusive access is needed for service registration only
enum SdRef {
    Exclusive(&'static mut Softdevice),
    Shared(&'static Softdevice),
}

/// [`HostStack`] implementation over the Nordic SoftDevice
pub struct SoftdeviceHost {
    sd: Mutex<CriticalSectionRawMutex, RefCell<Option<SdRef>>>,
    commands: Signal<CriticalSectionRawMutex, AdvCommand>,
}

impl SoftdeviceHost {
    pub fn new(sd: &'static mut Softdevice) -> Self {
        Self {
            sd: Mutex::new(RefCell::new(Some(SdRef::Exclusive(sd)))),
            commands: Signal::new(),
        }
    }

    /// Shared SoftDevice reference. Ends the registration phase.
    pub fn softdevice(&self) -> Option<&'static Softdevice> {
        self.sd.lock(|slot| {
            let mut slot = slot.borrow_mut();
            let sd: &'static Softdevice = match slot.take()? {
                SdRef::Exclusive(sd) => sd,
                SdRef::Shared(sd) => sd,
            };
            *slot = Some(SdRef::Shared(sd));
            Some(sd)
        })
    }

    fn with_exclusive<R>(&self, f: impl FnOnce(&mut Softdevice) -> R) -> Option<R> {
        self.sd.lock(|slot| match slot.borrow_mut().as_mut() {
            Some(SdRef::Exclusive(sd)) => Some(f(sd)),
            _ => None,
        })
    }

    /// Borrow the SoftDevice without ending the registration phase
    fn with_sd<R>(&self, f: impl FnOnce(&Softdevice) -> R) -> Result<R, HostError> {
        self.sd.lock(|slot| match slot.borrow().as_ref() {
            Some(SdRef::Exclusive(sd)) => Ok(f(sd)),
            Some(SdRef::Shared(sd)) => Ok(f(sd)),
            None => Err(HostError::Busy),
        })
    }

    /// Random byte from the SoftDevice RNG
    pub fn random_u8(&self) -> u8 {
        let mut buf = [0u8; 1];
        match self.with_sd(|sd| nrf_softdevice::random_bytes(sd, &mut buf)) {
            Ok(Ok(())) => {}
            _ => warn!("SD: RNG unavailable"),
        }
        buf[0]
    }
}

fn raw_error(e: RawError) -> HostError {
    match e {
        RawError::Busy => HostError::Busy,
        RawError::NoMem | RawError::Resources => HostError::NoResources,
        other => HostError::Rejected(other as u32),
    }
}

fn sd_uuid(uuid: BleUuid) -> Uuid {
    match uuid {
        BleUuid::Uuid16(u) => Uuid::new_16(u),
        BleUuid::Uuid128(bytes) => Uuid::new_128(&bytes),
    }
}

fn sd_properties(properties: Properties) -> SdProperties {
    let mut p = SdProperties::new();
    if properties.contains(Properties::READ) {
        p = p.read();
    }
    if properties.contains(Properties::WRITE) {
        p = p.write();
    }
    if properties.contains(Properties::WRITE_WITHOUT_RESPONSE) {
        p = p.write_without_response();
    }
    if properties.contains(Properties::NOTIFY) {
        p = p.notify();
    }
    if properties.contains(Properties::INDICATE) {
        p = p.indicate();
    }
    p
}

fn address_type(t: sd_ble::AddressType) -> Option<AddressType> {
    match t {
        sd_ble::AddressType::Public => Some(AddressType::Public),
        sd_ble::AddressType::RandomStatic => Some(AddressType::RandomStatic),
        sd_ble::AddressType::RandomPrivateResolvable => Some(AddressType::RandomPrivateResolvable),
        sd_ble::AddressType::RandomPrivateNonResolvable => Some(AddressType::RandomPrivateNonResolvable),
        _ => None,
    }
}

fn register_service(
    sd: &mut Softdevice,
    service: &ServiceDescriptor<'_>,
    on_event: &mut dyn FnMut(RegistrationEvent),
) -> Result<(), HostError> {
    let reject = |e: gatt_server::RegisterError| {
        error!("SD: Service registration failed: {:?}", e);
        HostError::NoResources
    };

    let mut sb = ServiceBuilder::new(sd, sd_uuid(service.uuid)).map_err(reject)?;
    let mut handles: Vec<CharacteristicHandles, MAX_CHARACTERISTICS> = Vec::new();

    for c in service.characteristics {
        let initial = [0u8; MAX_VALUE_LEN];
        let attr = Attribute::new(&initial[..c.width as usize]);
        let metadata = Metadata::new(sd_properties(c.properties));
        let h = sb.add_characteristic(sd_uuid(c.uuid), attr, metadata).map_err(reject)?.build();
        handles.push(h).map_err(|_| HostError::NoResources)?;
    }

    let service_handle = sb.build();
    on_event(RegistrationEvent::Service {
        uuid: service.uuid,
        handle: service_handle.handle(),
    });

    for (c, h) in service.characteristics.iter().zip(handles.iter()) {
        on_event(RegistrationEvent::Characteristic {
            uuid: c.uuid,
            def_handle: h.value_handle.saturating_sub(1),
            value_handle: h.value_handle,
        });
        if c.properties.is_subscribable() {
            on_event(RegistrationEvent::Descriptor {
                uuid: BleUuid::Uuid16(CCCD_UUID),
                handle: h.cccd_handle,
            });
        }
    }

    Ok(())
}

impl HostStack for SoftdeviceHost {
    fn ensure_address(&self, prefer_random: bool) -> Result<(), HostError> {
        self.with_sd(|sd| {
            let current = sd_ble::get_address(sd);
            if !prefer_random || matches!(current.address_type(), sd_ble::AddressType::RandomStatic) {
                return Ok(());
            }

            let mut bytes = [0u8; 6];
            nrf_softdevice::random_bytes(sd, &mut bytes).map_err(raw_error)?;
            // Random static: two most significant bits set
            bytes[5] |= 0xC0;
            sd_ble::set_address(sd, &sd_ble::Address::new(sd_ble::AddressType::RandomStatic, bytes));
            Ok(())
        })?
    }

    fn infer_address_type(&self, _privacy: bool) -> Result<AddressType, HostError> {
        self.with_sd(|sd| address_type(sd_ble::get_address(sd).address_type()))?
            .ok_or(HostError::Rejected(0))
    }

    fn copy_address(&self, _address_type: AddressType) -> Result<BdAddr, HostError> {
        self.with_sd(|sd| BdAddr::new(sd_ble::get_address(sd).bytes()))
    }

    fn set_device_name(&self, name: &str) -> Result<(), HostError> {
        let sec_mode = raw::ble_gap_conn_sec_mode_t {
            _bitfield_1: raw::ble_gap_conn_sec_mode_t::new_bitfield_1(1, 1),
        };
        let ret = unsafe { raw::sd_ble_gap_device_name_set(&sec_mode, name.as_ptr(), name.len() as u16) };
        RawError::convert(ret).map_err(raw_error)
    }

    fn register_services(
        &self,
        services: &[ServiceDescriptor<'_>],
        on_event: &mut dyn FnMut(RegistrationEvent),
    ) -> Result<(), HostError> {
        self.with_exclusive(|sd| {
            for service in services {
                register_service(sd, service, on_event)?;
            }
            Ok(())
        })
        .ok_or(HostError::Busy)?
    }

    fn start_advertising(&self, request: &AdvertisingRequest<'_>) -> Result<(), HostError> {
        let mut adv_data = AdvPayload::new();
        let mut scan_data = AdvPayload::new();
        adv_data
            .extend_from_slice(request.adv_data)
            .map_err(|_| HostError::NoResources)?;
        scan_data
            .extend_from_slice(request.scan_data)
            .map_err(|_| HostError::NoResources)?;

        self.commands.signal(AdvCommand::Start {
            adv_data,
            scan_data,
            interval: request.params.interval_min,
            timeout: request.params.timeout,
        });
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), HostError> {
        self.commands.signal(AdvCommand::Stop);
        Ok(())
    }

    fn find_connection(&self, conn_handle: u16) -> Option<ConnectionDescriptor> {
        let conn = Connection::from_handle(conn_handle)?;
        let peer = conn.peer_address();
        let params = conn.conn_params();
        Some(ConnectionDescriptor {
            conn_handle,
            peer_address: BdAddr::new(peer.bytes()),
            peer_address_type: address_type(peer.address_type()).unwrap_or(AddressType::Public),
            conn_interval: params.max_conn_interval,
            slave_latency: params.slave_latency,
            supervision_timeout: params.conn_sup_timeout,
        })
    }

    fn update_conn_params(&self, conn_handle: u16, params: &ConnectionParams) -> Result<(), HostError> {
        let conn = Connection::from_handle(conn_handle).ok_or(HostError::NotConnected)?;
        conn.set_conn_params(raw::ble_gap_conn_params_t {
            min_conn_interval: params.min_conn_interval,
            max_conn_interval: params.max_conn_interval,
            slave_latency: params.slave_latency,
            conn_sup_timeout: params.conn_sup_timeout,
        })
        .map_err(|e| match e {
            sd_ble::SetConnParamsError::Disconnected => HostError::NotConnected,
            sd_ble::SetConnParamsError::Raw(e) => raw_error(e),
        })
    }

    fn terminate(&self, conn_handle: u16, reason: u8) -> Result<(), HostError> {
        let conn = Connection::from_handle(conn_handle).ok_or(HostError::NotConnected)?;
        debug!("SD: Terminating {} (reason {})", conn_handle, reason);
        conn.disconnect().map_err(|_| HostError::NotConnected)
    }

    fn notify(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        let conn = Connection::from_handle(conn_handle).ok_or(HostError::NotConnected)?;
        gatt_server::notify_value(&conn, value_handle, data).map_err(|e| match e {
            gatt_server::NotifyValueError::Disconnected => HostError::NotConnected,
            gatt_server::NotifyValueError::Raw(e) => raw_error(e),
        })
    }

    fn indicate(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        let conn = Connection::from_handle(conn_handle).ok_or(HostError::NotConnected)?;
        gatt_server::indicate_value(&conn, value_handle, data).map_err(|e| match e {
            gatt_server::IndicateValueError::Disconnected => HostError::NotConnected,
            gatt_server::IndicateValueError::Raw(e) => raw_error(e),
        })
    }

    fn set_value(&self, value_handle: u16, data: &[u8]) -> Result<(), HostError> {
        self.with_sd(|sd| gatt_server::set_value(sd, value_handle, data))?
            .map_err(|gatt_server::SetValueError::Raw(e)| raw_error(e))
    }
}

/// GATT server forwarding SoftDevice callbacks into the engine
struct SessionServer<'e, M: RawMutex> {
    engine: &'e SessionEngine<'static, M, &'static SoftdeviceHost>,
}

impl<M: RawMutex> gatt_server::Server for SessionServer<'_, M> {
    type Event = ();

    fn on_write(&self, conn: &Connection, handle: u16, _op: WriteOp, offset: usize, data: &[u8]) -> Option<()> {
        let conn_handle = conn.handle()?;
        if offset != 0 {
            warn!("SD: Ignoring write at offset {} on {}", offset, handle);
            return None;
        }

        // The SoftDevice has already accepted the write; rejections are only logged
        let _ = self.engine.handle_event(HostEvent::Access {
            conn_handle,
            attr_handle: handle,
            access: Access::Write { data },
        });
        None
    }

    fn on_indicate_confirm(&self, conn: &Connection, handle: u16) -> Option<()> {
        let conn_handle = conn.handle()?;
        let _ = self.engine.handle_event(HostEvent::NotifyTx {
            conn_handle,
            attr_handle: handle,
            status: TxStatus::Acknowledged,
            indication: true,
        });
        None
    }
}

/// Advertise on request, then serve each connection until it drops.
///
/// Runs forever. Advertising is started and re-armed by the engine; this
/// loop only executes the latest command.
pub async fn run_peripheral<M: RawMutex>(
    host: &'static SoftdeviceHost,
    engine: &'static SessionEngine<'static, M, &'static SoftdeviceHost>,
) -> ! {
    let mut pending: Option<AdvCommand> = None;

    loop {
        let command = match pending.take() {
            Some(c) => c,
            None => host.commands.wait().await,
        };

        let AdvCommand::Start {
            adv_data,
            scan_data,
            interval,
            timeout,
        } = command
        else {
            continue;
        };

        let Some(sd) = host.softdevice() else {
            error!("SD: SoftDevice unavailable for advertising");
            continue;
        };

        let config = peripheral::Config {
            interval,
            timeout,
            ..Default::default()
        };
        let adv = ConnectableAdvertisement::ScannableUndirected {
            adv_data: &adv_data,
            scan_data: &scan_data,
        };

        let advertised = match select(peripheral::advertise_connectable(sd, adv, &config), host.commands.wait()).await {
            Either::First(result) => result,
            Either::Second(next) => {
                // New command while advertising: the dropped future stops the advertiser
                pending = Some(next);
                continue;
            }
        };

        let conn = match advertised {
            Ok(conn) => conn,
            Err(AdvertiseError::Timeout) => {
                let _ = engine.handle_event(HostEvent::AdvertisingComplete { reason: 0 });
                continue;
            }
            Err(e) => {
                error!("SD: Advertising failed: {:?}", e);
                Timer::after(Duration::from_secs(1)).await;
                let _ = engine.handle_event(HostEvent::AdvertisingComplete { reason: 1 });
                continue;
            }
        };

        let Some(conn_handle) = conn.handle() else {
            continue;
        };

        let _ = engine.handle_event(HostEvent::Connect {
            status: 0,
            conn_handle,
        });

        let server = SessionServer { engine };
        let e = gatt_server::run(&conn, &server, |_| {}).await;
        debug!("SD: GATT server exited: {:?}", e);

        let _ = engine.handle_event(HostEvent::Disconnect {
            conn_handle,
            reason: HCI_REASON_UNSPECIFIED,
        });
    }
}
