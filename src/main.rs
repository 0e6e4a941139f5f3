#![no_std]
#![no_main]

use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_nrf::gpio::{Level, Output, OutputDrive};
use embassy_nrf::{config::Config, interrupt};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Timer};
use nrf_softdevice::{Config as SdConfig, Softdevice};
use panic_probe as _;
use static_cell::StaticCell;

use nrf52820_sensor_peripheral::ble::registry::CharacteristicId;
use nrf52820_sensor_peripheral::ble::session::SessionEngine;
use nrf52820_sensor_peripheral::ble::softdevice::{self, SoftdeviceHost};
use nrf52820_sensor_peripheral::config::{SessionConfig, DEFAULT_ATT_MTU, HEART_RATE_PERIOD_MS};
use nrf52820_sensor_peripheral::error::StartupError;
use nrf52820_sensor_peripheral::services::{
    self, LedOutput, HEART_RATE, HEART_RATE_MEASUREMENT_UUID, LED1, LED2, SERVICES,
};

type Engine = SessionEngine<'static, CriticalSectionRawMutex, &'static SoftdeviceHost>;

static HOST: StaticCell<SoftdeviceHost> = StaticCell::new();
static ENGINE: StaticCell<Engine> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Starting nRF52820 S140 sensor peripheral");

    // Configure nRF peripherals
    let mut nrf_config = Config::default();
    // Configure interrupt priorities to avoid SoftDevice reserved levels (0, 1, 4)
    nrf_config.gpiote_interrupt_priority = interrupt::Priority::P2;
    nrf_config.time_interrupt_priority = interrupt::Priority::P2;

    let p = embassy_nrf::init(nrf_config);

    let sd_config = SdConfig {
        clock: Some(nrf_softdevice::raw::nrf_clock_lf_cfg_t {
            source: nrf_softdevice::raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: nrf_softdevice::raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(nrf_softdevice::raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(nrf_softdevice::raw::ble_gatt_conn_cfg_t {
            att_mtu: DEFAULT_ATT_MTU,
        }),
        gatts_attr_tab_size: Some(nrf_softdevice::raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: 1408,
        }),
        gap_role_count: Some(nrf_softdevice::raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: Default::default(),
        }),
        ..Default::default()
    };

    let sd = Softdevice::enable(&sd_config);
    info!("SoftDevice enabled");

    let host: &'static SoftdeviceHost = HOST.init(SoftdeviceHost::new(sd));
    let engine: &'static Engine = match SessionEngine::startup(host, &SERVICES, &SessionConfig::default()) {
        Ok(engine) => ENGINE.init(engine),
        Err(e) => defmt::panic!("Startup failed: {:?}", e),
    };

    let Some(sd) = host.softdevice() else {
        defmt::panic!("SoftDevice still borrowed after registration");
    };

    let Some(heart_rate) = engine.registry().find(HEART_RATE_MEASUREMENT_UUID) else {
        defmt::panic!("Heart rate measurement not registered");
    };

    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(peripheral_task(host, engine)));
    unwrap!(spawner.spawn(led_task(&LED1, Output::new(p.P0_14, Level::High, OutputDrive::Standard))));
    unwrap!(spawner.spawn(led_task(&LED2, Output::new(p.P0_15, Level::High, OutputDrive::Standard))));
    unwrap!(spawner.spawn(heart_rate_task(host, engine, heart_rate)));

    if let Err(e) = engine.start_advertising() {
        defmt::panic!("Startup failed: {:?}", StartupError::from(e));
    }

    info!("System initialized");
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn peripheral_task(host: &'static SoftdeviceHost, engine: &'static Engine) -> ! {
    softdevice::run_peripheral(host, engine).await
}

/// Mirror an LED output onto its pin (active low)
#[embassy_executor::task(pool_size = 2)]
async fn led_task(led: &'static LedOutput, mut pin: Output<'static>) -> ! {
    loop {
        if led.wait_change().await {
            pin.set_low();
        } else {
            pin.set_high();
        }
    }
}

#[embassy_executor::task]
async fn heart_rate_task(host: &'static SoftdeviceHost, engine: &'static Engine, id: CharacteristicId) -> ! {
    loop {
        Timer::after(Duration::from_millis(HEART_RATE_PERIOD_MS)).await;
        services::publish_heart_rate(engine, id, &HEART_RATE, host.random_u8());
    }
}
