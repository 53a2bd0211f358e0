//! ble2uart firmware - BLE central bridged to a host UART.
//!
//! Target: nRF52840 with SoftDevice S140.
//!
//! ## Tasks
//!
//! - **softdevice** - runs the SoftDevice event loop
//! - **app** - the single event consumer driving the central
//! - **radio** - executes stack requests on the SoftDevice
//! - **timers** - one-shot timers requested by the central
//! - **uart rx / tx** - host serial link
//! - **buttons** - debounced board buttons

#![no_std]
#![no_main]

mod buttons;
mod radio;
mod uart;

use defmt_rtt as _; // global logger
use panic_probe as _;

use ble2uart::ble::stack::{QueuedStack, StackRequest, TimerId};
use ble2uart::config::{CentralConfig, ATT_MTU};
use ble2uart::{App, Event, UserAction};
use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::{AnyPin, Pin};
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_nrf::peripherals::{TIMER2, UARTE0};
use embassy_nrf::uarte::{self, UarteRxWithIdle, UarteTx};
use embassy_nrf::{bind_interrupts, peripherals};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use nrf_softdevice::{raw, Softdevice};

use crate::buttons::Binding;

pub const EVENT_QUEUE_LEN: usize = 16;
pub const REQUEST_QUEUE_LEN: usize = 8;
pub const TIMER_QUEUE_LEN: usize = 4;

static EVENTS: Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN> = Channel::new();
static REQUESTS: Channel<CriticalSectionRawMutex, StackRequest, REQUEST_QUEUE_LEN> =
    Channel::new();
static TIMERS: Channel<CriticalSectionRawMutex, StackRequest, TIMER_QUEUE_LEN> = Channel::new();

bind_interrupts!(struct Irqs {
    UARTE0_UART0 => uarte::InterruptHandler<peripherals::UARTE0>;
});

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn app_task(config: CentralConfig) -> ! {
    let stack = QueuedStack::new(REQUESTS.sender());
    let mut app = App::new(config, stack, uart::PipeSink);
    app.run(EVENTS.receiver()).await
}

#[embassy_executor::task]
async fn radio_task(sd: &'static Softdevice, config: CentralConfig) -> ! {
    let radio = radio::Radio::new(
        sd,
        REQUESTS.receiver(),
        TIMERS.sender(),
        EVENTS.sender(),
        &config,
    );
    radio.run().await
}

/// One-shot timers, at most one pending per [`TimerId`].
#[embassy_executor::task]
async fn timer_task() -> ! {
    let mut pending: [(TimerId, Option<Instant>); 2] = [
        (TimerId::StartDiscovery, None),
        (TimerId::HostRxIdle, None),
    ];

    loop {
        let next = pending.iter().filter_map(|(_, at)| *at).min();
        let expiry = async {
            match next {
                Some(at) => Timer::at(at).await,
                None => core::future::pending::<()>().await,
            }
        };

        match select(TIMERS.receive(), expiry).await {
            Either::First(StackRequest::ScheduleTimer { timer, delay_ms }) => {
                let at = Instant::now() + Duration::from_millis(delay_ms.into());
                for (id, slot) in pending.iter_mut() {
                    if *id == timer {
                        *slot = Some(at);
                    }
                }
            }
            Either::First(StackRequest::CancelTimer(timer)) => {
                for (id, slot) in pending.iter_mut() {
                    if *id == timer {
                        *slot = None;
                    }
                }
            }
            Either::First(_) => {}
            Either::Second(()) => {
                let now = Instant::now();
                for (id, slot) in pending.iter_mut() {
                    if slot.is_some_and(|at| at <= now) {
                        *slot = None;
                        EVENTS.send(Event::Timer(*id)).await;
                    }
                }
            }
        }
    }
}

#[embassy_executor::task]
async fn uart_rx_task(rx: UarteRxWithIdle<'static, UARTE0, TIMER2>) -> ! {
    uart::rx_task(rx, EVENTS.sender()).await
}

#[embassy_executor::task]
async fn uart_tx_task(tx: UarteTx<'static, UARTE0>) -> ! {
    uart::tx_task(tx).await
}

#[embassy_executor::task(pool_size = 3)]
async fn button_task(pin: AnyPin, binding: Binding) -> ! {
    buttons::button_task(pin, binding, EVENTS.sender()).await
}

#[embassy_executor::task]
async fn shift_task(pin: AnyPin) -> ! {
    buttons::shift_task(pin, EVENTS.sender()).await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ble2uart starting");

    // Priorities 0, 1 and 4 belong to the SoftDevice.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(nrf_config);
    interrupt::UARTE0_UART0.set_priority(Priority::P3);

    let mut uart_config = uarte::Config::default();
    uart_config.parity = uarte::Parity::EXCLUDED;
    uart_config.baudrate = uarte::Baudrate::BAUD115200;
    let uart = uarte::Uarte::new(p.UARTE0, Irqs, p.P0_08, p.P0_06, uart_config);
    let (tx, rx) = uart.split_with_idle(p.TIMER2, p.PPI_CH0, p.PPI_CH1);

    let sd: &'static Softdevice = enable_softdevice();
    unwrap!(spawner.spawn(softdevice_task(sd)));

    let config = CentralConfig::default();
    unwrap!(spawner.spawn(timer_task()));
    unwrap!(spawner.spawn(uart_tx_task(tx)));
    unwrap!(spawner.spawn(app_task(config.clone())));
    unwrap!(spawner.spawn(radio_task(sd, config)));
    unwrap!(spawner.spawn(uart_rx_task(rx)));

    let bindings = [
        (
            p.P0_11.degrade(),
            Binding {
                press: Some(UserAction::ToggleScan),
                shifted: Some(UserAction::UpdateLink),
            },
        ),
        (
            p.P0_12.degrade(),
            Binding {
                press: Some(UserAction::SelectNext),
                shifted: Some(UserAction::ToggleRssi),
            },
        ),
        (
            p.P0_24.degrade(),
            Binding {
                press: Some(UserAction::ConnectOrDisconnect),
                shifted: None,
            },
        ),
    ];
    for (pin, binding) in bindings {
        unwrap!(spawner.spawn(button_task(pin, binding)));
    }
    unwrap!(spawner.spawn(shift_task(p.P0_25.degrade())));

    info!("all tasks running");
}

fn enable_softdevice() -> &'static mut Softdevice {
    let config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t {
            att_mtu: ATT_MTU as u16,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 0,
            central_role_count: 1,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        ..Default::default()
    };

    Softdevice::enable(&config)
}
