//! Host UART.
//!
//! Received bytes are grouped by line idle time and posted as
//! [`Event::HostRx`] chunks.  Output is written into a pipe that the TX
//! task drains, so the event loop never waits on the wire.

use ble2uart::config::RX_CHUNK_LEN;
use ble2uart::serial::report::HostSink;
use ble2uart::Event;
use defmt::warn;
use embassy_nrf::peripherals::{TIMER2, UARTE0};
use embassy_nrf::uarte::{UarteRxWithIdle, UarteTx};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_sync::pipe::Pipe;
use heapless::Vec;

use crate::EVENT_QUEUE_LEN;

const TX_PIPE_LEN: usize = 512;

static TX_PIPE: Pipe<CriticalSectionRawMutex, TX_PIPE_LEN> = Pipe::new();

/// Host output; bytes that do not fit in the pipe are dropped.
pub struct PipeSink;

impl HostSink for PipeSink {
    fn write(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            match TX_PIPE.try_write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(_) => {
                    warn!("host TX full, {} bytes dropped", rest.len());
                    return;
                }
            }
        }
    }
}

pub async fn rx_task(
    mut rx: UarteRxWithIdle<'static, UARTE0, TIMER2>,
    events: Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN>,
) -> ! {
    let mut buf = [0u8; RX_CHUNK_LEN];
    loop {
        match rx.read_until_idle(&mut buf).await {
            Ok(0) => {}
            Ok(n) => {
                let chunk = Vec::from_slice(&buf[..n]).unwrap_or_default();
                events.send(Event::HostRx(chunk)).await;
            }
            Err(e) => warn!("UART RX error: {:?}", e),
        }
    }
}

pub async fn tx_task(mut tx: UarteTx<'static, UARTE0>) -> ! {
    let mut buf = [0u8; 64];
    loop {
        let n = TX_PIPE.read(&mut buf).await;
        if let Err(e) = tx.write(&buf[..n]).await {
            warn!("UART TX error: {:?}", e);
        }
    }
}
