//! Single-consumer event loop.
//!
//! Every producer (UART receiver, buttons, radio task, timers) posts an
//! [`Event`] into one channel; [`App::run`] drains it and hands each event
//! to the central or to the host input parser.  All state is touched from
//! this one task, so none of it needs locking.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Receiver;
use heapless::Vec;

use crate::ble::central::{Central, UserAction};
use crate::ble::stack::{BleStack, GapEvent, GattMessage, TimerId};
use crate::ble::types::ConnHandle;
use crate::config::{CentralConfig, RX_CHUNK_LEN, RX_IDLE_TIMEOUT_MS};
use crate::error::Error;
use crate::serial::report::{emit, HostSink, Report};
use crate::serial::{Command, HostInput};

/// Everything the application reacts to.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Bytes received from the host.
    HostRx(Vec<u8, RX_CHUNK_LEN>),
    Action(UserAction),
    Gap(GapEvent),
    Gatt { conn: ConnHandle, msg: GattMessage },
    Timer(TimerId),
}

pub struct App<S: BleStack, H: HostSink> {
    central: Central<S>,
    input: HostInput,
    host: H,
    rx_timer_armed: bool,
}

impl<S: BleStack, H: HostSink> App<S, H> {
    pub fn new(config: CentralConfig, stack: S, host: H) -> Self {
        Self {
            central: Central::new(config, stack),
            input: HostInput::new(),
            host,
            rx_timer_armed: false,
        }
    }

    /// Wait for events forever.
    pub async fn run<M: RawMutex, const N: usize>(&mut self, events: Receiver<'_, M, Event, N>) -> ! {
        info!("event loop started");
        loop {
            let event = events.receive().await;
            self.dispatch(event);
        }
    }

    /// Handle one event to completion.
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::HostRx(chunk) => self.on_host_rx(&chunk),
            Event::Action(action) => self.central.on_action(action, &mut self.host),
            Event::Gap(event) => self.central.on_gap(event, &mut self.host),
            Event::Gatt { conn, msg } => self.central.on_gatt(conn, msg, &mut self.host),
            Event::Timer(TimerId::HostRxIdle) => {
                self.rx_timer_armed = false;
                let Self {
                    central,
                    input,
                    host,
                    ..
                } = self;
                if input.expire(|result| on_input(central, &mut *host, result)) {
                    debug!("partial host input discarded");
                }
            }
            Event::Timer(timer) => self.central.on_timer(timer, &mut self.host),
        }
    }

    fn on_host_rx(&mut self, chunk: &[u8]) {
        let Self {
            central,
            input,
            host,
            rx_timer_armed,
        } = self;

        input.feed(chunk, |result| on_input(central, &mut *host, result));

        if input.has_partial() {
            // Unarmed on failure; the next chunk tries again.
            *rx_timer_armed = match central
                .stack_mut()
                .schedule_timer(TimerId::HostRxIdle, RX_IDLE_TIMEOUT_MS)
            {
                Ok(()) => true,
                Err(e) => {
                    warn!("host idle timer not scheduled: {:?}", e);
                    false
                }
            };
        } else if *rx_timer_armed {
            if let Err(e) = central.stack_mut().cancel_timer(TimerId::HostRxIdle) {
                warn!("host idle timer not cancelled: {:?}", e);
            }
            *rx_timer_armed = false;
        }
    }

    pub fn central(&self) -> &Central<S> {
        &self.central
    }

    pub fn central_mut(&mut self) -> &mut Central<S> {
        &mut self.central
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

fn on_input<S: BleStack>(
    central: &mut Central<S>,
    host: &mut impl HostSink,
    result: Result<Command, Error>,
) {
    match result {
        Ok(cmd) => central.execute(cmd, host),
        // Broken frames are dropped silently on the wire.
        Err(Error::Frame(e)) => warn!("host frame dropped: {:?}", e),
        Err(e) => emit(host, &Report::Error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::central::ConnectionState;
    use crate::ble::stack::{QueuedStack, StackRequest};
    use embassy_futures::block_on;
    use embassy_futures::select::{select, Either};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;

    type Requests = Channel<NoopRawMutex, StackRequest, 16>;
    type Out = heapless::Vec<u8, 512>;

    fn app(requests: &Requests) -> App<QueuedStack<'_, NoopRawMutex, 16>, Out> {
        App::new(
            CentralConfig::default(),
            QueuedStack::new(requests.sender()),
            Out::new(),
        )
    }

    fn rx(bytes: &[u8]) -> Event {
        Event::HostRx(Vec::from_slice(bytes).unwrap())
    }

    fn host_text(app: &mut App<QueuedStack<'_, NoopRawMutex, 16>, Out>) -> std::string::String {
        let text = std::string::String::from_utf8(app.host().to_vec()).unwrap();
        app.host_mut().clear();
        text
    }

    #[test]
    fn text_command_reaches_central() {
        let requests = Requests::new();
        let mut app = app(&requests);
        app.dispatch(rx(b"scan device\r\n"));
        assert_eq!(host_text(&mut app), "scanning...\r\n");
        assert!(matches!(requests.try_receive(), Ok(StackRequest::StartScan(_))));
    }

    #[test]
    fn partial_command_arms_idle_timer() {
        let requests = Requests::new();
        let mut app = app(&requests);

        app.dispatch(rx(b"scan de"));
        assert_eq!(
            requests.try_receive(),
            Ok(StackRequest::ScheduleTimer {
                timer: TimerId::HostRxIdle,
                delay_ms: RX_IDLE_TIMEOUT_MS,
            })
        );

        app.dispatch(rx(b"vice\r\n"));
        assert!(matches!(requests.try_receive(), Ok(StackRequest::StartScan(_))));
        assert_eq!(
            requests.try_receive(),
            Ok(StackRequest::CancelTimer(TimerId::HostRxIdle))
        );
    }

    #[test]
    fn idle_timer_discards_partial_command() {
        let requests = Requests::new();
        let mut app = app(&requests);
        app.dispatch(rx(b"scan de"));
        app.dispatch(Event::Timer(TimerId::HostRxIdle));
        app.dispatch(rx(b"vice\r\n"));
        assert_eq!(host_text(&mut app), "error: unrecognized command\r\n");
    }

    #[test]
    fn broken_frame_is_silent() {
        let requests = Requests::new();
        let mut app = app(&requests);
        // Checksum byte is wrong.
        app.dispatch(rx(&[0xF0, 0x01, 0x01, 0x00]));
        assert!(app.host().is_empty());
    }

    #[test]
    fn run_drains_queued_events() {
        let requests = Requests::new();
        let events: Channel<NoopRawMutex, Event, 4> = Channel::new();
        let mut app = app(&requests);

        events.try_send(rx(b"connect Mac 5F:15:00:01:35:EF\r\n")).unwrap();
        events
            .try_send(Event::Gap(GapEvent::LinkEstablished {
                status: 0,
                conn: 3,
                address: crate::ble::types::Address::new([0xEF, 0x35, 0x01, 0x00, 0x15, 0x5F]),
            }))
            .unwrap();

        let done = block_on(select(app.run(events.receiver()), async {}));
        assert!(matches!(done, Either::Second(())));
        assert_eq!(app.central().state(), ConnectionState::Connected);
        assert_eq!(
            host_text(&mut app),
            "Connecting...\r\nconnected device 0x5F15000135EF\r\n"
        );
    }
}
