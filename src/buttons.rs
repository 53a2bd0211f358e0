//! Board buttons with async debouncing.
//!
//! The nRF52840-DK has four active-low buttons; each one maps to a
//! [`UserAction`].  A second action is reached by holding button 4 while
//! pressing another button:
//!
//! | Button | Alone                | With button 4 held |
//! |--------|----------------------|--------------------|
//! | 1      | scan / cancel scan   | link update        |
//! | 2      | select next device   | RSSI on / off      |
//! | 3      | connect / disconnect |                    |
//! | 4      | read / write         |                    |

use ble2uart::config::BUTTON_DEBOUNCE_MS;
use ble2uart::{Event, UserAction};
use defmt::info;
use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};

use crate::EVENT_QUEUE_LEN;

/// Shift button state, shared by all button tasks.
struct Shift {
    held: bool,
    /// Another button was pressed while shift was held.
    used: bool,
}

static SHIFT: Mutex<CriticalSectionRawMutex, Shift> = Mutex::new(Shift {
    held: false,
    used: false,
});

/// Actions bound to one physical button.
#[derive(Clone, Copy)]
pub struct Binding {
    pub press: Option<UserAction>,
    pub shifted: Option<UserAction>,
}

/// Run a single button loop.
///
/// Waits for the pin to go low (pressed), debounces, posts the action,
/// then waits for release before repeating.
pub async fn button_task(
    pin: AnyPin,
    binding: Binding,
    tx: Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN>,
) -> ! {
    let mut btn = Input::new(pin, Pull::Up);

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;

        if btn.is_low() {
            let action = {
                let mut shift = SHIFT.lock().await;
                if shift.held {
                    shift.used = true;
                    binding.shifted
                } else {
                    binding.press
                }
            };
            if let Some(action) = action {
                info!("button: {}", action);
                tx.send(Event::Action(action)).await;
            }

            // Wait for release to avoid repeat triggers.
            btn.wait_for_rising_edge().await;
            Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        }
    }
}

/// Track the shift button; pressed and released on its own it is the
/// read/write trigger.
pub async fn shift_task(
    pin: AnyPin,
    tx: Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN>,
) -> ! {
    let mut btn = Input::new(pin, Pull::Up);

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        if !btn.is_low() {
            continue;
        }
        *SHIFT.lock().await = Shift {
            held: true,
            used: false,
        };

        btn.wait_for_rising_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        let used = {
            let mut shift = SHIFT.lock().await;
            shift.held = false;
            shift.used
        };

        if !used {
            info!("button: {}", UserAction::ReadOrWrite);
            tx.send(Event::Action(UserAction::ReadOrWrite)).await;
        }
    }
}
