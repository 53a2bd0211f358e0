//! BLE central core for ble2uart.
//!
//! Everything here is hardware independent: the connection state machine,
//! GATT discovery, scan bookkeeping and the host serial protocol.  The
//! firmware in `main.rs` supplies a [`ble::stack::BleStack`] backed by the
//! SoftDevice and feeds [`app::App`] from its tasks; host tests drive the
//! same code with an in-memory request queue.
//!
//! Usage: `cargo test --lib` or `cargo test --features log`
//!
//! Note: The embedded binary is built with `--features embedded`.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod app;
pub mod ble;
pub mod config;
pub mod error;
pub mod serial;

pub use app::{App, Event};
pub use ble::central::{Central, ConnectionState, UserAction};
pub use error::Error;
