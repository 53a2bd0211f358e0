//! Bluetooth Low Energy subsystem.
//!
//! The central role is split the same way the radio work is:
//!
//! 1. **Scanner** - collects advertising peripherals into a bounded,
//!    de-duplicated [`scanner::ScanResultStore`].
//! 2. **Discovery** - resolves the target characteristic in two GATT
//!    phases ([`discovery::DiscoverySequencer`]).
//! 3. **Central** - the connection state machine that ties scanning,
//!    discovery and reads/writes together ([`central::Central`]).
//!
//! The central never touches the radio directly; it talks to a
//! [`stack::BleStack`] and is fed the stack's events in return.

pub mod adv_parser;
pub mod central;
pub mod discovery;
pub mod gate;
pub mod scanner;
pub mod stack;
pub mod types;
