//! Scan result collection.
//!
//! [`ScanResultStore`] accumulates the peripherals reported during a scan
//! window, optionally keeping only those that advertise a given 16-bit
//! service UUID, and tracks the device currently selected for connection.

use heapless::Vec;

use crate::ble::adv_parser::contains_service_uuid16;
use crate::ble::types::PeerDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ScanPhase {
    Idle,
    Scanning,
}

/// Ordered, deduplicated list of discovered peripherals plus a selection
/// cursor.
///
/// Invariant: at most `N` entries, no two with the same address.
#[derive(Clone, Debug)]
pub struct ScanResultStore<const N: usize> {
    devices: Vec<PeerDevice, N>,
    cursor: usize,
    phase: ScanPhase,
    filter: Option<u16>,
}

impl<const N: usize> ScanResultStore<N> {
    /// `filter`: only keep devices advertising this 16-bit service UUID.
    pub const fn new(filter: Option<u16>) -> Self {
        Self {
            devices: Vec::new(),
            cursor: 0,
            phase: ScanPhase::Idle,
            filter,
        }
    }

    /// Forget previous results and enter the scanning phase.
    pub fn start_scan(&mut self) {
        self.devices.clear();
        self.cursor = 0;
        self.phase = ScanPhase::Scanning;
    }

    /// Handle one advertising report. Returns `true` if the device was added.
    pub fn on_device_seen(&mut self, device: PeerDevice, ad_data: &[u8]) -> bool {
        let wanted = match self.filter {
            Some(uuid) => contains_service_uuid16(ad_data, uuid),
            None => true,
        };
        wanted && self.add(device)
    }

    /// Append `device` unless the store is full or already holds its address.
    pub fn add(&mut self, device: PeerDevice) -> bool {
        let already_seen = self.devices.iter().any(|d| d.address == device.address);
        if already_seen || self.devices.is_full() {
            return false;
        }
        self.devices.push(device).is_ok()
    }

    /// Close the scan window.
    ///
    /// Unfiltered stores take the stack's list wholesale (deduplicated,
    /// truncated to capacity); filtered stores keep what they built.  The
    /// cursor is left one past the last device so that the first
    /// [`select_next`](Self::select_next) lands on index 0.
    pub fn on_discovery_complete(&mut self, all_devices: &[PeerDevice]) {
        if self.filter.is_none() {
            self.devices.clear();
            for device in all_devices {
                self.add(*device);
            }
        }
        self.cursor = self.devices.len();
        self.phase = ScanPhase::Idle;
    }

    /// Abandon the running scan, keeping whatever was collected.
    pub fn cancel(&mut self) {
        self.phase = ScanPhase::Idle;
    }

    pub fn is_scanning(&self) -> bool {
        self.phase == ScanPhase::Scanning
    }

    /// Advance the cursor, wrapping to the first device.  Returns the new
    /// index and the device, or `None` when the store is empty.
    pub fn select_next(&mut self) -> Option<(usize, PeerDevice)> {
        if self.devices.is_empty() {
            return None;
        }
        self.cursor = if self.cursor + 1 < self.devices.len() {
            self.cursor + 1
        } else {
            0
        };
        self.selected().map(|d| (self.cursor, d))
    }

    /// Device under the cursor, if the cursor points at one.
    pub fn selected(&self) -> Option<PeerDevice> {
        self.devices.get(self.cursor).copied()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDevice> {
        self.devices.iter()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
