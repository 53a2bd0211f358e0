//! Application-wide constants and runtime configuration.
//!
//! Timing parameters, capacities and protocol constants live here so
//! they can be tuned in one place.  [`CentralConfig`] collects the
//! policies the central state machine consults at run time.

use crate::ble::stack::{ConnParams, DiscoveryMode, LinkParams, ScanParams};
use crate::ble::types::Uuid;

// BLE

/// Maximum number of scan results kept per scan.
pub const MAX_SCAN_RESULTS: usize = 8;

/// Duration of a scan window (ms).
pub const SCAN_DURATION_MS: u32 = 4000;

/// Delay between link establishment and the start of service discovery (ms).
pub const SVC_DISCOVERY_DELAY_MS: u32 = 1000;

/// RSSI polling period (ms).
pub const RSSI_PERIOD_MS: u32 = 1000;

/// Connection parameters requested by a link update (1.25 ms units).
pub const UPDATE_MIN_CONN_INTERVAL: u16 = 400;
pub const UPDATE_MAX_CONN_INTERVAL: u16 = 800;

/// Slave latency requested by a link update.
pub const UPDATE_SLAVE_LATENCY: u16 = 0;

/// Supervision timeout requested by a link update (10 ms units). 600 = 6 s.
pub const UPDATE_CONN_TIMEOUT: u16 = 600;

/// Default ATT MTU; bounds every attribute value we carry.
pub const ATT_MTU: usize = 23;

/// Largest value in a read response or notification (MTU - 1).
pub const MAX_ATT_VALUE: usize = ATT_MTU - 1;

/// Largest value accepted for a characteristic write (MTU - 3).
pub const MAX_WRITE_VALUE: usize = ATT_MTU - 3;

/// Largest advertising / scan response payload.
pub const MAX_AD_DATA: usize = 31;

/// 16-bit service UUID advertised by the target peripherals.
pub const SCAN_FILTER_UUID: u16 = 0xFFF0;

/// 128-bit UUID of the target primary service (little-endian).
pub const TARGET_SERVICE_UUID: [u8; 16] = [
    0x8b, 0xb9, 0xb1, 0xcd, 0x90, 0x4c, 0x4d, 0xe3, 0xbb, 0x7b, 0xbb, 0x27, 0xb2, 0x2e, 0xdd, 0xe6,
];

/// 128-bit UUID of the target characteristic (little-endian).
///
/// The deployed peripherals reuse the service UUID for their single
/// characteristic.
pub const TARGET_CHAR_UUID: [u8; 16] = TARGET_SERVICE_UUID;

// Serial link

/// Capacity of the textual command receive buffer.
pub const CMD_BUFFER_LEN: usize = 128;

/// Largest raw UART chunk delivered in one receive event.
pub const RX_CHUNK_LEN: usize = 64;

/// A partially received text command is discarded after this long (ms).
pub const RX_IDLE_TIMEOUT_MS: u32 = 500;

/// Longest formatted host status line.
pub const LINE_LEN: usize = 96;

// Buttons

/// Debounce delay for the board buttons (ms).
pub const BUTTON_DEBOUNCE_MS: u64 = 50;

/// Which primary-service procedure runs in discovery phase 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryMethod {
    /// "Find primary service by UUID".
    ByUuid,
    /// "Discover all primary services", matching the target UUID locally.
    All,
}

/// Operation performed by the manual read/write trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManualOpPolicy {
    /// Alternate between read and write on successive triggers.
    Alternate,
    /// Always read.
    Read,
    /// Always write.
    Write,
}

/// How inbound notifications and indications are relayed to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotifyFormat {
    /// `handle <HHHH> <xx xx ...>` status line.
    Text,
    /// The bare value bytes.
    Raw,
    /// A binary frame of type `NOTIFICATION_FRAME_TYPE`.
    Framed,
}

/// Run-time policy for the central.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CentralConfig {
    pub scan: ScanParams,
    pub link: LinkParams,
    /// Only keep scan results advertising this 16-bit service UUID.
    pub scan_filter: Option<u16>,
    pub discovery: DiscoveryMethod,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub discovery_delay_ms: u32,
    /// Keep the characteristic handle across reconnects instead of
    /// rediscovering on every connection.
    pub cache_characteristic: bool,
    pub manual_op: ManualOpPolicy,
    pub rssi_period_ms: u32,
    pub update: ConnParams,
    pub notify_format: NotifyFormat,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan: ScanParams {
                mode: DiscoveryMode::All,
                active: true,
                use_whitelist: false,
            },
            link: LinkParams {
                high_duty_cycle: false,
                use_whitelist: false,
            },
            scan_filter: Some(SCAN_FILTER_UUID),
            discovery: DiscoveryMethod::ByUuid,
            service_uuid: Uuid::Uuid128(TARGET_SERVICE_UUID),
            characteristic_uuid: Uuid::Uuid128(TARGET_CHAR_UUID),
            discovery_delay_ms: SVC_DISCOVERY_DELAY_MS,
            cache_characteristic: false,
            manual_op: ManualOpPolicy::Alternate,
            rssi_period_ms: RSSI_PERIOD_MS,
            update: ConnParams {
                min_interval: UPDATE_MIN_CONN_INTERVAL,
                max_interval: UPDATE_MAX_CONN_INTERVAL,
                slave_latency: UPDATE_SLAVE_LATENCY,
                supervision_timeout: UPDATE_CONN_TIMEOUT,
            },
            notify_format: NotifyFormat::Text,
        }
    }
}
