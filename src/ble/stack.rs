//! Contract between the central and the BLE stack it drives.
//!
//! Every request returns as soon as the stack has accepted it; the
//! outcome arrives later as a [`GapEvent`] or [`GattMessage`] delivered
//! through the application event queue.  Timers are requested the same
//! way and come back as `Event::Timer`.
//!
//! [`QueuedStack`] implements the contract by pushing a typed
//! [`StackRequest`] into an `embassy-sync` channel, which the radio task
//! (or a test) drains.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Sender;
use heapless::Vec;

use crate::ble::types::{
    AdData, Address, AttOpcode, AttValue, ConnHandle, HandleRange, PeerDevice, Uuid, WriteValue,
};
use crate::config::MAX_SCAN_RESULTS;

/// Maximum entries carried by one discovery response.
pub const MAX_RSP_ENTRIES: usize = 4;

/// GAP device discovery mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryMode {
    NonDiscoverable,
    General,
    Limited,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    pub mode: DiscoveryMode,
    pub active: bool,
    pub use_whitelist: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkParams {
    pub high_duty_cycle: bool,
    pub use_whitelist: bool,
}

/// Connection parameters for a link update request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// 1.25 ms units.
    pub min_interval: u16,
    /// 1.25 ms units.
    pub max_interval: u16,
    pub slave_latency: u16,
    /// 10 ms units.
    pub supervision_timeout: u16,
}

/// Timers the central schedules through the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Delayed start of service discovery after link establishment.
    StartDiscovery,
    /// Discards a partially received text command.
    HostRxIdle,
}

/// Reasons the stack refused a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// No buffer available for the request.
    NoResources,
    /// The stack is busy with a conflicting procedure.
    Busy,
    /// The connection handle is not (or no longer) valid.
    NotConnected,
    /// Any other status code reported by the stack.
    Failed(u8),
}

impl core::fmt::Display for StackError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StackError::NoResources => f.write_str("out of resources"),
            StackError::Busy => f.write_str("busy"),
            StackError::NotConnected => f.write_str("not connected"),
            StackError::Failed(code) => write!(f, "status {}", code),
        }
    }
}

/// Status carried by discovery responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProcedureStatus {
    /// More responses follow.
    InProgress,
    /// Last response of the procedure.
    Complete,
}

/// One primary service from a "read by group type" response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceEntry {
    pub range: HandleRange,
    pub uuid: Uuid,
}

/// One handle/value pair from a "read by type" response.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttributeData {
    pub handle: u16,
    pub value: AttValue,
}

/// Asynchronous GAP outcomes.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GapEvent {
    /// The stack finished initialising.
    DeviceReady { address: Address },
    /// One advertising report.
    DeviceSeen { device: PeerDevice, data: AdData },
    /// The scan window closed.
    ScanComplete {
        devices: Vec<PeerDevice, MAX_SCAN_RESULTS>,
    },
    /// Outcome of `establish_link`. Status 0 means success.
    LinkEstablished {
        status: u8,
        conn: ConnHandle,
        address: Address,
    },
    LinkTerminated { conn: ConnHandle, reason: u8 },
    LinkParamUpdated { conn: ConnHandle },
    Rssi { conn: ConnHandle, rssi: i8 },
}

/// Asynchronous GATT client messages.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattMessage {
    ReadRsp {
        value: AttValue,
    },
    WriteRsp,
    ErrorRsp {
        request: AttOpcode,
        code: u8,
    },
    FindByTypeValueRsp {
        ranges: Vec<HandleRange, MAX_RSP_ENTRIES>,
        status: ProcedureStatus,
    },
    ReadByTypeRsp {
        pairs: Vec<AttributeData, MAX_RSP_ENTRIES>,
        status: ProcedureStatus,
    },
    ReadByGroupTypeRsp {
        services: Vec<ServiceEntry, MAX_RSP_ENTRIES>,
        status: ProcedureStatus,
    },
    Notification {
        handle: u16,
        value: AttValue,
    },
    Indication {
        handle: u16,
        value: AttValue,
    },
}

/// Operations the central needs from the BLE stack and its scheduler.
pub trait BleStack {
    fn start_scan(&mut self, params: ScanParams) -> Result<(), StackError>;
    fn cancel_scan(&mut self) -> Result<(), StackError>;

    fn establish_link(&mut self, params: LinkParams, peer: PeerDevice) -> Result<(), StackError>;

    /// Terminate `conn`, or cancel a pending establishment when `None`.
    fn terminate_link(&mut self, conn: Option<ConnHandle>) -> Result<(), StackError>;

    fn update_link(&mut self, conn: ConnHandle, params: ConnParams) -> Result<(), StackError>;

    fn start_rssi(&mut self, conn: ConnHandle, period_ms: u32) -> Result<(), StackError>;
    fn cancel_rssi(&mut self, conn: ConnHandle) -> Result<(), StackError>;

    fn discover_primary_service(&mut self, conn: ConnHandle, uuid: Uuid) -> Result<(), StackError>;
    fn discover_all_primary_services(&mut self, conn: ConnHandle) -> Result<(), StackError>;
    fn read_using_char_uuid(
        &mut self,
        conn: ConnHandle,
        range: HandleRange,
        uuid: Uuid,
    ) -> Result<(), StackError>;

    fn read_char_value(&mut self, conn: ConnHandle, handle: u16) -> Result<(), StackError>;
    fn write_char_value(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        value: &[u8],
    ) -> Result<(), StackError>;

    /// Arm `timer`, replacing a pending one with the same id.
    fn schedule_timer(&mut self, timer: TimerId, delay_ms: u32) -> Result<(), StackError>;
    fn cancel_timer(&mut self, timer: TimerId) -> Result<(), StackError>;
}

/// One [`BleStack`] call, as a message.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackRequest {
    StartScan(ScanParams),
    CancelScan,
    EstablishLink {
        params: LinkParams,
        peer: PeerDevice,
    },
    TerminateLink(Option<ConnHandle>),
    UpdateLink {
        conn: ConnHandle,
        params: ConnParams,
    },
    StartRssi {
        conn: ConnHandle,
        period_ms: u32,
    },
    CancelRssi(ConnHandle),
    DiscoverPrimaryService {
        conn: ConnHandle,
        uuid: Uuid,
    },
    DiscoverAllPrimaryServices(ConnHandle),
    ReadUsingCharUuid {
        conn: ConnHandle,
        range: HandleRange,
        uuid: Uuid,
    },
    Read {
        conn: ConnHandle,
        handle: u16,
    },
    Write {
        conn: ConnHandle,
        handle: u16,
        value: WriteValue,
    },
    ScheduleTimer {
        timer: TimerId,
        delay_ms: u32,
    },
    CancelTimer(TimerId),
}

/// [`BleStack`] that queues each call as a [`StackRequest`].
///
/// A full queue is reported as [`StackError::NoResources`].
pub struct QueuedStack<'a, M: RawMutex, const N: usize> {
    tx: Sender<'a, M, StackRequest, N>,
}

impl<'a, M: RawMutex, const N: usize> QueuedStack<'a, M, N> {
    pub fn new(tx: Sender<'a, M, StackRequest, N>) -> Self {
        Self { tx }
    }

    fn push(&mut self, request: StackRequest) -> Result<(), StackError> {
        self.tx.try_send(request).map_err(|_| {
            warn!("stack request queue full");
            StackError::NoResources
        })
    }
}

impl<M: RawMutex, const N: usize> BleStack for QueuedStack<'_, M, N> {
    fn start_scan(&mut self, params: ScanParams) -> Result<(), StackError> {
        self.push(StackRequest::StartScan(params))
    }

    fn cancel_scan(&mut self) -> Result<(), StackError> {
        self.push(StackRequest::CancelScan)
    }

    fn establish_link(&mut self, params: LinkParams, peer: PeerDevice) -> Result<(), StackError> {
        self.push(StackRequest::EstablishLink { params, peer })
    }

    fn terminate_link(&mut self, conn: Option<ConnHandle>) -> Result<(), StackError> {
        self.push(StackRequest::TerminateLink(conn))
    }

    fn update_link(&mut self, conn: ConnHandle, params: ConnParams) -> Result<(), StackError> {
        self.push(StackRequest::UpdateLink { conn, params })
    }

    fn start_rssi(&mut self, conn: ConnHandle, period_ms: u32) -> Result<(), StackError> {
        self.push(StackRequest::StartRssi { conn, period_ms })
    }

    fn cancel_rssi(&mut self, conn: ConnHandle) -> Result<(), StackError> {
        self.push(StackRequest::CancelRssi(conn))
    }

    fn discover_primary_service(&mut self, conn: ConnHandle, uuid: Uuid) -> Result<(), StackError> {
        self.push(StackRequest::DiscoverPrimaryService { conn, uuid })
    }

    fn discover_all_primary_services(&mut self, conn: ConnHandle) -> Result<(), StackError> {
        self.push(StackRequest::DiscoverAllPrimaryServices(conn))
    }

    fn read_using_char_uuid(
        &mut self,
        conn: ConnHandle,
        range: HandleRange,
        uuid: Uuid,
    ) -> Result<(), StackError> {
        self.push(StackRequest::ReadUsingCharUuid { conn, range, uuid })
    }

    fn read_char_value(&mut self, conn: ConnHandle, handle: u16) -> Result<(), StackError> {
        self.push(StackRequest::Read { conn, handle })
    }

    fn write_char_value(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        value: &[u8],
    ) -> Result<(), StackError> {
        let value = WriteValue::from_slice(value).map_err(|_| StackError::NoResources)?;
        self.push(StackRequest::Write {
            conn,
            handle,
            value,
        })
    }

    fn schedule_timer(&mut self, timer: TimerId, delay_ms: u32) -> Result<(), StackError> {
        self.push(StackRequest::ScheduleTimer { timer, delay_ms })
    }

    fn cancel_timer(&mut self, timer: TimerId) -> Result<(), StackError> {
        self.push(StackRequest::CancelTimer(timer))
    }
}
