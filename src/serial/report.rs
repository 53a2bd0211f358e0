//! Status lines sent to the host.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::ble::types::{Address, HexBytes, Uuid};
use crate::config::LINE_LEN;
use crate::error::Error;

/// Byte sink towards the host (UART TX in firmware, a buffer in tests).
pub trait HostSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Collects output; bytes past capacity are dropped.
impl<const N: usize> HostSink for heapless::Vec<u8, N> {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.push(b).is_err() {
                break;
            }
        }
    }
}

impl<T: HostSink + ?Sized> HostSink for &mut T {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes)
    }
}

/// Everything the central tells the host, one line each.
#[derive(Debug)]
pub enum Report<'a> {
    BleCentral(Address),
    Scanning,
    ScanCancelled,
    DevicesFound(usize),
    Device(Address),
    Selected(usize, Address),
    Connecting,
    Connected(Address),
    ConnectFailed(u8),
    Disconnecting,
    Disconnected,
    ParamUpdate,
    Service(&'a Uuid),
    CharHandle(u16),
    ServiceNotFound,
    CharacteristicNotFound,
    ReadRsp(&'a [u8]),
    ReadError(u8),
    Writing,
    WriteOk,
    WriteError(u8),
    Rssi(i8),
    RssiCancelled,
    Error(Error),
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::BleCentral(addr) => write!(f, "BLE Central {}", addr),
            Report::Scanning => f.write_str("scanning..."),
            Report::ScanCancelled => f.write_str("scan cancelled"),
            Report::DevicesFound(n) => write!(f, "Devices Found {}", n),
            Report::Device(addr) => write!(f, "Device {}", addr),
            Report::Selected(i, addr) => write!(f, "Selected {} {}", i, addr),
            Report::Connecting => f.write_str("Connecting..."),
            Report::Connected(addr) => write!(f, "connected device {}", addr),
            Report::ConnectFailed(reason) => write!(f, "Connect Failed {}", reason),
            Report::Disconnecting => f.write_str("Disconnecting"),
            Report::Disconnected => f.write_str("disconnected"),
            Report::ParamUpdate => f.write_str("Param Update"),
            Report::Service(uuid) => write!(f, "svc: {}", HexBytes(&uuid.to_le_bytes())),
            Report::CharHandle(h) => write!(f, "char handle {:04X}", h),
            Report::ServiceNotFound => f.write_str("service not found"),
            Report::CharacteristicNotFound => f.write_str("characteristic not found"),
            Report::ReadRsp(value) => write!(f, "Read rsp: {}", HexBytes(value)),
            Report::ReadError(code) => write!(f, "Read Error {}", code),
            Report::Writing => f.write_str("writing..."),
            Report::WriteOk => f.write_str("write ok"),
            Report::WriteError(code) => write!(f, "Write Error {}", code),
            Report::Rssi(rssi) => write!(f, "RSSI -dB: {}", -i16::from(*rssi)),
            Report::RssiCancelled => f.write_str("RSSI Cancelled"),
            Report::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Format `report` and send it as one CRLF-terminated line.
pub fn emit(out: &mut impl HostSink, report: &Report<'_>) {
    let mut line: String<LINE_LEN> = String::new();
    if write!(line, "{}", report).is_err() {
        warn!("status line truncated");
    }
    out.write(line.as_bytes());
    out.write(b"\r\n");
}
