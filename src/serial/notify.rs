//! Relay of inbound notifications and indications to the host.

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::ble::types::HexBytes;
use crate::config::{NotifyFormat, LINE_LEN, MAX_ATT_VALUE};
use crate::serial::frame;
use crate::serial::report::HostSink;

pub struct NotificationSink {
    format: NotifyFormat,
}

impl NotificationSink {
    pub const fn new(format: NotifyFormat) -> Self {
        Self { format }
    }

    /// Forward one attribute value pushed by the peer.
    pub fn deliver(&self, out: &mut impl HostSink, handle: u16, value: &[u8]) {
        match self.format {
            NotifyFormat::Text => {
                let mut line: String<LINE_LEN> = String::new();
                let _ = write!(line, "handle {:04X} {}", handle, HexBytes(value));
                out.write(line.as_bytes());
                out.write(b"\r\n");
            }
            NotifyFormat::Raw => out.write(value),
            NotifyFormat::Framed => {
                let mut payload: Vec<u8, { MAX_ATT_VALUE + 2 }> = Vec::new();
                let _ = payload.extend_from_slice(&handle.to_le_bytes());
                if payload.extend_from_slice(value).is_err() {
                    warn!("notification of {} bytes truncated", value.len());
                }
                match frame::encode(frame::TYPE_NOTIFICATION, &payload) {
                    Ok(bytes) => out.write(&bytes),
                    Err(e) => warn!("notification not framed: {:?}", e),
                }
            }
        }
    }
}
