//! Host-facing serial link.
//!
//! The host talks to us either in text (see [`command`]) or in binary
//! frames (see [`frame`]); both end up as a [`Command`].  Output towards
//! the host goes through a [`HostSink`](report::HostSink): status lines
//! from [`report`] and relayed notifications from [`notify`].

pub mod command;
pub mod frame;
pub mod notify;
pub mod report;

use crate::ble::types::{Address, AddressType, PeerDevice, WriteValue};
use crate::error::Error;

use self::command::CommandParser;
use self::frame::{Frame, FrameDecoder, FrameError};

/// A request from the host.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Scan,
    Connect(PeerDevice),
    Disconnect,
    Write { handle: u16, value: WriteValue },
}

impl TryFrom<&Frame> for Command {
    type Error = FrameError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let payload = frame.payload.as_slice();
        match frame.frame_type {
            frame::TYPE_SCAN => Ok(Command::Scan),
            frame::TYPE_DISCONNECT => Ok(Command::Disconnect),
            frame::TYPE_CONNECT => {
                let (addr, addr_type) = match payload.len() {
                    6 => (payload, AddressType::Public),
                    7 => (&payload[..6], AddressType::from(payload[6])),
                    _ => return Err(FrameError::BadPayload(frame.frame_type)),
                };
                let mut bytes = [0u8; 6];
                bytes.copy_from_slice(addr);
                Ok(Command::Connect(PeerDevice::new(
                    Address::from_be_bytes(bytes),
                    addr_type,
                )))
            }
            frame::TYPE_WRITE => {
                if payload.len() < 3 {
                    return Err(FrameError::BadPayload(frame.frame_type));
                }
                let handle = u16::from_le_bytes([payload[0], payload[1]]);
                let value = WriteValue::from_slice(&payload[2..])
                    .map_err(|_| FrameError::BadPayload(frame.frame_type))?;
                Ok(Command::Write { handle, value })
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Splits raw host bytes between the frame decoder and the text parser.
///
/// A header byte, or any byte while a frame is being received, goes to
/// the decoder; everything else is text.
#[derive(Default)]
pub struct HostInput {
    frames: FrameDecoder,
    text: CommandParser,
}

impl HostInput {
    pub const fn new() -> Self {
        Self {
            frames: FrameDecoder::new(),
            text: CommandParser::new(),
        }
    }

    /// Process one received chunk, reporting commands and errors in
    /// arrival order.
    pub fn feed(&mut self, chunk: &[u8], mut on_input: impl FnMut(Result<Command, Error>)) {
        let mut text_start = None;
        for (i, &b) in chunk.iter().enumerate() {
            if self.frames.is_idle() && b != frame::HEADER {
                text_start.get_or_insert(i);
                continue;
            }
            if let Some(start) = text_start.take() {
                self.text
                    .feed(&chunk[start..i], |r| on_input(r.map_err(Error::from)));
            }
            match self.frames.push(b) {
                Ok(Some(frame)) => {
                    trace!("frame type {} len {}", frame.frame_type, frame.payload.len());
                    on_input(Command::try_from(&frame).map_err(Error::from));
                }
                Ok(None) => {}
                Err(e) => on_input(Err(e.into())),
            }
        }
        if let Some(start) = text_start {
            self.text
                .feed(&chunk[start..], |r| on_input(r.map_err(Error::from)));
        }
    }

    /// Whether part of a command or frame is still buffered.
    pub fn has_partial(&self) -> bool {
        self.text.has_pending() || !self.frames.is_idle()
    }

    /// The receive line went idle.  A pending write with values is still
    /// reported; any other partial command or frame is dropped.  Returns
    /// `true` if something was dropped.
    pub fn expire(&mut self, mut on_input: impl FnMut(Result<Command, Error>)) -> bool {
        let had_frame = !self.frames.is_idle();
        self.frames.reset();
        let had_text = self.text.expire(|r| on_input(r.map_err(Error::from)));
        had_text || had_frame
    }
}
