//! Binary host frames.
//!
//! ```text
//! 0xF0 | TYPE | LEN | DATA[0..LEN] (byte-stuffed)
//! ```
//!
//! `DATA[LEN-1]` is the checksum, the 8-bit sum of `LEN`, `TYPE` and the
//! payload bytes.  Inside DATA the bytes `0xF0`, `0xF5` and `0xFA` are sent
//! as `0xF5 0x01`, `0xF5 0x02` and `0xF5 0x03`.  A header byte restarts
//! the decoder from any state.

use heapless::Vec;

/// Start of frame.
pub const HEADER: u8 = 0xF0;
/// Stuffing escape.
pub const ESCAPE: u8 = 0xF5;
/// Reserved byte, always escaped on encode.
pub const RESERVED: u8 = 0xFA;

/// Largest payload; keeps `LEN` below [`HEADER`].
pub const MAX_PAYLOAD: usize = 238;

/// Worst-case encoded size: header, type, length, and every data byte escaped.
pub const MAX_ENCODED: usize = 3 + 2 * (MAX_PAYLOAD + 1);

/// Host → device: start a scan.
pub const TYPE_SCAN: u8 = 0x01;
/// Host → device: connect; 6 address bytes most significant first, then
/// an optional address type byte.
pub const TYPE_CONNECT: u8 = 0x02;
/// Host → device: disconnect.
pub const TYPE_DISCONNECT: u8 = 0x03;
/// Host → device: write; little-endian handle followed by the value.
pub const TYPE_WRITE: u8 = 0x04;
/// Device → host: relayed notification; little-endian handle then value.
pub const TYPE_NOTIFICATION: u8 = 0x81;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// `LEN` was zero, so there is no room for the checksum.
    Empty,
    /// `LEN` exceeds the largest frame accepted.
    TooLong(u8),
    /// `0xF5` followed by something other than 1, 2 or 3.
    BadEscape(u8),
    Checksum { expected: u8, received: u8 },
    /// A header arrived before the previous frame was complete.
    Interrupted,
    /// `0xF0` cannot be used as a frame type.
    InvalidType,
    /// Well-formed frame of a type we do not handle.
    UnknownType(u8),
    /// Payload has the wrong shape for its type.
    BadPayload(u8),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::Empty => f.write_str("empty frame"),
            FrameError::TooLong(len) => write!(f, "frame length {} too long", len),
            FrameError::BadEscape(b) => write!(f, "bad escape 0x{:02X}", b),
            FrameError::Checksum { expected, received } => write!(
                f,
                "checksum mismatch (expected 0x{:02X}, got 0x{:02X})",
                expected, received
            ),
            FrameError::Interrupted => f.write_str("frame interrupted"),
            FrameError::InvalidType => f.write_str("invalid frame type"),
            FrameError::UnknownType(t) => write!(f, "unknown frame type 0x{:02X}", t),
            FrameError::BadPayload(t) => write!(f, "bad payload for frame type 0x{:02X}", t),
        }
    }
}

/// A decoded frame, checksum stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

fn checksum(len: u8, frame_type: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(len.wrapping_add(frame_type), |acc, b| acc.wrapping_add(*b))
}

fn push_stuffed<const N: usize>(out: &mut Vec<u8, N>, byte: u8) -> Result<(), u8> {
    match byte {
        HEADER => out.extend_from_slice(&[ESCAPE, 0x01]).map_err(|_| byte),
        ESCAPE => out.extend_from_slice(&[ESCAPE, 0x02]).map_err(|_| byte),
        RESERVED => out.extend_from_slice(&[ESCAPE, 0x03]).map_err(|_| byte),
        b => out.push(b),
    }
}

/// Encode one frame.
pub fn encode(frame_type: u8, payload: &[u8]) -> Result<Vec<u8, MAX_ENCODED>, FrameError> {
    if frame_type == HEADER {
        return Err(FrameError::InvalidType);
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLong(u8::MAX));
    }
    let len = (payload.len() + 1) as u8;

    let mut out = Vec::new();
    // Capacity covers the worst case, so none of the pushes can fail.
    let _ = out.extend_from_slice(&[HEADER, frame_type, len]);
    for &b in payload {
        let _ = push_stuffed(&mut out, b);
    }
    let _ = push_stuffed(&mut out, checksum(len, frame_type, payload));
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    SeekHeader,
    SeekType,
    SeekLength { frame_type: u8 },
    Data { frame_type: u8, len: u8, escaped: bool },
}

/// Byte-at-a-time frame decoder.
pub struct FrameDecoder {
    state: DecodeState,
    data: Vec<u8, { MAX_PAYLOAD + 1 }>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecodeState::SeekHeader,
            data: Vec::new(),
        }
    }

    /// `true` between frames.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::SeekHeader
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::SeekHeader;
        self.data.clear();
    }

    /// Feed one byte.
    ///
    /// Returns a frame when its last byte arrives and the checksum holds.
    /// Errors mean a frame was dropped; the decoder is ready for the next.
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        if byte == HEADER {
            let interrupted = !self.is_idle();
            self.data.clear();
            self.state = DecodeState::SeekType;
            return if interrupted {
                Err(FrameError::Interrupted)
            } else {
                Ok(None)
            };
        }

        match self.state {
            DecodeState::SeekHeader => Ok(None),
            DecodeState::SeekType => {
                self.state = DecodeState::SeekLength { frame_type: byte };
                Ok(None)
            }
            DecodeState::SeekLength { frame_type } => {
                if byte == 0 {
                    self.reset();
                    return Err(FrameError::Empty);
                }
                if byte as usize > MAX_PAYLOAD + 1 {
                    self.reset();
                    return Err(FrameError::TooLong(byte));
                }
                self.state = DecodeState::Data {
                    frame_type,
                    len: byte,
                    escaped: false,
                };
                Ok(None)
            }
            DecodeState::Data {
                frame_type,
                len,
                escaped,
            } => {
                let value = if escaped {
                    match byte {
                        0x01 => HEADER,
                        0x02 => ESCAPE,
                        0x03 => RESERVED,
                        other => {
                            self.reset();
                            return Err(FrameError::BadEscape(other));
                        }
                    }
                } else if byte == ESCAPE {
                    self.state = DecodeState::Data {
                        frame_type,
                        len,
                        escaped: true,
                    };
                    return Ok(None);
                } else {
                    byte
                };

                // LEN is bounded by the buffer capacity.
                let _ = self.data.push(value);
                self.state = DecodeState::Data {
                    frame_type,
                    len,
                    escaped: false,
                };
                if self.data.len() < len as usize {
                    return Ok(None);
                }
                self.finish(frame_type, len)
            }
        }
    }

    fn finish(&mut self, frame_type: u8, len: u8) -> Result<Option<Frame>, FrameError> {
        let result = match self.data.split_last() {
            Some((&received, payload)) => {
                let expected = checksum(len, frame_type, payload);
                if expected == received {
                    Ok(Some(Frame {
                        frame_type,
                        // Payload is one shorter than the data buffer.
                        payload: Vec::from_slice(payload).unwrap_or_default(),
                    }))
                } else {
                    Err(FrameError::Checksum { expected, received })
                }
            }
            None => Err(FrameError::Empty),
        };
        self.reset();
        result
    }
}
