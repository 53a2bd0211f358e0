//! Text command parser.
//!
//! Recognised commands, matched by literal prefix:
//!
//! | Input                                 | Command              |
//! |---------------------------------------|----------------------|
//! | `scan device`                         | [`Command::Scan`]    |
//! | `connect Mac 5F:15:00:01:35:EF`       | [`Command::Connect`] |
//! | `disconnect`                          | [`Command::Disconnect`] |
//! | `WriteHandle: 15 Value: 00 07 02`     | [`Command::Write`]   |
//!
//! Text accumulates in a bounded buffer until a command is complete.  The
//! value list of `WriteHandle` ends at a line terminator, or when the
//! receive line goes idle ([`CommandParser::expire`]).

use heapless::Vec;

use crate::ble::types::{Address, AddressType, PeerDevice, WriteValue};
use crate::config::CMD_BUFFER_LEN;
use crate::serial::Command;

const SCAN: &[u8] = b"scan device";
const CONNECT: &[u8] = b"connect Mac ";
const DISCONNECT: &[u8] = b"disconnect";
const WRITE: &[u8] = b"WriteHandle: ";
const VALUE: &[u8] = b"Value:";

/// `XX:XX:XX:XX:XX:XX`
const MAC_TEXT_LEN: usize = 17;

const PREFIXES: [&[u8]; 4] = [SCAN, CONNECT, DISCONNECT, WRITE];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Input that no command starts with, or that overflowed the buffer.
    UnrecognizedCommand,
    InvalidAddress,
    InvalidHandle,
    InvalidValue,
    /// More value bytes than a single write carries.
    ValueTooLong,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ParseError::UnrecognizedCommand => "unrecognized command",
            ParseError::InvalidAddress => "invalid address",
            ParseError::InvalidHandle => "invalid handle",
            ParseError::InvalidValue => "invalid value",
            ParseError::ValueTooLong => "value too long",
        })
    }
}

fn is_terminator(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t' || is_terminator(b)
}

fn hex_u8(text: &[u8]) -> Option<u8> {
    if text.is_empty() || text.len() > 2 {
        return None;
    }
    u8::from_str_radix(core::str::from_utf8(text).ok()?, 16).ok()
}

fn hex_u16(text: &[u8]) -> Option<u16> {
    if text.is_empty() || text.len() > 4 {
        return None;
    }
    u16::from_str_radix(core::str::from_utf8(text).ok()?, 16).ok()
}

/// What one attempt to parse the buffer head produced.
enum Step {
    /// Need more input.
    Incomplete,
    /// Drop `consumed` bytes and report the result.
    Done {
        consumed: usize,
        result: Result<Command, ParseError>,
    },
}

pub struct CommandParser {
    buf: Vec<u8, CMD_BUFFER_LEN>,
    /// Skipping the rest of an overflowed line.
    discarding: bool,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Whether a partial command is waiting for more input.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// The receive line went idle: complete a pending `WriteHandle` that
    /// already carries values, then drop whatever is left.  Returns `true`
    /// if partial input was discarded.
    pub fn expire(&mut self, mut on_command: impl FnMut(Result<Command, ParseError>)) -> bool {
        if !self.discarding {
            self.drain(true, &mut on_command);
        }
        let had = self.has_pending();
        self.buf.clear();
        self.discarding = false;
        had
    }

    /// Append received text and report every command it completes, in order.
    pub fn feed(&mut self, text: &[u8], mut on_command: impl FnMut(Result<Command, ParseError>)) {
        for &b in text {
            if self.discarding {
                if is_terminator(b) {
                    self.discarding = false;
                }
                continue;
            }
            if self.buf.push(b).is_err() {
                // Salvage complete commands before giving up on the line.
                self.drain(false, &mut on_command);
                if self.buf.push(b).is_err() {
                    warn!("command buffer overflow, {} bytes dropped", self.buf.len());
                    self.buf.clear();
                    self.discarding = !is_terminator(b);
                    on_command(Err(ParseError::UnrecognizedCommand));
                }
            }
        }
        self.drain(false, &mut on_command);
    }

    /// Report the commands at the head of the buffer.  `idle` means no more
    /// input is coming for the current line.
    fn drain(&mut self, idle: bool, on_command: &mut impl FnMut(Result<Command, ParseError>)) {
        loop {
            let blanks = self.buf.iter().take_while(|&&b| is_blank(b)).count();
            self.consume(blanks);
            if self.buf.is_empty() {
                return;
            }
            match self.step(idle) {
                Step::Incomplete => return,
                Step::Done { consumed, result } => {
                    self.consume(consumed);
                    on_command(result);
                }
            }
        }
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        if n == 0 {
            return;
        }
        let rest_len = self.buf.len() - n;
        self.buf.copy_within(n.., 0);
        self.buf.truncate(rest_len);
    }

    fn step(&self, idle: bool) -> Step {
        let input = self.buf.as_slice();

        if input.starts_with(SCAN) {
            return Step::Done {
                consumed: SCAN.len(),
                result: Ok(Command::Scan),
            };
        }
        if input.starts_with(DISCONNECT) {
            return Step::Done {
                consumed: DISCONNECT.len(),
                result: Ok(Command::Disconnect),
            };
        }
        if let Some(args) = input.strip_prefix(CONNECT) {
            return Self::connect(args);
        }
        if let Some(args) = input.strip_prefix(WRITE) {
            return Self::write(args, idle);
        }

        if PREFIXES.iter().any(|p| p.starts_with(input)) {
            return Step::Incomplete;
        }

        // Unknown: drop through the end of the line.
        let consumed = match input.iter().position(|&b| is_terminator(b)) {
            Some(pos) => pos + 1,
            None => input.len(),
        };
        Step::Done {
            consumed,
            result: Err(ParseError::UnrecognizedCommand),
        }
    }

    fn connect(args: &[u8]) -> Step {
        let line_end = args.iter().position(|&b| is_terminator(b));
        if args.len() < MAC_TEXT_LEN && line_end.is_none() {
            return Step::Incomplete;
        }
        let end = line_end.unwrap_or(args.len()).min(MAC_TEXT_LEN);
        let consumed = CONNECT.len() + end;
        let text = &args[..end];
        let result = Self::parse_mac(text)
            .map(|bytes| {
                Command::Connect(PeerDevice::new(
                    Address::from_be_bytes(bytes),
                    AddressType::Public,
                ))
            })
            .ok_or(ParseError::InvalidAddress);
        Step::Done { consumed, result }
    }

    fn parse_mac(text: &[u8]) -> Option<[u8; 6]> {
        if text.len() != MAC_TEXT_LEN {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let at = i * 3;
            if i > 0 && text[at - 1] != b':' {
                return None;
            }
            *byte = hex_u8(&text[at..at + 2])?;
        }
        Some(bytes)
    }

    fn write(args: &[u8], idle: bool) -> Step {
        let line_end = args.iter().position(|&b| is_terminator(b));
        let line = &args[..line_end.unwrap_or(args.len())];
        let consumed = WRITE.len() + line_end.map_or(args.len(), |pos| pos + 1);

        let mut tokens = line.split(|&b| b == b' ' || b == b'\t').filter(|t| !t.is_empty());
        let handle = tokens.next();
        let keyword = tokens.next();

        if line_end.is_none() {
            // More values may follow until the line ends or goes idle.
            let has_values = keyword == Some(VALUE) && tokens.clone().next().is_some();
            if !idle || !has_values {
                return Step::Incomplete;
            }
        }

        let result = Self::parse_write(handle, keyword, tokens);
        Step::Done { consumed, result }
    }

    fn parse_write<'a>(
        handle: Option<&'a [u8]>,
        keyword: Option<&'a [u8]>,
        values: impl Iterator<Item = &'a [u8]>,
    ) -> Result<Command, ParseError> {
        let handle = handle.and_then(hex_u16).ok_or(ParseError::InvalidHandle)?;
        if keyword != Some(VALUE) {
            return Err(ParseError::InvalidValue);
        }
        let mut value = WriteValue::new();
        for token in values {
            let byte = hex_u8(token).ok_or(ParseError::InvalidValue)?;
            value.push(byte).map_err(|_| ParseError::ValueTooLong)?;
        }
        if value.is_empty() {
            return Err(ParseError::InvalidValue);
        }
        Ok(Command::Write { handle, value })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
