//! Plain BLE value types shared by every layer.

use core::fmt;

use heapless::Vec;

use crate::config::{MAX_AD_DATA, MAX_ATT_VALUE, MAX_WRITE_VALUE};

/// Attribute value as carried in reads and notifications.
pub type AttValue = Vec<u8, MAX_ATT_VALUE>;

/// Value accepted by a characteristic write.
pub type WriteValue = Vec<u8, MAX_WRITE_VALUE>;

/// Raw advertising data.
pub type AdData = Vec<u8, MAX_AD_DATA>;

/// Connection handle assigned by the link layer.
pub type ConnHandle = u16;

/// 48-bit device address, stored little-endian (least significant byte
/// first) as it travels over the air.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from the textual (most significant byte first) order.
    pub fn from_be_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

/// Prints as `0x` followed by the address most significant byte first.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in self.0.iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => AddressType::Public,
            _ => AddressType::Random,
        }
    }
}

/// A peripheral seen during scanning.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerDevice {
    pub address: Address,
    pub address_type: AddressType,
}

impl PeerDevice {
    pub const fn new(address: Address, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }
}

/// Devices are identified by address alone.
impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerDevice {}

/// Service or characteristic UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Uuid {
    Uuid16(u16),
    /// Little-endian, as on the wire.
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Wire (little-endian) representation.
    pub fn to_le_bytes(&self) -> Vec<u8, 16> {
        let mut out = Vec::new();
        match self {
            Uuid::Uuid16(v) => {
                let _ = out.extend_from_slice(&v.to_le_bytes());
            }
            Uuid::Uuid128(b) => {
                let _ = out.extend_from_slice(b);
            }
        }
        out
    }

    /// Parse the little-endian wire form (2 or 16 bytes).
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Uuid::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(bytes);
                Some(Uuid::Uuid128(b))
            }
            _ => None,
        }
    }
}

/// Attribute handle range of a discovered service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

impl HandleRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Zero start handle means "not yet discovered".
    pub const fn is_known(&self) -> bool {
        self.start != 0
    }
}

/// ATT request opcodes the central issues, as reported back in error
/// responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttOpcode {
    FindByTypeValueReq,
    ReadByTypeReq,
    ReadReq,
    ReadByGroupTypeReq,
    WriteReq,
    Other(u8),
}

impl From<u8> for AttOpcode {
    fn from(raw: u8) -> Self {
        match raw {
            0x06 => AttOpcode::FindByTypeValueReq,
            0x08 => AttOpcode::ReadByTypeReq,
            0x0A => AttOpcode::ReadReq,
            0x10 => AttOpcode::ReadByGroupTypeReq,
            0x12 => AttOpcode::WriteReq,
            other => AttOpcode::Other(other),
        }
    }
}

impl AttOpcode {
    /// Whether the request belongs to service/characteristic discovery.
    pub const fn is_discovery(&self) -> bool {
        matches!(
            self,
            AttOpcode::FindByTypeValueReq
                | AttOpcode::ReadByTypeReq
                | AttOpcode::ReadByGroupTypeReq
        )
    }
}

/// Space-separated upper-case hex dump, e.g. `00 07 02`.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
