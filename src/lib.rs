#![no_std]
#![warn(missing_docs)]
//! # BLE Security Manager
//!
//! Pairing, bonding and key-distribution engine for a Bluetooth Low Energy
//! host ([Vol 3] Part H). The engine is sans-IO: the host feeds it Security
//! Manager PDUs, HCI encryption events and user replies, and polls it for
//! outgoing work. All four pairing flows are implemented for both roles:
//! legacy pairing, LE Secure Connections Just-Works/Numeric-Comparison,
//! Passkey-Entry and Out-Of-Band.

use bt_hci::param::{AddrKind, BdAddr};

mod fmt;

mod codec;
pub mod crypto;
mod manager;
mod oob;
mod packet_pool;
mod pairing;
mod pdu;
mod types;

pub use crypto::{IdentityResolvingKey, LongTermKey, SigningKey};
pub use manager::{BondInformation, SecurityEvent, SecurityEventData, SecurityManager, SecurityOps};
pub use oob::ScOobData;
pub use packet_pool::{Packet, PacketPool};
pub use pdu::Pdu;
pub use types::{PassKey, Reason, SecurityLevel};

/// Commonly used types.
pub mod prelude {
    pub use bt_hci::param::{AddrKind, BdAddr, ConnHandle, LeConnRole};

    pub use crate::crypto::{IdentityResolvingKey, LongTermKey, SigningKey};
    pub use crate::manager::{BondInformation, SecurityEvent, SecurityEventData, SecurityManager, SecurityOps};
    pub use crate::oob::ScOobData;
    pub use crate::packet_pool::{Packet, PacketPool};
    pub use crate::pdu::Pdu;
    pub use crate::types::{PassKey, Reason, SecurityLevel};
    pub use crate::{Address, Error, Identity, IoCapabilities};
}

/// Errors returned by the security manager.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Security manager protocol failure, carries the wire reason code.
    Security(Reason),
    /// No response within the pairing timeout window.
    Timeout,
    /// Input arrived in a state that does not expect it.
    InvalidState,
    /// A value was malformed or out of range.
    InvalidValue,
    /// Allocation or queue capacity exhausted.
    OutOfMemory,
    /// The requested item does not exist.
    NotFound,
}

/// A BLE address with its kind (public or random).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    /// Address kind.
    pub kind: AddrKind,
    /// Address value, LSB first as on the wire.
    pub addr: BdAddr,
}

impl Address {
    /// Create a public address.
    pub fn public(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(val),
        }
    }

    /// Create a random (static or private) address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }

    /// Address as the 56-bit value used by the f5/f6 key derivation
    /// functions: kind octet followed by the address, MSB first.
    pub(crate) fn to_bytes(self) -> [u8; 7] {
        let mut bytes = [0u8; 7];
        bytes[0] = if self.kind == AddrKind::PUBLIC { 0 } else { 1 };
        let raw = self.addr.raw();
        for (dst, src) in bytes[1..].iter_mut().zip(raw.iter().rev()) {
            *dst = *src;
        }
        bytes
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}:{:?}", self.kind, self.addr)
    }
}

/// Identity of a peer: the identity address plus the identity resolving key
/// distributed during bonding, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// Identity address (public or static random).
    pub bd_addr: BdAddr,
    /// Identity resolving key, if distributed.
    pub irk: Option<IdentityResolvingKey>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            bd_addr: BdAddr::new([0; 6]),
            irk: None,
        }
    }
}

impl Identity {
    /// Whether `other` refers to the same device, either by address or by
    /// sharing the same IRK.
    pub fn match_identity(&self, other: &Identity) -> bool {
        if self.bd_addr == other.bd_addr {
            return true;
        }
        matches!((self.irk, other.irk), (Some(a), Some(b)) if a == b)
    }

    /// Whether `addr` is a resolvable private address generated from this
    /// identity's IRK.
    pub fn resolve(&self, addr: &BdAddr) -> bool {
        self.irk.map(|irk| irk.resolve_address(addr)).unwrap_or(false)
    }
}

/// Input/output capabilities of a device
// ([Vol 3] Part H, Section 2.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum IoCapabilities {
    /// Display only
    DisplayOnly = 0,
    /// Display and yes/no input
    DisplayYesNo = 1,
    /// Keyboard only
    KeyboardOnly = 2,
    /// No input, no output
    NoInputNoOutput = 3,
    /// Keyboard and display
    KeyboardDisplay = 4,
}

impl TryFrom<u8> for IoCapabilities {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::DisplayOnly,
            1 => Self::DisplayYesNo,
            2 => Self::KeyboardOnly,
            3 => Self::NoInputNoOutput,
            4 => Self::KeyboardDisplay,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<IoCapabilities> for u8 {
    fn from(value: IoCapabilities) -> u8 {
        value as u8
    }
}

impl core::fmt::Display for IoCapabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            IoCapabilities::DisplayOnly => "Display Only",
            IoCapabilities::DisplayYesNo => "Display Yes/No",
            IoCapabilities::KeyboardOnly => "Keyboard Only",
            IoCapabilities::NoInputNoOutput => "No Input No Output",
            IoCapabilities::KeyboardDisplay => "Keyboard Display",
        };
        write!(f, "{}", s)
    }
}
