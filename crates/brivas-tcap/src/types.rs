//! Common types used across the TCAP provider

use serde::{Deserialize, Serialize};
use std::fmt;

/// Point Code (24-bit for ANSI, 14-bit for ITU)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointCode(pub u32);

impl PointCode {
    /// Create ANSI format point code (24-bit)
    pub fn ansi(network: u8, cluster: u8, member: u8) -> Self {
        let pc = ((network as u32) << 16)
            | ((cluster as u32) << 8)
            | (member as u32);
        Self(pc)
    }

    /// Get raw value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PointCode {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Transaction identifier, always 4 octets on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// Wire length of a single transaction id
    pub const LEN: usize = 4;

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Big-endian wire encoding
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decode from exactly four octets
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let octets: [u8; 4] = data.try_into().ok()?;
        Some(Self(u32::from_be_bytes(octets)))
    }
}

impl From<u32> for TransactionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SCCP sequence control (SLS) value used for load distribution
pub type SeqControl = u8;
