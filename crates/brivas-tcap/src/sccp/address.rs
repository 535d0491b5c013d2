//! SCCP Addressing

use crate::types::PointCode;
use serde::{Deserialize, Serialize};

/// SCCP Address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SccpAddress {
    /// Global Title (optional)
    pub global_title: Option<GlobalTitle>,
    /// Point Code (optional)
    pub point_code: Option<PointCode>,
    /// Subsystem Number (optional)
    pub subsystem_number: Option<u8>,
}

/// Global Title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalTitle {
    /// GTI = 0001: Translation Type + Numbering Plan + Encoding (ANSI)
    Gt0001 {
        translation_type: u8,
        numbering_plan: u8,
        encoding_scheme: u8,
        digits: String,
    },
    /// GTI = 0010: Translation Type only
    Gt0010 {
        translation_type: u8,
        digits: String,
    },
}

impl GlobalTitle {
    /// Create E.164 Global Title
    pub fn e164(digits: &str) -> Self {
        Self::Gt0001 {
            translation_type: 0,
            numbering_plan: 1, // E.164
            encoding_scheme: if digits.len() % 2 == 0 { 2 } else { 1 }, // BCD
            digits: digits.to_string(),
        }
    }

    /// Get GTI value
    pub fn gti(&self) -> u8 {
        match self {
            Self::Gt0001 { .. } => 1,
            Self::Gt0010 { .. } => 2,
        }
    }

    /// Get digits
    pub fn digits(&self) -> &str {
        match self {
            Self::Gt0001 { digits, .. } | Self::Gt0010 { digits, .. } => digits,
        }
    }
}

impl SccpAddress {
    /// Create address with SSN and PC
    pub fn from_ssn_pc(ssn: u8, pc: u32) -> Self {
        Self {
            global_title: None,
            point_code: Some(PointCode(pc)),
            subsystem_number: Some(ssn),
        }
    }

    /// Create address with Global Title
    pub fn from_gt(gt: GlobalTitle, ssn: Option<u8>) -> Self {
        Self {
            global_title: Some(gt),
            point_code: None,
            subsystem_number: ssn,
        }
    }

    /// Global title digits, when the address is GT-routed
    pub fn gt_digits(&self) -> Option<&str> {
        self.global_title.as_ref().map(|gt| gt.digits())
    }

    /// Subsystem number, 0 when absent
    pub fn ssn(&self) -> u8 {
        self.subsystem_number.unwrap_or(0)
    }
}
