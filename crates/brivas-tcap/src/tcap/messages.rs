//! ANSI TCAP (T1.114) message envelopes

use super::asn1::TlvReader;
use crate::types::TransactionId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Package type identifiers (envelope tags)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PackageType {
    Uni = 0xE1,
    QueryWithPerm = 0xE2,
    QueryWithoutPerm = 0xE3,
    Response = 0xE4,
    ConversationWithPerm = 0xE5,
    ConversationWithoutPerm = 0xE6,
    Abort = 0xF6,
}

impl PackageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0xE1 => Some(Self::Uni),
            0xE2 => Some(Self::QueryWithPerm),
            0xE3 => Some(Self::QueryWithoutPerm),
            0xE4 => Some(Self::Response),
            0xE5 => Some(Self::ConversationWithPerm),
            0xE6 => Some(Self::ConversationWithoutPerm),
            0xF6 => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Short label used in logs and metrics
    pub fn label(self) -> &'static str {
        match self {
            Self::Uni => "uni",
            Self::QueryWithPerm | Self::QueryWithoutPerm => "query",
            Self::Response => "response",
            Self::ConversationWithPerm | Self::ConversationWithoutPerm => "conversation",
            Self::Abort => "abort",
        }
    }
}

/// Element tags inside a package
pub mod tag {
    pub const TRANSACTION_ID: u8 = 0xC7;
    pub const DIALOG_PORTION: u8 = 0xF9;
    pub const APPLICATION_CONTEXT_INTEGER: u8 = 0xDA;
    pub const APPLICATION_CONTEXT_OID: u8 = 0xDB;
    pub const COMPONENT_SEQUENCE: u8 = 0xE8;
    pub const P_ABORT_CAUSE: u8 = 0xD7;
    pub const USER_ABORT_INFORMATION: u8 = 0xD8;
    pub const INVOKE_LAST: u8 = 0xE9;
    pub const INVOKE_NOT_LAST: u8 = 0xED;
}

/// Provider abort causes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PAbortCause {
    UnrecognizedPackageType = 1,
    IncorrectTransactionPortion = 2,
    BadlyStructuredTransactionPortion = 3,
    UnassignedRespondingTransactionId = 4,
    PermissionToReleaseProblem = 5,
    ResourceUnavailable = 6,
    UnrecognizedDialoguePortionId = 7,
    BadlyStructuredDialoguePortion = 8,
    MissingDialoguePortion = 9,
    InconsistentDialoguePortion = 10,
}

impl PAbortCause {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::UnrecognizedPackageType,
            2 => Self::IncorrectTransactionPortion,
            3 => Self::BadlyStructuredTransactionPortion,
            4 => Self::UnassignedRespondingTransactionId,
            5 => Self::PermissionToReleaseProblem,
            6 => Self::ResourceUnavailable,
            7 => Self::UnrecognizedDialoguePortionId,
            8 => Self::BadlyStructuredDialoguePortion,
            9 => Self::MissingDialoguePortion,
            10 => Self::InconsistentDialoguePortion,
            _ => return None,
        })
    }
}

/// Application context carried in the dialog portion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationContext {
    Integer(u32),
    Oid(Vec<u32>),
}

/// Dialog portion (only the application context is interpreted)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogPortion {
    pub application_context: Option<ApplicationContext>,
}

/// Component sequence, kept opaque
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentPortion(pub Bytes);

impl ComponentPortion {
    /// Number of invoke components in the sequence
    pub fn invoke_count(&self) -> usize {
        let mut reader = TlvReader::new(&self.0);
        let mut count = 0;
        while let Some((tag, _)) = reader.read() {
            if tag == tag::INVOKE_LAST || tag == tag::INVOKE_NOT_LAST {
                count += 1;
            }
        }
        count
    }
}

/// Query (dialog-opening) package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub with_permission: bool,
    pub originating_transaction_id: TransactionId,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// Conversation (continuation) package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub with_permission: bool,
    pub originating_transaction_id: TransactionId,
    pub destination_transaction_id: TransactionId,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// Response (dialog-closing) package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub destination_transaction_id: TransactionId,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// Abort cause: provider-generated or user information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Provider(PAbortCause),
    User(Bytes),
}

/// Abort package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortMessage {
    pub destination_transaction_id: TransactionId,
    pub dialog_portion: Option<DialogPortion>,
    pub cause: AbortCause,
}

/// Unidirectional package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniMessage {
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// Result of a best-effort partial decode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnidentifiedMessage {
    pub tag: Option<u8>,
    pub originating_transaction_id: Option<TransactionId>,
    pub destination_transaction_id: Option<TransactionId>,
}

/// TCAP Message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcapMessage {
    Query(QueryMessage),
    Conversation(ConversationMessage),
    Response(ResponseMessage),
    Abort(AbortMessage),
    Uni(UniMessage),
}

impl TcapMessage {
    /// Package type of this message
    pub fn package_type(&self) -> PackageType {
        match self {
            Self::Query(m) if m.with_permission => PackageType::QueryWithPerm,
            Self::Query(_) => PackageType::QueryWithoutPerm,
            Self::Conversation(m) if m.with_permission => PackageType::ConversationWithPerm,
            Self::Conversation(_) => PackageType::ConversationWithoutPerm,
            Self::Response(_) => PackageType::Response,
            Self::Abort(_) => PackageType::Abort,
            Self::Uni(_) => PackageType::Uni,
        }
    }

    /// Provider abort addressed to a peer transaction
    pub fn provider_abort(destination: TransactionId, cause: PAbortCause) -> Self {
        Self::Abort(AbortMessage {
            destination_transaction_id: destination,
            dialog_portion: None,
            cause: AbortCause::Provider(cause),
        })
    }
}
