//! TCAP (Transaction Capabilities Application Part), ANSI T1.114
//!
//! Transaction layer only: dialogs, id allocation, inbound dispatch and
//! passive (preview) correlation. Component bodies stay opaque.

mod allocator;
mod asn1;
mod codec;
mod dialog;
mod listener;
mod messages;
mod preview;
mod provider;
mod registry;
mod timer;

pub use allocator::IdAllocator;
pub use codec::{BerCodec, MessageCodec};
pub use dialog::{Dialog, InvokeId, TransactionState};
pub use listener::{
    AbortIndication, ConversationIndication, DeliveryFailure, ListenerSet, NoticeIndication,
    QueryIndication, ResponseIndication, TcListener, UniIndication,
};
pub use messages::{
    tag, AbortCause, AbortMessage, ApplicationContext, ComponentPortion, ConversationMessage,
    DialogPortion, PAbortCause, PackageType, QueryMessage, ResponseMessage, TcapMessage,
    UniMessage, UnidentifiedMessage,
};
pub use preview::{
    PeerIdentity, PreviewDialogData, PreviewDialogDataKey, PreviewMatch, PreviewRegistry,
};
pub use provider::TcapProvider;
pub use registry::DialogRegistry;
pub use timer::{TimerHandle, TimerService};
