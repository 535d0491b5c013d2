//! SCCP (Signaling Connection Control Part) service boundary
//!
//! The TCAP provider only needs connectionless (class 0/1) data transfer:
//! a transport that carries opaque payloads between a calling/called
//! address pair, plus returned-message notices.

mod address;

pub use address::{GlobalTitle, SccpAddress};

use crate::errors::SccpError;
use crate::types::{PointCode, SeqControl};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Inbound or outbound unitdata (UDT/XUDT) payload
#[derive(Debug, Clone)]
pub struct SccpDataMessage {
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub data: Bytes,
    /// Sequence control / SLS used for load distribution
    pub sls: SeqControl,
    pub return_on_error: bool,
    /// MTP3 OPC the message arrived with
    pub incoming_opc: PointCode,
    /// MTP3 DPC the message arrived with
    pub incoming_dpc: PointCode,
}

/// Returned message (UDTS/XUDTS) reported by SCCP
#[derive(Debug, Clone)]
pub struct SccpNoticeMessage {
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub data: Bytes,
    pub return_cause: u8,
}

/// Callbacks SCCP invokes on a registered subsystem user
#[async_trait]
pub trait SccpListener: Send + Sync {
    async fn on_message(&self, message: SccpDataMessage);

    async fn on_notice(&self, notice: SccpNoticeMessage);
}

/// Connectionless SCCP transport consumed by the TCAP provider
#[async_trait]
pub trait SccpProvider: Send + Sync {
    /// Send a class 1 data message
    async fn send(
        &self,
        data: Bytes,
        return_on_error: bool,
        called_party: &SccpAddress,
        calling_party: &SccpAddress,
        seq_control: SeqControl,
    ) -> Result<(), SccpError>;

    fn register_listener(&self, ssn: u8, listener: Arc<dyn SccpListener>) -> Result<(), SccpError>;

    fn deregister_listener(&self, ssn: u8);
}
