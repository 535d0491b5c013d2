//! In-memory SCCP transport, recording TC-user and message builders

use crate::config::ProviderConfig;
use crate::errors::SccpError;
use crate::sccp::{SccpAddress, SccpDataMessage, SccpListener, SccpProvider};
use crate::tcap::{
    AbortCause, AbortIndication, AbortMessage, BerCodec, ConversationIndication,
    ConversationMessage, Dialog, InvokeId, MessageCodec, NoticeIndication, PAbortCause,
    QueryIndication, QueryMessage, ResponseIndication, ResponseMessage, TcListener, TcapMessage,
    UniIndication, UniMessage,
};
use crate::types::{PointCode, SeqControl, TransactionId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One payload handed to the transport
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub data: Bytes,
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub seq_control: SeqControl,
}

impl SentMessage {
    pub fn decode(&self) -> TcapMessage {
        let codec = BerCodec;
        match self.data[0] {
            0xE2 | 0xE3 => TcapMessage::Query(codec.decode_query(&self.data).unwrap()),
            0xE5 | 0xE6 => TcapMessage::Conversation(codec.decode_conversation(&self.data).unwrap()),
            0xE4 => TcapMessage::Response(codec.decode_response(&self.data).unwrap()),
            0xF6 => TcapMessage::Abort(codec.decode_abort(&self.data).unwrap()),
            0xE1 => TcapMessage::Uni(codec.decode_uni(&self.data).unwrap()),
            other => panic!("unexpected package 0x{:02X}", other),
        }
    }

    /// Destination and cause if this is a provider abort
    pub fn provider_abort(&self) -> Option<(TransactionId, PAbortCause)> {
        match self.decode() {
            TcapMessage::Abort(AbortMessage {
                destination_transaction_id,
                cause: AbortCause::Provider(cause),
                ..
            }) => Some((destination_transaction_id, cause)),
            _ => None,
        }
    }
}

/// Recording SCCP transport
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentMessage>>,
    listeners: Mutex<BTreeMap<u8, Arc<dyn SccpListener>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn registered_ssns(&self) -> Vec<u8> {
        self.listeners.lock().keys().copied().collect()
    }
}

#[async_trait]
impl SccpProvider for MockTransport {
    async fn send(
        &self,
        data: Bytes,
        _return_on_error: bool,
        called_party: &SccpAddress,
        calling_party: &SccpAddress,
        seq_control: SeqControl,
    ) -> Result<(), SccpError> {
        self.sent.lock().push(SentMessage {
            data,
            called_party: called_party.clone(),
            calling_party: calling_party.clone(),
            seq_control,
        });
        Ok(())
    }

    fn register_listener(&self, ssn: u8, listener: Arc<dyn SccpListener>) -> Result<(), SccpError> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&ssn) {
            return Err(SccpError::SubsystemInUse(ssn));
        }
        listeners.insert(ssn, listener);
        Ok(())
    }

    fn deregister_listener(&self, ssn: u8) {
        self.listeners.lock().remove(&ssn);
    }
}

/// Event seen by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Query(TransactionId),
    Conversation(TransactionId),
    Response(TransactionId),
    Abort(TransactionId, AbortCause),
    Uni,
    Notice(Option<TransactionId>, u8),
    Released(TransactionId),
    InvokeTimeout(TransactionId, InvokeId),
}

/// TC-user that records every indication
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    dialogs: Mutex<Vec<Dialog>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn released(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Released(_)))
            .count()
    }

    /// Dialogs handed over by query and conversation indications
    pub fn dialogs(&self) -> Vec<Dialog> {
        self.dialogs.lock().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl TcListener for RecordingListener {
    fn on_query(&self, ind: &QueryIndication) -> anyhow::Result<()> {
        self.dialogs.lock().push(ind.dialog.clone());
        self.push(Event::Query(ind.dialog.local_id()));
        Ok(())
    }

    fn on_conversation(&self, ind: &ConversationIndication) -> anyhow::Result<()> {
        self.dialogs.lock().push(ind.dialog.clone());
        self.push(Event::Conversation(ind.dialog.local_id()));
        Ok(())
    }

    fn on_response(&self, ind: &ResponseIndication) -> anyhow::Result<()> {
        self.push(Event::Response(ind.dialog.local_id()));
        Ok(())
    }

    fn on_abort(&self, ind: &AbortIndication) -> anyhow::Result<()> {
        self.push(Event::Abort(ind.dialog.local_id(), ind.cause.clone()));
        Ok(())
    }

    fn on_uni(&self, _ind: &UniIndication) -> anyhow::Result<()> {
        self.push(Event::Uni);
        Ok(())
    }

    fn on_notice(&self, ind: &NoticeIndication) -> anyhow::Result<()> {
        self.push(Event::Notice(
            ind.dialog.as_ref().map(Dialog::local_id),
            ind.report_cause,
        ));
        Ok(())
    }

    fn on_dialog_released(&self, dialog: &Dialog) -> anyhow::Result<()> {
        self.push(Event::Released(dialog.local_id()));
        Ok(())
    }

    fn on_invoke_timeout(&self, dialog: &Dialog, invoke_id: InvokeId) -> anyhow::Result<()> {
        self.push(Event::InvokeTimeout(dialog.local_id(), invoke_id));
        Ok(())
    }
}

pub fn provider_config(start: u32, end: u32, max_dialogs: usize) -> ProviderConfig {
    ProviderConfig {
        dialog_id_range_start: start,
        dialog_id_range_end: end,
        max_dialogs,
        timer_workers: 1,
        ..Default::default()
    }
}

pub fn preview_config(idle_timeout_ms: u64) -> ProviderConfig {
    ProviderConfig {
        preview_mode: true,
        dialog_idle_timeout_ms: idle_timeout_ms,
        timer_workers: 1,
        ..Default::default()
    }
}

/// Unitdata from `from` to `to`, MTP3 codes taken from the addresses
pub fn data_message(from: &SccpAddress, to: &SccpAddress, data: Bytes) -> SccpDataMessage {
    SccpDataMessage {
        called_party: to.clone(),
        calling_party: from.clone(),
        data,
        sls: 7,
        return_on_error: false,
        incoming_opc: from.point_code.unwrap_or(PointCode(0)),
        incoming_dpc: to.point_code.unwrap_or(PointCode(0)),
    }
}

pub fn query(otid: u32) -> Bytes {
    BerCodec.encode(&TcapMessage::Query(QueryMessage {
        with_permission: true,
        originating_transaction_id: TransactionId(otid),
        dialog_portion: None,
        components: None,
    }))
}

pub fn conversation(otid: u32, dtid: u32) -> Bytes {
    BerCodec.encode(&TcapMessage::Conversation(ConversationMessage {
        with_permission: true,
        originating_transaction_id: TransactionId(otid),
        destination_transaction_id: TransactionId(dtid),
        dialog_portion: None,
        components: None,
    }))
}

pub fn response(dtid: u32) -> Bytes {
    BerCodec.encode(&TcapMessage::Response(ResponseMessage {
        destination_transaction_id: TransactionId(dtid),
        dialog_portion: None,
        components: None,
    }))
}

pub fn user_abort(dtid: u32) -> Bytes {
    BerCodec.encode(&TcapMessage::Abort(AbortMessage {
        destination_transaction_id: TransactionId(dtid),
        dialog_portion: None,
        cause: AbortCause::User(Bytes::from_static(b"bye")),
    }))
}

pub fn uni() -> Bytes {
    BerCodec.encode(&TcapMessage::Uni(UniMessage {
        dialog_portion: None,
        components: None,
    }))
}
