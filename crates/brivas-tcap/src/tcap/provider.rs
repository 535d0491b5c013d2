//! TCAP provider: dialog ownership and inbound dispatch
//!
//! The provider owns the normal-mode dialog registry or the preview
//! correlation table (never both in use), the listener set and the timer
//! pool. It is the SCCP listener for its subsystem.

use super::allocator::IdAllocator;
use super::codec::{BerCodec, MessageCodec};
use super::dialog::{Dialog, InvokeId};
use super::listener::{log_failures, panic_message, ListenerSet, NoticeIndication, TcListener};
use super::messages::{PAbortCause, PackageType, TcapMessage};
use super::preview::{PreviewDialogData, PreviewDialogDataKey, PreviewRegistry, FIRST_IDLE_GENERATION};
use super::registry::DialogRegistry;
use super::timer::{TimerHandle, TimerService};
use crate::config::ProviderConfig;
use crate::errors::{ParseError, Result, TcapError};
use crate::sccp::{SccpAddress, SccpDataMessage, SccpListener, SccpNoticeMessage, SccpProvider};
use crate::types::{SeqControl, TransactionId};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use metrics::counter;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// TCAP provider bound to one SCCP subsystem
pub struct TcapProvider {
    self_ref: Weak<TcapProvider>,
    config: ProviderConfig,
    transport: Arc<dyn SccpProvider>,
    codec: Arc<dyn MessageCodec>,
    registry: DialogRegistry,
    preview: PreviewRegistry,
    listeners: ListenerSet,
    timers: TimerService,
    seq_control: AtomicU8,
    started: AtomicBool,
}

impl TcapProvider {
    /// Provider using the BER codec
    pub fn new(config: ProviderConfig, transport: Arc<dyn SccpProvider>) -> Result<Arc<Self>> {
        Self::with_codec(config, transport, Arc::new(BerCodec))
    }

    /// Fails with `Config` when `config` does not validate
    pub fn with_codec(
        config: ProviderConfig,
        transport: Arc<dyn SccpProvider>,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| {
            let start = config.dialog_id_range_start;
            let end = config.dialog_id_range_end;
            Self {
                self_ref: self_ref.clone(),
                registry: DialogRegistry::new(IdAllocator::new(start, end), config.max_dialogs),
                preview: PreviewRegistry::new(start, end, config.max_dialogs),
                listeners: ListenerSet::new(),
                timers: TimerService::new(config.timer_workers),
                seq_control: AtomicU8::new(0),
                started: AtomicBool::new(false),
                config,
                transport,
                codec,
            }
        }))
    }

    // ---- configuration ----

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn max_dialogs(&self) -> usize {
        self.config.max_dialogs
    }

    pub fn dialog_id_range_start(&self) -> u32 {
        self.config.dialog_id_range_start
    }

    pub fn dialog_id_range_end(&self) -> u32 {
        self.config.dialog_id_range_end
    }

    pub fn is_preview_mode(&self) -> bool {
        self.config.preview_mode
    }

    pub fn codec(&self) -> &dyn MessageCodec {
        self.codec.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Live structured dialogs (normal mode)
    pub fn dialog_count(&self) -> usize {
        self.registry.len()
    }

    /// Live correlation records (preview mode)
    pub fn preview_dialog_count(&self) -> usize {
        self.preview.len()
    }

    pub fn dialog(&self, id: TransactionId) -> Option<Dialog> {
        self.registry.lookup(id)
    }

    pub fn is_available(&self, id: TransactionId) -> bool {
        self.registry.is_available(id)
    }

    // ---- listeners ----

    pub fn add_listener(&self, listener: Arc<dyn TcListener>) {
        if !self.listeners.add(listener) {
            debug!("Listener already registered");
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TcListener>) {
        self.listeners.remove(listener);
    }

    pub(crate) fn deliver<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn TcListener) -> anyhow::Result<()>,
    {
        log_failures(event, self.listeners.deliver(f));
    }

    // ---- dialog creation ----

    /// Next sequence-control value: 1..=255, then 0
    fn next_seq_control(&self) -> SeqControl {
        self.seq_control.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// New locally initiated structured dialog
    pub fn new_dialog(&self, local: SccpAddress, remote: SccpAddress) -> Result<Dialog> {
        self.new_structured(local, remote, None)
    }

    /// New locally initiated dialog with a caller-chosen id
    pub fn new_dialog_with_id(
        &self,
        local: SccpAddress,
        remote: SccpAddress,
        id: TransactionId,
    ) -> Result<Dialog> {
        self.new_structured(local, remote, Some(id))
    }

    /// New dialog for a single Uni message; never registered
    pub fn new_unstructured_dialog(&self, local: SccpAddress, remote: SccpAddress) -> Result<Dialog> {
        if self.is_preview_mode() {
            return Err(TcapError::PreviewMode);
        }
        self.transient_dialog(local, remote, self.next_seq_control())
    }

    fn new_structured(
        &self,
        local: SccpAddress,
        remote: SccpAddress,
        id: Option<TransactionId>,
    ) -> Result<Dialog> {
        if self.is_preview_mode() {
            return Err(TcapError::PreviewMode);
        }
        let seq = self.next_seq_control();
        self.create_dialog(local, remote, seq, id)
    }

    fn create_dialog(
        &self,
        local: SccpAddress,
        remote: SccpAddress,
        seq: SeqControl,
        id: Option<TransactionId>,
    ) -> Result<Dialog> {
        let provider = self.self_ref.clone();
        let dialog = self
            .registry
            .create(id, |id| Dialog::new(provider, id, true, seq, local, remote))?;
        counter!("tcap_dialogs_created_total").increment(1);
        debug!(dialog_id = %dialog.local_id(), "Dialog created");
        Ok(dialog)
    }

    fn transient_dialog(&self, local: SccpAddress, remote: SccpAddress, seq: SeqControl) -> Result<Dialog> {
        let id = self.registry.allocate_transient()?;
        Ok(Dialog::new(self.self_ref.clone(), id, false, seq, local, remote))
    }

    // ---- outbound ----

    /// Hand an encoded package to SCCP; no-op in preview mode
    pub async fn send(
        &self,
        data: Bytes,
        return_on_error: bool,
        called_party: &SccpAddress,
        calling_party: &SccpAddress,
        seq_control: SeqControl,
    ) -> Result<()> {
        if self.is_preview_mode() {
            return Ok(());
        }
        self.transport
            .send(data, return_on_error, called_party, calling_party, seq_control)
            .await?;
        Ok(())
    }

    /// Send a P-abort to a peer transaction; failures are logged
    pub(crate) async fn send_provider_abort(
        &self,
        cause: PAbortCause,
        destination: TransactionId,
        remote: &SccpAddress,
        local: &SccpAddress,
        seq_control: SeqControl,
    ) {
        if self.is_preview_mode() {
            return;
        }

        let data = self
            .codec
            .encode(&TcapMessage::provider_abort(destination, cause));
        counter!("tcap_provider_aborts_total", "cause" => format!("{:?}", cause)).increment(1);
        debug!(destination = %destination, ?cause, "Sending provider abort");

        if let Err(e) = self.send(data, false, remote, local, seq_control).await {
            error!(destination = %destination, error = %e, "Failed to send provider abort");
        }
    }

    // ---- release & timers ----

    /// Drop a dialog from whichever table holds it and notify listeners once
    pub(crate) fn release(&self, dialog: &Dialog) {
        let removed = match dialog.preview_data() {
            Some(record) => self.preview.remove(record),
            None if dialog.is_structured() => self.registry.remove(dialog),
            None => false,
        };
        if removed {
            self.fire_released(dialog);
        }
    }

    fn fire_released(&self, dialog: &Dialog) {
        counter!("tcap_dialogs_released_total").increment(1);
        debug!(dialog_id = %dialog.local_id(), "Dialog released");
        self.deliver("dialog_released", |l| l.on_dialog_released(dialog));
    }

    /// Schedule a one-shot callback on the timer pool
    pub fn create_operation_timer<F>(&self, timeout: Duration, task: F) -> Result<TimerHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.timers.schedule(timeout, task)
    }

    pub(crate) fn operation_timed_out(&self, dialog: &Dialog, invoke_id: InvokeId) {
        debug!(dialog_id = %dialog.local_id(), invoke_id, "Invoke timed out");
        self.deliver("invoke_timeout", |l| l.on_invoke_timeout(dialog, invoke_id));
    }

    // ---- preview ----

    fn create_preview_dialog(
        &self,
        key: PreviewDialogDataKey,
        local: SccpAddress,
        remote: SccpAddress,
        seq: SeqControl,
    ) -> Result<Dialog> {
        let record = self.preview.create(key, local.clone(), remote.clone(), seq)?;
        self.start_idle_timer(&record, FIRST_IDLE_GENERATION);
        counter!("tcap_dialogs_created_total").increment(1);
        Ok(Dialog::preview(self.self_ref.clone(), record, false, seq, local, remote))
    }

    fn get_preview_dialog(
        &self,
        key1: &PreviewDialogDataKey,
        key2: Option<&PreviewDialogDataKey>,
        local: SccpAddress,
        remote: SccpAddress,
        seq: SeqControl,
    ) -> Option<Dialog> {
        let hit = self.preview.correlate(key1, key2)?;
        self.start_idle_timer(&hit.record, hit.idle_generation);
        Some(Dialog::preview(self.self_ref.clone(), hit.record, hit.side_b, seq, local, remote))
    }

    /// Arm the idle expiry for an idle period opened by the preview table
    fn start_idle_timer(&self, record: &Arc<PreviewDialogData>, generation: u64) {
        let handle = record.handle();
        let provider = self.self_ref.clone();

        let scheduled = self.timers.schedule(self.config.dialog_idle_timeout(), async move {
            if let Some(provider) = provider.upgrade() {
                provider.on_preview_idle(handle, generation);
            }
        });
        match scheduled {
            Ok(timer) => record.set_idle_timer(generation, timer),
            Err(e) => warn!(dialog_id = %record.local_id(), error = %e, "Idle timer not armed"),
        }
    }

    fn on_preview_idle(&self, handle: u64, generation: u64) {
        let Some(record) = self.preview.expire(handle, generation) else {
            return;
        };
        info!(dialog_id = %record.local_id(), "Preview dialog expired without a reply leg");

        let (local, remote) = record.addresses();
        let (local, remote) = (local.clone(), remote.clone());
        let seq = record.seq_control();
        let dialog = Dialog::preview(self.self_ref.clone(), record, false, seq, local, remote);
        self.fire_released(&dialog);
    }

    // ---- lifecycle ----

    /// Start the timer pool and register with SCCP
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(this) = self.self_ref.upgrade() else {
            self.started.store(false, Ordering::Release);
            return Err(TcapError::InvalidState("provider is gone".to_string()));
        };
        let listener: Arc<dyn SccpListener> = this;

        if let Err(e) = self.timers.start() {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        if let Err(e) = self.transport.register_listener(self.config.ssn, listener) {
            self.timers.stop();
            self.started.store(false, Ordering::Release);
            return Err(e.into());
        }

        info!(
            ssn = self.config.ssn,
            preview = self.config.preview_mode,
            max_dialogs = self.config.max_dialogs,
            "TCAP provider started"
        );
        Ok(())
    }

    /// Stop the provider, discarding every in-flight dialog
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.deregister_listener(self.config.ssn);
        self.timers.stop();
        self.preview.clear();
        self.registry.clear();
        info!(ssn = self.config.ssn, "TCAP provider stopped");
    }

    // ---- inbound dispatch ----

    #[instrument(skip(self, message), fields(sls = message.sls, len = message.data.len()))]
    async fn handle_message(&self, message: SccpDataMessage) {
        let Some(tag) = self.codec.read_tag(&message.data) else {
            counter!("tcap_messages_dropped_total").increment(1);
            warn!("Empty TCAP payload");
            return;
        };

        let package = PackageType::from_tag(tag);
        let kind = package.map(PackageType::label).unwrap_or("unrecognized");
        counter!("tcap_messages_received_total", "kind" => kind).increment(1);

        match package {
            Some(PackageType::QueryWithPerm | PackageType::QueryWithoutPerm) => {
                self.on_query_message(&message).await
            }
            Some(PackageType::ConversationWithPerm | PackageType::ConversationWithoutPerm) => {
                self.on_conversation_message(&message).await
            }
            Some(PackageType::Response) => self.on_response_message(&message).await,
            Some(PackageType::Abort) => self.on_abort_message(&message).await,
            Some(PackageType::Uni) => self.on_uni_message(&message).await,
            None => self.on_unrecognized_message(&message, tag).await,
        }
    }

    /// Abort the sender of a message that failed a full decode, if its id can be read
    async fn recover_malformed(&self, message: &SccpDataMessage, err: ParseError) {
        counter!("tcap_messages_malformed_total").increment(1);
        let partial = self.codec.decode_unidentified(&message.data);
        match partial.originating_transaction_id {
            Some(otid) => {
                let cause = err
                    .abort_cause
                    .unwrap_or(PAbortCause::BadlyStructuredDialoguePortion);
                self.send_provider_abort(cause, otid, &message.calling_party, &message.called_party, message.sls)
                    .await;
            }
            None => debug!("No originating transaction id recoverable; dropping"),
        }
    }

    async fn on_query_message(&self, message: &SccpDataMessage) {
        let query = match self.codec.decode_query(&message.data) {
            Ok(q) => q,
            Err(e) => {
                error!(error = %e, "Failed to parse Query package");
                return self.recover_malformed(message, e).await;
            }
        };

        let local = message.called_party.clone();
        let remote = message.calling_party.clone();
        let created = if self.is_preview_mode() {
            let key = PreviewDialogDataKey::calling(message, query.originating_transaction_id);
            self.create_preview_dialog(key, local, remote, message.sls)
        } else {
            self.create_dialog(local, remote, message.sls, None)
        };

        let dialog = match created {
            Ok(d) => d,
            Err(e) => {
                error!(otid = %query.originating_transaction_id, error = %e, "Can not open dialog for Query");
                self.send_provider_abort(
                    PAbortCause::ResourceUnavailable,
                    query.originating_transaction_id,
                    &message.calling_party,
                    &message.called_party,
                    message.sls,
                )
                .await;
                return;
            }
        };

        dialog.process_query(query).await;
    }

    async fn on_conversation_message(&self, message: &SccpDataMessage) {
        let conv = match self.codec.decode_conversation(&message.data) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to parse Conversation package");
                return self.recover_malformed(message, e).await;
            }
        };

        let dtid = conv.destination_transaction_id;
        let dialog = if self.is_preview_mode() {
            let key1 = PreviewDialogDataKey::called(message, dtid);
            let key2 = PreviewDialogDataKey::calling(message, conv.originating_transaction_id);
            self.get_preview_dialog(
                &key1,
                Some(&key2),
                message.called_party.clone(),
                message.calling_party.clone(),
                message.sls,
            )
        } else {
            self.registry.lookup(dtid)
        };

        match dialog {
            Some(d) => d.process_conversation(conv).await,
            None => {
                warn!(dialog_id = %dtid, "TC-CONVERSATION: no dialog for id");
                self.send_provider_abort(
                    PAbortCause::UnassignedRespondingTransactionId,
                    conv.originating_transaction_id,
                    &message.calling_party,
                    &message.called_party,
                    message.sls,
                )
                .await;
            }
        }
    }

    fn resolve_terminating(&self, message: &SccpDataMessage, dtid: TransactionId) -> Option<Dialog> {
        if self.is_preview_mode() {
            let key = PreviewDialogDataKey::called(message, dtid);
            self.get_preview_dialog(
                &key,
                None,
                message.called_party.clone(),
                message.calling_party.clone(),
                message.sls,
            )
        } else {
            self.registry.lookup(dtid)
        }
    }

    async fn on_response_message(&self, message: &SccpDataMessage) {
        let response = match self.codec.decode_response(&message.data) {
            Ok(r) => r,
            Err(e) => {
                counter!("tcap_messages_malformed_total").increment(1);
                error!(error = %e, "Failed to parse Response package");
                return;
            }
        };

        let dtid = response.destination_transaction_id;
        match self.resolve_terminating(message, dtid) {
            Some(d) => {
                d.process_response(response).await;
                if self.is_preview_mode() {
                    self.release(&d);
                }
            }
            None => warn!(dialog_id = %dtid, "TC-RESPONSE: no dialog for id"),
        }
    }

    async fn on_abort_message(&self, message: &SccpDataMessage) {
        let abort = match self.codec.decode_abort(&message.data) {
            Ok(a) => a,
            Err(e) => {
                counter!("tcap_messages_malformed_total").increment(1);
                error!(error = %e, "Failed to parse Abort package");
                return;
            }
        };

        let dtid = abort.destination_transaction_id;
        match self.resolve_terminating(message, dtid) {
            Some(d) => {
                d.process_abort(abort).await;
                if self.is_preview_mode() {
                    self.release(&d);
                }
            }
            None => warn!(dialog_id = %dtid, "TC-ABORT: no dialog for id"),
        }
    }

    async fn on_uni_message(&self, message: &SccpDataMessage) {
        let uni = match self.codec.decode_uni(&message.data) {
            Ok(u) => u,
            Err(e) => {
                counter!("tcap_messages_malformed_total").increment(1);
                error!(error = %e, "Failed to parse Uni package");
                return;
            }
        };

        let dialog = match self.transient_dialog(
            message.called_party.clone(),
            message.calling_party.clone(),
            message.sls,
        ) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "Can not create dialog for Uni");
                return;
            }
        };
        dialog.process_uni(uni).await;
    }

    async fn on_unrecognized_message(&self, message: &SccpDataMessage, tag: u8) {
        if self.is_preview_mode() {
            return;
        }

        error!(tag, "Rx unidentified package type");
        counter!("tcap_messages_dropped_total").increment(1);

        let partial = self.codec.decode_unidentified(&message.data);
        if let Some(otid) = partial.originating_transaction_id {
            self.send_provider_abort(
                PAbortCause::UnrecognizedPackageType,
                otid,
                &message.calling_party,
                &message.called_party,
                message.sls,
            )
            .await;
        }
    }

    #[instrument(skip(self, notice), fields(cause = notice.return_cause))]
    async fn handle_notice(&self, notice: SccpNoticeMessage) {
        if self.is_preview_mode() {
            return;
        }

        let partial = self.codec.decode_unidentified(&notice.data);
        let dialog = partial
            .originating_transaction_id
            .and_then(|id| self.registry.lookup(id));

        match dialog {
            Some(d) => d.process_notice(notice.return_cause).await,
            None => {
                // Returned message was ours: calling party is the local side
                let ind = NoticeIndication {
                    dialog: None,
                    local_address: notice.calling_party,
                    remote_address: notice.called_party,
                    report_cause: notice.return_cause,
                };
                self.deliver("notice", |l| l.on_notice(&ind));
            }
        }
    }
}

#[async_trait]
impl SccpListener for TcapProvider {
    async fn on_message(&self, message: SccpDataMessage) {
        let outcome = AssertUnwindSafe(self.handle_message(message))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            counter!("tcap_messages_dropped_total").increment(1);
            error!(panic = %panic_message(payload.as_ref()), "Error while decoding Rx SCCP message");
        }
    }

    async fn on_notice(&self, notice: SccpNoticeMessage) {
        let outcome = AssertUnwindSafe(self.handle_notice(notice))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            error!(panic = %panic_message(payload.as_ref()), "Error while handling SCCP notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::SccpListener;
    use crate::tcap::{AbortCause, QueryIndication, TransactionState};
    use crate::test_support::*;
    use crate::types::PointCode;
    use tokio_test::{assert_err, assert_ok};

    fn local() -> SccpAddress {
        SccpAddress::from_ssn_pc(8, 100)
    }

    fn peer() -> SccpAddress {
        SccpAddress::from_ssn_pc(6, 200)
    }

    fn started(config: ProviderConfig) -> (Arc<TcapProvider>, Arc<MockTransport>, Arc<RecordingListener>) {
        let transport = MockTransport::new();
        let provider = TcapProvider::new(config, transport.clone()).unwrap();
        let listener = RecordingListener::new();
        provider.add_listener(listener.clone());
        provider.start().unwrap();
        (provider, transport, listener)
    }

    fn normal(start: u32, end: u32, max: usize) -> (Arc<TcapProvider>, Arc<MockTransport>, Arc<RecordingListener>) {
        started(provider_config(start, end, max))
    }

    async fn inbound(provider: &TcapProvider, data: Bytes) {
        provider.on_message(data_message(&peer(), &local(), data)).await;
    }

    #[tokio::test]
    async fn test_query_opens_dialog_and_response_releases_it() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        inbound(&provider, query(0xAA)).await;
        assert_eq!(provider.dialog_count(), 1);
        assert_eq!(listener.events(), vec![Event::Query(TransactionId(1))]);

        let dialog = listener.dialogs()[0].clone();
        assert_eq!(dialog.remote_id(), Some(TransactionId(0xAA)));
        assert_eq!(dialog.state(), TransactionState::InitialReceived);
        assert_eq!(dialog.seq_control(), 7);

        assert_ok!(dialog.send_response(None, None).await);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].called_party, peer());
        assert_eq!(sent[0].calling_party, local());
        match sent[0].decode() {
            TcapMessage::Response(r) => assert_eq!(r.destination_transaction_id, TransactionId(0xAA)),
            other => panic!("expected response, got {:?}", other),
        }

        assert_eq!(provider.dialog_count(), 0);
        assert_eq!(listener.released(), 1);
        provider.stop();
    }

    #[tokio::test]
    async fn test_malformed_query_aborts_sender_without_dialog() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        // Dialog portion claims 5 octets of context it does not have
        let payload = Bytes::from_static(&[
            0xE2, 0x0A, 0xC7, 0x04, 0x00, 0x00, 0x00, 0x07, 0xF9, 0x02, 0xDA, 0x05,
        ]);
        inbound(&provider, payload).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].provider_abort(),
            Some((TransactionId(7), PAbortCause::BadlyStructuredDialoguePortion))
        );
        assert_eq!(provider.dialog_count(), 0);
        assert!(listener.events().is_empty());
        provider.stop();
    }

    #[tokio::test]
    async fn test_malformed_without_recoverable_id_is_dropped() {
        let (provider, transport, _listener) = normal(1, 1000, 10);

        inbound(&provider, Bytes::from_static(&[0xE2, 0x04, 0xC7, 0x02, 0x00, 0x01])).await;

        assert!(transport.sent().is_empty());
        assert_eq!(provider.dialog_count(), 0);
        provider.stop();
    }

    #[tokio::test]
    async fn test_conversation_for_unknown_dialog_is_aborted() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        inbound(&provider, conversation(0x55, 999)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].provider_abort(),
            Some((TransactionId(0x55), PAbortCause::UnassignedRespondingTransactionId))
        );
        assert!(listener.events().is_empty());
        provider.stop();
    }

    #[tokio::test]
    async fn test_repeated_response_sees_unknown_dialog() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        let dialog = provider.new_dialog(local(), peer()).unwrap();
        let id = dialog.local_id();
        assert_ok!(dialog.send_query(true, None, None).await);
        assert_eq!(dialog.state(), TransactionState::InitialSent);

        inbound(&provider, conversation(0x77, id.value())).await;
        assert_eq!(dialog.state(), TransactionState::Active);
        assert_eq!(dialog.remote_id(), Some(TransactionId(0x77)));

        inbound(&provider, response(id.value())).await;
        inbound(&provider, response(id.value())).await;

        assert_eq!(
            listener.events(),
            vec![Event::Conversation(id), Event::Response(id), Event::Released(id)]
        );
        assert_eq!(provider.dialog_count(), 0);
        // Only the query went out
        assert_eq!(transport.sent().len(), 1);
        provider.stop();
    }

    #[tokio::test]
    async fn test_id_range_wraps_and_capacity_is_enforced() {
        let (provider, transport, listener) = normal(100, 104, 5);

        // Move the cursor past 100
        let warmup = provider.new_dialog(local(), peer()).unwrap();
        assert_eq!(warmup.local_id(), TransactionId(100));
        warmup.release().await;

        for otid in 1..=5 {
            inbound(&provider, query(otid)).await;
        }
        let ids: Vec<u32> = listener.dialogs().iter().map(|d| d.local_id().value()).collect();
        assert_eq!(ids, vec![101, 102, 103, 104, 100]);
        assert!(transport.sent().is_empty());

        inbound(&provider, query(6)).await;
        assert_eq!(provider.dialog_count(), 5);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].provider_abort(),
            Some((TransactionId(6), PAbortCause::ResourceUnavailable))
        );
        provider.stop();
    }

    #[tokio::test]
    async fn test_preferred_id_collision() {
        let (provider, _transport, _listener) = normal(1, 1000, 10);

        assert_ok!(provider.new_dialog_with_id(local(), peer(), TransactionId(42)));
        let err = assert_err!(provider.new_dialog_with_id(local(), peer(), TransactionId(42)));
        assert!(matches!(err, TcapError::IdAlreadyInUse(TransactionId(42))));
        assert_eq!(provider.dialog_count(), 1);
        assert!(!provider.is_available(TransactionId(42)));
        provider.stop();
    }

    #[tokio::test]
    async fn test_unrecognized_package_is_aborted() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        inbound(&provider, Bytes::from_static(&[0x62, 0x06, 0xC7, 0x04, 0x00, 0x00, 0x00, 0x09])).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].provider_abort(),
            Some((TransactionId(9), PAbortCause::UnrecognizedPackageType))
        );
        assert!(listener.events().is_empty());
        provider.stop();
    }

    #[tokio::test]
    async fn test_conversation_in_wrong_state_is_rejected() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        let dialog = provider.new_dialog(local(), peer()).unwrap();
        let id = dialog.local_id();
        inbound(&provider, conversation(0x31, id.value())).await;

        assert_eq!(
            transport.sent()[0].provider_abort(),
            Some((TransactionId(0x31), PAbortCause::IncorrectTransactionPortion))
        );
        assert_eq!(listener.events(), vec![Event::Released(id)]);
        assert_eq!(dialog.state(), TransactionState::Expunged);
        provider.stop();
    }

    #[tokio::test]
    async fn test_abort_releases_dialog() {
        let (provider, _transport, listener) = normal(1, 1000, 10);

        inbound(&provider, query(0x40)).await;
        let id = listener.dialogs()[0].local_id();
        inbound(&provider, user_abort(id.value())).await;

        assert_eq!(
            listener.events(),
            vec![
                Event::Query(id),
                Event::Abort(id, AbortCause::User(Bytes::from_static(b"bye"))),
                Event::Released(id),
            ]
        );
        assert_eq!(provider.dialog_count(), 0);
        provider.stop();
    }

    #[tokio::test]
    async fn test_uni_is_delivered_without_registration() {
        let (provider, _transport, listener) = normal(1, 1000, 10);

        inbound(&provider, uni()).await;

        assert_eq!(listener.events(), vec![Event::Uni]);
        assert_eq!(provider.dialog_count(), 0);
        provider.stop();
    }

    struct Panicking;

    impl TcListener for Panicking {
        fn on_query(&self, _ind: &QueryIndication) -> anyhow::Result<()> {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_stop_dispatch() {
        let transport = MockTransport::new();
        let provider = TcapProvider::new(provider_config(1, 1000, 10), transport.clone()).unwrap();
        let listener = RecordingListener::new();
        provider.add_listener(Arc::new(Panicking));
        provider.add_listener(listener.clone());
        provider.start().unwrap();

        inbound(&provider, query(1)).await;
        inbound(&provider, query(2)).await;

        assert_eq!(listener.dialogs().len(), 2);
        assert_eq!(provider.dialog_count(), 2);
        provider.stop();
    }

    #[tokio::test]
    async fn test_invoke_timeout_fires_unless_cancelled() {
        let (provider, _transport, listener) = normal(1, 1000, 10);

        let dialog = provider.new_dialog(local(), peer()).unwrap();
        let id = dialog.local_id();
        assert_ok!(dialog.start_invoke_timer(1, Some(Duration::from_millis(20))));
        assert_ok!(dialog.start_invoke_timer(2, Some(Duration::from_millis(20))));
        assert!(dialog.cancel_invoke_timer(2));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(listener.events(), vec![Event::InvokeTimeout(id, 1)]);
        assert!(!dialog.has_pending_invoke(1));
        // Cancelling after expiry is harmless
        assert!(!dialog.cancel_invoke_timer(1));
        provider.stop();
    }

    #[tokio::test]
    async fn test_release_discards_pending_invokes() {
        let (provider, _transport, listener) = normal(1, 1000, 10);

        let dialog = provider.new_dialog(local(), peer()).unwrap();
        let id = dialog.local_id();
        assert_ok!(dialog.start_invoke_timer(3, Some(Duration::from_millis(30))));
        dialog.release().await;
        dialog.release().await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(listener.events(), vec![Event::Released(id)]);
        assert!(provider.dialog(id).is_none());
        provider.stop();
    }

    #[tokio::test]
    async fn test_notice_releases_dialog_that_is_not_active() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        let dialog = provider.new_dialog(local(), peer()).unwrap();
        let id = dialog.local_id();
        assert_ok!(dialog.send_query(false, None, None).await);

        let returned = transport.sent()[0].data.clone();
        provider
            .on_notice(SccpNoticeMessage {
                called_party: peer(),
                calling_party: local(),
                data: returned,
                return_cause: 1,
            })
            .await;

        assert_eq!(listener.events(), vec![Event::Notice(Some(id), 1), Event::Released(id)]);
        assert_eq!(provider.dialog_count(), 0);

        provider
            .on_notice(SccpNoticeMessage {
                called_party: peer(),
                calling_party: local(),
                data: query(0x9999),
                return_cause: 3,
            })
            .await;
        assert_eq!(listener.events().last(), Some(&Event::Notice(None, 3)));
        provider.stop();
    }

    #[test]
    fn test_unusable_config_rejected_at_construction() {
        let zero_workers = ProviderConfig {
            timer_workers: 0,
            ..provider_config(1, 1000, 10)
        };
        assert!(matches!(
            TcapProvider::new(zero_workers, MockTransport::new()),
            Err(TcapError::Config(_))
        ));

        let inverted = provider_config(10, 9, 10);
        assert!(matches!(
            TcapProvider::new(inverted, MockTransport::new()),
            Err(TcapError::Config(_))
        ));
    }

    #[test]
    fn test_seq_control_wraps_to_zero() {
        let provider = TcapProvider::new(provider_config(1, 1000, 10), MockTransport::new()).unwrap();
        let seqs: Vec<SeqControl> = (0..256)
            .map(|_| provider.new_unstructured_dialog(local(), peer()).unwrap().seq_control())
            .collect();
        assert_eq!(seqs[0], 1);
        assert_eq!(seqs[254], 255);
        assert_eq!(seqs[255], 0);
        assert_eq!(provider.dialog_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_dialogs_without_events() {
        let (provider, transport, listener) = normal(1, 1000, 10);

        inbound(&provider, query(1)).await;
        provider.stop();

        assert_eq!(provider.dialog_count(), 0);
        assert_eq!(listener.released(), 0);
        assert!(transport.registered_ssns().is_empty());
    }

    // ---- preview ----

    fn side_a() -> SccpAddress {
        SccpAddress::from_ssn_pc(8, 100)
    }

    fn side_b() -> SccpAddress {
        SccpAddress::from_ssn_pc(6, 200)
    }

    async fn observed(provider: &TcapProvider, from: &SccpAddress, to: &SccpAddress, data: Bytes) {
        provider.on_message(data_message(from, to, data)).await;
    }

    #[tokio::test]
    async fn test_preview_rejects_local_dialogs() {
        let (provider, _transport, _listener) = started(preview_config(60_000));

        assert!(matches!(provider.new_dialog(local(), peer()), Err(TcapError::PreviewMode)));
        assert!(matches!(
            provider.new_unstructured_dialog(local(), peer()),
            Err(TcapError::PreviewMode)
        ));
        provider.stop();
    }

    #[tokio::test]
    async fn test_preview_correlates_both_legs() {
        let (provider, transport, listener) = started(preview_config(60_000));
        let (a, b) = (side_a(), side_b());

        observed(&provider, &a, &b, query(0x10)).await;
        assert_eq!(provider.preview_dialog_count(), 1);
        let opening = listener.dialogs()[0].clone();
        let record = opening.preview_data().unwrap().clone();
        assert!(!opening.is_side_b());

        // B answers A
        observed(&provider, &b, &a, conversation(0x20, 0x10)).await;
        let reply = listener.dialogs()[1].clone();
        assert!(reply.is_side_b());
        assert_eq!(reply.local_id(), opening.local_id());
        assert_eq!(
            record.key2(),
            Some(PreviewDialogDataKey::new(PointCode(200), None, 6, TransactionId(0x20)))
        );

        // A continues towards B, found through key2
        observed(&provider, &a, &b, conversation(0x10, 0x20)).await;
        assert!(!listener.dialogs()[2].is_side_b());

        // B ends the dialog
        observed(&provider, &b, &a, response(0x10)).await;
        assert_eq!(provider.preview_dialog_count(), 0);
        assert_eq!(listener.released(), 1);
        assert!(transport.sent().is_empty());
        provider.stop();
    }

    #[tokio::test]
    async fn test_preview_idle_expiry_releases_unanswered_record() {
        let (provider, _transport, listener) = started(preview_config(50));

        observed(&provider, &side_a(), &side_b(), query(0x10)).await;
        let id = listener.dialogs()[0].local_id();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(provider.preview_dialog_count(), 0);
        assert_eq!(listener.events(), vec![Event::Query(id), Event::Released(id)]);
        provider.stop();
    }

    #[tokio::test]
    async fn test_preview_duplicate_query_drops_both() {
        let (provider, _transport, listener) = started(preview_config(60_000));

        observed(&provider, &side_a(), &side_b(), query(0x10)).await;
        observed(&provider, &side_a(), &side_b(), query(0x10)).await;

        assert_eq!(provider.preview_dialog_count(), 0);
        assert_eq!(listener.dialogs().len(), 1);
        provider.stop();
    }

    #[tokio::test]
    async fn test_preview_stays_silent_on_unknown_traffic() {
        let (provider, transport, listener) = started(preview_config(60_000));

        observed(&provider, &side_b(), &side_a(), conversation(0x20, 0x10)).await;
        observed(
            &provider,
            &side_a(),
            &side_b(),
            Bytes::from_static(&[0x62, 0x06, 0xC7, 0x04, 0x00, 0x00, 0x00, 0x09]),
        )
        .await;

        assert!(transport.sent().is_empty());
        assert!(listener.events().is_empty());
        provider.stop();
    }
}
