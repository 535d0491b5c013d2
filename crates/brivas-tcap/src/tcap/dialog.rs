//! Dialog (transaction) state machine
//!
//! A [`Dialog`] is a cheap cloneable handle. Inbound processing holds the
//! dialog's async processing lock for the whole message, listener fan-out
//! included, so one dialog never sees two messages at once.

use super::listener::{
    AbortIndication, ConversationIndication, NoticeIndication, QueryIndication,
    ResponseIndication, UniIndication,
};
use super::messages::{
    AbortCause, AbortMessage, ComponentPortion, ConversationMessage, DialogPortion, PAbortCause,
    QueryMessage, ResponseMessage, TcapMessage, UniMessage,
};
use super::preview::PreviewDialogData;
use super::provider::TcapProvider;
use super::timer::TimerHandle;
use crate::errors::{Result, TcapError};
use crate::sccp::SccpAddress;
use crate::types::{SeqControl, TransactionId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Component invoke identifier
pub type InvokeId = i32;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InitialReceived,
    InitialSent,
    Active,
    Expunged,
}

struct PendingInvoke {
    generation: u64,
    timer: Option<TimerHandle>,
}

struct DialogState {
    transaction_state: TransactionState,
    remote_id: Option<TransactionId>,
    local_address: SccpAddress,
    remote_address: SccpAddress,
    pending_invokes: HashMap<InvokeId, PendingInvoke>,
    invoke_generation: u64,
}

pub(crate) struct PreviewBinding {
    record: Arc<PreviewDialogData>,
    side_b: bool,
}

struct DialogInner {
    local_id: TransactionId,
    structured: bool,
    seq_control: SeqControl,
    provider: Weak<TcapProvider>,
    preview: Option<PreviewBinding>,
    lock: tokio::sync::Mutex<()>,
    state: Mutex<DialogState>,
}

/// Handle to one TCAP transaction
#[derive(Clone)]
pub struct Dialog {
    inner: Arc<DialogInner>,
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dialog")
            .field("local_id", &self.inner.local_id)
            .field("remote_id", &state.remote_id)
            .field("structured", &self.inner.structured)
            .field("preview", &self.inner.preview.is_some())
            .field("state", &state.transaction_state)
            .finish()
    }
}

impl Dialog {
    pub(crate) fn new(
        provider: Weak<TcapProvider>,
        local_id: TransactionId,
        structured: bool,
        seq_control: SeqControl,
        local_address: SccpAddress,
        remote_address: SccpAddress,
    ) -> Self {
        Self::build(provider, local_id, structured, seq_control, local_address, remote_address, None)
    }

    /// Transient view over a preview record
    pub(crate) fn preview(
        provider: Weak<TcapProvider>,
        record: Arc<PreviewDialogData>,
        side_b: bool,
        seq_control: SeqControl,
        local_address: SccpAddress,
        remote_address: SccpAddress,
    ) -> Self {
        let local_id = record.local_id();
        Self::build(
            provider,
            local_id,
            true,
            seq_control,
            local_address,
            remote_address,
            Some(PreviewBinding { record, side_b }),
        )
    }

    fn build(
        provider: Weak<TcapProvider>,
        local_id: TransactionId,
        structured: bool,
        seq_control: SeqControl,
        local_address: SccpAddress,
        remote_address: SccpAddress,
        preview: Option<PreviewBinding>,
    ) -> Self {
        Self {
            inner: Arc::new(DialogInner {
                local_id,
                structured,
                seq_control,
                provider,
                preview,
                lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(DialogState {
                    transaction_state: TransactionState::Idle,
                    remote_id: None,
                    local_address,
                    remote_address,
                    pending_invokes: HashMap::new(),
                    invoke_generation: 0,
                }),
            }),
        }
    }

    pub fn local_id(&self) -> TransactionId {
        self.inner.local_id
    }

    /// Peer transaction id, once known
    pub fn remote_id(&self) -> Option<TransactionId> {
        self.inner.state.lock().remote_id
    }

    pub fn is_structured(&self) -> bool {
        self.inner.structured
    }

    pub fn seq_control(&self) -> SeqControl {
        self.inner.seq_control
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state.lock().transaction_state
    }

    pub fn local_address(&self) -> SccpAddress {
        self.inner.state.lock().local_address.clone()
    }

    pub fn remote_address(&self) -> SccpAddress {
        self.inner.state.lock().remote_address.clone()
    }

    pub fn is_preview(&self) -> bool {
        self.inner.preview.is_some()
    }

    /// Correlation record of a preview dialog
    pub fn preview_data(&self) -> Option<&Arc<PreviewDialogData>> {
        self.inner.preview.as_ref().map(|p| &p.record)
    }

    /// Whether a preview message came from the side that answered the query
    pub fn is_side_b(&self) -> bool {
        self.inner.preview.as_ref().map(|p| p.side_b).unwrap_or(false)
    }

    /// Identity comparison of two handles
    pub fn ptr_eq(&self, other: &Dialog) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn provider(&self) -> Result<Arc<TcapProvider>> {
        self.inner
            .provider
            .upgrade()
            .ok_or_else(|| TcapError::InvalidState("provider is gone".to_string()))
    }

    fn set_state(&self, next: TransactionState) {
        self.inner.state.lock().transaction_state = next;
    }

    fn note_preview(&self, dialog_portion: Option<&DialogPortion>, components: Option<&ComponentPortion>) {
        if let Some(binding) = &self.inner.preview {
            binding.record.note_message(binding.side_b, dialog_portion, components);
        }
    }

    // ---- inbound ----

    pub(crate) async fn process_query(&self, msg: QueryMessage) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        if self.is_preview() {
            self.inner.state.lock().remote_id = Some(msg.originating_transaction_id);
            self.note_preview(msg.dialog_portion.as_ref(), msg.components.as_ref());
        } else {
            let accepted = {
                let mut state = self.inner.state.lock();
                if state.transaction_state == TransactionState::Idle {
                    state.remote_id = Some(msg.originating_transaction_id);
                    state.transaction_state = TransactionState::InitialReceived;
                    true
                } else {
                    false
                }
            };
            if !accepted {
                self.reject_locked(&provider, Some(msg.originating_transaction_id)).await;
                return;
            }
        }

        let ind = QueryIndication {
            dialog: self.clone(),
            with_permission: msg.with_permission,
            dialog_portion: msg.dialog_portion,
            components: msg.components,
        };
        provider.deliver("query", |l| l.on_query(&ind));
    }

    pub(crate) async fn process_conversation(&self, msg: ConversationMessage) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        if self.is_preview() {
            self.note_preview(msg.dialog_portion.as_ref(), msg.components.as_ref());
        } else {
            let accepted = {
                let mut state = self.inner.state.lock();
                match state.transaction_state {
                    TransactionState::InitialSent => {
                        state.remote_id = Some(msg.originating_transaction_id);
                        state.transaction_state = TransactionState::Active;
                        true
                    }
                    TransactionState::Active => true,
                    _ => false,
                }
            };
            if !accepted {
                self.reject_locked(&provider, Some(msg.originating_transaction_id)).await;
                return;
            }
        }

        let ind = ConversationIndication {
            dialog: self.clone(),
            with_permission: msg.with_permission,
            dialog_portion: msg.dialog_portion,
            components: msg.components,
        };
        provider.deliver("conversation", |l| l.on_conversation(&ind));
    }

    pub(crate) async fn process_response(&self, msg: ResponseMessage) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        if self.is_preview() {
            self.note_preview(msg.dialog_portion.as_ref(), msg.components.as_ref());
        } else {
            let (state, remote) = {
                let state = self.inner.state.lock();
                (state.transaction_state, state.remote_id)
            };
            if !matches!(state, TransactionState::InitialSent | TransactionState::Active) {
                self.reject_locked(&provider, remote).await;
                return;
            }
        }

        let ind = ResponseIndication {
            dialog: self.clone(),
            dialog_portion: msg.dialog_portion,
            components: msg.components,
        };
        provider.deliver("response", |l| l.on_response(&ind));
        self.release_locked(&provider);
    }

    pub(crate) async fn process_abort(&self, msg: AbortMessage) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        if self.is_preview() {
            self.note_preview(msg.dialog_portion.as_ref(), None);
        }

        let ind = AbortIndication {
            dialog: self.clone(),
            cause: msg.cause,
            dialog_portion: msg.dialog_portion,
        };
        provider.deliver("abort", |l| l.on_abort(&ind));
        self.release_locked(&provider);
    }

    pub(crate) async fn process_uni(&self, msg: UniMessage) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        let ind = UniIndication {
            dialog: self.clone(),
            dialog_portion: msg.dialog_portion,
            components: msg.components,
        };
        provider.deliver("uni", |l| l.on_uni(&ind));
    }

    /// Deliver a returned-message notice; releases unless the dialog is active
    pub(crate) async fn process_notice(&self, report_cause: u8) {
        let _guard = self.inner.lock.lock().await;
        let Ok(provider) = self.provider() else { return };

        let ind = NoticeIndication {
            dialog: Some(self.clone()),
            local_address: self.local_address(),
            remote_address: self.remote_address(),
            report_cause,
        };
        provider.deliver("notice", |l| l.on_notice(&ind));

        if self.state() != TransactionState::Active {
            self.release_locked(&provider);
        }
    }

    /// Answer a message arriving in the wrong state, then drop the dialog
    async fn reject_locked(&self, provider: &TcapProvider, peer: Option<TransactionId>) {
        warn!(
            dialog_id = %self.inner.local_id,
            state = ?self.state(),
            "Message received in unexpected state; aborting dialog"
        );
        if let Some(peer) = peer {
            provider
                .send_provider_abort(
                    PAbortCause::IncorrectTransactionPortion,
                    peer,
                    &self.remote_address(),
                    &self.local_address(),
                    self.inner.seq_control,
                )
                .await;
        }
        self.release_locked(provider);
    }

    // ---- outbound ----

    fn ensure_sendable(&self) -> Result<()> {
        if self.is_preview() {
            return Err(TcapError::PreviewMode);
        }
        Ok(())
    }

    async fn transmit(&self, provider: &TcapProvider, message: &TcapMessage) -> Result<()> {
        let data = provider.codec().encode(message);
        let (remote, local) = {
            let state = self.inner.state.lock();
            (state.remote_address.clone(), state.local_address.clone())
        };
        provider
            .send(data, false, &remote, &local, self.inner.seq_control)
            .await
    }

    /// Open the transaction (TC-QUERY)
    pub async fn send_query(
        &self,
        with_permission: bool,
        dialog_portion: Option<DialogPortion>,
        components: Option<ComponentPortion>,
    ) -> Result<()> {
        self.ensure_sendable()?;
        let _guard = self.inner.lock.lock().await;
        let provider = self.provider()?;

        let state = self.state();
        if state != TransactionState::Idle || !self.inner.structured {
            return Err(TcapError::InvalidState(format!("send_query in {:?}", state)));
        }

        let message = TcapMessage::Query(QueryMessage {
            with_permission,
            originating_transaction_id: self.inner.local_id,
            dialog_portion,
            components,
        });
        self.transmit(&provider, &message).await?;
        self.set_state(TransactionState::InitialSent);
        Ok(())
    }

    /// Continue the transaction (TC-CONVERSATION)
    pub async fn send_conversation(
        &self,
        with_permission: bool,
        dialog_portion: Option<DialogPortion>,
        components: Option<ComponentPortion>,
    ) -> Result<()> {
        self.ensure_sendable()?;
        let _guard = self.inner.lock.lock().await;
        let provider = self.provider()?;

        let (state, remote) = {
            let s = self.inner.state.lock();
            (s.transaction_state, s.remote_id)
        };
        let remote = match (state, remote) {
            (TransactionState::InitialReceived | TransactionState::Active, Some(r)) => r,
            _ => return Err(TcapError::InvalidState(format!("send_conversation in {:?}", state))),
        };

        let message = TcapMessage::Conversation(ConversationMessage {
            with_permission,
            originating_transaction_id: self.inner.local_id,
            destination_transaction_id: remote,
            dialog_portion,
            components,
        });
        self.transmit(&provider, &message).await?;
        self.set_state(TransactionState::Active);
        Ok(())
    }

    /// End the transaction (TC-RESPONSE) and release it
    pub async fn send_response(
        &self,
        dialog_portion: Option<DialogPortion>,
        components: Option<ComponentPortion>,
    ) -> Result<()> {
        self.ensure_sendable()?;
        let _guard = self.inner.lock.lock().await;
        let provider = self.provider()?;

        let (state, remote) = {
            let s = self.inner.state.lock();
            (s.transaction_state, s.remote_id)
        };
        let remote = match (state, remote) {
            (TransactionState::InitialReceived | TransactionState::Active, Some(r)) => r,
            _ => return Err(TcapError::InvalidState(format!("send_response in {:?}", state))),
        };

        let message = TcapMessage::Response(ResponseMessage {
            destination_transaction_id: remote,
            dialog_portion,
            components,
        });
        let sent = self.transmit(&provider, &message).await;
        self.release_locked(&provider);
        sent
    }

    /// TC-U-ABORT; without a known peer id the dialog is only released locally
    pub async fn send_user_abort(
        &self,
        dialog_portion: Option<DialogPortion>,
        information: Bytes,
    ) -> Result<()> {
        self.ensure_sendable()?;
        let _guard = self.inner.lock.lock().await;
        let provider = self.provider()?;

        let (state, remote) = {
            let s = self.inner.state.lock();
            (s.transaction_state, s.remote_id)
        };
        if matches!(state, TransactionState::Idle | TransactionState::Expunged) {
            return Err(TcapError::InvalidState(format!("send_user_abort in {:?}", state)));
        }

        let mut sent = Ok(());
        if let Some(remote) = remote {
            let message = TcapMessage::Abort(AbortMessage {
                destination_transaction_id: remote,
                dialog_portion,
                cause: AbortCause::User(information),
            });
            sent = self.transmit(&provider, &message).await;
        }
        self.release_locked(&provider);
        sent
    }

    /// Send a unidirectional message on an unstructured dialog
    pub async fn send_uni(
        &self,
        dialog_portion: Option<DialogPortion>,
        components: Option<ComponentPortion>,
    ) -> Result<()> {
        self.ensure_sendable()?;
        if self.inner.structured {
            return Err(TcapError::InvalidState("send_uni on a structured dialog".to_string()));
        }
        let _guard = self.inner.lock.lock().await;
        let provider = self.provider()?;

        let message = TcapMessage::Uni(UniMessage {
            dialog_portion,
            components,
        });
        self.transmit(&provider, &message).await
    }

    /// Release the dialog locally without signalling the peer
    pub async fn release(&self) {
        let _guard = self.inner.lock.lock().await;
        if let Ok(provider) = self.provider() {
            self.release_locked(&provider);
        }
    }

    fn release_locked(&self, provider: &TcapProvider) {
        let invokes = {
            let mut state = self.inner.state.lock();
            if state.transaction_state == TransactionState::Expunged {
                return;
            }
            state.transaction_state = TransactionState::Expunged;
            std::mem::take(&mut state.pending_invokes)
        };
        for invoke in invokes.into_values() {
            if let Some(timer) = invoke.timer {
                timer.cancel();
            }
        }
        debug!(dialog_id = %self.inner.local_id, "Releasing dialog");
        provider.release(self);
    }

    // ---- invoke timers ----

    /// Arm the timeout of an outstanding invoke; `None` uses the configured default
    pub fn start_invoke_timer(&self, invoke_id: InvokeId, timeout: Option<Duration>) -> Result<()> {
        let provider = self.provider()?;
        let timeout = timeout.unwrap_or_else(|| provider.config().invoke_timeout());

        let generation = {
            let mut state = self.inner.state.lock();
            if state.transaction_state == TransactionState::Expunged {
                return Err(TcapError::InvalidState("dialog released".to_string()));
            }
            state.invoke_generation += 1;
            let generation = state.invoke_generation;
            if let Some(old) = state.pending_invokes.insert(
                invoke_id,
                PendingInvoke {
                    generation,
                    timer: None,
                },
            ) {
                if let Some(timer) = old.timer {
                    timer.cancel();
                }
            }
            generation
        };

        let weak = Arc::downgrade(&self.inner);
        let timer = provider.create_operation_timer(timeout, async move {
            if let Some(inner) = weak.upgrade() {
                Dialog { inner }.on_invoke_timer(invoke_id, generation).await;
            }
        });

        let timer = match timer {
            Ok(timer) => timer,
            Err(e) => {
                self.inner.state.lock().pending_invokes.remove(&invoke_id);
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        match state.pending_invokes.get_mut(&invoke_id) {
            Some(pending) if pending.generation == generation => pending.timer = Some(timer),
            // Cancelled or replaced while scheduling
            _ => timer.cancel(),
        }
        Ok(())
    }

    /// Stop waiting for an invoke; returns false if it was not pending
    pub fn cancel_invoke_timer(&self, invoke_id: InvokeId) -> bool {
        let removed = self.inner.state.lock().pending_invokes.remove(&invoke_id);
        match removed {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn has_pending_invoke(&self, invoke_id: InvokeId) -> bool {
        self.inner.state.lock().pending_invokes.contains_key(&invoke_id)
    }

    async fn on_invoke_timer(&self, invoke_id: InvokeId, generation: u64) {
        let _guard = self.inner.lock.lock().await;

        let expired = {
            let mut state = self.inner.state.lock();
            match state.pending_invokes.get(&invoke_id) {
                Some(pending) if pending.generation == generation => {
                    state.pending_invokes.remove(&invoke_id);
                    true
                }
                _ => false,
            }
        };
        if !expired {
            return;
        }

        if let Ok(provider) = self.provider() {
            provider.operation_timed_out(self, invoke_id);
        }
    }
}
