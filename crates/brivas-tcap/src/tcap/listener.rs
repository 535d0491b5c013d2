//! TC-user indications and listener fan-out

use super::dialog::{Dialog, InvokeId};
use super::messages::{AbortCause, ComponentPortion, DialogPortion};
use crate::sccp::SccpAddress;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// TC-QUERY indication
#[derive(Debug, Clone)]
pub struct QueryIndication {
    pub dialog: Dialog,
    pub with_permission: bool,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// TC-CONVERSATION indication
#[derive(Debug, Clone)]
pub struct ConversationIndication {
    pub dialog: Dialog,
    pub with_permission: bool,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// TC-RESPONSE indication
#[derive(Debug, Clone)]
pub struct ResponseIndication {
    pub dialog: Dialog,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// TC-P-ABORT / TC-U-ABORT indication
#[derive(Debug, Clone)]
pub struct AbortIndication {
    pub dialog: Dialog,
    pub cause: AbortCause,
    pub dialog_portion: Option<DialogPortion>,
}

/// TC-UNI indication
#[derive(Debug, Clone)]
pub struct UniIndication {
    pub dialog: Dialog,
    pub dialog_portion: Option<DialogPortion>,
    pub components: Option<ComponentPortion>,
}

/// TC-NOTICE indication (returned message)
#[derive(Debug, Clone)]
pub struct NoticeIndication {
    /// Dialog the returned message belonged to, if it is still known
    pub dialog: Option<Dialog>,
    pub local_address: SccpAddress,
    pub remote_address: SccpAddress,
    pub report_cause: u8,
}

/// TC-user callbacks
///
/// Every method defaults to a no-op. An `Err` (or a panic) is logged by
/// the provider and never interrupts delivery to the other listeners.
#[allow(unused_variables)]
pub trait TcListener: Send + Sync {
    fn on_query(&self, ind: &QueryIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_conversation(&self, ind: &ConversationIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_response(&self, ind: &ResponseIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_abort(&self, ind: &AbortIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_uni(&self, ind: &UniIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_notice(&self, ind: &NoticeIndication) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_dialog_released(&self, dialog: &Dialog) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_invoke_timeout(&self, dialog: &Dialog, invoke_id: InvokeId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One failed delivery
#[derive(Debug)]
pub struct DeliveryFailure {
    /// Position of the listener in registration order
    pub index: usize,
    pub error: anyhow::Error,
}

/// Ordered listener set, safe to modify while a delivery is running
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn TcListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns false if it was already present
    pub fn add(&self, listener: Arc<dyn TcListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Arc<dyn TcListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke `f` on every listener, collecting failures instead of stopping
    pub fn deliver<F>(&self, f: F) -> Vec<DeliveryFailure>
    where
        F: Fn(&dyn TcListener) -> anyhow::Result<()>,
    {
        // Snapshot so callbacks may add/remove listeners
        let snapshot: Vec<Arc<dyn TcListener>> = self.listeners.read().clone();

        let mut failures = Vec::new();
        for (index, listener) in snapshot.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(payload) => anyhow::anyhow!("listener panicked: {}", panic_message(payload.as_ref())),
            };
            failures.push(DeliveryFailure { index, error });
        }
        failures
    }
}

/// Log every failure of one delivery round
pub fn log_failures(event: &'static str, failures: Vec<DeliveryFailure>) {
    for failure in failures {
        error!(
            event,
            listener = failure.index,
            error = %failure.error,
            "Received exception while delivering event to TC listener"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
