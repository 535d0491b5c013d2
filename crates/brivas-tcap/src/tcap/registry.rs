//! Normal-mode dialog registry

use super::allocator::IdAllocator;
use super::dialog::Dialog;
use crate::errors::{Result, TcapError};
use crate::types::TransactionId;
use metrics::gauge;
use parking_lot::Mutex;
use std::collections::HashMap;

struct RegistryState {
    allocator: IdAllocator,
    dialogs: HashMap<TransactionId, Dialog>,
}

/// Live structured dialogs keyed by local transaction id
///
/// Allocation and insertion share one critical section, so two callers
/// can never claim the same id.
pub struct DialogRegistry {
    state: Mutex<RegistryState>,
    max_dialogs: usize,
}

impl DialogRegistry {
    pub fn new(allocator: IdAllocator, max_dialogs: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                allocator,
                dialogs: HashMap::new(),
            }),
            max_dialogs,
        }
    }

    pub fn max_dialogs(&self) -> usize {
        self.max_dialogs
    }

    /// Allocate an id (or claim `preferred`) and register the dialog `build` returns
    pub fn create<F>(&self, preferred: Option<TransactionId>, build: F) -> Result<Dialog>
    where
        F: FnOnce(TransactionId) -> Dialog,
    {
        let mut state = self.state.lock();

        let id = match preferred {
            Some(id) => {
                if state.dialogs.len() >= self.max_dialogs {
                    return Err(TcapError::CapacityExceeded {
                        max: self.max_dialogs,
                    });
                }
                if state.dialogs.contains_key(&id) {
                    return Err(TcapError::IdAlreadyInUse(id));
                }
                id
            }
            None => {
                let RegistryState { allocator, dialogs } = &mut *state;
                allocator.next_id(dialogs.len(), self.max_dialogs, |id| dialogs.contains_key(&id))?
            }
        };

        let dialog = build(id);
        state.dialogs.insert(id, dialog.clone());
        gauge!("tcap_dialogs_live").set(state.dialogs.len() as f64);
        Ok(dialog)
    }

    /// Id for a dialog that is never registered
    pub fn allocate_transient(&self) -> Result<TransactionId> {
        let mut state = self.state.lock();
        let RegistryState { allocator, dialogs } = &mut *state;
        allocator.next_id(0, 1, |id| dialogs.contains_key(&id))
    }

    /// Whether `id` is free for a caller-chosen dialog
    pub fn is_available(&self, id: TransactionId) -> bool {
        !self.state.lock().dialogs.contains_key(&id)
    }

    pub fn lookup(&self, id: TransactionId) -> Option<Dialog> {
        self.state.lock().dialogs.get(&id).cloned()
    }

    /// Remove `dialog` if it is still the one registered under its id
    pub fn remove(&self, dialog: &Dialog) -> bool {
        let mut state = self.state.lock();
        let id = dialog.local_id();
        let owned = state
            .dialogs
            .get(&id)
            .map(|d| d.ptr_eq(dialog))
            .unwrap_or(false);
        if owned {
            state.dialogs.remove(&id);
            gauge!("tcap_dialogs_live").set(state.dialogs.len() as f64);
        }
        owned
    }

    pub fn len(&self) -> usize {
        self.state.lock().dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all dialogs without notifications
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.dialogs.clear();
        gauge!("tcap_dialogs_live").set(0.0);
    }
}
