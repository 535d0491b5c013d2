//! Passive-monitoring (preview) correlation
//!
//! A monitor sees both legs of a dialog without taking part in it. The
//! query leg is indexed by the calling party (key1); the first reply seen
//! binds the opposite party as key2, so either direction finds the same
//! record afterwards. Records whose second leg never shows up are dropped
//! by an idle timer.

use super::allocator::IdAllocator;
use super::messages::{ApplicationContext, ComponentPortion, DialogPortion};
use super::timer::TimerHandle;
use crate::errors::{Result, TcapError};
use crate::sccp::{SccpAddress, SccpDataMessage};
use crate::types::{PointCode, SeqControl, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// How the observed peer was identified
///
/// GT digits and point codes are only compared like-with-like.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerIdentity {
    Digits(String),
    PointCode(PointCode),
}

/// Correlation fingerprint of one observed side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewDialogDataKey {
    pub peer: PeerIdentity,
    pub ssn: u8,
    pub transaction_id: TransactionId,
}

impl PreviewDialogDataKey {
    /// Digits win over the point code when both are known
    pub fn new(point_code: PointCode, digits: Option<&str>, ssn: u8, transaction_id: TransactionId) -> Self {
        let peer = match digits {
            Some(d) => PeerIdentity::Digits(d.to_string()),
            None => PeerIdentity::PointCode(point_code),
        };
        Self {
            peer,
            ssn,
            transaction_id,
        }
    }

    /// Key of the called side (MTP3 DPC + called party)
    pub fn called(message: &SccpDataMessage, transaction_id: TransactionId) -> Self {
        Self::new(
            message.incoming_dpc,
            message.called_party.gt_digits(),
            message.called_party.ssn(),
            transaction_id,
        )
    }

    /// Key of the calling side (MTP3 OPC + calling party)
    pub fn calling(message: &SccpDataMessage, transaction_id: TransactionId) -> Self {
        Self::new(
            message.incoming_opc,
            message.calling_party.gt_digits(),
            message.calling_party.ssn(),
            transaction_id,
        )
    }
}

#[derive(Debug)]
struct RecordState {
    key1: PreviewDialogDataKey,
    key2: Option<PreviewDialogDataKey>,
    last_application_context: Option<ApplicationContext>,
    operations_sent_a: usize,
    operations_sent_b: usize,
    idle_generation: u64,
    idle_timer: Option<TimerHandle>,
}

/// Shared record of one observed dialog
#[derive(Debug)]
pub struct PreviewDialogData {
    handle: u64,
    local_id: TransactionId,
    local_address: SccpAddress,
    remote_address: SccpAddress,
    seq_control: SeqControl,
    state: Mutex<RecordState>,
}

impl PreviewDialogData {
    /// Synthetic local id
    pub fn local_id(&self) -> TransactionId {
        self.local_id
    }

    pub(crate) fn handle(&self) -> u64 {
        self.handle
    }

    pub fn key1(&self) -> PreviewDialogDataKey {
        self.state.lock().key1.clone()
    }

    pub fn key2(&self) -> Option<PreviewDialogDataKey> {
        self.state.lock().key2.clone()
    }

    pub fn last_application_context(&self) -> Option<ApplicationContext> {
        self.state.lock().last_application_context.clone()
    }

    /// Invokes seen from the query originator
    pub fn operations_sent_a(&self) -> usize {
        self.state.lock().operations_sent_a
    }

    /// Invokes seen from the responder
    pub fn operations_sent_b(&self) -> usize {
        self.state.lock().operations_sent_b
    }

    /// Addresses of the first observation
    pub fn addresses(&self) -> (&SccpAddress, &SccpAddress) {
        (&self.local_address, &self.remote_address)
    }

    pub fn seq_control(&self) -> SeqControl {
        self.seq_control
    }

    /// Fold one observed message into the record
    pub(crate) fn note_message(
        &self,
        side_b: bool,
        dialog_portion: Option<&DialogPortion>,
        components: Option<&ComponentPortion>,
    ) {
        let mut state = self.state.lock();
        if let Some(acn) = dialog_portion.and_then(|dp| dp.application_context.clone()) {
            state.last_application_context = Some(acn);
        }
        let invokes = components.map(ComponentPortion::invoke_count).unwrap_or(0);
        if side_b {
            state.operations_sent_b += invokes;
        } else {
            state.operations_sent_a += invokes;
        }
    }

    pub(crate) fn idle_generation(&self) -> u64 {
        self.state.lock().idle_generation
    }

    /// Install the timer of `generation`, cancelling the one it replaces
    pub(crate) fn set_idle_timer(&self, generation: u64, timer: TimerHandle) {
        let mut state = self.state.lock();
        if state.idle_generation != generation {
            timer.cancel();
            return;
        }
        if let Some(old) = state.idle_timer.replace(timer) {
            old.cancel();
        }
    }

    pub(crate) fn stop_idle_timer(&self) {
        let mut state = self.state.lock();
        state.idle_generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
    }
}

struct PreviewTable {
    allocator: IdAllocator,
    next_handle: u64,
    records: HashMap<u64, Arc<PreviewDialogData>>,
    index: HashMap<PreviewDialogDataKey, u64>,
}

impl PreviewTable {
    fn unlink(&mut self, record: &PreviewDialogData) {
        let (key1, key2) = {
            let state = record.state.lock();
            (state.key1.clone(), state.key2.clone())
        };
        for key in std::iter::once(key1).chain(key2) {
            // The slot may already belong to a newer record
            if self.index.get(&key) == Some(&record.handle) {
                self.index.remove(&key);
            }
        }
        self.records.remove(&record.handle);
    }
}

/// Result of a correlation hit
#[derive(Debug)]
pub struct PreviewMatch {
    pub record: Arc<PreviewDialogData>,
    /// The message came from the side that answered the query
    pub side_b: bool,
    /// Idle period started by this hit
    pub idle_generation: u64,
}

/// Idle generation of a freshly created record
pub(crate) const FIRST_IDLE_GENERATION: u64 = 1;

/// Dual-key registry of preview records
pub struct PreviewRegistry {
    table: Mutex<PreviewTable>,
    max_records: usize,
}

impl PreviewRegistry {
    pub fn new(range_start: u32, range_end: u32, max_records: usize) -> Self {
        Self {
            table: Mutex::new(PreviewTable {
                allocator: IdAllocator::new(range_start, range_end),
                next_handle: 0,
                records: HashMap::new(),
                index: HashMap::new(),
            }),
            max_records,
        }
    }

    /// Create a record on the first observation of a dialog-opening message
    ///
    /// A live record already indexed under `key` is torn down and the call
    /// fails with `DuplicateKeyCollision`. The new record starts in idle
    /// generation 1; its idle timer must be armed with that generation.
    pub fn create(
        &self,
        key: PreviewDialogDataKey,
        local_address: SccpAddress,
        remote_address: SccpAddress,
        seq_control: SeqControl,
    ) -> Result<Arc<PreviewDialogData>> {
        let mut table = self.table.lock();

        if table.records.len() >= self.max_records {
            return Err(TcapError::CapacityExceeded {
                max: self.max_records,
            });
        }

        if let Some(stale) = table.index.get(&key).and_then(|h| table.records.get(h)).cloned() {
            table.unlink(&stale);
            stale.stop_idle_timer();
            return Err(TcapError::DuplicateKeyCollision(key.transaction_id));
        }

        let local_id = table.allocator.next_unchecked();
        table.next_handle += 1;
        let handle = table.next_handle;

        let record = Arc::new(PreviewDialogData {
            handle,
            local_id,
            local_address,
            remote_address,
            seq_control,
            state: Mutex::new(RecordState {
                key1: key.clone(),
                key2: None,
                last_application_context: None,
                operations_sent_a: 0,
                operations_sent_b: 0,
                idle_generation: FIRST_IDLE_GENERATION,
                idle_timer: None,
            }),
        });

        table.index.insert(key, handle);
        table.records.insert(handle, record.clone());
        Ok(record)
    }

    /// Find the record for an observed message
    ///
    /// Tries `key1` then `key2`. On a hit with an empty second slot and a
    /// second candidate, the candidate for the opposite side is bound as
    /// key2. A hit starts a new idle period before the table lock is
    /// released, so a timer armed earlier can no longer expire the record.
    pub fn correlate(
        &self,
        key1: &PreviewDialogDataKey,
        key2: Option<&PreviewDialogDataKey>,
    ) -> Option<PreviewMatch> {
        let mut table = self.table.lock();

        let handle = table
            .index
            .get(key1)
            .or_else(|| key2.and_then(|k| table.index.get(k)))
            .copied()?;
        let record = table.records.get(&handle)?.clone();

        let (side_b, bound, idle_generation) = {
            let mut state = record.state.lock();
            state.idle_generation += 1;
            let side_b = state.key1 == *key1;
            let bound = match (state.key2.is_none(), key2) {
                (true, Some(k2)) => {
                    let other = if side_b { k2.clone() } else { key1.clone() };
                    state.key2 = Some(other.clone());
                    Some(other)
                }
                _ => None,
            };
            (side_b, bound, state.idle_generation)
        };

        if let Some(key) = bound {
            table.index.insert(key, handle);
        }
        Some(PreviewMatch {
            record,
            side_b,
            idle_generation,
        })
    }

    /// Remove a record and both its index entries; returns false if already gone
    pub fn remove(&self, record: &PreviewDialogData) -> bool {
        let removed = {
            let mut table = self.table.lock();
            if table.records.contains_key(&record.handle) {
                table.unlink(record);
                true
            } else {
                false
            }
        };
        record.stop_idle_timer();
        removed
    }

    /// Remove a record whose idle timer of `generation` fired
    ///
    /// Returns `None` if the record is gone or its timer was restarted.
    pub fn expire(&self, handle: u64, generation: u64) -> Option<Arc<PreviewDialogData>> {
        let mut table = self.table.lock();
        let record = table.records.get(&handle)?.clone();
        if record.idle_generation() != generation {
            return None;
        }
        table.unlink(&record);
        Some(record)
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.table.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of index entries (one or two per record)
    pub fn key_count(&self) -> usize {
        self.table.lock().index.len()
    }

    pub fn contains_key(&self, key: &PreviewDialogDataKey) -> bool {
        self.table.lock().index.contains_key(key)
    }

    /// Drop everything without release notifications
    pub fn clear(&self) {
        let records: Vec<Arc<PreviewDialogData>> = {
            let mut table = self.table.lock();
            table.index.clear();
            table.records.drain().map(|(_, r)| r).collect()
        };
        for record in records {
            record.stop_idle_timer();
        }
    }
}
