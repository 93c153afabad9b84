//! The transaction table: slot allocation, split reference counting and
//! retirement.

use crate::error::UploadError;
use crate::heap::spanning::{SpanningHeap, BLOCK_ALIGN};
use crate::locator::ResourceLocator;
use crate::metrics::{time_marker_now, Retirement, TimeMarker};
use crate::{TransactionId, TRANSACTION_ID_INVALID};
use futures_channel::oneshot;
use hal::ResourceDesc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

bitflags!(
    /// Options supplied when a transaction is begun.
    pub struct TransactionOptions: u32 {
        /// Retire before the next frame barrier, via the dedicated queue set.
        const FRAME_PRIORITY = 0x1;
    }
);

/// Result type every transaction promise resolves with.
pub type TransactionResult = Result<ResourceLocator, UploadError>;

// Client references occupy the high 8 bits, system references the low 24, so
// each side can retire its own holds without consulting the other.
const CLIENT_REF_UNIT: u32 = 1 << 24;
const SYSTEM_REF_MASK: u32 = CLIENT_REF_UNIT - 1;

/// Which side of the split reference count a guard holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefSide {
    /// Held by client-facing lookups.
    Client,
    /// Held by the assembly line's step chain.
    System,
}

fn ref_unit(side: RefSide) -> u32 {
    match side {
        RefSide::Client => CLIENT_REF_UNIT,
        RefSide::System => 1,
    }
}

/// Callback invoked when every transaction in a set has retired.
pub struct CompletionAttachment {
    remaining: Mutex<Vec<TransactionId>>,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CompletionAttachment {
    pub(crate) fn new(ids: Vec<TransactionId>, callback: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        Arc::new(CompletionAttachment {
            remaining: Mutex::new(ids),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn retire_one(&self, id: TransactionId) {
        let now_empty = {
            let mut remaining = self.remaining.lock();
            if let Some(pos) = remaining.iter().position(|&t| t == id) {
                remaining.swap_remove(pos);
            }
            remaining.is_empty()
        };
        if now_empty {
            if let Some(callback) = self.callback.lock().take() {
                callback();
            }
        }
    }
}

/// Mutable transaction state, guarded by the slot's own lock.
#[derive(Default)]
pub struct TransactionPayload {
    /// Target descriptor; filled in asynchronously for async sources.
    pub desc: Option<ResourceDesc>,
    /// When the transaction was begun.
    pub request_time: TimeMarker,
    /// Options it was begun with.
    pub creation_options: u32,
    /// The resource the transaction resolves to.
    pub final_resource: ResourceLocator,
    /// Promise completed exactly once with the final locator or an error.
    pub promise: Option<oneshot::Sender<TransactionResult>>,
    /// Attachment notified when this transaction (and its siblings) retire.
    pub completion_attachment: Option<Arc<CompletionAttachment>>,
}

/// One slot of the transaction table.
pub struct Transaction {
    heap_index: u32,
    id_top_part: AtomicU32,
    refs: AtomicU32,
    cancelled: AtomicBool,
    /// State mutated while the transaction is processed.
    pub payload: Mutex<TransactionPayload>,
}

impl Transaction {
    fn fresh(heap_index: u32) -> Arc<Self> {
        Arc::new(Transaction {
            heap_index,
            id_top_part: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            payload: Mutex::new(TransactionPayload::default()),
        })
    }

    /// Packed 64-bit identifier: generation in the high half, slot index in
    /// the low half.
    pub fn id(&self) -> TransactionId {
        (u64::from(self.id_top_part.load(Ordering::Acquire)) << 32) | u64::from(self.heap_index)
    }

    /// Whether the client cancelled this transaction.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Resolve the promise, if it has not resolved yet.
    pub fn fulfill(&self, result: TransactionResult) {
        let sender = self.payload.lock().promise.take();
        if let Some(sender) = sender {
            // the receiver may already be gone; that is not an error
            let _ = sender.send(result);
        }
    }

    fn add_ref(&self, side: RefSide) {
        self.refs.fetch_add(ref_unit(side), Ordering::AcqRel);
    }

    fn release_ref(&self, side: RefSide) -> u32 {
        let before = self.refs.fetch_sub(ref_unit(side), Ordering::AcqRel);
        debug_assert!(match side {
            RefSide::Client => before >= CLIENT_REF_UNIT,
            RefSide::System => before & SYSTEM_REF_MASK > 0,
        });
        before - ref_unit(side)
    }
}

struct TableSlots {
    transactions: Vec<Arc<Transaction>>,
    heap: SpanningHeap,
    next_id_top_part: u32,
}

/// The table itself: a never-shrinking slot vector paired with a spanning
/// heap that hands out one block per slot.
pub struct TransactionTable {
    slots: Mutex<TableSlots>,
    allocated_count: AtomicU32,
    pending_retirements: Mutex<Vec<Retirement>>,
}

const INITIAL_SLOTS: u32 = 2 * 1024;
// the spanning heap refuses to grow past this many slots
const MAX_SLOTS: u32 = 64 * 1024;

impl TransactionTable {
    /// An empty table with the initial slot reservation.
    pub fn new() -> Arc<Self> {
        let mut transactions = Vec::with_capacity(INITIAL_SLOTS as usize);
        for i in 0..INITIAL_SLOTS {
            transactions.push(Transaction::fresh(i));
        }
        Arc::new(TransactionTable {
            slots: Mutex::new(TableSlots {
                transactions,
                heap: SpanningHeap::new(INITIAL_SLOTS * BLOCK_ALIGN),
                next_id_top_part: 64,
            }),
            allocated_count: AtomicU32::new(0),
            pending_retirements: Mutex::new(Vec::with_capacity(64)),
        })
    }

    /// Allocate a slot and hand back a system reference to it.
    pub fn allocate(
        self: &Arc<Self>,
        options: TransactionOptions,
    ) -> Result<TransactionRef, UploadError> {
        let mut slots = self.slots.lock();

        if slots.heap.heap_size() + BLOCK_ALIGN > MAX_SLOTS * BLOCK_ALIGN {
            return Err(UploadError::TransactionHeapFull);
        }
        let id_top_part = slots.next_id_top_part;
        slots.next_id_top_part += 1;

        let offset = match slots.heap.allocate(BLOCK_ALIGN) {
            Some(offset) => offset,
            None => slots.heap.append_new_block(BLOCK_ALIGN),
        };
        let index = offset / BLOCK_ALIGN;
        while slots.transactions.len() <= index as usize {
            let i = slots.transactions.len() as u32;
            slots.transactions.push(Transaction::fresh(i));
        }

        let transaction = Arc::clone(&slots.transactions[index as usize]);
        debug_assert_eq!(transaction.refs.load(Ordering::Acquire), 0);
        transaction.id_top_part.store(id_top_part, Ordering::Release);
        transaction.cancelled.store(false, Ordering::Release);
        {
            let mut payload = transaction.payload.lock();
            *payload = TransactionPayload::default();
            payload.request_time = time_marker_now();
            payload.creation_options = options.bits();
        }
        self.allocated_count.fetch_add(1, Ordering::AcqRel);

        // take the reference before releasing the table lock
        Ok(TransactionRef::new(transaction, Arc::clone(self), RefSide::System))
    }

    /// Look up a live transaction, taking a client reference on it.
    pub fn get(self: &Arc<Self>, id: TransactionId) -> Option<TransactionRef> {
        let slots = self.slots.lock();
        let index = (id as u32) as usize;
        let top = (id >> 32) as u32;
        let transaction = slots.transactions.get(index)?;
        if transaction.id_top_part.load(Ordering::Acquire) != top || top == 0 {
            return None;
        }
        // only thread safe because some reference already exists on it
        debug_assert!(transaction.refs.load(Ordering::Acquire) > 0);
        Some(TransactionRef::new(
            Arc::clone(transaction),
            Arc::clone(self),
            RefSide::Client,
        ))
    }

    /// Mark transactions cancelled; processing observes the flag later.
    pub fn cancel(&self, ids: &[TransactionId]) {
        let slots = self.slots.lock();
        for &id in ids {
            debug_assert!(id != TRANSACTION_ID_INVALID);
            let index = (id as u32) as usize;
            if let Some(transaction) = slots.transactions.get(index) {
                if transaction.id_top_part.load(Ordering::Acquire) == (id >> 32) as u32 {
                    transaction.mark_cancelled();
                }
            }
        }
    }

    /// Run `f` over every live slot, under the table lock.
    pub fn for_each_live<F: FnMut(&Arc<Transaction>)>(&self, mut f: F) {
        let slots = self.slots.lock();
        for transaction in &slots.transactions {
            if transaction.refs.load(Ordering::Acquire) != 0 {
                f(transaction);
            }
        }
    }

    /// Install a completion attachment over the given ids; invoked
    /// immediately when all of them have already retired.
    pub fn attach_completion(&self, ids: &[TransactionId], callback: Box<dyn FnOnce() + Send>) {
        let slots = self.slots.lock();
        let mut live = Vec::with_capacity(ids.len());
        for &id in ids {
            debug_assert!(id != TRANSACTION_ID_INVALID);
            let index = (id as u32) as usize;
            if let Some(transaction) = slots.transactions.get(index) {
                if transaction.id_top_part.load(Ordering::Acquire) == (id >> 32) as u32 {
                    live.push((Arc::clone(transaction), id));
                }
            }
        }
        if live.is_empty() {
            drop(slots);
            callback();
            return;
        }
        let attachment =
            CompletionAttachment::new(live.iter().map(|(_, id)| *id).collect(), callback);
        for (transaction, _) in &live {
            let mut payload = transaction.payload.lock();
            debug_assert!(payload.completion_attachment.is_none());
            payload.completion_attachment = Some(Arc::clone(&attachment));
        }
    }

    /// Number of live transactions.
    pub fn allocated_count(&self) -> u32 {
        self.allocated_count.load(Ordering::Acquire)
    }

    /// Current size of the slot vector.
    pub fn slot_count(&self) -> u32 {
        self.slots.lock().transactions.len() as u32
    }

    /// Drain the retirement log accumulated since the last call.
    pub fn drain_retirements(&self) -> Vec<Retirement> {
        std::mem::take(&mut *self.pending_retirements.lock())
    }

    fn retire(&self, transaction: &Arc<Transaction>) {
        let id = transaction.id();
        {
            let mut payload = transaction.payload.lock();

            if let Some(desc) = payload.desc.take() {
                self.pending_retirements.lock().push(Retirement {
                    desc,
                    request_time: payload.request_time,
                    retirement_time: time_marker_now(),
                });
            }

            // dropping the locator releases any pool reference it held
            payload.final_resource = ResourceLocator::empty();

            if let Some(sender) = payload.promise.take() {
                let _ = sender.send(Err(UploadError::Aborted));
            }

            let attachment = payload.completion_attachment.take();
            *payload = TransactionPayload::default();
            drop(payload);

            if let Some(attachment) = attachment {
                attachment.retire_one(id);
            }
        }

        self.allocated_count.fetch_sub(1, Ordering::AcqRel);

        let mut slots = self.slots.lock();
        transaction.id_top_part.store(0, Ordering::Release);
        let ok = slots
            .heap
            .deallocate(transaction.heap_index * BLOCK_ALIGN, BLOCK_ALIGN);
        debug_assert!(ok);
    }
}

/// Reference-counted handle to a transaction slot. Dropping releases the
/// reference; when the last reference of either side goes, the slot retires
/// and becomes reusable.
pub struct TransactionRef {
    transaction: Arc<Transaction>,
    table: Arc<TransactionTable>,
    side: RefSide,
}

impl TransactionRef {
    fn new(transaction: Arc<Transaction>, table: Arc<TransactionTable>, side: RefSide) -> Self {
        transaction.add_ref(side);
        TransactionRef {
            transaction,
            table,
            side,
        }
    }

    /// The transaction the reference points at.
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// The packed transaction id.
    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Release the reference after the transaction completed its work. Same
    /// counting as dropping the guard; the name records intent at call sites.
    pub fn successful_retirement(self) {
        drop(self);
    }
}

impl Clone for TransactionRef {
    fn clone(&self) -> Self {
        TransactionRef::new(Arc::clone(&self.transaction), Arc::clone(&self.table), self.side)
    }
}

impl Drop for TransactionRef {
    fn drop(&mut self) {
        if self.transaction.release_ref(self.side) == 0 {
            self.table.retire(&self.transaction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_executor::block_on;

    #[test]
    fn slot_generation_changes_on_reuse() {
        let table = TransactionTable::new();
        let first = table.allocate(TransactionOptions::empty()).unwrap();
        let first_id = first.id();
        drop(first);
        let second = table.allocate(TransactionOptions::empty()).unwrap();
        // the heap hands back the same slot with a fresh generation
        assert_eq!(first_id as u32, second.id() as u32);
        assert_ne!(first_id, second.id());
        assert!(table.get(first_id).is_none());
        assert!(table.get(second.id()).is_some());
    }

    #[test]
    fn abort_fails_pending_promise() {
        let table = TransactionTable::new();
        let reference = table.allocate(TransactionOptions::empty()).unwrap();
        let (sender, receiver) = oneshot::channel();
        reference.transaction().payload.lock().promise = Some(sender);
        drop(reference);
        let result = block_on(receiver).unwrap();
        assert!(matches!(result, Err(UploadError::Aborted)));
    }

    #[test]
    fn completion_attachment_fires_after_all_retire() {
        let table = TransactionTable::new();
        let a = table.allocate(TransactionOptions::empty()).unwrap();
        let b = table.allocate(TransactionOptions::empty()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        table.attach_completion(
            &[a.id(), b.id()],
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        drop(a);
        assert!(!fired.load(Ordering::SeqCst));
        drop(b);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn attachment_on_retired_ids_fires_immediately() {
        let table = TransactionTable::new();
        let a = table.allocate(TransactionOptions::empty()).unwrap();
        let id = a.id();
        drop(a);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        table.attach_completion(&[id], Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_flags_live_transactions_only() {
        let table = TransactionTable::new();
        let a = table.allocate(TransactionOptions::empty()).unwrap();
        let stale = a.id();
        table.cancel(&[stale]);
        assert!(a.transaction().is_cancelled());
        drop(a);
        // stale id after retirement: no effect, no panic
        table.cancel(&[stale]);
    }

    #[test]
    fn split_refcount_keeps_slot_alive_for_either_side() {
        let table = TransactionTable::new();
        let system = table.allocate(TransactionOptions::empty()).unwrap();
        let id = system.id();
        let client = table.get(id).unwrap();
        assert_eq!(client.side, RefSide::Client);
        drop(system);
        // client ref still holds the slot
        assert!(table.get(id).is_some());
        drop(client);
        assert!(table.get(id).is_none());
    }
}
