//! The batched allocator: many small buffers packed into large device pages,
//! with reference-counted ranges and live defragmentation.

use crate::heap::{ReferenceCountingLayer, SpanningHeap};
use crate::locator::{ResourceLocator, ResourcePool};
use crate::{CommandListId, Manager, RepositionMarker};
use hal::{
    AllocationRules, BindFlags, Device, RepositionStep, Resource, ResourceDesc,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Identifies one published reposition event.
pub type EventListId = u32;

const EVENT_LIST_ID_INVALID: EventListId = !0;
const EVENT_BUFFER_COUNT: usize = 4;

/// Tuning for the batched allocator; the defragmentation thresholds default
/// to the measured values but are deliberately adjustable.
#[derive(Clone, Debug)]
pub struct BatchedPagesConfig {
    /// Size of each device page in bytes.
    pub page_size: u32,
    /// Bind flags shared by everything allocated from this pool (transfer
    /// flags are added automatically).
    pub bind_flags: BindFlags,
    /// A page is a defrag candidate only when its largest free block is
    /// smaller than `page_size / largest_block_threshold_divisor`.
    pub largest_block_threshold_divisor: u32,
    /// Minimum `(free - largest)` weight before any defrag happens, as
    /// `page_size / min_weight_divisor`.
    pub min_weight_divisor: u32,
    /// The free space must be at least this many times the largest free
    /// block, so compacting at least multiplies the largest block by it.
    pub free_to_largest_ratio: u32,
}

impl Default for BatchedPagesConfig {
    fn default() -> Self {
        BatchedPagesConfig {
            page_size: 256 * 1024,
            bind_flags: BindFlags::VERTEX_BUFFER | BindFlags::INDEX_BUFFER,
            largest_block_threshold_divisor: 8,
            min_weight_divisor: 8,
            free_to_largest_ratio: 2,
        }
    }
}

bitflags!(
    /// Answers from `is_batched_resource` / `validate`.
    pub struct BatchedResultFlags: u32 {
        /// The resource is one of this allocator's pages.
        const IS_BATCHED = 0x1;
        /// The resource is currently the source of an active reposition.
        const ACTIVE_REPOSITION = 0x2;
    }
);

/// Per-page metrics.
#[derive(Clone, Debug, Default)]
pub struct BatchedHeapMetrics {
    /// Free-span markers, `(start, end)` flattened.
    pub markers: Vec<u32>,
    /// Bytes allocated in the page.
    pub allocated_space: u64,
    /// Bytes free in the page.
    pub unallocated_space: u64,
    /// The page size.
    pub heap_size: u64,
    /// Largest free span.
    pub largest_free_block: u64,
    /// Bytes covered by the reference-counting layer.
    pub space_in_ref_counted_blocks: u64,
    /// Number of reference-counted ranges.
    pub ref_counted_block_count: u64,
}

/// Whole-allocator metrics.
#[derive(Clone, Debug, Default)]
pub struct BatchingSystemMetrics {
    /// One entry per live page.
    pub heaps: Vec<BatchedHeapMetrics>,
    /// Device creations since the last metrics poll.
    pub recent_device_create_count: u32,
    /// Device creations since startup.
    pub total_device_create_count: u64,
}

/// A completed defragmentation, broadcast so clients can re-point their
/// locators from the old resource to the new one.
pub struct ResourceReposition {
    /// The page the ranges moved out of.
    pub original_resource: Arc<dyn Resource>,
    /// The resource the ranges moved into.
    pub new_resource: Arc<dyn Resource>,
    /// The pool both resources belong to.
    pub pool: Arc<dyn ResourcePool>,
    /// Marker identifying the pool page, carried into rewritten locators.
    pub pool_marker: u64,
    /// The moved spans, in source address order.
    pub steps: Vec<RepositionStep>,
}

impl ResourceReposition {
    /// Map an offset in the original resource to its new location; `None`
    /// when no step covers it.
    pub fn resolve_offset(&self, offset: u32, size: u32) -> Option<u32> {
        for s in &self.steps {
            if offset >= s.source_start && offset < s.source_end {
                debug_assert!(offset + size <= s.source_end);
                return Some(offset + s.destination - s.source_start);
            }
        }
        None
    }
}

struct EventSlot {
    id: AtomicU32,
    event: Mutex<Option<Arc<ResourceReposition>>>,
    client_references: AtomicU32,
}

impl EventSlot {
    fn new() -> Self {
        EventSlot {
            id: AtomicU32::new(EVENT_LIST_ID_INVALID),
            event: Mutex::new(None),
            client_references: AtomicU32::new(0),
        }
    }
}

/// Small ring of reposition events: one writer, any number of readers
/// holding per-slot references while they inspect.
struct EventListManager {
    slots: [EventSlot; EVENT_BUFFER_COUNT],
    current_id: AtomicU32,
    published_id: AtomicU32,
    processed_id: AtomicU32,
    writing_index: Mutex<usize>,
}

impl EventListManager {
    fn new() -> Self {
        EventListManager {
            slots: [
                EventSlot::new(),
                EventSlot::new(),
                EventSlot::new(),
                EventSlot::new(),
            ],
            current_id: AtomicU32::new(0),
            published_id: AtomicU32::new(0),
            processed_id: AtomicU32::new(0),
            writing_index: Mutex::new(0),
        }
    }

    fn publish(&self, event: Arc<ResourceReposition>) -> EventListId {
        let mut index = self.writing_index.lock();
        let slot = &self.slots[*index];
        // never overwrite a slot a client is still reading; the ring is
        // sized so this only happens when clients stop consuming events
        if slot.client_references.load(Ordering::Acquire) != 0 {
            debug_assert!(false, "reposition event ring full; clients are not consuming events");
            log::error!("reposition event ring full; dropping event");
            return EVENT_LIST_ID_INVALID;
        }
        let id = self.current_id.fetch_add(1, Ordering::AcqRel) + 1;
        *slot.event.lock() = Some(event);
        slot.id.store(id, Ordering::Release);
        *index = (*index + 1) % EVENT_BUFFER_COUNT;
        self.published_id.store(id, Ordering::Release);
        id
    }

    fn get(&self, id: EventListId) -> Option<Arc<ResourceReposition>> {
        if id == 0 || id == EVENT_LIST_ID_INVALID {
            return None;
        }
        for slot in &self.slots {
            if slot.id.load(Ordering::Acquire) == id {
                slot.client_references.fetch_add(1, Ordering::AcqRel);
                // check again: the reference acts as the lock against
                // overwrite, but the slot may have turned over just now
                if slot.id.load(Ordering::Acquire) == id {
                    return slot.event.lock().clone();
                }
                slot.client_references.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        }
        None
    }

    fn release(&self, id: EventListId, silent: bool) {
        if id == 0 || id == EVENT_LIST_ID_INVALID {
            return;
        }
        for slot in &self.slots {
            if slot.id.load(Ordering::Acquire) == id {
                let before = slot.client_references.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(before > 0);
                if !silent {
                    self.processed_id.fetch_max(id, Ordering::AcqRel);
                }
                return;
            }
        }
    }
}

struct PageState {
    heap: SpanningHeap,
    refs: ReferenceCountingLayer,
    hash_last_defrag: u64,
}

struct Page {
    resource: Arc<dyn Resource>,
    state: Mutex<PageState>,
    locked_for_defrag: AtomicBool,
}

impl Page {
    fn new(resource: Arc<dyn Resource>, size: u32) -> Arc<Self> {
        Arc::new(Page {
            resource,
            state: Mutex::new(PageState {
                heap: SpanningHeap::new(size),
                refs: ReferenceCountingLayer::new(size),
                hash_last_defrag: 0,
            }),
            locked_for_defrag: AtomicBool::new(false),
        })
    }

    fn validate_refs_and_heap(&self, state: &PageState) {
        // the two layers must agree except while a defrag delays deallocation
        if cfg!(debug_assertions) && !self.locked_for_defrag.load(Ordering::Acquire) {
            debug_assert_eq!(state.heap.allocated_space(), state.refs.referenced_space());
        }
    }
}

struct ActiveReposition {
    event_id: Option<EventListId>,
    dst_uberblock: ResourceLocator,
    src_page: Arc<Page>,
    steps: Vec<RepositionStep>,
    future: RepositionMarker,
    reposition_cmd_list: Option<CommandListId>,
}

impl ActiveReposition {
    fn is_complete(&self, processed: EventListId) -> bool {
        matches!(self.event_id, Some(id) if processed >= id)
    }
}

/// Packs small buffers of one bind-flag class into large shared pages.
pub struct BatchedPages {
    device: Arc<dyn Device>,
    prototype: ResourceDesc,
    config: BatchedPagesConfig,
    pages: RwLock<Vec<Arc<Page>>>,
    active_defrag: Mutex<Option<ActiveReposition>>,
    manager: RwLock<Weak<dyn Manager>>,
    events: EventListManager,
    recent_device_create_count: AtomicU32,
    total_create_count: AtomicU64,
    tick_thread: Mutex<Option<ThreadId>>,
    self_weak: Weak<BatchedPages>,
}

impl BatchedPages {
    /// Create an allocator for the given device and configuration.
    pub fn new(device: Arc<dyn Device>, config: BatchedPagesConfig) -> Arc<Self> {
        let prototype = ResourceDesc::linear_buffer(
            config.bind_flags | BindFlags::TRANSFER_DST | BindFlags::TRANSFER_SRC,
            AllocationRules::empty(),
            config.page_size,
            "batched-resources",
        );
        Arc::new_cyclic(|self_weak| BatchedPages {
            device,
            prototype,
            config,
            pages: RwLock::new(Vec::new()),
            active_defrag: Mutex::new(None),
            manager: RwLock::new(Weak::<crate::manager::UploadsManager>::new()),
            events: EventListManager::new(),
            recent_device_create_count: AtomicU32::new(0),
            total_create_count: AtomicU64::new(0),
            tick_thread: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// Bind the manager whose transfer queue performs the reposition copies.
    pub fn bind_manager(&self, manager: Weak<dyn Manager>) {
        *self.manager.write() = manager;
    }

    /// The descriptor pages are created with.
    pub fn prototype(&self) -> &ResourceDesc {
        &self.prototype
    }

    fn find_page(&self, resource: &Arc<dyn Resource>) -> Option<Arc<Page>> {
        let pages = self.pages.read();
        pages
            .iter()
            .rev()
            .find(|p| Arc::ptr_eq(&p.resource, resource))
            .cloned()
    }

    /// Whether `resource` is one of this allocator's pages.
    pub fn is_batched_resource(&self, resource: &Arc<dyn Resource>) -> BatchedResultFlags {
        match self.find_page(resource) {
            Some(page) => {
                let mut flags = BatchedResultFlags::IS_BATCHED;
                if page.locked_for_defrag.load(Ordering::Acquire) {
                    flags |= BatchedResultFlags::ACTIVE_REPOSITION;
                }
                flags
            }
            None => BatchedResultFlags::empty(),
        }
    }

    /// Debug validation of a locator against the page bookkeeping.
    pub fn validate(&self, locator: &ResourceLocator) -> BatchedResultFlags {
        let resource = match locator.containing_resource() {
            Some(r) => r,
            None => return BatchedResultFlags::empty(),
        };
        match self.find_page(resource) {
            Some(page) => {
                let (start, end) = locator.range_in_containing_resource();
                let state = page.state.lock();
                debug_assert!(state.refs.validate_block(start as u32, (end - start) as u32));
                BatchedResultFlags::IS_BATCHED
            }
            None => BatchedResultFlags::empty(),
        }
    }

    /// Per-page and whole-system metrics.
    pub fn calculate_metrics(&self) -> BatchingSystemMetrics {
        let pages = self.pages.read();
        let mut result = BatchingSystemMetrics {
            heaps: Vec::with_capacity(pages.len()),
            recent_device_create_count: self.recent_device_create_count.swap(0, Ordering::AcqRel),
            total_device_create_count: self.total_create_count.load(Ordering::Acquire),
        };
        for page in pages.iter() {
            let state = page.state.lock();
            result.heaps.push(BatchedHeapMetrics {
                markers: state.heap.metrics_markers(),
                allocated_space: u64::from(state.heap.allocated_space()),
                unallocated_space: u64::from(state.heap.available_space()),
                heap_size: u64::from(state.heap.heap_size()),
                largest_free_block: u64::from(state.heap.largest_free_block()),
                space_in_ref_counted_blocks: u64::from(state.refs.referenced_space()),
                ref_counted_block_count: state.refs.entry_count() as u64,
            });
        }
        result
    }

    fn create_page(&self, name: &str) -> Option<Arc<Page>> {
        let mut desc = self.prototype.clone();
        desc.name = name.to_owned().into();
        let resource = match self.device.create_resource(&desc, None) {
            Ok(resource) => resource,
            Err(e) => {
                log::warn!("batched page creation failed: {}", e);
                return None;
            }
        };
        self.recent_device_create_count.fetch_add(1, Ordering::AcqRel);
        self.total_create_count.fetch_add(1, Ordering::AcqRel);
        Some(Page::new(resource, self.config.page_size))
    }

    fn allocate_inner(&self, size: u32, name: &str) -> ResourceLocator {
        if size > self.prototype.byte_count() || size == 0 {
            return ResourceLocator::empty();
        }

        {
            let pages = self.pages.read();
            // newest first; pick the page whose largest free block is the
            // tightest fit, to keep fragmentation down
            let mut best: Option<(&Arc<Page>, u32)> = None;
            for page in pages.iter().rev() {
                if page.locked_for_defrag.load(Ordering::Acquire) {
                    continue;
                }
                let largest = page.state.lock().heap.largest_free_block();
                if largest >= size && best.map_or(true, |(_, b)| largest < b) {
                    best = Some((page, largest));
                }
            }
            if let Some((page, _)) = best {
                let mut state = page.state.lock();
                if let Some(offset) = state.heap.allocate(size) {
                    debug_assert!(offset + size <= self.prototype.byte_count());
                    // take the reference now, avoiding a second page lookup
                    // when the locator is built
                    state.refs.add_ref(offset, size);
                    drop(state);
                    let pool: Weak<dyn ResourcePool> = self.self_weak.clone();
                    return ResourceLocator::pooled(
                        Arc::clone(&page.resource),
                        u64::from(offset),
                        u64::from(size),
                        pool,
                        0,
                        true,
                    );
                }
            }
        }

        let page = match self.create_page(name) {
            Some(page) => page,
            None => return ResourceLocator::empty(),
        };
        let offset = {
            let mut state = page.state.lock();
            let offset = state.heap.allocate(size).expect("fresh page fits allocation");
            state.refs.add_ref(offset, size);
            offset
        };
        let resource = Arc::clone(&page.resource);
        self.pages.write().push(page);

        let pool: Weak<dyn ResourcePool> = self.self_weak.clone();
        ResourceLocator::pooled(resource, u64::from(offset), u64::from(size), pool, 0, true)
    }

    fn release_inner(&self, resource: &Arc<dyn Resource>, offset: u32, size: u32) {
        let page = match self.find_page(resource) {
            Some(page) => page,
            None => {
                debug_assert!(false, "release of a resource this pool does not own");
                return;
            }
        };

        let became_empty = {
            let mut state = page.state.lock();
            let (primary, others) = state.refs.release(offset, size);
            if primary == 0 {
                if others == 0 {
                    // simple case: the whole block is gone
                    let ok = state.heap.deallocate(offset, size);
                    debug_assert!(ok);
                } else {
                    // the uberblock case: this range umbrellas smaller live
                    // ranges (a defrag destination); free only the gaps
                    // between what remains referenced
                    let end = offset + size;
                    let mut cursor = offset;
                    let mut i = 0;
                    while i < state.refs.entry_count() {
                        let e = state.refs.entry(i);
                        if e.start + e.size > offset {
                            break;
                        }
                        i += 1;
                    }
                    let mut gaps: Vec<(u32, u32)> = Vec::new();
                    while i < state.refs.entry_count() {
                        let e = state.refs.entry(i);
                        if e.start >= end {
                            break;
                        }
                        if e.start > cursor {
                            gaps.push((cursor, e.start.min(end) - cursor));
                        }
                        cursor = cursor.max(e.start + e.size);
                        i += 1;
                    }
                    if cursor < end {
                        gaps.push((cursor, end - cursor));
                    }
                    for (start, len) in gaps {
                        let ok = state.heap.deallocate(start, len);
                        debug_assert!(ok);
                    }
                }
            }
            page.validate_refs_and_heap(&state);
            state.heap.is_empty() && !page.locked_for_defrag.load(Ordering::Acquire)
        };

        if became_empty {
            // pages frequently drain completely right after a compression
            let mut pages = self.pages.write();
            if let Some(pos) = pages.iter().position(|p| Arc::ptr_eq(p, &page)) {
                let still_empty = {
                    let state = page.state.lock();
                    state.heap.is_empty() && !page.locked_for_defrag.load(Ordering::Acquire)
                };
                if still_empty {
                    pages.remove(pos);
                }
            }
        }
    }

    //////// event lists ////////

    /// Fetch a published event, holding a reference on its ring slot until
    /// the matching `event_list_release`.
    pub fn event_list_get(&self, id: EventListId) -> Option<Arc<ResourceReposition>> {
        self.events.get(id)
    }

    /// Drop the slot reference and mark the event processed.
    pub fn event_list_release(&self, id: EventListId) {
        self.events.release(id, false);
    }

    pub(crate) fn event_list_release_silent(&self, id: EventListId) {
        self.events.release(id, true);
    }

    /// Highest published event id.
    pub fn event_list_published_id(&self) -> EventListId {
        self.events.published_id.load(Ordering::Acquire)
    }

    /// Highest event id every client has finished processing.
    pub fn event_list_processed_id(&self) -> EventListId {
        self.events.processed_id.load(Ordering::Acquire)
    }

    //////// defragmentation ////////

    /// Poll the active reposition and start a new one when a page is worth
    /// compacting. Must always be called from the same thread.
    pub fn tick_defrag(&self) {
        if cfg!(debug_assertions) {
            let mut tick_thread = self.tick_thread.lock();
            let current = std::thread::current().id();
            match *tick_thread {
                Some(bound) => debug_assert_eq!(bound, current),
                None => *tick_thread = Some(current),
            }
        }

        let manager = match self.manager.read().upgrade() {
            Some(manager) => manager,
            None => return,
        };

        let mut active = self.active_defrag.lock();
        if let Some(defrag) = active.as_mut() {
            self.tick_active(defrag, &*manager);
            if defrag.is_complete(self.event_list_processed_id()) {
                let src_page = Arc::clone(&defrag.src_page);
                // dropping the uberblock locator releases the umbrella
                // reference; constituent ranges survive through their own
                let finished = active.take();
                drop(active);
                drop(finished);
                let was_locked = src_page.locked_for_defrag.swap(false, Ordering::AcqRel);
                debug_assert!(was_locked);

                // clients typically moved everything off the source page
                // while it was locked; reap it now rather than waiting for
                // another release to notice
                if src_page.state.lock().heap.is_empty() {
                    let mut pages = self.pages.write();
                    if let Some(pos) = pages.iter().position(|p| Arc::ptr_eq(p, &src_page)) {
                        pages.remove(pos);
                    }
                }
                return;
            }
            return;
        }
        drop(active);

        if let Some(reposition) = self.pick_and_start_defrag(&*manager) {
            *self.active_defrag.lock() = Some(reposition);
        }
    }

    fn tick_active(&self, defrag: &mut ActiveReposition, manager: &dyn Manager) {
        if defrag.reposition_cmd_list.is_none() {
            match defrag.future.try_recv() {
                Ok(Some(Ok(id))) => defrag.reposition_cmd_list = Some(id),
                Ok(Some(Err(e))) => {
                    log::warn!("reposition copy failed: {}", e);
                    // fail the defrag: publish nothing, release the page
                    defrag.event_id = Some(0);
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    // the assembly line dropped the promise; give up
                    defrag.event_id = Some(0);
                    return;
                }
            }
        }

        if let Some(cmd_list) = defrag.reposition_cmd_list {
            if defrag.event_id.is_none() && manager.is_complete(cmd_list) {
                // encourage the clients to move across to the new resource
                let event = Arc::new(ResourceReposition {
                    original_resource: Arc::clone(&defrag.src_page.resource),
                    new_resource: defrag
                        .dst_uberblock
                        .containing_resource()
                        .cloned()
                        .expect("uberblock holds a resource"),
                    pool: self
                        .self_weak
                        .upgrade()
                        .expect("pool alive during its own tick") as Arc<dyn ResourcePool>,
                    pool_marker: 0,
                    steps: defrag.steps.clone(),
                });
                defrag.event_id = Some(self.events.publish(event));
            }
        }
    }

    fn pick_and_start_defrag(&self, manager: &dyn Manager) -> Option<ActiveReposition> {
        let page_size = self.config.page_size;
        let largest_block_threshold = page_size / self.config.largest_block_threshold_divisor;
        let min_weight = page_size / self.config.min_weight_divisor;

        let best = {
            let pages = self.pages.read();
            let mut best: Option<(Arc<Page>, u32)> = None;
            for page in pages.iter() {
                if page.locked_for_defrag.load(Ordering::Acquire) {
                    continue;
                }
                let state = page.state.lock();
                let largest = state.heap.largest_free_block();
                // only pages whose largest block has become small
                if largest > largest_block_threshold {
                    continue;
                }
                let available = state.heap.available_space();
                // compaction must at least multiply the largest block
                if largest > available / self.config.free_to_largest_ratio {
                    continue;
                }
                let weight = available - largest;
                if weight > best.as_ref().map_or(min_weight, |&(_, w)| w) {
                    // an unchanged layout was already compacted as far as it goes
                    if state.hash_last_defrag != state.heap.layout_hash() {
                        best = Some((Arc::clone(page), weight));
                    }
                }
            }
            best
        };

        let (page, _) = best?;
        let was_locked = page.locked_for_defrag.swap(true, Ordering::AcqRel);
        debug_assert!(!was_locked);

        // with the lock set, the page's free list only changes through
        // releases, which the uberblock bookkeeping tolerates
        let mut steps = {
            let mut state = page.state.lock();
            state.hash_last_defrag = state.heap.layout_hash();
            state.heap.calculate_heap_compression()
        };
        let dst_size = steps
            .iter()
            .map(|s| s.destination + s.len())
            .max()
            .unwrap_or(0);
        if dst_size == 0 {
            page.locked_for_defrag.store(false, Ordering::Release);
            return None;
        }

        let dst_uberblock = self.allocate_inner(dst_size, "reposition-uber-block");
        if dst_uberblock.is_empty() {
            log::warn!("no destination space for reposition; deferring defrag");
            page.locked_for_defrag.store(false, Ordering::Release);
            return None;
        }
        if !dst_uberblock.is_whole_resource() {
            let base = dst_uberblock.range_in_containing_resource().0 as u32;
            for s in &mut steps {
                s.destination += base;
            }
        }

        if cfg!(debug_assertions) {
            // everything the reference layer records must be carried by a step
            let state = page.state.lock();
            for i in 0..state.refs.entry_count() {
                let e = state.refs.entry(i);
                let covered = steps
                    .iter()
                    .any(|s| e.start >= s.source_start && e.start + e.size <= s.source_end);
                debug_assert!(covered);
            }
        }

        let destination = ResourceLocator::whole(
            dst_uberblock
                .containing_resource()
                .cloned()
                .expect("uberblock holds a resource"),
        );
        let source = ResourceLocator::whole(Arc::clone(&page.resource));
        let future = manager.begin_reposition(destination, source, steps.clone());

        log::debug!(
            "starting reposition of {} spans ({} bytes) out of a batched page",
            steps.len(),
            dst_size
        );

        Some(ActiveReposition {
            event_id: None,
            dst_uberblock,
            src_page: page,
            steps,
            future,
            reposition_cmd_list: None,
        })
    }
}

impl ResourcePool for BatchedPages {
    fn allocate(&self, size: u32, name: &str) -> ResourceLocator {
        self.allocate_inner(size, name)
    }

    fn make_fallback_desc(&self, size: u32, name: &str) -> ResourceDesc {
        ResourceDesc::linear_buffer(
            self.prototype.bind_flags,
            AllocationRules::empty(),
            size,
            name.to_owned(),
        )
    }

    fn add_ref(&self, _pool_marker: u64, resource: &Arc<dyn Resource>, offset: u64, size: u64) {
        if let Some(page) = self.find_page(resource) {
            page.state.lock().refs.add_ref(offset as u32, size as u32);
        } else {
            debug_assert!(false, "add_ref of a resource this pool does not own");
        }
    }

    fn release(&self, _pool_marker: u64, resource: &Arc<dyn Resource>, offset: u64, size: u64) {
        self.release_inner(resource, offset as u32, size as u32);
    }
}

impl Drop for BatchedPages {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            for page in self.pages.read().iter() {
                let state = page.state.lock();
                if state.refs.entry_count() != 0 {
                    log::error!("batched page dropped with live references; something leaked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_backend_soft::SoftDevice;

    fn make_pool(page_size: u32) -> Arc<BatchedPages> {
        let device = SoftDevice::new();
        BatchedPages::new(
            device as Arc<dyn Device>,
            BatchedPagesConfig {
                page_size,
                ..BatchedPagesConfig::default()
            },
        )
    }

    #[test]
    fn allocations_share_a_page() {
        let pool = make_pool(0x1000);
        let a = pool.allocate(0x100, "a");
        let b = pool.allocate(0x100, "b");
        assert!(!a.is_empty() && !b.is_empty());
        assert!(Arc::ptr_eq(
            a.containing_resource().unwrap(),
            b.containing_resource().unwrap()
        ));
        let metrics = pool.calculate_metrics();
        assert_eq!(metrics.heaps.len(), 1);
        assert_eq!(metrics.heaps[0].allocated_space, 0x200);
    }

    #[test]
    fn oversize_requests_are_refused() {
        let pool = make_pool(0x1000);
        assert!(pool.allocate(0x1001, "too big").is_empty());
    }

    #[test]
    fn release_returns_pool_to_pristine_state() {
        let pool = make_pool(0x1000);
        let a = pool.allocate(0x100, "a");
        let b = pool.allocate(0x200, "b");
        drop(a);
        drop(b);
        // the last release destroys the now-empty page
        assert!(pool.calculate_metrics().heaps.is_empty());
    }

    #[test]
    fn clone_and_drop_balance_references() {
        let pool = make_pool(0x1000);
        let a = pool.allocate(0x100, "a");
        let a2 = a.clone();
        drop(a);
        // still referenced through the clone
        assert_eq!(pool.calculate_metrics().heaps.len(), 1);
        drop(a2);
        assert!(pool.calculate_metrics().heaps.is_empty());
    }

    #[test]
    fn tight_fit_prefers_fragmented_page() {
        let pool = make_pool(0x1000);
        let mut hold: Vec<_> = (0..16)
            .map(|i| pool.allocate(0x100, &format!("{}", i)))
            .collect();
        // page one is full; this spill opens page two with plenty of room
        let spill = pool.allocate(0x100, "spill");
        assert_eq!(pool.calculate_metrics().heaps.len(), 2);

        // free one 0x100 hole in page one; it is now the tighter fit
        let hole = hold.remove(7);
        let first_page = Arc::clone(hole.containing_resource().unwrap());
        drop(hole);
        let replacement = pool.allocate(0x80, "replacement");
        assert!(Arc::ptr_eq(
            replacement.containing_resource().unwrap(),
            &first_page
        ));
        drop((hold, spill, replacement));
    }

    #[test]
    fn uberblock_release_keeps_live_constituents() {
        let pool = make_pool(0x1000);

        // three adjacent constituents, then an umbrella reference over all
        // of them (the shape a defrag destination has)
        let a = pool.allocate(0x100, "a");
        let b = pool.allocate(0x100, "b");
        let c = pool.allocate(0x100, "c");
        let resource = Arc::clone(a.containing_resource().unwrap());
        pool.add_ref(0, &resource, 0, 0x300);

        // one constituent leaves while the umbrella is still up: its span
        // must stay allocated under the umbrella
        drop(b);
        assert_eq!(pool.calculate_metrics().heaps[0].allocated_space, 0x300);

        // umbrella comes down: only the span with no remaining constituent
        // reference is freed
        pool.release(0, &resource, 0, 0x300);
        let metrics = pool.calculate_metrics();
        assert_eq!(metrics.heaps[0].allocated_space, 0x200);

        drop(a);
        drop(c);
        assert!(pool.calculate_metrics().heaps.is_empty());
    }

    #[test]
    fn is_batched_resource_identifies_pages() {
        let pool = make_pool(0x1000);
        let a = pool.allocate(0x100, "a");
        let page = Arc::clone(a.containing_resource().unwrap());
        assert!(pool
            .is_batched_resource(&page)
            .contains(BatchedResultFlags::IS_BATCHED));
        assert_eq!(pool.validate(&a), BatchedResultFlags::IS_BATCHED);

        let foreign = SoftDevice::new()
            .create_resource(
                &ResourceDesc::linear_buffer(
                    BindFlags::VERTEX_BUFFER,
                    AllocationRules::empty(),
                    64,
                    "foreign",
                ),
                None,
            )
            .unwrap();
        assert!(pool.is_batched_resource(&foreign).is_empty());
        drop(a);
    }

    #[test]
    fn event_ring_rotates_and_retires_old_slots() {
        let pool = make_pool(0x1000);
        let holder = pool.allocate(0x100, "holder");
        let make_event = || {
            Arc::new(ResourceReposition {
                original_resource: Arc::clone(holder.containing_resource().unwrap()),
                new_resource: Arc::clone(holder.containing_resource().unwrap()),
                pool: Arc::clone(&pool) as Arc<dyn ResourcePool>,
                pool_marker: 0,
                steps: Vec::new(),
            })
        };

        let first = pool.events.publish(make_event());
        assert_ne!(first, EVENT_LIST_ID_INVALID);

        // enough publishes to wrap the ring; the first slot is overwritten
        // because nothing pinned it
        for _ in 0..EVENT_BUFFER_COUNT {
            assert_ne!(pool.events.publish(make_event()), EVENT_LIST_ID_INVALID);
        }
        assert!(pool.event_list_get(first).is_none());

        // a pinned slot survives until released
        let latest = pool.event_list_published_id();
        let pinned = pool.event_list_get(latest).unwrap();
        assert!(pinned.steps.is_empty());
        pool.event_list_release(latest);
        assert_eq!(pool.event_list_processed_id(), latest);
        drop(holder);
    }

    #[test]
    fn fallback_desc_keeps_the_bind_class() {
        let pool = make_pool(0x1000);
        let desc = pool.make_fallback_desc(0x2000, "fallback");
        assert_eq!(desc.byte_count(), 0x2000);
        assert!(desc.bind_flags.contains(BindFlags::VERTEX_BUFFER));
    }

    #[test]
    fn event_ring_reference_protocol() {
        let pool = make_pool(0x1000);
        let a = pool.allocate(0x100, "a");
        let event = Arc::new(ResourceReposition {
            original_resource: Arc::clone(a.containing_resource().unwrap()),
            new_resource: Arc::clone(a.containing_resource().unwrap()),
            pool: Arc::clone(&pool) as Arc<dyn ResourcePool>,
            pool_marker: 0,
            steps: vec![RepositionStep {
                source_start: 0,
                source_end: 0x100,
                destination: 0x200,
            }],
        });
        let id = pool.events.publish(event);
        assert_eq!(pool.event_list_published_id(), id);
        assert_eq!(pool.event_list_processed_id(), 0);

        let fetched = pool.event_list_get(id).unwrap();
        assert_eq!(fetched.resolve_offset(0x40, 0x10), Some(0x240));
        pool.event_list_release(id);
        assert_eq!(pool.event_list_processed_id(), id);
        drop(a);
    }
}
