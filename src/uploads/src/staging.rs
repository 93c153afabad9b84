//! The staging page: a permanently mapped circular buffer feeding the
//! transfer queue.

use crate::heap::CircularHeap;
use crate::metrics::StagingPageMetrics;
use hal::{
    AllocationRules, BindFlags, CreationError, Device, MarkerStatus, Queue, QueueMarker, Resource,
    ResourceDesc,
};
use std::sync::Arc;
use std::thread::ThreadId;

/// An outstanding staging reservation.
#[derive(Clone, Copy, Debug)]
pub struct StagingAllocation {
    offset: u32,
    size: u32,
    id: u32,
}

impl StagingAllocation {
    /// Byte offset of the reservation inside the staging resource.
    pub fn resource_offset(&self) -> u32 {
        self.offset
    }

    /// Byte size of the reservation.
    pub fn allocation_size(&self) -> u32 {
        self.size
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

struct ActiveAllocation {
    allocation_id: u32,
    pending_new_front: u32,
    unreleased: bool,
    release_marker: QueueMarker,
}

struct WaitingOnDevice {
    release_marker: QueueMarker,
    pending_new_front: u32,
}

/// A single host-visible, sequential-write, permanently mapped buffer treated
/// as a circular heap.
///
/// Allocations are made from the back; space is reclaimed at the front once
/// the transfer queue has advanced past the marker each allocation was
/// released with. Releases may arrive out of order; the front only advances
/// over a fully released prefix. The page is bound to a single thread.
pub struct StagingPage {
    heap: CircularHeap,
    resource: Arc<dyn Resource>,
    queue: Arc<dyn Queue>,
    active_allocations: Vec<ActiveAllocation>,
    waiting_on_device: Vec<WaitingOnDevice>,
    next_allocation_id: u32,
    bound_thread: Option<ThreadId>,
}

impl StagingPage {
    /// Create the staging resource and wrap it.
    pub fn new(
        device: &dyn Device,
        queue: Arc<dyn Queue>,
        size: u32,
    ) -> Result<Self, CreationError> {
        let desc = ResourceDesc::linear_buffer(
            BindFlags::TRANSFER_SRC,
            AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE
                | AllocationRules::PERMANENTLY_MAPPED
                | AllocationRules::DISABLE_AUTO_CACHE_COHERENCY
                | AllocationRules::DEDICATED_PAGE,
            size,
            "staging-page",
        );
        let resource = device.create_resource(&desc, None)?;
        Ok(StagingPage {
            heap: CircularHeap::new(size),
            resource,
            queue,
            active_allocations: Vec::new(),
            waiting_on_device: Vec::new(),
            next_allocation_id: 1,
            bound_thread: Some(std::thread::current().id()),
        })
    }

    /// Rebind the page to the calling thread; all further calls must come
    /// from it.
    pub fn bind_thread(&mut self) {
        self.bound_thread = Some(std::thread::current().id());
    }

    fn assert_bound(&self) {
        debug_assert_eq!(self.bound_thread, Some(std::thread::current().id()));
    }

    /// Largest request the page can ever satisfy.
    pub fn max_size(&self) -> u32 {
        self.heap.heap_size()
    }

    /// The backing staging resource.
    pub fn staging_resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// Reserve `byte_count` bytes with the given alignment. On failure the
    /// page reclaims completed space once and retries; `None` means the
    /// caller must apply back-pressure and come back later.
    pub fn allocate(&mut self, byte_count: u32, alignment: u32) -> Option<StagingAllocation> {
        self.assert_bound();
        debug_assert!(byte_count <= self.heap.heap_size());
        let offset = match self.heap.allocate_back(byte_count, alignment) {
            Some(offset) => offset,
            None => {
                self.update_consumer_marker();
                self.heap.allocate_back(byte_count, alignment)?
            }
        };
        let allocation_id = self.next_allocation_id;
        self.next_allocation_id += 1;
        self.active_allocations.push(ActiveAllocation {
            allocation_id,
            pending_new_front: offset + byte_count,
            unreleased: true,
            release_marker: 0,
        });
        Some(StagingAllocation {
            offset,
            size: byte_count,
            id: allocation_id,
        })
    }

    /// Release a reservation; space returns to the heap once the transfer
    /// queue passes the current producer marker.
    pub fn release(&mut self, allocation: StagingAllocation) {
        let marker = self.queue.tracker().producer_marker();
        self.release_inner(allocation.id(), marker);
    }

    /// Release a reservation that never had device work recorded against it.
    /// Reclaims identically but shows up as abandoned to the queue tracker.
    pub fn abandon(&mut self, allocation: StagingAllocation) {
        self.release_inner(allocation.id(), 0);
    }

    /// Roll back a reservation that failed before anything became visible to
    /// the device. When it is the most recent reservation, the circular heap
    /// rewinds on the spot and the bytes are immediately reusable; otherwise
    /// this degrades to abandonment, which reclaims in release order.
    pub fn undo_allocation(&mut self, allocation: StagingAllocation) {
        self.assert_bound();
        match self.active_allocations.last() {
            Some(last) if last.allocation_id == allocation.id() && last.unreleased => {
                self.active_allocations.pop();
                self.heap.undo_last_allocation(allocation.allocation_size());
            }
            _ => self.abandon(allocation),
        }
    }

    fn release_inner(&mut self, allocation_id: u32, release_marker: QueueMarker) {
        self.assert_bound();

        let mut release_marker = release_marker;
        match self
            .active_allocations
            .iter_mut()
            .find(|a| a.allocation_id == allocation_id)
        {
            Some(entry) => {
                debug_assert!(entry.unreleased);
                entry.unreleased = false;
                entry.release_marker = release_marker;
            }
            None => {
                debug_assert!(false, "release of unknown staging allocation");
                return;
            }
        }

        // Migrate the released prefix to the waiting-on-device list. A
        // released allocation can never carry a later marker than one
        // released after it, so the prefix maximum is the wait value.
        let abandon_case = release_marker == 0;
        let mut prefix_len = 0;
        for a in &self.active_allocations {
            if a.unreleased {
                break;
            }
            debug_assert!(abandon_case || a.release_marker <= release_marker || release_marker == 0);
            release_marker = release_marker.max(a.release_marker);
            prefix_len += 1;
        }
        if prefix_len == 0 {
            return;
        }

        let new_front = self.active_allocations[prefix_len - 1].pending_new_front;
        self.active_allocations.drain(..prefix_len);

        // Abandoned allocations also join the list so reclamation stays in
        // release order with the surrounding real releases.
        if let Some(last) = self.waiting_on_device.last_mut() {
            if last.release_marker == release_marker {
                last.pending_new_front = new_front;
                return;
            }
        }
        self.waiting_on_device.push(WaitingOnDevice {
            release_marker,
            pending_new_front: new_front,
        });
        if self.waiting_on_device.len() > 16 {
            // updated lazily; keep the list from growing without bound
            self.update_consumer_marker();
        }
    }

    /// Walk the waiting-on-device list and advance the heap front over every
    /// entry the transfer queue has completed.
    pub fn update_consumer_marker(&mut self) {
        self.assert_bound();
        while let Some(front) = self.waiting_on_device.first() {
            match self.queue.tracker().marker_status(front.release_marker) {
                MarkerStatus::ConsumerCompleted | MarkerStatus::Abandoned => {
                    let new_front = front.pending_new_front;
                    self.heap.reset_front(new_front);
                    self.waiting_on_device.remove(0);
                }
                MarkerStatus::Pending => break,
            }
        }
    }

    /// Occupancy counters for metrics.
    pub fn quick_metrics(&self) -> StagingPageMetrics {
        self.assert_bound();
        let heap_metrics = self.heap.quick_metrics();
        let mut result = StagingPageMetrics {
            bytes_allocated: heap_metrics.bytes_allocated,
            max_next_block_bytes: heap_metrics.max_next_block_bytes,
            bytes_awaiting_device: 0,
            bytes_locked_due_to_ordering: 0,
        };
        if let Some(last) = self.waiting_on_device.last() {
            let new_front = last.pending_new_front;
            result.bytes_awaiting_device = if new_front > heap_metrics.front {
                new_front - heap_metrics.front
            } else {
                self.heap.heap_size() - heap_metrics.front + new_front
            };
        }
        for i in 1..self.active_allocations.len() {
            let a = &self.active_allocations[i];
            if !a.unreleased {
                let prev_front = self.active_allocations[i - 1].pending_new_front;
                let new_front = a.pending_new_front;
                result.bytes_locked_due_to_ordering = if new_front > prev_front {
                    new_front - prev_front
                } else {
                    self.heap.heap_size() - prev_front + new_front
                };
            }
        }
        result
    }
}

impl Drop for StagingPage {
    fn drop(&mut self) {
        // waiting-on-device entries are fine (the consumer marker is updated
        // lazily), but unreleased allocations at shutdown are a leak
        if self.active_allocations.iter().any(|a| a.unreleased) {
            log::warn!("staging page dropped with unreleased allocations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_backend_soft::SoftDevice;
    use hal::QueueClass;

    fn make_page(size: u32) -> (Arc<SoftDevice>, StagingPage) {
        let device = SoftDevice::new();
        let queue = device.queue(QueueClass::Transfer);
        let page = StagingPage::new(&*device, queue, size).unwrap();
        (device, page)
    }

    fn submit_nop(device: &Arc<SoftDevice>) {
        // advances the transfer queue's consumer marker past everything
        // released so far
        let mut writer = device.open_command_writer(QueueClass::Transfer);
        writer.nop();
        let list = writer.resolve();
        device.queue(QueueClass::Transfer).submit(list).unwrap();
    }

    #[test]
    fn allocations_are_disjoint() {
        let (_device, mut page) = make_page(0x1000);
        let a = page.allocate(0x100, 1).unwrap();
        let b = page.allocate(0x100, 1).unwrap();
        let (a0, a1) = (a.resource_offset(), a.resource_offset() + a.allocation_size());
        let (b0, b1) = (b.resource_offset(), b.resource_offset() + b.allocation_size());
        assert!(a1 <= b0 || b1 <= a0);
    }

    #[test]
    fn space_returns_after_device_advances() {
        let (device, mut page) = make_page(0x100);
        let a = page.allocate(0x100, 1).unwrap();
        assert!(page.allocate(0x10, 1).is_none());
        page.release(a);
        // marker not yet signalled: still no space
        assert!(page.allocate(0x10, 1).is_none());
        submit_nop(&device);
        let b = page.allocate(0x10, 1);
        assert!(b.is_some());
    }

    #[test]
    fn out_of_order_release_waits_for_prefix() {
        let (device, mut page) = make_page(0x100);
        let a = page.allocate(0x40, 1).unwrap();
        let b = page.allocate(0x40, 1).unwrap();
        page.release(b);
        submit_nop(&device);
        page.update_consumer_marker();
        // b released but a still active: nothing reclaimed
        assert!(page.allocate(0x90, 1).is_none());
        page.release(a);
        submit_nop(&device);
        let c = page.allocate(0x90, 1);
        assert!(c.is_some());
    }

    #[test]
    fn abandoned_allocations_reclaim_without_device_work() {
        let (_device, mut page) = make_page(0x100);
        let a = page.allocate(0x100, 1).unwrap();
        page.abandon(a);
        // no submission needed; abandoned markers report as such
        let b = page.allocate(0x100, 1);
        assert!(b.is_some());
    }

    #[test]
    fn undo_returns_space_with_no_wait() {
        let (_device, mut page) = make_page(0x100);
        // an earlier, still-active allocation would block abandonment-based
        // reclamation; undo must not care about it
        let _held = page.allocate(0x40, 1).unwrap();
        let failed = page.allocate(0xc0, 1).unwrap();
        assert!(page.allocate(0x10, 1).is_none());
        page.undo_allocation(failed);
        assert!(page.allocate(0xc0, 1).is_some());
    }

    #[test]
    fn undo_of_an_older_allocation_degrades_to_abandonment() {
        let (_device, mut page) = make_page(0x100);
        let older = page.allocate(0x40, 1).unwrap();
        let _newer = page.allocate(0x40, 1).unwrap();
        page.undo_allocation(older);
        // not the most recent reservation, so the heap did not rewind; the
        // bytes come back through the release-order walk instead
        assert_eq!(page.quick_metrics().bytes_allocated, 0x80);
        page.update_consumer_marker();
        assert_eq!(page.quick_metrics().bytes_allocated, 0x40);
    }

    #[test]
    fn quick_metrics_track_outstanding_bytes() {
        let (_device, mut page) = make_page(0x100);
        let _a = page.allocate(0x40, 1).unwrap();
        let metrics = page.quick_metrics();
        assert_eq!(metrics.bytes_allocated, 0x40);
        assert_eq!(metrics.max_next_block_bytes, 0xc0);
    }
}
