//! Per-worker-thread state bridging assembly-line work to the driver's
//! command queues.

use crate::locator::ResourceLocator;
use crate::metrics::{append_failure, time_marker_now, CommandListMetrics};
use crate::staging::StagingPage;
use crate::{CommandListId, COMMAND_LIST_ID_INVALID};
use arrayvec::ArrayVec;
use hal::{CommandList, CommandWriter, Device, Queue, QueueClass, TimelineSemaphore};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

bitflags!(
    /// Flags for `advance_graphics_queue`.
    pub struct AdvanceFlags: u32 {
        /// The caller's thread context is not the regular per-frame graphics
        /// context; commit a dedicated command list immediately rather than
        /// piggy-backing, so other threads are never blocked on it.
        const IRREGULAR_THREAD_CONTEXT = 0x1;
    }
);

/// Work that must run on the graphics queue when a command list retires
/// there.
#[derive(Default)]
pub struct DeferredOperations {
    delayed_deletes: Vec<ResourceLocator>,
    transfers: Vec<ResourceTransfer>,
}

/// A resource whose queue-family ownership moves from the transfer queue to
/// the graphics queue when its command list retires.
pub struct ResourceTransfer {
    /// The range changing ownership; held alive until the acquire.
    pub resource: ResourceLocator,
}

impl DeferredOperations {
    /// Keep `locator` alive until the command list retires on the graphics
    /// queue.
    pub fn add_delayed_delete(&mut self, locator: ResourceLocator) {
        self.delayed_deletes.push(locator);
    }

    /// Queue a queue-family acquire for retirement time.
    pub fn add_transfer(&mut self, transfer: ResourceTransfer) {
        self.transfers.push(transfer);
    }

    /// Whether there is nothing to do at retirement.
    pub fn is_empty(&self) -> bool {
        self.delayed_deletes.is_empty() && self.transfers.is_empty()
    }

    fn commit_resource_transfers(&mut self, writer: &mut dyn CommandWriter) {
        for transfer in self.transfers.drain(..) {
            if let Some(resource) = transfer.resource.containing_resource() {
                writer.acquire_from_queue_family(
                    resource,
                    QueueClass::Transfer,
                    QueueClass::Graphics,
                );
            }
            // the locator drops here; pool references release at retirement
        }
        self.delayed_deletes.clear();
    }
}

/// State owned by the recording side: the open command list, staging space,
/// and the metrics and deferred operations under construction.
pub struct Recording {
    device: Arc<dyn Device>,
    writer: Option<Box<dyn CommandWriter>>,
    staging: Option<StagingPage>,
    /// Metrics of the command list under construction.
    pub metrics: CommandListMetrics,
    /// Deferred operations of the command list under construction.
    pub deferred: DeferredOperations,
    under_construction: CommandListId,
}

impl Recording {
    /// The command-list id currently being recorded.
    pub fn command_list_under_construction(&self) -> CommandListId {
        self.under_construction
    }

    /// The transfer-queue command writer, opened on first use.
    pub fn writer(&mut self) -> &mut dyn CommandWriter {
        if self.writer.is_none() {
            self.writer = Some(self.device.open_command_writer(QueueClass::Transfer));
        }
        &mut **self.writer.as_mut().unwrap()
    }

    /// The staging page, for contexts that reserve staging space.
    pub fn staging(&mut self) -> Option<&mut StagingPage> {
        self.staging.as_mut()
    }

    /// The device this context records against.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

struct QueuedCommandList {
    metrics: CommandListMetrics,
    deferred: DeferredOperations,
    id: CommandListId,
    advance_count_at_queue_time: u32,
}

struct RetirementQueue {
    queued: VecDeque<QueuedCommandList>,
    advance_count: u32,
}

const RECENT_RETIREMENTS_CAP: usize = 256;
// max advance passes a queued command list may idle before it is retired
// even though nothing requires it yet; prevents starvation
const MAX_IDLY_QUEUED: u32 = 4;

/// One worker thread's bridge to the hardware queues.
///
/// The recording side (step processing) and the retirement side (the graphics
/// thread draining resolved command lists) run on different threads and are
/// guarded separately.
pub struct UploadsThreadContext {
    device: Arc<dyn Device>,
    transfer_queue: Arc<dyn Queue>,
    recording: Mutex<Recording>,
    retirement: Mutex<RetirementQueue>,
    ready_for_graphics_queue: AtomicU32,
    transfer_timeline: Arc<dyn TimelineSemaphore>,
    graphics_timeline: Arc<dyn TimelineSemaphore>,
    recent_retirements: Mutex<VecDeque<CommandListMetrics>>,
    frame_id: AtomicU32,
    commit_count: AtomicU32,
    commit_count_last_resolve: AtomicU32,
}

impl UploadsThreadContext {
    /// Create a context; `reserve_staging` controls whether it owns a staging
    /// page (only the context that processes steps needs one).
    pub fn new(
        device: Arc<dyn Device>,
        reserve_staging: bool,
        staging_page_size: u32,
    ) -> Result<Self, hal::CreationError> {
        let transfer_queue = device.queue(QueueClass::Transfer);
        let staging = if reserve_staging {
            Some(StagingPage::new(
                &*device,
                Arc::clone(&transfer_queue),
                staging_page_size,
            )?)
        } else {
            None
        };
        let transfer_timeline = device.create_timeline_semaphore();
        let graphics_timeline = device.create_timeline_semaphore();
        let mut metrics = CommandListMetrics::default();
        metrics.processing_start = time_marker_now();
        Ok(UploadsThreadContext {
            recording: Mutex::new(Recording {
                device: Arc::clone(&device),
                writer: None,
                staging,
                metrics,
                deferred: DeferredOperations::default(),
                under_construction: 1,
            }),
            retirement: Mutex::new(RetirementQueue {
                queued: VecDeque::new(),
                advance_count: 0,
            }),
            ready_for_graphics_queue: AtomicU32::new(0),
            transfer_timeline,
            graphics_timeline,
            recent_retirements: Mutex::new(VecDeque::new()),
            frame_id: AtomicU32::new(0),
            commit_count: AtomicU32::new(0),
            commit_count_last_resolve: AtomicU32::new(0),
            device,
            transfer_queue,
        })
    }

    /// Lock the recording side. Only the step-processing thread takes this
    /// for more than a moment.
    pub fn recording(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock()
    }

    /// Rebind the staging page to the calling thread.
    pub fn bind_thread(&self) {
        if let Some(staging) = self.recording.lock().staging.as_mut() {
            staging.bind_thread();
        }
    }

    /// Commit the command list under construction to the transfer queue and
    /// queue its record for graphics-queue retirement.
    ///
    /// When `complete_cmd_list` is set, a signal of the transfer-queue
    /// timeline at that value is appended first; drivers drop signals on
    /// empty command lists, so one no-op is recorded if needed.
    pub fn queue_to_hardware(&self, complete_cmd_list: Option<CommandListId>) {
        let now = time_marker_now();
        let mut recording = self.recording.lock();

        let mut metrics = std::mem::take(&mut recording.metrics);
        metrics.resolve_time = now;
        metrics.processing_end = now;
        let mut deferred = std::mem::take(&mut recording.deferred);

        if let Some(id) = complete_cmd_list {
            let writer = recording.writer();
            if !writer.has_commands() {
                writer.nop();
            }
            let timeline = Arc::clone(&self.transfer_timeline);
            writer.signal_on_completion(&timeline, u64::from(id));
        }

        if let Some(writer) = recording.writer.as_mut() {
            let list: Box<dyn CommandList> = writer.resolve();
            if let Err(e) = self.transfer_queue.submit(list) {
                append_failure(&mut metrics, &e.to_string());
                // a failed submission invalidates the deferred work with it
                deferred = DeferredOperations::default();
            }
        }

        recording.metrics = CommandListMetrics::default();
        recording.metrics.processing_start = now;
        if complete_cmd_list.is_some() {
            recording.under_construction += 1;
        }
        drop(recording);

        let mut retirement = self.retirement.lock();
        let advance_count = retirement.advance_count;
        retirement.queued.push_back(QueuedCommandList {
            metrics,
            deferred,
            id: complete_cmd_list.unwrap_or(COMMAND_LIST_ID_INVALID),
            advance_count_at_queue_time: advance_count,
        });
    }

    /// Drain queued command-list records into the graphics queue, writing the
    /// timeline waits and signals that make uploads visible there. Returns
    /// whether everything up to `cmd_list_required` has retired.
    pub fn advance_graphics_queue(
        &self,
        immediate: &mut dyn CommandWriter,
        cmd_list_required: CommandListId,
        flags: AdvanceFlags,
    ) -> bool {
        let mut wrote_some_stub = false;
        let mut advance_count = None;

        loop {
            let mut batch: ArrayVec<[QueuedCommandList; 16]> = ArrayVec::new();
            let mut need_another_batch = false;
            {
                let mut retirement = self.retirement.lock();
                let advance_count = *advance_count.get_or_insert_with(|| {
                    let c = retirement.advance_count;
                    retirement.advance_count += 1;
                    c
                });
                let mut covered = self.ready_for_graphics_queue.load(Ordering::Acquire);
                while let Some(front) = retirement.queued.front() {
                    let idle = advance_count.wrapping_sub(front.advance_count_at_queue_time);
                    if covered >= cmd_list_required && idle < MAX_IDLY_QUEUED {
                        // nothing requires this record yet; let it sit
                        break;
                    }
                    if batch.is_full() {
                        need_another_batch = true;
                        break;
                    }
                    if front.id != COMMAND_LIST_ID_INVALID {
                        debug_assert!(front.id > covered);
                        covered = front.id;
                    }
                    batch.push(retirement.queued.pop_front().unwrap());
                }
            }

            for record in batch {
                if flags.contains(AdvanceFlags::IRREGULAR_THREAD_CONTEXT) {
                    self.retire_record_irregular(record);
                } else {
                    self.retire_record(immediate, record);
                    wrote_some_stub = true;
                }
            }

            if !need_another_batch {
                break;
            }
        }

        let ready = self.ready_for_graphics_queue.load(Ordering::Acquire);
        if !wrote_some_stub
            && ready >= cmd_list_required
            && cmd_list_required != 0
            && cmd_list_required != COMMAND_LIST_ID_INVALID
        {
            immediate.wait_before_begin(&self.graphics_timeline, u64::from(cmd_list_required));
        }

        self.commit_count.fetch_add(1, Ordering::AcqRel);
        ready >= cmd_list_required
    }

    fn retire_record(&self, immediate: &mut dyn CommandWriter, mut record: QueuedCommandList) {
        if !record.deferred.is_empty() {
            // deferred work gets its own pre-frame command list so the
            // acquires land before the frame's rendering
            let mut writer = self.device.open_command_writer(QueueClass::Graphics);
            record.deferred.commit_resource_transfers(&mut *writer);
            if record.id != COMMAND_LIST_ID_INVALID {
                writer.wait_before_begin(&self.transfer_timeline, u64::from(record.id));
                writer.signal_on_completion(&self.graphics_timeline, u64::from(record.id));
            }
            let list = writer.resolve();
            if let Err(e) = self.device.queue(QueueClass::Graphics).submit(list) {
                append_failure(&mut record.metrics, &e.to_string());
            }
        } else if record.id != COMMAND_LIST_ID_INVALID {
            immediate.wait_before_begin(&self.transfer_timeline, u64::from(record.id));
            immediate.signal_on_completion(&self.graphics_timeline, u64::from(record.id));
        }
        self.finish_retirement(record);
    }

    fn retire_record_irregular(&self, mut record: QueuedCommandList) {
        // this command list often ends up trivial, but an irregular thread
        // context cannot piggy-back on another thread's command list
        let mut writer = self.device.open_command_writer(QueueClass::Graphics);
        record.deferred.commit_resource_transfers(&mut *writer);
        if record.id != COMMAND_LIST_ID_INVALID {
            writer.wait_before_begin(&self.transfer_timeline, u64::from(record.id));
            writer.signal_on_completion(&self.graphics_timeline, u64::from(record.id));
        }
        if !writer.has_commands() {
            writer.nop();
        }
        let list = writer.resolve();
        if let Err(e) = self.device.queue(QueueClass::Graphics).submit(list) {
            append_failure(&mut record.metrics, &e.to_string());
        }
        self.finish_retirement(record);
    }

    fn finish_retirement(&self, mut record: QueuedCommandList) {
        if record.id != COMMAND_LIST_ID_INVALID {
            self.ready_for_graphics_queue
                .fetch_max(record.id, Ordering::AcqRel);
        }
        record.metrics.frame_id = self.frame_id.load(Ordering::Acquire);
        record.metrics.commit_time = time_marker_now();
        let mut recent = self.recent_retirements.lock();
        while recent.len() >= RECENT_RETIREMENTS_CAP {
            recent.pop_front();
        }
        recent.push_back(record.metrics);
        // record.deferred drops here, releasing delayed deletes
    }

    /// The most recently retired command-list metrics, oldest first; invalid
    /// (zero commit time) when none remain.
    pub fn pop_metrics(&self) -> CommandListMetrics {
        self.recent_retirements
            .lock()
            .pop_front()
            .unwrap_or_default()
    }

    /// Highest command-list id the graphics queue has been taught to wait
    /// for.
    pub fn command_list_ready_for_graphics_queue(&self) -> CommandListId {
        self.ready_for_graphics_queue.load(Ordering::Acquire)
    }

    /// The deepest command-list id sitting in the retirement queue, if any.
    pub fn command_list_latest_pending(&self) -> Option<CommandListId> {
        self.retirement
            .lock()
            .queued
            .iter()
            .rev()
            .map(|r| r.id)
            .find(|&id| id != COMMAND_LIST_ID_INVALID)
    }

    /// The command-list id currently under construction.
    pub fn command_list_under_construction(&self) -> CommandListId {
        self.recording.lock().under_construction
    }

    /// Frame counter maintained by the manager.
    pub fn frame_id(&self) -> u32 {
        self.frame_id.load(Ordering::Acquire)
    }

    /// Advance the frame counter.
    pub fn advance_frame_id(&self) {
        self.frame_id.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of `advance_graphics_queue` calls so far; the assembly line
    /// resolves at most one command list per count.
    pub fn commit_count_current(&self) -> u32 {
        self.commit_count.load(Ordering::Acquire)
    }

    /// The commit count at the last resolve.
    pub fn commit_count_last_resolve(&self) -> u32 {
        self.commit_count_last_resolve.load(Ordering::Acquire)
    }

    /// Record the commit count of a resolve that just happened.
    pub fn set_commit_count_last_resolve(&self, value: u32) {
        self.commit_count_last_resolve.store(value, Ordering::Release);
    }

    /// The device this context works against.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_backend_soft::SoftDevice;

    fn make_context() -> (Arc<SoftDevice>, UploadsThreadContext) {
        let device = SoftDevice::new();
        let context =
            UploadsThreadContext::new(device.clone() as Arc<dyn Device>, true, 0x10000).unwrap();
        (device, context)
    }

    #[test]
    fn queue_to_hardware_increments_under_construction() {
        let (_device, context) = make_context();
        assert_eq!(context.command_list_under_construction(), 1);
        context.queue_to_hardware(Some(1));
        assert_eq!(context.command_list_under_construction(), 2);
        assert_eq!(context.command_list_latest_pending(), Some(1));
    }

    #[test]
    fn advance_retires_in_order_and_reports_ready() {
        let (device, context) = make_context();
        context.queue_to_hardware(Some(1));
        context.queue_to_hardware(Some(2));

        let mut immediate = device.open_command_writer(QueueClass::Graphics);
        assert!(context.advance_graphics_queue(&mut *immediate, 2, AdvanceFlags::empty()));
        assert_eq!(context.command_list_ready_for_graphics_queue(), 2);

        // metrics ring serves records oldest first
        assert!(context.pop_metrics().is_valid());
        assert!(context.pop_metrics().is_valid());
        assert!(!context.pop_metrics().is_valid());
    }

    #[test]
    fn records_beyond_required_idle_until_starvation_limit() {
        let (device, context) = make_context();
        context.queue_to_hardware(Some(1));

        let mut immediate = device.open_command_writer(QueueClass::Graphics);
        // nothing requires list 1; it may sit for a few passes
        assert!(context.advance_graphics_queue(&mut *immediate, 0, AdvanceFlags::empty()));
        assert_eq!(context.command_list_ready_for_graphics_queue(), 0);
        for _ in 0..MAX_IDLY_QUEUED {
            context.advance_graphics_queue(&mut *immediate, 0, AdvanceFlags::empty());
        }
        assert_eq!(context.command_list_ready_for_graphics_queue(), 1);
    }
}
