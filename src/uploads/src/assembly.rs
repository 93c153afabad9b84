//! The assembly line: the transaction table plus the pipelined work queues
//! the background thread drains.

use crate::batched::{BatchedPages, EventListId, ResourceReposition};
use crate::context::{Recording, ResourceTransfer, UploadsThreadContext};
use crate::error::UploadError;
use crate::locator::{ResourceLocator, ResourcePool};
use crate::lockfree::{StepQueue, WakeupEvent};
use crate::metrics::{
    time_marker_now, upload_data_type, AssemblyLineMetrics, UploadDataType,
    UPLOAD_DATA_TYPE_COUNT,
};
use crate::packet::{AsyncDataSource, DataPacket, PacketInitializer, SubresourceWrite};
use crate::staging::StagingAllocation;
use crate::transaction::{Transaction, TransactionOptions, TransactionRef, TransactionTable};
use crate::{
    ContinuationSpawner, RepositionMarker, TransactionId, TransactionMarker,
    TRANSACTION_ID_INVALID,
};
use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use futures_util::task::{waker, ArcWake};
use futures_util::FutureExt;
use hal::{
    AllocationRules, BindFlags, BufferCopy, Device, QueueClass, RepositionStep, Resource,
    ResourceDesc, ResourceKind, SubresourceId, TextureCopy,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::ThreadId;
use std::time::Duration;

bitflags!(
    /// Which kinds of work a `process` call may perform; the manager splits
    /// these between the foreground and background contexts.
    pub struct StepMask: u32 {
        /// Allocate staging and kick data-source prepares.
        const PREPARE_STAGING = 1 << 0;
        /// Emit staging-to-final copies.
        const TRANSFER_STAGING_TO_FINAL = 1 << 1;
        /// Synchronous packet uploads.
        const CREATE_FROM_DATA_PACKET = 1 << 2;
        /// Drive attached batched pools' defragmentation.
        const BATCHED_DEFRAG = 1 << 4;
        /// Queued functions, retirement log, background-frame callbacks.
        const BACKGROUND_MISC = 1 << 5;
    }
);

// staging copy alignment: Vulkan-class optimal copy offset alignments
const BUFFER_STAGING_ALIGNMENT: u32 = 16;
const TEXTURE_STAGING_ALIGNMENT: u32 = 256;

fn staging_alignment(desc: &ResourceDesc) -> u32 {
    match desc.kind {
        ResourceKind::LinearBuffer(_) => BUFFER_STAGING_ALIGNMENT,
        ResourceKind::Texture(_) => TEXTURE_STAGING_ALIGNMENT,
    }
}

/// Per-resolution limits; loading mode lifts them so bulk scenes stream at
/// full rate.
struct CommandListBudget {
    limit_bytes_uploaded: u64,
    limit_operations: u32,
}

impl CommandListBudget {
    fn new(is_loading: bool) -> Self {
        if is_loading {
            CommandListBudget {
                limit_bytes_uploaded: u64::MAX,
                limit_operations: u32::MAX,
            }
        } else {
            CommandListBudget {
                limit_bytes_uploaded: 5 * 1024 * 1024,
                limit_operations: 64,
            }
        }
    }
}

struct PrepareStagingStep {
    transaction: TransactionRef,
    desc: ResourceDesc,
    source: Arc<dyn AsyncDataSource>,
    pool: Option<Arc<dyn ResourcePool>>,
    bind_flags: BindFlags,
}

struct TransferStagingToFinalStep {
    transaction: TransactionRef,
    pool: Option<Arc<dyn ResourcePool>>,
    final_desc: ResourceDesc,
    staging: Option<StagingAllocation>,
    oversize: Option<Arc<dyn Resource>>,
}

struct CreateFromDataPacketStep {
    transaction: TransactionRef,
    pool: Option<Arc<dyn ResourcePool>>,
    desc: ResourceDesc,
    data: Arc<dyn DataPacket>,
}

struct QueueSet {
    prepare_staging: StepQueue<PrepareStagingStep>,
    transfer_staging_to_final: StepQueue<TransferStagingToFinalStep>,
    create_from_data_packet: StepQueue<CreateFromDataPacketStep>,
}

impl QueueSet {
    fn new() -> Self {
        QueueSet {
            prepare_staging: StepQueue::new(256),
            transfer_staging_to_final: StepQueue::new(256),
            create_from_data_packet: StepQueue::new(256),
        }
    }
}

type QueuedFunction = Box<dyn FnOnce(&AssemblyLine, &mut Recording) + Send>;

struct PoolAttachment {
    pool: Weak<BatchedPages>,
    // events applied when they became publishable
    resolved_event: EventListId,
    // events applied again once every client processed them
    post_publish_resolved_event: EventListId,
}

// a continuation plus the transaction whose cancellation abandons it
struct Waitable {
    future: BoxFuture<'static, ()>,
    cancel_probe: Option<Arc<Transaction>>,
}

struct EventWaker {
    wakeup: Arc<WakeupEvent>,
}

impl ArcWake for EventWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wakeup.increment();
    }
}

/// Outcome of one step-processing attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepOutcome {
    /// The step finished (successfully or by failing its transaction).
    Done,
    /// The step could not run this tick; retry later.
    Blocked,
}

/// The hub of the upload subsystem. Owns the transaction table, the queue
/// sets and the continuation machinery; the manager drives `process` on one
/// of its thread contexts.
pub struct AssemblyLine {
    device: Arc<dyn Device>,
    table: Arc<TransactionTable>,
    queue_set_main: QueueSet,
    queue_set_frame_priority: [QueueSet; 4],
    frame_priority_writing_index: AtomicUsize,
    queued_functions: StepQueue<QueuedFunction>,
    wakeup: Arc<WakeupEvent>,
    current_queued_bytes: [AtomicI64; UPLOAD_DATA_TYPE_COUNT],
    peak_prepare_staging: AtomicU32,
    peak_transfer_staging_to_final: AtomicU32,
    peak_create_from_data_packet: AtomicU32,
    on_background_frame: Mutex<Vec<(u32, Box<dyn FnMut() + Send>)>>,
    next_background_frame_marker: AtomicU32,
    commit_count_last_background_frame: AtomicU32,
    pools: Mutex<Vec<PoolAttachment>>,
    loading_mode: AtomicBool,
    continuation_spawner: Option<Arc<dyn ContinuationSpawner>>,
    active_waitables: Mutex<Vec<Waitable>>,
    staging_waitables: Mutex<Vec<Waitable>>,
    waitables_thread: Mutex<Option<ThreadId>>,
    weak_self: Weak<AssemblyLine>,
}

impl AssemblyLine {
    /// Create an assembly line over `device`; `continuation_spawner` offloads
    /// future continuations when the host has a thread pool for them.
    pub fn new(
        device: Arc<dyn Device>,
        continuation_spawner: Option<Arc<dyn ContinuationSpawner>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| AssemblyLine {
            device,
            table: TransactionTable::new(),
            queue_set_main: QueueSet::new(),
            queue_set_frame_priority: [
                QueueSet::new(),
                QueueSet::new(),
                QueueSet::new(),
                QueueSet::new(),
            ],
            frame_priority_writing_index: AtomicUsize::new(0),
            queued_functions: StepQueue::new(256),
            wakeup: Arc::new(WakeupEvent::new()),
            current_queued_bytes: Default::default(),
            peak_prepare_staging: AtomicU32::new(0),
            peak_transfer_staging_to_final: AtomicU32::new(0),
            peak_create_from_data_packet: AtomicU32::new(0),
            on_background_frame: Mutex::new(Vec::new()),
            next_background_frame_marker: AtomicU32::new(1),
            commit_count_last_background_frame: AtomicU32::new(0),
            pools: Mutex::new(Vec::new()),
            loading_mode: AtomicBool::new(false),
            continuation_spawner,
            active_waitables: Mutex::new(Vec::new()),
            staging_waitables: Mutex::new(Vec::new()),
            waitables_thread: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// The transaction table.
    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    /// Toggle loading mode (uncapped command-list budgets).
    pub fn set_loading_mode(&self, loading: bool) {
        self.loading_mode.store(loading, Ordering::Release);
    }

    /// Wake the background thread.
    pub fn trigger_wakeup_event(&self) {
        self.wakeup.increment();
    }

    fn queue_set(&self, options: TransactionOptions) -> &QueueSet {
        if options.contains(TransactionOptions::FRAME_PRIORITY) {
            // not perfectly synchronised with the barrier; frame priority
            // operations are expected to come from the barrier's thread
            &self.queue_set_frame_priority[self.frame_priority_writing_index.load(Ordering::Acquire)]
        } else {
            &self.queue_set_main
        }
    }

    fn add_queued_bytes(&self, data_type: UploadDataType, bytes: i64) {
        let after =
            self.current_queued_bytes[data_type as usize].fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug_assert!(after >= 0);
    }

    fn failed_marker(error: UploadError) -> TransactionMarker {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        TransactionMarker {
            future: receiver,
            transaction_id: TRANSACTION_ID_INVALID,
        }
    }

    fn make_marker(&self, reference: &TransactionRef) -> TransactionMarker {
        let (sender, receiver) = oneshot::channel();
        reference.transaction().payload.lock().promise = Some(sender);
        TransactionMarker {
            future: receiver,
            transaction_id: reference.id(),
        }
    }

    fn validate_packet_size(desc: &ResourceDesc, data: &dyn DataPacket) {
        if cfg!(debug_assertions) {
            if let Some(texture) = desc.texture_desc() {
                for mip in 0..texture.mip_count {
                    let id = SubresourceId { mip, array_layer: 0 };
                    let bytes = data.data(id);
                    if !bytes.is_empty() {
                        let footprint = hal::desc::subresource_footprint(texture, id);
                        debug_assert_eq!(bytes.len(), footprint.size as usize);
                    }
                }
            }
        }
    }

    //////// begin variants ////////

    /// Synchronous-data begin; see `Manager::begin_packet`.
    pub fn begin_packet(
        &self,
        desc: &ResourceDesc,
        data: Arc<dyn DataPacket>,
        pool: Option<Arc<dyn ResourcePool>>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        let reference = match self.table.allocate(options) {
            Ok(reference) => reference,
            Err(e) => return Self::failed_marker(e),
        };
        reference.transaction().payload.lock().desc = Some(desc.clone());
        Self::validate_packet_size(desc, &*data);

        // Increase the queued-bytes counter before pushing the step;
        // otherwise the consumer can process the step first and drive the
        // counter negative.
        self.add_queued_bytes(
            upload_data_type(desc, desc.bind_flags),
            i64::from(desc.byte_count()),
        );

        let marker = self.make_marker(&reference);
        self.push_create_step(
            options,
            CreateFromDataPacketStep {
                transaction: reference,
                pool,
                desc: desc.clone(),
                data,
            },
        );
        marker
    }

    /// Synchronous-data begin into an existing resource.
    pub fn begin_into_packet(
        &self,
        destination: ResourceLocator,
        data: Arc<dyn DataPacket>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        if !destination.is_whole_resource() {
            return Self::failed_marker(UploadError::InvalidDescriptor(
                "data-packet uploads into partial resources are not supported".into(),
            ));
        }
        let desc = match destination.containing_resource() {
            Some(resource) => resource.desc().clone(),
            None => {
                return Self::failed_marker(UploadError::InvalidDescriptor(
                    "destination locator is empty".into(),
                ))
            }
        };
        let reference = match self.table.allocate(options) {
            Ok(reference) => reference,
            Err(e) => return Self::failed_marker(e),
        };
        {
            let mut payload = reference.transaction().payload.lock();
            payload.desc = Some(desc.clone());
            payload.final_resource = destination;
        }
        Self::validate_packet_size(&desc, &*data);
        self.add_queued_bytes(
            upload_data_type(&desc, desc.bind_flags),
            i64::from(desc.byte_count()),
        );

        let marker = self.make_marker(&reference);
        self.push_create_step(
            options,
            CreateFromDataPacketStep {
                transaction: reference,
                pool: None,
                desc,
                data,
            },
        );
        marker
    }

    /// Asynchronous-source begin; suspends on the source's descriptor future.
    pub fn begin_async(
        self: &Arc<Self>,
        data: Arc<dyn AsyncDataSource>,
        pool: Option<Arc<dyn ResourcePool>>,
        bind_flags: BindFlags,
        options: TransactionOptions,
    ) -> TransactionMarker {
        let reference = match self.table.allocate(options) {
            Ok(reference) => reference,
            Err(e) => return Self::failed_marker(e),
        };
        let marker = self.make_marker(&reference);

        // the descriptor is often available immediately; skip the watcher
        let mut desc_future = data.desc();
        if let Some(result) = (&mut desc_future).now_or_never() {
            self.complete_wait_for_desc_future(reference, result, data, pool, bind_flags);
            return marker;
        }

        let weak_this = self.weak_self.clone();
        let cancel_probe = Arc::clone(reference.transaction());
        self.watch_cancellable(
            async move {
                let result = desc_future.await;
                match weak_this.upgrade() {
                    Some(this) => {
                        this.complete_wait_for_desc_future(reference, result, data, pool, bind_flags)
                    }
                    None => reference
                        .transaction()
                        .fulfill(Err(UploadError::AssemblyLineShutdown)),
                }
            }
            .boxed(),
            cancel_probe,
        );
        marker
    }

    /// Asynchronous-source begin into an existing resource.
    pub fn begin_into_async(
        self: &Arc<Self>,
        destination: ResourceLocator,
        data: Arc<dyn AsyncDataSource>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        let reference = match self.table.allocate(options) {
            Ok(reference) => reference,
            Err(e) => return Self::failed_marker(e),
        };
        reference.transaction().payload.lock().final_resource = destination;
        let marker = self.make_marker(&reference);

        let mut desc_future = data.desc();
        if let Some(result) = (&mut desc_future).now_or_never() {
            self.complete_wait_for_desc_future(reference, result, data, None, BindFlags::empty());
            return marker;
        }

        let weak_this = self.weak_self.clone();
        let cancel_probe = Arc::clone(reference.transaction());
        self.watch_cancellable(
            async move {
                let result = desc_future.await;
                match weak_this.upgrade() {
                    Some(this) => this.complete_wait_for_desc_future(
                        reference,
                        result,
                        data,
                        None,
                        BindFlags::empty(),
                    ),
                    None => reference
                        .transaction()
                        .fulfill(Err(UploadError::AssemblyLineShutdown)),
                }
            }
            .boxed(),
            cancel_probe,
        );
        marker
    }

    /// GPU-side reposition copy with in-flight transaction fix-up.
    pub fn begin_reposition(
        &self,
        destination: ResourceLocator,
        source: ResourceLocator,
        steps: Vec<RepositionStep>,
    ) -> RepositionMarker {
        debug_assert!(destination.is_whole_resource() && source.is_whole_resource());
        let (sender, receiver) = oneshot::channel();

        self.queued_functions.push_overflow(Box::new(
            move |line: &AssemblyLine, recording: &mut Recording| {
                let (dst, src) = match (
                    destination.containing_resource(),
                    source.containing_resource(),
                ) {
                    (Some(dst), Some(src)) => (Arc::clone(dst), Arc::clone(src)),
                    _ => {
                        let _ = sender.send(Err(UploadError::InvalidDescriptor(
                            "reposition endpoints must be resources".into(),
                        )));
                        return;
                    }
                };
                // update transactions pointing at the moved blocks, then copy
                // between the resources on the GPU
                line.apply_repositions(&dst, &src, &steps);
                recording.writer().copy_reposition_steps(&src, &dst, &steps);
                recording.metrics.context_operations += 1;
                let _ = sender.send(Ok(recording.command_list_under_construction()));
            },
        ));
        self.wakeup.increment();

        receiver
    }

    /// Flag transactions as cancelled; their next step (or the continuation
    /// wheel, for transactions still waiting on a future) fails the promise.
    pub fn cancel(&self, ids: &[TransactionId]) {
        self.table.cancel(ids);
        self.wakeup.increment();
    }

    /// Install a completion callback over a set of transactions. Registration
    /// happens on the background thread to serialise with retirement.
    pub fn on_completion(&self, ids: &[TransactionId], callback: Box<dyn FnOnce() + Send>) {
        let ids = ids.to_vec();
        self.queued_functions.push_overflow(Box::new(
            move |line: &AssemblyLine, _recording: &mut Recording| {
                line.table.attach_completion(&ids, callback);
            },
        ));
        self.wakeup.increment();
    }

    /// Synchronous creation and fill, entirely on the caller's thread. The
    /// returned locator carries no completion command list; its contents are
    /// already visible when the call returns.
    ///
    /// On devices without init-during-creation this takes a command-list
    /// attached staging path: a dedicated staging buffer, one copy, one
    /// synchronous submit.
    pub fn immediate_transaction(
        &self,
        desc: &ResourceDesc,
        data: &dyn DataPacket,
    ) -> Result<ResourceLocator, UploadError> {
        let capabilities = self.device.capabilities();
        let supports_init = match desc.kind {
            ResourceKind::Texture(_) => capabilities.init_during_creation_texture,
            ResourceKind::LinearBuffer(_) => capabilities.init_during_creation_buffer,
        };

        if supports_init {
            let resource = self
                .device
                .create_resource(desc, Some(&PacketInitializer(data)))?;
            return Ok(ResourceLocator::whole(resource));
        }

        let mut modified = desc.clone();
        modified.bind_flags |= BindFlags::TRANSFER_DST;
        let final_resource = self.device.create_resource(&modified, None)?;

        let staging_desc = ResourceDesc::linear_buffer(
            BindFlags::TRANSFER_SRC,
            AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE
                | AllocationRules::PERMANENTLY_MAPPED
                | AllocationRules::DEDICATED_PAGE,
            desc.byte_count(),
            "immediate-staging",
        );
        let staging_resource = self.device.create_resource(&staging_desc, None)?;
        write_packet_linearised(&staging_resource, 0, desc, data)?;

        let mut writer = self.device.open_command_writer(QueueClass::Graphics);
        match desc.kind {
            ResourceKind::Texture(ref texture) => {
                let mut regions = Vec::with_capacity(texture.subresource_count() as usize);
                for layer in 0..texture.array_count {
                    for mip in 0..texture.mip_count {
                        let id = SubresourceId { mip, array_layer: layer };
                        let footprint = hal::desc::subresource_footprint(texture, id);
                        regions.push(TextureCopy {
                            src_offset: footprint.offset,
                            subresource: id,
                        });
                    }
                }
                writer.copy_buffer_to_texture(&staging_resource, &final_resource, &regions);
            }
            ResourceKind::LinearBuffer(ref buffer) => {
                writer.copy_buffer(
                    &staging_resource,
                    &final_resource,
                    &[BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: buffer.size_in_bytes,
                    }],
                );
            }
        }
        let list = writer.resolve();
        self.device
            .queue(QueueClass::Graphics)
            .submit(list)
            .map_err(|e| UploadError::Submission(e.to_string()))?;
        Ok(ResourceLocator::whole(final_resource))
    }

    //////// continuation executor ////////

    /// Hand a continuation to the executor: the host's spawner when present,
    /// otherwise the background thread's polling wheel.
    pub fn watch(&self, future: BoxFuture<'static, ()>) {
        self.watch_inner(Waitable {
            future,
            cancel_probe: None,
        });
    }

    /// As `watch`, but the continuation is abandoned (and the transaction
    /// failed) when the client cancels before the future completes. With an
    /// external spawner cancellation is only observed at completion.
    fn watch_cancellable(&self, future: BoxFuture<'static, ()>, transaction: Arc<Transaction>) {
        self.watch_inner(Waitable {
            future,
            cancel_probe: Some(transaction),
        });
    }

    fn watch_inner(&self, waitable: Waitable) {
        if let Some(spawner) = &self.continuation_spawner {
            spawner.spawn(waitable.future);
            return;
        }
        let on_wheel_thread =
            *self.waitables_thread.lock() == Some(std::thread::current().id());
        if on_wheel_thread {
            self.active_waitables.lock().push(waitable);
        } else {
            self.staging_waitables.lock().push(waitable);
            self.wakeup.increment();
        }
    }

    /// Adopt the calling thread as the continuation-wheel thread.
    pub fn bind_background_thread(&self) {
        *self.waitables_thread.lock() = Some(std::thread::current().id());
    }

    fn poll_waitables(&self) -> bool {
        let mut dispatched = false;
        let mut active = self.active_waitables.lock();
        let event_waker = waker(Arc::new(EventWaker {
            wakeup: Arc::clone(&self.wakeup),
        }));
        let mut context = Context::from_waker(&event_waker);
        let mut i = 0;
        while i < active.len() {
            let cancelled = active[i]
                .cancel_probe
                .as_ref()
                .map_or(false, |t| t.is_cancelled());
            if cancelled {
                if let Some(transaction) = active[i].cancel_probe.take() {
                    transaction.fulfill(Err(UploadError::Cancelled));
                }
                // dropping the future releases its transaction reference
                active.swap_remove(i);
                dispatched = true;
                continue;
            }
            match active[i].future.poll_unpin(&mut context) {
                Poll::Ready(()) => {
                    active.swap_remove(i);
                    dispatched = true;
                }
                Poll::Pending => i += 1,
            }
        }
        dispatched
    }

    /// Run one non-blocking pass of the continuation wheel on the calling
    /// thread. The first caller adopts the wheel; other threads are ignored.
    fn drive_continuations_once(&self) -> bool {
        {
            let mut thread = self.waitables_thread.lock();
            let current = std::thread::current().id();
            match *thread {
                None => *thread = Some(current),
                Some(bound) if bound == current => {}
                Some(_) => return false,
            }
        }
        {
            let mut staged = self.staging_waitables.lock();
            let mut active = self.active_waitables.lock();
            active.append(&mut staged);
        }
        self.poll_waitables()
    }

    fn stall_while_checking_futures(&self) {
        debug_assert_eq!(
            *self.waitables_thread.lock(),
            Some(std::thread::current().id())
        );
        loop {
            let dispatched = self.drive_continuations_once();
            if self.wakeup.peek() {
                break;
            }
            if self.active_waitables.lock().is_empty() {
                break;
            }
            if dispatched {
                continue;
            }
            // wakers are wired to the wakeup event, but poll-only sources
            // make no progress without a periodic nudge
            self.wakeup.wait_timeout(Duration::from_micros(500));
        }
        self.wakeup.wait();
    }

    /// Background-thread wait: run the continuation wheel until work arrives.
    pub fn wait(&self, context: &UploadsThreadContext) {
        let start = time_marker_now();
        self.stall_while_checking_futures();
        let mut recording = context.recording();
        recording.metrics.wait_time += time_marker_now() - start;
        recording.metrics.wake_count += 1;
    }

    //////// continuation completions ////////

    fn complete_wait_for_desc_future(
        &self,
        reference: TransactionRef,
        result: Result<ResourceDesc, UploadError>,
        data: Arc<dyn AsyncDataSource>,
        pool: Option<Arc<dyn ResourcePool>>,
        bind_flags: BindFlags,
    ) {
        if reference.transaction().is_cancelled() {
            reference.transaction().fulfill(Err(UploadError::Cancelled));
            return;
        }
        match result {
            Ok(desc) => {
                let options;
                {
                    let mut payload = reference.transaction().payload.lock();
                    payload.desc = Some(desc.clone());
                    options = TransactionOptions::from_bits_truncate(payload.creation_options);
                }
                self.add_queued_bytes(
                    upload_data_type(&desc, bind_flags),
                    i64::from(desc.byte_count()),
                );
                self.push_prepare_step(
                    options,
                    PrepareStagingStep {
                        transaction: reference,
                        desc,
                        source: data,
                        pool,
                        bind_flags,
                    },
                );
            }
            Err(e) => reference.transaction().fulfill(Err(e)),
        }
    }

    fn complete_wait_for_data_future(
        &self,
        reference: TransactionRef,
        result: Result<(), UploadError>,
        staging: Option<StagingAllocation>,
        oversize: Option<Arc<dyn Resource>>,
        pool: Option<Arc<dyn ResourcePool>>,
        final_desc: ResourceDesc,
    ) {
        debug_assert!(staging.is_some() || oversize.is_some());

        if reference.transaction().is_cancelled() {
            reference.transaction().fulfill(Err(UploadError::Cancelled));
            self.add_queued_bytes(
                upload_data_type(&final_desc, final_desc.bind_flags),
                -i64::from(final_desc.byte_count()),
            );
            self.queue_staging_rollback(staging);
            return;
        }

        match result {
            Ok(()) => {
                let options = TransactionOptions::from_bits_truncate(
                    reference.transaction().payload.lock().creation_options,
                );
                self.push_transfer_step(
                    options,
                    TransferStagingToFinalStep {
                        transaction: reference,
                        pool,
                        final_desc,
                        staging,
                        oversize,
                    },
                );
            }
            Err(e) => {
                reference.transaction().fulfill(Err(e));
                self.add_queued_bytes(
                    upload_data_type(&final_desc, final_desc.bind_flags),
                    -i64::from(final_desc.byte_count()),
                );
                self.queue_staging_rollback(staging);
            }
        }
    }

    /// Staging allocations may only be touched from the step-processing
    /// thread; ones given up mid-wait travel there as a queued function and
    /// roll back once they arrive.
    fn queue_staging_rollback(&self, staging: Option<StagingAllocation>) {
        if let Some(allocation) = staging {
            self.queued_functions.push_overflow(Box::new(
                move |_line: &AssemblyLine, recording: &mut Recording| {
                    if let Some(page) = recording.staging() {
                        page.undo_allocation(allocation);
                    }
                },
            ));
            self.wakeup.increment();
        }
    }

    //////// step pushing ////////

    fn push_prepare_step(&self, options: TransactionOptions, step: PrepareStagingStep) {
        self.queue_set(options).prepare_staging.push_overflow(step);
        self.wakeup.increment();
    }

    fn push_transfer_step(&self, options: TransactionOptions, step: TransferStagingToFinalStep) {
        self.queue_set(options)
            .transfer_staging_to_final
            .push_overflow(step);
        self.wakeup.increment();
    }

    fn push_create_step(&self, options: TransactionOptions, step: CreateFromDataPacketStep) {
        self.queue_set(options)
            .create_from_data_packet
            .push_overflow(step);
        self.wakeup.increment();
    }

    //////// reposition fix-up ////////

    fn apply_repositions(
        &self,
        dst: &Arc<dyn Resource>,
        src: &Arc<dyn Resource>,
        steps: &[RepositionStep],
    ) {
        // Both final_resource and its offset change together; holding the
        // table lock keeps lookups from observing half an update.
        self.table.for_each_live(|transaction| {
            let mut payload = transaction.payload.lock();
            let locator = &payload.final_resource;
            let points_at_src = locator
                .containing_resource()
                .map_or(false, |r| Arc::ptr_eq(r, src));
            if !points_at_src {
                return;
            }
            let (start, end) = locator.range_in_containing_resource();
            let size = (end - start) as u32;
            if let Some(new_offset) = resolve_offset(start as u32, size, steps) {
                payload.final_resource = payload
                    .final_resource
                    .repositioned(dst, u64::from(new_offset));
            }
        });
    }

    fn apply_reposition_event(&self, event: &ResourceReposition) {
        self.table.for_each_live(|transaction| {
            let mut payload = transaction.payload.lock();
            let mut locator = std::mem::take(&mut payload.final_resource);
            locator.apply_reposition(event);
            payload.final_resource = locator;
        });
    }

    //////// pools ////////

    /// Attach a batched pool so the background thread drives its defrag and
    /// applies its events.
    pub fn attach_pool(&self, pool: &Arc<BatchedPages>) {
        self.pools.lock().push(PoolAttachment {
            pool: Arc::downgrade(pool),
            resolved_event: 0,
            post_publish_resolved_event: 0,
        });
        self.wakeup.increment();
    }

    fn tick_pools(&self, step_mask: StepMask) {
        if !step_mask.contains(StepMask::BATCHED_DEFRAG) {
            return;
        }
        let mut pools = self.pools.lock();
        pools.retain_mut(|attachment| {
            let pool = match attachment.pool.upgrade() {
                Some(pool) => pool,
                None => return false,
            };

            // First application: catch references added by clients while the
            // event was in flight, now that every client has processed it.
            let processed = pool.event_list_processed_id();
            while attachment.post_publish_resolved_event < processed {
                let id = attachment.post_publish_resolved_event + 1;
                if let Some(event) = pool.event_list_get(id) {
                    self.apply_reposition_event(&event);
                    pool.event_list_release_silent(id);
                }
                attachment.post_publish_resolved_event = id;
            }

            pool.tick_defrag();

            // Second application: as soon as an event becomes publishable,
            // move the in-flight transactions across so nothing new lands in
            // the old coordinate system.
            let published = pool.event_list_published_id();
            while attachment.resolved_event < published {
                let id = attachment.resolved_event + 1;
                if let Some(event) = pool.event_list_get(id) {
                    self.apply_reposition_event(&event);
                    pool.event_list_release_silent(id);
                }
                attachment.resolved_event = id;
            }
            true
        });
    }

    //////// step processing ////////

    fn process_create_from_data_packet(
        &self,
        step: &mut CreateFromDataPacketStep,
        recording: &mut Recording,
        budget: &CommandListBudget,
    ) -> StepOutcome {
        if recording.metrics.context_operations + 1 >= budget.limit_operations {
            return StepOutcome::Blocked;
        }

        let object_size = step.desc.byte_count();
        let data_type = upload_data_type(&step.desc, step.desc.bind_flags);

        if step.transaction.transaction().is_cancelled() {
            step.transaction.transaction().fulfill(Err(UploadError::Cancelled));
            self.add_queued_bytes(data_type, -i64::from(object_size));
            return StepOutcome::Done;
        }

        if recording.metrics.bytes_upload_total + u64::from(object_size)
            > budget.limit_bytes_uploaded
            && recording.metrics.bytes_upload_total != 0
        {
            return StepOutcome::Blocked;
        }

        let transaction = Arc::clone(step.transaction.transaction());
        let result = (|| -> Result<StepOutcome, UploadError> {
            let mut final_construction = std::mem::take(
                &mut transaction.payload.lock().final_resource,
            );
            let mut desc = step.desc.clone();
            let mut device_construction_invoked = false;
            let mut init_during_creation = false;

            if final_construction.is_empty() {
                // no resource provided beforehand; create it now
                if let (Some(pool), ResourceKind::LinearBuffer(buffer)) =
                    (&step.pool, &desc.kind)
                {
                    final_construction = pool.allocate(buffer.size_in_bytes, &desc.name);
                    if final_construction.is_empty() {
                        desc = pool.make_fallback_desc(buffer.size_in_bytes, &desc.name);
                    }
                }

                if final_construction.is_empty() {
                    let capabilities = self.device.capabilities();
                    let supports_init = match desc.kind {
                        ResourceKind::Texture(_) => capabilities.init_during_creation_texture,
                        ResourceKind::LinearBuffer(_) => capabilities.init_during_creation_buffer,
                    };
                    let resource = if supports_init {
                        init_during_creation = true;
                        self.device
                            .create_resource(&desc, Some(&PacketInitializer(&*step.data)))?
                    } else {
                        let mut modified = desc.clone();
                        modified.bind_flags |= BindFlags::TRANSFER_DST;
                        self.device.create_resource(&modified, None)?
                    };
                    final_construction = ResourceLocator::whole(resource);
                    device_construction_invoked = true;
                }
            }

            if !init_during_creation {
                let write_result = self.write_packet_to_final(
                    recording,
                    &final_construction,
                    &desc,
                    &*step.data,
                    data_type,
                );
                match write_result {
                    Ok(true) => {}
                    Ok(false) => {
                        // staging exhausted; keep the resource for the retry
                        transaction.payload.lock().final_resource = final_construction;
                        return Ok(StepOutcome::Blocked);
                    }
                    Err(e) => return Err(e),
                }
                recording.metrics.context_operations += 1;
            }

            let type_index = data_type as usize;
            recording.metrics.bytes_uploaded[type_index] += u64::from(object_size);
            recording.metrics.count_uploaded[type_index] += 1;
            recording.metrics.bytes_upload_total += u64::from(object_size);
            recording.metrics.bytes_created[type_index] += u64::from(object_size);
            recording.metrics.count_creations[type_index] += 1;
            if device_construction_invoked {
                recording.metrics.count_device_creations[type_index] += 1;
                recording.metrics.device_create_operations += 1;
            }

            let final_locator = ResourceLocator::with_completion(
                final_construction,
                recording.command_list_under_construction(),
            );
            transaction.fulfill(Ok(final_locator.clone()));
            transaction.payload.lock().final_resource = final_locator;
            Ok(StepOutcome::Done)
        })();

        match result {
            Ok(StepOutcome::Blocked) => StepOutcome::Blocked,
            Ok(StepOutcome::Done) => {
                self.add_queued_bytes(data_type, -i64::from(object_size));
                StepOutcome::Done
            }
            Err(e) => {
                transaction.fulfill(Err(e));
                self.add_queued_bytes(data_type, -i64::from(object_size));
                StepOutcome::Done
            }
        }
    }

    /// Move packet bytes into the final resource: a direct map when the
    /// destination is host visible, otherwise via staging (returning
    /// `Ok(false)` on staging exhaustion).
    fn write_packet_to_final(
        &self,
        recording: &mut Recording,
        final_construction: &ResourceLocator,
        desc: &ResourceDesc,
        data: &dyn DataPacket,
        data_type: UploadDataType,
    ) -> Result<bool, UploadError> {
        let resource = final_construction
            .containing_resource()
            .expect("final resource exists by now");
        debug_assert!(resource
            .desc()
            .bind_flags
            .contains(BindFlags::TRANSFER_DST)
            || resource.desc().is_host_visible());

        if resource.desc().is_host_visible() {
            // destination is mappable; write directly
            let (dst_offset, _) = final_construction.range_in_containing_resource();
            match desc.kind {
                ResourceKind::Texture(ref texture) => {
                    for layer in 0..texture.array_count {
                        for mip in 0..texture.mip_count {
                            let id = SubresourceId { mip, array_layer: layer };
                            let bytes = data.data(id);
                            if bytes.is_empty() {
                                continue;
                            }
                            let footprint = hal::desc::subresource_footprint(texture, id);
                            resource
                                .write_via_map(dst_offset as u32 + footprint.offset, bytes)?;
                        }
                    }
                }
                ResourceKind::LinearBuffer(_) => {
                    resource.write_via_map(dst_offset as u32, data.data(SubresourceId::default()))?;
                }
            }
            return Ok(true);
        }

        let object_size = desc.byte_count();
        let alignment = staging_alignment(desc);
        let max_staging = recording.staging().map_or(0, |page| page.max_size());

        if object_size <= max_staging {
            let allocation = {
                let page = recording.staging().expect("staging present");
                match page.allocate(object_size, alignment) {
                    Some(allocation) => allocation,
                    None => return Ok(false),
                }
            };
            recording.metrics.staging_bytes_allocated[data_type as usize] +=
                u64::from(allocation.allocation_size());

            let staging_resource = {
                let page = recording.staging().expect("staging present");
                Arc::clone(page.staging_resource())
            };
            if let Err(e) =
                write_packet_linearised(&staging_resource, allocation.resource_offset(), desc, data)
            {
                // nothing reached the device; rewind the heap on the spot
                // rather than queueing release-order reclamation
                if let Some(page) = recording.staging() {
                    page.undo_allocation(allocation);
                }
                return Err(e);
            }
            self.record_copy_from_staging(
                recording,
                final_construction,
                &staging_resource,
                allocation.resource_offset(),
                desc,
            );
            if let Some(page) = recording.staging() {
                page.release(allocation);
            }
        } else {
            // oversize: a dedicated short-lived staging buffer for this one
            // transfer, deleted when the command list retires
            self.update_final_resource_via_attached_staging(recording, final_construction, data)?;
        }
        Ok(true)
    }

    /// The oversize path: dedicated staging for one transfer, kept alive
    /// until the command list retires on the graphics queue.
    fn update_final_resource_via_attached_staging(
        &self,
        recording: &mut Recording,
        final_construction: &ResourceLocator,
        data: &dyn DataPacket,
    ) -> Result<(), UploadError> {
        let desc = final_construction
            .containing_resource()
            .expect("final resource exists by now")
            .desc()
            .clone();
        let staging_desc = ResourceDesc::linear_buffer(
            BindFlags::TRANSFER_SRC,
            AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE
                | AllocationRules::PERMANENTLY_MAPPED
                | AllocationRules::DEDICATED_PAGE,
            desc.byte_count(),
            "oversize-staging",
        );
        let staging_resource = self.device.create_resource(&staging_desc, None)?;
        write_packet_linearised(&staging_resource, 0, &desc, data)?;
        self.record_copy_from_staging(recording, final_construction, &staging_resource, 0, &desc);
        recording
            .deferred
            .add_delayed_delete(ResourceLocator::whole(staging_resource));
        Ok(())
    }

    /// Record the staging-to-final copy commands plus the queue-family
    /// handover when a dedicated transfer queue is in play.
    fn record_copy_from_staging(
        &self,
        recording: &mut Recording,
        final_construction: &ResourceLocator,
        staging_resource: &Arc<dyn Resource>,
        staging_offset: u32,
        desc: &ResourceDesc,
    ) {
        let final_resource = final_construction
            .containing_resource()
            .cloned()
            .expect("final resource exists by now");
        let (dst_start, _) = final_construction.range_in_containing_resource();

        match desc.kind {
            ResourceKind::Texture(ref texture) => {
                let mut regions = Vec::with_capacity(texture.subresource_count() as usize);
                for layer in 0..texture.array_count {
                    for mip in 0..texture.mip_count {
                        let id = SubresourceId { mip, array_layer: layer };
                        let footprint = hal::desc::subresource_footprint(texture, id);
                        regions.push(TextureCopy {
                            src_offset: staging_offset + footprint.offset,
                            subresource: id,
                        });
                    }
                }
                recording
                    .writer()
                    .copy_buffer_to_texture(staging_resource, &final_resource, &regions);
            }
            ResourceKind::LinearBuffer(ref buffer) => {
                let region = BufferCopy {
                    src_offset: staging_offset,
                    dst_offset: dst_start as u32,
                    size: buffer.size_in_bytes,
                };
                recording
                    .writer()
                    .copy_buffer(staging_resource, &final_resource, &[region]);
            }
        }

        if self.device.capabilities().dedicated_transfer_queue {
            recording.writer().release_to_queue_family(
                &final_resource,
                QueueClass::Transfer,
                QueueClass::Graphics,
            );
            recording.deferred.add_transfer(ResourceTransfer {
                resource: final_construction.clone(),
            });
        }
    }

    fn process_prepare_staging(
        &self,
        step: &mut PrepareStagingStep,
        recording: &mut Recording,
        budget: &CommandListBudget,
    ) -> StepOutcome {
        if recording.metrics.context_operations + 1 >= budget.limit_operations {
            return StepOutcome::Blocked;
        }

        let data_type = upload_data_type(&step.desc, step.bind_flags);
        let byte_count = step.desc.byte_count();

        if step.transaction.transaction().is_cancelled() {
            step.transaction.transaction().fulfill(Err(UploadError::Cancelled));
            self.add_queued_bytes(data_type, -i64::from(byte_count));
            return StepOutcome::Done;
        }

        let alignment = staging_alignment(&step.desc);
        let max_staging = recording.staging().map_or(0, |page| page.max_size());

        let (staging, oversize, base_ptr, base_offset) = if byte_count < max_staging {
            let allocation = {
                let page = recording.staging().expect("staging present");
                match page.allocate(byte_count, alignment) {
                    Some(allocation) => allocation,
                    None => return StepOutcome::Blocked, // staging exhausted; retry next tick
                }
            };
            recording.metrics.staging_bytes_allocated[data_type as usize] +=
                u64::from(allocation.allocation_size());
            let page = recording.staging().expect("staging present");
            let ptr = page
                .staging_resource()
                .mapped_ptr()
                .expect("staging page is permanently mapped");
            (Some(allocation), None, ptr, allocation.resource_offset())
        } else {
            let oversize_desc = ResourceDesc::linear_buffer(
                BindFlags::TRANSFER_SRC,
                AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE
                    | AllocationRules::PERMANENTLY_MAPPED
                    | AllocationRules::DEDICATED_PAGE,
                byte_count,
                "oversize-staging",
            );
            let resource = match self.device.create_resource(&oversize_desc, None) {
                Ok(resource) => resource,
                Err(e) => {
                    step.transaction.transaction().fulfill(Err(e.into()));
                    self.add_queued_bytes(data_type, -i64::from(byte_count));
                    return StepOutcome::Done;
                }
            };
            let ptr = resource
                .mapped_ptr()
                .expect("oversize staging is permanently mapped");
            (None, Some(resource), ptr, 0)
        };

        let writes = build_subresource_writes(&step.desc, base_ptr, base_offset);

        let mut final_desc = step.desc.clone();
        final_desc.bind_flags |= step.bind_flags;
        // staging feeds the final resource through a transfer
        final_desc.bind_flags |= BindFlags::TRANSFER_DST;

        let prepare_future = step.source.prepare_data(writes);
        let reference = step.transaction.clone();
        let pool = step.pool.take();
        let weak_this = self.weak_self.clone();

        self.watch(
            async move {
                let result = prepare_future.await;
                match weak_this.upgrade() {
                    Some(this) => this.complete_wait_for_data_future(
                        reference, result, staging, oversize, pool, final_desc,
                    ),
                    None => reference
                        .transaction()
                        .fulfill(Err(UploadError::AssemblyLineShutdown)),
                }
            }
            .boxed(),
        );

        StepOutcome::Done
    }

    fn process_transfer_staging_to_final(
        &self,
        step: &mut TransferStagingToFinalStep,
        recording: &mut Recording,
        budget: &CommandListBudget,
    ) -> StepOutcome {
        if recording.metrics.context_operations + 1 >= budget.limit_operations {
            return StepOutcome::Blocked;
        }

        let transaction = Arc::clone(step.transaction.transaction());
        let data_type = upload_data_type(&step.final_desc, step.final_desc.bind_flags);
        let desc_byte_count = transaction
            .payload
            .lock()
            .desc
            .as_ref()
            .map(|d| d.byte_count())
            .unwrap_or_else(|| step.final_desc.byte_count());

        if transaction.is_cancelled() {
            transaction.fulfill(Err(UploadError::Cancelled));
            self.add_queued_bytes(data_type, -i64::from(desc_byte_count));
            if let (Some(allocation), Some(page)) = (step.staging.take(), recording.staging()) {
                page.undo_allocation(allocation);
            }
            return StepOutcome::Done;
        }

        let result = (|| -> Result<(), UploadError> {
            let mut final_construction =
                std::mem::take(&mut transaction.payload.lock().final_resource);
            if final_construction.is_empty() {
                if let (Some(pool), ResourceKind::LinearBuffer(buffer)) =
                    (&step.pool, &step.final_desc.kind)
                {
                    final_construction =
                        pool.allocate(buffer.size_in_bytes, &step.final_desc.name);
                    if final_construction.is_empty() {
                        step.final_desc = pool
                            .make_fallback_desc(buffer.size_in_bytes, &step.final_desc.name);
                        step.final_desc.bind_flags |= BindFlags::TRANSFER_DST;
                    }
                }
                if final_construction.is_empty() {
                    let resource = self.device.create_resource(&step.final_desc, None)?;
                    final_construction = ResourceLocator::whole(resource);
                    recording.metrics.count_device_creations[data_type as usize] += 1;
                }
                recording.metrics.bytes_created[data_type as usize] +=
                    u64::from(step.final_desc.byte_count());
                recording.metrics.count_creations[data_type as usize] += 1;
            }

            if let Some(allocation) = step.staging.take() {
                let staging_resource = {
                    let page = recording.staging().expect("staging present");
                    Arc::clone(page.staging_resource())
                };
                self.record_copy_from_staging(
                    recording,
                    &final_construction,
                    &staging_resource,
                    allocation.resource_offset(),
                    &step.final_desc,
                );
                // the staging space must survive until the command list is
                // resolved and the device is done with it
                if let Some(page) = recording.staging() {
                    page.release(allocation);
                }
            } else {
                let oversize = step.oversize.take().expect("either staging or oversize");
                self.record_copy_from_staging(
                    recording,
                    &final_construction,
                    &oversize,
                    0,
                    &step.final_desc,
                );
                recording
                    .deferred
                    .add_delayed_delete(ResourceLocator::whole(oversize));
            }

            let final_locator = ResourceLocator::with_completion(
                final_construction,
                recording.command_list_under_construction(),
            );
            recording.metrics.bytes_upload_total += u64::from(desc_byte_count);
            recording.metrics.bytes_uploaded[data_type as usize] += u64::from(desc_byte_count);
            recording.metrics.count_uploaded[data_type as usize] += 1;
            recording.metrics.context_operations += 1;
            transaction.fulfill(Ok(final_locator.clone()));
            transaction.payload.lock().final_resource = final_locator;
            Ok(())
        })();

        if let Err(e) = result {
            transaction.fulfill(Err(e));
            if let Some(allocation) = step.staging.take() {
                if let Some(page) = recording.staging() {
                    page.undo_allocation(allocation);
                }
            }
        }
        self.add_queued_bytes(data_type, -i64::from(desc_byte_count));
        StepOutcome::Done
    }

    //////// queue-set scheduling ////////

    fn process_queue_set(
        &self,
        queue_set: &QueueSet,
        step_mask: StepMask,
        recording: &mut Recording,
        budget: &CommandListBudget,
    ) -> bool {
        let mut did_something = false;
        let mut prepare_blocked = false;
        let mut transfer_blocked = false;

        // Alternate prepare-staging with transfer-to-final so neither stalls
        // the other; a blocked queue stops being polled this tick.
        loop {
            let mut continue_looping = false;

            if step_mask.contains(StepMask::PREPARE_STAGING) && !prepare_blocked {
                if let Some(mut step) = queue_set.prepare_staging.pop() {
                    match self.process_prepare_staging(&mut step, recording, budget) {
                        StepOutcome::Done => {
                            did_something = true;
                            continue_looping = true;
                        }
                        StepOutcome::Blocked => {
                            queue_set.prepare_staging.requeue_front(step);
                            prepare_blocked = true;
                        }
                    }
                }
            }

            if step_mask.contains(StepMask::TRANSFER_STAGING_TO_FINAL) && !transfer_blocked {
                if let Some(mut step) = queue_set.transfer_staging_to_final.pop() {
                    match self.process_transfer_staging_to_final(&mut step, recording, budget) {
                        StepOutcome::Done => {
                            did_something = true;
                            continue_looping = true;
                        }
                        StepOutcome::Blocked => {
                            queue_set.transfer_staging_to_final.requeue_front(step);
                            transfer_blocked = true;
                        }
                    }
                }
            }

            if !continue_looping {
                break;
            }
        }

        if step_mask.contains(StepMask::CREATE_FROM_DATA_PACKET) {
            while let Some(mut step) = queue_set.create_from_data_packet.pop() {
                match self.process_create_from_data_packet(&mut step, recording, budget) {
                    StepOutcome::Done => did_something = true,
                    StepOutcome::Blocked => {
                        queue_set.create_from_data_packet.requeue_front(step);
                        break;
                    }
                }
            }
        }

        did_something
    }

    fn drain_priority_queue_set(
        &self,
        queue_set: &QueueSet,
        step_mask: StepMask,
        recording: &mut Recording,
    ) -> bool {
        let mut did_something = false;
        let budget = CommandListBudget::new(true);

        loop {
            let mut continue_looping = false;

            if step_mask.contains(StepMask::PREPARE_STAGING) {
                if let Some(mut step) = queue_set.prepare_staging.pop() {
                    match self.process_prepare_staging(&mut step, recording, &budget) {
                        StepOutcome::Done => did_something = true,
                        // frame priority cannot stall the barrier; the step
                        // drops to the main queue set instead
                        StepOutcome::Blocked => {
                            self.queue_set_main.prepare_staging.push_overflow(step)
                        }
                    }
                    continue_looping = true;
                }
            }

            if step_mask.contains(StepMask::TRANSFER_STAGING_TO_FINAL) {
                if let Some(mut step) = queue_set.transfer_staging_to_final.pop() {
                    match self.process_transfer_staging_to_final(&mut step, recording, &budget) {
                        StepOutcome::Done => did_something = true,
                        StepOutcome::Blocked => self
                            .queue_set_main
                            .transfer_staging_to_final
                            .push_overflow(step),
                    }
                    continue_looping = true;
                }
            }

            if !continue_looping {
                break;
            }
        }

        if step_mask.contains(StepMask::CREATE_FROM_DATA_PACKET) {
            while let Some(mut step) = queue_set.create_from_data_packet.pop() {
                match self.process_create_from_data_packet(&mut step, recording, &budget) {
                    StepOutcome::Done => did_something = true,
                    StepOutcome::Blocked => self
                        .queue_set_main
                        .create_from_data_packet
                        .push_overflow(step),
                }
            }
        }

        did_something
    }

    /// One scheduling tick: queued functions, frame-priority drains or the
    /// round-robin over the queue sets, then a command-list resolve when
    /// anything produced device work.
    pub fn process(
        &self,
        step_mask: StepMask,
        context: &UploadsThreadContext,
        pending_frame_priority: &StepQueue<usize>,
    ) {
        let is_loading = self.loading_mode.load(Ordering::Acquire);
        let budget = CommandListBudget::new(is_loading);
        let mut recording = context.recording();

        if step_mask.contains(StepMask::BACKGROUND_MISC) {
            // when there is no separate continuation-wheel pass (single
            // threaded operation), continuations progress here
            self.drive_continuations_once();

            while let Some(function) = self.queued_functions.pop() {
                function(self, &mut recording);
            }

            let commit_count = context.commit_count_current();
            if commit_count > self.commit_count_last_background_frame.load(Ordering::Acquire) {
                let mut callbacks = self.on_background_frame.lock();
                for (_, callback) in callbacks.iter_mut() {
                    callback();
                }
                self.commit_count_last_background_frame
                    .store(commit_count, Ordering::Release);
            }

            // not strictly necessary each tick, but it improves the metrics
            if let Some(page) = recording.staging() {
                page.update_consumer_marker();
            }

            // defragmentation stays off while bulk loading is in progress
            if !is_loading {
                self.tick_pools(step_mask);
            }
        }

        let mut frame_priority_resolve = false;
        if let Some(queue_set_index) = pending_frame_priority.pop() {
            // drain all frame-priority steps behind the barrier as a unit
            frame_priority_resolve = self.drain_priority_queue_set(
                &self.queue_set_frame_priority[queue_set_index],
                step_mask,
                &mut recording,
            );
        } else {
            // process the writing frame-priority set first so higher
            // priority work completes sooner, then the main set
            let writing = self.frame_priority_writing_index.load(Ordering::Acquire);
            self.process_queue_set(
                &self.queue_set_frame_priority[writing],
                step_mask,
                &mut recording,
                &budget,
            );
            self.process_queue_set(&self.queue_set_main, step_mask, &mut recording, &budget);
        }

        if step_mask.contains(StepMask::BACKGROUND_MISC) {
            let retirements = self.table.drain_retirements();
            recording.metrics.retirements.extend(retirements);
        }

        // One resolve per update at normal priority; frame-priority work
        // resolves immediately so the barrier can retire this frame.
        let something_to_resolve =
            recording.metrics.context_operations != 0 || !recording.deferred.is_empty();
        let commit_count_current = context.commit_count_current();
        let normal_priority_resolve = commit_count_current > context.commit_count_last_resolve();
        if (frame_priority_resolve || normal_priority_resolve) && something_to_resolve {
            let command_list_id = recording.command_list_under_construction();
            context.set_commit_count_last_resolve(commit_count_current);
            let assembly_line_metrics = self.calculate_metrics(&mut recording);
            recording.metrics.assembly_line_metrics = assembly_line_metrics;
            drop(recording);
            context.queue_to_hardware(Some(command_list_id));
        }
    }

    /// Rotate the frame-priority writing queue set, returning the index that
    /// now needs a barrier drain.
    pub fn flip_writing_queue_set(&self) -> usize {
        // expects all frame-priority begins and the barrier on one thread
        let old = self.frame_priority_writing_index.load(Ordering::Acquire);
        self.frame_priority_writing_index
            .store((old + 1) % self.queue_set_frame_priority.len(), Ordering::Release);
        old
    }

    /// Register a callback run on the background thread about once per frame.
    pub fn bind_on_background_frame(&self, callback: Box<dyn FnMut() + Send>) -> u32 {
        let marker = self
            .next_background_frame_marker
            .fetch_add(1, Ordering::AcqRel);
        self.on_background_frame.lock().push((marker, callback));
        marker
    }

    /// Remove a background-frame callback.
    pub fn unbind_on_background_frame(&self, marker: u32) {
        self.on_background_frame
            .lock()
            .retain(|(m, _)| *m != marker);
    }

    fn calculate_metrics(&self, recording: &mut Recording) -> AssemblyLineMetrics {
        let mut result = AssemblyLineMetrics::default();
        result.queued_prepare_staging = self.queue_set_main.prepare_staging.len() as u32;
        result.queued_transfer_staging_to_final =
            self.queue_set_main.transfer_staging_to_final.len() as u32;
        result.queued_create_from_data_packet =
            self.queue_set_main.create_from_data_packet.len() as u32;
        for queue_set in &self.queue_set_frame_priority {
            result.queued_prepare_staging += queue_set.prepare_staging.len() as u32;
            result.queued_transfer_staging_to_final +=
                queue_set.transfer_staging_to_final.len() as u32;
            result.queued_create_from_data_packet +=
                queue_set.create_from_data_packet.len() as u32;
        }
        result.peak_prepare_staging = self
            .peak_prepare_staging
            .fetch_max(result.queued_prepare_staging, Ordering::AcqRel)
            .max(result.queued_prepare_staging);
        result.peak_transfer_staging_to_final = self
            .peak_transfer_staging_to_final
            .fetch_max(result.queued_transfer_staging_to_final, Ordering::AcqRel)
            .max(result.queued_transfer_staging_to_final);
        result.peak_create_from_data_packet = self
            .peak_create_from_data_packet
            .fetch_max(result.queued_create_from_data_packet, Ordering::AcqRel)
            .max(result.queued_create_from_data_packet);
        for (i, counter) in self.current_queued_bytes.iter().enumerate() {
            result.queued_bytes[i] = counter.load(Ordering::Acquire).max(0) as u64;
        }
        result.transaction_count = self.table.allocated_count();
        result.temporary_transactions_allocated = self.table.slot_count();
        if let Some(page) = recording.staging() {
            result.staging_page_metrics = page.quick_metrics();
        }
        result
    }
}

fn resolve_offset(offset: u32, size: u32, steps: &[RepositionStep]) -> Option<u32> {
    for s in steps {
        if offset >= s.source_start && offset < s.source_end {
            debug_assert!(offset + size <= s.source_end);
            return Some(offset + s.destination - s.source_start);
        }
    }
    None
}

/// Write a packet's subresources into a mapped staging buffer at
/// `base_offset`, tightly packed in footprint order.
fn write_packet_linearised(
    staging: &Arc<dyn Resource>,
    base_offset: u32,
    desc: &ResourceDesc,
    data: &dyn DataPacket,
) -> Result<(), UploadError> {
    match desc.kind {
        ResourceKind::Texture(ref texture) => {
            for layer in 0..texture.array_count {
                for mip in 0..texture.mip_count {
                    let id = SubresourceId { mip, array_layer: layer };
                    let bytes = data.data(id);
                    if bytes.is_empty() {
                        continue;
                    }
                    let footprint = hal::desc::subresource_footprint(texture, id);
                    staging.write_via_map(base_offset + footprint.offset, bytes)?;
                }
            }
        }
        ResourceKind::LinearBuffer(_) => {
            staging.write_via_map(base_offset, data.data(SubresourceId::default()))?;
        }
    }
    Ok(())
}

/// Build the write list handed to an async source's `prepare_data`.
fn build_subresource_writes(
    desc: &ResourceDesc,
    base_ptr: *mut u8,
    base_offset: u32,
) -> Vec<SubresourceWrite> {
    use crate::packet::StagingDestination;
    match desc.kind {
        ResourceKind::Texture(ref texture) => {
            let mut writes = Vec::with_capacity(texture.subresource_count() as usize);
            for layer in 0..texture.array_count {
                for mip in 0..texture.mip_count {
                    let id = SubresourceId { mip, array_layer: layer };
                    let footprint = hal::desc::subresource_footprint(texture, id);
                    let destination = StagingDestination::new(
                        unsafe { base_ptr.add((base_offset + footprint.offset) as usize) },
                        footprint.size as usize,
                    );
                    writes.push(SubresourceWrite {
                        id,
                        destination,
                        pitches: footprint.pitches,
                    });
                }
            }
            writes
        }
        ResourceKind::LinearBuffer(ref buffer) => {
            let destination = StagingDestination::new(
                unsafe { base_ptr.add(base_offset as usize) },
                buffer.size_in_bytes as usize,
            );
            vec![SubresourceWrite {
                id: SubresourceId::default(),
                destination,
                pitches: Default::default(),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AdvanceFlags;
    use crate::packet::BasicDataPacket;
    use freight_backend_soft::SoftDevice;

    struct Rig {
        device: Arc<SoftDevice>,
        assembly: Arc<AssemblyLine>,
        context: UploadsThreadContext,
        pending: StepQueue<usize>,
    }

    impl Rig {
        fn new(staging_size: u32) -> Self {
            let device = SoftDevice::new();
            let assembly = AssemblyLine::new(Arc::clone(&device) as Arc<dyn Device>, None);
            assembly.bind_background_thread();
            let context = UploadsThreadContext::new(
                Arc::clone(&device) as Arc<dyn Device>,
                true,
                staging_size,
            )
            .unwrap();
            Rig {
                device,
                assembly,
                context,
                pending: StepQueue::new(4),
            }
        }

        fn tick(&self) {
            self.assembly
                .process(StepMask::all(), &self.context, &self.pending);
            let mut immediate = self.device.open_command_writer(QueueClass::Graphics);
            let required = self.context.command_list_latest_pending().unwrap_or(0);
            self.context
                .advance_graphics_queue(&mut *immediate, required, AdvanceFlags::empty());
            let list = immediate.resolve();
            self.device
                .queue(QueueClass::Graphics)
                .submit(list)
                .unwrap();
        }

        fn run_until_ready(
            &self,
            marker: &mut TransactionMarker,
        ) -> Result<ResourceLocator, UploadError> {
            for _ in 0..64 {
                self.tick();
                if let Ok(Some(result)) = marker.future.try_recv() {
                    return result;
                }
            }
            panic!("transaction never completed");
        }

        fn read_back(&self, locator: &ResourceLocator) -> Vec<u8> {
            let (start, end) = locator.range_in_containing_resource();
            let size = (end - start) as u32;
            let readback_desc = ResourceDesc::linear_buffer(
                BindFlags::TRANSFER_DST,
                AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE,
                size,
                "readback",
            );
            let readback = self.device.create_resource(&readback_desc, None).unwrap();
            let mut writer = self.device.open_command_writer(QueueClass::Graphics);
            writer.copy_buffer(
                locator.containing_resource().unwrap(),
                &readback,
                &[BufferCopy {
                    src_offset: start as u32,
                    dst_offset: 0,
                    size,
                }],
            );
            let list = writer.resolve();
            self.device
                .queue(QueueClass::Graphics)
                .submit(list)
                .unwrap();
            let mut out = vec![0u8; size as usize];
            readback.read_via_map(0, &mut out).unwrap();
            out
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i & 0xff) as u8).collect()
    }

    fn buffer_desc(size: u32, name: &'static str) -> ResourceDesc {
        ResourceDesc::linear_buffer(
            BindFlags::VERTEX_BUFFER,
            AllocationRules::empty(),
            size,
            name,
        )
    }

    struct NeverSource;

    impl AsyncDataSource for NeverSource {
        fn desc(&self) -> BoxFuture<'static, Result<ResourceDesc, UploadError>> {
            futures_util::future::pending().boxed()
        }

        fn prepare_data(
            &self,
            _destinations: Vec<SubresourceWrite>,
        ) -> BoxFuture<'static, Result<(), UploadError>> {
            async { Ok(()) }.boxed()
        }
    }

    #[test]
    fn packet_upload_round_trip() {
        let rig = Rig::new(0x10000);
        let data = pattern(1024);
        let mut marker = rig.assembly.begin_packet(
            &buffer_desc(1024, "round-trip"),
            BasicDataPacket::from_bytes(data.clone()),
            None,
            TransactionOptions::empty(),
        );
        assert!(marker.is_valid());
        let locator = rig.run_until_ready(&mut marker).unwrap();
        assert!(locator.completion_command_list() > 0);

        // retire the command list, then read the contents back
        for _ in 0..8 {
            rig.tick();
            if rig.context.command_list_ready_for_graphics_queue()
                >= locator.completion_command_list()
            {
                break;
            }
        }
        assert_eq!(rig.read_back(&locator), data);
    }

    #[test]
    fn staging_back_pressure_retries_until_space_returns() {
        let rig = Rig::new(0x1000);
        let first_data = pattern(0x900);
        let mut first = rig.assembly.begin_packet(
            &buffer_desc(0x900, "first"),
            BasicDataPacket::from_bytes(first_data.clone()),
            None,
            TransactionOptions::empty(),
        );
        let mut second = rig.assembly.begin_packet(
            &buffer_desc(0x900, "second"),
            BasicDataPacket::from_bytes(pattern(0x900)),
            None,
            TransactionOptions::empty(),
        );

        // the first fits; the second is blocked until the first's command
        // list makes it through the transfer queue
        rig.tick();
        assert!(matches!(first.future.try_recv(), Ok(Some(Ok(_)))));
        assert!(matches!(second.future.try_recv(), Ok(None)));

        let locator = rig.run_until_ready(&mut second).unwrap();
        assert!(locator.completion_command_list() > 0);
    }

    #[test]
    fn cancellation_before_staging_frees_the_slot() {
        let rig = Rig::new(0x1000);
        let mut marker = rig.assembly.begin_async(
            Arc::new(NeverSource),
            None,
            BindFlags::SHADER_RESOURCE,
            TransactionOptions::empty(),
        );
        assert_eq!(rig.assembly.table().allocated_count(), 1);

        rig.assembly.cancel(&[marker.transaction_id]);
        // the continuation wheel notices the flag on the next pass
        let mut result = None;
        for _ in 0..16 {
            rig.tick();
            if let Ok(Some(r)) = marker.future.try_recv() {
                result = Some(r);
                break;
            }
        }
        assert!(matches!(result, Some(Err(UploadError::Cancelled))));
        assert_eq!(rig.assembly.table().allocated_count(), 0);
    }

    #[test]
    fn frame_priority_retires_before_main_queue() {
        let rig = Rig::new(0x100000);
        let mut main_markers: Vec<_> = (0..20)
            .map(|_| {
                rig.assembly.begin_packet(
                    &buffer_desc(0x400, "main"),
                    BasicDataPacket::from_bytes(pattern(0x400)),
                    None,
                    TransactionOptions::empty(),
                )
            })
            .collect();
        let barrier_set = rig.assembly.flip_writing_queue_set();
        rig.pending.push_overflow(barrier_set);
        let mut priority_markers: Vec<_> = (0..5)
            .map(|_| {
                rig.assembly.begin_packet(
                    &buffer_desc(0x400, "priority"),
                    BasicDataPacket::from_bytes(pattern(0x400)),
                    None,
                    TransactionOptions::FRAME_PRIORITY,
                )
            })
            .collect();

        let priority_ids: Vec<_> = priority_markers
            .iter_mut()
            .map(|m| rig.run_until_ready(m).unwrap().completion_command_list())
            .collect();
        let main_ids: Vec<_> = main_markers
            .iter_mut()
            .map(|m| rig.run_until_ready(m).unwrap().completion_command_list())
            .collect();

        let max_priority = priority_ids.iter().copied().max().unwrap();
        let min_main = main_ids.iter().copied().min().unwrap();
        assert!(
            max_priority <= min_main,
            "frame priority ids {:?} should retire no later than main ids {:?}",
            priority_ids,
            main_ids
        );
    }

    #[test]
    fn oversize_upload_uses_dedicated_staging() {
        let rig = Rig::new(0x1000);
        let data = pattern(0x4000); // four times the staging page
        let mut marker = rig.assembly.begin_packet(
            &buffer_desc(0x4000, "oversize"),
            BasicDataPacket::from_bytes(data.clone()),
            None,
            TransactionOptions::empty(),
        );
        let locator = rig.run_until_ready(&mut marker).unwrap();
        for _ in 0..8 {
            rig.tick();
        }
        assert_eq!(rig.read_back(&locator), data);
    }

    #[test]
    fn failed_creation_reports_through_the_promise() {
        let rig = Rig::new(0x1000);
        // zero-sized buffers are rejected by the device
        let mut marker = rig.assembly.begin_packet(
            &buffer_desc(0, "empty"),
            BasicDataPacket::from_bytes(Vec::new()),
            None,
            TransactionOptions::empty(),
        );
        let result = rig.run_until_ready(&mut marker);
        assert!(matches!(
            result,
            Err(UploadError::ResourceCreationFailure(_))
        ));
    }
}
