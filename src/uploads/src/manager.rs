//! The manager façade: owns the assembly line, the two thread contexts and
//! the background thread.

use crate::assembly::{AssemblyLine, StepMask};
use crate::batched::BatchedPages;
use crate::context::{AdvanceFlags, UploadsThreadContext};
use crate::error::UploadError;
use crate::locator::{ResourceLocator, ResourcePool};
use crate::lockfree::StepQueue;
use crate::metrics::CommandListMetrics;
use crate::packet::{AsyncDataSource, DataPacket};
use crate::transaction::TransactionOptions;
use crate::{
    CommandListId, ContinuationSpawner, Manager, RepositionMarker, TransactionId,
    TransactionMarker, COMMAND_LIST_ID_INVALID,
};
use hal::{CommandWriter, CreationError, Device, RepositionStep, ResourceDesc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Construction options for the manager.
pub struct ManagerConfig {
    /// Size of the staging page owned by the step-processing context.
    pub staging_page_size: u32,
    /// Force the background thread on or off; `None` lets the device's
    /// capabilities decide.
    pub background_thread: Option<bool>,
    /// Start in loading mode: command-list budgets uncapped, defragmentation
    /// paused.
    pub loading_mode: bool,
    /// Threaded executor for future continuations; without one the
    /// background thread polls continuations itself.
    pub continuation_spawner: Option<Arc<dyn ContinuationSpawner>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            staging_page_size: 64 * 1024 * 1024,
            background_thread: None,
            loading_mode: false,
            continuation_spawner: None,
        }
    }
}

/// The concrete manager; clients normally hold it as `Arc<dyn Manager>`.
pub struct UploadsManager {
    assembly: Arc<AssemblyLine>,
    foreground: Arc<UploadsThreadContext>,
    background: Arc<UploadsThreadContext>,
    foreground_step_mask: StepMask,
    background_step_mask: StepMask,
    pending_frame_priority: Arc<StepQueue<usize>>,
    background_thread: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    weak_self: Weak<UploadsManager>,
}

const ALL_STEPS: StepMask = StepMask::all();

impl UploadsManager {
    /// Build the manager, spawning the background thread when the device can
    /// feed a transfer queue independently of the graphics thread.
    pub fn new(
        device: Arc<dyn Device>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>, CreationError> {
        let assembly = AssemblyLine::new(Arc::clone(&device), config.continuation_spawner.clone());
        assembly.set_loading_mode(config.loading_mode);

        // Without a queue the background thread can own, hot steps fall back
        // to the graphics thread.
        let multithreading_ok = config
            .background_thread
            .unwrap_or_else(|| device.capabilities().dedicated_transfer_queue);

        let (foreground_step_mask, background_step_mask) = if multithreading_ok {
            (StepMask::empty(), ALL_STEPS)
        } else {
            (ALL_STEPS, StepMask::empty())
        };

        let foreground = Arc::new(UploadsThreadContext::new(
            Arc::clone(&device),
            !foreground_step_mask.is_empty(),
            config.staging_page_size,
        )?);
        let background = Arc::new(UploadsThreadContext::new(
            Arc::clone(&device),
            !background_step_mask.is_empty(),
            config.staging_page_size,
        )?);

        let pending_frame_priority = Arc::new(StepQueue::new(4));
        let shutdown = Arc::new(AtomicBool::new(false));

        let manager = Arc::new_cyclic(|weak_self| UploadsManager {
            assembly: Arc::clone(&assembly),
            foreground,
            background: Arc::clone(&background),
            foreground_step_mask,
            background_step_mask,
            pending_frame_priority: Arc::clone(&pending_frame_priority),
            background_thread: Mutex::new(None),
            shutdown: Arc::clone(&shutdown),
            weak_self: weak_self.clone(),
        });

        if !background_step_mask.is_empty() {
            let thread_assembly = assembly;
            let thread_context = background;
            let thread_pending = pending_frame_priority;
            let thread_shutdown = shutdown;
            let handle = thread::Builder::new()
                .name("buffer-uploads".into())
                .spawn(move || {
                    thread_context.bind_thread();
                    thread_assembly.bind_background_thread();
                    while !thread_shutdown.load(Ordering::Acquire) {
                        thread_assembly.process(
                            background_step_mask,
                            &thread_context,
                            &thread_pending,
                        );
                        if !thread_shutdown.load(Ordering::Acquire) {
                            thread_assembly.wait(&thread_context);
                        }
                    }
                })
                .expect("spawning the uploads background thread");
            *manager.background_thread.lock() = Some(handle);
        }

        Ok(manager)
    }

    fn active_context(&self) -> &UploadsThreadContext {
        if !self.background_step_mask.is_empty() {
            &self.background
        } else {
            &self.foreground
        }
    }
}

impl Manager for UploadsManager {
    fn begin_packet(
        &self,
        desc: &ResourceDesc,
        data: Arc<dyn DataPacket>,
        pool: Option<Arc<dyn ResourcePool>>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        self.assembly.begin_packet(desc, data, pool, options)
    }

    fn begin_async(
        &self,
        data: Arc<dyn AsyncDataSource>,
        pool: Option<Arc<dyn ResourcePool>>,
        bind_flags: hal::BindFlags,
        options: TransactionOptions,
    ) -> TransactionMarker {
        self.assembly.begin_async(data, pool, bind_flags, options)
    }

    fn begin_into_packet(
        &self,
        destination: ResourceLocator,
        data: Arc<dyn DataPacket>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        self.assembly.begin_into_packet(destination, data, options)
    }

    fn begin_into_async(
        &self,
        destination: ResourceLocator,
        data: Arc<dyn AsyncDataSource>,
        options: TransactionOptions,
    ) -> TransactionMarker {
        self.assembly.begin_into_async(destination, data, options)
    }

    fn begin_reposition(
        &self,
        destination: ResourceLocator,
        source: ResourceLocator,
        steps: Vec<RepositionStep>,
    ) -> RepositionMarker {
        self.assembly.begin_reposition(destination, source, steps)
    }

    fn cancel(&self, ids: &[TransactionId]) {
        self.assembly.cancel(ids);
    }

    fn on_completion(&self, ids: &[TransactionId], callback: Box<dyn FnOnce() + Send>) {
        self.assembly.on_completion(ids, callback);
    }

    fn immediate_transaction(
        &self,
        desc: &ResourceDesc,
        data: &dyn DataPacket,
    ) -> Result<ResourceLocator, UploadError> {
        self.assembly.immediate_transaction(desc, data)
    }

    fn is_complete(&self, id: CommandListId) -> bool {
        id <= self.active_context().command_list_ready_for_graphics_queue()
    }

    fn stall_until_completion(&self, immediate: &mut dyn CommandWriter, id: CommandListId) {
        if id == 0 || id == COMMAND_LIST_ID_INVALID {
            return;
        }
        while !self.is_complete(id) {
            self.update(immediate);
            thread::sleep(Duration::from_micros(500));
        }
    }

    fn update(&self, immediate: &mut dyn CommandWriter) {
        if !self.foreground_step_mask.is_empty() {
            self.assembly.process(
                self.foreground_step_mask,
                &self.foreground,
                &self.pending_frame_priority,
            );
        }

        self.foreground.advance_frame_id();
        self.background.advance_frame_id();

        let foreground_required = self
            .foreground
            .command_list_latest_pending()
            .unwrap_or(0);
        self.foreground
            .advance_graphics_queue(immediate, foreground_required, AdvanceFlags::empty());
        let background_required = self
            .background
            .command_list_latest_pending()
            .unwrap_or(0);
        self.background
            .advance_graphics_queue(immediate, background_required, AdvanceFlags::empty());

        // the assembly line schedules one resolve per commit; wake it so it
        // notices the new commit count
        self.assembly.trigger_wakeup_event();
    }

    fn frame_priority_barrier(&self) {
        let old_queue_set = self.assembly.flip_writing_queue_set();
        if !self.background_step_mask.is_empty() {
            while self.pending_frame_priority.push(old_queue_set).is_err() {
                self.assembly.trigger_wakeup_event();
                thread::yield_now();
            }
            self.assembly.trigger_wakeup_event();
        } else {
            self.pending_frame_priority.push_overflow(old_queue_set);
        }
    }

    fn pop_metrics(&self) -> CommandListMetrics {
        let result = self.background.pop_metrics();
        if result.is_valid() {
            return result;
        }
        self.foreground.pop_metrics()
    }

    fn bind_on_background_frame(&self, callback: Box<dyn FnMut() + Send>) -> u32 {
        self.assembly.bind_on_background_frame(callback)
    }

    fn unbind_on_background_frame(&self, marker: u32) {
        self.assembly.unbind_on_background_frame(marker)
    }

    fn attach_pool(&self, pool: &Arc<BatchedPages>) {
        let weak: Weak<dyn Manager> = self.weak_self.clone();
        pool.bind_manager(weak);
        self.assembly.attach_pool(pool);
    }
}

impl Drop for UploadsManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.assembly.trigger_wakeup_event();
        if let Some(handle) = self.background_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
