//! Software backend implementation to exercise the upload subsystem outside
//! of a graphics development environment.
//!
//! Unlike a dummy backend, resources here really hold bytes and queues really
//! execute copies, so round-trip tests can read their data back. Queue
//! execution is synchronous at submission time: a command list's copies run
//! and its timeline signals fire inside `Queue::submit`. Waits recorded on a
//! command list are checked, not blocked on; an unsatisfied wait in a
//! synchronous executor would be a scheduling bug in the caller, and is
//! logged.

use hal::{
    BufferCopy, Capabilities, CommandList, CommandWriter, CreationError, Device, MapError,
    MarkerStatus, Queue, QueueClass, QueueMarker, QueueTracker, Resource, ResourceDesc,
    ResourceInitializer, ResourceKind, SubmissionError, TextureCopy, TimelineSemaphore,
};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Contents of a soft resource.
///
/// The byte storage is behind an `UnsafeCell` so that `mapped_ptr` can hand
/// out a stable address with the same aliasing discipline real mapped GPU
/// memory has: callers must keep concurrent writers to disjoint ranges.
struct Storage {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(size: usize) -> Self {
        Storage {
            bytes: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn len(&self) -> usize {
        unsafe { (&*self.bytes.get()).len() }
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr().add(offset), data.len());
        }
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }
}

/// A buffer or texture with its contents in host memory.
pub struct SoftResource {
    desc: ResourceDesc,
    storage: Storage,
}

impl fmt::Debug for SoftResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SoftResource")
            .field("name", &self.desc.name)
            .field("bytes", &self.storage.len())
            .finish()
    }
}

impl SoftResource {
    fn new(desc: ResourceDesc) -> Self {
        let size = desc.byte_count() as usize;
        SoftResource {
            desc,
            storage: Storage::new(size),
        }
    }

    fn copy_from(&self, src: &SoftResource, regions: &[BufferCopy]) {
        for r in regions {
            debug_assert!((r.src_offset + r.size) as usize <= src.storage.len());
            debug_assert!((r.dst_offset + r.size) as usize <= self.storage.len());
            let mut tmp = vec![0u8; r.size as usize];
            src.storage.read(r.src_offset as usize, &mut tmp);
            self.storage.write(r.dst_offset as usize, &tmp);
        }
    }
}

impl Resource for SoftResource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        if self.desc.is_host_visible() {
            Some(self.storage.ptr())
        } else {
            None
        }
    }

    fn write_via_map(&self, offset: u32, data: &[u8]) -> Result<(), MapError> {
        if !self.desc.is_host_visible() {
            return Err(MapError::NotHostVisible);
        }
        if offset as usize + data.len() > self.storage.len() {
            return Err(MapError::OutOfBounds);
        }
        self.storage.write(offset as usize, data);
        Ok(())
    }

    fn read_via_map(&self, offset: u32, out: &mut [u8]) -> Result<(), MapError> {
        if !self.desc.is_host_visible() {
            return Err(MapError::NotHostVisible);
        }
        if offset as usize + out.len() > self.storage.len() {
            return Err(MapError::OutOfBounds);
        }
        self.storage.read(offset as usize, out);
        Ok(())
    }
}

/// Timeline semaphore backed by an atomic.
#[derive(Debug, Default)]
pub struct SoftTimeline {
    value: AtomicU64,
}

impl SoftTimeline {
    fn signal(&self, value: QueueMarker) {
        self.value.fetch_max(value, Ordering::SeqCst);
    }
}

impl TimelineSemaphore for SoftTimeline {
    fn signalled_value(&self) -> QueueMarker {
        self.value.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Command {
    CopyBuffer {
        src: Arc<dyn Resource>,
        dst: Arc<dyn Resource>,
        regions: Vec<BufferCopy>,
    },
    CopyTexture {
        src: Arc<dyn Resource>,
        dst: Arc<dyn Resource>,
        regions: Vec<TextureCopy>,
    },
    Signal {
        timeline: Arc<dyn TimelineSemaphore>,
        value: QueueMarker,
    },
    Wait {
        timeline: Arc<dyn TimelineSemaphore>,
        value: QueueMarker,
    },
    QueueFamilyOp {
        _resource: Arc<dyn Resource>,
        release: bool,
    },
    Nop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::CopyBuffer { regions, .. } => {
                write!(f, "CopyBuffer({} regions)", regions.len())
            }
            Command::CopyTexture { regions, .. } => {
                write!(f, "CopyTexture({} regions)", regions.len())
            }
            Command::Signal { value, .. } => write!(f, "Signal({})", value),
            Command::Wait { value, .. } => write!(f, "Wait({})", value),
            Command::QueueFamilyOp { release, .. } => {
                write!(f, "QueueFamilyOp(release: {})", release)
            }
            Command::Nop => write!(f, "Nop"),
        }
    }
}

/// A resolved soft command list: the recorded commands plus the queue marker
/// assigned at resolve time.
#[derive(Debug)]
pub struct SoftCommandList {
    commands: Vec<Command>,
    marker: QueueMarker,
}

impl CommandList for SoftCommandList {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct TrackerState {
    // marker of the command list currently under construction
    producer: AtomicU64,
    consumer: AtomicU64,
}

/// Queue progress tracker shared between the queue and its writers.
#[derive(Debug)]
pub struct SoftTracker {
    state: Arc<TrackerState>,
}

impl QueueTracker for SoftTracker {
    fn producer_marker(&self) -> QueueMarker {
        self.state.producer.load(Ordering::SeqCst)
    }

    fn consumer_marker(&self) -> QueueMarker {
        self.state.consumer.load(Ordering::SeqCst)
    }

    fn marker_status(&self, marker: QueueMarker) -> MarkerStatus {
        if marker == 0 {
            MarkerStatus::Abandoned
        } else if self.state.consumer.load(Ordering::SeqCst) >= marker {
            MarkerStatus::ConsumerCompleted
        } else {
            MarkerStatus::Pending
        }
    }
}

/// A queue that executes submitted command lists immediately.
#[derive(Debug)]
pub struct SoftQueue {
    class: QueueClass,
    tracker: SoftTracker,
    // serialises submissions so copies of one list never interleave with another
    submit_lock: Mutex<()>,
}

impl SoftQueue {
    fn new(class: QueueClass) -> Self {
        SoftQueue {
            class,
            tracker: SoftTracker {
                state: Arc::new(TrackerState {
                    producer: AtomicU64::new(1),
                    consumer: AtomicU64::new(0),
                }),
            },
            submit_lock: Mutex::new(()),
        }
    }

    fn execute(&self, list: &SoftCommandList) -> Result<(), SubmissionError> {
        for command in &list.commands {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    let src = src
                        .as_any()
                        .downcast_ref::<SoftResource>()
                        .ok_or_else(|| SubmissionError::Rejected("foreign resource".into()))?;
                    let dst = dst
                        .as_any()
                        .downcast_ref::<SoftResource>()
                        .ok_or_else(|| SubmissionError::Rejected("foreign resource".into()))?;
                    dst.copy_from(src, regions);
                }
                Command::CopyTexture { src, dst, regions } => {
                    let src_soft = src
                        .as_any()
                        .downcast_ref::<SoftResource>()
                        .ok_or_else(|| SubmissionError::Rejected("foreign resource".into()))?;
                    let dst_soft = dst
                        .as_any()
                        .downcast_ref::<SoftResource>()
                        .ok_or_else(|| SubmissionError::Rejected("foreign resource".into()))?;
                    let tex = dst_soft
                        .desc
                        .texture_desc()
                        .ok_or_else(|| SubmissionError::Rejected("copy target not a texture".into()))?;
                    let buffer_regions: Vec<BufferCopy> = regions
                        .iter()
                        .map(|r| {
                            let footprint = hal::desc::subresource_footprint(tex, r.subresource);
                            BufferCopy {
                                src_offset: r.src_offset,
                                dst_offset: footprint.offset,
                                size: footprint.size,
                            }
                        })
                        .collect();
                    dst_soft.copy_from(src_soft, &buffer_regions);
                }
                Command::Signal { timeline, value } => {
                    timeline
                        .as_any()
                        .downcast_ref::<SoftTimeline>()
                        .ok_or_else(|| SubmissionError::Rejected("foreign timeline".into()))?
                        .signal(*value);
                }
                Command::Wait { timeline, value } => {
                    // Synchronous execution: anything this list depends on must
                    // already have been submitted.
                    if timeline.signalled_value() < *value {
                        log::warn!(
                            "soft queue wait on {} not yet signalled (at {})",
                            value,
                            timeline.signalled_value()
                        );
                    }
                }
                // ownership transfers need no work in a shared-memory device
                Command::QueueFamilyOp { .. } => {}
                Command::Nop => {}
            }
        }
        Ok(())
    }
}

impl Queue for SoftQueue {
    fn class(&self) -> QueueClass {
        self.class
    }

    fn submit(&self, list: Box<dyn CommandList>) -> Result<(), SubmissionError> {
        let list = list
            .as_any()
            .downcast_ref::<SoftCommandList>()
            .ok_or_else(|| SubmissionError::Rejected("foreign command list".into()))?;
        let _guard = self.submit_lock.lock();
        self.execute(list)?;
        if list.marker != 0 {
            self.tracker.state.consumer.fetch_max(list.marker, Ordering::SeqCst);
        }
        Ok(())
    }

    fn tracker(&self) -> &dyn QueueTracker {
        &self.tracker
    }
}

/// Command writer recording into an in-memory command list.
#[derive(Debug)]
pub struct SoftCommandWriter {
    commands: Vec<Command>,
    tracker: Arc<TrackerState>,
}

impl CommandWriter for SoftCommandWriter {
    fn copy_buffer(
        &mut self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferCopy],
    ) {
        self.commands.push(Command::CopyBuffer {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            regions: regions.to_vec(),
        });
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[TextureCopy],
    ) {
        self.commands.push(Command::CopyTexture {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            regions: regions.to_vec(),
        });
    }

    fn release_to_queue_family(
        &mut self,
        resource: &Arc<dyn Resource>,
        _from: QueueClass,
        _to: QueueClass,
    ) {
        self.commands.push(Command::QueueFamilyOp {
            _resource: Arc::clone(resource),
            release: true,
        });
    }

    fn acquire_from_queue_family(
        &mut self,
        resource: &Arc<dyn Resource>,
        _from: QueueClass,
        _to: QueueClass,
    ) {
        self.commands.push(Command::QueueFamilyOp {
            _resource: Arc::clone(resource),
            release: false,
        });
    }

    fn signal_on_completion(&mut self, timeline: &Arc<dyn TimelineSemaphore>, value: QueueMarker) {
        self.commands.push(Command::Signal {
            timeline: Arc::clone(timeline),
            value,
        });
    }

    fn wait_before_begin(&mut self, timeline: &Arc<dyn TimelineSemaphore>, value: QueueMarker) {
        // executed first regardless of recording order
        self.commands.insert(
            0,
            Command::Wait {
                timeline: Arc::clone(timeline),
                value,
            },
        );
    }

    fn nop(&mut self) {
        self.commands.push(Command::Nop);
    }

    fn has_commands(&self) -> bool {
        self.commands
            .iter()
            .any(|c| !matches!(c, Command::Wait { .. }))
    }

    fn resolve(&mut self) -> Box<dyn CommandList> {
        let marker = self.tracker.producer.fetch_add(1, Ordering::SeqCst);
        Box::new(SoftCommandList {
            commands: std::mem::take(&mut self.commands),
            marker,
        })
    }
}

/// The software device.
#[derive(Debug)]
pub struct SoftDevice {
    capabilities: Capabilities,
    graphics_queue: Arc<SoftQueue>,
    transfer_queue: Arc<SoftQueue>,
}

impl SoftDevice {
    /// Create a device with Vulkan-like capabilities: no init-during-creation
    /// and a dedicated transfer queue.
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(Capabilities {
            init_during_creation_texture: false,
            init_during_creation_buffer: false,
            dedicated_transfer_queue: true,
        })
    }

    /// Create a device with explicit capabilities.
    pub fn with_capabilities(capabilities: Capabilities) -> Arc<Self> {
        let graphics_queue = Arc::new(SoftQueue::new(QueueClass::Graphics));
        let transfer_queue = if capabilities.dedicated_transfer_queue {
            Arc::new(SoftQueue::new(QueueClass::Transfer))
        } else {
            Arc::clone(&graphics_queue)
        };
        Arc::new(SoftDevice {
            capabilities,
            graphics_queue,
            transfer_queue,
        })
    }
}

impl Device for SoftDevice {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        init: Option<&dyn ResourceInitializer>,
    ) -> Result<Arc<dyn Resource>, CreationError> {
        match desc.kind {
            ResourceKind::LinearBuffer(ref b) if b.size_in_bytes == 0 => {
                return Err(CreationError::Unsupported("zero sized buffer".into()));
            }
            _ => {}
        }
        let resource = SoftResource::new(desc.clone());
        if let Some(init) = init {
            match desc.kind {
                ResourceKind::LinearBuffer(_) => {
                    if !self.capabilities.init_during_creation_buffer {
                        return Err(CreationError::Unsupported(
                            "buffer init during creation".into(),
                        ));
                    }
                    let data = init.init_data(Default::default());
                    resource.storage.write(0, data.data);
                }
                ResourceKind::Texture(ref tex) => {
                    if !self.capabilities.init_during_creation_texture {
                        return Err(CreationError::Unsupported(
                            "texture init during creation".into(),
                        ));
                    }
                    for layer in 0..tex.array_count {
                        for mip in 0..tex.mip_count {
                            let id = hal::SubresourceId {
                                mip,
                                array_layer: layer,
                            };
                            let data = init.init_data(id);
                            if data.data.is_empty() {
                                continue;
                            }
                            let footprint = hal::desc::subresource_footprint(tex, id);
                            resource.storage.write(footprint.offset as usize, data.data);
                        }
                    }
                }
            }
        }
        log::trace!("created soft resource {:?} ({} bytes)", desc.name, desc.byte_count());
        Ok(Arc::new(resource))
    }

    fn open_command_writer(&self, class: QueueClass) -> Box<dyn CommandWriter> {
        let queue = match class {
            QueueClass::Graphics => &self.graphics_queue,
            QueueClass::Transfer => &self.transfer_queue,
        };
        Box::new(SoftCommandWriter {
            commands: Vec::new(),
            tracker: Arc::clone(&queue.tracker.state),
        })
    }

    fn queue(&self, class: QueueClass) -> Arc<dyn Queue> {
        match class {
            QueueClass::Graphics => self.graphics_queue.clone(),
            QueueClass::Transfer => self.transfer_queue.clone(),
        }
    }

    fn create_timeline_semaphore(&self) -> Arc<dyn TimelineSemaphore> {
        Arc::new(SoftTimeline::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::{AllocationRules, BindFlags};

    fn buffer_desc(size: u32) -> ResourceDesc {
        ResourceDesc::linear_buffer(
            BindFlags::TRANSFER_SRC | BindFlags::TRANSFER_DST,
            AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE,
            size,
            "test",
        )
    }

    #[test]
    fn copy_moves_bytes_between_resources() {
        let device = SoftDevice::new();
        let src = device.create_resource(&buffer_desc(64), None).unwrap();
        let dst = device.create_resource(&buffer_desc(64), None).unwrap();
        src.write_via_map(0, &[7u8; 64]).unwrap();

        let mut writer = device.open_command_writer(QueueClass::Transfer);
        writer.copy_buffer(
            &src,
            &dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 16,
                size: 32,
            }],
        );
        let list = writer.resolve();
        device.queue(QueueClass::Transfer).submit(list).unwrap();

        let mut out = [0u8; 64];
        dst.read_via_map(0, &mut out).unwrap();
        assert_eq!(&out[16..48], &[7u8; 32][..]);
        assert_eq!(&out[0..16], &[0u8; 16][..]);
    }

    #[test]
    fn submit_advances_consumer_marker() {
        let device = SoftDevice::new();
        let queue = device.queue(QueueClass::Transfer);
        assert_eq!(queue.tracker().consumer_marker(), 0);

        let mut writer = device.open_command_writer(QueueClass::Transfer);
        let produced = queue.tracker().producer_marker();
        writer.nop();
        let list = writer.resolve();
        queue.submit(list).unwrap();
        assert_eq!(queue.tracker().consumer_marker(), produced);
        assert_eq!(
            queue.tracker().marker_status(produced),
            MarkerStatus::ConsumerCompleted
        );
    }

    #[test]
    fn timeline_signal_is_monotonic() {
        let device = SoftDevice::new();
        let timeline = device.create_timeline_semaphore();
        let queue = device.queue(QueueClass::Transfer);

        let mut writer = device.open_command_writer(QueueClass::Transfer);
        writer.nop();
        writer.signal_on_completion(&timeline, 5);
        queue.submit(writer.resolve()).unwrap();
        assert_eq!(timeline.signalled_value(), 5);

        let mut writer = device.open_command_writer(QueueClass::Transfer);
        writer.nop();
        writer.signal_on_completion(&timeline, 3);
        queue.submit(writer.resolve()).unwrap();
        assert_eq!(timeline.signalled_value(), 5);
    }
}
