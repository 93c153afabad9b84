//! The device trait family: resource creation, mapping and queue access.

use crate::command::CommandWriter;
use crate::desc::{ResourceDesc, SubresourceId, TexturePitches};
use crate::queue::{Queue, QueueClass, TimelineSemaphore};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error creating a device resource.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum CreationError {
    /// The device is out of the memory class the descriptor requires.
    #[error("out of device memory")]
    OutOfMemory,
    /// The descriptor asked for something the device cannot express.
    #[error("unsupported descriptor: {0}")]
    Unsupported(String),
    /// The device was lost.
    #[error("device lost")]
    DeviceLost,
}

/// Error mapping a resource for CPU access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// The resource is not host visible.
    #[error("resource is not host visible")]
    NotHostVisible,
    /// The requested range falls outside the resource.
    #[error("map range out of bounds")]
    OutOfBounds,
}

/// Initialisation data for one subresource, handed to the device when a
/// resource is created with its contents in place.
#[derive(Clone, Copy, Debug)]
pub struct SubresourceInitData<'a> {
    /// The bytes of the subresource.
    pub data: &'a [u8],
    /// Pitches describing the layout of `data`.
    pub pitches: TexturePitches,
}

/// Supplies per-subresource initialisation data during resource creation.
pub trait ResourceInitializer {
    /// Data for the given subresource; an empty slice means "leave
    /// uninitialised".
    fn init_data(&self, subres: SubresourceId) -> SubresourceInitData<'_>;
}

/// What the device can and cannot do; the upload core branches on these
/// rather than on backend identity.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    /// Whether textures can be created with their contents supplied in the
    /// creation call.
    pub init_during_creation_texture: bool,
    /// Whether linear buffers can be created with their contents supplied in
    /// the creation call.
    pub init_during_creation_buffer: bool,
    /// Whether the device exposes a dedicated transfer queue distinct from
    /// the graphics queue.
    pub dedicated_transfer_queue: bool,
}

/// A device resource: a buffer or texture with device memory bound.
pub trait Resource: Send + Sync + fmt::Debug {
    /// The descriptor the resource was created with.
    fn desc(&self) -> &ResourceDesc;

    /// Downcast support for backends.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Base address of the permanently mapped memory, when the resource was
    /// created host visible and permanently mapped. The caller is responsible
    /// for keeping concurrent writers to disjoint ranges.
    fn mapped_ptr(&self) -> Option<*mut u8>;

    /// Copy `data` into the resource at `offset` through a CPU map.
    fn write_via_map(&self, offset: u32, data: &[u8]) -> Result<(), MapError>;

    /// Copy bytes out of the resource at `offset` through a CPU map.
    fn read_via_map(&self, offset: u32, out: &mut [u8]) -> Result<(), MapError>;
}

/// The device: creates resources, opens command writers, exposes queues.
pub trait Device: Send + Sync + fmt::Debug {
    /// What this device supports.
    fn capabilities(&self) -> Capabilities;

    /// Create a resource, optionally initialising its contents in the same
    /// call (only legal when the matching capability bit is set).
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        init: Option<&dyn ResourceInitializer>,
    ) -> Result<Arc<dyn Resource>, CreationError>;

    /// Open a command writer recording for the given queue class.
    fn open_command_writer(&self, class: QueueClass) -> Box<dyn CommandWriter>;

    /// The queue of the given class. When the device has no dedicated
    /// transfer queue, `Transfer` returns the graphics queue.
    fn queue(&self, class: QueueClass) -> Arc<dyn Queue>;

    /// Create a timeline semaphore starting at zero.
    fn create_timeline_semaphore(&self) -> Arc<dyn TimelineSemaphore>;
}
