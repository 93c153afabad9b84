//! Asynchronous GPU resource uploads: a transaction assembly line over a
//! transfer queue, plus a batching sub-allocator with live defragmentation.
//!
//! Clients begin upload transactions and receive a [`TransactionMarker`]
//! holding a future of the final [`ResourceLocator`]. A background thread
//! (when the device allows one) drains the work queues, writes staging
//! memory, records transfer-queue copies and retires command lists toward
//! the graphics queue, where [`Manager::update`] makes the results visible
//! to frame rendering.

#[macro_use]
extern crate bitflags;

use futures_channel::oneshot;
use std::sync::Arc;

pub use crate::batched::{
    BatchedHeapMetrics, BatchedPages, BatchedPagesConfig, BatchedResultFlags,
    BatchingSystemMetrics, EventListId, ResourceReposition,
};
pub use crate::context::{AdvanceFlags, UploadsThreadContext};
pub use crate::error::UploadError;
pub use crate::locator::{ResourceLocator, ResourcePool};
pub use crate::manager::{ManagerConfig, UploadsManager};
pub use crate::metrics::{
    AssemblyLineMetrics, CommandListMetrics, Retirement, StagingPageMetrics, UploadDataType,
};
pub use crate::packet::{
    AsyncDataSource, BasicDataPacket, DataPacket, DependencyValidation, EmptyDataPacket,
    StagingDestination, SubresourceWrite, TextureDataPacket,
};
pub use crate::staging::{StagingAllocation, StagingPage};
pub use crate::transaction::{TransactionOptions, TransactionResult};

pub mod assembly;
pub mod batched;
pub mod context;
pub mod error;
pub mod heap;
pub mod lockfree;
pub mod locator;
pub mod manager;
pub mod metrics;
pub mod packet;
pub mod staging;
pub mod transaction;

/// Identifies one upload transaction: slot index in the low 32 bits, slot
/// generation in the high 32.
pub type TransactionId = u64;

/// Identifies one resolved transfer-queue command list, minted monotonically
/// per thread context.
pub type CommandListId = u32;

/// The id no transaction carries.
pub const TRANSACTION_ID_INVALID: TransactionId = !0;

/// The id no command list carries.
pub const COMMAND_LIST_ID_INVALID: CommandListId = !0;

/// The client's handle to a transaction in flight: the future of the final
/// locator plus the transaction id for cancel/completion bookkeeping.
pub struct TransactionMarker {
    /// Resolves once with the final locator, or with the failure.
    pub future: oneshot::Receiver<TransactionResult>,
    /// The transaction the marker tracks.
    pub transaction_id: TransactionId,
}

impl TransactionMarker {
    /// Whether the marker tracks a real transaction.
    pub fn is_valid(&self) -> bool {
        self.transaction_id != TRANSACTION_ID_INVALID
    }
}

/// Future of the command list a reposition copy lands in.
pub type RepositionMarker = oneshot::Receiver<Result<CommandListId, UploadError>>;

/// Spawns future continuations when the host provides a threaded executor;
/// otherwise the background thread polls continuations itself.
pub trait ContinuationSpawner: Send + Sync {
    /// Run the future to completion on some other thread.
    fn spawn(&self, future: futures_util::future::BoxFuture<'static, ()>);
}

/// The public face of the upload subsystem.
pub trait Manager: Send + Sync {
    /// Begin an upload with synchronous data; the resource is created from
    /// `desc` (through `pool` when supplied).
    fn begin_packet(
        &self,
        desc: &hal::ResourceDesc,
        data: Arc<dyn DataPacket>,
        pool: Option<Arc<dyn ResourcePool>>,
        options: TransactionOptions,
    ) -> TransactionMarker;

    /// Begin an upload whose descriptor and data arrive asynchronously.
    fn begin_async(
        &self,
        data: Arc<dyn AsyncDataSource>,
        pool: Option<Arc<dyn ResourcePool>>,
        bind_flags: hal::BindFlags,
        options: TransactionOptions,
    ) -> TransactionMarker;

    /// Begin an upload into a caller-provided resource; no device allocation
    /// happens for the transaction.
    fn begin_into_packet(
        &self,
        destination: ResourceLocator,
        data: Arc<dyn DataPacket>,
        options: TransactionOptions,
    ) -> TransactionMarker;

    /// As `begin_into_packet`, for asynchronous sources.
    fn begin_into_async(
        &self,
        destination: ResourceLocator,
        data: Arc<dyn AsyncDataSource>,
        options: TransactionOptions,
    ) -> TransactionMarker;

    /// Begin a GPU-side reposition copy (the defragmenter's move), fixing up
    /// in-flight transactions that point into the moved ranges.
    fn begin_reposition(
        &self,
        destination: ResourceLocator,
        source: ResourceLocator,
        steps: Vec<hal::RepositionStep>,
    ) -> RepositionMarker;

    /// Best-effort cancellation; already-retired ids are ignored.
    fn cancel(&self, ids: &[TransactionId]);

    /// Invoke `callback` once every named transaction has retired.
    fn on_completion(&self, ids: &[TransactionId], callback: Box<dyn FnOnce() + Send>);

    /// Create and fill a resource synchronously on the caller's thread.
    fn immediate_transaction(
        &self,
        desc: &hal::ResourceDesc,
        data: &dyn DataPacket,
    ) -> Result<ResourceLocator, UploadError>;

    /// Whether uploads up to `id` are visible to the graphics queue.
    fn is_complete(&self, id: CommandListId) -> bool;

    /// Drive `update` until `is_complete(id)`, sleeping briefly between
    /// checks.
    fn stall_until_completion(&self, immediate: &mut dyn hal::CommandWriter, id: CommandListId);

    /// Per-frame tick on the graphics thread: process foreground steps, then
    /// retire resolved command lists into `immediate`.
    fn update(&self, immediate: &mut dyn hal::CommandWriter);

    /// Rotate the frame-priority queue set; everything begun with
    /// `FRAME_PRIORITY` since the previous barrier retires before the next
    /// frame.
    fn frame_priority_barrier(&self);

    /// Drain one record from the metrics ring; invalid when empty.
    fn pop_metrics(&self) -> CommandListMetrics;

    /// Register `callback` to run on the background thread roughly once per
    /// frame; returns the marker for unbinding.
    fn bind_on_background_frame(&self, callback: Box<dyn FnMut() + Send>) -> u32;

    /// Remove a callback registered with `bind_on_background_frame`.
    fn unbind_on_background_frame(&self, marker: u32);

    /// Attach a batched pool: the background thread drives its
    /// defragmentation and applies its reposition events to in-flight
    /// transactions.
    fn attach_pool(&self, pool: &Arc<BatchedPages>);
}

/// Create a manager over the given device.
pub fn create_manager(
    device: Arc<dyn hal::Device>,
    config: manager::ManagerConfig,
) -> Result<Arc<dyn Manager>, hal::CreationError> {
    Ok(manager::UploadsManager::new(device, config)?)
}
