//! Command-list recording for transfer work.

use crate::desc::SubresourceId;
use crate::device::Resource;
use crate::queue::{QueueMarker, TimelineSemaphore};
use crate::RepositionStep;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A buffer-to-buffer copy region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    /// Byte offset in the source buffer.
    pub src_offset: u32,
    /// Byte offset in the destination buffer.
    pub dst_offset: u32,
    /// Number of bytes to copy.
    pub size: u32,
}

/// A buffer-to-texture copy writing one whole subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureCopy {
    /// Byte offset of the subresource data in the source buffer.
    pub src_offset: u32,
    /// Destination subresource.
    pub subresource: SubresourceId,
}

/// A resolved, immutable command list ready for queue submission.
pub trait CommandList: Send + fmt::Debug {
    /// Downcast support for backends.
    fn as_any(&self) -> &dyn Any;
}

/// Records transfer commands into an open command list.
///
/// A writer always has an open list; `resolve` closes it and implicitly
/// begins a fresh one.
pub trait CommandWriter: Send + fmt::Debug {
    /// Record buffer-to-buffer copies.
    fn copy_buffer(
        &mut self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferCopy],
    );

    /// Record copies of whole subresources from a linear staging buffer into
    /// a texture.
    fn copy_buffer_to_texture(
        &mut self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[TextureCopy],
    );

    /// Record a repositioning copy (the defragmentation case).
    fn copy_reposition_steps(
        &mut self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        steps: &[RepositionStep],
    ) {
        let regions: Vec<BufferCopy> = steps
            .iter()
            .map(|s| BufferCopy {
                src_offset: s.source_start,
                dst_offset: s.destination,
                size: s.len(),
            })
            .collect();
        self.copy_buffer(src, dst, &regions);
    }

    /// Record a queue-family ownership release of the resource, the transfer
    /// side of moving it to another queue.
    fn release_to_queue_family(
        &mut self,
        resource: &Arc<dyn Resource>,
        from: crate::queue::QueueClass,
        to: crate::queue::QueueClass,
    );

    /// Record a queue-family ownership acquire, pairing an earlier release.
    fn acquire_from_queue_family(
        &mut self,
        resource: &Arc<dyn Resource>,
        from: crate::queue::QueueClass,
        to: crate::queue::QueueClass,
    );

    /// Append a signal of `timeline` to `value` that fires when the list
    /// completes on its queue.
    fn signal_on_completion(&mut self, timeline: &Arc<dyn TimelineSemaphore>, value: QueueMarker);

    /// Make the queue wait until `timeline` reaches `value` before beginning
    /// the list.
    fn wait_before_begin(&mut self, timeline: &Arc<dyn TimelineSemaphore>, value: QueueMarker);

    /// Record a no-op command. Some drivers drop completion signals attached
    /// to empty command lists, so callers insert one of these before
    /// signalling on an otherwise empty list.
    fn nop(&mut self);

    /// Whether any command has been recorded since the last `resolve`.
    fn has_commands(&self) -> bool;

    /// Close the open list and return it for submission; recording continues
    /// into a fresh list.
    fn resolve(&mut self) -> Box<dyn CommandList>;
}
