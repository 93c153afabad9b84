#![deny(missing_docs)]

//! Low-level device abstraction consumed by the freight upload subsystem.
//!
//! This crate only describes what the upload core needs from a Vulkan-class
//! driver: resource creation, host-visible mapping, transfer/graphics queues
//! synchronised through timeline semaphores, and command-list recording for
//! buffer copies. It deliberately does not attempt to be a complete graphics
//! API; rendering concerns live with the host.

#[macro_use]
extern crate bitflags;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;

use std::fmt;

pub use self::command::{BufferCopy, CommandList, CommandWriter, TextureCopy};
pub use self::desc::{
    AllocationRules, BindFlags, Dimensionality, LinearBufferDesc, ResourceDesc, ResourceKind,
    SubresourceFootprint, SubresourceId, TextureDesc, TexturePitches,
};
pub use self::device::{
    Capabilities, CreationError, Device, MapError, Resource, ResourceInitializer,
    SubresourceInitData,
};
pub use self::format::Format;
pub use self::queue::{
    MarkerStatus, Queue, QueueClass, QueueMarker, QueueTracker, SubmissionError,
    TimelineSemaphore,
};

pub mod command;
pub mod desc;
pub mod device;
pub mod format;
pub mod queue;

/// One step of a repositioning (defragmentation) plan: the bytes at
/// `[source_start, source_end)` of the source resource move to `destination`
/// in the destination resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RepositionStep {
    /// First byte of the moved span in the source resource.
    pub source_start: u32,
    /// Past-the-end byte of the moved span in the source resource.
    pub source_end: u32,
    /// First byte of the span's new location in the destination resource.
    pub destination: u32,
}

impl RepositionStep {
    /// Byte length of the moved span.
    pub fn len(&self) -> u32 {
        self.source_end - self.source_start
    }

    /// Whether the step covers no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.source_end == self.source_start
    }
}

impl fmt::Display for RepositionStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:#x}..{:#x}) -> {:#x}",
            self.source_start, self.source_end, self.destination
        )
    }
}
