//! Hardware queues, timeline semaphores and queue progress tracking.

use crate::command::CommandList;
use std::fmt;
use thiserror::Error;

/// Value signalled on a queue timeline; monotonically increasing.
pub type QueueMarker = u64;

/// Which hardware queue an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// The queue frame rendering is submitted to.
    Graphics,
    /// A dedicated transfer queue, when the device exposes one.
    Transfer,
}

/// Progress of one tracked marker on a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerStatus {
    /// The work associated with the marker has not completed on the device.
    Pending,
    /// The device has advanced past the marker.
    ConsumerCompleted,
    /// The marker was abandoned without device work being submitted.
    Abandoned,
}

/// Error submitting a command list to a queue.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SubmissionError {
    /// The queue rejected the submission.
    #[error("queue rejected submission: {0}")]
    Rejected(String),
    /// The device was lost.
    #[error("device lost")]
    DeviceLost,
}

/// A timeline semaphore: a monotonically increasing 64-bit value that command
/// lists can signal on completion and wait on before beginning.
pub trait TimelineSemaphore: Send + Sync + fmt::Debug {
    /// The highest value signalled so far.
    fn signalled_value(&self) -> QueueMarker;

    /// Downcast support for backends.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Tracks how far a queue has progressed through the command lists submitted
/// to it. The producer marker identifies the command list currently being
/// recorded; the consumer marker is the last one the device has finished.
pub trait QueueTracker: Send + Sync + fmt::Debug {
    /// Marker that will be assigned to the next resolved command list.
    fn producer_marker(&self) -> QueueMarker;
    /// Marker of the most recently completed command list.
    fn consumer_marker(&self) -> QueueMarker;
    /// Status of a specific marker.
    fn marker_status(&self, marker: QueueMarker) -> MarkerStatus;
}

/// A hardware queue accepting resolved command lists.
pub trait Queue: Send + Sync + fmt::Debug {
    /// Which class of queue this is.
    fn class(&self) -> QueueClass;
    /// Submit a resolved command list for execution.
    fn submit(&self, list: Box<dyn CommandList>) -> Result<(), SubmissionError>;
    /// The progress tracker for this queue.
    fn tracker(&self) -> &dyn QueueTracker;
}
