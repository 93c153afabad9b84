//! Errors surfaced through transaction promises.

use thiserror::Error;

/// Why a transaction failed to produce a resource.
#[derive(Clone, Debug, Error)]
pub enum UploadError {
    /// The device rejected the resource allocation.
    #[error("device resource allocation failed: {0}")]
    ResourceCreationFailure(#[from] hal::CreationError),

    /// The data packet does not match the descriptor.
    #[error("initialisation data does not match descriptor: {0}")]
    InvalidDescriptor(String),

    /// The client cancelled the transaction before it completed.
    #[error("cancelled before completion")]
    Cancelled,

    /// The transaction's last reference went away without completion.
    #[error("transaction aborted")]
    Aborted,

    /// A continuation fired after the assembly line was destroyed.
    #[error("assembly line was destroyed before future completed")]
    AssemblyLineShutdown,

    /// The transactions spanning heap reached its maximum size.
    #[error("transactions spanning heap reached maximum size, aborting transaction")]
    TransactionHeapFull,

    /// A client-supplied data source failed.
    #[error("data source failed: {0}")]
    DataSource(String),

    /// A queue rejected a submission.
    #[error("queue submission failed: {0}")]
    Submission(String),

    /// Mapping host-visible memory failed.
    #[error("map failed: {0}")]
    Map(#[from] hal::MapError),
}
