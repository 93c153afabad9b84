//! Heap bookkeeping shared by the staging page and the batched allocator.

pub mod circular;
pub mod refcount;
pub mod spanning;

pub use self::circular::CircularHeap;
pub use self::refcount::ReferenceCountingLayer;
pub use self::spanning::SpanningHeap;
