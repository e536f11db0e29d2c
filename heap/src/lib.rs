//! Chunked, precise, moving heap.
//!
//! The heap is decoupled from any specific VM. Consumers provide:
//! - A [`TraceFn`] to enumerate the reference slots of a block.
//! - A [`SizeFn`] to compute a block's total size.
//! - A [`RootProvider`] to supply live root slots at collection time.
//!
//! New blocks are bump-allocated in the new space; minor collections promote
//! survivors to the old space, which is mark-compacted by full collections.
//! Blocks move: every reference not registered as a root is invalid after an
//! allocation.

mod chunk;
mod gc;
mod heap;
mod remembered;
pub mod system;

pub use chunk::{AllocationRange, Chunk, SpaceId, CHUNK_SIZE, MAX_BLOCK_SIZE};
pub use heap::{Heap, HeapError, RootProvider, SizeFn, TraceFn};
pub use remembered::RememberedSet;
pub use system::OS_PAGE_SIZE;
