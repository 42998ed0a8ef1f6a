//! Media-block identifiers and the allocator capability.
//!
//! Blocks are opaque ids handed out by the embedding block allocator. The
//! tree core never touches block payloads; it allocates ids while building
//! compaction outputs, commits them once the journal transaction is written,
//! and deletes them when a kvset retires or a job fails.

use crate::error::Result;

/// Opaque media-block identifier.
pub type BlockId = u64;

/// An ordered list of block ids.
pub type BlockList = Vec<BlockId>;

/// Block allocator capability.
///
/// `alloc` reserves an id for a block being written; the block becomes
/// durable only once `commit` succeeds. `delete` releases committed or
/// uncommitted blocks. A full media is reported as [`crate::Error::NoSpace`].
pub trait BlockAllocator: Send + Sync {
    fn alloc(&self) -> Result<BlockId>;

    fn commit(&self, blocks: &[BlockId]) -> Result<()>;

    fn delete(&self, blocks: &[BlockId]) -> Result<()>;
}
