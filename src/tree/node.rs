//! Tree nodes.
//!
//! A node is a list of kvsets ordered newest first (head has the highest
//! dgen), plus the counters that coordinate compaction against it. Kvset
//! list membership is guarded by the tree's read-mostly lock; the per-node
//! list lock below is only ever taken while the tree lock is held and
//! exists so Rust has a place to hang interior mutability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::compact::CompactionWork;
use crate::error::{Error, Result};
use crate::kvset::KvsetRef;

use super::samp::{NodeSamp, NodeStats};

/// The root always has node id 0; every other node is a leaf.
pub const ROOT_NODEID: u64 = 0;

pub struct Node {
    /// Stable node id. Mutated only when a split re-numbers the surviving
    /// right half.
    nodeid: AtomicU64,
    isroot: bool,

    /// Kvset list, newest (highest dgen) at the front. See module comment
    /// for the locking rule.
    pub(crate) kvsets: RwLock<VecDeque<KvsetRef>>,

    /// Sampling state, serialized by the tree write lock.
    pub(crate) samp: Mutex<NodeSamp>,

    /// Compacted-length threshold beyond which this node wants a split.
    split_size: u64,

    /// Exclusive-compaction token.
    compacting: AtomicBool,

    /// Upper 16 bits: active jobs; lower 16 bits: staked kvsets.
    busycnt: AtomicU32,

    /// Bumped on every mutation of the node.
    cgen: AtomicU64,

    /// Set when a root spill fails; later spills short-circuit to shutdown.
    wedged: AtomicBool,

    /// In-flight concurrent root spills, in submission order.
    pub(crate) rspills: Mutex<VecDeque<Arc<CompactionWork>>>,
}

impl Node {
    pub fn new(nodeid: u64, split_size: u64) -> Arc<Self> {
        Arc::new(Self {
            nodeid: AtomicU64::new(nodeid),
            isroot: nodeid == ROOT_NODEID,
            kvsets: RwLock::new(VecDeque::new()),
            samp: Mutex::new(NodeSamp::new()),
            split_size,
            compacting: AtomicBool::new(false),
            busycnt: AtomicU32::new(0),
            cgen: AtomicU64::new(0),
            wedged: AtomicBool::new(false),
            rspills: Mutex::new(VecDeque::new()),
        })
    }

    pub fn nodeid(&self) -> u64 {
        self.nodeid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nodeid(&self, nodeid: u64) {
        self.nodeid.store(nodeid, Ordering::SeqCst);
    }

    pub fn isroot(&self) -> bool {
        self.isroot
    }

    pub fn isleaf(&self) -> bool {
        !self.isroot
    }

    pub fn split_size(&self) -> u64 {
        self.split_size
    }

    /// Number of kvsets currently in the node.
    pub fn len(&self) -> usize {
        self.kvsets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvsets.read().is_empty()
    }

    /// Change generation; bumped on any mutation.
    pub fn cgen(&self) -> u64 {
        self.cgen.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_cgen(&self) {
        self.cgen.fetch_add(1, Ordering::SeqCst);
    }

    pub fn wedged(&self) -> bool {
        self.wedged.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wedged(&self) {
        self.wedged.store(true, Ordering::SeqCst);
    }

    /// Try to take the exclusive compaction token.
    pub fn comp_token_get(&self) -> bool {
        self.compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn comp_token_put(&self) {
        let held = self
            .compacting
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        debug_assert!(held, "compaction token released while not held");
    }

    /// Stake one job and `kvset_cnt` kvsets on this node.
    pub(crate) fn busy_add(&self, kvset_cnt: usize) {
        self.busycnt
            .fetch_add((1 << 16) + kvset_cnt as u32, Ordering::AcqRel);
    }

    pub(crate) fn busy_sub(&self, kvset_cnt: usize) {
        self.busycnt
            .fetch_sub((1 << 16) + kvset_cnt as u32, Ordering::AcqRel);
    }

    /// (active jobs, staked kvsets).
    pub fn busy(&self) -> (u32, u32) {
        let v = self.busycnt.load(Ordering::Acquire);
        (v >> 16, v & 0xffff)
    }

    /// Insert a kvset during initialization, keeping the list ordered by
    /// strictly decreasing dgen from head to tail. Not for compaction or
    /// ingest updates.
    pub fn insert_kvset(&self, kvset: KvsetRef) -> Result<()> {
        let mut kvsets = self.kvsets.write();
        let dgen = kvset.dgen();

        let pos = kvsets.iter().position(|k| k.dgen() <= dgen);
        if let Some(pos) = pos {
            if kvsets[pos].dgen() == dgen {
                return Err(Error::Bug(format!(
                    "duplicate dgen {dgen} in node {}",
                    self.nodeid()
                )));
            }
            kvsets.insert(pos, kvset);
        } else {
            kvsets.push_back(kvset);
        }

        Ok(())
    }

    /// Snapshot of the node's rolled-up statistics. Callers wanting numbers
    /// consistent with the list should hold the tree read lock.
    pub fn stats(&self) -> NodeStats {
        self.samp.lock().ns.clone()
    }

    /// Smallest key across the node's kvsets; `None` when empty.
    pub fn min_key(&self) -> Option<Vec<u8>> {
        self.kvsets
            .read()
            .iter()
            .map(|k| k.min_key().to_vec())
            .min()
    }

    /// Largest key across the node's kvsets; `None` when empty.
    pub fn max_key(&self) -> Option<Vec<u8>> {
        self.kvsets
            .read()
            .iter()
            .map(|k| k.max_key().to_vec())
            .max()
    }

    /// Value-group scatter of the node: the sum of per-kvset vgroups,
    /// excluding the oldest run of kvsets that contribute none.
    pub fn scatter(&self) -> u32 {
        let kvsets = self.kvsets.read();
        let mut scatter = 0;

        for kvset in kvsets.iter().rev() {
            let vgroups = kvset.vgroups();
            if scatter + vgroups > 1 {
                scatter += vgroups;
            }
        }

        scatter
    }

    /// Dgens newest to oldest, for assertions and tests.
    pub fn dgens(&self) -> Vec<u64> {
        self.kvsets.read().iter().map(|k| k.dgen()).collect()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("nodeid", &self.nodeid())
            .field("isroot", &self.isroot)
            .field("kvsets", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{kvset_of, MemAllocator};

    fn kvset(allocator: &Arc<MemAllocator>, dgen: u64) -> KvsetRef {
        kvset_of(allocator, dgen, 1, dgen, 0, &[(b"k", 1, Some(b"v"))])
    }

    #[test]
    fn test_insert_keeps_dgen_order() -> Result<()> {
        let allocator = Arc::new(MemAllocator::new());
        let node = Node::new(1, 1 << 20);

        for dgen in [5, 1, 3, 4, 2] {
            node.insert_kvset(kvset(&allocator, dgen))?;
        }

        assert_eq!(node.dgens(), vec![5, 4, 3, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_insert_rejects_duplicate_dgen() {
        let allocator = Arc::new(MemAllocator::new());
        let node = Node::new(1, 1 << 20);

        node.insert_kvset(kvset(&allocator, 3)).unwrap();
        assert!(matches!(
            node.insert_kvset(kvset(&allocator, 3)),
            Err(Error::Bug(_))
        ));
    }

    #[test]
    fn test_comp_token_exclusive() {
        let node = Node::new(1, 1 << 20);
        assert!(node.comp_token_get());
        assert!(!node.comp_token_get());
        node.comp_token_put();
        assert!(node.comp_token_get());
    }

    #[test]
    fn test_busycnt_encoding() {
        let node = Node::new(1, 1 << 20);
        node.busy_add(3);
        node.busy_add(2);
        assert_eq!(node.busy(), (2, 5));
        node.busy_sub(3);
        assert_eq!(node.busy(), (1, 2));
        node.busy_sub(2);
        assert_eq!(node.busy(), (0, 0));
    }

    #[test]
    fn test_min_max_key() {
        let allocator = Arc::new(MemAllocator::new());
        let node = Node::new(1, 1 << 20);
        assert_eq!(node.min_key(), None);

        node.insert_kvset(kvset_of(&allocator, 1, 1, 1, 0, &[(b"mm", 1, Some(b"v"))]))
            .unwrap();
        node.insert_kvset(kvset_of(
            &allocator,
            2,
            1,
            2,
            0,
            &[(b"aa", 2, Some(b"v")), (b"zz", 2, Some(b"v"))],
        ))
        .unwrap();

        assert_eq!(node.min_key(), Some(b"aa".to_vec()));
        assert_eq!(node.max_key(), Some(b"zz".to_vec()));
    }
}
