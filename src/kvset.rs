//! Immutable kvsets.
//!
//! A kvset is a sorted, immutable set of key versions persisted as one
//! header block, a run of key blocks, and a run of value blocks. The tree
//! holds kvsets in per-node lists ordered by data generation (dgen); the
//! compaction machinery consumes them through iterators and produces new
//! ones through [`KvsetBuilder`].
//!
//! Kvsets are reference counted (`Arc`). Dropping the last reference frees
//! the kvset's blocks through the allocator if the kvset was marked for
//! delete. Value blocks live in separately counted [`VbSet`]s so that
//! k-compaction outputs can share them with the inputs they replace: the
//! retired inputs die, the value blocks survive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::blocks::{BlockAllocator, BlockId, BlockList};
use crate::error::{Error, Result};
use crate::hlog::Hlog;

/// Key bytes per key block.
pub const KBLOCK_CAP: u64 = 4096;
/// Value bytes per value block.
pub const VBLOCK_CAP: u64 = 4096;
/// Header block length.
pub const HBLOCK_LEN: u64 = 4096;

/// Per-key media overhead folded into write lengths.
const KEY_OVERHEAD: u64 = 24;

pub type KvsetRef = Arc<Kvset>;

/// Payload of one key version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    Value(Vec<u8>),
    Tombstone,
}

/// One key version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub seqno: u64,
    pub value: EntryValue,
}

/// A prefix tombstone: hides every key under `prefix` with a lower seqno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ptomb {
    pub prefix: Vec<u8>,
    pub seqno: u64,
}

/// Rolled-up kvset statistics consumed by the sampling engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvsetStats {
    pub nkeys: u64,
    pub ntombs: u64,
    pub nptombs: u64,
    pub nkblks: u64,
    pub nvblks: u64,
    pub halen: u64,
    pub kalen: u64,
    pub kwlen: u64,
    pub valen: u64,
    pub vwlen: u64,
}

impl KvsetStats {
    pub fn add(&mut self, other: &KvsetStats) {
        self.nkeys += other.nkeys;
        self.ntombs += other.ntombs;
        self.nptombs += other.nptombs;
        self.nkblks += other.nkblks;
        self.nvblks += other.nvblks;
        self.halen += other.halen;
        self.kalen += other.kalen;
        self.kwlen += other.kwlen;
        self.valen += other.valen;
        self.vwlen += other.vwlen;
    }

    /// Total allocated length.
    pub fn alen(&self) -> u64 {
        self.halen + self.kalen + self.valen
    }

    /// Total written length.
    pub fn wlen(&self) -> u64 {
        self.kwlen + self.vwlen
    }
}

/// A reference-counted set of value blocks, shared between a k-compaction
/// output and the inputs it replaced.
pub struct VbSet {
    vblks: BlockList,
    delete_marked: AtomicBool,
    allocator: Arc<dyn BlockAllocator>,
}

impl VbSet {
    pub fn new(vblks: BlockList, allocator: Arc<dyn BlockAllocator>) -> Arc<Self> {
        Arc::new(Self {
            vblks,
            delete_marked: AtomicBool::new(false),
            allocator,
        })
    }

    pub fn vblks(&self) -> &[BlockId] {
        &self.vblks
    }

    pub fn mark_for_delete(&self) {
        self.delete_marked.store(true, Ordering::SeqCst);
    }
}

impl Drop for VbSet {
    fn drop(&mut self) {
        if self.delete_marked.load(Ordering::SeqCst) && !self.vblks.is_empty() {
            if let Err(e) = self.allocator.delete(&self.vblks) {
                tracing::warn!(error = %e, "failed to delete retired value blocks");
            }
        }
    }
}

/// Result of a point lookup within one kvset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvsetLookup {
    NotFound,
    Value(Vec<u8>),
    Tombstone,
}

/// An immutable kvset.
pub struct Kvset {
    kvsetid: u64,
    nodeid: u64,
    dgen: u64,
    compc: u32,
    seqno_min: u64,
    seqno_max: u64,
    vused: u64,
    vgroups: u32,
    ctime: Instant,

    /// Sorted by (key ascending, seqno descending).
    entries: Vec<Entry>,
    /// Sorted by (prefix ascending, seqno descending).
    ptombs: Vec<Ptomb>,

    min_key: Vec<u8>,
    max_key: Vec<u8>,
    stats: KvsetStats,
    hlog: Hlog,

    hblk: BlockId,
    kblks: BlockList,
    vbsets: Vec<Arc<VbSet>>,

    workid: AtomicU64,
    delete_marked: AtomicBool,
    evict_advised: AtomicBool,
    allocator: Arc<dyn BlockAllocator>,
}

impl Kvset {
    /// Construct a kvset from build output. Empty output is a caller bug:
    /// builders skip empty outputs and empty kvsets are never valid inputs,
    /// which keeps min/max keys total.
    pub fn open(
        allocator: Arc<dyn BlockAllocator>,
        kvsetid: u64,
        nodeid: u64,
        dgen: u64,
        compc: u32,
        out: OutputBlocks,
    ) -> Result<KvsetRef> {
        let hblk = out
            .hblk
            .ok_or_else(|| Error::Bug(format!("kvset {kvsetid} opened with no header block")))?;

        let first = out.entries.first().map(|e| e.key.clone());
        let min_key = first
            .into_iter()
            .chain(out.ptombs.first().map(|p| p.prefix.clone()))
            .min()
            .ok_or_else(|| Error::Bug(format!("kvset {kvsetid} opened with no entries")))?;
        let max_key = out
            .entries
            .last()
            .map(|e| e.key.clone())
            .into_iter()
            .chain(out.ptombs.last().map(|p| p.prefix.clone()))
            .max()
            .unwrap_or_default();

        let seqnos = out
            .entries
            .iter()
            .map(|e| e.seqno)
            .chain(out.ptombs.iter().map(|p| p.seqno));
        let seqno_min = seqnos.clone().min().unwrap_or(0);
        let seqno_max = seqnos.max().unwrap_or(0);

        let mut vbsets = out.vbsets;
        if !out.vblks.is_empty() {
            vbsets.push(VbSet::new(out.vblks, Arc::clone(&allocator)));
        }

        Ok(Arc::new(Self {
            kvsetid,
            nodeid,
            dgen,
            compc,
            seqno_min,
            seqno_max,
            vused: out.vused,
            vgroups: out.vgroups,
            ctime: Instant::now(),
            entries: out.entries,
            ptombs: out.ptombs,
            min_key,
            max_key,
            stats: out.stats,
            hlog: out.hlog,
            hblk,
            kblks: out.kblks,
            vbsets,
            workid: AtomicU64::new(0),
            delete_marked: AtomicBool::new(false),
            evict_advised: AtomicBool::new(false),
            allocator,
        }))
    }

    pub fn kvsetid(&self) -> u64 {
        self.kvsetid
    }

    pub fn nodeid(&self) -> u64 {
        self.nodeid
    }

    pub fn dgen(&self) -> u64 {
        self.dgen
    }

    pub fn compc(&self) -> u32 {
        self.compc
    }

    pub fn seqno_max(&self) -> u64 {
        self.seqno_max
    }

    pub fn seqno_min(&self) -> u64 {
        self.seqno_min
    }

    pub fn vused(&self) -> u64 {
        self.vused
    }

    /// Value-group count: a measure of how scattered the kvset's values are
    /// relative to its keys. K-compaction sums input vgroups into the
    /// output; kv-compaction collapses back to at most one.
    pub fn vgroups(&self) -> u32 {
        self.vgroups
    }

    pub fn ctime(&self) -> Instant {
        self.ctime
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn stats(&self) -> &KvsetStats {
        &self.stats
    }

    pub fn hlog(&self) -> &Hlog {
        &self.hlog
    }

    pub fn hblk(&self) -> BlockId {
        self.hblk
    }

    pub fn kblks(&self) -> &[BlockId] {
        &self.kblks
    }

    /// All value-block ids, across every referenced set.
    pub fn vblks(&self) -> BlockList {
        self.vbsets.iter().flat_map(|s| s.vblks().iter().copied()).collect()
    }

    pub fn vbsets(&self) -> &[Arc<VbSet>] {
        &self.vbsets
    }

    /// Every block id the kvset references (split purge lists).
    pub fn all_block_ids(&self) -> BlockList {
        let mut ids = vec![self.hblk];
        ids.extend_from_slice(&self.kblks);
        ids.extend(self.vblks());
        ids
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn ptombs(&self) -> &[Ptomb] {
        &self.ptombs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Reservation stamp: non-zero while a compaction job owns this kvset
    /// as input.
    pub fn workid(&self) -> u64 {
        self.workid.load(Ordering::SeqCst)
    }

    pub fn reserve(&self, workid: u64) -> Result<()> {
        match self
            .workid
            .compare_exchange(0, workid, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(held) => Err(Error::Bug(format!(
                "kvset {} already reserved by job {held}",
                self.kvsetid
            ))),
        }
    }

    /// Only the reserving job may clear its stamp.
    pub fn unreserve(&self, workid: u64) {
        let prev = self.workid.swap(0, Ordering::SeqCst);
        debug_assert_eq!(prev, workid, "kvset {} unreserved by wrong job", self.kvsetid);
    }

    /// Mark the kvset's blocks for deletion when the last reference drops.
    /// With `keep_vblocks`, shared value-block sets survive (k-compaction).
    pub fn mark_for_delete(&self, keep_vblocks: bool) {
        self.delete_marked.store(true, Ordering::SeqCst);
        if !keep_vblocks {
            for vbset in &self.vbsets {
                vbset.mark_for_delete();
            }
        }
    }

    /// Advise that this kvset's value pages are unlikely to be needed
    /// (capped-tree eviction fallback).
    pub fn advise_evict(&self) {
        self.evict_advised.store(true, Ordering::SeqCst);
    }

    pub fn evict_advised(&self) -> bool {
        self.evict_advised.load(Ordering::SeqCst)
    }

    /// Point lookup within this kvset at view seqno `seq`.
    pub fn lookup(&self, key: &[u8], seq: u64) -> KvsetLookup {
        let entry = self.newest_visible(key, seq);
        let ptomb_seq = self
            .ptombs
            .iter()
            .filter(|p| p.seqno <= seq && key.starts_with(&p.prefix))
            .map(|p| p.seqno)
            .max();

        match (entry, ptomb_seq) {
            (Some(e), Some(ps)) if ps > e.seqno => KvsetLookup::Tombstone,
            (Some(e), _) => match &e.value {
                EntryValue::Value(v) => KvsetLookup::Value(v.clone()),
                EntryValue::Tombstone => KvsetLookup::Tombstone,
            },
            (None, Some(_)) => KvsetLookup::Tombstone,
            (None, None) => KvsetLookup::NotFound,
        }
    }

    /// Newest entry for `key` visible at `seq`.
    fn newest_visible(&self, key: &[u8], seq: u64) -> Option<&Entry> {
        let start = self.entries.partition_point(|e| e.key.as_slice() < key);
        self.entries[start..]
            .iter()
            .take_while(|e| e.key == key)
            .find(|e| e.seqno <= seq)
    }
}

impl std::fmt::Debug for Kvset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kvset")
            .field("kvsetid", &self.kvsetid)
            .field("nodeid", &self.nodeid)
            .field("dgen", &self.dgen)
            .field("compc", &self.compc)
            .field("nkeys", &self.stats.nkeys)
            .finish()
    }
}

impl Drop for Kvset {
    fn drop(&mut self) {
        if self.delete_marked.load(Ordering::SeqCst) {
            let mut ids = vec![self.hblk];
            ids.append(&mut self.kblks);
            if let Err(e) = self.allocator.delete(&ids) {
                tracing::warn!(kvsetid = self.kvsetid, error = %e, "failed to delete retired kvset blocks");
            }
        }
    }
}

/// Build output: allocated blocks plus the entry run, ready for
/// [`Kvset::open`]. `hblk` is `None` when the build produced nothing.
pub struct OutputBlocks {
    pub hblk: Option<BlockId>,
    pub kblks: BlockList,
    pub vblks: BlockList,
    pub vbsets: Vec<Arc<VbSet>>,
    pub entries: Vec<Entry>,
    pub ptombs: Vec<Ptomb>,
    pub stats: KvsetStats,
    pub hlog: Hlog,
    pub vused: u64,
    pub vgroups: u32,
}

impl OutputBlocks {
    /// An output with nothing in it (all keys annihilated by tombstones).
    pub fn empty() -> Self {
        Self {
            hblk: None,
            kblks: Vec::new(),
            vblks: Vec::new(),
            vbsets: Vec::new(),
            entries: Vec::new(),
            ptombs: Vec::new(),
            stats: KvsetStats::default(),
            hlog: Hlog::new(),
            vused: 0,
            vgroups: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hblk.is_none()
    }

    /// Blocks allocated for this output (does not include carried sets).
    pub fn own_block_ids(&self) -> BlockList {
        let mut ids: BlockList = self.hblk.into_iter().collect();
        ids.extend_from_slice(&self.kblks);
        ids.extend_from_slice(&self.vblks);
        ids
    }
}

/// Assembles one kvset from an ordered entry stream.
///
/// Entries must arrive in merge order: key ascending, seqno descending
/// within a key. `finish` allocates header, key and (unless value-block
/// sets are carried) value blocks.
pub struct KvsetBuilder {
    allocator: Arc<dyn BlockAllocator>,
    entries: Vec<Entry>,
    ptombs: Vec<Ptomb>,
    hlog: Hlog,
    kwlen: u64,
    vwlen: u64,
    ntombs: u64,
}

impl KvsetBuilder {
    pub fn new(allocator: Arc<dyn BlockAllocator>) -> Self {
        Self {
            allocator,
            entries: Vec::new(),
            ptombs: Vec::new(),
            hlog: Hlog::new(),
            kwlen: 0,
            vwlen: 0,
            ntombs: 0,
        }
    }

    pub fn add(&mut self, key: &[u8], seqno: u64, value: EntryValue) -> Result<()> {
        if let Some(last) = self.entries.last() {
            let ordered = match last.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => last.seqno > seqno,
                std::cmp::Ordering::Greater => false,
            };
            if !ordered {
                return Err(Error::Bug(format!(
                    "kvset build order violated at key {key:?} seqno {seqno}"
                )));
            }
        }

        self.hlog.add(key);
        self.kwlen += key.len() as u64 + KEY_OVERHEAD;
        match &value {
            EntryValue::Value(v) => self.vwlen += v.len() as u64,
            EntryValue::Tombstone => self.ntombs += 1,
        }

        self.entries.push(Entry {
            key: key.to_vec(),
            seqno,
            value,
        });
        Ok(())
    }

    pub fn add_ptomb(&mut self, prefix: &[u8], seqno: u64) -> Result<()> {
        if let Some(last) = self.ptombs.last() {
            let ordered = match last.prefix.as_slice().cmp(prefix) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => last.seqno > seqno,
                std::cmp::Ordering::Greater => false,
            };
            if !ordered {
                return Err(Error::Bug(format!("ptomb build order violated at {prefix:?}")));
            }
        }

        self.hlog.add(prefix);
        self.kwlen += prefix.len() as u64 + KEY_OVERHEAD;
        self.ptombs.push(Ptomb {
            prefix: prefix.to_vec(),
            seqno,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.ptombs.is_empty()
    }

    /// Finish the build, allocating fresh value blocks for the value bytes.
    pub fn finish(self) -> Result<OutputBlocks> {
        self.finish_inner(None)
    }

    /// Finish the build carrying the inputs' value-block sets instead of
    /// allocating new ones (k-compaction).
    pub fn finish_carrying(self, vbsets: Vec<Arc<VbSet>>, vgroups: u32) -> Result<OutputBlocks> {
        self.finish_inner(Some((vbsets, vgroups)))
    }

    fn finish_inner(self, carried: Option<(Vec<Arc<VbSet>>, u32)>) -> Result<OutputBlocks> {
        if self.is_empty() {
            return Ok(OutputBlocks::empty());
        }

        let nkblks = self.kwlen.div_ceil(KBLOCK_CAP).max(1);
        let nvblks = match carried {
            Some(_) => 0,
            None => self.vwlen.div_ceil(VBLOCK_CAP),
        };

        let mut allocated: BlockList = Vec::with_capacity(1 + nkblks as usize + nvblks as usize);
        for _ in 0..1 + nkblks + nvblks {
            match self.allocator.alloc() {
                Ok(id) => allocated.push(id),
                Err(e) => {
                    // Release whatever was reserved before failing the build.
                    let _ = self.allocator.delete(&allocated);
                    return Err(e);
                }
            }
        }

        let hblk = allocated[0];
        let kblks = allocated[1..1 + nkblks as usize].to_vec();
        let vblks = allocated[1 + nkblks as usize..].to_vec();

        let (vbsets, vgroups) = match carried {
            Some((vbsets, vgroups)) => (vbsets, vgroups),
            None => (Vec::new(), u32::from(self.vwlen > 0)),
        };

        let carried_vblks: u64 = vbsets.iter().map(|s| s.vblks().len() as u64).sum();
        let total_vblks = nvblks + carried_vblks;

        let stats = KvsetStats {
            nkeys: self.entries.len() as u64,
            ntombs: self.ntombs,
            nptombs: self.ptombs.len() as u64,
            nkblks,
            nvblks: total_vblks,
            halen: HBLOCK_LEN,
            kalen: nkblks * KBLOCK_CAP,
            kwlen: self.kwlen,
            valen: total_vblks * VBLOCK_CAP,
            vwlen: self.vwlen,
        };

        Ok(OutputBlocks {
            hblk: Some(hblk),
            kblks,
            vblks,
            vbsets,
            entries: self.entries,
            ptombs: self.ptombs,
            stats,
            hlog: self.hlog,
            vused: self.vwlen,
            vgroups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemAllocator;

    fn build_kvset(allocator: &Arc<MemAllocator>, dgen: u64, entries: &[(&[u8], u64, Option<&[u8]>)]) -> KvsetRef {
        let alloc: Arc<dyn BlockAllocator> = Arc::clone(allocator) as _;
        let mut builder = KvsetBuilder::new(Arc::clone(&alloc));
        for (key, seqno, value) in entries {
            let value = match value {
                Some(v) => EntryValue::Value(v.to_vec()),
                None => EntryValue::Tombstone,
            };
            builder.add(key, *seqno, value).unwrap();
        }
        let out = builder.finish().unwrap();
        Kvset::open(alloc, dgen, 0, dgen, 0, out).unwrap()
    }

    #[test]
    fn test_builder_enforces_merge_order() {
        let allocator = Arc::new(MemAllocator::new());
        let alloc: Arc<dyn BlockAllocator> = allocator as _;
        let mut builder = KvsetBuilder::new(alloc);

        builder.add(b"b", 5, EntryValue::Tombstone).unwrap();
        assert!(builder.add(b"a", 5, EntryValue::Tombstone).is_err());
        assert!(builder.add(b"b", 7, EntryValue::Tombstone).is_err());
        builder.add(b"b", 3, EntryValue::Tombstone).unwrap();
        builder.add(b"c", 9, EntryValue::Tombstone).unwrap();
    }

    #[test]
    fn test_empty_build_has_no_blocks() {
        let allocator = Arc::new(MemAllocator::new());
        let alloc: Arc<dyn BlockAllocator> = Arc::clone(&allocator) as _;
        let out = KvsetBuilder::new(alloc).finish().unwrap();
        assert!(out.is_empty());
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn test_lookup_seqno_visibility() {
        let allocator = Arc::new(MemAllocator::new());
        let ks = build_kvset(
            &allocator,
            1,
            &[(b"a", 5, Some(b"new")), (b"a", 2, Some(b"old")), (b"b", 3, None)],
        );

        assert_eq!(ks.lookup(b"a", 10), KvsetLookup::Value(b"new".to_vec()));
        assert_eq!(ks.lookup(b"a", 4), KvsetLookup::Value(b"old".to_vec()));
        assert_eq!(ks.lookup(b"a", 1), KvsetLookup::NotFound);
        assert_eq!(ks.lookup(b"b", 3), KvsetLookup::Tombstone);
        assert_eq!(ks.lookup(b"c", 10), KvsetLookup::NotFound);
    }

    #[test]
    fn test_ptomb_shadows_older_entries() {
        let allocator = Arc::new(MemAllocator::new());
        let alloc: Arc<dyn BlockAllocator> = Arc::clone(&allocator) as _;
        let mut builder = KvsetBuilder::new(Arc::clone(&alloc));
        builder.add(b"user.1", 3, EntryValue::Value(b"x".to_vec())).unwrap();
        builder.add(b"user.2", 9, EntryValue::Value(b"y".to_vec())).unwrap();
        builder.add_ptomb(b"user", 5).unwrap();
        let ks = Kvset::open(alloc, 1, 0, 1, 0, builder.finish().unwrap()).unwrap();

        // seq 3 write is under the seq 5 ptomb; seq 9 write is newer than it.
        assert_eq!(ks.lookup(b"user.1", 10), KvsetLookup::Tombstone);
        assert_eq!(ks.lookup(b"user.2", 10), KvsetLookup::Value(b"y".to_vec()));
        assert_eq!(ks.lookup(b"user.3", 10), KvsetLookup::Tombstone);
        assert_eq!(ks.lookup(b"user.3", 4), KvsetLookup::NotFound);
        assert_eq!(ks.lookup(b"other", 10), KvsetLookup::NotFound);
    }

    #[test]
    fn test_min_max_and_seqno_range() {
        let allocator = Arc::new(MemAllocator::new());
        let ks = build_kvset(
            &allocator,
            1,
            &[(b"alpha", 4, Some(b"1")), (b"mid", 9, Some(b"2")), (b"zeta", 2, Some(b"3"))],
        );
        assert_eq!(ks.min_key(), b"alpha");
        assert_eq!(ks.max_key(), b"zeta");
        assert_eq!(ks.seqno_min(), 2);
        assert_eq!(ks.seqno_max(), 9);
    }

    #[test]
    fn test_workid_reservation() {
        let allocator = Arc::new(MemAllocator::new());
        let ks = build_kvset(&allocator, 1, &[(b"a", 1, Some(b"v"))]);

        assert_eq!(ks.workid(), 0);
        ks.reserve(42).unwrap();
        assert_eq!(ks.workid(), 42);
        assert!(ks.reserve(43).is_err(), "double reservation must fail");
        ks.unreserve(42);
        assert_eq!(ks.workid(), 0);
        ks.reserve(43).unwrap();
    }

    #[test]
    fn test_drop_deletes_marked_blocks() {
        let allocator = Arc::new(MemAllocator::new());
        let ks = build_kvset(&allocator, 1, &[(b"a", 1, Some(b"v"))]);
        let nblocks = ks.all_block_ids().len();
        assert!(nblocks >= 3, "hblk + kblk + vblk");

        ks.mark_for_delete(false);
        drop(ks);
        assert_eq!(allocator.deleted(), nblocks);
    }

    #[test]
    fn test_drop_keeps_shared_vblocks() {
        let allocator = Arc::new(MemAllocator::new());
        let ks = build_kvset(&allocator, 1, &[(b"a", 1, Some(b"v"))]);
        let vbsets: Vec<_> = ks.vbsets().to_vec();
        assert_eq!(vbsets.len(), 1);
        let own = 1 + ks.kblks().len();

        ks.mark_for_delete(true);
        drop(ks);
        // Header and key blocks deleted, the shared value set survives.
        assert_eq!(allocator.deleted(), own);
        drop(vbsets);
        assert_eq!(allocator.deleted(), own, "unmarked set must not delete");
    }
}
