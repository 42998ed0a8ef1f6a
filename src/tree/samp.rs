//! Sampling engine.
//!
//! Each node carries rolled-up kvset statistics (`NodeStats`) and a
//! five-counter sampling record (`SampStats`); the tree total is the sum of
//! every node's record. The external compaction scheduler steers entirely by
//! these numbers: raw root length drives spill, the ratio of leaf allocated
//! length to its compacted-equivalent (`l_good`) drives garbage compaction.
//!
//! All update functions here must run under the tree write lock; they
//! bracket a node mutation and fold the exact delta into the tree total.

use std::sync::Arc;

use crate::config::{DataType, NodeAge, RuntimeParams};
use crate::hlog::Hlog;
use crate::kvset::{Kvset, KvsetStats};

use super::node::Node;

/// Sampling counters, per node and summed tree-wide.
///
/// Signed so that bracketed updates can fold negative deltas into the tree
/// total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampStats {
    /// Root raw allocated length.
    pub r_alen: i64,
    /// Root raw written length.
    pub r_wlen: i64,
    /// Internal (non-leaf) allocated length.
    pub i_alen: i64,
    /// Leaf allocated length.
    pub l_alen: i64,
    /// Leaf compacted-equivalent length.
    pub l_good: i64,
}

impl SampStats {
    pub fn accum(&mut self, new: &SampStats, orig: &SampStats) {
        self.r_alen += new.r_alen - orig.r_alen;
        self.r_wlen += new.r_wlen - orig.r_wlen;
        self.i_alen += new.i_alen - orig.i_alen;
        self.l_alen += new.l_alen - orig.l_alen;
        self.l_good += new.l_good - orig.l_good;
    }
}

/// Rolled-up per-node statistics.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Sum of all kvset stats in the node.
    pub kst: KvsetStats,
    /// Number of kvsets in the node.
    pub nkvsets: u64,
    /// Unique-key estimate, clamped to the key count.
    pub keys_uniq: u64,
    /// Compacted-equivalent lengths per block class.
    pub kclen: u64,
    pub vclen: u64,
    pub hclen: u64,
    /// Percent of the split threshold filled, clamped to u16.
    pub pcap: u16,
}

impl NodeStats {
    pub fn keys(&self) -> u64 {
        self.kst.nkeys
    }

    pub fn alen(&self) -> u64 {
        self.kst.alen()
    }

    pub fn wlen(&self) -> u64 {
        self.kst.wlen()
    }

    pub fn clen(&self) -> u64 {
        self.kclen + self.vclen + self.hclen
    }
}

/// Mutable sampling state of one node, guarded by the node's stats mutex.
pub(crate) struct NodeSamp {
    pub ns: NodeStats,
    pub samp: SampStats,
    pub hlog: Option<Hlog>,
    /// Highest dgen already folded by an incremental update.
    pub incr_dgen: u64,
}

impl NodeSamp {
    pub fn new() -> Self {
        Self {
            ns: NodeStats::default(),
            samp: SampStats::default(),
            hlog: Some(Hlog::new()),
            incr_dgen: 0,
        }
    }

    /// Reset ahead of a full recomputation. Only leaves keep a sketch: the
    /// root spills everything regardless, so uniqueness tracking there is
    /// wasted work.
    fn clear(&mut self, isleaf: bool) {
        match (&mut self.hlog, isleaf) {
            (hlog @ Some(_), false) => *hlog = None,
            (Some(hlog), true) => hlog.reset(),
            (None, _) => {}
        }

        self.ns = NodeStats::default();
        self.samp = SampStats::default();
        self.incr_dgen = 0;
    }

    /// Fold one kvset in. Without `force`, kvsets at or below the fold
    /// watermark are skipped (incremental ingest updates).
    fn update_incr(&mut self, kvset: &Kvset, force: bool) -> bool {
        let dgen = kvset.dgen();

        if !force && dgen <= self.incr_dgen {
            return false;
        }

        if let Some(hlog) = &mut self.hlog {
            hlog.union(kvset.hlog());
        }

        self.ns.kst.add(kvset.stats());
        self.ns.nkvsets += 1;

        if self.incr_dgen < dgen {
            self.incr_dgen = dgen;
        }

        true
    }

    /// Derive the estimated lengths and refresh the samp record.
    fn finish(&mut self, rp: &RuntimeParams, age: NodeAge, split_size: u64) {
        const PCT_SCALE: u64 = 1024;
        let s = &mut self.ns;
        let num_keys = s.kst.nkeys;

        // Estimate unique keys from the sketch, clamped to the valid range.
        // With no sketch, assume all keys are unique.
        s.keys_uniq = match &self.hlog {
            Some(hlog) => hlog.card().min(num_keys),
            None => num_keys,
        };

        // A node composed of only prefix tombstones has zero keys.
        let pct = if num_keys > 0 {
            PCT_SCALE * s.keys_uniq / num_keys
        } else {
            PCT_SCALE
        };

        let kmclass = rp.mclass_policy.get(age, DataType::Key);
        let new_kwlen = s.kst.kwlen * pct / PCT_SCALE;
        s.kclen = (rp.kbb_est)(new_kwlen, kmclass).min(s.kst.kalen);

        let vmclass = rp.mclass_policy.get(age, DataType::Value);
        let new_vwlen = s.kst.vwlen * pct / PCT_SCALE;
        s.vclen = (rp.vbb_est)(new_vwlen, vmclass).min(s.kst.valen);

        s.hclen = s.kst.halen;
        s.pcap = (100 * s.clen() / split_size.max(1)).min(u64::from(u16::MAX)) as u16;

        let alen = s.alen() as i64;
        self.samp = match age {
            NodeAge::Leaf => SampStats {
                l_alen: alen,
                l_good: s.clen() as i64,
                ..Default::default()
            },
            NodeAge::Internal => SampStats {
                i_alen: alen,
                ..Default::default()
            },
            NodeAge::Root => SampStats {
                i_alen: alen,
                r_alen: alen,
                r_wlen: s.wlen() as i64,
                ..Default::default()
            },
        };
    }
}

fn node_age(node: &Node) -> NodeAge {
    if node.isroot() {
        NodeAge::Root
    } else {
        NodeAge::Leaf
    }
}

/// Full recomputation of one node's sampling state; folds the delta into
/// `total`. Must be serialized with the other update functions (tree write
/// lock).
pub(crate) fn update_compact(rp: &RuntimeParams, total: &mut SampStats, node: &Node) {
    let kvsets = node.kvsets.read();
    let mut samp = node.samp.lock();
    let orig = samp.samp;

    samp.clear(node.isleaf());

    let mut need_finish = false;
    for kvset in kvsets.iter() {
        if samp.update_incr(kvset, true) {
            need_finish = true;
        }
    }

    if need_finish {
        samp.finish(rp, node_age(node), node.split_size());
    }

    let new = samp.samp;
    total.accum(&new, &orig);
}

/// Incremental update after an ingest: folds only the newest kvset and only
/// if it is above the fold watermark.
pub(crate) fn update_ingest(rp: &RuntimeParams, total: &mut SampStats, node: &Node) {
    let kvsets = node.kvsets.read();
    let Some(head) = kvsets.front() else {
        return;
    };

    let mut samp = node.samp.lock();
    let orig = samp.samp;

    if samp.update_incr(head, false) {
        samp.finish(rp, node_age(node), node.split_size());
    }

    let new = samp.samp;
    total.accum(&new, &orig);
}

/// Update after a spill: a spill is a compaction of the source with an
/// ingest into each leaf.
pub(crate) fn update_spill(rp: &RuntimeParams, total: &mut SampStats, nodes: &[Arc<Node>]) {
    debug_assert!(nodes.first().map(|n| n.isroot()).unwrap_or(false));

    update_compact(rp, total, &nodes[0]);

    for leaf in &nodes[1..] {
        update_ingest(rp, total, leaf);
    }
}

/// Recompute everything from scratch (attach/replay path).
pub(crate) fn init(rp: &RuntimeParams, total: &mut SampStats, nodes: &[Arc<Node>]) {
    *total = SampStats::default();

    for node in nodes {
        update_compact(rp, total, node);
    }
}
