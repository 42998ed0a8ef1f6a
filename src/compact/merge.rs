//! Merge across input kvsets.
//!
//! A binary min-heap drains the per-kvset entry runs into one stream
//! ordered by (key ascending, seqno descending); on an exact (key, seqno)
//! collision the newest source wins. The collapse pass then applies the
//! seqno horizon: versions no reader can distinguish are reduced to one,
//! and with tombstone-drop enabled (the window reaches the node's oldest
//! kvset) annihilated keys disappear entirely.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::kvset::{Entry, EntryValue, KvsetRef, Ptomb};
use crate::tree::Tree;

/// How often the merge loop polls for cancellation.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Merged, collapsed input run.
#[derive(Debug)]
pub(crate) struct MergedRun {
    pub entries: Vec<Entry>,
    pub ptombs: Vec<Ptomb>,
}

struct HeapItem {
    key: Vec<u8>,
    seqno: u64,
    /// Source index; lower = newer kvset.
    source: usize,
    pos: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for min-heap behavior: smallest key first, then highest
        // seqno, then newest source.
        match self.key.cmp(&other.key) {
            CmpOrdering::Equal => match self.seqno.cmp(&other.seqno) {
                CmpOrdering::Equal => other.source.cmp(&self.source),
                seqno => seqno,
            },
            key => key.reverse(),
        }
    }
}

/// Merge the inputs (newest first) into one collapsed run.
pub(crate) fn merge_inputs(
    tree: &Tree,
    inputs: &[KvsetRef],
    horizon: u64,
    drop_tombs: bool,
) -> Result<MergedRun> {
    let mut heap = BinaryHeap::with_capacity(inputs.len());
    for (source, kvset) in inputs.iter().enumerate() {
        if let Some(entry) = kvset.entries().first() {
            heap.push(HeapItem {
                key: entry.key.clone(),
                seqno: entry.seqno,
                source,
                pos: 0,
            });
        }
    }

    // Ptombs are few; a collect-and-sort beats heap plumbing.
    let mut ptombs: Vec<Ptomb> = inputs.iter().flat_map(|k| k.ptombs().iter().cloned()).collect();
    ptombs.sort_by(|a, b| a.prefix.cmp(&b.prefix).then(b.seqno.cmp(&a.seqno)));
    ptombs.dedup_by(|a, b| a.prefix == b.prefix && a.seqno == b.seqno);

    let mut merged: Vec<Entry> = Vec::new();
    let mut emitted = 0usize;

    while let Some(item) = heap.pop() {
        emitted += 1;
        if emitted % CANCEL_CHECK_INTERVAL == 0 && tree.cancel_requested() {
            return Err(Error::Shutdown);
        }

        let source = &inputs[item.source];
        let entry = &source.entries()[item.pos];

        if let Some(next) = source.entries().get(item.pos + 1) {
            heap.push(HeapItem {
                key: next.key.clone(),
                seqno: next.seqno,
                source: item.source,
                pos: item.pos + 1,
            });
        }

        // Exact duplicates across sources: the newest source already won.
        let duplicate = merged
            .last()
            .map(|last| last.key == entry.key && last.seqno == entry.seqno)
            .unwrap_or(false);
        if !duplicate {
            merged.push(entry.clone());
        }
    }

    collapse(tree, merged, ptombs, horizon, drop_tombs)
}

/// Reduce sub-horizon versions and drop annihilated keys.
fn collapse(
    tree: &Tree,
    entries: Vec<Entry>,
    ptombs: Vec<Ptomb>,
    horizon: u64,
    drop_tombs: bool,
) -> Result<MergedRun> {
    let mut out = Vec::with_capacity(entries.len());
    let mut i = 0usize;

    while i < entries.len() {
        if i % CANCEL_CHECK_INTERVAL == 0 && tree.cancel_requested() {
            return Err(Error::Shutdown);
        }

        let key = entries[i].key.clone();
        let group_end = entries[i..]
            .iter()
            .position(|e| e.key != key)
            .map(|p| i + p)
            .unwrap_or(entries.len());

        // The newest ptomb covering this key; acts as one more tombstone
        // version during the collapse.
        let ptomb_seq = ptombs
            .iter()
            .filter(|p| key.starts_with(&p.prefix))
            .map(|p| p.seqno)
            .max();

        // Versions at or above the horizon are all distinguishable; keep
        // them (unless hidden by a newer sub-horizon ptomb, which cannot
        // happen since the ptomb would then also be above the horizon).
        let mut kept_sub_horizon = false;
        for entry in &entries[i..group_end] {
            if entry.seqno >= horizon {
                out.push(entry.clone());
                continue;
            }

            // Below the horizon only the newest version matters.
            if kept_sub_horizon {
                continue;
            }
            kept_sub_horizon = true;

            let shadowed = ptomb_seq.map(|ps| ps > entry.seqno).unwrap_or(false);
            if shadowed {
                // A retained ptomb hides it; nothing to keep.
                continue;
            }

            let is_tomb = matches!(entry.value, EntryValue::Tombstone);
            if is_tomb && drop_tombs {
                // Nothing older exists below the window; the tombstone has
                // done its job.
                continue;
            }

            out.push(entry.clone());
        }

        i = group_end;
    }

    // Ptombs collapse the same way, per prefix.
    let mut out_ptombs: Vec<Ptomb> = Vec::with_capacity(ptombs.len());
    let mut j = 0usize;
    while j < ptombs.len() {
        let prefix = ptombs[j].prefix.clone();
        let group_end = ptombs[j..]
            .iter()
            .position(|p| p.prefix != prefix)
            .map(|p| j + p)
            .unwrap_or(ptombs.len());

        let mut kept_sub_horizon = false;
        for ptomb in &ptombs[j..group_end] {
            if ptomb.seqno >= horizon {
                out_ptombs.push(ptomb.clone());
            } else if !kept_sub_horizon {
                kept_sub_horizon = true;
                if !drop_tombs {
                    out_ptombs.push(ptomb.clone());
                }
            }
        }

        j = group_end;
    }

    Ok(MergedRun {
        entries: out,
        ptombs: out_ptombs,
    })
}
