//! Node-split build.
//!
//! There is no merge loop: each input kvset is range-partitioned around the
//! chosen split key, contributing at most one kvset to each half. Output
//! `i` holds input `i`'s left half, output `kvset_cnt + i` its right half,
//! and each output inherits its input's dgen so both halves stay ordered.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kvset::KvsetBuilder;

use super::{CompactionWork, SplitScratch};

/// How often the partition loop polls for cancellation.
const CANCEL_CHECK_INTERVAL: usize = 1024;

pub(crate) fn build(w: &Arc<CompactionWork>) -> Result<()> {
    let tree = w.tree();
    let allocator = Arc::clone(&tree.attached()?.allocator);
    let mut run = w.run.lock();

    let mut scratch = run
        .split
        .take()
        .ok_or_else(|| Error::Bug("split build without scratch".to_string()))?;

    scratch.key = choose_split_key(w, &run.inputs)?;

    let cnt = w.kvset_cnt();
    let mut left_outs = Vec::with_capacity(cnt);
    let mut right_outs = Vec::with_capacity(cnt);

    for (i, kvset) in run.inputs.iter().enumerate() {
        let mut left = KvsetBuilder::new(Arc::clone(&allocator));
        let mut right = KvsetBuilder::new(Arc::clone(&allocator));

        for (n, entry) in kvset.entries().iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 && tree.cancel_requested() {
                return Err(Error::Shutdown);
            }

            if entry.key.as_slice() <= scratch.key.as_slice() {
                left.add(&entry.key, entry.seqno, entry.value.clone())?;
            } else {
                right.add(&entry.key, entry.seqno, entry.value.clone())?;
            }
        }

        // A prefix tombstone can cover keys on both sides of the split.
        for ptomb in kvset.ptombs() {
            if ptomb.prefix.as_slice() <= scratch.key.as_slice() {
                left.add_ptomb(&ptomb.prefix, ptomb.seqno)?;
            }
            if ptomb.prefix.as_slice() > scratch.key.as_slice()
                || scratch.key.starts_with(&ptomb.prefix)
            {
                right.add_ptomb(&ptomb.prefix, ptomb.seqno)?;
            }
        }

        scratch.dgens[i] = kvset.dgen();
        scratch.dgens[cnt + i] = kvset.dgen();
        scratch.purge.push(kvset.all_block_ids());

        left_outs.push(left.finish()?);
        right_outs.push(right.finish()?);
    }

    let mut outputs = left_outs;
    outputs.append(&mut right_outs);

    run.out_blocks = outputs.iter().map(|o| o.own_block_ids()).collect();
    run.outputs = outputs;
    run.split = Some(scratch);

    Ok(())
}

/// Median distinct key across the node. Policy, not correctness: any key
/// splits the node correctly, the median just balances the halves.
fn choose_split_key(w: &Arc<CompactionWork>, inputs: &[crate::kvset::KvsetRef]) -> Result<Vec<u8>> {
    let tree = w.tree();
    let mut keys: BTreeSet<&[u8]> = BTreeSet::new();

    for kvset in inputs {
        for (n, entry) in kvset.entries().iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 && tree.cancel_requested() {
                return Err(Error::Shutdown);
            }
            keys.insert(&entry.key);
        }
        for ptomb in kvset.ptombs() {
            keys.insert(&ptomb.prefix);
        }
    }

    let mid = (keys.len().saturating_sub(1)) / 2;
    keys.iter()
        .nth(mid)
        .map(|k| k.to_vec())
        .ok_or_else(|| Error::Bug("split of a node with no keys".to_string()))
}
