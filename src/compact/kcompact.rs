//! K-compaction build.
//!
//! Merges the input run into one kvset, rewriting only the key blocks. The
//! inputs' value-block sets are carried into the output by reference, so
//! retiring the inputs later must keep those sets alive
//! (`keep_vblks`). Scatter accumulates: the output's vgroup count is the
//! sum of its inputs'.

use std::sync::Arc;

use crate::error::Result;
use crate::kvset::KvsetBuilder;

use super::{merge, CompactionWork};

pub(crate) fn build(w: &Arc<CompactionWork>) -> Result<()> {
    let tree = w.tree();
    let allocator = Arc::clone(&tree.attached()?.allocator);
    let mut run = w.run.lock();

    let merged = merge::merge_inputs(tree, &run.inputs, run.horizon, run.drop_tombs)?;

    let mut builder = KvsetBuilder::new(allocator);
    for entry in merged.entries {
        builder.add(&entry.key, entry.seqno, entry.value)?;
    }
    for ptomb in merged.ptombs {
        builder.add_ptomb(&ptomb.prefix, ptomb.seqno)?;
    }

    // Carry the value-block sets, newest input first, matching the order
    // the merge consumed them in.
    let vbsets = run
        .inputs
        .iter()
        .flat_map(|k| k.vbsets().iter().cloned())
        .collect();
    let vgroups = run.inputs.iter().map(|k| k.vgroups()).sum();

    let out = builder.finish_carrying(vbsets, vgroups)?;
    run.out_blocks = vec![out.own_block_ids()];
    run.outputs = vec![out];

    Ok(())
}
