//! Spill and kv-compaction builds.
//!
//! Both run the same merge; kv-compaction pours the result into a single
//! output, spill partitions it across one output stream per leaf using the
//! route snapshot captured at prepare time.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kvset::KvsetBuilder;
use crate::route::routing_span;

use super::{merge, CompactAction, CompactionWork};

pub(crate) fn build(w: &Arc<CompactionWork>) -> Result<()> {
    let tree = w.tree();
    let allocator = Arc::clone(&tree.attached()?.allocator);
    let mut run = w.run.lock();

    let merged = merge::merge_inputs(tree, &run.inputs, run.horizon, run.drop_tombs)?;

    if w.action() == CompactAction::KvCompact {
        let mut builder = KvsetBuilder::new(allocator);
        for entry in merged.entries {
            builder.add(&entry.key, entry.seqno, entry.value)?;
        }
        for ptomb in merged.ptombs {
            builder.add_ptomb(&ptomb.prefix, ptomb.seqno)?;
        }

        let out = builder.finish()?;
        run.out_blocks = vec![out.own_block_ids()];
        run.outputs = vec![out];
        return Ok(());
    }

    // Spill: route every key to its leaf's stream.
    let snap = run
        .route_snap
        .as_ref()
        .ok_or_else(|| Error::Bug("spill build without route snapshot".to_string()))?;
    let pfx_len = tree.params().pfx_len;
    let sfx_len = tree.params().sfx_len;

    let mut builders: Vec<KvsetBuilder> = (0..run.outc)
        .map(|_| KvsetBuilder::new(Arc::clone(&allocator)))
        .collect();

    for entry in merged.entries {
        let span = routing_span(&entry.key, pfx_len, sfx_len)?;
        let idx = snap.output_for(span);
        builders[idx].add(&entry.key, entry.seqno, entry.value)?;
    }

    // A prefix tombstone routes by its own span: all keys it covers share
    // its prefix and land in the same leaf.
    for ptomb in merged.ptombs {
        let span = routing_span(&ptomb.prefix, pfx_len, 0)?;
        let idx = snap.output_for(span);
        builders[idx].add_ptomb(&ptomb.prefix, ptomb.seqno)?;
    }

    let mut outputs = Vec::with_capacity(builders.len());
    let mut out_blocks = Vec::with_capacity(builders.len());
    for builder in builders {
        let out = builder.finish()?;
        out_blocks.push(out.own_block_ids());
        outputs.push(out);
    }

    run.outputs = outputs;
    run.out_blocks = out_blocks;

    Ok(())
}
