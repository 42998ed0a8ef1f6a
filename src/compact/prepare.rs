//! Compaction preparation.
//!
//! Validates the staked input window, sizes the output descriptor array for
//! the action, and captures whatever the build phase must not take locks
//! for: the spill's route partition snapshot and the split's pre-split max
//! key.

use std::sync::Arc;

use crate::error::{Error, Result};

use super::{CompactAction, CompactionWork, RouteSnapshot, SplitScratch, INVALID_NODEID};

pub(crate) fn prepare(w: &Arc<CompactionWork>) -> Result<()> {
    let tree = w.tree();
    let mut run = w.run.lock();

    if run.inputs.is_empty() {
        return Err(Error::Bug("compaction with no inputs".to_string()));
    }

    // Inputs are newest first and span exactly [dgen_lo, dgen_hi].
    if run.inputs[0].dgen() != w.dgen_hi()
        || run.inputs.last().map(|k| k.dgen()) != Some(w.dgen_lo())
    {
        return Err(Error::Corrupt(format!(
            "input window does not span [{}, {}]",
            w.dgen_lo(),
            w.dgen_hi()
        )));
    }
    for pair in run.inputs.windows(2) {
        if pair[0].dgen() <= pair[1].dgen() {
            return Err(Error::Corrupt("input window dgen order broken".to_string()));
        }
        if pair[0].workid() != w.job_id() || pair[1].workid() != w.job_id() {
            return Err(Error::Bug("input window not reserved by this job".to_string()));
        }
    }

    run.outc = match w.action() {
        CompactAction::KCompact | CompactAction::KvCompact => 1,

        // One output stream per leaf.
        CompactAction::Spill => {
            let state = tree.state.read();
            let entries = state.route.entries_in_order();

            let mut edges = Vec::with_capacity(entries.len());
            let mut output_nodes = Vec::with_capacity(entries.len());
            for (idx, (edge_key, nodeid)) in entries.into_iter().enumerate() {
                let node = state.find_node(nodeid).ok_or_else(|| {
                    Error::Bug(format!("route names missing node {nodeid}"))
                })?;
                edges.push((edge_key, idx));
                output_nodes.push(node);
            }

            if output_nodes.is_empty() {
                return Err(Error::Bug("spill with no route entries".to_string()));
            }

            run.route_snap = Some(RouteSnapshot::new(edges));
            let outc = output_nodes.len();
            run.output_nodes = output_nodes;
            outc
        }

        // Each input can contribute a kvset to both halves.
        CompactAction::Split => {
            let max_key = w
                .node()
                .max_key()
                .ok_or_else(|| Error::Bug("split of an empty node".to_string()))?;

            let outc = 2 * w.kvset_cnt();
            run.split = Some(SplitScratch {
                key: Vec::new(),
                dgens: vec![0; outc],
                purge: Vec::with_capacity(w.kvset_cnt()),
                nodeids: [INVALID_NODEID; 2],
                right_max_key: max_key,
            });
            outc
        }
    };

    // Tombstones can only be dropped when nothing older remains beneath
    // the window.
    run.drop_tombs = w.action() != CompactAction::Spill && w.tail_off() == 0;
    run.keep_vblks = w.action() == CompactAction::KCompact;

    Ok(())
}
