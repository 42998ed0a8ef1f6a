//! Action-specific tree updates.
//!
//! All three variants follow the same discipline: take the tree write
//! lock, splice the retired inputs out to a local list, install the new
//! kvsets, bracket the sampling recompute with pre/post totals, return the
//! job's busy stake, and release the lock. Only then are the retired
//! kvsets deleted, so block deletion I/O never runs under the lock.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kvset::KvsetRef;
use crate::tree::node::Node;
use crate::tree::{samp, TreeState};

use super::{CompactionWork, RunState, INVALID_NODEID};

/// Replace the input window with the merged kvset (k-compact and
/// kv-compact). `new_kvset` is `None` when every key was annihilated.
pub(crate) fn kvcompact(w: &Arc<CompactionWork>, run: &mut RunState, new_kvset: Option<KvsetRef>) {
    let tree = w.tree();
    let node = w.node();

    let retired: Vec<KvsetRef> = {
        let mut state = tree.state.write();

        let retired: Vec<KvsetRef> = {
            let mut kvsets = node.kvsets.write();

            let start = kvsets
                .iter()
                .position(|k| k.dgen() == w.dgen_hi())
                .expect("input window vanished from node");
            let end = start + w.kvset_cnt();
            assert_eq!(
                kvsets[end - 1].dgen(),
                w.dgen_lo(),
                "input window no longer contiguous"
            );

            let mut retired = Vec::with_capacity(w.kvset_cnt());
            for _ in start..end {
                retired.push(kvsets.remove(start).expect("window in bounds"));
            }

            if let Some(new_kvset) = new_kvset {
                kvsets.insert(start, new_kvset);
            }

            retired
        };
        node.bump_cgen();

        run.samp_pre = state.samp;
        let TreeState { nodes: _, samp, .. } = &mut *state;
        samp::update_compact(tree.rp(), samp, node);
        run.samp_post = state.samp;

        w.release_busy();
        retired
    };

    for kvset in retired {
        debug_assert!(kvset.dgen() >= w.dgen_lo() && kvset.dgen() <= w.dgen_hi());
        kvset.mark_for_delete(run.keep_vblks);
    }
}

/// Install spill outputs at the leaves and retire the root inputs.
pub(crate) fn spill(w: &Arc<CompactionWork>, run: &mut RunState, kvsets: Vec<Option<KvsetRef>>) {
    let tree = w.tree();
    let source = w.node();

    let retired: Vec<KvsetRef> = {
        let mut state = tree.state.write();

        for (i, kvset) in kvsets.into_iter().enumerate() {
            let Some(kvset) = kvset else { continue };
            let dest = &run.output_nodes[i];

            let mut list = dest.kvsets.write();
            if let Some(head) = list.front() {
                assert!(
                    head.dgen() < kvset.dgen(),
                    "spill output below destination head dgen"
                );
            }
            list.push_front(kvset);
            drop(list);
            dest.bump_cgen();
        }

        source.bump_cgen();

        let retired: Vec<KvsetRef> = {
            let mut list = source.kvsets.write();
            let mut retired = Vec::with_capacity(w.kvset_cnt());

            for i in 0..w.kvset_cnt() {
                let oldest = list.pop_back().expect("spill inputs still listed");
                // Concurrent spills from this node must commit in
                // submission order; the oldest remaining kvset proves it.
                if i == 0 {
                    assert_eq!(
                        oldest.dgen(),
                        w.dgen_lo(),
                        "root spill committed out of submission order"
                    );
                }
                retired.push(oldest);
            }
            retired
        };

        run.samp_pre = state.samp;
        let TreeState { nodes, samp, .. } = &mut *state;
        samp::update_spill(tree.rp(), samp, nodes);
        run.samp_post = state.samp;

        w.release_busy();
        retired
    };

    for kvset in retired {
        kvset.mark_for_delete(false);
    }
}

/// Publish a node split: new left node into the route map and node list,
/// right half re-attached to the (re-numbered) source node.
pub(crate) fn split(
    w: &Arc<CompactionWork>,
    run: &mut RunState,
    mut kvsets: Vec<Option<KvsetRef>>,
) -> Result<()> {
    let tree = w.tree();
    let right = w.node();
    let cnt = w.kvset_cnt();

    let scratch = run
        .split
        .take()
        .ok_or_else(|| Error::Bug("split update without scratch".to_string()))?;
    let [left_id, right_id] = scratch.nodeids;

    // Assemble the left node before publication; nothing can see it yet.
    let left = if left_id != INVALID_NODEID {
        let left = Node::new(left_id, tree.rp().node_split_size());
        {
            let mut list = left.kvsets.write();
            for slot in kvsets.iter_mut().take(cnt) {
                if let Some(kvset) = slot.take() {
                    list.push_back(kvset);
                }
            }
        }
        Some(left)
    } else {
        None
    };

    let retired: Vec<KvsetRef> = {
        let mut state = tree.state.write();

        // Route edits first, before any kvset moves, so a failure leaves
        // the lists untouched. The right node's edge must be settled
        // before the left edge is inserted or the last-node check below
        // would no longer see the right node as last.
        if right_id != INVALID_NODEID {
            let old_id = right.nodeid();
            let edge = state.route.delete(old_id).ok_or_else(|| {
                Error::Bug(format!("split source {old_id} missing from route map"))
            })?;
            state.route.insert(right_id, &edge)?;

            // The last route node catches all keys beyond the penultimate
            // edge, so its stored edge key can lag the keys it holds. If
            // the chosen split key overtook it, rewrite the edge to the
            // node's actual pre-split max key.
            if state.route.islast(right_id)
                && state.route.keycmp(right_id, &scratch.key)? != std::cmp::Ordering::Greater
            {
                state.route.key_modify(right_id, &scratch.right_max_key)?;
            }
            debug_assert_eq!(
                state.route.keycmp(right_id, &scratch.key)?,
                std::cmp::Ordering::Greater
            );

            right.set_nodeid(right_id);
        }

        if left.is_some() {
            state.route.insert(left_id, &scratch.key)?;
        }

        // Move every source kvset to the retired list and re-attach the
        // right half.
        let retired: Vec<KvsetRef> = {
            let mut list = right.kvsets.write();
            let retired: Vec<KvsetRef> = list.drain(..).collect();

            if right_id != INVALID_NODEID {
                for slot in kvsets.iter_mut().skip(cnt) {
                    if let Some(kvset) = slot.take() {
                        list.push_back(kvset);
                    }
                }
            }
            retired
        };
        right.bump_cgen();

        if let Some(left) = &left {
            left.bump_cgen();
            state.nodes.push(Arc::clone(left));
        }

        run.samp_pre = state.samp;
        let TreeState { nodes: _, samp, .. } = &mut *state;
        if let Some(left) = &left {
            samp::update_compact(tree.rp(), samp, left);
        }
        samp::update_compact(tree.rp(), samp, right);
        run.samp_post = state.samp;

        w.release_busy();
        retired
    };

    // The retired inputs' blocks travel on the purge lists; the kvsets
    // themselves are dropped unmarked so nothing is freed twice.
    let attached = tree.attached()?;
    for (i, kvset) in retired.into_iter().enumerate() {
        if let Some(purge) = scratch.purge.get(i) {
            if let Err(e) = attached.allocator.delete(purge) {
                tracing::warn!(error = %e, "failed to purge split input blocks");
            }
        }
        drop(kvset);
    }

    Ok(())
}
