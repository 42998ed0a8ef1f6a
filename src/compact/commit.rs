//! Compaction commit and cleanup.
//!
//! Commit turns build output into durable tree state: one journal
//! transaction declaring the adds and deletes, per-output metadata
//! derivation, block commit, kvset open, then the action's tree update.
//! Any failure after the transaction opens naks it and leaves cleanup to
//! destroy whatever blocks the job allocated.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::journal::{KvsetRecordMeta, INVAL_HORIZON, INVAL_INGESTID};
use crate::kvset::{Kvset, KvsetRef, OutputBlocks};

use super::{update, CompactAction, CompactionWork, INVALID_NODEID};

pub(crate) fn commit(w: &Arc<CompactionWork>) {
    if w.err().is_some() {
        return;
    }

    if let Err(e) = try_commit(w) {
        if !w.canceled() {
            w.tree().health().error(&e);
        }
        w.set_err(e);
    }
}

fn try_commit(w: &Arc<CompactionWork>) -> Result<()> {
    let tree = w.tree();
    let attached = tree.attached()?;
    let cnid = attached.cnid;
    let kcompact = w.action() == CompactAction::KCompact;
    let split = w.action() == CompactAction::Split;

    let mut run = w.run.lock();

    if run.outputs.len() != run.outc || run.outc == 0 {
        return Err(Error::Bug(format!(
            "build produced {} outputs, expected {}",
            run.outputs.len(),
            run.outc
        )));
    }

    // A k-compaction with enough tombstones can annihilate every key; the
    // empty output is skipped below, and the inputs' value blocks must die
    // with them.
    if kcompact && run.outputs[0].is_empty() {
        run.keep_vblks = false;
    }

    let txn = attached.journal.txstart(
        INVAL_INGESTID,
        INVAL_HORIZON,
        run.outc as u16,
        w.kvset_cnt() as u16,
    )?;

    // Split halves that received kvsets get freshly minted node ids.
    if split {
        let cnt = w.kvset_cnt();
        let left_live = run.outputs[..cnt].iter().any(|o| !o.is_empty());
        let right_live = run.outputs[cnt..].iter().any(|o| !o.is_empty());

        let scratch = run
            .split
            .as_mut()
            .ok_or_else(|| Error::Bug("split commit without scratch".to_string()))?;
        scratch.nodeids[0] = if left_live {
            attached.journal.mint_node_id()
        } else {
            INVALID_NODEID
        };
        scratch.nodeids[1] = if right_live {
            attached.journal.mint_node_id()
        } else {
            INVALID_NODEID
        };
    }

    let result = commit_records(w, &mut run, txn, cnid);

    match result {
        Ok(kvsets) => {
            let update_result = match w.action() {
                CompactAction::KCompact | CompactAction::KvCompact => {
                    update::kvcompact(w, &mut run, kvsets.into_iter().next().flatten());
                    Ok(())
                }
                CompactAction::Spill => {
                    update::spill(w, &mut run, kvsets);
                    Ok(())
                }
                CompactAction::Split => update::split(w, &mut run, kvsets),
            };

            if let Err(e) = update_result {
                attached.journal.nak(txn).ok();
                return Err(e);
            }
            Ok(())
        }
        Err(e) => {
            attached.journal.nak(txn).ok();
            Err(e)
        }
    }
}

/// Log adds, commit blocks, open output kvsets, log deletes, ack adds.
fn commit_records(
    w: &Arc<CompactionWork>,
    run: &mut super::RunState,
    txn: crate::journal::JournalTxn,
    cnid: u64,
) -> Result<Vec<Option<KvsetRef>>> {
    let tree = w.tree();
    let attached = tree.attached()?;
    let cnt = w.kvset_cnt();

    let mut kvsets: Vec<Option<KvsetRef>> = Vec::with_capacity(run.outc);
    kvsets.resize_with(run.outc, || None);
    let mut cookies: Vec<Option<u64>> = vec![None; run.outc];

    for i in 0..run.outc {
        if run.outputs[i].is_empty() {
            continue;
        }

        let (nodeid, dgen, compc) = match w.action() {
            CompactAction::Spill => {
                let node = &run.output_nodes[i];
                let stats = &run.outputs[i].stats;
                let rp = tree.rp();

                // Monotonic loads tend to create very large kvsets. If this
                // becomes the first kvset of an empty node and looks big,
                // seed it with a large compc to defer rewrites of what is
                // effectively already-sorted data.
                let mut compc = 0;
                if node.is_empty()
                    && (stats.nkblks > u64::from(rp.spill_seed_kblks)
                        || stats.nvblks > u64::from(rp.spill_seed_vblks))
                {
                    compc += rp.spill_seed_boost;
                }

                (node.nodeid(), w.dgen_hi(), compc)
            }

            CompactAction::Split => {
                let scratch = run.split.as_ref().expect("split scratch");
                let nodeid = scratch.nodeids[i / cnt];
                debug_assert_ne!(nodeid, INVALID_NODEID);
                (nodeid, scratch.dgens[i], w.compc())
            }

            CompactAction::KCompact | CompactAction::KvCompact => {
                // Bump compc, but never past the next-older kvset: a run in
                // the middle of a node must not drift above its neighbors.
                let mut compc = w.compc();
                let capped = run
                    .older_sibling_compc
                    .map(|sibling| compc >= sibling)
                    .unwrap_or(false);
                if !capped {
                    compc += 1;
                }

                (w.node().nodeid(), w.dgen_hi(), compc)
            }
        };

        let out = &run.outputs[i];
        let meta = KvsetRecordMeta {
            dgen,
            compc,
            vused: out.vused,
        };

        let hblk = out.hblk.expect("non-empty output has a header block");
        let mut vblks = out.vblks.clone();
        for vbset in &out.vbsets {
            vblks.extend_from_slice(vbset.vblks());
        }

        let kvsetid = tree.mint_kvset_id();
        cookies[i] = Some(attached.journal.record_kvset_add(
            txn, cnid, nodeid, &meta, kvsetid, hblk, &out.kblks, &vblks,
        )?);

        // Make this output's blocks durable. Carried value blocks were
        // committed by the job that wrote them.
        attached.allocator.commit(&run.out_blocks[i])?;

        let out = std::mem::replace(&mut run.outputs[i], OutputBlocks::empty());
        kvsets[i] = Some(Kvset::open(
            Arc::clone(&attached.allocator),
            kvsetid,
            nodeid,
            dgen,
            compc,
            out,
        )?);
    }

    // Delete records for the inputs, oldest to newest.
    for kvset in run.inputs.iter().rev() {
        attached
            .journal
            .record_kvset_delete(txn, cnid, kvset.nodeid(), kvset.kvsetid())?;
    }

    // Ack every add.
    for cookie in cookies.into_iter().flatten() {
        attached.journal.record_kvset_add_ack(txn, cookie)?;
    }

    Ok(kvsets)
}

/// Destroy the blocks of a failed job and drop build scratch. Successful
/// jobs only shed scratch here.
pub(crate) fn cleanup(w: &Arc<CompactionWork>) {
    let tree = w.tree();

    if let Some(err) = w.err() {
        // A failed root spill wedges the node: later spills must not
        // commit over the gap.
        if w.rspill_conc() && !w.node().wedged() {
            w.node().set_wedged();
        }

        if err == Error::NoSpace {
            tree.set_nospace();
        }

        // Canceled jobs are expected; only real failures are logged.
        if !w.canceled() {
            tracing::error!(
                job = w.job_id(),
                action = w.action().as_str(),
                cnid = tree.cnid(),
                nodeid = w.node().nodeid(),
                dgen_lo = w.dgen_lo(),
                dgen_hi = w.dgen_hi(),
                wedged = w.node().wedged(),
                error = %err,
                "compaction failed"
            );
        }

        let run = w.run.lock();
        if let Ok(attached) = tree.attached() {
            for blocks in run.out_blocks.iter().filter(|b| !b.is_empty()) {
                if let Err(e) = attached.allocator.delete(blocks) {
                    tracing::warn!(error = %e, "failed to destroy compaction output blocks");
                }
            }
        }
    }

    let mut run = w.run.lock();
    run.outputs.clear();
    run.out_blocks.clear();
    run.output_nodes.clear();
    run.route_snap = None;
    run.split = None;
}
