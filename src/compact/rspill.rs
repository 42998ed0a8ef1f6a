//! Concurrent root-spill ordering.
//!
//! Root spills may build in parallel, but their effects must apply in
//! submission order or a reader could see an old value where a newer one
//! existed. Each spill takes a FIFO ticket at reserve time; when a worker
//! finishes building it marks its job done and then repeatedly asks for
//! the completed head of the queue, committing whichever jobs have become
//! ready, be that its own or an earlier one left behind by another worker.

use std::sync::Arc;

use crate::error::Error;
use crate::tree::Node;

use super::CompactionWork;

/// Pick the spill at the head of the node's FIFO if it has finished
/// building and nobody is committing it yet. The job stays on the list
/// until its release pops it.
pub(crate) fn get_completed_spill(node: &Arc<Node>) -> Option<Arc<CompactionWork>> {
    let rspills = node.rspills.lock();

    let w = rspills.front().cloned()?;
    if !w.rspill_done() || w.rspill_commit_in_progress() {
        return None;
    }

    w.set_rspill_commit_in_progress();

    // A wedged node means an earlier spill failed; committing this one
    // would apply effects over the gap. Force it down the cancel path.
    if node.wedged() && w.err().is_none() {
        w.set_err(Error::Shutdown);
        w.set_canceled();
    }

    Some(w)
}
