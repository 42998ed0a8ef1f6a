//! Periodic tree chores.
//!
//! Registered with the [`crate::scheduler::Scheduler`]: the capped-tree
//! trim tick and the shape report. Compaction jobs themselves are
//! dispatched by the external scheduler onto its own workers and do not
//! run here.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::BackgroundTask;
use crate::tree::Tree;

/// Trims expired kvsets off a capped tree's root tail.
pub struct CappedCompactTask {
    tree: Arc<Tree>,
}

impl CappedCompactTask {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CappedCompactTask {
    fn name(&self) -> &'static str {
        "capped-compact"
    }

    fn interval(&self) -> Duration {
        self.tree.rp().tasks.capped_compact_interval
    }

    async fn execute(&self) -> Result<()> {
        self.tree.capped_compact()
    }
}

/// Logs a periodic shape and sampling summary.
pub struct ShapeReportTask {
    tree: Arc<Tree>,
}

impl ShapeReportTask {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ShapeReportTask {
    fn name(&self) -> &'static str {
        "shape-report"
    }

    fn interval(&self) -> Duration {
        self.tree.rp().tasks.shape_report_interval
    }

    async fn execute(&self) -> Result<()> {
        let shape = self.tree.shape();
        let samp = self.tree.samp();

        tracing::info!(
            cnid = self.tree.cnid(),
            root_len = shape.root.avglen,
            leaf_nodes = shape.leaves.nodec,
            leaf_avglen = shape.leaves.avglen,
            leaf_maxsize = shape.leaves.maxsize,
            r_alen = samp.r_alen,
            l_alen = samp.l_alen,
            l_good = samp.l_good,
            "tree shape"
        );

        Ok(())
    }
}
