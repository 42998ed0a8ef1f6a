//! The keyspace-organizer tree.
//!
//! A tree is a root node plus a flat list of leaf nodes, each holding an
//! ordered list of immutable kvsets. Ingest appends kvsets at the head of
//! the root; spill rewrites root kvsets into per-leaf streams; k/kv-compact
//! merge runs within a node; split partitions an oversized leaf in two.
//!
//! ```text
//!                 ┌───────────────┐
//!   ingest ─────► │     root      │  kvsets, newest first
//!                 └───────┬───────┘
//!                         │ spill (route map partitions by key)
//!          ┌──────────┬───┴──────┬──────────┐
//!          ▼          ▼          ▼          ▼
//!      ┌───────┐  ┌───────┐  ┌───────┐  ┌───────┐
//!      │ leaf  │  │ leaf  │  │ leaf  │  │ leaf  │   k/kv-compact, split
//!      └───────┘  └───────┘  └───────┘  └───────┘
//! ```
//!
//! # Concurrency
//!
//! One read-mostly lock guards structural mutation: node-list membership,
//! kvset-list membership and route-map edits all change only under the
//! write lock, so readers holding the read lock see prefix-stable lists.
//! Long walks yield the read lock periodically to let writers through.
//! Sampling updates are serialized by the same write lock.

pub mod capped;
pub mod lookup;
pub mod node;
pub mod samp;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::blocks::BlockAllocator;
use crate::config::{DataType, NodeAge, RuntimeParams, TreeParams};
use crate::error::{Error, Result};
use crate::health::Health;
use crate::journal::Journal;
use crate::kvset::{KvsetRef, Ptomb};
use crate::route::{routing_span, RouteMap};
use crate::scheduler::IngestObserver;

pub use node::{Node, ROOT_NODEID};
pub use samp::{NodeStats, SampStats};

use capped::CappedState;

/// Structural state guarded by the tree's read-mostly lock.
pub(crate) struct TreeState {
    /// All nodes, root first.
    pub nodes: Vec<Arc<Node>>,
    pub route: RouteMap,
    /// Tree-wide sampling totals: the sum of every node's samp record.
    pub samp: SampStats,
}

impl TreeState {
    pub fn find_node(&self, nodeid: u64) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.nodeid() == nodeid).cloned()
    }
}

/// Collaborators supplied at attach time.
pub(crate) struct Attached {
    pub journal: Arc<dyn Journal>,
    pub allocator: Arc<dyn BlockAllocator>,
    pub observer: Arc<dyn IngestObserver>,
    pub cnid: u64,
}

/// One row of a tree view snapshot: either a node marker (no kvset) or one
/// kvset reference.
pub struct KvsetView {
    pub nodeid: u64,
    pub edge_key: Option<Vec<u8>>,
    pub kvset: Option<KvsetRef>,
}

/// Walk order over each node's kvset list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    NewestFirst,
    OldestFirst,
}

/// Shape summary of the root or of the leaves as a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeStats {
    pub nodec: u64,
    pub avglen: u64,
    pub maxlen: u64,
    pub avgsize: u64,
    pub maxsize: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub root: ShapeStats,
    pub leaves: ShapeStats,
}

/// Nodes visited per read-lock hold during walks and view snapshots.
const WALK_YIELD_NODES: usize = 16;

pub struct Tree {
    params: TreeParams,
    rp: RuntimeParams,
    health: Arc<Health>,

    pub(crate) state: RwLock<TreeState>,
    attached: OnceLock<Attached>,

    /// Set when the block allocator reports a full media.
    nospace: AtomicBool,
    /// Tree-wide cancellation request, observed at iterator boundaries.
    cancel: AtomicBool,
    /// Oldest seqno any active reader can still see.
    seqno_horizon: AtomicU64,

    next_kvset_id: AtomicU64,
    next_job_id: AtomicU64,

    pub(crate) capped: parking_lot::Mutex<CappedState>,
}

impl Tree {
    /// Create an empty tree: a root and `fanout` empty leaves with the
    /// initial edge-key partition. Kvsets arrive via journal replay
    /// ([`Tree::insert_kvset`]) and ingest.
    pub fn create(params: TreeParams, rp: RuntimeParams, health: Arc<Health>) -> Result<Tree> {
        params.validate()?;

        let split_size = rp.node_split_size();
        let mut nodes = vec![Node::new(ROOT_NODEID, split_size)];
        let mut route = RouteMap::create(params.fanout);

        for (i, edge_key) in RouteMap::initial_edge_keys(params.fanout).iter().enumerate() {
            let nodeid = i as u64 + 1;
            nodes.push(Node::new(nodeid, split_size));
            route.insert(nodeid, edge_key)?;
        }

        Ok(Tree {
            params,
            rp,
            health,
            state: RwLock::new(TreeState {
                nodes,
                route,
                samp: SampStats::default(),
            }),
            attached: OnceLock::new(),
            nospace: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            seqno_horizon: AtomicU64::new(u64::MAX),
            next_kvset_id: AtomicU64::new(1),
            next_job_id: AtomicU64::new(1),
            capped: parking_lot::Mutex::new(CappedState::default()),
        })
    }

    /// Attach the tree to its collaborators. Must happen once, before any
    /// ingest or compaction.
    pub fn attach(
        &self,
        allocator: Arc<dyn BlockAllocator>,
        journal: Arc<dyn Journal>,
        cnid: u64,
        observer: Arc<dyn IngestObserver>,
    ) -> Result<()> {
        let attached = Attached {
            journal,
            allocator,
            observer,
            cnid,
        };

        self.attached
            .set(attached)
            .map_err(|_| Error::Invalid("tree already attached".to_string()))
    }

    pub(crate) fn attached(&self) -> Result<&Attached> {
        self.attached
            .get()
            .ok_or_else(|| Error::Bug("tree not attached".to_string()))
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn rp(&self) -> &RuntimeParams {
        &self.rp
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn cnid(&self) -> u64 {
        self.attached.get().map(|a| a.cnid).unwrap_or(0)
    }

    pub fn is_capped(&self) -> bool {
        self.params.capped
    }

    pub fn nospace(&self) -> bool {
        self.nospace.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nospace(&self) {
        self.nospace.store(true, Ordering::SeqCst);
    }

    /// Request cancellation of all in-flight work.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn seqno_horizon(&self) -> u64 {
        self.seqno_horizon.load(Ordering::SeqCst)
    }

    /// Publish the oldest seqno any active reader can still see.
    pub fn set_seqno_horizon(&self, horizon: u64) {
        self.seqno_horizon.store(horizon, Ordering::SeqCst);
    }

    pub(crate) fn mint_kvset_id(&self) -> u64 {
        self.next_kvset_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn mint_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Find a node by id.
    pub fn find_node(&self, nodeid: u64) -> Option<Arc<Node>> {
        self.state.read().find_node(nodeid)
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.state.read().nodes[0])
    }

    pub fn leaves(&self) -> Vec<Arc<Node>> {
        self.state.read().nodes[1..].to_vec()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Insert a kvset during initialization (journal replay). Not for
    /// compaction or ingest updates.
    pub fn insert_kvset(&self, kvset: KvsetRef, nodeid: u64) -> Result<()> {
        let state = self.state.read();
        debug_assert!(state.nodes[0].isroot());

        let node = state
            .find_node(nodeid)
            .ok_or_else(|| Error::Bug(format!("insert into missing node {nodeid}")))?;

        self.next_kvset_id
            .fetch_max(kvset.kvsetid() + 1, Ordering::SeqCst);

        node.insert_kvset(kvset)
    }

    /// Recompute sampling stats from scratch (end of replay).
    pub fn samp_init(&self) {
        let mut state = self.state.write();
        let TreeState { nodes, samp, .. } = &mut *state;
        samp::init(&self.rp, samp, nodes);
    }

    /// Current tree-wide sampling totals.
    pub fn samp(&self) -> SampStats {
        self.state.read().samp
    }

    /// Resolve a key to its leaf via the route map.
    pub fn node_lookup(&self, key: &[u8]) -> Result<Option<Arc<Node>>> {
        let span = routing_span(key, self.params.pfx_len, self.params.sfx_len)?;
        let state = self.state.read();
        Ok(state.route.lookup(span).and_then(|id| state.find_node(id)))
    }

    /// Media class this node's key or value blocks land on.
    pub fn node_mclass(&self, node: &Node, dtype: DataType) -> crate::config::MediaClass {
        let age = if node.isroot() {
            NodeAge::Root
        } else {
            NodeAge::Leaf
        };
        self.rp.mclass_policy.get(age, dtype)
    }

    /// Append a freshly ingested kvset at the head of the root list and
    /// notify the compaction scheduler with the resulting samp deltas.
    ///
    /// `ptomb` is the largest prefix tombstone in the ingest, tracked only
    /// for capped trees where it bounds the trimmer.
    pub fn ingest_update(&self, kvset: KvsetRef, ptomb: Option<Ptomb>) -> Result<()> {
        let attached = self.attached()?;

        let (pre, post) = {
            let mut state = self.state.write();
            let root = Arc::clone(&state.nodes[0]);

            {
                let mut kvsets = root.kvsets.write();
                if let Some(head) = kvsets.front() {
                    if head.dgen() >= kvset.dgen() {
                        return Err(Error::Bug(format!(
                            "ingest dgen {} not above root head {}",
                            kvset.dgen(),
                            head.dgen()
                        )));
                    }
                }
                kvsets.push_front(kvset);
            }
            root.bump_cgen();

            if self.params.capped {
                if let Some(ptomb) = ptomb {
                    self.capped.lock().remember_ptomb(ptomb);
                }
            }

            let pre = state.samp;
            let TreeState { nodes, samp, .. } = &mut *state;
            samp::update_ingest(&self.rp, samp, &nodes[0]);
            let post = state.samp;

            // Ingest can only grow the root; leaf totals must not move.
            debug_assert!(post.i_alen >= pre.i_alen);
            debug_assert!(post.r_wlen >= pre.r_wlen);
            debug_assert_eq!(post.l_alen, pre.l_alen);
            debug_assert_eq!(post.l_good, pre.l_good);

            (pre, post)
        };

        attached.observer.notify_ingest(
            attached.cnid,
            post.r_alen - pre.r_alen,
            post.r_wlen - pre.r_wlen,
        );

        Ok(())
    }

    /// Visit every kvset in node order, root first. The callback returns
    /// `true` to stop. The read lock is yielded periodically so writers can
    /// make progress during long walks.
    pub fn walk<F>(&self, order: WalkOrder, mut callback: F)
    where
        F: FnMut(&Arc<Node>, &KvsetRef) -> bool,
    {
        let mut index = 0;
        loop {
            let state = self.state.read();

            let end = (index + WALK_YIELD_NODES).min(state.nodes.len());
            for node in &state.nodes[index..end] {
                let kvsets = node.kvsets.read();

                let stop = match order {
                    WalkOrder::NewestFirst => {
                        kvsets.iter().any(|kvset| callback(node, kvset))
                    }
                    WalkOrder::OldestFirst => {
                        kvsets.iter().rev().any(|kvset| callback(node, kvset))
                    }
                };

                if stop {
                    return;
                }
            }

            if end == state.nodes.len() {
                return;
            }
            index = end;
        }
    }

    /// Build a stable snapshot of the tree: one marker row per node (with
    /// its route edge key) followed by one row per kvset, each holding a
    /// reference. Dropping the snapshot releases every reference.
    pub fn view(&self) -> Vec<KvsetView> {
        let mut view = Vec::new();
        let mut index = 0;

        loop {
            let state = self.state.read();

            let end = (index + WALK_YIELD_NODES).min(state.nodes.len());
            for node in &state.nodes[index..end] {
                let nodeid = node.nodeid();

                view.push(KvsetView {
                    nodeid,
                    edge_key: state.route.edge_key(nodeid).map(|k| k.to_vec()),
                    kvset: None,
                });

                for kvset in node.kvsets.read().iter() {
                    debug_assert_eq!(kvset.nodeid(), nodeid);
                    view.push(KvsetView {
                        nodeid,
                        edge_key: None,
                        kvset: Some(Arc::clone(kvset)),
                    });
                }
            }

            if end == state.nodes.len() {
                return view;
            }
            index = end;
        }
    }

    /// Shape summary: node count, list lengths and sizes for the root and
    /// the leaves.
    pub fn shape(&self) -> TreeShape {
        let state = self.state.read();
        let mut shape = TreeShape::default();

        for node in &state.nodes {
            let ns = node.stats();
            let len = ns.nkvsets;
            let size = ns.alen();

            let s = if node.isroot() {
                &mut shape.root
            } else {
                &mut shape.leaves
            };
            s.nodec += 1;
            s.avglen += len;
            s.avgsize += size;
            s.maxlen = s.maxlen.max(len);
            s.maxsize = s.maxsize.max(size);
        }
        drop(state);

        for s in [&mut shape.root, &mut shape.leaves] {
            if s.nodec > 0 {
                s.avglen /= s.nodec;
                s.avgsize /= s.nodec;
            }
        }

        shape
    }

    /// Tear the tree down. Kvset references are dropped on a background
    /// thread so that any block deletions they trigger stay off the
    /// caller; the thread is joined before returning.
    pub fn destroy(&self) {
        let nodes: Vec<Arc<Node>> = {
            let mut state = self.state.write();
            let mut nodes: Vec<_> = state.nodes.drain(..).collect();

            // Root is dropped last.
            nodes.reverse();
            for node in &nodes {
                state.route.delete(node.nodeid());
            }
            state.samp = SampStats::default();
            nodes
        };

        let reaper = std::thread::spawn(move || {
            for node in nodes {
                let retired: Vec<KvsetRef> = node.kvsets.write().drain(..).collect();
                drop(retired);
            }
        });

        if let Err(e) = reaper.join() {
            tracing::error!(?e, "tree teardown reaper panicked");
        }
    }
}
