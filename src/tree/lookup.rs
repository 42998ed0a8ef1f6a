//! Point-get and prefix-probe descent.
//!
//! Both searches descend at most two levels: the root's kvset list newest
//! to oldest, then the one leaf the route map resolves, walked the same
//! way. The first kvset that answers wins; older kvsets cannot override a
//! newer value or tombstone.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::kvset::{EntryValue, Kvset, KvsetLookup};
use crate::route::routing_span;

use super::Tree;

/// Outcome of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    Value(Vec<u8>),
    /// The key was deleted at or before the view seqno. Callers layering
    /// multiple sources must not consult older ones.
    Tombstone,
}

/// Outcome of a prefix probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    NotFound,
    /// Exactly one live key under the prefix.
    One { key: Vec<u8>, value: Vec<u8> },
    /// More than one live key; carries the first hit.
    Multiple { key: Vec<u8>, value: Vec<u8> },
}

/// Probe accumulator threaded across kvsets.
struct ProbeState {
    seen: BTreeSet<Vec<u8>>,
    dead: BTreeSet<Vec<u8>>,
    first: Option<(Vec<u8>, Vec<u8>)>,
}

enum ProbeStep {
    Continue,
    /// A covering prefix tombstone hides everything older.
    Cut,
    Multiple,
}

impl Tree {
    /// Search the tree for `key` at view seqno `seq`.
    pub fn get(&self, key: &[u8], seq: u64) -> Result<LookupResult> {
        let span = routing_span(key, self.params().pfx_len, self.params().sfx_len)?;
        let state = self.state.read();

        let mut node = Some(Arc::clone(&state.nodes[0]));
        while let Some(n) = node {
            for kvset in n.kvsets.read().iter() {
                match kvset.lookup(key, seq) {
                    KvsetLookup::NotFound => {}
                    KvsetLookup::Value(v) => return Ok(LookupResult::Value(v)),
                    KvsetLookup::Tombstone => return Ok(LookupResult::Tombstone),
                }
            }

            if !n.isroot() {
                break;
            }
            node = state.route.lookup(span).and_then(|id| state.find_node(id));
        }

        Ok(LookupResult::NotFound)
    }

    /// Probe for keys under `prefix` at view seqno `seq`, stopping as soon
    /// as a second live key proves the answer is "many".
    pub fn prefix_probe(&self, prefix: &[u8], seq: u64) -> Result<ProbeResult> {
        let span = routing_span(prefix, self.params().pfx_len, 0)?;
        let state = self.state.read();

        let mut acc = ProbeState {
            seen: BTreeSet::new(),
            dead: BTreeSet::new(),
            first: None,
        };

        let mut node = Some(Arc::clone(&state.nodes[0]));
        'descent: while let Some(n) = node {
            for kvset in n.kvsets.read().iter() {
                match probe_kvset(kvset, prefix, seq, &mut acc) {
                    ProbeStep::Continue => {}
                    ProbeStep::Cut => break 'descent,
                    ProbeStep::Multiple => {
                        let (key, value) = acc.first.expect("multiple implies a first hit");
                        return Ok(ProbeResult::Multiple { key, value });
                    }
                }
            }

            if !n.isroot() {
                break;
            }
            node = state.route.lookup(span).and_then(|id| state.find_node(id));
        }

        Ok(match acc.first {
            None => ProbeResult::NotFound,
            Some((key, value)) => ProbeResult::One { key, value },
        })
    }
}

/// Fold one kvset into the probe accumulator.
fn probe_kvset(kvset: &Kvset, prefix: &[u8], seq: u64, acc: &mut ProbeState) -> ProbeStep {
    // A prefix tombstone covering the probe hides entries below its seqno,
    // in this kvset and in everything older.
    let ptomb_seq = kvset
        .ptombs()
        .iter()
        .filter(|p| p.seqno <= seq && prefix.starts_with(&p.prefix))
        .map(|p| p.seqno)
        .max();

    let entries = kvset.entries();
    let start = entries.partition_point(|e| e.key.as_slice() < prefix);

    let mut i = start;
    while i < entries.len() && entries[i].key.starts_with(prefix) {
        let key = entries[i].key.clone();

        // Newest visible version of this key within the kvset.
        let visible = entries[i..]
            .iter()
            .take_while(|e| e.key == key)
            .find(|e| e.seqno <= seq && ptomb_seq.map(|ps| e.seqno >= ps).unwrap_or(true));

        while i < entries.len() && entries[i].key == key {
            i += 1;
        }

        let Some(entry) = visible else { continue };
        if acc.seen.contains(&key) || acc.dead.contains(&key) {
            continue;
        }

        match &entry.value {
            EntryValue::Tombstone => {
                acc.dead.insert(key);
            }
            EntryValue::Value(v) => {
                if acc.first.is_none() {
                    acc.first = Some((key.clone(), v.clone()));
                }
                acc.seen.insert(key);
                if acc.seen.len() > 1 {
                    return ProbeStep::Multiple;
                }
            }
        }
    }

    if ptomb_seq.is_some() {
        ProbeStep::Cut
    } else {
        ProbeStep::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeParams, TreeParams};
    use crate::health::Health;
    use crate::mock::{kvset_of, MemAllocator, MemJournal};
    use crate::scheduler::NullObserver;
    use crate::Error;

    fn probe_tree() -> (Arc<Tree>, Arc<MemAllocator>) {
        let allocator = Arc::new(MemAllocator::new());
        let tree = Tree::create(
            TreeParams::new(4),
            RuntimeParams::default(),
            Arc::new(Health::new()),
        )
        .unwrap();
        tree.attach(
            Arc::clone(&allocator) as _,
            Arc::new(MemJournal::new()) as _,
            1,
            Arc::new(NullObserver) as _,
        )
        .unwrap();
        (Arc::new(tree), allocator)
    }

    #[test]
    fn test_get_from_root_and_leaf() -> Result<()> {
        let (tree, allocator) = probe_tree();

        // A kvset placed directly in a leaf (as a spill would) and a newer
        // one in the root.
        let leaf = tree.node_lookup(b"\x10k")?.unwrap();
        let ks = kvset_of(&allocator, 1, leaf.nodeid(), 1, 0, &[(b"\x10k", 1, Some(b"leafv"))]);
        tree.insert_kvset(ks, leaf.nodeid())?;

        let ks = kvset_of(&allocator, 2, 0, 2, 0, &[(b"\x10other", 5, Some(b"rootv"))]);
        tree.ingest_update(ks, None)?;

        assert_eq!(tree.get(b"\x10other", 10)?, LookupResult::Value(b"rootv".to_vec()));
        assert_eq!(tree.get(b"\x10k", 10)?, LookupResult::Value(b"leafv".to_vec()));
        assert_eq!(tree.get(b"\x10missing", 10)?, LookupResult::NotFound);
        Ok(())
    }

    #[test]
    fn test_newer_kvset_shadows_older() -> Result<()> {
        let (tree, allocator) = probe_tree();

        let ks = kvset_of(&allocator, 1, 0, 1, 0, &[(b"k", 1, Some(b"old"))]);
        tree.ingest_update(ks, None)?;
        let ks = kvset_of(&allocator, 2, 0, 2, 0, &[(b"k", 5, None)]);
        tree.ingest_update(ks, None)?;

        assert_eq!(tree.get(b"k", 10)?, LookupResult::Tombstone);
        // Below the tombstone's seqno the old value is still visible.
        assert_eq!(tree.get(b"k", 4)?, LookupResult::Value(b"old".to_vec()));
        Ok(())
    }

    #[test]
    fn test_suffixed_tree_rejects_short_keys() {
        let allocator = Arc::new(MemAllocator::new());
        let tree = Tree::create(
            TreeParams::new(4).pfx_len(4).sfx_len(4),
            RuntimeParams::default(),
            Arc::new(Health::new()),
        )
        .unwrap();
        let _ = allocator;

        assert!(matches!(tree.get(b"short", 1), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_probe_counts_live_keys() -> Result<()> {
        let (tree, allocator) = probe_tree();

        let ks = kvset_of(&allocator, 1, 0, 1, 0, &[(b"ab.1", 1, Some(b"x"))]);
        tree.ingest_update(ks, None)?;

        assert_eq!(
            tree.prefix_probe(b"ab", 10)?,
            ProbeResult::One {
                key: b"ab.1".to_vec(),
                value: b"x".to_vec()
            }
        );

        let ks = kvset_of(&allocator, 2, 0, 2, 0, &[(b"ab.2", 2, Some(b"y"))]);
        tree.ingest_update(ks, None)?;

        assert!(matches!(tree.prefix_probe(b"ab", 10)?, ProbeResult::Multiple { .. }));
        assert_eq!(tree.prefix_probe(b"zz", 10)?, ProbeResult::NotFound);
        Ok(())
    }

    #[test]
    fn test_probe_tombstone_suppresses_key() -> Result<()> {
        let (tree, allocator) = probe_tree();

        let ks = kvset_of(
            &allocator,
            1,
            0,
            1,
            0,
            &[(b"ab.1", 1, Some(b"x")), (b"ab.2", 1, Some(b"y"))],
        );
        tree.ingest_update(ks, None)?;
        let ks = kvset_of(&allocator, 2, 0, 2, 0, &[(b"ab.2", 5, None)]);
        tree.ingest_update(ks, None)?;

        assert_eq!(
            tree.prefix_probe(b"ab", 10)?,
            ProbeResult::One {
                key: b"ab.1".to_vec(),
                value: b"x".to_vec()
            }
        );
        Ok(())
    }

    #[test]
    fn test_probe_stops_at_covering_ptomb() -> Result<()> {
        let (tree, allocator) = probe_tree();

        // Old value below, then a covering ptomb above it.
        let ks = kvset_of(&allocator, 1, 0, 1, 0, &[(b"ab.old", 1, Some(b"x"))]);
        tree.ingest_update(ks, None)?;

        let alloc: Arc<dyn crate::blocks::BlockAllocator> = Arc::clone(&allocator) as _;
        let mut builder = crate::kvset::KvsetBuilder::new(Arc::clone(&alloc));
        builder.add(b"ab.new", 9, EntryValue::Value(b"n".to_vec())).unwrap();
        builder.add_ptomb(b"ab", 5).unwrap();
        let out = builder.finish().unwrap();
        let ks = crate::kvset::Kvset::open(alloc, 2, 0, 2, 0, out).unwrap();
        tree.ingest_update(ks, None)?;

        // The seq-9 write survives its own ptomb; the seq-1 write does not.
        assert_eq!(
            tree.prefix_probe(b"ab", 10)?,
            ProbeResult::One {
                key: b"ab.new".to_vec(),
                value: b"n".to_vec()
            }
        );
        Ok(())
    }
}
