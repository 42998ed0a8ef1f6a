//! Capped-tree trimmer.
//!
//! A capped tree is append-mostly with time-bounded retention: instead of
//! compacting old data down the tree, expired kvsets are trimmed off the
//! tail of the root list once no reader can see them and the remembered
//! prefix tombstone covers their keys. When the journal refuses the delete
//! transaction, the fallback is to advise the oldest kvset's value pages
//! out of memory, which reclaims most of the cost at none of the risk.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::journal::{INVAL_HORIZON, INVAL_INGESTID};
use crate::kvset::{KvsetRef, Ptomb};

use super::samp;
use super::{Tree, TreeState};

/// Capped-tree bookkeeping: the retention high-water mark and the eviction
/// cursor that keeps repeat scans cheap.
#[derive(Default)]
pub(crate) struct CappedState {
    /// Largest prefix tombstone seen by ingest.
    last_ptomb: Option<Ptomb>,
    /// No eviction work before this instant.
    evict_deadline: Option<Instant>,
    /// Kvsets with a dgen below this have already been advised out.
    evict_dgen: u64,
}

impl CappedState {
    pub fn remember_ptomb(&mut self, ptomb: Ptomb) {
        self.last_ptomb = Some(ptomb);
    }

    pub fn ptomb(&self) -> Option<Ptomb> {
        self.last_ptomb.clone()
    }
}

/// Compare a prefix tombstone against a key truncated to the tombstone's
/// length. `Greater`/`Equal` means the tombstone covers keys up to `key`.
fn ptomb_keycmp(ptomb: &[u8], key: &[u8]) -> CmpOrdering {
    let n = ptomb.len().min(key.len());
    match ptomb[..n].cmp(&key[..n]) {
        CmpOrdering::Equal if ptomb.len() > key.len() => CmpOrdering::Greater,
        CmpOrdering::Equal => CmpOrdering::Equal,
        other => other,
    }
}

impl Tree {
    /// Trim expired kvsets from the tail of the root list. One tick of the
    /// capped-compaction task; a no-op on non-capped trees.
    pub fn capped_compact(&self) -> Result<()> {
        if !self.is_capped() {
            return Ok(());
        }

        // Snapshot the list and the retention mark under the read lock; the
        // trimmer is the only thread that retires root-tail kvsets, so the
        // snapshot stays valid for the walk below.
        let (snapshot, ptomb) = {
            let state = self.state.read();
            let kvsets: Vec<KvsetRef> = state.nodes[0].kvsets.read().iter().cloned().collect();
            (kvsets, self.capped.lock().ptomb())
        };

        if snapshot.len() < 2 {
            return Ok(());
        }

        let mut horizon = self.seqno_horizon();
        if let Some(pt) = &ptomb {
            horizon = horizon.min(pt.seqno);
        }

        // Identify the expired run: oldest first, never the newest kvset.
        let mut kvset_cnt = 0usize;
        for kvset in snapshot.iter().skip(1).rev() {
            let covered = match &ptomb {
                None => true,
                Some(pt) => ptomb_keycmp(&pt.prefix, kvset.max_key()) != CmpOrdering::Less,
            };

            if kvset.seqno_max() >= horizon || !covered {
                break;
            }
            kvset_cnt += 1;
        }

        if kvset_cnt == 0 {
            self.capped_evict(&snapshot);
            return Ok(());
        }

        let attached = self.attached()?;
        let expired = &snapshot[snapshot.len() - kvset_cnt..];

        let txn = match attached
            .journal
            .txstart(INVAL_INGESTID, INVAL_HORIZON, 0, kvset_cnt as u16)
        {
            Ok(txn) => txn,
            Err(e) => {
                tracing::warn!(error = %e, "capped trim txstart failed, evicting instead");
                self.capped_evict(&snapshot);
                return Ok(());
            }
        };

        for kvset in expired {
            if let Err(e) = attached.journal.record_kvset_delete(
                txn,
                attached.cnid,
                kvset.nodeid(),
                kvset.kvsetid(),
            ) {
                tracing::warn!(error = %e, "capped trim delete record failed, evicting instead");
                attached.journal.nak(txn)?;
                self.capped_evict(&snapshot);
                return Ok(());
            }
        }

        // Splice the expired run off the tail and refresh sampling.
        let retired: Vec<KvsetRef> = {
            let mut state = self.state.write();
            let root = Arc::clone(&state.nodes[0]);

            let retired: Vec<KvsetRef> = {
                let mut kvsets = root.kvsets.write();
                let at = kvsets.len() - kvset_cnt;
                kvsets.split_off(at).into()
            };
            root.bump_cgen();

            let TreeState { nodes, samp, .. } = &mut *state;
            samp::update_compact(self.rp(), samp, &nodes[0]);

            retired
        };

        tracing::info!(
            trimmed = retired.len(),
            horizon,
            "capped tree trimmed expired kvsets"
        );

        for kvset in retired {
            kvset.mark_for_delete(false);
        }

        Ok(())
    }

    /// Eviction fallback: advise at most one expired kvset's value pages
    /// out of memory per scan, remembering where the scan left off.
    fn capped_evict(&self, snapshot: &[KvsetRef]) {
        let now = Instant::now();
        let ttl = self.rp().capped_evict_ttl;
        let mut capped = self.capped.lock();

        if capped.evict_deadline.map(|d| d > now).unwrap_or(false) {
            return;
        }

        // Resume from the remembered position: the oldest kvset not yet
        // advised out.
        let candidate = snapshot
            .iter()
            .rev()
            .find(|k| k.dgen() >= capped.evict_dgen);
        let Some(kvset) = candidate else { return };

        let deadline = kvset.ctime() + ttl;
        if deadline > now {
            capped.evict_deadline = Some(deadline);
            return;
        }

        kvset.advise_evict();

        let newer = snapshot.iter().rev().find(|k| k.dgen() > kvset.dgen());
        if let Some(newer) = newer {
            capped.evict_dgen = newer.dgen();
            capped.evict_deadline = Some(newer.ctime() + ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeParams, TreeParams};
    use crate::health::Health;
    use crate::journal::JournalRecord;
    use crate::mock::{kvset_of, MemAllocator, MemJournal};
    use crate::scheduler::NullObserver;
    use std::time::Duration;

    fn capped_tree(
        evict_ttl: Duration,
    ) -> (Arc<Tree>, Arc<MemAllocator>, Arc<MemJournal>) {
        let allocator = Arc::new(MemAllocator::new());
        let journal = Arc::new(MemJournal::new());

        let tree = Tree::create(
            TreeParams::new(2).capped(true),
            RuntimeParams::default().capped_evict_ttl(evict_ttl),
            Arc::new(Health::new()),
        )
        .unwrap();
        tree.attach(
            Arc::clone(&allocator) as _,
            Arc::clone(&journal) as _,
            1,
            Arc::new(NullObserver) as _,
        )
        .unwrap();

        (Arc::new(tree), allocator, journal)
    }

    fn ingest(tree: &Tree, allocator: &Arc<MemAllocator>, dgen: u64, seqno: u64) {
        let key = format!("cap.{dgen:04}");
        let ks = kvset_of(allocator, dgen, 0, dgen, 0, &[(key.as_bytes(), seqno, Some(b"v"))]);
        tree.ingest_update(ks, None).unwrap();
    }

    #[test]
    fn test_trim_expired_tail() -> Result<()> {
        let (tree, allocator, journal) = capped_tree(Duration::from_secs(120));

        for dgen in 1..=4 {
            ingest(&tree, &allocator, dgen, dgen * 10);
        }
        tree.capped
            .lock()
            .remember_ptomb(Ptomb { prefix: b"cap".to_vec(), seqno: 25 });
        tree.set_seqno_horizon(100);

        // Horizon clamps to the ptomb seqno (25): dgens 1 and 2 (seqnos 10,
        // 20) expire, dgen 3 (seqno 30) stops the walk.
        tree.capped_compact()?;

        assert_eq!(tree.root().dgens(), vec![4, 3]);
        let deletes: Vec<_> = journal
            .records()
            .into_iter()
            .filter(|r| matches!(r, JournalRecord::KvsetDelete { .. }))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(allocator.deleted() > 0, "trimmed kvset blocks deleted");
        Ok(())
    }

    #[test]
    fn test_uncovered_kvsets_survive() -> Result<()> {
        let (tree, allocator, _journal) = capped_tree(Duration::from_secs(120));

        ingest(&tree, &allocator, 1, 10);
        ingest(&tree, &allocator, 2, 20);
        // Ptomb precedes every key in the tree: nothing is covered.
        tree.capped
            .lock()
            .remember_ptomb(Ptomb { prefix: b"aaa".to_vec(), seqno: 100 });
        tree.set_seqno_horizon(100);

        tree.capped_compact()?;
        assert_eq!(tree.root().len(), 2);
        Ok(())
    }

    #[test]
    fn test_newest_kvset_never_trimmed() -> Result<()> {
        let (tree, allocator, _journal) = capped_tree(Duration::from_secs(120));

        ingest(&tree, &allocator, 1, 10);
        tree.set_seqno_horizon(100);
        tree.capped_compact()?;
        assert_eq!(tree.root().len(), 1);
        Ok(())
    }

    #[test]
    fn test_journal_failure_falls_back_to_evict() -> Result<()> {
        let (tree, allocator, journal) = capped_tree(Duration::ZERO);

        ingest(&tree, &allocator, 1, 10);
        ingest(&tree, &allocator, 2, 20);
        tree.set_seqno_horizon(100);
        journal.fail_txstart(true);

        tree.capped_compact()?;

        // Nothing trimmed, but the oldest kvset's pages were advised out.
        assert_eq!(tree.root().len(), 2);
        let oldest = tree.root().kvsets.read().back().cloned().unwrap();
        assert!(oldest.evict_advised());
        Ok(())
    }

    #[test]
    fn test_evict_cursor_advances() -> Result<()> {
        let (tree, allocator, journal) = capped_tree(Duration::ZERO);

        for dgen in 1..=3 {
            ingest(&tree, &allocator, dgen, dgen * 10);
        }
        tree.set_seqno_horizon(100);
        journal.fail_txstart(true);

        tree.capped_compact()?;
        let kvsets: Vec<_> = tree.root().kvsets.read().iter().cloned().collect();
        assert!(kvsets[2].evict_advised());
        assert!(!kvsets[1].evict_advised());
        Ok(())
    }
}
