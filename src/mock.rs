//! In-memory stand-ins for the consumed interfaces.
//!
//! Every external collaborator (journal, block allocator, ingest observer)
//! has a recording fake here with fault injection, so the tree and the
//! compaction pipeline can be exercised end to end without any embedding
//! database. Tests throughout the crate build on these.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blocks::{BlockAllocator, BlockId};
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalRecord, JournalTxn, KvsetRecordMeta};
use crate::kvset::{EntryValue, Kvset, KvsetBuilder, KvsetRef};
use crate::scheduler::IngestObserver;

/// Block allocator that tracks every alloc, commit and delete.
pub struct MemAllocator {
    next: AtomicU64,
    nallocs: AtomicUsize,
    committed: Mutex<HashSet<BlockId>>,
    deleted: Mutex<HashSet<BlockId>>,
    double_deletes: AtomicUsize,
    fail_alloc: AtomicBool,
    fail_commit: AtomicBool,
}

impl MemAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            nallocs: AtomicUsize::new(0),
            committed: Mutex::new(HashSet::new()),
            deleted: Mutex::new(HashSet::new()),
            double_deletes: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }

    /// Number of blocks allocated so far.
    pub fn allocated(&self) -> usize {
        self.nallocs.load(Ordering::SeqCst)
    }

    /// Number of distinct blocks deleted so far.
    pub fn deleted(&self) -> usize {
        self.deleted.lock().len()
    }

    pub fn is_committed(&self, id: BlockId) -> bool {
        self.committed.lock().contains(&id)
    }

    pub fn is_deleted(&self, id: BlockId) -> bool {
        self.deleted.lock().contains(&id)
    }

    /// Number of delete calls that named an already-deleted block.
    pub fn double_deletes(&self) -> usize {
        self.double_deletes.load(Ordering::SeqCst)
    }

    /// Live block count: allocated minus deleted.
    pub fn live(&self) -> usize {
        self.allocated() - self.deleted()
    }

    pub fn fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Make the next commits report a full media.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator for MemAllocator {
    fn alloc(&self) -> Result<BlockId> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(Error::NoSpace);
        }
        self.nallocs.fetch_add(1, Ordering::SeqCst);
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn commit(&self, blocks: &[BlockId]) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::NoSpace);
        }
        let mut committed = self.committed.lock();
        committed.extend(blocks.iter().copied());
        Ok(())
    }

    fn delete(&self, blocks: &[BlockId]) -> Result<()> {
        let mut deleted = self.deleted.lock();
        for &id in blocks {
            if !deleted.insert(id) {
                self.double_deletes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Journal that appends framed records to an in-memory log.
pub struct MemJournal {
    log: Mutex<Vec<u8>>,
    next_txid: AtomicU64,
    next_cookie: AtomicU64,
    next_nodeid: AtomicU64,
    fail_txstart: AtomicBool,
    fail_add: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemJournal {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            next_txid: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            // Stays clear of the ids a freshly created tree hands its
            // initial leaves.
            next_nodeid: AtomicU64::new(1000),
            fail_txstart: AtomicBool::new(false),
            fail_add: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }

    /// Decode the whole log.
    pub fn records(&self) -> Vec<JournalRecord> {
        let log = self.log.lock().clone();
        let mut cursor = Cursor::new(log);
        let mut records = Vec::new();
        while let Some(record) = JournalRecord::decode_frame(&mut cursor).expect("journal log intact")
        {
            records.push(record);
        }
        records
    }

    /// Records belonging to one transaction, in log order.
    pub fn records_for(&self, txid: u64) -> Vec<JournalRecord> {
        self.records().into_iter().filter(|r| r.txid() == txid).collect()
    }

    /// True if the transaction was abandoned.
    pub fn naked(&self, txid: u64) -> bool {
        self.records_for(txid)
            .iter()
            .any(|r| matches!(r, JournalRecord::Nak { .. }))
    }

    pub fn fail_txstart(&self, fail: bool) {
        self.fail_txstart.store(fail, Ordering::SeqCst);
    }

    pub fn fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    fn append(&self, record: JournalRecord) {
        record.encode_frame(&mut self.log.lock());
    }
}

impl Default for MemJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for MemJournal {
    fn txstart(&self, ingest_id: u64, horizon: u64, n_adds: u16, n_dels: u16)
        -> Result<JournalTxn> {
        if self.fail_txstart.load(Ordering::SeqCst) {
            return Err(Error::Transient("journal txstart failed".to_string()));
        }

        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        self.append(JournalRecord::TxStart {
            txid,
            ingest_id,
            horizon,
            n_adds,
            n_dels,
        });
        Ok(JournalTxn { txid })
    }

    fn record_kvset_add(
        &self,
        txn: JournalTxn,
        cnid: u64,
        nodeid: u64,
        meta: &KvsetRecordMeta,
        kvsetid: u64,
        hblk: BlockId,
        kblks: &[BlockId],
        vblks: &[BlockId],
    ) -> Result<u64> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Error::Transient("journal kvset-add failed".to_string()));
        }

        self.append(JournalRecord::KvsetAdd {
            txid: txn.txid,
            cnid,
            nodeid,
            kvsetid,
            meta: meta.clone(),
            hblk,
            kblks: kblks.to_vec(),
            vblks: vblks.to_vec(),
        });
        Ok(self.next_cookie.fetch_add(1, Ordering::SeqCst))
    }

    fn record_kvset_add_ack(&self, txn: JournalTxn, cookie: u64) -> Result<()> {
        self.append(JournalRecord::KvsetAddAck {
            txid: txn.txid,
            cookie,
        });
        Ok(())
    }

    fn record_kvset_delete(&self, txn: JournalTxn, cnid: u64, nodeid: u64, kvsetid: u64)
        -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Transient("journal kvset-delete failed".to_string()));
        }

        self.append(JournalRecord::KvsetDelete {
            txid: txn.txid,
            cnid,
            nodeid,
            kvsetid,
        });
        Ok(())
    }

    fn nak(&self, txn: JournalTxn) -> Result<()> {
        self.append(JournalRecord::Nak { txid: txn.txid });
        Ok(())
    }

    fn mint_node_id(&self) -> u64 {
        self.next_nodeid.fetch_add(1, Ordering::SeqCst)
    }
}

/// Ingest observer that records every notification.
#[derive(Default)]
pub struct RecordingObserver {
    notifications: Mutex<Vec<(u64, i64, i64)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(u64, i64, i64)> {
        self.notifications.lock().clone()
    }
}

impl IngestObserver for RecordingObserver {
    fn notify_ingest(&self, cnid: u64, d_r_alen: i64, d_r_wlen: i64) {
        self.notifications.lock().push((cnid, d_r_alen, d_r_wlen));
    }
}

/// Build a kvset from `(key, seqno, value)` triples; `None` is a tombstone.
/// Triples may arrive in any order.
pub fn kvset_of(
    allocator: &Arc<MemAllocator>,
    kvsetid: u64,
    nodeid: u64,
    dgen: u64,
    compc: u32,
    triples: &[(&[u8], u64, Option<&[u8]>)],
) -> KvsetRef {
    let alloc: Arc<dyn BlockAllocator> = Arc::clone(allocator) as _;

    let mut sorted: Vec<_> = triples.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0).then(b.1.cmp(&a.1)));

    let mut builder = KvsetBuilder::new(Arc::clone(&alloc));
    for (key, seqno, value) in sorted {
        let value = match value {
            Some(v) => EntryValue::Value(v.to_vec()),
            None => EntryValue::Tombstone,
        };
        builder.add(key, seqno, value).expect("sorted triples");
    }

    let out = builder.finish().expect("build");
    Kvset::open(alloc, kvsetid, nodeid, dgen, compc, out).expect("open")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{INVAL_HORIZON, INVAL_INGESTID};

    #[test]
    fn test_allocator_accounting() -> Result<()> {
        let allocator = MemAllocator::new();
        let a = allocator.alloc()?;
        let b = allocator.alloc()?;
        assert_eq!(allocator.allocated(), 2);

        allocator.commit(&[a])?;
        assert!(allocator.is_committed(a));
        assert!(!allocator.is_committed(b));

        allocator.delete(&[a, b])?;
        assert_eq!(allocator.deleted(), 2);
        assert_eq!(allocator.live(), 0);

        allocator.delete(&[a])?;
        assert_eq!(allocator.double_deletes(), 1);
        Ok(())
    }

    #[test]
    fn test_allocator_fault_injection() {
        let allocator = MemAllocator::new();
        allocator.fail_commit(true);
        assert_eq!(allocator.commit(&[1]), Err(Error::NoSpace));
        allocator.fail_commit(false);
        assert!(allocator.commit(&[1]).is_ok());
    }

    #[test]
    fn test_journal_transaction_shape() -> Result<()> {
        let journal = MemJournal::new();
        let txn = journal.txstart(INVAL_INGESTID, INVAL_HORIZON, 1, 1)?;

        let meta = KvsetRecordMeta {
            dgen: 3,
            compc: 0,
            vused: 64,
        };
        let cookie = journal.record_kvset_add(txn, 1, 0, &meta, 10, 100, &[101], &[102])?;
        journal.record_kvset_delete(txn, 1, 0, 9)?;
        journal.record_kvset_add_ack(txn, cookie)?;

        let records = journal.records_for(txn.txid);
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], JournalRecord::TxStart { n_adds: 1, n_dels: 1, .. }));
        assert!(matches!(records[1], JournalRecord::KvsetAdd { kvsetid: 10, .. }));
        assert!(matches!(records[2], JournalRecord::KvsetDelete { kvsetid: 9, .. }));
        assert!(matches!(records[3], JournalRecord::KvsetAddAck { .. }));
        assert!(!journal.naked(txn.txid));

        journal.nak(txn)?;
        assert!(journal.naked(txn.txid));
        Ok(())
    }
}
