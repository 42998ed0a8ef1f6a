//! Metadata-journal capability and record wire format.
//!
//! The journal is the durability log for tree structure changes: which
//! kvsets exist, which node each lives in, and which transactions created
//! or retired them. The tree core drives it through the narrow [`Journal`]
//! trait; the embedding database supplies the real implementation and
//! replays it at open.
//!
//! Records are framed the same way whatever the backing store:
//!
//! ```text
//! +-----------+-------------------+-----------+
//! |length:u32 | serialized record | crc32:u32 |
//! +-----------+-------------------+-----------+
//! | 4 bytes   | variable length   | 4 bytes   |
//! +-----------+-------------------+-----------+
//! ```
//!
//! Big-endian encoding, CRC-32 (ISCSI) over the record bytes.

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::blocks::{BlockId, BlockList};
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TXSTART: u8 = 0x01;
const KVSET_ADD: u8 = 0x02;
const KVSET_ADD_ACK: u8 = 0x03;
const KVSET_DELETE: u8 = 0x04;
const NAK: u8 = 0x05;

/// Sentinel for "no ingest id" / "no horizon" on a compaction transaction.
pub const INVAL_INGESTID: u64 = u64::MAX;
pub const INVAL_HORIZON: u64 = u64::MAX;

/// Handle for an open journal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalTxn {
    pub txid: u64,
}

/// Per-kvset metadata carried on an add record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvsetRecordMeta {
    pub dgen: u64,
    pub compc: u32,
    pub vused: u64,
}

/// Metadata-journal capability consumed by the tree core.
pub trait Journal: Send + Sync {
    /// Open a transaction declaring `n_adds` kvset additions and `n_dels`
    /// kvset deletions.
    fn txstart(&self, ingest_id: u64, horizon: u64, n_adds: u16, n_dels: u16)
        -> Result<JournalTxn>;

    /// Log one kvset-add record; returns a cookie to be acked once the
    /// transaction's deletes have been logged.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<u64>;

    fn record_kvset_add_ack(&self, txn: JournalTxn, cookie: u64) -> Result<()>;

    fn record_kvset_delete(&self, txn: JournalTxn, cnid: u64, nodeid: u64, kvsetid: u64)
        -> Result<()>;

    /// Abandon the transaction; records logged under it are void on replay.
    fn nak(&self, txn: JournalTxn) -> Result<()>;

    /// Mint a new node id (node ids are journal-owned so replay agrees).
    fn mint_node_id(&self) -> u64;
}

/// One journal record, as encoded on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    TxStart {
        txid: u64,
        ingest_id: u64,
        horizon: u64,
        n_adds: u16,
        n_dels: u16,
    },
    KvsetAdd {
        txid: u64,
        cnid: u64,
        nodeid: u64,
        kvsetid: u64,
        meta: KvsetRecordMeta,
        hblk: BlockId,
        kblks: BlockList,
        vblks: BlockList,
    },
    KvsetAddAck {
        txid: u64,
        cookie: u64,
    },
    KvsetDelete {
        txid: u64,
        cnid: u64,
        nodeid: u64,
        kvsetid: u64,
    },
    Nak {
        txid: u64,
    },
}

impl JournalRecord {
    pub fn txid(&self) -> u64 {
        match self {
            JournalRecord::TxStart { txid, .. }
            | JournalRecord::KvsetAdd { txid, .. }
            | JournalRecord::KvsetAddAck { txid, .. }
            | JournalRecord::KvsetDelete { txid, .. }
            | JournalRecord::Nak { txid } => *txid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            JournalRecord::TxStart {
                txid,
                ingest_id,
                horizon,
                n_adds,
                n_dels,
            } => {
                buf.write_u8(TXSTART).unwrap();
                buf.write_u64::<BigEndian>(*txid).unwrap();
                buf.write_u64::<BigEndian>(*ingest_id).unwrap();
                buf.write_u64::<BigEndian>(*horizon).unwrap();
                buf.write_u16::<BigEndian>(*n_adds).unwrap();
                buf.write_u16::<BigEndian>(*n_dels).unwrap();
            }

            JournalRecord::KvsetAdd {
                txid,
                cnid,
                nodeid,
                kvsetid,
                meta,
                hblk,
                kblks,
                vblks,
            } => {
                buf.write_u8(KVSET_ADD).unwrap();
                buf.write_u64::<BigEndian>(*txid).unwrap();
                buf.write_u64::<BigEndian>(*cnid).unwrap();
                buf.write_u64::<BigEndian>(*nodeid).unwrap();
                buf.write_u64::<BigEndian>(*kvsetid).unwrap();
                buf.write_u64::<BigEndian>(meta.dgen).unwrap();
                buf.write_u32::<BigEndian>(meta.compc).unwrap();
                buf.write_u64::<BigEndian>(meta.vused).unwrap();
                buf.write_u64::<BigEndian>(*hblk).unwrap();

                buf.write_u32::<BigEndian>(kblks.len() as u32).unwrap();
                for id in kblks {
                    buf.write_u64::<BigEndian>(*id).unwrap();
                }

                buf.write_u32::<BigEndian>(vblks.len() as u32).unwrap();
                for id in vblks {
                    buf.write_u64::<BigEndian>(*id).unwrap();
                }
            }

            JournalRecord::KvsetAddAck { txid, cookie } => {
                buf.write_u8(KVSET_ADD_ACK).unwrap();
                buf.write_u64::<BigEndian>(*txid).unwrap();
                buf.write_u64::<BigEndian>(*cookie).unwrap();
            }

            JournalRecord::KvsetDelete {
                txid,
                cnid,
                nodeid,
                kvsetid,
            } => {
                buf.write_u8(KVSET_DELETE).unwrap();
                buf.write_u64::<BigEndian>(*txid).unwrap();
                buf.write_u64::<BigEndian>(*cnid).unwrap();
                buf.write_u64::<BigEndian>(*nodeid).unwrap();
                buf.write_u64::<BigEndian>(*kvsetid).unwrap();
            }

            JournalRecord::Nak { txid } => {
                buf.write_u8(NAK).unwrap();
                buf.write_u64::<BigEndian>(*txid).unwrap();
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let tag = cursor.read_u8()?;

        match tag {
            TXSTART => Ok(JournalRecord::TxStart {
                txid: cursor.read_u64::<BigEndian>()?,
                ingest_id: cursor.read_u64::<BigEndian>()?,
                horizon: cursor.read_u64::<BigEndian>()?,
                n_adds: cursor.read_u16::<BigEndian>()?,
                n_dels: cursor.read_u16::<BigEndian>()?,
            }),

            KVSET_ADD => {
                let txid = cursor.read_u64::<BigEndian>()?;
                let cnid = cursor.read_u64::<BigEndian>()?;
                let nodeid = cursor.read_u64::<BigEndian>()?;
                let kvsetid = cursor.read_u64::<BigEndian>()?;
                let meta = KvsetRecordMeta {
                    dgen: cursor.read_u64::<BigEndian>()?,
                    compc: cursor.read_u32::<BigEndian>()?,
                    vused: cursor.read_u64::<BigEndian>()?,
                };
                let hblk = cursor.read_u64::<BigEndian>()?;

                let nkblks = cursor.read_u32::<BigEndian>()? as usize;
                let mut kblks = Vec::with_capacity(nkblks);
                for _ in 0..nkblks {
                    kblks.push(cursor.read_u64::<BigEndian>()?);
                }

                let nvblks = cursor.read_u32::<BigEndian>()? as usize;
                let mut vblks = Vec::with_capacity(nvblks);
                for _ in 0..nvblks {
                    vblks.push(cursor.read_u64::<BigEndian>()?);
                }

                Ok(JournalRecord::KvsetAdd {
                    txid,
                    cnid,
                    nodeid,
                    kvsetid,
                    meta,
                    hblk,
                    kblks,
                    vblks,
                })
            }

            KVSET_ADD_ACK => Ok(JournalRecord::KvsetAddAck {
                txid: cursor.read_u64::<BigEndian>()?,
                cookie: cursor.read_u64::<BigEndian>()?,
            }),

            KVSET_DELETE => Ok(JournalRecord::KvsetDelete {
                txid: cursor.read_u64::<BigEndian>()?,
                cnid: cursor.read_u64::<BigEndian>()?,
                nodeid: cursor.read_u64::<BigEndian>()?,
                kvsetid: cursor.read_u64::<BigEndian>()?,
            }),

            NAK => Ok(JournalRecord::Nak {
                txid: cursor.read_u64::<BigEndian>()?,
            }),

            _ => Err(Error::Corrupt(format!("invalid journal record tag: {tag}"))),
        }
    }

    /// Append the framed record (length, payload, checksum) to `log`.
    pub fn encode_frame(&self, log: &mut Vec<u8>) {
        let bytes = self.encode();
        log.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
        log.extend_from_slice(&bytes);
        log.write_u32::<BigEndian>(CRC32.checksum(&bytes)).unwrap();
    }

    /// Decode one framed record from `reader`; `Ok(None)` at end of log.
    pub fn decode_frame(reader: &mut impl Read) -> Result<Option<Self>> {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        let stored = reader.read_u32::<BigEndian>()?;

        if CRC32.checksum(&bytes) != stored {
            return Err(Error::Corrupt("journal record checksum mismatch".to_string()));
        }

        Self::decode(&bytes).map(Some)
    }
}
