use std::time::Duration;

use crate::error::{Error, Result};

/// Smallest permitted tree fanout.
pub const FANOUT_MIN: u16 = 2;
/// Largest permitted tree fanout.
pub const FANOUT_MAX: u16 = 64;
/// Largest permitted tree prefix length in bytes.
pub const PFX_LEN_MAX: u16 = 32;
/// Largest permitted key length in bytes.
pub const KEY_LEN_MAX: usize = 1344;

/// Media class a block lands on. Which class a node writes to is decided by
/// the tree's media-class policy and feeds the compacted-size estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Capacity,
    Staging,
    Pmem,
}

/// Node position used by the media-class policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAge {
    Root,
    Internal,
    Leaf,
}

/// Data type used by the media-class policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Key,
    Value,
}

/// Media-class policy: a (node age, data type) table.
#[derive(Debug, Clone)]
pub struct MclassPolicy {
    table: [[MediaClass; 2]; 3],
}

impl Default for MclassPolicy {
    fn default() -> Self {
        Self {
            table: [[MediaClass::Capacity; 2]; 3],
        }
    }
}

impl MclassPolicy {
    pub fn get(&self, age: NodeAge, dtype: DataType) -> MediaClass {
        let a = match age {
            NodeAge::Root => 0,
            NodeAge::Internal => 1,
            NodeAge::Leaf => 2,
        };
        let d = match dtype {
            DataType::Key => 0,
            DataType::Value => 1,
        };
        self.table[a][d]
    }

    pub fn set(&mut self, age: NodeAge, dtype: DataType, mclass: MediaClass) -> &mut Self {
        let a = match age {
            NodeAge::Root => 0,
            NodeAge::Internal => 1,
            NodeAge::Leaf => 2,
        };
        let d = match dtype {
            DataType::Key => 0,
            DataType::Value => 1,
        };
        self.table[a][d] = mclass;
        self
    }
}

/// Estimator mapping a write length to the on-media allocated length it would
/// compact down to on the given media class. Injected so tests and embedders
/// can substitute allocator-aware models.
pub type AlenEstimator = fn(wlen: u64, mclass: MediaClass) -> u64;

/// Default estimator: round the write length up to whole 4 KiB blocks.
pub fn default_estimate_alen(wlen: u64, _mclass: MediaClass) -> u64 {
    const BLOCK: u64 = 4096;
    wlen.div_ceil(BLOCK) * BLOCK
}

/// Create-time tree parameters. Immutable for the life of the tree.
#[derive(Debug, Clone)]
pub struct TreeParams {
    /// Number of leaf nodes the root spills across.
    pub fanout: u16,

    /// Routing prefix length in bytes; 0 routes by full key.
    pub pfx_len: u16,

    /// Key suffix length excluded from routing; 0 routes by the whole key.
    pub sfx_len: u16,

    /// Capped trees are append-mostly with time-bounded retention; expired
    /// root kvsets are trimmed instead of compacted.
    pub capped: bool,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            fanout: 4,
            pfx_len: 0,
            sfx_len: 0,
            capped: false,
        }
    }
}

impl TreeParams {
    pub fn new(fanout: u16) -> Self {
        Self {
            fanout,
            ..Default::default()
        }
    }

    pub fn pfx_len(mut self, len: u16) -> Self {
        self.pfx_len = len;
        self
    }

    pub fn sfx_len(mut self, len: u16) -> Self {
        self.sfx_len = len;
        self
    }

    pub fn capped(mut self, capped: bool) -> Self {
        self.capped = capped;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fanout < FANOUT_MIN || self.fanout > FANOUT_MAX {
            return Err(Error::Invalid(format!(
                "fanout {} out of range [{FANOUT_MIN}, {FANOUT_MAX}]",
                self.fanout
            )));
        }
        if self.pfx_len > PFX_LEN_MAX {
            return Err(Error::Invalid(format!(
                "prefix length {} exceeds {PFX_LEN_MAX}",
                self.pfx_len
            )));
        }
        Ok(())
    }
}

/// Runtime parameters. Shared by the tree and its compaction jobs.
#[derive(Debug, Clone)]
pub struct RuntimeParams {
    /// Node size threshold in MiB; a leaf whose compacted length exceeds this
    /// becomes a split candidate and `pcap` is expressed against it.
    pub node_size_hi: u64,

    /// How long an expired capped kvset may linger before its value pages are
    /// advised out of memory.
    pub capped_evict_ttl: Duration,

    /// Spill seed-boost policy: a spill output landing as the first kvset of
    /// an empty node gets `spill_seed_boost` added to its compaction count
    /// when it has more than `spill_seed_kblks` kblocks or more than
    /// `spill_seed_vblks` vblocks. Defers rewriting of monotonic-load regions.
    pub spill_seed_kblks: u32,
    pub spill_seed_vblks: u32,
    pub spill_seed_boost: u32,

    /// Compacted-size estimator for key media.
    pub kbb_est: AlenEstimator,

    /// Compacted-size estimator for value media.
    pub vbb_est: AlenEstimator,

    /// Media-class policy consulted by the estimators.
    pub mclass_policy: MclassPolicy,

    /// Background task intervals.
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// How often a capped tree is checked for expired tail kvsets.
    pub capped_compact_interval: Duration,

    /// How often the tree shape summary is logged.
    pub shape_report_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            capped_compact_interval: Duration::from_secs(1),
            shape_report_interval: Duration::from_secs(60),
        }
    }
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            node_size_hi: 1024,
            capped_evict_ttl: Duration::from_secs(120),
            spill_seed_kblks: 2,
            spill_seed_vblks: 32,
            spill_seed_boost: 7,
            kbb_est: default_estimate_alen,
            vbb_est: default_estimate_alen,
            mclass_policy: MclassPolicy::default(),
            tasks: TaskConfig::default(),
        }
    }
}

impl RuntimeParams {
    /// Node size threshold in bytes.
    pub fn node_split_size(&self) -> u64 {
        self.node_size_hi << 20
    }

    pub fn node_size_hi(mut self, mib: u64) -> Self {
        self.node_size_hi = mib;
        self
    }

    pub fn capped_evict_ttl(mut self, ttl: Duration) -> Self {
        self.capped_evict_ttl = ttl;
        self
    }

    pub fn spill_seed_boost(mut self, kblks: u32, vblks: u32, boost: u32) -> Self {
        self.spill_seed_kblks = kblks;
        self.spill_seed_vblks = vblks;
        self.spill_seed_boost = boost;
        self
    }
}
