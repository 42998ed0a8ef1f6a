//! Key-to-node route map.
//!
//! Every leaf owns one edge key; a key routes to the first leaf whose edge
//! key is greater than or equal to the key's routing span. The last leaf
//! catches everything beyond the final edge, so its stored edge key may lag
//! the keys it actually holds (node split repairs that when it matters).
//!
//! Routing span policy: on a suffixed tree the final `sfx_len` bytes are
//! excluded from routing, and keys shorter than `pfx_len + sfx_len` are
//! rejected. On a prefixed tree, keys longer than `pfx_len` route by their
//! prefix so that all keys sharing a prefix land in the same leaf; shorter
//! keys route whole.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Map from edge key to node id, with a reverse index for per-node edits.
pub struct RouteMap {
    edges: BTreeMap<Vec<u8>, u64>,
    byid: HashMap<u64, Vec<u8>>,
}

impl RouteMap {
    /// Create an empty map sized for `fanout` initial leaves.
    pub fn create(fanout: u16) -> Self {
        Self {
            edges: BTreeMap::new(),
            byid: HashMap::with_capacity(usize::from(fanout)),
        }
    }

    /// Initial edge keys: `fanout` single-byte keys evenly slicing the
    /// first-byte space, the last always `0xff`.
    pub fn initial_edge_keys(fanout: u16) -> Vec<Vec<u8>> {
        (1..=u32::from(fanout))
            .map(|i| vec![(i * 256 / u32::from(fanout) - 1) as u8])
            .collect()
    }

    /// Resolve a routing span to a node id. Spans beyond the last edge key
    /// resolve to the last node.
    pub fn lookup(&self, span: &[u8]) -> Option<u64> {
        self.edges
            .range(span.to_vec()..)
            .next()
            .or_else(|| self.edges.iter().next_back())
            .map(|(_, &nodeid)| nodeid)
    }

    pub fn insert(&mut self, nodeid: u64, edge_key: &[u8]) -> Result<()> {
        if self.edges.contains_key(edge_key) {
            return Err(Error::Bug(format!(
                "duplicate route edge key for node {nodeid}"
            )));
        }
        self.edges.insert(edge_key.to_vec(), nodeid);
        self.byid.insert(nodeid, edge_key.to_vec());
        Ok(())
    }

    pub fn delete(&mut self, nodeid: u64) -> Option<Vec<u8>> {
        let key = self.byid.remove(&nodeid)?;
        self.edges.remove(&key);
        Some(key)
    }

    /// Replace a node's edge key in place.
    pub fn key_modify(&mut self, nodeid: u64, new_key: &[u8]) -> Result<()> {
        let old = self
            .byid
            .get(&nodeid)
            .cloned()
            .ok_or_else(|| Error::Bug(format!("route entry for node {nodeid} missing")))?;

        if self.edges.contains_key(new_key) {
            return Err(Error::Bug(format!(
                "route edge key collision for node {nodeid}"
            )));
        }

        self.edges.remove(&old);
        self.edges.insert(new_key.to_vec(), nodeid);
        self.byid.insert(nodeid, new_key.to_vec());
        Ok(())
    }

    /// True if the node owns the largest edge key.
    pub fn islast(&self, nodeid: u64) -> bool {
        self.edges
            .iter()
            .next_back()
            .map(|(_, &id)| id == nodeid)
            .unwrap_or(false)
    }

    /// Compare a node's edge key against `key`.
    pub fn keycmp(&self, nodeid: u64, key: &[u8]) -> Result<Ordering> {
        self.byid
            .get(&nodeid)
            .map(|edge| edge.as_slice().cmp(key))
            .ok_or_else(|| Error::Bug(format!("route entry for node {nodeid} missing")))
    }

    pub fn edge_key(&self, nodeid: u64) -> Option<&[u8]> {
        self.byid.get(&nodeid).map(|k| k.as_slice())
    }

    /// All (edge key, node id) pairs in edge order.
    pub fn entries_in_order(&self) -> Vec<(Vec<u8>, u64)> {
        self.edges.iter().map(|(k, &id)| (k.clone(), id)).collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// The portion of `key` used for routing.
pub fn routing_span<'a>(key: &'a [u8], pfx_len: u16, sfx_len: u16) -> Result<&'a [u8]> {
    let sfx = usize::from(sfx_len);
    let pfx = usize::from(pfx_len);

    let base = if sfx > 0 {
        if key.len() < pfx + sfx {
            return Err(Error::Invalid(format!(
                "key length {} below routing minimum {}",
                key.len(),
                pfx + sfx
            )));
        }
        &key[..key.len() - sfx]
    } else {
        key
    };

    if pfx > 0 && base.len() > pfx {
        Ok(&base[..pfx])
    } else {
        Ok(base)
    }
}
