//! Consistent-hash ring.
//!
//! Maps arbitrary byte keys onto registered backends with minimal disruption
//! when membership changes. Each backend contributes `weight * 100` virtual
//! nodes, so a backend's share of the key space is proportional to its
//! configured weight.

use std::collections::HashMap;
use std::sync::RwLock;

/// Virtual nodes per unit of weight.
const REPLICATION_FACTOR: u32 = 100;

/// Consistent-hash ring over the CRC32 key space.
///
/// Nodes are identified by their `host:port` key, the same string the
/// backend registry uses. Readers and writers may overlap; the state behind
/// the lock is always a sorted snapshot.
pub struct HashRing {
    state: RwLock<RingState>,
}

#[derive(Default)]
struct RingState {
    /// Ring points, sorted ascending. Duplicate points are kept; the owner
    /// map is last-writer-wins for them.
    points: Vec<u32>,
    /// Ring point -> owning node key.
    owners: HashMap<u32, String>,
    /// Node key -> configured weight.
    weights: HashMap<String, u32>,
}

impl HashRing {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RingState::default()),
        }
    }

    /// Add a node with the given weight.
    ///
    /// A node must not be added twice; re-weighting is `remove` then `add`.
    pub fn add(&self, node: &str, weight: u32) {
        let mut state = self.state.write().unwrap();

        state.weights.insert(node.to_string(), weight);
        for i in 0..REPLICATION_FACTOR * weight {
            let point = hash_key(&vnode_key(node, i));
            state.owners.insert(point, node.to_string());
            state.points.push(point);
        }
        state.points.sort_unstable();
    }

    /// Remove a node and all of its virtual nodes. Unknown nodes are a no-op.
    pub fn remove(&self, node: &str) {
        let mut state = self.state.write().unwrap();

        state.weights.remove(node);
        let RingState { points, owners, .. } = &mut *state;
        owners.retain(|_, owner| owner != node);
        points.retain(|point| owners.contains_key(point));
    }

    /// Map a key to the node owning the first ring point at or after its
    /// hash, wrapping around the top of the key space. Returns `None` on an
    /// empty ring.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap();

        if state.points.is_empty() {
            return None;
        }

        let hash = hash_key(key);
        let mut idx = state.points.partition_point(|&point| point < hash);
        if idx == state.points.len() {
            idx = 0;
        }

        state.owners.get(&state.points[idx]).cloned()
    }

    /// Number of distinct nodes currently on the ring.
    pub fn node_count(&self) -> usize {
        self.state.read().unwrap().weights.len()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Key of the i-th virtual node: the node key followed by the UTF-8 encoding
/// of scalar value `i`. Invalid scalars (the surrogate range) map to U+FFFD.
fn vnode_key(node: &str, i: u32) -> String {
    let mut key = String::with_capacity(node.len() + 4);
    key.push_str(node);
    key.push(char::from_u32(i).unwrap_or(char::REPLACEMENT_CHARACTER));
    key
}
