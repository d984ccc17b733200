//! Persistent object store capability.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Kinds of persisted objects. The id space is per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Serialized peer: 8 bytes of big-endian creation tick, then the peer
    /// marshal.
    Peer,
    /// This node's own identity blob.
    Identity,
}

/// External persistent store. Corrupt or missing entries are equivalent:
/// readers treat both as a cache miss.
pub trait Store: Send + Sync {
    fn get(&self, kind: ObjectKind, id: [u64; 2]) -> Option<Vec<u8>>;
    fn put(&self, kind: ObjectKind, id: [u64; 2], data: &[u8]);
}

/// In-memory store for embedders without persistence, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(ObjectKind, [u64; 2]), (Vec<u8>, usize)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times an object has been written.
    pub fn write_count(&self, kind: ObjectKind, id: [u64; 2]) -> usize {
        self.objects
            .lock()
            .get(&(kind, id))
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl Store for MemoryStore {
    fn get(&self, kind: ObjectKind, id: [u64; 2]) -> Option<Vec<u8>> {
        self.objects.lock().get(&(kind, id)).map(|(d, _)| d.clone())
    }

    fn put(&self, kind: ObjectKind, id: [u64; 2], data: &[u8]) {
        let mut objects = self.objects.lock();
        let entry = objects.entry((kind, id)).or_insert_with(|| (Vec::new(), 0));
        entry.0 = data.to_vec();
        entry.1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_counts_writes() {
        let store = MemoryStore::new();
        let id = [42, 0];
        assert!(store.get(ObjectKind::Peer, id).is_none());
        assert_eq!(store.write_count(ObjectKind::Peer, id), 0);

        store.put(ObjectKind::Peer, id, b"blob");
        store.put(ObjectKind::Peer, id, b"blob2");
        assert_eq!(store.get(ObjectKind::Peer, id).unwrap(), b"blob2");
        assert_eq!(store.write_count(ObjectKind::Peer, id), 2);
        // Kinds do not alias.
        assert!(store.get(ObjectKind::Identity, id).is_none());
    }
}
