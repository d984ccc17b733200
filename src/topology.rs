//! Registry of peers, paths and roots.
//!
//! Holds the address-to-peer and (socket, remote)-to-path maps under
//! reader-dominant locks, the ranked root list, and a separately published
//! best-root snapshot for lock-free reads on the hot send path. Periodic
//! garbage collection runs in two short phases so neither map stays
//! write-locked for long.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::PeerLimitsConfig;
use crate::context::{CallContext, Context};
use crate::endpoint::TransportAddr;
use crate::identity::{Address, Identity};
use crate::path::{Path, PathKey};
use crate::peer::Peer;
use crate::protocol::{PATH_KEEPALIVE_PERIOD, PEER_CACHE_TIMEOUT};
use crate::store::ObjectKind;

/// Registry of everything this node knows about the overlay.
pub struct Topology {
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    paths: RwLock<HashMap<PathKey, Arc<Path>>>,
    roots: Mutex<Vec<Arc<Peer>>>,
    best_root: Mutex<Option<Arc<Peer>>>,
    peer_limits: PeerLimitsConfig,
}

impl Topology {
    pub fn new(peer_limits: PeerLimitsConfig) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            roots: Mutex::new(Vec::new()),
            best_root: Mutex::new(None),
            peer_limits,
        }
    }

    /// Look up a peer by address. With `create_if_cached`, a miss falls back
    /// to the persistent peer cache; a corrupt or expired blob is a miss.
    pub fn peer(
        &self,
        ctx: &Context,
        cc: &CallContext,
        address: Address,
        create_if_cached: bool,
    ) -> Option<Arc<Peer>> {
        if let Some(p) = self.peers.read().get(&address) {
            return Some(p.clone());
        }
        if !create_if_cached {
            return None;
        }
        let cached = self.load_cached(ctx, cc, address)?;
        let mut peers = self.peers.write();
        // Someone may have inserted while we read the store.
        Some(peers.entry(address).or_insert(cached).clone())
    }

    /// Insert a peer, or return the existing one if the address is taken.
    /// The peer cache is consulted before the offered instance wins.
    pub fn add(&self, ctx: &Context, cc: &CallContext, peer: Arc<Peer>) -> Arc<Peer> {
        let address = peer.address();
        {
            let peers = self.peers.read();
            if let Some(existing) = peers.get(&address) {
                return existing.clone();
            }
        }
        let cached = self.load_cached(ctx, cc, address);
        let mut peers = self.peers.write();
        peers
            .entry(address)
            .or_insert_with(|| cached.unwrap_or(peer))
            .clone()
    }

    /// Get or atomically create the path for (local socket, remote).
    pub fn path(&self, local_socket: i64, remote: TransportAddr) -> Arc<Path> {
        let key = PathKey {
            local_socket,
            remote,
        };
        if let Some(p) = self.paths.read().get(&key) {
            return p.clone();
        }
        let mut paths = self.paths.write();
        paths
            .entry(key)
            .or_insert_with(|| Arc::new(Path::new(local_socket, remote)))
            .clone()
    }

    /// The cached best root, if any.
    pub fn root(&self) -> Option<Arc<Peer>> {
        self.best_root.lock().clone()
    }

    pub fn is_root(&self, address: Address) -> bool {
        self.roots.lock().iter().any(|r| r.address() == address)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Snapshot of every known peer.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Snapshot of the current root list.
    pub fn roots_snapshot(&self) -> Vec<Arc<Peer>> {
        self.roots.lock().clone()
    }

    pub fn path_count(&self) -> usize {
        self.paths.read().len()
    }

    /// Rebuild the root set from the trust store's current identities,
    /// materialising peers for any we do not know yet.
    pub fn sync_roots(&self, ctx: &Context, cc: &CallContext, root_identities: &[Identity]) {
        let mut new_roots = Vec::with_capacity(root_identities.len());
        for identity in root_identities {
            let existing = self.peer(ctx, cc, identity.address(), true);
            let root = match existing {
                Some(p) if p.identity() == identity => Some(p),
                Some(_) => {
                    debug!(address = %identity.address(), "trust store identity conflicts with known peer");
                    None
                }
                None => Peer::new(&ctx.identity, identity.clone(), self.peer_limits.clone(), cc.ticks)
                    .ok()
                    .map(|p| self.add(ctx, cc, Arc::new(p))),
            };
            if let Some(root) = root {
                new_roots.push(root);
            }
        }
        let mut roots = self.roots.lock();
        *roots = new_roots;
        Self::rank_roots(&mut roots, &self.best_root);
    }

    /// Rank roots: most recently heard-from first, quantised to half the
    /// keepalive period so all responsive roots tie, then by latency with
    /// unknown latency ranked worst. Publishes the new best root.
    fn rank_roots(roots: &mut [Arc<Peer>], best_root: &Mutex<Option<Arc<Peer>>>) {
        roots.sort_by_key(|p| {
            let bucket = p.last_receive() / (PATH_KEEPALIVE_PERIOD / 2);
            let latency = p.latency();
            let latency = if latency < 0 { i64::MAX } else { latency };
            (std::cmp::Reverse(bucket), latency)
        });
        *best_root.lock() = roots.first().cloned();
    }

    /// Garbage collection, two-phase to keep write-lock holds short.
    ///
    /// Phase A collects peers idle past the alive timeout, except roots,
    /// then removes and persists them one at a time. Phase B drops paths
    /// whose only remaining reference is the path map itself.
    pub fn do_periodic_tasks(&self, ctx: &Context, cc: &CallContext) {
        let mut root_ptrs: Vec<usize> = {
            let mut roots = self.roots.lock();
            Self::rank_roots(&mut roots, &self.best_root);
            roots.iter().map(|p| Arc::as_ptr(p) as usize).collect()
        };
        root_ptrs.sort_unstable();

        let to_delete: Vec<Address> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, p)| {
                    cc.ticks - p.last_receive() > self.peer_limits.alive_timeout_ms
                        && root_ptrs
                            .binary_search(&(Arc::as_ptr(p) as usize))
                            .is_err()
                })
                .map(|(a, _)| *a)
                .collect()
        };
        if !to_delete.is_empty() {
            debug!(count = to_delete.len(), "garbage collecting stale peers");
            for address in to_delete {
                let removed = self.peers.write().remove(&address);
                if let Some(peer) = removed {
                    peer.save(ctx, cc);
                }
            }
        }

        let mut orphaned: Vec<Arc<Path>> = Vec::new();
        {
            let mut paths = self.paths.write();
            paths.retain(|_, p| {
                if Arc::strong_count(p) > 1 {
                    true
                } else {
                    orphaned.push(p.clone());
                    false
                }
            });
        }
        if !orphaned.is_empty() {
            debug!(count = orphaned.len(), "garbage collected orphaned paths");
        }
    }

    /// Persist every known peer.
    pub fn save_all(&self, ctx: &Context, cc: &CallContext) {
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.save(ctx, cc);
        }
    }

    fn load_cached(&self, ctx: &Context, cc: &CallContext, address: Address) -> Option<Arc<Peer>> {
        let blob = ctx.store.get(ObjectKind::Peer, [address.to_u64(), 0])?;
        if blob.len() <= 8 {
            return None;
        }
        let mut created_raw = [0u8; 8];
        created_raw.copy_from_slice(&blob[..8]);
        let created = u64::from_be_bytes(created_raw) as i64;
        if cc.ticks.saturating_sub(created) >= PEER_CACHE_TIMEOUT {
            return None;
        }
        let peer = Peer::unmarshal(
            &ctx.identity,
            self.peer_limits.clone(),
            &blob[8..],
            cc.ticks,
        )
        .ok()?;
        if peer.address() != address {
            return None;
        }
        Some(Arc::new(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::test_support::{test_context, test_transport_addr};

    fn cc(ticks: i64) -> CallContext {
        CallContext::new(ticks)
    }

    fn make_peer(ctx: &Context, ticks: i64) -> Arc<Peer> {
        Arc::new(
            Peer::new(
                &ctx.identity,
                Identity::generate(),
                PeerLimitsConfig::default(),
                ticks,
            )
            .unwrap(),
        )
    }

    #[test]
    fn one_peer_per_address_wins_the_insertion_race() {
        let (ctx, _) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let peer = make_peer(&ctx, 0);

        let first = topo.add(&ctx, &cc(0), peer.clone());
        assert!(Arc::ptr_eq(&first, &peer));

        // A second instance with the same identity loses to the winner.
        let rival = Arc::new(
            Peer::new(
                &ctx.identity,
                peer.identity().clone(),
                PeerLimitsConfig::default(),
                0,
            )
            .unwrap(),
        );
        let second = topo.add(&ctx, &cc(0), rival);
        assert!(Arc::ptr_eq(&second, &peer));
        assert_eq!(topo.peer_count(), 1);
    }

    #[test]
    fn concurrent_adds_converge_on_one_winner() {
        let (ctx, _) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let identity = Identity::generate();

        let winners: Vec<Arc<Peer>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let ctx = &ctx;
                    let topo = &topo;
                    let identity = identity.clone();
                    s.spawn(move || {
                        let p = Arc::new(
                            Peer::new(
                                &ctx.identity,
                                identity,
                                PeerLimitsConfig::default(),
                                0,
                            )
                            .unwrap(),
                        );
                        topo.add(ctx, &cc(0), p)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(topo.peer_count(), 1);
        for w in &winners[1..] {
            assert!(Arc::ptr_eq(w, &winners[0]));
        }
    }

    #[test]
    fn one_path_per_socket_remote_pair() {
        let topo = Topology::new(PeerLimitsConfig::default());
        let a = topo.path(1, test_transport_addr(1000));
        let b = topo.path(1, test_transport_addr(1000));
        let c = topo.path(2, test_transport_addr(1000));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(topo.path_count(), 2);
    }

    #[test]
    fn cached_peers_are_reloaded_and_corruption_is_a_miss() {
        let (ctx, store) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let peer = make_peer(&ctx, 100);
        let address = peer.address();
        peer.save(&ctx, &cc(100));

        // Not in the map, but resolvable through the cache.
        assert!(topo.peer(&ctx, &cc(200), address, false).is_none());
        let loaded = topo.peer(&ctx, &cc(200), address, true).unwrap();
        assert_eq!(loaded.identity(), peer.identity());
        assert_eq!(topo.peer_count(), 1);

        // Garble the blob for a different address: treated as a miss.
        let other = make_peer(&ctx, 100);
        other.save(&ctx, &cc(100));
        let id = [other.address().to_u64(), 0];
        let mut blob = store.get(ObjectKind::Peer, id).unwrap();
        for b in blob.iter_mut().skip(12) {
            *b ^= 0xa5;
        }
        store.put(ObjectKind::Peer, id, &blob);
        assert!(topo.peer(&ctx, &cc(200), other.address(), true).is_none());
    }

    #[test]
    fn expired_cache_entries_are_misses() {
        let (ctx, _) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let peer = make_peer(&ctx, 0);
        peer.save(&ctx, &cc(0));
        assert!(topo
            .peer(&ctx, &cc(PEER_CACHE_TIMEOUT + 1), peer.address(), true)
            .is_none());
    }

    #[test]
    fn gc_spares_roots_and_persists_the_rest_once() {
        let (ctx, store) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());

        let root_identity = Identity::generate();
        topo.sync_roots(&ctx, &cc(0), std::slice::from_ref(&root_identity));

        let mut stale = Vec::new();
        for _ in 0..20 {
            let p = make_peer(&ctx, 0);
            topo.add(&ctx, &cc(0), p.clone());
            stale.push(p);
        }
        assert_eq!(topo.peer_count(), 21);

        let late = cc(PeerLimitsConfig::default().alive_timeout_ms + 10);
        topo.do_periodic_tasks(&ctx, &late);
        topo.do_periodic_tasks(&ctx, &late);

        assert_eq!(topo.peer_count(), 1);
        assert!(topo.peer(&ctx, &late, root_identity.address(), false).is_some());
        for p in &stale {
            // Saved exactly once even across repeated GC passes.
            assert_eq!(
                store.write_count(ObjectKind::Peer, [p.address().to_u64(), 0]),
                1
            );
        }
    }

    #[test]
    fn unreferenced_paths_are_swept() {
        let (ctx, _) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let held = topo.path(1, test_transport_addr(1));
        topo.path(1, test_transport_addr(2)); // returned handle dropped at once
        assert_eq!(topo.path_count(), 2);

        topo.do_periodic_tasks(&ctx, &cc(0));
        assert_eq!(topo.path_count(), 1);
        assert!(Arc::ptr_eq(&topo.path(1, test_transport_addr(1)), &held));
    }

    #[test]
    fn best_root_prefers_recently_heard_low_latency() {
        let (ctx, _) = test_context();
        let topo = Topology::new(PeerLimitsConfig::default());
        let ids = [Identity::generate(), Identity::generate()];
        topo.sync_roots(&ctx, &cc(0), &ids);

        let slow = topo.peer(&ctx, &cc(0), ids[0].address(), false).unwrap();
        let fast = topo.peer(&ctx, &cc(0), ids[1].address(), false).unwrap();
        slow.record_latency(500);
        fast.record_latency(20);

        // Same recency bucket: latency breaks the tie.
        topo.sync_roots(&ctx, &cc(0), &ids);
        assert!(Arc::ptr_eq(&topo.root().unwrap(), &fast));
    }
}
