//! Consistent-hash uplink selection.
//!
//! Every key (a host id or an object specifier) is hashed to a few points on the `u32`
//! ring. The distance between two keys is the smallest gap between any of their points.
//! A host subscribes to an object through the peer closest to the object, provided that
//! peer is closer than the host itself. Every host runs the same computation, so the
//! subscription tree converges without coordination as peers come and go.

use swarm_protocol::Spec;
use xxhash_rust::xxh32::xxh32;

use crate::PeerId;

/// A deterministic, non-cryptographic hash function.
///
/// Must give the same result on every host of a swarm.
pub trait PointHasher {
    /// Hashes `key` with `seed`.
    fn hash(&self, key: &[u8], seed: u32) -> u32;
}

/// [`PointHasher`] backed by xxHash32.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh32;

impl PointHasher for Xxh32 {
    fn hash(&self, key: &[u8], seed: u32) -> u32 {
        xxh32(key, seed)
    }
}

/// Ranks peers by their proximity to a key.
#[derive(Debug, Clone)]
pub struct Router<H = Xxh32> {
    hasher: H,
    points: usize,
}

impl Router<Xxh32> {
    /// Creates a router hashing every key to `points` points.
    pub fn new(points: usize) -> Self {
        Self::with_hasher(Xxh32, points)
    }
}

impl<H: PointHasher> Router<H> {
    /// Creates a router with a custom hash function.
    pub fn with_hasher(hasher: H, points: usize) -> Self {
        Self {
            hasher,
            points: points.max(1),
        }
    }

    /// The points of `key`, one per seed.
    pub fn hash_points(&self, key: &str) -> Vec<u32> {
        (0..self.points as u32)
            .map(|seed| self.hasher.hash(key.as_bytes(), seed))
            .collect()
    }

    /// Smallest gap between any point of `a` and any point of `b`.
    pub fn distance(a: &[u32], b: &[u32]) -> u32 {
        a.iter()
            .flat_map(|x| b.iter().map(move |y| x.abs_diff(*y)))
            .min()
            .unwrap_or(u32::MAX)
    }

    /// Distance between two keys.
    pub fn key_distance(&self, a: &str, b: &str) -> u32 {
        Self::distance(&self.hash_points(a), &self.hash_points(b))
    }

    /// Peers closer to `target` than `me`, closest first.
    ///
    /// The test is strict on `(distance, id)`: a peer at exactly `me`'s distance qualifies
    /// only when its id sorts before `me`. A plain `distance <= threshold` test would let two
    /// equidistant hosts take each other as uplink. Equal distances among the peers are
    /// ordered by id too, so the result does not depend on the order of `peers`.
    pub fn available_uplinks<'a>(
        &self,
        target: &Spec,
        me: &PeerId,
        peers: impl IntoIterator<Item = &'a PeerId>,
    ) -> Vec<PeerId> {
        let target = self.hash_points(&target.to_string());
        let threshold = Self::distance(&self.hash_points(&me.to_string()), &target);
        let mut ranked: Vec<(u32, &PeerId)> = peers
            .into_iter()
            .filter(|peer| *peer != me)
            .map(|peer| (Self::distance(&self.hash_points(&peer.to_string()), &target), peer))
            .filter(|(distance, peer)| (*distance, *peer) < (threshold, me))
            .collect();
        ranked.sort();
        ranked.dedup();
        ranked.into_iter().map(|(_, peer)| peer.clone()).collect()
    }
}
