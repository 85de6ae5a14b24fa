//! Host configuration

use serde::{Deserialize, Serialize};
use swarm_protocol::{stamp::DEFAULT_WIDTH, vector};

/// Configuration of a [`crate::Host`].
///
/// The expectation is that the configuration is the same for all hosts of a swarm: the
/// router settings in particular must match, or hosts will disagree on uplinks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of entries written when a version vector goes on the wire.
    ///
    /// Actors beyond the newest `vector_cap` are forgotten; a replica that reconnects after
    /// such an actor went silent receives that actor's entries again, which is harmless.
    pub vector_cap: usize,
    /// Version vector entries at or below this time are not written.
    pub vector_floor: String,
    /// Minimum number of base64 digits in a stamp issued by the host clock.
    pub stamp_width: usize,
    /// Number of points each key is hashed to by the router.
    pub hash_points: usize,
    /// Distill the oplog after every logged operation.
    pub compact_on_append: bool,
    /// Correction, in seconds, added to the wall clock.
    pub clock_offset_secs: i64,
    /// How far, in seconds, a remote stamp may be ahead of the wall clock and still move it.
    pub max_clock_skew_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vector_cap: vector::DEFAULT_CAP,
            vector_floor: vector::DEFAULT_FLOOR.to_string(),
            stamp_width: DEFAULT_WIDTH,
            hash_points: 3,
            compact_on_append: true,
            clock_offset_secs: 0,
            max_clock_skew_secs: 3600,
        }
    }
}
