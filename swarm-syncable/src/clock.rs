//! Host clock

use std::time::{SystemTime, UNIX_EPOCH};

use swarm_protocol::Stamp;
use tracing::{trace, warn};

use crate::{Config, Error};

/// Start of the clock, 2010-01-01T00:00:00Z, in seconds since the Unix epoch.
pub const EPOCH_SECS: i64 = 1_262_304_000;

/// Low bits of a wall-clock counter reserved for events within the same second.
pub const SEQ_BITS: u32 = 12;

/// How a [`Clock`] derives counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Seconds since [`EPOCH_SECS`] in the high bits, a sequence number in the low
    /// [`SEQ_BITS`] bits.
    Wall,
    /// A plain Lamport counter, starting at 1. Deterministic, for tests and simulations.
    Logical,
}

/// Issues strictly increasing stamps on behalf of one host.
///
/// A counter is `max(last + 1, now)`, so several events in the same second still get
/// distinct, increasing stamps. Observed remote stamps raise `last`, which keeps local
/// writes ordered after anything this host has seen.
#[derive(Debug, Clone)]
pub struct Clock {
    actor: Stamp,
    mode: ClockMode,
    width: usize,
    offset_secs: i64,
    max_ahead: u64,
    last: u64,
}

impl Clock {
    /// Creates a clock issuing stamps for `actor`.
    pub fn new(actor: Stamp, mode: ClockMode, config: &Config) -> Self {
        Self {
            actor,
            mode,
            width: config.stamp_width,
            offset_secs: config.clock_offset_secs,
            max_ahead: config.max_clock_skew_secs.saturating_mul(1 << SEQ_BITS),
            last: 0,
        }
    }

    /// The actor stamps are issued for.
    pub fn actor(&self) -> &Stamp {
        &self.actor
    }

    /// The last counter issued or observed.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Issues the next stamp. Fails with [`Error::ClockExhausted`] once the counter is at
    /// its maximum.
    pub fn issue(&mut self) -> Result<Stamp, Error> {
        let next = self.last.checked_add(1).ok_or(Error::ClockExhausted)?;
        let counter = self.now().max(next);
        self.last = counter;
        Ok(Stamp::issued_by(counter, self.width, &self.actor))
    }

    /// Moves the clock past a stamp seen from elsewhere.
    ///
    /// A wall clock ignores stamps more than `max_clock_skew_secs` ahead of its own time.
    pub fn observe(&mut self, stamp: &Stamp) {
        let counter = match stamp.counter() {
            Ok(counter) => counter,
            Err(err) => {
                trace!(%stamp, %err, "clock ignores stamp");
                return;
            }
        };
        if self.mode == ClockMode::Wall && counter > self.now().saturating_add(self.max_ahead) {
            warn!(%stamp, actor = %self.actor, "clock ignores stamp from the future");
            return;
        }
        self.last = self.last.max(counter);
    }

    fn now(&self) -> u64 {
        match self.mode {
            ClockMode::Logical => 0,
            ClockMode::Wall => {
                let unix = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();
                let secs = (unix - EPOCH_SECS + self.offset_secs).max(0) as u64;
                secs << SEQ_BITS
            }
        }
    }
}
