//! Version vectors

use std::{cmp::Ordering, collections::BTreeMap, fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    stamp::{cmp_numeric, ORIGIN_SEPARATOR},
    ParseError, Quant, Spec, Stamp,
};

/// Default number of entries kept by [`VersionVector::to_string_capped`].
pub const DEFAULT_CAP: usize = 10;

/// Default floor below which entries are dropped on serialization.
pub const DEFAULT_FLOOR: &str = "0";

/// Text form of a vector with no entries.
pub const EMPTY: &str = "!0";

/// Version vector of a replica.
///
/// Contains the greatest time seen from each actor. Times are compared numerically, so
/// stamps that outgrew the default width still order correctly.
///
/// The text form (`!time+actor!time+actor...`) is bounded: only the newest entries are
/// written, and actors that have been silent for long are forgotten.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct VersionVector {
    heads: BTreeMap<String, String>,
}

impl VersionVector {
    /// The empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the text form, e.g. `!7AMTc+gritzko!7AM0f+bob`.
    ///
    /// The leading `!` may be omitted. Non-version tokens are ignored.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut vector = Self::new();
        vector.merge_str(text)?;
        Ok(vector)
    }

    /// Raises the entry for the stamp's actor to the stamp's time.
    pub fn insert(&mut self, stamp: &Stamp) {
        self.insert_time(stamp.actor(), stamp.time());
    }

    fn insert_time(&mut self, actor: &str, time: &str) {
        match self.heads.get_mut(actor) {
            Some(current) => {
                if cmp_numeric(time, current) == Ordering::Greater {
                    *current = time.to_string();
                }
            }
            None => {
                self.heads.insert(actor.to_string(), time.to_string());
            }
        }
    }

    /// Merges every version token of `text` into this vector.
    pub fn merge_str(&mut self, text: &str) -> Result<(), ParseError> {
        let spec = match text.bytes().next() {
            Some(b) if crate::stamp::digit_value(b).is_some() => Spec::parse(&format!("!{text}"))?,
            _ => Spec::parse(text)?,
        };
        for token in spec.tokens() {
            if token.quant() == Quant::Version {
                self.insert(token.stamp());
            }
        }
        Ok(())
    }

    /// Is `stamp` at or below this vector's entry for its actor?
    pub fn covers(&self, stamp: &Stamp) -> bool {
        self.heads
            .get(stamp.actor())
            .is_some_and(|time| cmp_numeric(stamp.time(), time) != Ordering::Greater)
    }

    /// The greatest time seen from `actor`.
    pub fn get(&self, actor: &str) -> Option<&str> {
        self.heads.get(actor).map(String::as_str)
    }

    /// Can this vector offer newer stuff to `other`?
    pub fn has_news_for(&self, other: &Self) -> bool {
        self.heads.iter().any(|(actor, time)| match other.heads.get(actor) {
            None => true,
            Some(theirs) => cmp_numeric(time, theirs) == Ordering::Greater,
        })
    }

    /// Merge another vector into this one.
    pub fn merge(&mut self, other: &Self) {
        for (actor, time) in other.iter() {
            self.insert_time(actor, time);
        }
    }

    /// Iterates over `(actor, time)` entries, ordered by actor.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.heads.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    /// Number of actors.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Has nothing been seen?
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Does this vector carry no information, i.e. no entry above zero?
    pub fn is_trivial(&self) -> bool {
        self.heads.values().all(|time| time.bytes().all(|b| b == b'0'))
    }

    /// The entries that survive serialization with `cap` and `floor`, newest first.
    fn retained(&self, cap: usize, floor: &str) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|(a_actor, a_time), (b_actor, b_time)| {
            cmp_numeric(b_time, a_time).then_with(|| b_actor.cmp(a_actor))
        });
        while let Some((_, time)) = entries.last() {
            if entries.len() > cap || cmp_numeric(time, floor) != Ordering::Greater {
                entries.pop();
            } else {
                break;
            }
        }
        entries
    }

    /// Writes at most `cap` newest entries whose time is above `floor`.
    ///
    /// Returns [`EMPTY`] when no entry survives.
    pub fn to_string_capped(&self, cap: usize, floor: &str) -> String {
        let entries = self.retained(cap, floor);
        if entries.is_empty() {
            return EMPTY.to_string();
        }
        entries
            .into_iter()
            .map(|(actor, time)| format!("!{time}{ORIGIN_SEPARATOR}{actor}"))
            .collect()
    }

    /// Returns a copy holding only what [`Self::to_string_capped`] would write.
    pub fn trimmed(&self, cap: usize, floor: &str) -> Self {
        let heads = self
            .retained(cap, floor)
            .into_iter()
            .map(|(actor, time)| (actor.to_string(), time.to_string()))
            .collect();
        Self { heads }
    }
}

impl<'a> Extend<&'a Stamp> for VersionVector {
    fn extend<T: IntoIterator<Item = &'a Stamp>>(&mut self, iter: T) {
        for stamp in iter {
            self.insert(stamp);
        }
    }
}

impl<'a> FromIterator<&'a Stamp> for VersionVector {
    fn from_iter<T: IntoIterator<Item = &'a Stamp>>(iter: T) -> Self {
        let mut vector = Self::new();
        vector.extend(iter);
        vector
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_capped(DEFAULT_CAP, DEFAULT_FLOOR))
    }
}

impl FromStr for VersionVector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}
