//! Order-preserving base64 stamps.
//!
//! Every token body in a [`crate::Spec`] is a [`Stamp`]: a run of base64 digits,
//! optionally followed by `+origin`. The alphabet is sorted by ASCII value, so two
//! encodings of equal width compare the same way as the numbers they encode. Encodings
//! of different width do not, which is why ordering in this crate always goes through
//! [`cmp_numeric`] instead of comparing the raw text.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::ParseError;

/// The base64 alphabet, in ASCII order.
pub const ALPHABET: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";

/// Minimum number of digits used when encoding a counter.
pub const DEFAULT_WIDTH: usize = 5;

/// Origin assumed for stamps that carry no `+origin` part.
pub const DEFAULT_ORIGIN: &str = "swarm";

/// Separator between a stamp's time and its origin.
pub const ORIGIN_SEPARATOR: char = '+';

/// Returns the value of a base64 digit, or `None` if `byte` is not in [`ALPHABET`].
pub fn digit_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'Z' => Some(byte - b'A' + 10),
        b'_' => Some(36),
        b'a'..=b'z' => Some(byte - b'a' + 37),
        b'~' => Some(63),
        _ => None,
    }
}

/// Is `text` a non-empty run of base64 digits?
pub fn is_token(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| digit_value(b).is_some())
}

/// Encodes `counter`, left-padded with `0` to at least `min_width` digits.
///
/// The result grows beyond `min_width` when the counter needs more digits.
pub fn encode(mut counter: u64, min_width: usize) -> String {
    let mut digits = Vec::with_capacity(min_width.max(11));
    while counter > 0 || digits.len() < min_width {
        digits.push(ALPHABET[(counter & 63) as usize]);
        counter >>= 6;
    }
    digits.reverse();
    // the alphabet is ASCII
    String::from_utf8(digits).unwrap_or_default()
}

/// Decodes a run of base64 digits into the counter it represents.
pub fn decode(text: &str) -> Result<u64, ParseError> {
    if text.is_empty() {
        return Err(ParseError::InvalidToken {
            text: text.to_string(),
        });
    }
    let mut counter: u64 = 0;
    for byte in text.bytes() {
        let value = digit_value(byte).ok_or_else(|| ParseError::InvalidToken {
            text: text.to_string(),
        })?;
        if counter.leading_zeros() < 6 {
            return Err(ParseError::Overflow {
                text: text.to_string(),
            });
        }
        counter = (counter << 6) | u64::from(value);
    }
    Ok(counter)
}

/// Compares two runs of base64 digits by the numbers they encode.
///
/// Works for any width: leading zeros are ignored, a longer significant part is larger,
/// and significant parts of equal length compare bytewise thanks to the alphabet order.
pub fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// A token body: `time[+origin]`.
///
/// For version tokens the time is a counter and the origin names the actor that
/// produced it. Type, id and method tokens use the same shape, so the same type
/// carries them all.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Stamp {
    time: String,
    origin: Option<String>,
}

impl Stamp {
    /// Creates a stamp from its parts, validating both.
    pub fn new(time: impl Into<String>, origin: Option<&str>) -> Result<Self, ParseError> {
        let time = time.into();
        if !is_token(&time) {
            return Err(ParseError::InvalidToken { text: time });
        }
        let origin = match origin {
            Some(origin) if !is_token(origin) => {
                return Err(ParseError::InvalidToken {
                    text: origin.to_string(),
                })
            }
            origin => origin.map(str::to_string),
        };
        Ok(Self { time, origin })
    }

    /// Creates a stamp without an origin, e.g. a type or method name.
    pub fn bare(time: impl Into<String>) -> Result<Self, ParseError> {
        Self::new(time, None)
    }

    /// Encodes `counter` as a stamp produced by `origin`.
    pub fn from_counter(counter: u64, width: usize, origin: &str) -> Result<Self, ParseError> {
        Self::new(encode(counter, width), Some(origin))
    }

    /// Encodes `counter` as a stamp produced by `actor`, a bare stamp naming the actor.
    ///
    /// Uses at least one digit even when `width` is zero.
    pub fn issued_by(counter: u64, width: usize, actor: &Stamp) -> Self {
        Self {
            time: encode(counter, width.max(1)),
            origin: Some(actor.time.clone()),
        }
    }

    /// The zero stamp of the default origin.
    pub fn zero() -> Self {
        Self {
            time: "0".to_string(),
            origin: None,
        }
    }

    /// The time part, as written.
    pub fn time(&self) -> &str {
        &self.time
    }

    /// The origin part, if one was written.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The actor that produced this stamp, falling back to [`DEFAULT_ORIGIN`].
    pub fn actor(&self) -> &str {
        self.origin.as_deref().unwrap_or(DEFAULT_ORIGIN)
    }

    /// Decodes the time part.
    pub fn counter(&self) -> Result<u64, ParseError> {
        decode(&self.time)
    }

    /// Does the time part encode zero?
    pub fn is_zero(&self) -> bool {
        self.time.bytes().all(|b| b == b'0')
    }

    /// Compares only the time parts, numerically.
    pub fn cmp_time(&self, other: &Self) -> Ordering {
        cmp_numeric(&self.time, &other.time)
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_time(other)
            .then_with(|| self.actor().cmp(other.actor()))
            // keep Ord consistent with Eq for spellings that denote the same stamp
            .then_with(|| self.time.cmp(&other.time))
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{}{ORIGIN_SEPARATOR}{}", self.time, origin),
            None => write!(f, "{}", self.time),
        }
    }
}

impl fmt::Debug for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stamp({self})")
    }
}

impl FromStr for Stamp {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(ORIGIN_SEPARATOR) {
            Some((time, origin)) => Self::new(time, Some(origin)),
            None => Self::new(s, None),
        }
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
