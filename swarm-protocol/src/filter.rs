//! Operation filters.
//!
//! A filter is written like a specifier, optionally prefixed with `^`:
//!
//! - `.set` matches every op whose method is `set`,
//! - `/Mouse.on.off` matches `on` and `off` ops on any `Mouse`,
//! - `^.on.off` matches every op that is neither `on` nor `off`.
//!
//! Tokens of the same quant are alternatives; different quants must all match.

use std::{fmt, str::FromStr};

use crate::{ParseError, Quant, Spec, Stamp};

/// Marks a negated filter.
pub const NEGATION: char = '^';

/// A pattern over operation specifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    negative: bool,
    /// Alternatives per quant, indexed by [`Quant::index`]. `None` for the filter that
    /// matches only the end of a stream.
    patterns: Option<[Vec<Stamp>; 4]>,
}

impl Filter {
    /// Parses a filter pattern.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let (negative, rest) = match text.strip_prefix(NEGATION) {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let spec = Spec::parse(rest)?;
        let mut patterns: [Vec<Stamp>; 4] = Default::default();
        for token in spec.tokens() {
            patterns[token.quant().index()].push(token.stamp().clone());
        }
        Ok(Self {
            negative,
            patterns: Some(patterns),
        })
    }

    /// The filter that matches everything.
    pub fn all() -> Self {
        Self {
            negative: false,
            patterns: Some(Default::default()),
        }
    }

    /// The filter that matches only the end of a stream.
    pub fn end() -> Self {
        Self {
            negative: false,
            patterns: None,
        }
    }

    /// Is this the end-of-stream filter?
    pub fn is_end(&self) -> bool {
        self.patterns.is_none()
    }

    /// Is this filter negated?
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Does the filter select `spec`? `None` stands for the end of the stream.
    pub fn covers(&self, spec: Option<&Spec>) -> bool {
        let (patterns, spec) = match (&self.patterns, spec) {
            (Some(patterns), Some(spec)) => (patterns, spec),
            (None, None) => return true,
            _ => return false,
        };
        for quant in Quant::ALL {
            let mine = &patterns[quant.index()];
            if mine.is_empty() {
                continue;
            }
            let theirs = spec.get(quant);
            if !mine.iter().any(|stamp| Some(stamp) == theirs) {
                return self.negative;
            }
        }
        !self.negative
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(patterns) = &self.patterns else {
            return Ok(());
        };
        if self.negative {
            write!(f, "{NEGATION}")?;
        }
        for quant in Quant::ALL {
            for stamp in &patterns[quant.index()] {
                write!(f, "{}{stamp}", quant.as_char())?;
            }
        }
        Ok(())
    }
}

impl FromStr for Filter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
