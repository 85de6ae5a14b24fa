//! Specifiers: compound operation and object identifiers.
//!
//! A specifier is a sequence of tokens, each a quant character followed by a
//! [`Stamp`]. The quants, in precedence order, are type (`/`), id (`#`), version (`!`)
//! and method (`.`):
//!
//! ```text
//! /TodoItem#7AM0f+gritzko!7AMTc+gritzko.done
//! ```
//!
//! Specifiers are immutable; every transformation returns a new one.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    stamp::{digit_value, ORIGIN_SEPARATOR},
    ParseError, Stamp,
};

/// The class of a specifier token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quant {
    /// `/`, the object type.
    Type,
    /// `#`, the object id.
    Id,
    /// `!`, the version stamp.
    Version,
    /// `.`, the method name.
    Method,
}

impl Quant {
    /// All quants, in precedence order.
    pub const ALL: [Quant; 4] = [Quant::Type, Quant::Id, Quant::Version, Quant::Method];

    /// The character that introduces a token of this quant.
    pub fn as_char(self) -> char {
        match self {
            Quant::Type => '/',
            Quant::Id => '#',
            Quant::Version => '!',
            Quant::Method => '.',
        }
    }

    /// Parses a quant character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '/' => Some(Quant::Type),
            '#' => Some(Quant::Id),
            '!' => Some(Quant::Version),
            '.' => Some(Quant::Method),
            _ => None,
        }
    }

    /// Position in the precedence order.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A single `quant body` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    quant: Quant,
    stamp: Stamp,
}

impl Token {
    /// Creates a token.
    pub fn new(quant: Quant, stamp: Stamp) -> Self {
        Self { quant, stamp }
    }

    /// The token's class.
    pub fn quant(&self) -> Quant {
        self.quant
    }

    /// The token's body.
    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.quant.as_char(), self.stamp)
    }
}

/// A compound identifier.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Spec {
    tokens: Vec<Token>,
}

impl Spec {
    /// The empty specifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a specifier, accepting tokens in any order.
    ///
    /// Fails on any character that does not belong to a well-formed token.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let bytes = text.as_bytes();
        let malformed = |position| ParseError::MalformedSpec {
            text: text.to_string(),
            position,
        };
        let mut tokens = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let quant = Quant::from_char(char::from(bytes[pos])).ok_or_else(|| malformed(pos))?;
            pos += 1;
            let time_end = scan_digits(bytes, pos);
            if time_end == pos {
                return Err(malformed(pos));
            }
            let time = &text[pos..time_end];
            pos = time_end;
            let mut origin = None;
            if pos < bytes.len() && char::from(bytes[pos]) == ORIGIN_SEPARATOR {
                let origin_end = scan_digits(bytes, pos + 1);
                if origin_end == pos + 1 {
                    return Err(malformed(pos + 1));
                }
                origin = Some(&text[pos + 1..origin_end]);
                pos = origin_end;
            }
            tokens.push(Token::new(quant, Stamp::new(time, origin)?));
        }
        Ok(Self { tokens })
    }

    /// Builds a specifier from tokens, keeping their order.
    pub fn from_tokens(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// The object specifier `/type#id`.
    pub fn object(type_name: &Stamp, id: &Stamp) -> Self {
        Self::from_tokens([
            Token::new(Quant::Type, type_name.clone()),
            Token::new(Quant::Id, id.clone()),
        ])
    }

    /// The tokens, in their current order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Is this the empty specifier?
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns a copy with tokens stably sorted by quant precedence.
    pub fn canonicalize(&self) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.sort_by_key(|t| t.quant);
        Self { tokens }
    }

    /// Are the tokens already in precedence order?
    pub fn is_canonical(&self) -> bool {
        self.tokens.windows(2).all(|w| w[0].quant <= w[1].quant)
    }

    /// Returns a copy keeping only tokens of the given quants.
    pub fn filter(&self, quants: &[Quant]) -> Self {
        Self::from_tokens(
            self.tokens
                .iter()
                .filter(|t| quants.contains(&t.quant))
                .cloned(),
        )
    }

    /// The body of the first token of `quant`.
    pub fn get(&self, quant: Quant) -> Option<&Stamp> {
        self.tokens
            .iter()
            .find(|t| t.quant == quant)
            .map(|t| &t.stamp)
    }

    /// Is there a token of `quant`?
    pub fn has(&self, quant: Quant) -> bool {
        self.tokens.iter().any(|t| t.quant == quant)
    }

    /// The object type.
    pub fn type_name(&self) -> Option<&Stamp> {
        self.get(Quant::Type)
    }

    /// The object id.
    pub fn id(&self) -> Option<&Stamp> {
        self.get(Quant::Id)
    }

    /// The (first) version stamp.
    pub fn version(&self) -> Option<&Stamp> {
        self.get(Quant::Version)
    }

    /// The method name.
    pub fn method(&self) -> Option<&Stamp> {
        self.get(Quant::Method)
    }

    /// All version stamps, in order. More than one means a micro-history.
    pub fn versions(&self) -> impl Iterator<Item = &Stamp> {
        self.tokens
            .iter()
            .filter(|t| t.quant == Quant::Version)
            .map(|t| &t.stamp)
    }

    /// The quant characters only, e.g. `/#!.` for a full operation specifier.
    pub fn pattern(&self) -> String {
        self.tokens.iter().map(|t| t.quant.as_char()).collect()
    }

    /// Does this name a single operation, i.e. is the pattern exactly `/#!.`?
    pub fn is_op(&self) -> bool {
        self.tokens.len() == 4
            && self
                .tokens
                .iter()
                .zip(Quant::ALL)
                .all(|(t, quant)| t.quant == quant)
    }

    /// Does this name an object, i.e. is the pattern exactly `/#`?
    pub fn is_object(&self) -> bool {
        self.tokens.len() == 2
            && self.tokens[0].quant == Quant::Type
            && self.tokens[1].quant == Quant::Id
    }

    /// Returns a copy with `stamp` appended under `quant`.
    pub fn with(&self, quant: Quant, stamp: Stamp) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(Token::new(quant, stamp));
        Self { tokens }
    }

    /// Returns a copy with all tokens of `other` appended.
    pub fn concat(&self, other: &Spec) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.extend(other.tokens.iter().cloned());
        Self { tokens }
    }
}

fn scan_digits(bytes: &[u8], from: usize) -> usize {
    let mut end = from;
    while end < bytes.len() && digit_value(bytes[end]).is_some() {
        end += 1;
    }
    end
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spec({self})")
    }
}

impl FromStr for Spec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Spec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Spec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_full_spec() {
        let spec = Spec::parse("/TodoItem#7AM0f+gritzko.done!7AMTc+gritzko").unwrap();
        assert_eq!(spec.tokens().len(), 4);
        assert_eq!(spec.type_name().unwrap().time(), "TodoItem");
        assert_eq!(spec.id().unwrap().to_string(), "7AM0f+gritzko");
        assert_eq!(spec.version().unwrap().actor(), "gritzko");
        assert_eq!(spec.method().unwrap().to_string(), "done");
        assert_eq!(spec.pattern(), "/#.!");
        assert!(!spec.is_op());

        let canonical = spec.canonicalize();
        assert_eq!(
            canonical.to_string(),
            "/TodoItem#7AM0f+gritzko!7AMTc+gritzko.done"
        );
        assert!(canonical.is_op());
        assert!(canonical.is_canonical());
    }

    #[test]
    fn parse_rejects_malformed() {
        for text in ["TodoItem", "/Todo Item", "/#abc", "/a+", "/a+b+c", "/a!", "//a", "/a*b"] {
            assert!(
                matches!(Spec::parse(text), Err(ParseError::MalformedSpec { .. })),
                "{text} should not parse"
            );
        }
        let err = Spec::parse("/Mouse#Mickey?x").unwrap_err();
        assert_eq!(
            err,
            ParseError::MalformedSpec {
                text: "/Mouse#Mickey?x".to_string(),
                position: 13
            }
        );
    }

    #[test]
    fn empty_spec_is_valid() {
        let spec = Spec::parse("").unwrap();
        assert!(spec.is_empty());
        assert_eq!(spec.to_string(), "");
    }

    #[test]
    fn canonicalize_is_stable() {
        let spec = Spec::parse(".on!b+x/T!a+y#i").unwrap();
        assert_eq!(spec.canonicalize().to_string(), "/T#i!b+x!a+y.on");
        let versions: Vec<_> = spec.versions().map(|s| s.to_string()).collect();
        assert_eq!(versions, vec!["b+x", "a+y"]);
    }

    #[test]
    fn filter_get_has() {
        let spec = Spec::parse("/Mouse#Mickey!7AMTc+gritzko.set").unwrap();
        assert_eq!(
            spec.filter(&[Quant::Type, Quant::Id]).to_string(),
            "/Mouse#Mickey"
        );
        assert_eq!(spec.filter(&[Quant::Version, Quant::Method]).to_string(), "!7AMTc+gritzko.set");
        assert!(spec.has(Quant::Method));
        assert!(!spec.filter(&[Quant::Type]).has(Quant::Id));
        assert!(spec.filter(&[Quant::Type, Quant::Id]).is_object());
        assert_eq!(spec.get(Quant::Id).unwrap().time(), "Mickey");
    }

    #[test]
    fn serde_as_text() {
        let spec = Spec::parse("/Mouse#Mickey").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"/Mouse#Mickey\"");
        let back: Spec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert!(serde_json::from_str::<Spec>("\"/Mouse Mickey\"").is_err());
    }

    fn token() -> impl Strategy<Value = Token> {
        let quant = prop_oneof![
            Just(Quant::Type),
            Just(Quant::Id),
            Just(Quant::Version),
            Just(Quant::Method)
        ];
        let body = "[0-9A-Za-z_~]{1,8}";
        let origin = proptest::option::of("[0-9A-Za-z_~]{1,6}");
        (quant, body, origin).prop_map(|(quant, time, origin)| {
            Token::new(quant, Stamp::new(time, origin.as_deref()).unwrap())
        })
    }

    fn spec() -> impl Strategy<Value = Spec> {
        prop::collection::vec(token(), 0..8).prop_map(Spec::from_tokens)
    }

    proptest! {
        #[test]
        fn canonicalize_idempotent(spec in spec()) {
            let once = spec.canonicalize();
            prop_assert_eq!(once.canonicalize(), once);
        }

        #[test]
        fn text_round_trip(spec in spec()) {
            let canonical = spec.canonicalize();
            prop_assert_eq!(Spec::parse(&canonical.to_string()).unwrap(), canonical);
        }
    }
}
