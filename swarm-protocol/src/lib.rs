//! Vocabulary of the swarm replication protocol.
//!
//! Every operation is addressed by a [`Spec`], a compound identifier such as
//! `/TodoItem#7AM0f+gritzko!7AMTc+gritzko.done` naming the object type, the object id,
//! the version stamp and the method. Replicas describe what they have seen with a
//! [`VersionVector`] and select operations with [`Filter`] patterns.
//!
//! This crate is pure: it parses, prints and compares. The replication engine lives in
//! `swarm-syncable`.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(swarm_docsrs, feature(doc_cfg))]

pub mod filter;
pub mod op;
pub mod spec;
pub mod stamp;
pub mod vector;

pub use filter::Filter;
pub use op::{Message, Op, Unbundled};
pub use spec::{Quant, Spec, Token};
pub use stamp::Stamp;
pub use vector::VersionVector;

/// Error when parsing protocol text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A token body contains characters outside the base64 alphabet, or is empty.
    #[error("invalid token: {text:?}")]
    InvalidToken {
        /// The offending text.
        text: String,
    },
    /// A counter does not fit in 64 bits.
    #[error("stamp overflows 64 bits: {text:?}")]
    Overflow {
        /// The offending text.
        text: String,
    },
    /// A specifier does not match the token grammar.
    #[error("malformed specifier {text:?} at byte {position}")]
    MalformedSpec {
        /// The full input.
        text: String,
        /// Byte offset of the first character that could not be parsed.
        position: usize,
    },
    /// A bundle payload is not a map of `!version.method` keys.
    #[error("malformed bundle for {spec}")]
    MalformedBundle {
        /// The bundle's object specifier.
        spec: String,
    },
}
