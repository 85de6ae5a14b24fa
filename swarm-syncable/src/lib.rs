//! Replicate objects between hosts over a subscription tree.
//!
//! Every object is a [`Syncable`]: materialized state plus an operation log. Local
//! operations are stamped by the [`Host`] clock, applied, logged and emitted to
//! subscribers. Each host links every object to at most one uplink, chosen by the
//! consistent-hash [`Router`](router::Router), so the hosts of a swarm form a tree per
//! object. Joining replicas state what they have with a version vector and receive a diff.
//!
//! The crate does no IO. Peers are reached through the [`Subscriber`] trait;
//! [`MessageSink`] turns subscriber calls into [`swarm_protocol::Message`]s for any
//! transport, and [`Host::receive`] takes the messages coming back.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(swarm_docsrs, feature(doc_cfg))]

pub mod clock;
pub mod config;
pub mod host;
pub mod model;
pub mod router;
pub mod stream;
pub mod subscriber;
pub mod syncable;

pub use config::Config;
pub use host::Host;
pub use subscriber::{
    FnSubscriber, ListenerId, MessageSink, PeerId, Scope, Subscriber, SubscriberError, SubscriberId,
    Subscription,
};
pub use swarm_protocol::ParseError;
pub use syncable::{ObjectKey, Syncable, SyncableType, TypeError};

/// Error of an object or host operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A specifier does not have the expected shape or does not address the object.
    #[error("malformed specifier {spec}: {reason}")]
    MalformedSpec {
        /// The specifier.
        spec: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The object was closed.
    #[error("{0} is disposed")]
    Disposed(ObjectKey),
    /// No type of this name is registered.
    #[error("unknown type {0}")]
    UnknownType(String),
    /// The object is not live on this host.
    #[error("no such object {0}")]
    NotFound(ObjectKey),
    /// A validate or acl hook refused the operation.
    #[error("{spec} rejected by the {hook} hook")]
    Rejected {
        /// The operation.
        spec: String,
        /// The refusing hook.
        hook: &'static str,
    },
    /// A second peer acknowledged an uplink subscription. It replaced the first one.
    #[error("uplink of {key} taken over by {new}, was {current}")]
    UplinkConflict {
        /// The object.
        key: ObjectKey,
        /// The replaced uplink.
        current: PeerId,
        /// The new uplink.
        new: PeerId,
    },
    /// A peer that is not the uplink revoked a subscription.
    #[error("reoff of {key} from {from}, which is not its uplink")]
    UplinkMismatch {
        /// The object.
        key: ObjectKey,
        /// The sender.
        from: PeerId,
    },
    /// Unsubscription of a subscriber that is not subscribed.
    #[error("{subscriber} is not subscribed to {key}")]
    UnknownSubscriber {
        /// The object.
        key: ObjectKey,
        /// The subscriber.
        subscriber: SubscriberId,
    },
    /// A message from a peer that is not connected.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    /// An operation payload does not have the shape its method needs.
    #[error("invalid state in {spec}: {reason}")]
    InvalidState {
        /// The operation.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The host clock cannot issue a greater stamp.
    #[error("clock counter exhausted")]
    ClockExhausted,
    /// Protocol text could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A type definition is invalid.
    #[error(transparent)]
    Type(#[from] TypeError),
}
