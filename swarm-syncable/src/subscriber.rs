//! Anything that can receive an object's operations.
//!
//! Remote peers, local listeners and transport adapters all plug into the subscription
//! tree through the [`Subscriber`] trait.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use swarm_protocol::{Message, Op, ParseError, Spec, Stamp, VersionVector};

use crate::model::SET;

/// Identifier of a host.
///
/// A single base64 token, e.g. `alice` or `relay1`.
#[derive(
    derive_more::Debug,
    derive_more::Display,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[debug("PeerId({_0})")]
#[serde(transparent)]
pub struct PeerId(Stamp);

impl PeerId {
    /// Validates a host id.
    pub fn new(id: &str) -> Result<Self, ParseError> {
        Stamp::bare(id).map(Self)
    }

    /// The id as a bare stamp.
    pub fn as_stamp(&self) -> &Stamp {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a local listener, issued by [`crate::Host::on`].
#[derive(derive_more::Debug, derive_more::Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[debug("ListenerId({_0})")]
#[display("listener{_0}")]
pub struct ListenerId(pub(crate) u64);

/// A subscriber of an object: a peer host or a local listener.
#[derive(Debug, derive_more::Display, derive_more::From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriberId {
    /// A remote host.
    Peer(PeerId),
    /// A local listener.
    Listener(ListenerId),
}

impl SubscriberId {
    /// The peer id, if this is a peer.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Self::Peer(peer) => Some(peer),
            Self::Listener(_) => None,
        }
    }
}

/// Which operations a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every emitted operation.
    Whole,
    /// Only `set` operations that touch this field.
    Field(String),
}

/// A downstream subscription of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// What is delivered.
    pub scope: Scope,
    /// Unsubscribe after the first delivery.
    pub once: bool,
}

impl Subscription {
    /// Every operation, until unsubscribed.
    pub fn whole() -> Self {
        Self {
            scope: Scope::Whole,
            once: false,
        }
    }

    /// Changes of one field, until unsubscribed.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Field(name.into()),
            once: false,
        }
    }

    /// Makes this subscription end after the first delivery.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Does this subscription receive `op`?
    pub fn matches(&self, op: &Op) -> bool {
        match &self.scope {
            Scope::Whole => true,
            Scope::Field(name) => {
                op.spec.method().is_some_and(|m| m.time() == SET)
                    && op.value.as_object().is_some_and(|fields| fields.contains_key(name))
            }
        }
    }
}

/// Error returned by a [`Subscriber`].
///
/// Never propagated across subscribers: the host logs it and carries on.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SubscriberError {
    message: String,
}

impl SubscriberError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The capability to take part in an object's subscription tree.
///
/// Only [`Subscriber::deliver`] is mandatory. The handshake calls default to no-ops, which
/// suits local listeners; transport adapters forward them to the remote host.
pub trait Subscriber {
    /// Receives an operation, or a bundle of them. `source` is where the host got it from,
    /// `None` for operations issued locally.
    fn deliver(&mut self, op: &Op, source: Option<&SubscriberId>) -> Result<(), SubscriberError>;

    /// Receives a subscription request for `spec`.
    fn on(&mut self, _spec: &Spec, _base: &VersionVector) -> Result<(), SubscriberError> {
        Ok(())
    }

    /// Receives a subscription acknowledgement for `spec`.
    fn reon(&mut self, _spec: &Spec, _base: Option<&VersionVector>) -> Result<(), SubscriberError> {
        Ok(())
    }

    /// Receives an unsubscription for `spec`.
    fn off(&mut self, _spec: &Spec) -> Result<(), SubscriberError> {
        Ok(())
    }

    /// Learns that its subscription to `spec` was revoked.
    fn reoff(&mut self, _spec: &Spec) -> Result<(), SubscriberError> {
        Ok(())
    }
}

/// Adapts a function into a listener that only cares about operations.
#[derive(derive_more::Debug)]
#[debug("FnSubscriber")]
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: FnMut(&Op, Option<&SubscriberId>),
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: FnMut(&Op, Option<&SubscriberId>),
{
    fn deliver(&mut self, op: &Op, source: Option<&SubscriberId>) -> Result<(), SubscriberError> {
        (self.0)(op, source);
        Ok(())
    }
}

/// Transport adapter: turns subscriber calls into [`Message`]s for a remote host.
///
/// The send function hands the message to the transport; an error from it is reported
/// like any other subscriber failure.
#[derive(derive_more::Debug)]
#[debug("MessageSink")]
pub struct MessageSink<F> {
    send: F,
}

impl<F> MessageSink<F>
where
    F: FnMut(Message) -> Result<(), SubscriberError>,
{
    /// Creates a sink that passes messages to `send`.
    pub fn new(send: F) -> Self {
        Self { send }
    }
}

impl<F> Subscriber for MessageSink<F>
where
    F: FnMut(Message) -> Result<(), SubscriberError>,
{
    fn deliver(&mut self, op: &Op, _source: Option<&SubscriberId>) -> Result<(), SubscriberError> {
        (self.send)(Message::Op(op.clone()))
    }

    fn on(&mut self, spec: &Spec, base: &VersionVector) -> Result<(), SubscriberError> {
        (self.send)(Message::On {
            spec: spec.clone(),
            base: base.clone(),
        })
    }

    fn reon(&mut self, spec: &Spec, base: Option<&VersionVector>) -> Result<(), SubscriberError> {
        (self.send)(Message::Reon {
            spec: spec.clone(),
            base: base.cloned(),
        })
    }

    fn off(&mut self, spec: &Spec) -> Result<(), SubscriberError> {
        (self.send)(Message::Off { spec: spec.clone() })
    }

    fn reoff(&mut self, spec: &Spec) -> Result<(), SubscriberError> {
        (self.send)(Message::Reoff { spec: spec.clone() })
    }
}
