//! Operations and the peer wire messages that carry them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ParseError, Quant, Spec, VersionVector};

/// An operation: a specifier and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// Full specifier (`/#!.`) of a single op, or an object specifier (`/#`) for a bundle.
    pub spec: Spec,
    /// The payload.
    pub value: Value,
}

impl Op {
    /// Creates an op.
    pub fn new(spec: Spec, value: Value) -> Self {
        Self { spec, value }
    }

    /// The oplog key: the `!version.method` part of the specifier.
    pub fn key(&self) -> Spec {
        self.spec.filter(&[Quant::Version, Quant::Method])
    }

    /// The `/type#id` part of the specifier.
    pub fn object(&self) -> Spec {
        self.spec.filter(&[Quant::Type, Quant::Id])
    }

    /// Is this a bundle of several ops for one object?
    pub fn is_bundle(&self) -> bool {
        self.spec.is_object()
    }

    /// Packs oplog entries (`!version.method` key, payload) into a bundle for `object`.
    pub fn bundle<'a>(object: Spec, entries: impl IntoIterator<Item = (&'a Spec, &'a Value)>) -> Self {
        let map: Map<String, Value> = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        Self::new(object, Value::Object(map))
    }

    /// Splits a bundle into single ops, in ascending version order.
    ///
    /// Keys that are not of the `!version.method` shape are returned as
    /// [`Unbundled::skipped`]. Fails when the op is not addressed to an object or its payload
    /// is not a map.
    pub fn unbundle(&self) -> Result<Unbundled, ParseError> {
        let malformed = || ParseError::MalformedBundle {
            spec: self.spec.to_string(),
        };
        if !self.is_bundle() {
            return Err(malformed());
        }
        let Value::Object(map) = &self.value else {
            return Err(malformed());
        };
        let mut entries = Vec::with_capacity(map.len());
        let mut skipped = Vec::new();
        for (text, value) in map {
            match Spec::parse(text).map(|key| key.canonicalize()) {
                Ok(key) if key.pattern() == "!." => entries.push((key, value)),
                _ => skipped.push(text.clone()),
            }
        }
        entries.sort_by(|(a, _), (b, _)| a.version().cmp(&b.version()));
        let ops = entries
            .into_iter()
            .map(|(key, value)| Op::new(self.spec.concat(&key), value.clone()))
            .collect();
        Ok(Unbundled { ops, skipped })
    }
}

/// The contents of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Unbundled {
    /// The ops, in ascending version order.
    pub ops: Vec<Op>,
    /// Keys that do not name a single op, such as `!a!b.set` or `junk`.
    pub skipped: Vec<String>,
}

/// A message exchanged between peers.
///
/// The subscription handshake messages address an object (`/type#id`) or, for the peer
/// handshake itself, a host (`/Host#peer`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// Subscribe to an object, stating what the subscriber already has.
    ///
    /// A trivial `base` requests a full snapshot.
    On {
        /// The object.
        spec: Spec,
        /// The subscriber's version vector.
        base: VersionVector,
    },
    /// Acknowledge a subscription, stating what the acknowledging side has.
    Reon {
        /// The object.
        spec: Spec,
        /// The acknowledging side's version vector, if it has state.
        base: Option<VersionVector>,
    },
    /// Unsubscribe from an object.
    Off {
        /// The object.
        spec: Spec,
    },
    /// Revoke a subscription.
    Reoff {
        /// The object.
        spec: Spec,
    },
    /// An operation or a bundle of them.
    Op(Op),
}

impl Message {
    /// The specifier the message is addressed to.
    pub fn spec(&self) -> &Spec {
        match self {
            Message::On { spec, .. }
            | Message::Reon { spec, .. }
            | Message::Off { spec }
            | Message::Reoff { spec } => spec,
            Message::Op(op) => &op.spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec(s: &str) -> Spec {
        Spec::parse(s).unwrap()
    }

    #[test]
    fn key_and_object() {
        let op = Op::new(spec("/Mouse#Mickey!7AMTc+gritzko.set"), json!({"x": 1}));
        assert_eq!(op.key().to_string(), "!7AMTc+gritzko.set");
        assert_eq!(op.object().to_string(), "/Mouse#Mickey");
        assert!(!op.is_bundle());
        assert!(op.unbundle().is_err());
    }

    #[test]
    fn unbundle_orders_by_version() {
        let bundle = Op::new(
            spec("/Mouse#Mickey"),
            json!({
                "!00010+b.set": {"y": 2},
                "!0000z+a.set": {"x": 1},
                "junk": 3,
                "!00002+a": {"z": 0},
            }),
        );
        assert!(bundle.is_bundle());
        let Unbundled { ops, mut skipped } = bundle.unbundle().unwrap();
        let specs: Vec<_> = ops.iter().map(|op| op.spec.to_string()).collect();
        assert_eq!(
            specs,
            vec!["/Mouse#Mickey!0000z+a.set", "/Mouse#Mickey!00010+b.set"]
        );
        assert_eq!(ops[0].value, json!({"x": 1}));
        skipped.sort();
        assert_eq!(skipped, vec!["!00002+a", "junk"]);
    }

    #[test]
    fn unbundle_reports_multi_version_keys() {
        let bundle = Op::new(
            spec("/Mouse#Mickey"),
            json!({"!00001+a!00002+b.set": {"x": 1}, "!00003+a.set": {"y": 1}}),
        );
        let unbundled = bundle.unbundle().unwrap();
        assert_eq!(unbundled.ops.len(), 1);
        assert_eq!(unbundled.skipped, vec!["!00001+a!00002+b.set"]);
    }

    #[test]
    fn unbundle_rejects_non_map() {
        let bundle = Op::new(spec("/Mouse#Mickey"), json!([1, 2]));
        assert!(matches!(
            bundle.unbundle(),
            Err(ParseError::MalformedBundle { .. })
        ));
    }

    #[test]
    fn bundle_then_unbundle() {
        let key = spec("!00001+a.set");
        let value = json!({"x": 1});
        let bundle = Op::bundle(spec("/Mouse#Mickey"), [(&key, &value)]);
        assert_eq!(bundle.value, json!({"!00001+a.set": {"x": 1}}));
        assert_eq!(bundle.unbundle().unwrap().ops[0].key(), key);
    }

    #[test]
    fn message_wire_form() {
        let msg = Message::On {
            spec: spec("/Mouse#Mickey"),
            base: VersionVector::parse("!00005+a").unwrap(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"kind": "on", "spec": "/Mouse#Mickey", "base": "!00005+a"})
        );
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.spec().to_string(), "/Mouse#Mickey");

        let op = Message::Op(Op::new(spec("/Mouse#Mickey!00001+a.set"), json!({"x": 1})));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "op");
        assert_eq!(json["spec"], "/Mouse#Mickey!00001+a.set");
    }
}
