//! Built-in object types: [`Model`](model_type), a map of fields merged last-writer-wins,
//! and [`Set`](set_type), a keyed collection of object references.

use std::collections::HashSet;

use serde_json::{Map, Value};
use swarm_protocol::{Op, Spec};
use tracing::{trace, warn};

use crate::{
    subscriber::SubscriberId,
    syncable::{
        ObjectKey, OpDescriptor, OpKey, Oplog, Syncable, SyncableType, SyncableTypeBuilder, TypeError, Watermark, ERR,
        INIT,
    },
    Error,
};

/// Method of the field assignment operation.
pub const SET: &str = "set";
/// Name of the plain field-map type.
pub const MODEL: &str = "Model";
/// Name of the collection type.
pub const SET_TYPE: &str = "Set";

const OPLOG_FIELD: &str = "_oplog";
const VERSION_FIELD: &str = "_version";

fn is_reserved(field: &str) -> bool {
    field.starts_with('_')
}

fn invalid(op: &Op, reason: impl Into<String>) -> Error {
    Error::InvalidState {
        spec: op.spec.to_string(),
        reason: reason.into(),
    }
}

/// Applies state to an object.
///
/// A payload without `_oplog` is the initial state of a freshly created object and becomes
/// its fields. Otherwise it is a snapshot: a stateless object adopts it whole, an object with
/// state of its own replays the snapshot's log entries and fills in fields it lacks.
fn init(object: &mut Syncable, ty: &SyncableType, op: &Op, followups: &mut Vec<Op>) -> Result<(), Error> {
    let state = match &op.value {
        Value::Object(state) => state.clone(),
        Value::Null => Map::new(),
        _ => return Err(invalid(op, "init payload is not a map")),
    };
    if !state.contains_key(OPLOG_FIELD) {
        for (name, value) in state {
            if !is_reserved(&name) && !value.is_null() {
                object.fields_mut().insert(name, value);
            }
        }
        return Ok(());
    }

    let mut state = state;
    ty.unpack_state(&mut state);
    let Some(Value::Object(entries)) = state.remove(OPLOG_FIELD) else {
        return Err(invalid(op, "_oplog is not a map"));
    };
    let watermark = match state.remove(VERSION_FIELD) {
        Some(Value::String(text)) => Watermark::parse(&text)?,
        None => Watermark::default(),
        Some(_) => return Err(invalid(op, "_version is not a string")),
    };
    let mut log = Oplog::new();
    for (key, value) in entries {
        match key.parse::<OpKey>() {
            Ok(key) => {
                log.insert(key, value);
            }
            Err(err) => warn!(object = %object.key(), %key, %err, "snapshot entry skipped"),
        }
    }

    if object.is_stateless() {
        trace!(object = %object.key(), entries = log.len(), "adopt snapshot");
        *object.oplog_mut() = log;
        *object.watermark_mut() = watermark;
        for (name, value) in state {
            if !is_reserved(&name) {
                object.fields_mut().insert(name, value);
            }
        }
        return Ok(());
    }

    trace!(object = %object.key(), entries = log.len(), "merge snapshot into local state");
    let spec = object.key().spec();
    followups.extend(
        log.into_iter()
            .map(|(key, value)| Op::new(spec.concat(&key.spec()), value)),
    );
    // a field some local set assigned, or deleted, is settled by the log
    for (name, value) in state {
        if is_reserved(&name) || object.fields().contains_key(&name) || logged(object, &name) {
            continue;
        }
        object.fields_mut().insert(name, value);
    }
    Ok(())
}

fn logged(object: &Syncable, field: &str) -> bool {
    object.oplog().iter().any(|(key, entry)| {
        key.method.time() == SET && entry.as_object().is_some_and(|fields| fields.contains_key(field))
    })
}

/// Assigns fields, last writer wins: a field is left alone when a newer logged `set`
/// already assigned it. `null` deletes the field.
fn set(object: &mut Syncable, _ty: &SyncableType, op: &Op, _: &mut Vec<Op>) -> Result<(), Error> {
    let Value::Object(changes) = &op.value else {
        return Err(invalid(op, "set payload is not a map"));
    };
    let Some(version) = op.spec.version() else {
        return Err(invalid(op, "no version"));
    };
    for (name, value) in changes {
        if is_reserved(name) {
            continue;
        }
        let overridden = object.oplog().iter().rev().any(|(key, entry)| {
            key.version > *version
                && key.method.time() == SET
                && entry.as_object().is_some_and(|fields| fields.contains_key(name))
        });
        if overridden {
            trace!(object = %object.key(), field = %name, op = %op.spec, "overridden by a newer set");
            continue;
        }
        if value.is_null() {
            object.fields_mut().remove(name);
        } else {
            object.fields_mut().insert(name.clone(), value.clone());
        }
    }
    Ok(())
}

fn err(object: &mut Syncable, _ty: &SyncableType, op: &Op, _: &mut Vec<Op>) -> Result<(), Error> {
    warn!(object = %object.key(), op = %op.spec, error = %op.value, "error reported");
    Ok(())
}

/// Distills a log of `set` operations.
///
/// Walks the log from newest to oldest and strips every field a newer entry assigns.
/// Entries left empty are dropped, except an actor's newest entry, which keeps the
/// object's version vector intact.
pub fn distill(oplog: &mut Oplog) {
    let mut assigned: HashSet<String> = HashSet::new();
    let mut actors: HashSet<String> = HashSet::new();
    let mut emptied = Vec::new();
    for (key, value) in oplog.iter_mut().rev() {
        let newest_of_actor = actors.insert(key.version.actor().to_string());
        if key.method.time() != SET {
            continue;
        }
        let Value::Object(fields) = value else {
            continue;
        };
        let names: Vec<String> = fields.keys().cloned().collect();
        fields.retain(|name, _| !assigned.contains(name));
        assigned.extend(names);
        if fields.is_empty() && !newest_of_actor {
            emptied.push(key.clone());
        }
    }
    for key in emptied {
        oplog.remove(&key);
    }
}

/// Starts a field-map type: `init`, `set` and `err`, with log distillation.
///
/// Used for [`MODEL`] and as the base of application types.
pub fn model(name: impl Into<String>) -> SyncableTypeBuilder {
    SyncableType::builder(name)
        .op(OpDescriptor::new(INIT, true, false, init))
        .op(OpDescriptor::new(SET, true, true, set))
        .op(OpDescriptor::new(ERR, true, false, err))
        .compact(distill)
}

/// The plain field-map type.
pub fn model_type() -> Result<SyncableType, TypeError> {
    model(MODEL).build()
}

/// Accepts only `set` payloads whose values are object specifiers (or `null`).
fn references_only(_object: &Syncable, op: &Op, _source: Option<&SubscriberId>) -> bool {
    if op.spec.method().map(|m| m.time()) != Some(SET) {
        return true;
    }
    op.value.as_object().is_some_and(|fields| {
        fields.values().all(|value| match value {
            Value::Null => true,
            Value::String(text) => Spec::parse(text).is_ok_and(|spec| spec.is_object()),
            _ => false,
        })
    })
}

/// A collection: a model whose fields map keys to object specifiers.
pub fn set_type() -> Result<SyncableType, TypeError> {
    model(SET_TYPE).validate(references_only).build()
}

/// The object a [`SET_TYPE`] entry references, `None` for a missing or deleted entry.
///
/// Fails when the entry is not a `/type#id` specifier.
pub fn reference(object: &Syncable, key: &str) -> Result<Option<ObjectKey>, Error> {
    let Some(value) = object.field(key) else {
        return Ok(None);
    };
    let text = value.as_str().ok_or_else(|| Error::InvalidState {
        spec: object.key().to_string(),
        reason: format!("entry {key} is not a specifier"),
    })?;
    let spec = Spec::parse(text)?;
    if !spec.is_object() {
        return Err(Error::MalformedSpec {
            spec: spec.to_string(),
            reason: "incomplete object specifier",
        });
    }
    ObjectKey::from_spec(&spec).map(Some)
}

/// The objects a [`SET_TYPE`] object references, ordered by key.
pub fn collection(object: &Syncable) -> Vec<Spec> {
    let mut entries: Vec<(&String, &Value)> = object.fields().iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    entries
        .into_iter()
        .filter_map(|(_, value)| value.as_str())
        .filter_map(|text| Spec::parse(text).ok())
        .filter(Spec::is_object)
        .collect()
}
