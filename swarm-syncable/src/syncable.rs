//! Oplog-synchronized objects, as a state machine without IO.
//!
//! A [`Syncable`] never talks to its subscribers directly. Every method takes an [`IO`]
//! container and pushes [`Effect`]s into it; the [`crate::Host`] dispatches them once the
//! object is done. This keeps each operation's handling run to completion before anything
//! else sees it.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt, mem,
    str::FromStr,
};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use swarm_protocol::{stamp::is_token, Op, ParseError, Quant, Spec, Stamp, VersionVector};
use tracing::{debug, error, trace, warn};

use crate::{
    subscriber::{ListenerId, PeerId, SubscriberId, Subscription},
    Config, Error,
};

/// Method of the operation that brings an object's state.
pub const INIT: &str = "init";
/// Method of the operation that reports a failure back to its origin.
pub const ERR: &str = "err";

/// Key of an oplog entry: the `!version.method` part of an operation's specifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpKey {
    /// The operation's version stamp.
    pub version: Stamp,
    /// The operation's method name.
    pub method: Stamp,
}

impl OpKey {
    /// Extracts the key of a full operation specifier.
    pub fn from_spec(spec: &Spec) -> Option<Self> {
        Some(Self {
            version: spec.version()?.clone(),
            method: spec.method()?.clone(),
        })
    }

    /// The key as a specifier.
    pub fn spec(&self) -> Spec {
        Spec::new()
            .with(Quant::Version, self.version.clone())
            .with(Quant::Method, self.method.clone())
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{}.{}", self.version, self.method)
    }
}

impl FromStr for OpKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = Spec::parse(s)?.canonicalize();
        match (spec.pattern().as_str(), OpKey::from_spec(&spec)) {
            ("!.", Some(key)) => Ok(key),
            _ => Err(ParseError::MalformedSpec {
                text: s.to_string(),
                position: 0,
            }),
        }
    }
}

/// The operation log: payloads by version and method, in version order.
pub type Oplog = BTreeMap<OpKey, Value>;

/// Identity of an object within a host: its type and id.
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("/{type_name}#{id}")]
pub struct ObjectKey {
    type_name: Stamp,
    id: Stamp,
}

impl ObjectKey {
    /// Creates a key.
    pub fn new(type_name: Stamp, id: Stamp) -> Self {
        Self { type_name, id }
    }

    /// Takes the type and id of a specifier.
    pub fn from_spec(spec: &Spec) -> Result<Self, Error> {
        match (spec.type_name(), spec.id()) {
            (Some(type_name), Some(id)) => Ok(Self::new(type_name.clone(), id.clone())),
            _ => Err(Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "no type or id",
            }),
        }
    }

    /// The object type.
    pub fn type_name(&self) -> &Stamp {
        &self.type_name
    }

    /// The object id.
    pub fn id(&self) -> &Stamp {
        &self.id
    }

    /// The object specifier, `/type#id`.
    pub fn spec(&self) -> Spec {
        Spec::object(&self.type_name, &self.id)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_spec(&Spec::parse(s)?)
    }
}

/// The greatest stamp an object has processed.
///
/// A stamp greater than the current maximum replaces the watermark; an older or
/// concurrent one is appended, so concurrent writers remain visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark(Vec<Stamp>);

impl Watermark {
    /// Parses the `!stamp!stamp` text form. The empty string is the empty watermark.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Ok(Self(Spec::parse(text)?.versions().cloned().collect()))
    }

    /// Records a processed stamp.
    pub fn advance(&mut self, stamp: &Stamp) {
        match self.0.first() {
            Some(max) if stamp <= max => {
                if !self.0.contains(stamp) {
                    self.0.push(stamp.clone());
                }
            }
            _ => self.0 = vec![stamp.clone()],
        }
    }

    /// The greatest stamp.
    pub fn max(&self) -> Option<&Stamp> {
        self.0.first()
    }

    /// All recorded stamps, greatest first.
    pub fn stamps(&self) -> &[Stamp] {
        &self.0
    }

    /// Has nothing been processed?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stamp in &self.0 {
            write!(f, "!{stamp}")?;
        }
        Ok(())
    }
}

/// Error in a type definition, detected when the type is built or registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// A type or method name is not a base64 token.
    #[error("invalid name {0:?}")]
    InvalidName(String),
    /// A method is declared twice.
    #[error("operation {0} is declared twice")]
    DuplicateOp(String),
    /// A method is neither receivable nor emittable.
    #[error("operation {0} is neither receivable nor emittable")]
    InertOp(String),
    /// A type of this name is already registered with the host.
    #[error("type {0} is already registered")]
    DuplicateType(String),
}

/// Applies an operation to an object.
///
/// Operations pushed to the last argument are delivered to the object right after this
/// one, through the whole pipeline.
pub type Handler = fn(&mut Syncable, &SyncableType, &Op, &mut Vec<Op>) -> Result<(), Error>;

/// Decides whether an operation from a source may be applied.
pub type Check = fn(&Syncable, &Op, Option<&SubscriberId>) -> bool;

/// Rewrites a state snapshot, before it is sent or after it arrived.
pub type StateHook = fn(&mut Map<String, Value>);

/// Removes redundant entries from an oplog.
pub type CompactHook = fn(&mut Oplog);

/// Type-wide callback, run after an operation was emitted.
pub type Reaction = Box<dyn FnMut(&Syncable, &Op, Option<&SubscriberId>)>;

/// An operation of a type.
#[derive(derive_more::Debug, Clone)]
pub struct OpDescriptor {
    /// The method name.
    pub name: String,
    /// Applied to local state when delivered.
    pub receivable: bool,
    /// Logged and broadcast to subscribers.
    pub emittable: bool,
    /// Applies the operation.
    #[debug(skip)]
    pub handler: Handler,
}

impl OpDescriptor {
    /// Describes an operation.
    pub fn new(name: impl Into<String>, receivable: bool, emittable: bool, handler: Handler) -> Self {
        Self {
            name: name.into(),
            receivable,
            emittable,
            handler,
        }
    }
}

/// Handle to remove a reaction with [`SyncableType::remove_reaction`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReactionHandle {
    type_name: Stamp,
    id: u64,
}

impl ReactionHandle {
    /// The type the reaction is registered with.
    pub fn type_name(&self) -> &Stamp {
        &self.type_name
    }
}

struct ReactionEntry {
    method: String,
    field: Option<String>,
    callback: Reaction,
}

impl ReactionEntry {
    fn matches(&self, op: &Op) -> bool {
        let method = op.spec.method().map(Stamp::time);
        method == Some(self.method.as_str())
            && self.field.as_ref().map_or(true, |field| {
                op.value.as_object().is_some_and(|v| v.contains_key(field))
            })
    }
}

fn default_handler(object: &mut Syncable, _ty: &SyncableType, op: &Op, _: &mut Vec<Op>) -> Result<(), Error> {
    warn!(object = %object.key(), op = %op.spec, "no handler for operation");
    Ok(())
}

/// An object type: its operation table and hooks.
pub struct SyncableType {
    name: Stamp,
    ops: IndexMap<String, OpDescriptor>,
    default_handler: Handler,
    validate: Option<Check>,
    acl: Option<Check>,
    pack: Option<StateHook>,
    unpack: Option<StateHook>,
    compact: Option<CompactHook>,
    reactions: IndexMap<u64, ReactionEntry>,
    next_reaction: u64,
}

impl fmt::Debug for SyncableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncableType")
            .field("name", &self.name)
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .field("reactions", &self.reactions.len())
            .finish_non_exhaustive()
    }
}

impl SyncableType {
    /// Starts the definition of a type.
    pub fn builder(name: impl Into<String>) -> SyncableTypeBuilder {
        SyncableTypeBuilder {
            name: name.into(),
            ops: Vec::new(),
            default_handler,
            validate: None,
            acl: None,
            pack: None,
            unpack: None,
            compact: None,
        }
    }

    /// The type name.
    pub fn name(&self) -> &Stamp {
        &self.name
    }

    /// The descriptor of a method.
    pub fn op(&self, method: &str) -> Option<&OpDescriptor> {
        self.ops.get(method)
    }

    /// All descriptors, in declaration order.
    pub fn ops(&self) -> impl Iterator<Item = &OpDescriptor> {
        self.ops.values()
    }

    /// Registers a reaction to every emitted `method` operation of this type.
    pub fn add_reaction(
        &mut self,
        method: &str,
        callback: impl FnMut(&Syncable, &Op, Option<&SubscriberId>) + 'static,
    ) -> ReactionHandle {
        self.push_reaction(method.to_string(), None, Box::new(callback))
    }

    /// Registers a reaction to `set` operations that change `field`.
    pub fn add_field_reaction(
        &mut self,
        field: &str,
        callback: impl FnMut(&Syncable, &Op, Option<&SubscriberId>) + 'static,
    ) -> ReactionHandle {
        self.push_reaction(
            crate::model::SET.to_string(),
            Some(field.to_string()),
            Box::new(callback),
        )
    }

    fn push_reaction(&mut self, method: String, field: Option<String>, callback: Reaction) -> ReactionHandle {
        let id = self.next_reaction;
        self.next_reaction += 1;
        self.reactions.insert(
            id,
            ReactionEntry {
                method,
                field,
                callback,
            },
        );
        ReactionHandle {
            type_name: self.name.clone(),
            id,
        }
    }

    /// Removes a reaction. Returns whether it was registered.
    pub fn remove_reaction(&mut self, handle: &ReactionHandle) -> bool {
        handle.type_name == self.name && self.reactions.shift_remove(&handle.id).is_some()
    }

    /// Runs the reactions registered for `op`, in registration order.
    pub fn react(&mut self, object: &Syncable, op: &Op, source: Option<&SubscriberId>) {
        for reaction in self.reactions.values_mut() {
            if reaction.matches(op) {
                (reaction.callback)(object, op, source);
            }
        }
    }

    fn check(&self, object: &Syncable, op: &Op, source: Option<&SubscriberId>) -> Result<(), Error> {
        let hooks = [("validate", self.validate), ("acl", self.acl)];
        for (hook, check) in hooks {
            if let Some(check) = check {
                if !check(object, op, source) {
                    return Err(Error::Rejected {
                        spec: op.spec.to_string(),
                        hook,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs the unpack hook on an arriving snapshot.
    pub fn unpack_state(&self, state: &mut Map<String, Value>) {
        if let Some(unpack) = self.unpack {
            unpack(state);
        }
    }
}

/// Builds a [`SyncableType`], validating its operation table.
#[derive(derive_more::Debug)]
pub struct SyncableTypeBuilder {
    name: String,
    ops: Vec<OpDescriptor>,
    #[debug(skip)]
    default_handler: Handler,
    #[debug(skip)]
    validate: Option<Check>,
    #[debug(skip)]
    acl: Option<Check>,
    #[debug(skip)]
    pack: Option<StateHook>,
    #[debug(skip)]
    unpack: Option<StateHook>,
    #[debug(skip)]
    compact: Option<CompactHook>,
}

impl SyncableTypeBuilder {
    /// Declares an operation.
    pub fn op(mut self, op: OpDescriptor) -> Self {
        self.ops.push(op);
        self
    }

    /// Handler for methods the type does not declare. Defaults to logging them.
    pub fn default_handler(mut self, handler: Handler) -> Self {
        self.default_handler = handler;
        self
    }

    /// Shape check run before every operation.
    pub fn validate(mut self, check: Check) -> Self {
        self.validate = Some(check);
        self
    }

    /// Permission check run before every operation.
    pub fn acl(mut self, check: Check) -> Self {
        self.acl = Some(check);
        self
    }

    /// Hook run on snapshots before they are sent.
    pub fn pack(mut self, hook: StateHook) -> Self {
        self.pack = Some(hook);
        self
    }

    /// Hook run on snapshots after they arrived.
    pub fn unpack(mut self, hook: StateHook) -> Self {
        self.unpack = Some(hook);
        self
    }

    /// Oplog distillation run after an operation is logged.
    pub fn compact(mut self, hook: CompactHook) -> Self {
        self.compact = Some(hook);
        self
    }

    /// Validates the definition.
    pub fn build(self) -> Result<SyncableType, TypeError> {
        let name = Stamp::bare(self.name.as_str()).map_err(|_| TypeError::InvalidName(self.name.clone()))?;
        let mut ops = IndexMap::with_capacity(self.ops.len());
        for op in self.ops {
            if !is_token(&op.name) {
                return Err(TypeError::InvalidName(op.name));
            }
            if !op.receivable && !op.emittable {
                return Err(TypeError::InertOp(op.name));
            }
            if ops.contains_key(&op.name) {
                return Err(TypeError::DuplicateOp(op.name));
            }
            ops.insert(op.name.clone(), op);
        }
        Ok(SyncableType {
            name,
            ops,
            default_handler: self.default_handler,
            validate: self.validate,
            acl: self.acl,
            pack: self.pack,
            unpack: self.unpack,
            compact: self.compact,
            reactions: IndexMap::new(),
            next_reaction: 0,
        })
    }
}

/// Something the host has to do on behalf of an object.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Deliver an operation or a bundle.
    Deliver {
        /// Recipient.
        to: SubscriberId,
        /// The operation.
        op: Op,
        /// Where the operation came from; `None` for local operations and diffs.
        source: Option<SubscriberId>,
    },
    /// Ask a peer to become the uplink.
    On {
        /// Recipient.
        to: PeerId,
        /// The object.
        spec: Spec,
        /// What the object already has.
        base: VersionVector,
    },
    /// Acknowledge a subscription.
    Reon {
        /// Recipient.
        to: SubscriberId,
        /// The object.
        spec: Spec,
        /// What the object has.
        base: Option<VersionVector>,
    },
    /// Unsubscribe from an uplink.
    Off {
        /// Recipient.
        to: PeerId,
        /// The object.
        spec: Spec,
    },
    /// Revoke a downstream subscription.
    Reoff {
        /// Recipient.
        to: SubscriberId,
        /// The object.
        spec: Spec,
    },
    /// Run the type's reactions.
    React {
        /// The object.
        key: ObjectKey,
        /// The emitted operation.
        op: Op,
        /// Where the operation came from.
        source: Option<SubscriberId>,
    },
    /// Offer a processed operation to the host's stream.
    Publish(Op),
    /// A local listener is no longer subscribed anywhere.
    Release(ListenerId),
}

/// Sink for the [`Effect`]s an object produces.
///
/// The host keeps a queue; tests can inspect a plain [`VecDeque`].
pub trait IO {
    /// Queues an effect.
    fn push(&mut self, effect: impl Into<Effect>);
}

impl IO for VecDeque<Effect> {
    fn push(&mut self, effect: impl Into<Effect>) {
        self.push_back(effect.into())
    }
}

/// The upstream side of an object's subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Uplink {
    /// Not linked; uplink selection has not run.
    #[default]
    None,
    /// `on` sent, waiting for `reon`.
    Pending(PeerId),
    /// Linked.
    Established(PeerId),
    /// No peer is closer to the object than this host.
    Root,
}

impl Uplink {
    /// The uplink peer, linked or not.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Self::Pending(peer) | Self::Established(peer) => Some(peer),
            Self::None | Self::Root => None,
        }
    }

    /// Can the object answer subscriptions?
    pub fn is_servable(&self) -> bool {
        matches!(self, Self::Established(_) | Self::Root)
    }
}

/// Downstream subscriptions, in subscription order.
///
/// Removal always shifts, so emission order stays the order in which subscribers came.
#[derive(Debug, Clone, Default)]
struct Downlinks {
    inner: IndexMap<SubscriberId, Subscription>,
}

impl Downlinks {
    fn insert(&mut self, id: SubscriberId, subscription: Subscription) {
        self.inner.insert(id, subscription);
    }

    fn remove(&mut self, id: &SubscriberId) -> Option<Subscription> {
        self.inner.shift_remove(id)
    }

    fn contains(&self, id: &SubscriberId) -> bool {
        self.inner.contains_key(id)
    }

    fn iter(&self) -> indexmap::map::Iter<'_, SubscriberId, Subscription> {
        self.inner.iter()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = SubscriberId> + '_ {
        self.inner.drain(..).map(|(id, _)| id)
    }
}

#[derive(Debug, Clone)]
struct Deferred {
    subscriber: SubscriberId,
    subscription: Subscription,
    base: Option<VersionVector>,
}

/// A replicated object.
///
/// Owns its state (a map of fields), its oplog, its [`Watermark`] and its place in the
/// subscription tree: at most one uplink and any number of downstream subscribers.
#[derive(Debug, Clone)]
pub struct Syncable {
    key: ObjectKey,
    disposed: bool,
    fields: Map<String, Value>,
    oplog: Oplog,
    watermark: Watermark,
    uplink: Uplink,
    downlinks: Downlinks,
    deferred: Vec<Deferred>,
    vector_cap: usize,
    vector_floor: String,
    compact_on_append: bool,
}

impl Syncable {
    /// Creates an object without state.
    pub fn new(key: ObjectKey, config: &Config) -> Self {
        Self {
            key,
            disposed: false,
            fields: Map::new(),
            oplog: Oplog::new(),
            watermark: Watermark::default(),
            uplink: Uplink::None,
            downlinks: Downlinks::default(),
            deferred: Vec::new(),
            vector_cap: config.vector_cap,
            vector_floor: config.vector_floor.clone(),
            compact_on_append: config.compact_on_append,
        }
    }

    /// The object's identity.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// The materialized state.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// One field of the materialized state.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The logged operations.
    pub fn oplog(&self) -> &Oplog {
        &self.oplog
    }

    /// The greatest processed stamp.
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// The upstream subscription.
    pub fn uplink(&self) -> &Uplink {
        &self.uplink
    }

    /// Downstream subscribers, in subscription order.
    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberId> {
        self.downlinks.iter().map(|(id, _)| id)
    }

    /// Is `id` a downstream subscriber?
    pub fn is_subscribed(&self, id: &SubscriberId) -> bool {
        self.downlinks.contains(id)
    }

    /// Has the object been closed?
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Has the object neither state nor history?
    pub fn is_stateless(&self) -> bool {
        self.fields.is_empty() && self.oplog.is_empty() && self.watermark.is_empty()
    }

    /// Can the object be closed: is it neither linked upstream nor subscribed to?
    pub fn is_collectable(&self) -> bool {
        !self.disposed && self.uplink.peer().is_none() && self.downlinks.is_empty() && self.deferred.is_empty()
    }

    /// Folds the watermark and the oplog into a version vector.
    pub fn vector(&self) -> VersionVector {
        let mut vector: VersionVector = self.watermark.stamps().iter().collect();
        vector.extend(self.oplog.keys().map(|key| &key.version));
        vector
    }

    /// The version vector as it goes on the wire: bounded.
    pub fn wire_vector(&self) -> VersionVector {
        self.vector().trimmed(self.vector_cap, &self.vector_floor)
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    pub(crate) fn oplog_mut(&mut self) -> &mut Oplog {
        &mut self.oplog
    }

    pub(crate) fn watermark_mut(&mut self) -> &mut Watermark {
        &mut self.watermark
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::Disposed(self.key.clone()));
        }
        Ok(())
    }

    fn check_addressed(&self, spec: &Spec) -> Result<(), Error> {
        if spec.type_name() != Some(&self.key.type_name) || spec.id() != Some(&self.key.id) {
            return Err(Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "not addressed to this object",
            });
        }
        Ok(())
    }

    /// Completes a partial specifier for a local operation.
    ///
    /// Missing type and id are taken from the object, a missing version from `stamp`, a
    /// missing method from `method`. Type and id, when present, must name this object.
    pub fn normalize(
        &self,
        spec: &Spec,
        method: Option<&str>,
        stamp: impl FnOnce() -> Result<Stamp, Error>,
    ) -> Result<Spec, Error> {
        self.ensure_live()?;
        let mismatch = |quant, mine: &Stamp| spec.get(quant).is_some_and(|theirs| theirs != mine);
        if mismatch(Quant::Type, &self.key.type_name) || mismatch(Quant::Id, &self.key.id) {
            return Err(Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "not addressed to this object",
            });
        }
        let mut full = spec.clone();
        if !full.has(Quant::Type) {
            full = full.with(Quant::Type, self.key.type_name.clone());
        }
        if !full.has(Quant::Id) {
            full = full.with(Quant::Id, self.key.id.clone());
        }
        if !full.has(Quant::Version) {
            full = full.with(Quant::Version, stamp()?);
        }
        if !full.has(Quant::Method) {
            let method = method.ok_or_else(|| Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "no method",
            })?;
            full = full.with(Quant::Method, Stamp::bare(method)?);
        }
        Ok(full.canonicalize())
    }

    /// Delivers an operation, or a bundle of them, through the pipeline: validate, skip
    /// replays, apply, log and emit, then advance the watermark.
    ///
    /// `source` is excluded from the emission.
    pub fn deliver(
        &mut self,
        ty: &SyncableType,
        op: Op,
        source: Option<SubscriberId>,
        io: &mut impl IO,
    ) -> Result<(), Error> {
        self.ensure_live()?;
        self.check_addressed(&op.spec)?;
        if op.is_bundle() {
            let bundle = op.unbundle()?;
            if !bundle.skipped.is_empty() {
                warn!(object = %self.key, skipped = ?bundle.skipped, "bundle entries skipped");
            }
            for op in bundle.ops {
                self.deliver(ty, op, source.clone(), io)?;
            }
            return Ok(());
        }
        if !op.spec.is_op() {
            return Err(Error::MalformedSpec {
                spec: op.spec.to_string(),
                reason: "expected /type#id!version.method",
            });
        }
        let key = OpKey::from_spec(&op.spec).ok_or_else(|| Error::MalformedSpec {
            spec: op.spec.to_string(),
            reason: "no version or method",
        })?;
        trace!(object = %self.key, op = %key, source = ?source, "deliver");

        let Some(desc) = ty.op(key.method.time()) else {
            return (ty.default_handler)(self, ty, &op, &mut Vec::new());
        };
        ty.check(self, &op, source.as_ref())?;
        if desc.emittable && (self.oplog.contains_key(&key) || self.vector().covers(&key.version)) {
            trace!(object = %self.key, op = %key, "replay");
            return Ok(());
        }

        let was_stateless = self.is_stateless();
        let fields_before = (key.method.time() == INIT).then(|| self.fields.clone());
        let mut followups = Vec::new();
        if desc.receivable {
            (desc.handler)(self, ty, &op, &mut followups)?;
        }
        if desc.emittable {
            self.oplog.insert(key.clone(), op.value.clone());
            if self.compact_on_append {
                if let Some(compact) = ty.compact {
                    compact(&mut self.oplog);
                }
            }
            self.fan_out(&op, source.as_ref(), true, io);
            io.push(Effect::React {
                key: self.key.clone(),
                op: op.clone(),
                source: source.clone(),
            });
        } else if let Some(before) = fields_before {
            // replicas that subscribed while we lacked the state get it now
            if (was_stateless && !self.is_stateless()) || before != self.fields {
                self.fan_out(&op, source.as_ref(), false, io);
            }
        }
        // followups are checked for replays against the watermark as it was before this op
        for followup in followups {
            self.deliver(ty, followup, source.clone(), io)?;
        }
        self.watermark.advance(&key.version);
        io.push(Effect::Publish(op));
        Ok(())
    }

    fn fan_out(&mut self, op: &Op, source: Option<&SubscriberId>, to_uplink: bool, io: &mut impl IO) {
        let uplink = match &self.uplink {
            Uplink::Established(peer) => Some(SubscriberId::Peer(peer.clone())),
            _ => None,
        };
        if to_uplink {
            if let Some(uplink) = uplink.as_ref().filter(|up| Some(*up) != source) {
                io.push(Effect::Deliver {
                    to: uplink.clone(),
                    op: op.clone(),
                    source: source.cloned(),
                });
            }
        }
        let mut spent = Vec::new();
        for (id, subscription) in self.downlinks.iter() {
            if Some(id) == source || Some(id) == uplink.as_ref() || !subscription.matches(op) {
                continue;
            }
            io.push(Effect::Deliver {
                to: id.clone(),
                op: op.clone(),
                source: source.cloned(),
            });
            if subscription.once {
                spent.push(id.clone());
            }
        }
        for id in spent {
            self.downlinks.remove(&id);
            if let SubscriberId::Listener(listener) = id {
                io.push(Effect::Release(listener));
            }
        }
    }

    /// Computes what a replica at `base` is missing, as a bundle.
    ///
    /// A `base` that does not cover the object's creation stamp (its id) gets a snapshot: a
    /// single `init` entry carrying the fields, the oplog and the watermark. The initial
    /// state is never logged, so a replica that only has later operations needs it too.
    /// Otherwise the result holds the oplog entries `base` does not cover. `None` when there
    /// is nothing to send.
    pub fn diff(&self, ty: &SyncableType, base: &VersionVector) -> Option<Op> {
        if base.is_trivial() || !base.covers(&self.key.id) {
            if self.is_stateless() {
                return None;
            }
            let mut state = self.fields.clone();
            let oplog = self
                .oplog
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect();
            state.insert("_oplog".to_string(), Value::Object(oplog));
            state.insert("_version".to_string(), Value::String(self.watermark.to_string()));
            if let Some(pack) = ty.pack {
                pack(&mut state);
            }
            let key = OpKey {
                version: self.watermark.max().cloned().unwrap_or_else(Stamp::zero),
                method: name_stamp(INIT),
            };
            return Some(Op::bundle(self.key.spec(), [(&key.spec(), &Value::Object(state))]));
        }
        let missing: Vec<(Spec, &Value)> = self
            .oplog
            .iter()
            .filter(|(key, _)| !base.covers(&key.version))
            .map(|(key, value)| (key.spec(), value))
            .collect();
        if missing.is_empty() {
            return None;
        }
        Some(Op::bundle(
            self.key.spec(),
            missing.iter().map(|(key, value)| (key, *value)),
        ))
    }

    /// Subscribes a downstream subscriber.
    ///
    /// Until the object is linked to its uplink (or is its own root) the request is
    /// queued. Once served, a subscriber that stated a `base` receives the diff against
    /// it and a `reon` carrying this object's vector.
    pub fn on(
        &mut self,
        ty: &SyncableType,
        subscriber: SubscriberId,
        subscription: Subscription,
        base: Option<VersionVector>,
        io: &mut impl IO,
    ) -> Result<(), Error> {
        self.ensure_live()?;
        if !self.uplink.is_servable() {
            debug!(object = %self.key, %subscriber, "on deferred until linked");
            self.deferred.retain(|d| d.subscriber != subscriber);
            self.deferred.push(Deferred {
                subscriber,
                subscription,
                base,
            });
            return Ok(());
        }
        self.serve(ty, subscriber, subscription, base, io);
        Ok(())
    }

    fn serve(
        &mut self,
        ty: &SyncableType,
        subscriber: SubscriberId,
        subscription: Subscription,
        base: Option<VersionVector>,
        io: &mut impl IO,
    ) {
        let Some(base) = base else {
            self.downlinks.insert(subscriber, subscription);
            return;
        };
        let diff = self.diff(ty, &base);
        let spent = subscription.once && diff.is_some();
        if let Some(op) = diff {
            io.push(Effect::Deliver {
                to: subscriber.clone(),
                op,
                source: None,
            });
        }
        io.push(Effect::Reon {
            to: subscriber.clone(),
            spec: self.key.spec(),
            base: Some(self.wire_vector()),
        });
        if spent {
            if let SubscriberId::Listener(listener) = subscriber {
                io.push(Effect::Release(listener));
            }
        } else {
            self.downlinks.insert(subscriber, subscription);
        }
    }

    fn flush_deferred(&mut self, ty: &SyncableType, io: &mut impl IO) {
        let deferred = mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            debug!(object = %self.key, count = deferred.len(), "flush deferred on");
        }
        for d in deferred {
            self.serve(ty, d.subscriber, d.subscription, d.base, io);
        }
    }

    /// Handles the uplink's acknowledgement.
    ///
    /// Links the object, serves queued subscriptions and, given the uplink's `base`, pushes
    /// what the uplink is missing.
    ///
    /// A late `reon` from a peer the object moved away from while waiting is dropped; that
    /// peer already got an `off`. A `reon` from another peer while the uplink is established
    /// is a protocol violation: the new peer takes over, the old one gets an `off`, and the
    /// violation is reported as [`Error::UplinkConflict`].
    pub fn reon(
        &mut self,
        ty: &SyncableType,
        from: PeerId,
        base: Option<VersionVector>,
        io: &mut impl IO,
    ) -> Result<(), Error> {
        self.ensure_live()?;
        let conflict = match &self.uplink {
            Uplink::Pending(peer) | Uplink::Established(peer) if *peer == from => None,
            Uplink::Established(current) => Some(current.clone()),
            Uplink::Pending(_) | Uplink::None | Uplink::Root => {
                debug!(object = %self.key, peer = %from, uplink = ?self.uplink, "stale reon");
                return Ok(());
            }
        };
        if let Some(current) = &conflict {
            error!(object = %self.key, %current, new = %from, "reon from a second uplink");
            io.push(Effect::Off {
                to: current.clone(),
                spec: self.key.spec(),
            });
        }
        debug!(object = %self.key, uplink = %from, "linked");
        self.uplink = Uplink::Established(from.clone());
        self.flush_deferred(ty, io);
        if let Some(op) = base.and_then(|base| self.diff(ty, &base)) {
            io.push(Effect::Deliver {
                to: SubscriberId::Peer(from.clone()),
                op,
                source: None,
            });
        }
        match conflict {
            Some(current) => Err(Error::UplinkConflict {
                key: self.key.clone(),
                current,
                new: from,
            }),
            None => Ok(()),
        }
    }

    /// Removes a downstream subscriber.
    pub fn off(&mut self, subscriber: &SubscriberId) -> Result<(), Error> {
        self.ensure_live()?;
        if self.downlinks.remove(subscriber).is_some() {
            return Ok(());
        }
        let queued = self.deferred.len();
        self.deferred.retain(|d| d.subscriber != *subscriber);
        if self.deferred.len() != queued {
            return Ok(());
        }
        Err(Error::UnknownSubscriber {
            key: self.key.clone(),
            subscriber: subscriber.clone(),
        })
    }

    /// Handles the uplink revoking the subscription. The object is left unlinked; the
    /// caller is expected to run uplink selection again.
    pub fn reoff(&mut self, from: &PeerId) -> Result<(), Error> {
        self.ensure_live()?;
        if self.uplink.peer() != Some(from) {
            return Err(Error::UplinkMismatch {
                key: self.key.clone(),
                from: from.clone(),
            });
        }
        debug!(object = %self.key, uplink = %from, "uplink revoked");
        self.uplink = Uplink::None;
        Ok(())
    }

    /// Re-evaluates the uplink given the peers closest to the object, closest first.
    ///
    /// Subscribes to the closest one if it is not the uplink already, and unsubscribes
    /// from the previous uplink. Without candidates the object is its own root.
    pub fn check_uplink(&mut self, ty: &SyncableType, candidates: &[PeerId], io: &mut impl IO) {
        if self.disposed {
            return;
        }
        let spec = self.key.spec();
        let Some(closest) = candidates.first() else {
            if let Some(old) = self.uplink.peer() {
                io.push(Effect::Off {
                    to: old.clone(),
                    spec,
                });
            }
            if self.uplink != Uplink::Root {
                debug!(object = %self.key, "root");
                self.uplink = Uplink::Root;
                self.flush_deferred(ty, io);
            }
            return;
        };
        if self.uplink.peer() == Some(closest) {
            return;
        }
        if let Some(old) = self.uplink.peer() {
            io.push(Effect::Off {
                to: old.clone(),
                spec: spec.clone(),
            });
        }
        debug!(object = %self.key, uplink = %closest, "subscribing to uplink");
        self.uplink = Uplink::Pending(closest.clone());
        io.push(Effect::On {
            to: closest.clone(),
            spec,
            base: self.wire_vector(),
        });
    }

    /// Drops every subscription involving `peer`. Returns whether it was the uplink.
    pub fn forget_peer(&mut self, peer: &PeerId) -> bool {
        let id = SubscriberId::Peer(peer.clone());
        self.downlinks.remove(&id);
        self.deferred.retain(|d| d.subscriber != id);
        if self.uplink.peer() == Some(peer) {
            self.uplink = Uplink::None;
            return true;
        }
        false
    }

    /// Detaches from the uplink, revokes every downstream subscription and invalidates
    /// the object. Every later operation fails with [`Error::Disposed`].
    pub fn close(&mut self, io: &mut impl IO) -> Result<(), Error> {
        self.ensure_live()?;
        debug!(object = %self.key, "close");
        self.disposed = true;
        let spec = self.key.spec();
        if let Some(uplink) = self.uplink.peer() {
            io.push(Effect::Off {
                to: uplink.clone(),
                spec: spec.clone(),
            });
        }
        self.uplink = Uplink::None;
        let queued = mem::take(&mut self.deferred).into_iter().map(|d| d.subscriber);
        let subscribers: Vec<_> = self.downlinks.drain().chain(queued).collect();
        for id in subscribers {
            io.push(Effect::Reoff {
                to: id.clone(),
                spec: spec.clone(),
            });
            if let SubscriberId::Listener(listener) = id {
                io.push(Effect::Release(listener));
            }
        }
        Ok(())
    }
}

/// A method or type name known to be a valid token.
pub(crate) fn name_stamp(name: &'static str) -> Stamp {
    Stamp::bare(name).unwrap_or_else(|_| Stamp::zero())
}
