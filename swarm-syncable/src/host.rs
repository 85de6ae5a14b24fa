//! The per-process registry of objects, peers and listeners.
//!
//! A [`Host`] owns every live [`Syncable`] by its [`ObjectKey`], the [`Subscriber`]s of
//! connected peers and local listeners, and the clock that stamps local operations. Objects
//! report what should happen next as [`Effect`]s; the host dispatches them after each call,
//! so every operation is fully processed before the next one is looked at.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
};

use serde_json::{Map, Value};
use swarm_protocol::{Message, Op, Quant, Spec, Stamp, VersionVector};
use tracing::{debug, trace, warn};

use crate::{
    clock::{Clock, ClockMode},
    model::{self, SET, SET_TYPE},
    router::Router,
    stream::OpStream,
    subscriber::{ListenerId, PeerId, Subscriber, SubscriberError, SubscriberId, Subscription},
    syncable::{name_stamp, Effect, ObjectKey, ReactionHandle, Syncable, SyncableType, TypeError, INIT},
    Config, Error,
};

/// Type name of the peer handshake specifiers, `/Host#peer`.
pub const HOST: &str = "Host";
/// Method of the published peer join event.
pub const JOIN: &str = "on";
/// Method of the published peer leave event.
pub const LEAVE: &str = "off";

/// A replica host: local objects, their types, and the peers they sync with.
pub struct Host {
    id: PeerId,
    config: Config,
    clock: Clock,
    router: Router,
    types: HashMap<String, SyncableType>,
    objects: HashMap<ObjectKey, Syncable>,
    peers: BTreeMap<PeerId, Box<dyn Subscriber>>,
    pending: BTreeMap<PeerId, Box<dyn Subscriber>>,
    listeners: HashMap<ListenerId, Box<dyn Subscriber>>,
    next_listener: u64,
    stream: OpStream,
    effects: VecDeque<Effect>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .field("objects", &self.objects.len())
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Creates a host with a wall clock, knowing the [`model::MODEL`] and
    /// [`model::SET_TYPE`] types.
    pub fn new(id: PeerId, config: Config) -> Result<Self, Error> {
        Self::with_clock_mode(id, config, ClockMode::Wall)
    }

    /// Creates a host with the given clock mode.
    pub fn with_clock_mode(id: PeerId, config: Config, mode: ClockMode) -> Result<Self, Error> {
        let clock = Clock::new(id.as_stamp().clone(), mode, &config);
        let router = Router::new(config.hash_points);
        let mut host = Self {
            id,
            config,
            clock,
            router,
            types: HashMap::new(),
            objects: HashMap::new(),
            peers: BTreeMap::new(),
            pending: BTreeMap::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            stream: OpStream::new(),
            effects: VecDeque::new(),
        };
        host.register_type(model::model_type()?)?;
        host.register_type(model::set_type()?)?;
        Ok(host)
    }

    /// This host's id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The clock stamping local operations.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Stream of every operation the host's objects processed, plus peer join and leave
    /// events on `/Host#peer`.
    pub fn stream(&mut self) -> &mut OpStream {
        &mut self.stream
    }

    /// Registers an object type.
    pub fn register_type(&mut self, ty: SyncableType) -> Result<(), Error> {
        let name = ty.name().time().to_string();
        if self.types.contains_key(&name) {
            return Err(TypeError::DuplicateType(name).into());
        }
        debug!(host = %self.id, %name, "register type");
        self.types.insert(name, ty);
        Ok(())
    }

    /// A registered type.
    pub fn object_type(&self, name: &str) -> Option<&SyncableType> {
        self.types.get(name)
    }

    fn type_mut(&mut self, name: &str) -> Result<&mut SyncableType, Error> {
        self.types
            .get_mut(name)
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    /// Reacts to every emitted `method` operation on objects of a type.
    pub fn add_reaction(
        &mut self,
        type_name: &str,
        method: &str,
        callback: impl FnMut(&Syncable, &Op, Option<&SubscriberId>) + 'static,
    ) -> Result<ReactionHandle, Error> {
        Ok(self.type_mut(type_name)?.add_reaction(method, callback))
    }

    /// Reacts to changes of one field on objects of a type.
    pub fn add_field_reaction(
        &mut self,
        type_name: &str,
        field: &str,
        callback: impl FnMut(&Syncable, &Op, Option<&SubscriberId>) + 'static,
    ) -> Result<ReactionHandle, Error> {
        Ok(self.type_mut(type_name)?.add_field_reaction(field, callback))
    }

    /// Removes a reaction. Returns whether it was registered.
    pub fn remove_reaction(&mut self, handle: &ReactionHandle) -> bool {
        self.types
            .get_mut(handle.type_name().time())
            .is_some_and(|ty| ty.remove_reaction(handle))
    }

    /// A live object.
    pub fn object(&self, key: &ObjectKey) -> Option<&Syncable> {
        self.objects.get(key)
    }

    /// All live objects, in no particular order.
    pub fn objects(&self) -> impl Iterator<Item = &Syncable> {
        self.objects.values()
    }

    /// Connected peers, ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// Creates an object with a fresh id and its initial state.
    pub fn create(&mut self, type_name: &str, state: Map<String, Value>) -> Result<ObjectKey, Error> {
        if !self.types.contains_key(type_name) {
            return Err(Error::UnknownType(type_name.to_string()));
        }
        let id = self.clock.issue()?;
        let key = ObjectKey::new(Stamp::bare(type_name)?, id.clone());
        let spec = key
            .spec()
            .with(Quant::Version, id)
            .with(Quant::Method, name_stamp(INIT));
        self.hydrate(&key)?;
        trace!(host = %self.id, %spec, "create");
        let result = self.deliver(Op::new(spec, Value::Object(state)), None);
        self.flush();
        result.map(|_| key)
    }

    /// Makes the object named by `spec` live, stateless until its uplink sends state.
    pub fn get(&mut self, spec: &Spec) -> Result<ObjectKey, Error> {
        let key = ObjectKey::from_spec(spec)?;
        let result = self.hydrate(&key);
        self.flush();
        result.map(|()| key)
    }

    fn hydrate(&mut self, key: &ObjectKey) -> Result<(), Error> {
        if self.objects.contains_key(key) {
            return Ok(());
        }
        let ty = self
            .types
            .get(key.type_name().time())
            .ok_or_else(|| Error::UnknownType(key.type_name().to_string()))?;
        debug!(host = %self.id, object = %key, "hydrate");
        let mut object = Syncable::new(key.clone(), &self.config);
        let candidates = self.router.available_uplinks(&key.spec(), &self.id, self.peers.keys());
        object.check_uplink(ty, &candidates, &mut self.effects);
        self.objects.insert(key.clone(), object);
        Ok(())
    }

    /// Issues an operation on an object. Returns the full specifier it was stamped with.
    pub fn op(&mut self, key: &ObjectKey, method: &str, value: Value) -> Result<Spec, Error> {
        self.submit(&key.spec().with(Quant::Method, Stamp::bare(method)?), value)
    }

    /// Assigns fields of a model.
    pub fn set(&mut self, key: &ObjectKey, fields: Map<String, Value>) -> Result<Spec, Error> {
        self.op(key, SET, Value::Object(fields))
    }

    fn set_object(&self, set: &ObjectKey) -> Result<&Syncable, Error> {
        if set.type_name().time() != SET_TYPE {
            return Err(Error::MalformedSpec {
                spec: set.to_string(),
                reason: "not a Set",
            });
        }
        self.objects.get(set).ok_or_else(|| Error::NotFound(set.clone()))
    }

    /// Puts a reference to `target` into a [`SET_TYPE`] object under `entry`, and makes
    /// the target live.
    pub fn set_add(&mut self, set: &ObjectKey, entry: &str, target: &ObjectKey) -> Result<Spec, Error> {
        self.set_object(set)?;
        let mut change = Map::new();
        change.insert(entry.to_string(), Value::String(target.to_string()));
        let spec = self.set(set, change)?;
        self.get(&target.spec())?;
        Ok(spec)
    }

    /// Deletes an entry of a [`SET_TYPE`] object.
    pub fn set_remove(&mut self, set: &ObjectKey, entry: &str) -> Result<Spec, Error> {
        self.set_object(set)?;
        let mut change = Map::new();
        change.insert(entry.to_string(), Value::Null);
        self.set(set, change)
    }

    /// Resolves an entry of a [`SET_TYPE`] object, making the referenced object live.
    pub fn set_entry(&mut self, set: &ObjectKey, entry: &str) -> Result<Option<ObjectKey>, Error> {
        let Some(target) = model::reference(self.set_object(set)?, entry)? else {
            return Ok(None);
        };
        self.get(&target.spec()).map(Some)
    }

    /// Makes every object a [`SET_TYPE`] object references live. Returns them ordered by
    /// entry key.
    pub fn set_fill_all(&mut self, set: &ObjectKey) -> Result<Vec<ObjectKey>, Error> {
        let specs = model::collection(self.set_object(set)?);
        specs.iter().map(|spec| self.get(spec)).collect()
    }

    /// Issues an operation addressed by a partial specifier.
    ///
    /// The specifier must name the object and the method; a missing version is taken from
    /// the host clock.
    pub fn submit(&mut self, spec: &Spec, value: Value) -> Result<Spec, Error> {
        let key = ObjectKey::from_spec(spec)?;
        let object = self.objects.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let clock = &mut self.clock;
        let full = object.normalize(spec, None, || clock.issue())?;
        let result = self.deliver(Op::new(full.clone(), value), None);
        self.flush();
        result.map(|()| full)
    }

    fn deliver(&mut self, op: Op, source: Option<SubscriberId>) -> Result<(), Error> {
        let key = ObjectKey::from_spec(&op.spec)?;
        let (object, ty) = entry(&mut self.objects, &self.types, &key)?;
        let result = object.deliver(ty, op, source, &mut self.effects);
        if let Some(max) = object.watermark().max() {
            self.clock.observe(max);
        }
        result
    }

    /// Subscribes a local listener to an object, hydrating the object if needed.
    ///
    /// With a `base`, the listener first receives what it is missing and a `reon`.
    pub fn on(
        &mut self,
        key: &ObjectKey,
        subscription: Subscription,
        base: Option<VersionVector>,
        listener: impl Subscriber + 'static,
    ) -> Result<ListenerId, Error> {
        self.hydrate(key)?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, Box::new(listener));
        let result = entry(&mut self.objects, &self.types, key)
            .and_then(|(object, ty)| object.on(ty, id.into(), subscription, base, &mut self.effects));
        if result.is_err() {
            self.listeners.remove(&id);
        }
        self.flush();
        result.map(|()| id)
    }

    /// Unsubscribes a local listener.
    pub fn off(&mut self, key: &ObjectKey, listener: ListenerId) -> Result<(), Error> {
        let object = self.objects.get_mut(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let result = object.off(&listener.into());
        self.listeners.remove(&listener);
        result
    }

    /// Closes an object: unsubscribes from its uplink, revokes its subscribers and
    /// unregisters it. Returns the disposed object.
    pub fn close(&mut self, key: &ObjectKey) -> Result<Syncable, Error> {
        let mut object = self.objects.remove(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let result = object.close(&mut self.effects);
        self.flush();
        result.map(|()| object)
    }

    /// Closes every object with neither an uplink nor subscribers. Returns their keys.
    pub fn gc(&mut self) -> Vec<ObjectKey> {
        let mut collectable: Vec<ObjectKey> = self
            .objects
            .values()
            .filter(|object| object.is_collectable())
            .map(|object| object.key().clone())
            .collect();
        collectable.sort();
        for key in &collectable {
            if let Some(mut object) = self.objects.remove(key) {
                if let Err(err) = object.close(&mut self.effects) {
                    warn!(host = %self.id, object = %key, %err, "gc failed to close");
                }
            }
        }
        if !collectable.is_empty() {
            debug!(host = %self.id, count = collectable.len(), "gc");
        }
        self.flush();
        collectable
    }

    fn host_spec(id: &PeerId) -> Spec {
        Spec::object(&name_stamp(HOST), id.as_stamp())
    }

    /// Registers the transport of an incoming connection. The peer becomes connected once
    /// its `on` arrives.
    pub fn accept(&mut self, peer: PeerId, sink: impl Subscriber + 'static) {
        debug!(host = %self.id, %peer, "accept");
        self.pending.insert(peer, Box::new(sink));
    }

    /// Opens the peer handshake over a transport. The peer becomes connected once its
    /// `reon` arrives.
    pub fn connect(&mut self, peer: PeerId, sink: impl Subscriber + 'static) {
        debug!(host = %self.id, %peer, "connect");
        let mut sink: Box<dyn Subscriber> = Box::new(sink);
        if let Err(err) = sink.on(&Self::host_spec(&self.id), &VersionVector::new()) {
            warn!(host = %self.id, %peer, %err, "handshake failed");
            return;
        }
        self.pending.insert(peer, sink);
    }

    /// Says goodbye to a peer and forgets it.
    pub fn disconnect(&mut self, peer: &PeerId) -> Result<(), Error> {
        let spec = Self::host_spec(&self.id);
        let sink = match self.peers.get_mut(peer) {
            Some(sink) => sink,
            None => self
                .pending
                .get_mut(peer)
                .ok_or_else(|| Error::UnknownPeer(peer.clone()))?,
        };
        if let Err(err) = sink.off(&spec) {
            warn!(host = %self.id, %peer, %err, "off failed");
        }
        self.remove_peer(peer);
        Ok(())
    }

    /// Forgets a peer: drops it from every object and selects new uplinks where it was
    /// one. Returns whether the peer was known.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let connected = self.peers.remove(peer).is_some();
        let pending = self.pending.remove(peer).is_some();
        if !connected && !pending {
            return false;
        }
        debug!(host = %self.id, %peer, "remove peer");
        for object in self.objects.values_mut() {
            object.forget_peer(peer);
        }
        self.check_uplinks();
        if connected {
            self.publish_membership(peer, LEAVE);
        }
        self.flush();
        true
    }

    fn promote(&mut self, peer: &PeerId, sink: Box<dyn Subscriber>) {
        debug!(host = %self.id, %peer, "peer connected");
        if let Some(mut old) = self.peers.insert(peer.clone(), sink) {
            debug!(host = %self.id, %peer, "replacing connection");
            if let Err(err) = old.off(&Self::host_spec(&self.id)) {
                warn!(host = %self.id, %peer, %err, "off failed");
            }
            for object in self.objects.values_mut() {
                object.forget_peer(peer);
            }
        }
        self.check_uplinks();
        self.publish_membership(peer, JOIN);
    }

    fn check_uplinks(&mut self) {
        for (key, object) in self.objects.iter_mut() {
            let Some(ty) = self.types.get(key.type_name().time()) else {
                continue;
            };
            let candidates = self.router.available_uplinks(&key.spec(), &self.id, self.peers.keys());
            object.check_uplink(ty, &candidates, &mut self.effects);
        }
    }

    fn publish_membership(&mut self, peer: &PeerId, method: &'static str) {
        let stamp = match self.clock.issue() {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(host = %self.id, %peer, %err, "membership event not published");
                return;
            }
        };
        let spec = Self::host_spec(peer)
            .with(Quant::Version, stamp)
            .with(Quant::Method, name_stamp(method));
        self.stream.offer(Some(&Op::new(spec, Value::Null)));
    }

    /// Handles a message from a peer.
    ///
    /// Effects are dispatched even when the message fails; the error says what was wrong
    /// with it.
    pub fn receive(&mut self, from: &PeerId, message: Message) -> Result<(), Error> {
        if !self.peers.contains_key(from) && !self.pending.contains_key(from) {
            return Err(Error::UnknownPeer(from.clone()));
        }
        trace!(host = %self.id, %from, spec = %message.spec(), "receive");
        let result = if message.spec().type_name().is_some_and(|t| t.time() == HOST) {
            self.receive_handshake(from, message)
        } else if self.peers.contains_key(from) {
            self.receive_object(from, message)
        } else {
            Err(Error::UnknownPeer(from.clone()))
        };
        self.flush();
        result
    }

    fn receive_handshake(&mut self, from: &PeerId, message: Message) -> Result<(), Error> {
        let spec = message.spec();
        if spec.id() != Some(from.as_stamp()) {
            return Err(Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "handshake is not from its sender",
            });
        }
        let me = Self::host_spec(&self.id);
        match message {
            Message::On { .. } => {
                if let Some(mut sink) = self.pending.remove(from) {
                    if let Err(err) = sink.reon(&me, None) {
                        warn!(host = %self.id, peer = %from, %err, "reon failed");
                    }
                    self.promote(from, sink);
                } else if let Some(sink) = self.peers.get_mut(from) {
                    if let Err(err) = sink.reon(&me, None) {
                        warn!(host = %self.id, peer = %from, %err, "reon failed");
                    }
                }
            }
            Message::Reon { .. } => match self.pending.remove(from) {
                Some(sink) => self.promote(from, sink),
                None => trace!(host = %self.id, peer = %from, "duplicate reon"),
            },
            Message::Off { .. } => {
                let sink = self.peers.get_mut(from).or_else(|| self.pending.get_mut(from));
                if let Some(sink) = sink {
                    if let Err(err) = sink.reoff(&me) {
                        warn!(host = %self.id, peer = %from, %err, "reoff failed");
                    }
                }
                self.remove_peer(from);
            }
            Message::Reoff { .. } => {
                self.remove_peer(from);
            }
            Message::Op(op) => {
                return Err(Error::MalformedSpec {
                    spec: op.spec.to_string(),
                    reason: "operations on the host are not supported",
                })
            }
        }
        Ok(())
    }

    fn receive_object(&mut self, from: &PeerId, message: Message) -> Result<(), Error> {
        let source = SubscriberId::Peer(from.clone());
        match message {
            Message::Op(op) => self.deliver(op, Some(source)),
            Message::On { spec, base } => {
                let key = self.object_key(&spec)?;
                self.hydrate(&key)?;
                let (object, ty) = entry(&mut self.objects, &self.types, &key)?;
                object.on(ty, source, Subscription::whole(), Some(base), &mut self.effects)
            }
            Message::Reon { spec, base } => {
                let key = self.object_key(&spec)?;
                let (object, ty) = entry(&mut self.objects, &self.types, &key)?;
                object.reon(ty, from.clone(), base, &mut self.effects)
            }
            Message::Off { spec } => {
                let key = self.object_key(&spec)?;
                let (object, _) = entry(&mut self.objects, &self.types, &key)?;
                object.off(&source)
            }
            Message::Reoff { spec } => {
                let key = self.object_key(&spec)?;
                let (object, ty) = entry(&mut self.objects, &self.types, &key)?;
                object.reoff(from)?;
                let candidates = self.router.available_uplinks(&spec, &self.id, self.peers.keys());
                object.check_uplink(ty, &candidates, &mut self.effects);
                Ok(())
            }
        }
    }

    fn object_key(&self, spec: &Spec) -> Result<ObjectKey, Error> {
        if !spec.is_object() {
            return Err(Error::MalformedSpec {
                spec: spec.to_string(),
                reason: "expected /type#id",
            });
        }
        ObjectKey::from_spec(spec)
    }

    fn subscriber(&mut self, id: &SubscriberId) -> Option<&mut Box<dyn Subscriber>> {
        match id {
            SubscriberId::Peer(peer) => self.peers.get_mut(peer),
            SubscriberId::Listener(listener) => self.listeners.get_mut(listener),
        }
    }

    fn notify(&mut self, to: &SubscriberId, call: impl FnOnce(&mut dyn Subscriber) -> Result<(), SubscriberError>) {
        let host = self.id.clone();
        match self.subscriber(to) {
            Some(subscriber) => {
                if let Err(err) = call(subscriber.as_mut()) {
                    warn!(%host, %to, %err, "subscriber failed");
                }
            }
            None => debug!(%host, %to, "subscriber is gone"),
        }
    }

    fn flush(&mut self) {
        while let Some(effect) = self.effects.pop_front() {
            match effect {
                Effect::Deliver { to, op, source } => {
                    self.notify(&to, |s| s.deliver(&op, source.as_ref()));
                }
                Effect::On { to, spec, base } => {
                    self.notify(&to.into(), |s| s.on(&spec, &base));
                }
                Effect::Reon { to, spec, base } => {
                    self.notify(&to, |s| s.reon(&spec, base.as_ref()));
                }
                Effect::Off { to, spec } => {
                    self.notify(&to.into(), |s| s.off(&spec));
                }
                Effect::Reoff { to, spec } => {
                    self.notify(&to, |s| s.reoff(&spec));
                }
                Effect::React { key, op, source } => {
                    let object = self.objects.get(&key);
                    let ty = self.types.get_mut(key.type_name().time());
                    if let (Some(object), Some(ty)) = (object, ty) {
                        ty.react(object, &op, source.as_ref());
                    }
                }
                Effect::Publish(op) => self.stream.offer(Some(&op)),
                Effect::Release(listener) => {
                    self.listeners.remove(&listener);
                }
            }
        }
    }
}

fn entry<'a>(
    objects: &'a mut HashMap<ObjectKey, Syncable>,
    types: &'a HashMap<String, SyncableType>,
    key: &ObjectKey,
) -> Result<(&'a mut Syncable, &'a SyncableType), Error> {
    let object = objects.get_mut(key).ok_or_else(|| Error::NotFound(key.clone()))?;
    let ty = types
        .get(key.type_name().time())
        .ok_or_else(|| Error::UnknownType(key.type_name().to_string()))?;
    Ok((object, ty))
}
