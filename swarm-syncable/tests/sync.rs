//! Replication scenarios over an in-memory network.
//!
//! Messages travel as JSON through a shared queue and are handed to the receiving host one
//! at a time, in send order, until the network is quiet.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use serde_json::{json, Map, Value};
use swarm_protocol::{Filter, Message, Op, Spec};
use swarm_syncable::{
    clock::ClockMode,
    model,
    stream::{Flow, HANDSHAKES, MUTATIONS},
    syncable::{Effect, Uplink},
    Config, Error, FnSubscriber, Host, MessageSink, ObjectKey, PeerId, Subscriber, SubscriberError,
    SubscriberId, Subscription,
};
use tracing_subscriber::{prelude::*, EnvFilter};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

type Wire = Rc<RefCell<VecDeque<(PeerId, PeerId, String)>>>;
type Log = Rc<RefCell<Vec<String>>>;

struct Network {
    hosts: Vec<Host>,
    wire: Wire,
    errors: Vec<(PeerId, Error)>,
}

impl Network {
    fn new() -> Self {
        Self {
            hosts: Vec::new(),
            wire: Wire::default(),
            errors: Vec::new(),
        }
    }

    fn push(&mut self, id: &str) -> usize {
        let host = Host::with_clock_mode(id.parse().unwrap(), Config::default(), ClockMode::Logical).unwrap();
        self.hosts.push(host);
        self.hosts.len() - 1
    }

    fn id(&self, i: usize) -> PeerId {
        self.hosts[i].id().clone()
    }

    fn index(&self, id: &PeerId) -> usize {
        self.hosts.iter().position(|h| h.id() == id).unwrap()
    }

    fn sink(&self, from: PeerId, to: PeerId) -> impl Subscriber + 'static {
        let wire = self.wire.clone();
        MessageSink::new(move |message: Message| {
            let text = serde_json::to_string(&message).map_err(|err| SubscriberError::new(err.to_string()))?;
            wire.borrow_mut().push_back((from.clone(), to.clone(), text));
            Ok(())
        })
    }

    fn connect(&mut self, a: usize, b: usize) {
        let (ida, idb) = (self.id(a), self.id(b));
        let to_a = self.sink(idb.clone(), ida.clone());
        self.hosts[b].accept(ida.clone(), to_a);
        let to_b = self.sink(ida, idb.clone());
        self.hosts[a].connect(idb, to_b);
    }

    fn connect_all(&mut self) {
        for a in 0..self.hosts.len() {
            for b in a + 1..self.hosts.len() {
                self.connect(a, b);
            }
        }
        self.run();
    }

    fn run(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.wire.borrow_mut().pop_front();
            let Some((from, to, text)) = next else {
                break;
            };
            let message: Message = serde_json::from_str(&text).unwrap();
            let i = self.index(&to);
            if let Err(err) = self.hosts[i].receive(&from, message) {
                self.errors.push((to, err));
            }
            delivered += 1;
            assert!(delivered < 100_000, "network does not quiesce");
        }
        delivered
    }

    fn fields(&self, i: usize, key: &ObjectKey) -> Map<String, Value> {
        self.hosts[i].object(key).unwrap().fields().clone()
    }

    fn uplinks(&self, key: &ObjectKey) -> Vec<Uplink> {
        self.hosts
            .iter()
            .map(|h| h.object(key).unwrap().uplink().clone())
            .collect()
    }

    fn root(&self, key: &ObjectKey) -> usize {
        self.uplinks(key).iter().position(|u| *u == Uplink::Root).unwrap()
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not a map"),
    }
}

fn recorder(log: &Log) -> FnSubscriber<impl FnMut(&Op, Option<&SubscriberId>)> {
    let log = log.clone();
    FnSubscriber::new(move |op: &Op, _: Option<&SubscriberId>| log.borrow_mut().push(op.spec.to_string()))
}

/// Three connected hosts sharing one object created on the first.
fn three_hosts() -> (Network, ObjectKey) {
    let mut network = Network::new();
    for id in ["alice", "bob", "carol"] {
        network.push(id);
    }
    network.connect_all();
    let key = network.hosts[0]
        .create(model::MODEL, fields(json!({"title": "draft"})))
        .unwrap();
    for i in 1..3 {
        network.hosts[i].get(&key.spec()).unwrap();
    }
    network.run();
    (network, key)
}

#[test]
fn handshake_connects_peers() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    let joins = Log::default();
    {
        let joins = joins.clone();
        network.hosts[a]
            .stream()
            .on(Filter::parse(HANDSHAKES).unwrap(), move |op: Option<&Op>| {
                if let Some(op) = op {
                    let spec = &op.spec;
                    joins.borrow_mut().push(format!(
                        "{}.{}",
                        spec.id().unwrap(),
                        spec.method().unwrap()
                    ));
                }
                Flow::Continue
            });
    }
    network.connect(a, b);
    network.run();
    assert_eq!(network.hosts[a].peers().collect::<Vec<_>>(), vec![&network.id(b)]);
    assert_eq!(network.hosts[b].peers().collect::<Vec<_>>(), vec![&network.id(a)]);

    let bob = network.id(b);
    network.hosts[a].disconnect(&bob).unwrap();
    network.run();
    assert_eq!(network.hosts[a].peers().count(), 0);
    assert_eq!(network.hosts[b].peers().count(), 0);
    assert_eq!(*joins.borrow(), vec!["bob.on", "bob.off"]);
}

#[test]
fn new_replica_bootstraps_from_snapshot() {
    setup_logging();
    let (network, key) = three_hosts();
    for i in 0..3 {
        assert_eq!(network.fields(i, &key), fields(json!({"title": "draft"})));
        assert_eq!(
            network.hosts[i].object(&key).unwrap().vector(),
            network.hosts[0].object(&key).unwrap().vector()
        );
    }
    assert!(network.errors.is_empty(), "{:?}", network.errors);
}

#[test]
fn one_root_and_everyone_linked() {
    setup_logging();
    let (network, key) = three_hosts();
    let uplinks = network.uplinks(&key);
    let roots = uplinks.iter().filter(|u| **u == Uplink::Root).count();
    assert_eq!(roots, 1, "{uplinks:?}");
    let root = network.id(network.root(&key));
    for uplink in uplinks {
        match uplink {
            Uplink::Root => {}
            Uplink::Established(peer) => assert_eq!(peer, root),
            other => panic!("not linked: {other:?}"),
        }
    }
}

#[test]
fn concurrent_edits_converge() {
    setup_logging();
    let (mut network, key) = three_hosts();
    let remote = Log::default();
    network.hosts[2]
        .on(&key, Subscription::field("title"), None, recorder(&remote))
        .unwrap();

    network.hosts[0].set(&key, fields(json!({"title": "alice's"}))).unwrap();
    network.hosts[1].set(&key, fields(json!({"title": "bob's", "tags": ["x"]}))).unwrap();
    network.hosts[2].set(&key, fields(json!({"done": true}))).unwrap();
    network.run();

    let expected = network.fields(0, &key);
    assert_eq!(expected["done"], json!(true));
    assert_eq!(expected["tags"], json!(["x"]));
    for i in 1..3 {
        assert_eq!(network.fields(i, &key), expected);
        assert_eq!(
            network.hosts[i].object(&key).unwrap().vector(),
            network.hosts[0].object(&key).unwrap().vector()
        );
    }
    // carol's listener saw both title changes, whatever order they arrived in
    assert_eq!(remote.borrow().len(), 2);
    assert!(network.errors.is_empty(), "{:?}", network.errors);
}

#[test]
fn incremental_resync_sends_only_the_difference() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    network.connect(a, b);
    network.run();
    let key = network.hosts[a].create(model::MODEL, Map::new()).unwrap();
    network.hosts[b].get(&key.spec()).unwrap();
    network.run();
    for n in 0..5 {
        network.hosts[a].set(&key, fields(json!({ "n": n }))).unwrap();
    }
    network.run();
    let vector = network.hosts[b].object(&key).unwrap().vector();

    // a listener that is up to date gets nothing but the acknowledgement
    let log = Log::default();
    network.hosts[a]
        .on(&key, Subscription::whole(), Some(vector), recorder(&log))
        .unwrap();
    assert!(log.borrow().is_empty());

    network.hosts[a].set(&key, fields(json!({"n": 5}))).unwrap();
    network.run();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(network.fields(b, &key)["n"], json!(5));
}

#[test]
fn redelivery_is_idempotent() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    network.connect(a, b);
    network.run();
    let key = network.hosts[a].create(model::MODEL, Map::new()).unwrap();
    network.hosts[b].get(&key.spec()).unwrap();
    network.run();

    let log = Log::default();
    network.hosts[a]
        .on(&key, Subscription::whole(), None, recorder(&log))
        .unwrap();
    let op = Op::new(
        key.spec().concat(&Spec::parse("!00050+bob.set").unwrap()),
        json!({"x": 1}),
    );
    let bob = network.id(b);
    network.hosts[a].receive(&bob, Message::Op(op.clone())).unwrap();
    let logged = network.hosts[a].object(&key).unwrap().oplog().len();
    network.hosts[a].receive(&bob, Message::Op(op)).unwrap();
    assert_eq!(network.hosts[a].object(&key).unwrap().oplog().len(), logged);
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(network.fields(a, &key)["x"], json!(1));
}

#[test]
fn second_uplink_takes_over() {
    setup_logging();
    let (mut network, key) = three_hosts();
    let root = network.root(&key);
    let linked = (0..3).find(|i| *i != root).unwrap();
    let other = (0..3).find(|i| *i != root && *i != linked).unwrap();
    let intruder = network.id(other);

    let result = network.hosts[linked].receive(
        &intruder,
        Message::Reon {
            spec: key.spec(),
            base: None,
        },
    );
    match result {
        Err(Error::UplinkConflict { current, new, .. }) => {
            assert_eq!(current, network.id(root));
            assert_eq!(new, intruder);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(
        network.hosts[linked].object(&key).unwrap().uplink(),
        &Uplink::Established(intruder)
    );
}

#[test]
fn reoff_from_a_stranger_is_refused() {
    setup_logging();
    let (mut network, key) = three_hosts();
    let root = network.root(&key);
    let linked = (0..3).find(|i| *i != root).unwrap();
    let other = (0..3).find(|i| *i != root && *i != linked).unwrap();
    let stranger = network.id(other);
    let result = network.hosts[linked].receive(&stranger, Message::Reoff { spec: key.spec() });
    assert!(matches!(result, Err(Error::UplinkMismatch { .. })));
}

#[test]
fn closed_object_fails_fast() {
    setup_logging();
    let mut network = Network::new();
    network.push("alice");
    let key = network.hosts[0]
        .create(model::MODEL, fields(json!({"x": 1})))
        .unwrap();
    let mut husk = network.hosts[0].close(&key).unwrap();
    assert!(husk.is_disposed());
    assert!(matches!(
        network.hosts[0].set(&key, Map::new()),
        Err(Error::NotFound(_))
    ));
    let ty = model::model_type().unwrap();
    let op = Op::new(
        key.spec().concat(&Spec::parse("!00009+alice.set").unwrap()),
        json!({"x": 2}),
    );
    let mut io: VecDeque<Effect> = VecDeque::new();
    assert!(matches!(
        husk.deliver(&ty, op, None, &mut io),
        Err(Error::Disposed(_))
    ));
}

#[test]
fn losing_the_uplink_relinks_and_keeps_syncing() {
    setup_logging();
    let (mut network, key) = three_hosts();
    let root = network.root(&key);
    let lost = network.id(root);
    let survivors: Vec<usize> = (0..3).filter(|i| *i != root).collect();

    for &i in &survivors {
        assert!(network.hosts[i].remove_peer(&lost));
    }
    network.run();
    let uplinks: Vec<Uplink> = survivors
        .iter()
        .map(|&i| network.hosts[i].object(&key).unwrap().uplink().clone())
        .collect();
    assert_eq!(uplinks.iter().filter(|u| **u == Uplink::Root).count(), 1, "{uplinks:?}");
    assert!(uplinks.iter().all(|u| u.peer() != Some(&lost)));

    network.hosts[survivors[0]]
        .set(&key, fields(json!({"after": "split"})))
        .unwrap();
    network.run();
    assert_eq!(
        network.fields(survivors[1], &key),
        network.fields(survivors[0], &key)
    );
}

#[test]
fn mutations_filter_skips_membership_events() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    let log = Log::default();
    {
        let log = log.clone();
        network.hosts[a]
            .stream()
            .on(Filter::parse(MUTATIONS).unwrap(), move |op: Option<&Op>| {
                if let Some(op) = op {
                    log.borrow_mut().push(op.spec.method().unwrap().to_string());
                }
                Flow::Continue
            });
    }
    network.connect(a, b);
    network.run();
    let key = network.hosts[a].create(model::MODEL, Map::new()).unwrap();
    network.hosts[a].set(&key, fields(json!({"x": 1}))).unwrap();
    network.run();
    assert_eq!(*log.borrow(), vec!["init", "set"]);
}

#[test]
fn set_collection_lists_references() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let host = &mut network.hosts[a];
    let first = host.create(model::MODEL, Map::new()).unwrap();
    let second = host.create(model::MODEL, Map::new()).unwrap();
    let set = host.create(model::SET_TYPE, Map::new()).unwrap();
    host.set(
        &set,
        fields(json!({"2": second.to_string(), "1": first.to_string()})),
    )
    .unwrap();
    let refs = model::collection(host.object(&set).unwrap());
    assert_eq!(refs, vec![first.spec(), second.spec()]);
    assert!(matches!(
        host.set(&set, fields(json!({"3": 3}))),
        Err(Error::Rejected { .. })
    ));
}

#[test]
fn set_members_are_fetched_on_demand() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    network.connect_all();
    let member = network.hosts[a]
        .create(model::MODEL, fields(json!({"name": "first"})))
        .unwrap();
    let set = network.hosts[a].create(model::SET_TYPE, Map::new()).unwrap();
    network.hosts[a].set_add(&set, "one", &member).unwrap();

    network.hosts[b].get(&set.spec()).unwrap();
    network.run();
    assert_eq!(network.hosts[b].set_entry(&set, "one").unwrap(), Some(member.clone()));
    assert_eq!(network.hosts[b].set_fill_all(&set).unwrap(), vec![member.clone()]);
    network.run();
    assert_eq!(network.fields(b, &member), fields(json!({"name": "first"})));

    network.hosts[a].set_remove(&set, "one").unwrap();
    network.run();
    assert_eq!(network.hosts[b].set_entry(&set, "one").unwrap(), None);
    assert!(network.errors.is_empty(), "{:?}", network.errors);
}

#[test]
fn replica_that_edited_first_still_gets_the_initial_state() {
    setup_logging();
    let mut network = Network::new();
    let a = network.push("alice");
    let b = network.push("bob");
    let key = network.hosts[a]
        .create(model::MODEL, fields(json!({"title": "draft"})))
        .unwrap();
    // bob knows the object only by name and writes to it while alone
    network.hosts[b].get(&key.spec()).unwrap();
    network.hosts[b].set(&key, fields(json!({"done": true}))).unwrap();

    network.connect(a, b);
    network.run();
    let expected = fields(json!({"title": "draft", "done": true}));
    assert_eq!(network.fields(a, &key), expected);
    assert_eq!(network.fields(b, &key), expected);
    assert!(network.errors.is_empty(), "{:?}", network.errors);
}

#[test]
fn late_reon_from_an_abandoned_uplink_is_ignored() {
    setup_logging();
    let mut network = Network::new();
    let m = network.push("mmm");
    let x = network.push("xxx");
    let y = network.push("yyy");
    let (idm, idx, idy) = (network.id(m), network.id(x), network.id(y));
    let router = swarm_syncable::router::Router::new(Config::default().hash_points);
    // an object both peers are closer to than m, y the closest
    let key: ObjectKey = (0..10_000)
        .map(|i| format!("/Model#o{i}").parse::<ObjectKey>().unwrap())
        .find(|key| router.available_uplinks(&key.spec(), &idm, [&idx, &idy]) == vec![idy.clone(), idx.clone()])
        .expect("no object routes through y then x");

    network.connect(m, x);
    network.run();
    // m asks x while the handshake with y is still in flight
    network.connect(m, y);
    network.hosts[m].get(&key.spec()).unwrap();
    assert_eq!(
        network.hosts[m].object(&key).unwrap().uplink(),
        &Uplink::Pending(idx.clone())
    );
    network.run();

    assert!(network.errors.is_empty(), "{:?}", network.errors);
    assert_eq!(
        network.hosts[m].object(&key).unwrap().uplink(),
        &Uplink::Established(idy)
    );
    assert!(network.hosts[y]
        .object(&key)
        .unwrap()
        .is_subscribed(&SubscriberId::Peer(idm.clone())));
    assert!(!network.hosts[x]
        .object(&key)
        .unwrap()
        .is_subscribed(&SubscriberId::Peer(idm)));

    network.hosts[y].set(&key, fields(json!({"late": 1}))).unwrap();
    network.run();
    assert_eq!(network.fields(m, &key)["late"], json!(1));
}

#[test]
fn gc_keeps_linked_replicas() {
    setup_logging();
    let (mut network, key) = three_hosts();
    let root = network.root(&key);
    for i in (0..3).filter(|i| *i != root) {
        assert!(network.hosts[i].gc().is_empty());
        assert!(network.hosts[i].object(&key).is_some());
    }
    assert!(network.hosts[root].gc().is_empty());
}
