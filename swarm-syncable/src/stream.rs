//! Filtered op streams.

use std::fmt;

use swarm_protocol::{Filter, Op};

/// Every op that changes state: no handshakes, errors or state dumps.
pub const MUTATIONS: &str = "^.on.off.error.~";
/// Subscription handshakes.
pub const HANDSHAKES: &str = ".on.off";
/// State dumps.
pub const STATES: &str = ".~";

/// What a stream callback wants after an invocation.
pub enum Flow {
    /// Stay subscribed.
    Continue,
    /// Stay subscribed, but with a different callback.
    Replace(Callback),
    /// Unsubscribe.
    Stop,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "Continue"),
            Self::Replace(_) => write!(f, "Replace(<callback>)"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// A stream callback. Receives `None` at the end of the stream.
pub type Callback = Box<dyn FnMut(Option<&Op>) -> Flow>;

/// Identifies a subscription to an [`OpStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u64);

#[derive(derive_more::Debug)]
struct Entry {
    handle: StreamHandle,
    filter: Filter,
    #[debug(skip)]
    callback: Callback,
    once: bool,
    done: bool,
}

/// Fans ops out to filtered callbacks.
///
/// Callbacks run in subscription order. Entries that unsubscribe during a pass are
/// removed once the pass is over.
#[derive(Debug, Default)]
pub struct OpStream {
    entries: Vec<Entry>,
    next_handle: u64,
}

impl OpStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `callback` for every op `filter` covers.
    pub fn on(&mut self, filter: Filter, callback: impl FnMut(Option<&Op>) -> Flow + 'static) -> StreamHandle {
        self.push(filter, Box::new(callback), false)
    }

    /// Calls `callback` for the first op `filter` covers, then unsubscribes.
    pub fn once(&mut self, filter: Filter, callback: impl FnMut(Option<&Op>) -> Flow + 'static) -> StreamHandle {
        self.push(filter, Box::new(callback), true)
    }

    /// Calls `callback` once the stream ends.
    pub fn on_end(&mut self, mut callback: impl FnMut() + 'static) -> StreamHandle {
        self.push(
            Filter::end(),
            Box::new(move |_: Option<&Op>| {
                callback();
                Flow::Stop
            }),
            true,
        )
    }

    fn push(&mut self, filter: Filter, callback: Callback, once: bool) -> StreamHandle {
        let handle = StreamHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry {
            handle,
            filter,
            callback,
            once,
            done: false,
        });
        handle
    }

    /// Removes a subscription. Returns whether it was present.
    pub fn off(&mut self, handle: StreamHandle) -> bool {
        let len = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        self.entries.len() != len
    }

    /// Removes all subscriptions.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Are there no subscriptions?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers an op, or the end of the stream, to every matching subscription.
    pub fn offer(&mut self, op: Option<&Op>) {
        let mut clear = false;
        for entry in self.entries.iter_mut() {
            if !entry.filter.covers(op.map(|op| &op.spec)) {
                continue;
            }
            match (entry.callback)(op) {
                Flow::Replace(callback) => entry.callback = callback,
                Flow::Stop => entry.done = true,
                Flow::Continue => {}
            }
            if entry.once {
                entry.done = true;
            }
            clear |= entry.done;
        }
        if clear {
            self.entries.retain(|entry| !entry.done);
        }
    }

    /// Offers several ops in order.
    pub fn offer_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a Op>) {
        for op in ops {
            self.offer(Some(op));
        }
    }

    /// Ends the stream.
    pub fn end(&mut self) {
        self.offer(None);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use serde_json::Value;
    use swarm_protocol::Spec;

    use super::*;

    fn op(spec: &str) -> Op {
        Op::new(Spec::parse(spec).unwrap(), Value::Null)
    }

    fn filter(text: &str) -> Filter {
        Filter::parse(text).unwrap()
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl FnMut(Option<&Op>) -> Flow + 'static {
        let log = log.clone();
        move |op: Option<&Op>| {
            let text = op.map(|op| op.spec.to_string()).unwrap_or_else(|| "end".into());
            log.borrow_mut().push(format!("{tag}:{text}"));
            Flow::Continue
        }
    }

    #[test]
    fn filters_select_ops() {
        let log = Log::default();
        let mut stream = OpStream::new();
        stream.on(filter(".set"), recorder(&log, "set"));
        stream.on(filter(MUTATIONS), recorder(&log, "mut"));
        stream.on(filter(HANDSHAKES), recorder(&log, "hs"));
        stream.on_end({
            let log = log.clone();
            move || log.borrow_mut().push("ended".into())
        });
        stream.offer_all(&[op("/M#a!1.set"), op("/M#a!2.on"), op("/M#a!3.~")]);
        stream.end();
        assert_eq!(
            *log.borrow(),
            vec![
                "set:/M#a!1.set",
                "mut:/M#a!1.set",
                "hs:/M#a!2.on",
                "ended",
            ]
        );
        // on_end fires once
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn once_and_stop_unsubscribe() {
        let log = Log::default();
        let mut stream = OpStream::new();
        stream.once(filter(""), recorder(&log, "once"));
        let mut count = 0;
        let log2 = log.clone();
        stream.on(filter(""), move |_| {
            count += 1;
            log2.borrow_mut().push(format!("count:{count}"));
            if count == 2 {
                Flow::Stop
            } else {
                Flow::Continue
            }
        });
        for _ in 0..3 {
            stream.offer(Some(&op("/M#a!1.set")));
        }
        assert_eq!(*log.borrow(), vec!["once:/M#a!1.set", "count:1", "count:2"]);
        assert!(stream.is_empty());
    }

    #[test]
    fn replace_rearms() {
        let log = Log::default();
        let mut stream = OpStream::new();
        let log2 = log.clone();
        stream.on(filter(".set"), move |_| {
            log2.borrow_mut().push("first".into());
            Flow::Replace(Box::new(recorder(&log2, "second")))
        });
        stream.offer(Some(&op("/M#a!1.set")));
        stream.offer(Some(&op("/M#a!2.set")));
        assert_eq!(*log.borrow(), vec!["first", "second:/M#a!2.set"]);
    }

    #[test]
    fn off_by_handle() {
        let log = Log::default();
        let mut stream = OpStream::new();
        let handle = stream.on(filter(""), recorder(&log, "x"));
        assert!(stream.off(handle));
        assert!(!stream.off(handle));
        stream.offer(Some(&op("/M#a!1.set")));
        assert!(log.borrow().is_empty());
    }
}
