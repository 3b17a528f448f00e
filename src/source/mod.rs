//! Shared-state objects consumed by block kernels through links.
//!
//! A [`Source`] is a named piece of mutable state shared by every block linked
//! to it. Kinds that declare mutex discipline are locked by the executor for
//! exactly the duration of one kernel invocation; the lock is never held
//! across a send or receive on a block channel. The [`SourceKind::Server`]
//! kind is the exception: a server source owns its own synchronization and is
//! handed to kernels unlocked.

use std::collections::{BinaryHeap, VecDeque};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::message::Message;

/// The kind of shared state a source holds, and the kind a block's kernel
/// declares it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "value")]
    Value,
    #[serde(rename = "priorityQueue")]
    PriorityQueue,
    #[serde(rename = "keyValueStore")]
    KeyValueStore,
    /// Self-synchronizing: the source guarantees linearizable effects under
    /// concurrent kernel invocations without external locking.
    #[serde(rename = "server")]
    Server,
}

impl SourceKind {
    /// Kinds that the executor must lock around a kernel invocation.
    pub fn needs_lock(&self) -> bool {
        !matches!(self, SourceKind::None | SourceKind::Server)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceKind::None => "none",
            SourceKind::Value => "value",
            SourceKind::PriorityQueue => "priorityQueue",
            SourceKind::KeyValueStore => "keyValueStore",
            SourceKind::Server => "server",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("state does not match source kind {0}")]
    InvalidState(SourceKind),
}

/// An entry in a priority queue source. Highest priority pops first, ties pop
/// in insertion order.
#[derive(Debug, Clone)]
pub struct PqEntry {
    pub priority: f64,
    seq: u64,
    pub payload: Message,
}

impl PartialEq for PqEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for PqEntry {}

impl PartialOrd for PqEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PqEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The state body of a lockable source.
#[derive(Debug)]
pub enum SourceBody {
    Value(Value),
    PriorityQueue { heap: BinaryHeap<PqEntry>, seq: u64 },
    KeyValue(IndexMap<String, Value>),
}

impl SourceBody {
    fn fresh(kind: SourceKind) -> SourceBody {
        match kind {
            SourceKind::Value => SourceBody::Value(Value::Null),
            SourceKind::PriorityQueue => SourceBody::PriorityQueue {
                heap: BinaryHeap::new(),
                seq: 0,
            },
            SourceKind::KeyValueStore => SourceBody::KeyValue(IndexMap::new()),
            SourceKind::None | SourceKind::Server => unreachable!("kind has no lockable body"),
        }
    }

    pub fn push(&mut self, priority: f64, payload: Message) {
        if let SourceBody::PriorityQueue { heap, seq } = self {
            heap.push(PqEntry {
                priority,
                seq: *seq,
                payload,
            });
            *seq += 1;
        }
    }

    pub fn pop(&mut self) -> Option<PqEntry> {
        match self {
            SourceBody::PriorityQueue { heap, .. } => heap.pop(),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            SourceBody::Value(v) => v.clone(),
            SourceBody::PriorityQueue { heap, .. } => {
                let mut entries: Vec<&PqEntry> = heap.iter().collect();
                entries.sort_by(|a, b| b.cmp(a));
                Value::Array(
                    entries
                        .into_iter()
                        .map(|e| json!({ "priority": e.priority, "payload": &*e.payload }))
                        .collect(),
                )
            }
            SourceBody::KeyValue(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
        }
    }

    fn from_json(kind: SourceKind, state: Value) -> Result<SourceBody, SourceError> {
        match kind {
            SourceKind::Value => Ok(SourceBody::Value(state)),
            SourceKind::PriorityQueue => {
                let entries = state.as_array().ok_or(SourceError::InvalidState(kind))?;
                let mut body = SourceBody::fresh(kind);
                for entry in entries {
                    let priority = entry
                        .get("priority")
                        .and_then(Value::as_f64)
                        .ok_or(SourceError::InvalidState(kind))?;
                    let payload = entry
                        .get("payload")
                        .cloned()
                        .ok_or(SourceError::InvalidState(kind))?;
                    body.push(priority, Message::new(payload));
                }
                Ok(body)
            }
            SourceKind::KeyValueStore => {
                let map = state.as_object().ok_or(SourceError::InvalidState(kind))?;
                Ok(SourceBody::KeyValue(
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ))
            }
            SourceKind::None | SourceKind::Server => Err(SourceError::InvalidState(kind)),
        }
    }
}

/// A self-synchronizing inbox: the builtin server-kind source.
///
/// Producers deposit messages from any thread; `fromMailbox` kernels drain it.
/// All effects are serialized by the internal lock, which is held only for the
/// duration of a single operation, so kernels touch it without taking the
/// executor-level source lock.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    pub fn deposit(&self, message: Message) {
        self.queue.lock().push_back(message);
    }

    pub fn try_take(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }

    fn to_json(&self) -> Value {
        Value::Array(self.queue.lock().iter().map(|m| (**m).clone()).collect())
    }

    fn replace(&self, state: Value) -> Result<(), SourceError> {
        let items = state
            .as_array()
            .ok_or(SourceError::InvalidState(SourceKind::Server))?;
        let mut queue = self.queue.lock();
        queue.clear();
        queue.extend(items.iter().cloned().map(Message::new));
        Ok(())
    }
}

enum SourceInner {
    Locked(Mutex<SourceBody>),
    Server(Mailbox),
}

/// What a kernel gets to see of its attached source.
pub enum SourceAccess<'a> {
    None,
    /// The executor holds the source lock for the duration of the kernel call.
    Body(&'a mut SourceBody),
    /// Server-kind: self-synchronizing, not locked by the executor.
    Server(&'a Mailbox),
}

/// A shared-state instance, attached to blocks via links.
pub struct Source {
    kind: SourceKind,
    spec: &'static str,
    inner: SourceInner,
}

impl Source {
    pub(crate) fn new(spec: &'static SourceSpec) -> Source {
        let inner = match spec.kind {
            SourceKind::Server => SourceInner::Server(Mailbox::default()),
            kind => SourceInner::Locked(Mutex::new(SourceBody::fresh(kind))),
        };
        Source {
            kind: spec.kind,
            spec: spec.name,
            inner,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn spec(&self) -> &'static str {
        self.spec
    }

    pub fn server(&self) -> Option<&Mailbox> {
        match &self.inner {
            SourceInner::Server(mb) => Some(mb),
            SourceInner::Locked(_) => None,
        }
    }

    /// Run `f` with access to the shared state, honoring the kind's locking
    /// discipline.
    pub fn with_access<R>(&self, f: impl FnOnce(SourceAccess<'_>) -> R) -> R {
        match &self.inner {
            SourceInner::Locked(m) => {
                let mut guard = m.lock();
                f(SourceAccess::Body(&mut guard))
            }
            SourceInner::Server(mb) => f(SourceAccess::Server(mb)),
        }
    }

    /// Restore the fresh state for this kind.
    pub fn reset(&self) {
        match &self.inner {
            SourceInner::Locked(m) => *m.lock() = SourceBody::fresh(self.kind),
            SourceInner::Server(mb) => mb.clear(),
        }
    }

    /// Render the current state to JSON, for the state endpoint.
    pub fn state(&self) -> Value {
        match &self.inner {
            SourceInner::Locked(m) => m.lock().to_json(),
            SourceInner::Server(mb) => mb.to_json(),
        }
    }

    /// Replace the current state from JSON, for the state endpoint.
    pub fn set_state(&self, state: Value) -> Result<(), SourceError> {
        match &self.inner {
            SourceInner::Locked(m) => {
                *m.lock() = SourceBody::from_json(self.kind, state)?;
                Ok(())
            }
            SourceInner::Server(mb) => mb.replace(state),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("spec", &self.spec)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A source spec in the source library.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub name: &'static str,
    pub kind: SourceKind,
}

static SOURCE_LIBRARY: Lazy<Vec<SourceSpec>> = Lazy::new(|| {
    vec![
        SourceSpec {
            name: "value",
            kind: SourceKind::Value,
        },
        SourceSpec {
            name: "priorityQueue",
            kind: SourceKind::PriorityQueue,
        },
        SourceSpec {
            name: "keyValueStore",
            kind: SourceKind::KeyValueStore,
        },
        SourceSpec {
            name: "mailbox",
            kind: SourceKind::Server,
        },
    ]
});

/// Look up a source spec by name.
pub fn source_spec(name: &str) -> Option<&'static SourceSpec> {
    SOURCE_LIBRARY.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::message;
    use serde_json::json;

    #[test]
    fn priority_queue_orders_by_priority_then_fifo() {
        let mut body = SourceBody::fresh(SourceKind::PriorityQueue);
        body.push(1.0, message(json!("low")));
        body.push(5.0, message(json!("first-high")));
        body.push(5.0, message(json!("second-high")));

        assert_eq!(*body.pop().unwrap().payload, json!("first-high"));
        assert_eq!(*body.pop().unwrap().payload, json!("second-high"));
        assert_eq!(*body.pop().unwrap().payload, json!("low"));
        assert!(body.pop().is_none());
    }

    #[test]
    fn state_round_trip() {
        let source = Source::new(source_spec("keyValueStore").unwrap());
        source
            .set_state(json!({ "a": 1, "b": [2, 3] }))
            .unwrap();
        assert_eq!(source.state(), json!({ "a": 1, "b": [2, 3] }));

        source.reset();
        assert_eq!(source.state(), json!({}));
    }

    #[test]
    fn mailbox_is_fifo() {
        let mb = Mailbox::default();
        mb.deposit(message(json!(1)));
        mb.deposit(message(json!(2)));
        assert_eq!(*mb.try_take().unwrap(), json!(1));
        assert_eq!(*mb.try_take().unwrap(), json!(2));
        assert!(mb.try_take().is_none());
    }
}
