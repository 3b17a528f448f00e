//! Executor registry and the controller gluing the graph to it.
//!
//! Mutations on the [`Graph`] stage [`RuntimeOp`]s instead of touching
//! executors directly. The [`Controller`] runs every transaction under the
//! graph mutex, drains the staged operations, releases the mutex and only
//! then performs the interrupt round-trips, so the graph lock is never held
//! across a blocking call into a block.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::block::{spawn_block, BlockHandle, BlockSpec};
use crate::channel::{self, Receiver};
use crate::graph::element::{ElementId, Element, Envelope, UpdateElement};
use crate::graph::{Graph, GraphError};
use crate::pubsub::{Diff, SubscriptionId};
use crate::source::{Source, SourceSpec};

/// One deferred effect of a graph transaction on the running dataflow.
#[derive(Debug)]
pub enum RuntimeOp {
    SpawnBlock {
        id: ElementId,
        spec: &'static BlockSpec,
    },
    SpawnSource {
        id: ElementId,
        spec: &'static SourceSpec,
    },
    Connect {
        connection: ElementId,
        from: ElementId,
        output: usize,
        to: ElementId,
        input: usize,
    },
    Disconnect {
        connection: ElementId,
        from: ElementId,
        output: usize,
    },
    SetInput {
        block: ElementId,
        input: usize,
        value: Option<Value>,
    },
    SetSource {
        block: ElementId,
        source: Option<ElementId>,
    },
    Reset {
        id: ElementId,
    },
    Stop {
        id: ElementId,
    },
    DropSource {
        id: ElementId,
    },
}

/// The live side of the graph: executors and source instances by element id.
#[derive(Default)]
pub struct Runtime {
    blocks: Mutex<FxHashMap<ElementId, Arc<BlockHandle>>>,
    sources: Mutex<FxHashMap<ElementId, Arc<Source>>>,
}

impl Runtime {
    pub fn block(&self, id: &ElementId) -> Option<Arc<BlockHandle>> {
        self.blocks.lock().get(id).cloned()
    }

    pub fn source(&self, id: &ElementId) -> Option<Arc<Source>> {
        self.sources.lock().get(id).cloned()
    }

    /// Apply drained operations in order. Must not be called while the graph
    /// lock is held: several of these block on an interrupt reply.
    pub fn apply(&self, ops: Vec<RuntimeOp>) {
        for op in ops {
            self.apply_one(op);
        }
    }

    fn apply_one(&self, op: RuntimeOp) {
        match op {
            RuntimeOp::SpawnBlock { id, spec } => {
                let handle = Arc::new(spawn_block(id.clone(), spec));
                self.blocks.lock().insert(id, handle);
            }
            RuntimeOp::SpawnSource { id, spec } => {
                self.sources.lock().insert(id, Arc::new(Source::new(spec)));
            }
            RuntimeOp::Connect {
                connection,
                from,
                output,
                to,
                input,
            } => {
                let (Some(from), Some(to)) = (self.block(&from), self.block(&to)) else {
                    warn!("connection {connection} addresses a missing block");
                    return;
                };
                let consumer = match to.input_sender(input) {
                    Ok(consumer) => consumer,
                    Err(err) => {
                        warn!("connection {connection}: {err}");
                        return;
                    }
                };
                if let Err(err) = from.connect(output, connection.clone(), consumer) {
                    warn!("connection {connection}: {err}");
                }
            }
            RuntimeOp::Disconnect {
                connection,
                from,
                output,
            } => {
                if let Some(from) = self.block(&from) {
                    if let Err(err) = from.disconnect(output, connection.clone()) {
                        warn!("disconnect {connection}: {err}");
                    }
                }
            }
            RuntimeOp::SetInput {
                block,
                input,
                value,
            } => {
                if let Some(handle) = self.block(&block) {
                    if let Err(err) = handle.set_input(input, value) {
                        warn!("set input on {block}: {err}");
                    }
                }
            }
            RuntimeOp::SetSource { block, source } => {
                let instance = source.as_ref().and_then(|id| self.source(id));
                if let Some(handle) = self.block(&block) {
                    if let Err(err) = handle.set_source(instance) {
                        warn!("set source on {block}: {err}");
                    }
                }
            }
            RuntimeOp::Reset { id } => {
                if let Some(handle) = self.block(&id) {
                    if let Err(err) = handle.reset() {
                        warn!("reset {id}: {err}");
                    }
                } else if let Some(source) = self.source(&id) {
                    source.reset();
                }
            }
            RuntimeOp::Stop { id } => {
                if let Some(handle) = self.blocks.lock().remove(&id) {
                    handle.stop();
                }
            }
            RuntimeOp::DropSource { id } => {
                self.sources.lock().remove(&id);
            }
        }
    }
}

/// The semantic operations the control surface invokes.
///
/// Each call is one transaction: lock the graph, mutate, drain the staged
/// runtime ops, unlock, then drive the executors. A failed transaction
/// discards its staged ops and leaves both model and runtime untouched.
pub struct Controller {
    graph: Mutex<Graph>,
    runtime: Runtime,
}

impl Controller {
    pub fn new() -> Controller {
        Controller {
            graph: Mutex::new(Graph::new()),
            runtime: Runtime::default(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn transact<R>(
        &self,
        f: impl FnOnce(&mut Graph) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        let mut graph = self.graph.lock();
        match f(&mut graph) {
            Ok(result) => {
                let ops = graph.drain_ops();
                drop(graph);
                self.runtime.apply(ops);
                Ok(result)
            }
            Err(err) => {
                graph.discard_ops();
                Err(err)
            }
        }
    }

    pub fn create(
        &self,
        drafts: Vec<Envelope>,
        parent: Option<ElementId>,
    ) -> Result<Vec<ElementId>, GraphError> {
        self.transact(|graph| graph.create(drafts, parent))
    }

    pub fn get(&self, id: &ElementId) -> Result<Vec<Envelope>, GraphError> {
        self.graph.lock().get(id)
    }

    pub fn get_all(&self) -> Vec<Envelope> {
        self.graph.lock().get_all()
    }

    pub fn update(&self, id: &ElementId, patch: &UpdateElement) -> Result<(), GraphError> {
        self.transact(|graph| graph.update(id, patch))
    }

    pub fn update_group_route(
        &self,
        group: &ElementId,
        route: &ElementId,
        patch: &UpdateElement,
    ) -> Result<(), GraphError> {
        self.transact(|graph| graph.update_group_route(group, route, patch))
    }

    pub fn batch_translate(&self, ids: &[ElementId], dx: i64, dy: i64) -> Result<(), GraphError> {
        self.transact(|graph| graph.batch_translate(ids, dx, dy))
    }

    pub fn batch_delete(&self, ids: &[ElementId]) -> Result<(), GraphError> {
        self.transact(|graph| graph.batch_delete(ids))
    }

    pub fn batch_ungroup(&self, ids: &[ElementId]) -> Result<(), GraphError> {
        self.transact(|graph| graph.batch_ungroup(ids))
    }

    pub fn batch_reset(&self, ids: &[ElementId]) -> Result<(), GraphError> {
        self.transact(|graph| graph.batch_reset(ids))
    }

    /// Element-specific state: a block's input snapshot, a source's body.
    pub fn get_state(&self, id: &ElementId) -> Result<Value, GraphError> {
        let graph = self.graph.lock();
        match graph.element(id) {
            Some(Element::Block(_)) => {
                drop(graph);
                let handle = self
                    .runtime
                    .block(id)
                    .ok_or_else(|| GraphError::Internal(format!("block {id} has no executor")))?;
                let mut inputs = Map::new();
                for input in handle.inputs() {
                    inputs.insert(
                        input.name.to_owned(),
                        input.value.unwrap_or(Value::Null),
                    );
                }
                Ok(Value::Object(Map::from_iter([(
                    "inputs".to_owned(),
                    Value::Object(inputs),
                )])))
            }
            Some(Element::Source(_)) => {
                drop(graph);
                let source = self
                    .runtime
                    .source(id)
                    .ok_or_else(|| GraphError::Internal(format!("source {id} has no instance")))?;
                Ok(source.state())
            }
            Some(_) => Err(GraphError::Validation(format!("{id} carries no state"))),
            None => Err(GraphError::NotFound(id.clone())),
        }
    }

    /// Replace a source's state. Blocks own their state exclusively and
    /// reject writes.
    pub fn set_state(&self, id: &ElementId, state: Value) -> Result<(), GraphError> {
        let graph = self.graph.lock();
        match graph.element(id) {
            Some(Element::Source(_)) => {
                drop(graph);
                let source = self
                    .runtime
                    .source(id)
                    .ok_or_else(|| GraphError::Internal(format!("source {id} has no instance")))?;
                source
                    .set_state(state)
                    .map_err(|err| GraphError::Validation(err.to_string()))
            }
            Some(_) => Err(GraphError::Validation(format!(
                "{id} does not accept state writes"
            ))),
            None => Err(GraphError::NotFound(id.clone())),
        }
    }

    /// Open a diff stream on a topic: an element id, or `/announce`.
    pub fn subscribe(&self, topic: &str) -> Result<(SubscriptionId, Receiver<Diff>), GraphError> {
        let (tx, rx) = channel::unbounded();
        let subscription = self.subscribe_with(topic, tx)?;
        Ok((subscription, rx))
    }

    /// Subscribe an existing channel, so one consumer can follow several
    /// topics.
    pub fn subscribe_with(
        &self,
        topic: &str,
        subscriber: crate::channel::Sender<Diff>,
    ) -> Result<SubscriptionId, GraphError> {
        self.transact(|graph| graph.subscribe(topic, subscriber))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.graph.lock().unsubscribe(subscription);
    }

    pub fn unsubscribe_all(&self, subscriptions: &[SubscriptionId]) {
        self.graph.lock().unsubscribe_all(subscriptions);
    }
}

impl Default for Controller {
    fn default() -> Self {
        Controller::new()
    }
}
