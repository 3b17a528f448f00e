//! The per-block execution engine.
//!
//! Every block runs in its own thread and cycles through three phases:
//! receive (fill all inputs), process (run the kernel once), broadcast
//! (deliver every output to every consumer exactly once), then cranks and
//! starts over. Each phase either completes without blocking or parks inside a
//! multi-way select that includes the block's interrupt channel, so an
//! interrupt is serviced within one kernel invocation at worst.
//!
//! An [`Interrupt`] is a callback posted by external code (the graph core) and
//! executed by the block's own thread while it holds the routing write lock:
//! it can rewire connections, set input constants, attach a source or stop the
//! block without racing the executor. A callback returning `false` terminates
//! the executor.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use fxhash::FxHashSet;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;

use crate::channel::{self, Receiver, RecvError, Selector, SendError, Sender};
use crate::graph::element::{ElementId, JsonType};
use crate::message::{message, Message, MessageMap};
use crate::source::{Source, SourceAccess, SourceKind};

pub mod library;

pub use library::{block_spec, BlockSpec, Kernel, Pin};

/// A callback applied by the executor between (or during) its phases, under
/// the routing write lock. Returning `false` stops the block.
pub type Interrupt = Box<dyn FnOnce(&mut BlockRouting, &mut BlockState) -> bool + Send>;

fn stop_interrupt() -> Interrupt {
    Box::new(|_, _| false)
}

/// One input pin. Its channel is the rendezvous point for upstream
/// connections; a set `value` turns the pin into a constant and the channel is
/// no longer read.
pub struct Input {
    pub name: &'static str,
    pub json_type: JsonType,
    pub value: Option<Value>,
    /// Kept so the channel can never disconnect while the block lives;
    /// cloned out for every incoming connection.
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// One output pin and its consumers, keyed by connection id.
pub struct Output {
    pub name: &'static str,
    pub json_type: JsonType,
    pub connections: IndexMap<ElementId, Sender<Message>>,
}

/// The routing table of a block: what interrupts mutate and phases read.
pub struct BlockRouting {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub source: Option<Arc<Source>>,
}

/// Per-crank execution state, private to the executor.
#[derive(Default)]
pub struct BlockState {
    pub input_values: MessageMap,
    pub output_values: MessageMap,
    /// Persists across cranks; cleared only by a reset.
    pub internal_values: MessageMap,
    /// `(output index, connection id)` pairs already delivered this crank.
    pub delivered: FxHashSet<(usize, ElementId)>,
    pub processed: bool,
}

impl BlockState {
    fn crank(&mut self) {
        self.input_values.clear();
        self.output_values.clear();
        self.delivered.clear();
        self.processed = false;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block is stopped")]
    Stopped,
    #[error("input out of range")]
    InputOutOfRange,
    #[error("output out of range")]
    OutputOutOfRange,
    #[error("this connection already exists on this output")]
    AlreadyConnected,
    #[error("connection does not exist")]
    NotConnected,
    #[error("invalid source kind for this block")]
    SourceMismatch,
}

/// Read-only view of an input, taken under the routing read lock.
#[derive(Debug, Clone)]
pub struct InputSnapshot {
    pub name: &'static str,
    pub json_type: JsonType,
    pub value: Option<Value>,
}

/// Read-only view of an output, taken under the routing read lock.
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    pub name: &'static str,
    pub json_type: JsonType,
    pub connections: Vec<ElementId>,
}

/// External handle to a running block: posts interrupts and reads routing
/// snapshots. The executor itself is reachable only through this.
pub struct BlockHandle {
    id: ElementId,
    spec_name: &'static str,
    source_kind: SourceKind,
    routing: Arc<RwLock<BlockRouting>>,
    interrupt_tx: Sender<Interrupt>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Start the executor thread for a fresh block built from `spec`.
pub fn spawn_block(id: ElementId, spec: &'static BlockSpec) -> BlockHandle {
    let inputs = spec
        .inputs
        .iter()
        .map(|pin| {
            let (tx, rx) = channel::rendezvous();
            Input {
                name: pin.name,
                json_type: pin.json_type,
                value: None,
                tx,
                rx,
            }
        })
        .collect();
    let outputs = spec
        .outputs
        .iter()
        .map(|pin| Output {
            name: pin.name,
            json_type: pin.json_type,
            connections: IndexMap::new(),
        })
        .collect();

    let (interrupt_tx, interrupt_rx) = channel::rendezvous();
    let routing = Arc::new(RwLock::new(BlockRouting {
        inputs,
        outputs,
        source: None,
    }));

    let executor = BlockExecutor {
        id: id.clone(),
        kernel: spec.kernel,
        source_kind: spec.source,
        routing: Arc::clone(&routing),
        interrupt_rx,
        state: BlockState::default(),
    };

    debug!("starting block {} ({})", id, spec.name);
    let join = std::thread::Builder::new()
        .name(format!("block-{id}"))
        .spawn(move || executor.serve())
        .unwrap();

    BlockHandle {
        id,
        spec_name: spec.name,
        source_kind: spec.source,
        routing,
        interrupt_tx,
        join: Mutex::new(Some(join)),
    }
}

impl BlockHandle {
    pub fn id(&self) -> &ElementId {
        &self.id
    }

    pub fn spec_name(&self) -> &'static str {
        self.spec_name
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    /// Post an interrupt and wait for its reply.
    fn interrupt<R, F>(&self, f: F) -> Result<R, BlockError>
    where
        R: Send + 'static,
        F: FnOnce(&mut BlockRouting, &mut BlockState) -> (R, bool) + Send + 'static,
    {
        let (reply_tx, reply_rx) = channel::bounded(1);
        let callback: Interrupt = Box::new(move |routing, state| {
            let (result, keep_running) = f(routing, state);
            let _ = reply_tx.send(result);
            keep_running
        });
        self.interrupt_tx
            .send(callback)
            .map_err(|_| BlockError::Stopped)?;
        reply_rx.recv().map_err(|_| BlockError::Stopped)
    }

    /// Pin an input to a constant value, or clear the constant with `None` so
    /// the input reads its channel again.
    pub fn set_input(&self, index: usize, value: Option<Value>) -> Result<(), BlockError> {
        self.interrupt(move |routing, _| match routing.inputs.get_mut(index) {
            Some(input) => {
                input.value = value;
                (Ok(()), true)
            }
            None => (Err(BlockError::InputOutOfRange), true),
        })?
    }

    /// Add a consumer to an output.
    pub fn connect(
        &self,
        index: usize,
        connection: ElementId,
        consumer: Sender<Message>,
    ) -> Result<(), BlockError> {
        self.interrupt(move |routing, _| match routing.outputs.get_mut(index) {
            Some(output) => {
                if output.connections.contains_key(&connection) {
                    (Err(BlockError::AlreadyConnected), true)
                } else {
                    output.connections.insert(connection, consumer);
                    (Ok(()), true)
                }
            }
            None => (Err(BlockError::OutputOutOfRange), true),
        })?
    }

    /// Remove a consumer from an output.
    pub fn disconnect(&self, index: usize, connection: ElementId) -> Result<(), BlockError> {
        self.interrupt(move |routing, _| match routing.outputs.get_mut(index) {
            Some(output) => {
                if output.connections.shift_remove(&connection).is_some() {
                    (Ok(()), true)
                } else {
                    (Err(BlockError::NotConnected), true)
                }
            }
            None => (Err(BlockError::OutputOutOfRange), true),
        })?
    }

    /// Attach or detach the shared-state source this block's kernel consumes.
    pub fn set_source(&self, source: Option<Arc<Source>>) -> Result<(), BlockError> {
        let declared = self.source_kind;
        self.interrupt(move |routing, _| {
            if let Some(source) = &source {
                if source.kind() != declared {
                    return (Err(BlockError::SourceMismatch), true);
                }
            }
            routing.source = source;
            (Ok(()), true)
        })?
    }

    /// Abandon the current crank and clear the internal state.
    pub fn reset(&self) -> Result<(), BlockError> {
        self.interrupt(|_, state| {
            state.crank();
            state.internal_values.clear();
            ((), true)
        })
    }

    /// Terminate the executor. Idempotent: stopping a stopped block is a
    /// no-op.
    pub fn stop(&self) {
        let _ = self.interrupt_tx.send(stop_interrupt());
    }

    /// Wait for the executor thread to exit.
    pub fn join(&self) {
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.interrupt_tx.is_disconnected()
    }

    /// Clone the rendezvous sender feeding one of this block's inputs, for
    /// wiring an upstream connection.
    pub fn input_sender(&self, index: usize) -> Result<Sender<Message>, BlockError> {
        self.routing
            .read()
            .inputs
            .get(index)
            .map(|input| input.tx.clone())
            .ok_or(BlockError::InputOutOfRange)
    }

    pub fn inputs(&self) -> Vec<InputSnapshot> {
        self.routing
            .read()
            .inputs
            .iter()
            .map(|input| InputSnapshot {
                name: input.name,
                json_type: input.json_type,
                value: input.value.clone(),
            })
            .collect()
    }

    pub fn outputs(&self) -> Vec<OutputSnapshot> {
        self.routing
            .read()
            .outputs
            .iter()
            .map(|output| OutputSnapshot {
                name: output.name,
                json_type: output.json_type,
                connections: output.connections.keys().cloned().collect(),
            })
            .collect()
    }

    pub fn source(&self) -> Option<Arc<Source>> {
        self.routing.read().source.clone()
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("spec", &self.spec_name)
            .finish()
    }
}

struct BlockExecutor {
    id: ElementId,
    kernel: Kernel,
    source_kind: SourceKind,
    routing: Arc<RwLock<BlockRouting>>,
    interrupt_rx: Receiver<Interrupt>,
    state: BlockState,
}

enum Woken {
    Input(usize, Result<Message, RecvError>),
    Interrupt(Result<Interrupt, RecvError>),
}

enum Delivery {
    Sent(Result<(), SendError<Message>>),
    Interrupt(Result<Interrupt, RecvError>),
}

impl BlockExecutor {
    /// Thread main: run the phase loop forever, restarting from a fresh crank
    /// if a kernel panics.
    fn serve(mut self) {
        loop {
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                Ok(()) => {
                    debug!("block {} stopped", self.id);
                    return;
                }
                Err(_) => {
                    error!("block {} crashed, restarting from a fresh crank", self.id);
                    self.state.crank();
                }
            }
        }
    }

    /// The phase loop. Returns when a stop interrupt is applied.
    ///
    /// The routing read lock is held across a run of phases and released
    /// before the interrupt callback takes the write lock, so interrupts
    /// observe a quiescent block.
    fn run(&mut self) {
        let routing = Arc::clone(&self.routing);
        loop {
            let interrupt;
            {
                let guard = routing.read();
                interrupt = loop {
                    if let Some(i) = self.receive(&guard) {
                        break i;
                    }
                    if let Some(i) = self.process(&guard) {
                        break i;
                    }
                    if let Some(i) = self.broadcast(&guard) {
                        break i;
                    }
                    self.state.crank();
                };
            }
            let mut guard = routing.write();
            if !interrupt(&mut guard, &mut self.state) {
                return;
            }
        }
    }

    /// Wait until every input holds a value for this crank. Constants are
    /// copied in; the rest is a select over all remaining input channels plus
    /// the interrupt channel.
    fn receive(&mut self, routing: &BlockRouting) -> Option<Interrupt> {
        loop {
            let mut pending = Vec::new();
            for (index, input) in routing.inputs.iter().enumerate() {
                if self.state.input_values.contains_key(&index) {
                    continue;
                }
                if let Some(value) = &input.value {
                    self.state
                        .input_values
                        .insert(index, message(value.clone()));
                    continue;
                }
                pending.push(index);
            }

            if pending.is_empty() {
                return None;
            }

            let mut selector = Selector::new();
            for &index in &pending {
                selector =
                    selector.recv(&routing.inputs[index].rx, move |r| Woken::Input(index, r));
            }
            selector = selector.recv(&self.interrupt_rx, Woken::Interrupt);

            match selector.wait() {
                Woken::Input(index, Ok(value)) => {
                    self.state.input_values.insert(index, value);
                }
                // inputs hold their own sender, the channel cannot disconnect
                Woken::Input(_, Err(_)) => {}
                Woken::Interrupt(Ok(interrupt)) => return Some(interrupt),
                Woken::Interrupt(Err(_)) => return Some(stop_interrupt()),
            }
        }
    }

    /// Run the kernel once per crank, under the source's locking discipline.
    fn process(&mut self, routing: &BlockRouting) -> Option<Interrupt> {
        if self.state.processed {
            return None;
        }

        // a kernel that declares a source cannot run until one is attached
        if self.source_kind != SourceKind::None && routing.source.is_none() {
            return Some(self.recv_interrupt());
        }

        let kernel = self.kernel;
        let state = &mut self.state;
        let interrupt_rx = &self.interrupt_rx;
        let interrupt = match &routing.source {
            Some(source) => source.with_access(|access| {
                kernel(
                    &state.input_values,
                    &mut state.output_values,
                    &mut state.internal_values,
                    access,
                    interrupt_rx,
                )
            }),
            None => kernel(
                &state.input_values,
                &mut state.output_values,
                &mut state.internal_values,
                SourceAccess::None,
                interrupt_rx,
            ),
        };

        if interrupt.is_some() {
            return interrupt;
        }
        self.state.processed = true;
        None
    }

    /// Deliver every produced output to every consumer exactly once per
    /// crank. Each send is a select against the interrupt channel; an output
    /// with a value but no consumers parks on the interrupt channel so the
    /// block can be rewired.
    fn broadcast(&mut self, routing: &BlockRouting) -> Option<Interrupt> {
        for (index, output) in routing.outputs.iter().enumerate() {
            let Some(value) = self.state.output_values.get(&index).cloned() else {
                continue;
            };

            if output.connections.is_empty() {
                return Some(self.recv_interrupt());
            }

            for (connection, consumer) in &output.connections {
                if self.state.delivered.contains(&(index, connection.clone())) {
                    continue;
                }

                let outcome = Selector::new()
                    .send(consumer, value.clone(), Delivery::Sent)
                    .recv(&self.interrupt_rx, Delivery::Interrupt)
                    .wait();
                match outcome {
                    Delivery::Sent(Ok(())) => {
                        self.state.delivered.insert((index, connection.clone()));
                    }
                    Delivery::Sent(Err(_)) => {
                        // consumer went away before the edge was removed: park
                        // until an interrupt rewires this output
                        debug!("block {} waiting on dead connection {}", self.id, connection);
                        return Some(self.recv_interrupt());
                    }
                    Delivery::Interrupt(Ok(interrupt)) => return Some(interrupt),
                    Delivery::Interrupt(Err(_)) => return Some(stop_interrupt()),
                }
            }
        }
        None
    }

    fn recv_interrupt(&self) -> Interrupt {
        match self.interrupt_rx.recv() {
            Ok(interrupt) => interrupt,
            Err(_) => stop_interrupt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use serde_json::json;
    use std::time::Duration;

    fn spec(name: &str) -> &'static BlockSpec {
        block_spec(name).unwrap()
    }

    #[test]
    fn constant_inputs_drive_a_cycle() {
        let block = spawn_block("1".into(), spec("+"));
        let (tap_tx, tap_rx) = channel::rendezvous();
        block.connect(0, "c1".into(), tap_tx).unwrap();
        block.set_input(0, Some(json!(2))).unwrap();
        block.set_input(1, Some(json!(3))).unwrap();

        let out = tap_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*out, json!(5.0));

        block.stop();
        block.join();
        assert!(block.is_stopped());
    }

    #[test]
    fn interrupts_reply_with_errors_without_stopping() {
        let block = spawn_block("2".into(), spec("identity"));
        assert_eq!(
            block.set_input(7, Some(json!(0))),
            Err(BlockError::InputOutOfRange)
        );

        let (tx, _rx) = channel::rendezvous();
        block.connect(0, "c1".into(), tx.clone()).unwrap();
        assert_eq!(
            block.connect(0, "c1".into(), tx),
            Err(BlockError::AlreadyConnected)
        );
        assert_eq!(
            block.disconnect(0, "c2".into()),
            Err(BlockError::NotConnected)
        );

        // still alive and editable after the failed calls
        block.disconnect(0, "c1".into()).unwrap();
        block.stop();
        block.join();
    }

    #[test]
    fn stop_is_idempotent() {
        let block = spawn_block("3".into(), spec("identity"));
        block.stop();
        block.join();
        block.stop();
        assert!(block.is_stopped());
    }
}
