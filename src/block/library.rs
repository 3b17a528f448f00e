//! The builtin kernel library.
//!
//! A [`BlockSpec`] declares a block's pins, the shared-state kind it needs and
//! the kernel function. Kernels are pure with respect to the block: they read
//! the input map, write the output and internal maps, and may touch their
//! attached source under the executor's locking discipline. Kernels never
//! fail and never panic by contract: bad input becomes an error value on the
//! first output. Long-running kernels take the interrupt receiver so they can
//! cooperatively yield.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::channel::{Receiver, RecvTimeoutError};
use crate::graph::element::JsonType;
use crate::message::{error_message, message, MessageMap};
use crate::source::{SourceAccess, SourceBody, SourceKind};

use super::Interrupt;

/// A kernel: `(inputs, outputs, internal, source, interrupts) -> interrupt?`.
///
/// Returning an interrupt hands control back to the executor, which applies
/// it and re-runs the kernel on the next pass; returning `None` completes the
/// process phase.
pub type Kernel = fn(
    &MessageMap,
    &mut MessageMap,
    &mut MessageMap,
    SourceAccess<'_>,
    &Receiver<Interrupt>,
) -> Option<Interrupt>;

/// A pin declaration on a spec.
#[derive(Debug, Clone, Copy)]
pub struct Pin {
    pub name: &'static str,
    pub json_type: JsonType,
}

const fn pin(name: &'static str, json_type: JsonType) -> Pin {
    Pin { name, json_type }
}

/// A block spec: what the graph core consults when creating a block.
#[derive(Clone, Copy)]
pub struct BlockSpec {
    pub name: &'static str,
    pub inputs: &'static [Pin],
    pub outputs: &'static [Pin],
    pub source: SourceKind,
    pub kernel: Kernel,
}

impl std::fmt::Debug for BlockSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("source", &self.source)
            .finish()
    }
}

fn number(inputs: &MessageMap, index: usize) -> Option<f64> {
    inputs.get(&index).and_then(|m| m.as_f64())
}

fn string(inputs: &MessageMap, index: usize) -> Option<String> {
    inputs
        .get(&index)
        .and_then(|m| m.as_str())
        .map(str::to_owned)
}

fn arithmetic(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    name: &str,
    op: impl Fn(f64, f64) -> Option<f64>,
) {
    match (number(inputs, 0), number(inputs, 1)) {
        (Some(a), Some(b)) => match op(a, b) {
            Some(result) => {
                outputs.insert(0, message(json!(result)));
            }
            None => {
                outputs.insert(0, error_message(format!("{name} is undefined here")));
            }
        },
        _ => {
            outputs.insert(0, error_message(format!("{name} needs numbers")));
        }
    }
}

fn add(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    arithmetic(inputs, outputs, "addition", |a, b| Some(a + b));
    None
}

fn subtract(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    arithmetic(inputs, outputs, "subtraction", |a, b| Some(a - b));
    None
}

fn multiply(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    arithmetic(inputs, outputs, "multiplication", |a, b| Some(a * b));
    None
}

fn divide(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    arithmetic(
        inputs,
        outputs,
        "division",
        |a, b| if b == 0.0 { None } else { Some(a / b) },
    );
    None
}

fn identity(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    if let Some(value) = inputs.get(&0) {
        outputs.insert(0, value.clone());
    }
    None
}

fn log_value(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    if let Some(value) = inputs.get(&0) {
        info!("log: {}", value);
        outputs.insert(0, value.clone());
    }
    None
}

/// Emits the input after `duration` milliseconds. The sleep is a wait on the
/// interrupt channel, so the block stays editable mid-delay; an interrupt
/// restarts the delay on the next pass.
fn delay(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    interrupts: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let Some(ms) = number(inputs, 1) else {
        outputs.insert(0, error_message("delay needs a duration in milliseconds"));
        return None;
    };
    match interrupts.recv_timeout(Duration::from_millis(ms.max(0.0) as u64)) {
        Ok(interrupt) => Some(interrupt),
        Err(RecvTimeoutError::Timeout) => {
            if let Some(value) = inputs.get(&0) {
                outputs.insert(0, value.clone());
            }
            None
        }
        Err(RecvTimeoutError::Disconnected) => Some(Box::new(|_, _| false)),
    }
}

fn merge(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let objects = inputs
        .get(&0)
        .zip(inputs.get(&1))
        .and_then(|(a, b)| a.as_object().cloned().zip(b.as_object().cloned()));
    match objects {
        Some((mut a, b)) => {
            a.extend(b);
            outputs.insert(0, message(Value::Object(a)));
        }
        None => {
            outputs.insert(0, error_message("merge needs objects"));
        }
    }
    None
}

/// Emits `true` on the first message after a start or reset, `false` after.
fn first(
    _: &MessageMap,
    outputs: &mut MessageMap,
    internal: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let seen = internal.contains_key(&0);
    internal.insert(0, message(json!(true)));
    outputs.insert(0, message(json!(!seen)));
    None
}

fn parse_json(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    _: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let Some(text) = string(inputs, 0) else {
        outputs.insert(0, error_message("parseJSON needs string"));
        return None;
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => {
            outputs.insert(0, message(parsed));
        }
        Err(err) => {
            outputs.insert(0, error_message(err.to_string()));
        }
    }
    None
}

fn value_get(
    _: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    match source {
        SourceAccess::Body(SourceBody::Value(cell)) => {
            outputs.insert(0, message(cell.clone()));
        }
        _ => {
            outputs.insert(0, error_message("no value store attached"));
        }
    }
    None
}

fn value_set(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let Some(value) = inputs.get(&0) else {
        return None;
    };
    match source {
        SourceAccess::Body(SourceBody::Value(cell)) => {
            *cell = (**value).clone();
            outputs.insert(0, value.clone());
        }
        _ => {
            outputs.insert(0, error_message("no value store attached"));
        }
    }
    None
}

fn pq_push(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let (Some(payload), Some(priority)) = (inputs.get(&0), number(inputs, 1)) else {
        outputs.insert(0, error_message("pqPush needs a message and a priority"));
        return None;
    };
    match source {
        SourceAccess::Body(body) => {
            body.push(priority, payload.clone());
            outputs.insert(0, payload.clone());
        }
        _ => {
            outputs.insert(0, error_message("no priority queue attached"));
        }
    }
    None
}

fn pq_pop(
    _: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    match source {
        SourceAccess::Body(body) => match body.pop() {
            Some(entry) => {
                outputs.insert(0, entry.payload);
            }
            None => {
                outputs.insert(0, error_message("empty queue"));
            }
        },
        _ => {
            outputs.insert(0, error_message("no priority queue attached"));
        }
    }
    None
}

fn kv_get(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let Some(key) = string(inputs, 0) else {
        outputs.insert(0, error_message("kvGet needs a string key"));
        return None;
    };
    match source {
        SourceAccess::Body(SourceBody::KeyValue(map)) => match map.get(&key) {
            Some(value) => {
                outputs.insert(0, message(value.clone()));
            }
            None => {
                outputs.insert(0, error_message(format!("key {key} not found")));
            }
        },
        _ => {
            outputs.insert(0, error_message("no key-value store attached"));
        }
    }
    None
}

fn kv_set(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let (Some(key), Some(value)) = (string(inputs, 0), inputs.get(&1)) else {
        outputs.insert(0, error_message("kvSet needs a string key and a value"));
        return None;
    };
    match source {
        SourceAccess::Body(SourceBody::KeyValue(map)) => {
            map.insert(key, (**value).clone());
            outputs.insert(0, value.clone());
        }
        _ => {
            outputs.insert(0, error_message("no key-value store attached"));
        }
    }
    None
}

fn kv_clear(
    _: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    match source {
        SourceAccess::Body(SourceBody::KeyValue(map)) => {
            map.clear();
            outputs.insert(0, message(json!(true)));
        }
        _ => {
            outputs.insert(0, error_message("no key-value store attached"));
        }
    }
    None
}

fn to_mailbox(
    inputs: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    _: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let Some(value) = inputs.get(&0) else {
        return None;
    };
    match source {
        SourceAccess::Server(mailbox) => {
            mailbox.deposit(value.clone());
            outputs.insert(0, value.clone());
        }
        _ => {
            outputs.insert(0, error_message("no mailbox attached"));
        }
    }
    None
}

/// Drains the mailbox: emits one message per crank, polling with short
/// interrupt-aware waits while the mailbox is empty.
fn from_mailbox(
    _: &MessageMap,
    outputs: &mut MessageMap,
    _: &mut MessageMap,
    source: SourceAccess<'_>,
    interrupts: &Receiver<Interrupt>,
) -> Option<Interrupt> {
    let SourceAccess::Server(mailbox) = source else {
        outputs.insert(0, error_message("no mailbox attached"));
        return None;
    };
    loop {
        if let Some(value) = mailbox.try_take() {
            outputs.insert(0, value);
            return None;
        }
        match interrupts.recv_timeout(Duration::from_millis(20)) {
            Ok(interrupt) => return Some(interrupt),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Some(Box::new(|_, _| false)),
        }
    }
}

static BLOCK_LIBRARY: Lazy<Vec<BlockSpec>> = Lazy::new(|| {
    vec![
        BlockSpec {
            name: "+",
            inputs: &[Pin { name: "a", json_type: JsonType::Number }, Pin { name: "b", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Number }],
            source: SourceKind::None,
            kernel: add,
        },
        BlockSpec {
            name: "-",
            inputs: &[Pin { name: "a", json_type: JsonType::Number }, Pin { name: "b", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Number }],
            source: SourceKind::None,
            kernel: subtract,
        },
        BlockSpec {
            name: "*",
            inputs: &[Pin { name: "a", json_type: JsonType::Number }, Pin { name: "b", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Number }],
            source: SourceKind::None,
            kernel: multiply,
        },
        BlockSpec {
            name: "/",
            inputs: &[Pin { name: "a", json_type: JsonType::Number }, Pin { name: "b", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Number }],
            source: SourceKind::None,
            kernel: divide,
        },
        BlockSpec {
            name: "identity",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::None,
            kernel: identity,
        },
        BlockSpec {
            name: "log",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::None,
            kernel: log_value,
        },
        BlockSpec {
            name: "delay",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }, Pin { name: "duration", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::None,
            kernel: delay,
        },
        BlockSpec {
            name: "merge",
            inputs: &[Pin { name: "a", json_type: JsonType::Object }, Pin { name: "b", json_type: JsonType::Object }],
            outputs: &[Pin { name: "out", json_type: JsonType::Object }],
            source: SourceKind::None,
            kernel: merge,
        },
        BlockSpec {
            name: "first",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Boolean }],
            source: SourceKind::None,
            kernel: first,
        },
        BlockSpec {
            name: "parseJSON",
            inputs: &[Pin { name: "in", json_type: JsonType::String }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::None,
            kernel: parse_json,
        },
        BlockSpec {
            name: "valueGet",
            inputs: &[Pin { name: "trigger", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::Value,
            kernel: value_get,
        },
        BlockSpec {
            name: "valueSet",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::Value,
            kernel: value_set,
        },
        BlockSpec {
            name: "pqPush",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }, Pin { name: "priority", json_type: JsonType::Number }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::PriorityQueue,
            kernel: pq_push,
        },
        BlockSpec {
            name: "pqPop",
            inputs: &[Pin { name: "trigger", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::PriorityQueue,
            kernel: pq_pop,
        },
        BlockSpec {
            name: "kvGet",
            inputs: &[Pin { name: "key", json_type: JsonType::String }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::KeyValueStore,
            kernel: kv_get,
        },
        BlockSpec {
            name: "kvSet",
            inputs: &[Pin { name: "key", json_type: JsonType::String }, Pin { name: "value", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::KeyValueStore,
            kernel: kv_set,
        },
        BlockSpec {
            name: "kvClear",
            inputs: &[Pin { name: "trigger", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Boolean }],
            source: SourceKind::KeyValueStore,
            kernel: kv_clear,
        },
        BlockSpec {
            name: "toMailbox",
            inputs: &[Pin { name: "in", json_type: JsonType::Any }],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::Server,
            kernel: to_mailbox,
        },
        BlockSpec {
            name: "fromMailbox",
            inputs: &[],
            outputs: &[Pin { name: "out", json_type: JsonType::Any }],
            source: SourceKind::Server,
            kernel: from_mailbox,
        },
    ]
});

/// Look up a block spec by name.
pub fn block_spec(name: &str) -> Option<&'static BlockSpec> {
    BLOCK_LIBRARY.iter().find(|s| s.name == name)
}

/// Every builtin spec, for library listings.
pub fn block_specs() -> &'static [BlockSpec] {
    &BLOCK_LIBRARY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::message::is_error;

    fn run(spec: &BlockSpec, inputs: &[(usize, Value)]) -> MessageMap {
        let input_map: MessageMap = inputs
            .iter()
            .map(|(i, v)| (*i, message(v.clone())))
            .collect();
        let mut outputs = MessageMap::default();
        let mut internal = MessageMap::default();
        let (_tx, rx) = channel::rendezvous();
        let interrupt = (spec.kernel)(
            &input_map,
            &mut outputs,
            &mut internal,
            SourceAccess::None,
            &rx,
        );
        assert!(interrupt.is_none());
        outputs
    }

    #[test]
    fn arithmetic_kernels() {
        let out = run(block_spec("+").unwrap(), &[(0, json!(2)), (1, json!(3))]);
        assert_eq!(*out[&0], json!(5.0));

        let out = run(block_spec("/").unwrap(), &[(0, json!(1)), (1, json!(0))]);
        assert!(is_error(&out[&0]));

        let out = run(block_spec("*").unwrap(), &[(0, json!("x")), (1, json!(3))]);
        assert!(is_error(&out[&0]));
    }

    #[test]
    fn parse_json_kernel() {
        let out = run(
            block_spec("parseJSON").unwrap(),
            &[(0, json!("{\"a\": [1, 2]}"))],
        );
        assert_eq!(*out[&0], json!({ "a": [1, 2] }));

        let out = run(block_spec("parseJSON").unwrap(), &[(0, json!("{nope"))]);
        assert!(is_error(&out[&0]));

        let out = run(block_spec("parseJSON").unwrap(), &[(0, json!(42))]);
        assert!(is_error(&out[&0]));
    }

    #[test]
    fn first_uses_internal_state() {
        let spec = block_spec("first").unwrap();
        let mut outputs = MessageMap::default();
        let mut internal = MessageMap::default();
        let (_tx, rx) = channel::rendezvous();

        let inputs: MessageMap = [(0usize, message(json!("x")))].into_iter().collect();
        (spec.kernel)(
            &inputs,
            &mut outputs,
            &mut internal,
            SourceAccess::None,
            &rx,
        );
        assert_eq!(*outputs[&0], json!(true));

        outputs.clear();
        (spec.kernel)(
            &inputs,
            &mut outputs,
            &mut internal,
            SourceAccess::None,
            &rx,
        );
        assert_eq!(*outputs[&0], json!(false));
    }
}
