//! Message values exchanged between blocks.

use std::sync::Arc;

use fxhash::FxHashMap;
use serde_json::{json, Value};

/// A message travelling over a connection.
///
/// Messages are immutable once emitted: a broadcast delivers the same value to
/// every consumer, so sharing is safe and cloning is a pointer copy.
pub type Message = Arc<Value>;

/// Per-crank value store keyed by route index.
///
/// Used for a block's received inputs, its produced outputs and its internal
/// state. Input and output maps are cleared on every crank, the internal map
/// persists until a reset.
pub type MessageMap = FxHashMap<usize, Message>;

/// Wrap a JSON value into a [`Message`].
pub fn message(value: Value) -> Message {
    Arc::new(value)
}

/// Kernels never fail: they encode errors as a value on their first output.
pub fn error_message(reason: impl Into<String>) -> Message {
    Arc::new(json!({ "error": reason.into() }))
}

/// True if the value is an error emitted by [`error_message`].
pub fn is_error(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key("error"))
}
