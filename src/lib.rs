//! Patchbay is a live dataflow runtime: a hierarchical, editable graph of
//! computational blocks connected by typed message channels.
//!
//! Each [`Block`](block::BlockHandle) runs in its own thread and cycles through
//! receive → process → broadcast, exchanging messages with its peers over
//! rendezvous channels. Every blocking point multiplexes the block's interrupt
//! channel, so the graph can be rewired while the dataflow is running: the
//! [`Graph`](graph::Graph) validates and applies edits transactionally,
//! publishes minimal diffs to subscribers through [`PubSub`](pubsub::PubSub),
//! and drives the executors through interrupts.
//!
//! The [`Controller`](runtime::Controller) ties the pieces together and is what
//! the HTTP/WebSocket control surface in [`server`] talks to.
//!
//! ```no_run
//! use patchbay::prelude::*;
//!
//! let controller = Controller::new();
//! let ids = controller
//!     .create(
//!         vec![Envelope {
//!             element_type: Some(ElementType::Block),
//!             spec: Some("+".into()),
//!             ..Default::default()
//!         }],
//!         None,
//!     )
//!     .unwrap();
//! println!("created {:?}", ids);
//! ```

#[macro_use]
extern crate tracing;

pub mod block;
pub mod channel;
pub mod graph;
pub mod message;
pub mod pubsub;
pub mod runtime;
pub mod server;
pub mod source;

pub use graph::element::{Direction, ElementId, ElementType, Envelope, JsonType, Position};
pub use graph::{Graph, GraphError};
pub use runtime::Controller;
pub use source::SourceKind;

/// Handy re-exports for consumers of the crate.
pub mod prelude {
    pub use crate::graph::element::{
        Direction, ElementId, ElementType, Envelope, JsonType, Position, UpdateElement,
    };
    pub use crate::graph::{Graph, GraphError};
    pub use crate::message::{Message, MessageMap};
    pub use crate::runtime::Controller;
    pub use crate::source::SourceKind;
}
