//! End-to-end dataflow scenarios: blocks wired through the controller,
//! values observed on tapped outputs.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use patchbay::channel::{self, Receiver};
use patchbay::graph::element::{ElementType, Envelope};
use patchbay::message::Message;
use patchbay::prelude::*;
use patchbay::runtime::Controller;

const WAIT: Duration = Duration::from_secs(5);

fn block(spec: &str) -> Envelope {
    Envelope {
        element_type: Some(ElementType::Block),
        spec: Some(spec.to_owned()),
        ..Default::default()
    }
}

fn source(spec: &str) -> Envelope {
    Envelope {
        element_type: Some(ElementType::Source),
        spec: Some(spec.to_owned()),
        ..Default::default()
    }
}

fn edge(element_type: ElementType, from: &ElementId, to: &ElementId) -> Envelope {
    Envelope {
        element_type: Some(element_type),
        source_id: Some(from.clone()),
        target_id: Some(to.clone()),
        ..Default::default()
    }
}

/// The node's routes in pin order, from its exported envelope.
fn routes_of(controller: &Controller, id: &ElementId) -> Vec<ElementId> {
    controller
        .get(id)
        .unwrap()
        .into_iter()
        .find(|e| e.id.as_ref() == Some(id))
        .unwrap()
        .routes
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect()
}

fn set_value(controller: &Controller, route: &ElementId, value: Value) {
    controller
        .update(
            route,
            &UpdateElement {
                value: Some(Some(value)),
                ..Default::default()
            },
        )
        .unwrap();
}

/// Attach a rendezvous consumer to a block output, outside the graph.
fn tap(controller: &Controller, id: &ElementId, output: usize) -> Receiver<Message> {
    let handle = controller.runtime().block(id).unwrap();
    let (tx, rx) = channel::rendezvous();
    handle.connect(output, "tap".into(), tx).unwrap();
    rx
}

#[test]
fn two_adders_chain_to_fifteen() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("+"), block("+")], None).unwrap();
    let (b1, b2) = (&ids[0], &ids[1]);
    let b1_routes = routes_of(&controller, b1);
    let b2_routes = routes_of(&controller, b2);

    // b1.out -> b2.a
    controller
        .create(
            vec![edge(ElementType::Connection, &b1_routes[2], &b2_routes[0])],
            None,
        )
        .unwrap();

    set_value(&controller, &b1_routes[0], json!(2));
    set_value(&controller, &b1_routes[1], json!(3));
    set_value(&controller, &b2_routes[1], json!(10));

    let rx = tap(&controller, b2, 0);
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(15.0));
}

#[test]
fn deleting_an_upstream_block_stops_it_and_leaves_the_peer() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("+"), block("+")], None).unwrap();
    let (b1, b2) = (&ids[0], &ids[1]);
    let b1_routes = routes_of(&controller, b1);
    let b2_routes = routes_of(&controller, b2);
    let conn = controller
        .create(
            vec![edge(ElementType::Connection, &b1_routes[2], &b2_routes[0])],
            None,
        )
        .unwrap()
        .remove(0);

    set_value(&controller, &b1_routes[0], json!(1));
    set_value(&controller, &b1_routes[1], json!(1));

    let b1_handle = controller.runtime().block(b1).unwrap();
    controller.batch_delete(&[b1.clone()]).unwrap();

    // the executor terminates and the connection is gone from the model
    b1_handle.join();
    assert!(b1_handle.is_stopped());
    assert!(controller.get(b1).is_err());
    assert!(controller.get(&conn).is_err());

    // the downstream block is still alive, parked on its input
    let b2_handle = controller.runtime().block(b2).unwrap();
    assert!(!b2_handle.is_stopped());
}

#[test]
fn value_source_feeds_value_get() {
    let controller = Controller::new();
    let ids = controller
        .create(vec![source("value"), block("valueGet")], None)
        .unwrap();
    let (cell, getter) = (&ids[0], &ids[1]);
    let cell_out = routes_of(&controller, cell)[0].clone();
    let getter_routes = routes_of(&controller, getter);
    let pin = getter_routes.last().unwrap().clone();

    controller
        .create(vec![edge(ElementType::Link, &cell_out, &pin)], None)
        .unwrap();
    controller.set_state(cell, json!(42)).unwrap();
    set_value(&controller, &getter_routes[0], json!(true));

    let rx = tap(&controller, getter, 0);
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(42));
    assert_eq!(controller.get_state(cell).unwrap(), json!(42));
}

#[test]
fn mailbox_source_is_drained_without_locking() {
    let controller = Controller::new();
    let ids = controller
        .create(vec![source("mailbox"), block("fromMailbox")], None)
        .unwrap();
    let (mailbox, reader) = (&ids[0], &ids[1]);
    let mailbox_out = routes_of(&controller, mailbox)[0].clone();
    let pin = routes_of(&controller, reader).last().unwrap().clone();
    controller
        .create(vec![edge(ElementType::Link, &mailbox_out, &pin)], None)
        .unwrap();

    let instance = controller.runtime().source(mailbox).unwrap();
    let server = instance.server().unwrap();
    server.deposit(Message::new(json!("hello")));
    server.deposit(Message::new(json!("world")));

    let rx = tap(&controller, reader, 0);
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!("hello"));
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!("world"));
}

#[test]
fn reset_clears_internal_state() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("first")], None).unwrap();
    let first = &ids[0];
    let routes = routes_of(&controller, first);
    set_value(&controller, &routes[0], json!("tick"));

    let rx = tap(&controller, first, 0);
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(true));
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(false));

    controller.batch_reset(&[first.clone()]).unwrap();
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(true));
}

#[test]
fn stop_lands_under_full_output_pressure() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("+")], None).unwrap();
    let adder = &ids[0];
    let routes = routes_of(&controller, adder);
    set_value(&controller, &routes[0], json!(1));
    set_value(&controller, &routes[1], json!(1));

    // read once, then leave the block stuck mid-broadcast
    let rx = tap(&controller, adder, 0);
    assert_eq!(*rx.recv_timeout(WAIT).unwrap(), json!(2.0));

    let handle = controller.runtime().block(adder).unwrap();
    let started = Instant::now();
    controller.batch_delete(&[adder.clone()]).unwrap();
    handle.join();
    assert!(handle.is_stopped());
    assert!(started.elapsed() < WAIT);
}

#[test]
fn a_sleeping_delay_kernel_yields_to_interrupts() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("delay")], None).unwrap();
    let delay = &ids[0];
    let routes = routes_of(&controller, delay);
    set_value(&controller, &routes[0], json!("payload"));
    // a minute-long sleep: far longer than this test is allowed to take
    set_value(&controller, &routes[1], json!(60_000));

    let handle = controller.runtime().block(delay).unwrap();
    let started = Instant::now();
    controller.batch_delete(&[delay.clone()]).unwrap();
    handle.join();
    assert!(handle.is_stopped());
    assert!(started.elapsed() < WAIT);
}

#[test]
fn kernel_errors_become_error_values() {
    let controller = Controller::new();
    let ids = controller.create(vec![block("/")], None).unwrap();
    let divider = &ids[0];
    let routes = routes_of(&controller, divider);
    set_value(&controller, &routes[0], json!(1));
    set_value(&controller, &routes[1], json!(0));

    let rx = tap(&controller, divider, 0);
    let out = rx.recv_timeout(WAIT).unwrap();
    assert!(patchbay::message::is_error(&out));
}
