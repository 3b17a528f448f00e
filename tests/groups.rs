//! Group hierarchy: ascending exposure, hide/unhide, ungroup, translate,
//! export round-trips.

use std::time::Duration;

use patchbay::graph::element::{ChildRef, Element, ElementType, Envelope};
use patchbay::graph::Graph;
use patchbay::prelude::*;
use patchbay::pubsub::DiffAction;
use patchbay::runtime::Controller;

fn draft(element_type: ElementType) -> Envelope {
    Envelope {
        element_type: Some(element_type),
        ..Default::default()
    }
}

fn block(id: &str, spec: &str) -> Envelope {
    Envelope {
        id: Some(id.into()),
        spec: Some(spec.to_owned()),
        ..draft(ElementType::Block)
    }
}

fn group(id: &str, children: &[&str]) -> Envelope {
    Envelope {
        id: Some(id.into()),
        children: Some(
            children
                .iter()
                .map(|c| ChildRef { id: (*c).into() })
                .collect(),
        ),
        ..draft(ElementType::Group)
    }
}

fn group_entry_ids(graph: &Graph, id: &ElementId) -> Vec<ElementId> {
    match graph.element(id).unwrap() {
        Element::Group(record) => record.routes.iter().map(|r| r.id.clone()).collect(),
        _ => unreachable!(),
    }
}

/// A doubly nested graph: outer > inner > block.
fn nested() -> (Graph, Vec<ElementId>) {
    let mut graph = Graph::new();
    let ids = graph
        .create(
            vec![
                block("b", "+"),
                group("inner", &["b"]),
                group("outer", &["inner"]),
            ],
            None,
        )
        .unwrap();
    graph.discard_ops();
    (graph, ids)
}

#[test]
fn exposed_routes_stay_in_id_order() {
    let (graph, ids) = nested();
    for group in &ids[1..] {
        let entries = group_entry_ids(&graph, group);
        let mut sorted = entries.clone();
        sorted.sort();
        assert_eq!(entries, sorted);
        assert_eq!(entries.len(), 3);
    }
}

#[test]
fn hiding_withdraws_from_ancestors_but_not_the_group() {
    let (mut graph, _) = nested();
    let route = group_entry_ids(&graph, &"inner".into())[0].clone();

    let hide = UpdateElement {
        hidden: Some(true),
        ..Default::default()
    };
    graph
        .update_group_route(&"inner".into(), &route, &hide)
        .unwrap();

    // the inner group keeps the entry, the outer group loses it
    assert!(group_entry_ids(&graph, &"inner".into()).contains(&route));
    assert!(!group_entry_ids(&graph, &"outer".into()).contains(&route));
    let exposing = graph.route_elements(&route).unwrap();
    assert!(exposing.contains(&"inner".into()));
    assert!(!exposing.contains(&"outer".into()));

    // unhide restores the ancestor exposure set
    let unhide = UpdateElement {
        hidden: Some(false),
        ..Default::default()
    };
    graph
        .update_group_route(&"inner".into(), &route, &unhide)
        .unwrap();
    assert!(group_entry_ids(&graph, &"outer".into()).contains(&route));
    assert!(graph
        .route_elements(&route)
        .unwrap()
        .contains(&"outer".into()));
}

#[test]
fn unhide_carries_the_alias_over() {
    let (mut graph, _) = nested();
    let route = group_entry_ids(&graph, &"inner".into())[0].clone();

    let name = UpdateElement {
        alias: Some("trigger".to_owned()),
        ..Default::default()
    };
    graph
        .update_group_route(&"inner".into(), &route, &name)
        .unwrap();
    for hidden in [true, false] {
        let patch = UpdateElement {
            hidden: Some(hidden),
            ..Default::default()
        };
        graph
            .update_group_route(&"inner".into(), &route, &patch)
            .unwrap();
    }

    match graph.element(&"inner".into()).unwrap() {
        Element::Group(record) => {
            let entry = record.route_entry(&route).unwrap();
            assert_eq!(entry.alias, "trigger");
            assert!(!entry.hidden);
        }
        _ => unreachable!(),
    }
}

#[test]
fn export_omits_hidden_routes() {
    let (mut graph, _) = nested();
    let route = group_entry_ids(&graph, &"inner".into())[1].clone();

    let listed = |graph: &Graph| -> Vec<ElementId> {
        let exported = graph.get(&"inner".into()).unwrap();
        let envelope = exported
            .iter()
            .find(|e| e.id.as_ref() == Some(&"inner".into()))
            .unwrap();
        envelope
            .routes
            .as_ref()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect()
    };

    assert!(listed(&graph).contains(&route));
    graph
        .update_group_route(
            &"inner".into(),
            &route,
            &UpdateElement {
                hidden: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!listed(&graph).contains(&route));

    graph
        .update_group_route(
            &"inner".into(),
            &route,
            &UpdateElement {
                hidden: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(listed(&graph).contains(&route));
}

#[test]
fn ungroup_reparents_children() {
    let (mut graph, _) = nested();
    graph.batch_ungroup(&["inner".into()]).unwrap();
    graph.discard_ops();

    assert!(graph.element(&"inner".into()).is_none());
    assert_eq!(graph.parent_of(&"b".into()), Some(&"outer".into()));
    // the block's routes are now exposed directly on outer
    assert_eq!(group_entry_ids(&graph, &"outer".into()).len(), 3);
}

#[test]
fn export_round_trips_through_a_fresh_graph() {
    let mut graph = Graph::new();
    graph
        .create(
            vec![
                block("get", "valueGet"),
                Envelope {
                    id: Some("cell".into()),
                    spec: Some("value".to_owned()),
                    ..draft(ElementType::Source)
                },
                group("g", &["get", "cell"]),
            ],
            None,
        )
        .unwrap();
    // link the source to the block's source pin
    let pin = graph
        .element(&"get".into())
        .unwrap()
        .owned_routes()
        .last()
        .cloned()
        .unwrap();
    let out = graph.element(&"cell".into()).unwrap().owned_routes()[0].clone();
    graph
        .create(
            vec![Envelope {
                source_id: Some(out),
                target_id: Some(pin),
                ..draft(ElementType::Link)
            }],
            None,
        )
        .unwrap();
    graph.discard_ops();

    let exported = graph.get_all();
    let bytes = serde_json::to_string(&exported).unwrap();

    let mut fresh = Graph::new();
    fresh.create(exported, None).unwrap();
    fresh.discard_ops();
    assert_eq!(serde_json::to_string(&fresh.get_all()).unwrap(), bytes);
}

#[test]
fn translate_publishes_one_diff_per_parent() {
    let controller = Controller::new();
    let ids = controller
        .create(vec![block("b", "identity"), group("g", &["b"])], None)
        .unwrap();
    // let the creation diffs drain before subscribing
    std::thread::sleep(Duration::from_millis(100));

    let (_sub, rx) = controller.subscribe("g").unwrap();
    // drain the subscribe ack and seed payload
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().action,
        DiffAction::Subscribe
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().action,
        DiffAction::Create
    );

    controller
        .batch_translate(&[ids[0].clone()], 10, 20)
        .unwrap();

    let diff = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(diff.action, DiffAction::Translate);
    assert_eq!(diff.position, Some(Position { x: 10, y: 20 }));
    assert_eq!(diff.data, Some(serde_json::json!([ids[0].clone()])));
    // exactly one: nothing else arrives
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn translate_composes_additively() {
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    let mut graph = Graph::new();
    let ids = graph.create(vec![block("b", "identity")], None).unwrap();
    graph.discard_ops();

    let mut rng = SmallRng::seed_from_u64(7);
    let (mut dx, mut dy) = (0i64, 0i64);
    for _ in 0..20 {
        let (x, y) = (rng.random_range(-50..50), rng.random_range(-50..50));
        dx += x;
        dy += y;
        graph.batch_translate(&ids, x, y).unwrap();
    }

    match graph.element(&ids[0]).unwrap() {
        Element::Block(record) => {
            assert_eq!((record.position.x, record.position.y), (dx, dy));
        }
        _ => unreachable!(),
    }
}

#[test]
fn subscribing_to_a_missing_topic_instantiates_a_root_group() {
    let controller = Controller::new();
    let (_sub, rx) = controller.subscribe("workspace").unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().action,
        DiffAction::Subscribe
    );
    let seeded = controller.get(&"workspace".into()).unwrap();
    assert_eq!(seeded.len(), 1);
    assert_eq!(seeded[0].element_type, Some(ElementType::Group));
}
