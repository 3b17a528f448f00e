//! The authoritative in-memory graph model.
//!
//! The graph owns every element record, the parent relation, the
//! route-to-edge and route-to-element indexes and the identity counter. All
//! mutations are transactional: a batch is validated and planned up front,
//! then applied without failure paths, so a validation error leaves the model
//! untouched. Each mutation publishes minimal diffs scoped by element
//! identity through [`PubSub`], and stages runtime operations (spawns,
//! interrupts) that the [`Controller`](crate::runtime::Controller) applies
//! only after the graph lock is released.

use std::collections::BTreeSet;

use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::block::library::{self, BlockSpec};
use crate::channel::Sender;
use crate::pubsub::{Diff, DiffAction, PubSub, SubscriptionId, ANNOUNCE};
use crate::runtime::RuntimeOp;
use crate::source::{self, SourceKind, SourceSpec};

pub mod element;
mod export;

use element::{
    BlockRecord, ConnectionRecord, Direction, Element, ElementId, ElementType, Envelope,
    GroupRecord, GroupRouteRef, JsonType, LinkRecord, Position, RouteRecord, SourceRecord,
    UpdateElement,
};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("element {0} not found")]
    NotFound(ElementId),
    #[error("invalid element {index} in batch: {reason}")]
    Invalid { index: usize, reason: String },
    #[error("{0}")]
    Validation(String),
    #[error("this connection already exists")]
    Conflict,
    #[error("internal error: {0}")]
    Internal(String),
}

fn invalid(index: usize, reason: impl Into<String>) -> GraphError {
    GraphError::Invalid {
        index,
        reason: reason.into(),
    }
}

/// Where a route sits on its owning node; used to address executor
/// interrupts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PinKind {
    Input(usize),
    Output(usize),
    SourcePin,
    SourceOut,
}

#[derive(Debug, Clone)]
pub(crate) struct PinRef {
    pub node: ElementId,
    pub kind: PinKind,
}

/// Runtime effects staged during a transaction; resolved against the model
/// and drained after it commits.
enum Pending {
    Op(RuntimeOp),
    ConnectRoutes {
        connection: ElementId,
        source_route: ElementId,
        target_route: ElementId,
    },
    LinkRoutes {
        link: ElementId,
        source_route: ElementId,
        target_route: ElementId,
    },
    SetRouteConstant {
        route: ElementId,
        value: Option<Value>,
    },
}

pub struct Graph {
    elements: IndexMap<ElementId, Element>,
    parent: FxHashMap<ElementId, ElementId>,
    route_to_edge: FxHashMap<ElementId, BTreeSet<ElementId>>,
    route_to_element: FxHashMap<ElementId, BTreeSet<ElementId>>,
    route_pins: FxHashMap<ElementId, PinRef>,
    next_id: u64,
    pubsub: PubSub,
    pending: Vec<Pending>,
}

/// A view of a route visible to a create batch: either an existing record or
/// an in-batch draft.
struct RouteProbe {
    name: String,
    direction: Direction,
    json_type: JsonType,
    source: Option<SourceKind>,
    value: Option<Value>,
}

/// The validated, apply-ready form of one create draft.
enum Plan {
    Route(RouteRecord),
    Block {
        record: BlockRecord,
        spec: &'static BlockSpec,
        synthesized: Vec<RouteRecord>,
        constants: Vec<(ElementId, Value)>,
    },
    Source {
        record: SourceRecord,
        spec: &'static SourceSpec,
        synthesized: Vec<RouteRecord>,
    },
    Group {
        record: GroupRecord,
        declared_routes: Vec<(ElementId, Option<bool>, Option<String>)>,
        children: Vec<ElementId>,
    },
    Connection(ConnectionRecord),
    Link(LinkRecord),
}

impl Plan {
    fn id(&self) -> &ElementId {
        match self {
            Plan::Route(r) => &r.id,
            Plan::Block { record, .. } => &record.id,
            Plan::Source { record, .. } => &record.id,
            Plan::Group { record, .. } => &record.id,
            Plan::Connection(c) => &c.id,
            Plan::Link(l) => &l.id,
        }
    }

    fn is_node(&self) -> bool {
        matches!(
            self,
            Plan::Block { .. } | Plan::Source { .. } | Plan::Group { .. }
        )
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            elements: IndexMap::new(),
            parent: FxHashMap::default(),
            route_to_edge: FxHashMap::default(),
            route_to_element: FxHashMap::default(),
            route_pins: FxHashMap::default(),
            next_id: 1,
            pubsub: PubSub::new(),
            pending: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn parent_of(&self, id: &ElementId) -> Option<&ElementId> {
        self.parent.get(id)
    }

    /// Nodes currently exposing a route: its owner plus every ancestor group
    /// that has not hidden it.
    pub fn route_elements(&self, route: &ElementId) -> Option<&BTreeSet<ElementId>> {
        self.route_to_element.get(route)
    }

    /// Edges incident on a route.
    pub fn route_edges(&self, route: &ElementId) -> Option<&BTreeSet<ElementId>> {
        self.route_to_edge.get(route)
    }

    fn allocate_id(&mut self) -> ElementId {
        let id = ElementId::from(self.next_id);
        self.next_id += 1;
        id
    }

    /// Keep the counter ahead of caller-supplied numeric ids.
    fn reserve_id(&mut self, id: &ElementId) {
        if let Ok(n) = id.as_str().parse::<u64>() {
            if n >= self.next_id {
                self.next_id = n + 1;
            }
        }
    }

    fn expect(&self, id: &ElementId) -> Result<&Element, GraphError> {
        self.elements
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))
    }

    fn publish(&self, topic: &ElementId, diff: Diff) {
        self.pubsub.publish(topic.as_str(), diff);
    }

    fn envelope_value(&self, id: &ElementId) -> Option<Value> {
        self.envelope(id).and_then(|e| serde_json::to_value(e).ok())
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a batch of elements, optionally rooted under `parent`.
    ///
    /// Drafts may self-identify; an id that collides with an existing element
    /// (or an earlier draft) is reassigned, and every reference to it inside
    /// the batch is rewritten through the mapping before validation, so
    /// pasting an exported pattern is safe against id conflicts. The batch is
    /// all-or-nothing: any validation error leaves the graph unchanged.
    pub fn create(
        &mut self,
        mut drafts: Vec<Envelope>,
        parent: Option<ElementId>,
    ) -> Result<Vec<ElementId>, GraphError> {
        if let Some(parent) = &parent {
            match self.expect(parent)? {
                Element::Group(_) => {}
                _ => {
                    return Err(GraphError::Validation(format!(
                        "parent {parent} is not a group"
                    )))
                }
            }
        }

        // identity pass: allocate missing ids, rewrite colliding ones
        let mut rewrite: FxHashMap<ElementId, ElementId> = FxHashMap::default();
        let mut batch_ids: FxHashSet<ElementId> = FxHashSet::default();
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in &mut drafts {
            let id = match &draft.id {
                None => self.allocate_id(),
                Some(id) if self.elements.contains_key(id) || batch_ids.contains(id) => {
                    let fresh = self.allocate_id();
                    rewrite.insert(id.clone(), fresh.clone());
                    fresh
                }
                Some(id) => {
                    self.reserve_id(id);
                    id.clone()
                }
            };
            batch_ids.insert(id.clone());
            draft.id = Some(id.clone());
            ids.push(id);
        }

        if !rewrite.is_empty() {
            for draft in &mut drafts {
                if let Some(routes) = &mut draft.routes {
                    for route in routes {
                        if let Some(new) = rewrite.get(&route.id) {
                            route.id = new.clone();
                        }
                    }
                }
                if let Some(children) = &mut draft.children {
                    for child in children {
                        if let Some(new) = rewrite.get(&child.id) {
                            child.id = new.clone();
                        }
                    }
                }
                for reference in [&mut draft.source_id, &mut draft.target_id, &mut draft.parent] {
                    if let Some(id) = reference {
                        if let Some(new) = rewrite.get(id) {
                            *id = new.clone();
                        }
                    }
                }
            }
        }

        // validation + planning pass: all-or-nothing
        let mut plans = Vec::with_capacity(drafts.len());
        let mut batch_connections: FxHashSet<(ElementId, ElementId)> = FxHashSet::default();
        for (index, draft) in drafts.iter().enumerate() {
            plans.push(self.plan_draft(index, draft, &drafts, &mut batch_connections)?);
        }
        self.check_batch_cycles(&plans, &drafts)?;

        // apply pass A: insert records and indexes
        for plan in &plans {
            self.apply_plan(plan);
        }

        // apply pass B: attach children and parents, in draft order
        for (plan, draft) in plans.iter().zip(&drafts) {
            if let Plan::Group { children, .. } = plan {
                for child in children {
                    self.add_child(plan.id(), child)?;
                }
            }
            if plan.is_node() {
                if let Some(parent) = draft.parent.as_ref().or(parent.as_ref()) {
                    self.add_child(parent, plan.id())?;
                }
            }
        }

        // declared group-route flags are applied after the ascension that
        // created the entries
        for plan in &plans {
            if let Plan::Group {
                record,
                declared_routes,
                ..
            } = plan
            {
                self.apply_declared_routes(&record.id, declared_routes);
            }
        }

        // apply pass C: announce and edge diffs, runtime staging
        for plan in &plans {
            match plan {
                Plan::Group { record, .. } => {
                    if !self.parent.contains_key(&record.id) {
                        self.pubsub.publish(
                            ANNOUNCE,
                            Diff {
                                id: Some(record.id.clone()),
                                ..Diff::new(DiffAction::RootGroupCreate)
                            },
                        );
                    }
                }
                Plan::Connection(c) => {
                    self.publish_edge(&c.id, &c.source_id, &c.target_id, DiffAction::Create);
                    self.pending.push(Pending::ConnectRoutes {
                        connection: c.id.clone(),
                        source_route: c.source_id.clone(),
                        target_route: c.target_id.clone(),
                    });
                }
                Plan::Link(l) => {
                    self.publish_edge(&l.id, &l.source_id, &l.target_id, DiffAction::Create);
                    self.pending.push(Pending::LinkRoutes {
                        link: l.id.clone(),
                        source_route: l.source_id.clone(),
                        target_route: l.target_id.clone(),
                    });
                }
                Plan::Block { constants, .. } => {
                    for (route, value) in constants {
                        self.pending.push(Pending::SetRouteConstant {
                            route: route.clone(),
                            value: Some(value.clone()),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(ids)
    }

    fn plan_draft(
        &mut self,
        index: usize,
        draft: &Envelope,
        drafts: &[Envelope],
        batch_connections: &mut FxHashSet<(ElementId, ElementId)>,
    ) -> Result<Plan, GraphError> {
        let id = draft
            .id
            .clone()
            .ok_or_else(|| invalid(index, "draft has no id"))?;
        let Some(element_type) = draft.element_type else {
            return Err(invalid(index, "cannot create element: no type"));
        };

        if let Some(parent) = &draft.parent {
            if self.visible_type(drafts, parent) != Some(ElementType::Group) {
                return Err(invalid(index, format!("parent {parent} is not a group")));
            }
        }

        match element_type {
            ElementType::Route => {
                let name = draft
                    .name
                    .clone()
                    .ok_or_else(|| invalid(index, "route needs a name"))?;
                let direction = draft
                    .direction
                    .ok_or_else(|| invalid(index, "route needs a direction"))?;
                let json_type = draft
                    .json_type
                    .ok_or_else(|| invalid(index, "route needs a json type"))?;
                Ok(Plan::Route(RouteRecord {
                    id,
                    alias: draft.alias.clone(),
                    name,
                    direction,
                    json_type,
                    value: draft.value.clone(),
                    source: draft.source,
                }))
            }
            ElementType::Block => {
                let spec_name = draft
                    .spec
                    .as_deref()
                    .ok_or_else(|| invalid(index, "block has no spec"))?;
                let spec = library::block_spec(spec_name)
                    .ok_or_else(|| invalid(index, format!("unknown block spec {spec_name}")))?;
                let mut record = BlockRecord {
                    id: id.clone(),
                    alias: draft.alias.clone(),
                    spec: spec.name.to_owned(),
                    position: draft.position.unwrap_or_default(),
                    routes: Vec::new(),
                };
                let mut synthesized = Vec::new();
                let mut constants = Vec::new();
                match &draft.routes {
                    Some(refs) if !refs.is_empty() => {
                        let assigned = self.assign_block_routes(index, spec, refs, drafts)?;
                        for (route, value) in &assigned.constants {
                            constants.push((route.clone(), value.clone()));
                        }
                        record.routes = assigned.routes;
                    }
                    _ => {
                        for pin in spec.inputs {
                            synthesized.push(RouteRecord {
                                id: self.allocate_id(),
                                alias: None,
                                name: pin.name.to_owned(),
                                direction: Direction::Input,
                                json_type: pin.json_type,
                                value: None,
                                source: None,
                            });
                        }
                        for pin in spec.outputs {
                            synthesized.push(RouteRecord {
                                id: self.allocate_id(),
                                alias: None,
                                name: pin.name.to_owned(),
                                direction: Direction::Output,
                                json_type: pin.json_type,
                                value: None,
                                source: None,
                            });
                        }
                        if spec.source != SourceKind::None {
                            synthesized.push(RouteRecord {
                                id: self.allocate_id(),
                                alias: None,
                                name: "source".to_owned(),
                                direction: Direction::Input,
                                json_type: JsonType::Any,
                                value: None,
                                source: Some(spec.source),
                            });
                        }
                        record.routes = synthesized.iter().map(|r| r.id.clone()).collect();
                    }
                }
                Ok(Plan::Block {
                    record,
                    spec,
                    synthesized,
                    constants,
                })
            }
            ElementType::Source => {
                let spec_name = draft
                    .spec
                    .as_deref()
                    .ok_or_else(|| invalid(index, "source has no spec"))?;
                let spec = source::source_spec(spec_name)
                    .ok_or_else(|| invalid(index, format!("unknown source spec {spec_name}")))?;
                let mut record = SourceRecord {
                    id: id.clone(),
                    alias: draft.alias.clone(),
                    spec: spec.name.to_owned(),
                    position: draft.position.unwrap_or_default(),
                    routes: Vec::new(),
                };
                let mut synthesized = Vec::new();
                match &draft.routes {
                    Some(refs) if !refs.is_empty() => {
                        if refs.len() != 1 {
                            return Err(invalid(index, "source takes exactly one route"));
                        }
                        let probe = self
                            .route_probe(drafts, &refs[0].id)
                            .ok_or_else(|| invalid(index, "route reference is not visible"))?;
                        if probe.source != Some(spec.kind) {
                            return Err(invalid(index, "route is not tagged with the source kind"));
                        }
                        record.routes = vec![refs[0].id.clone()];
                    }
                    _ => {
                        synthesized.push(RouteRecord {
                            id: self.allocate_id(),
                            alias: None,
                            name: "out".to_owned(),
                            direction: Direction::Output,
                            json_type: JsonType::Any,
                            value: None,
                            source: Some(spec.kind),
                        });
                        record.routes = synthesized.iter().map(|r| r.id.clone()).collect();
                    }
                }
                Ok(Plan::Source {
                    record,
                    spec,
                    synthesized,
                })
            }
            ElementType::Group => {
                let mut declared_routes = Vec::new();
                if let Some(refs) = &draft.routes {
                    for route in refs {
                        if self.route_probe(drafts, &route.id).is_none() {
                            return Err(invalid(
                                index,
                                format!("group route {} is not visible", route.id),
                            ));
                        }
                        declared_routes.push((
                            route.id.clone(),
                            route.hidden,
                            route.alias.clone(),
                        ));
                    }
                }
                let mut children = Vec::new();
                if let Some(refs) = &draft.children {
                    for child in refs {
                        match self.visible_type(drafts, &child.id) {
                            Some(
                                ElementType::Block | ElementType::Source | ElementType::Group,
                            ) => children.push(child.id.clone()),
                            Some(_) => {
                                return Err(invalid(
                                    index,
                                    format!("child {} is not a node", child.id),
                                ))
                            }
                            None => {
                                return Err(invalid(
                                    index,
                                    format!("child {} does not exist", child.id),
                                ))
                            }
                        }
                    }
                }
                Ok(Plan::Group {
                    record: GroupRecord {
                        id,
                        alias: draft.alias.clone(),
                        position: draft.position.unwrap_or_default(),
                        routes: Vec::new(),
                        children: Vec::new(),
                    },
                    declared_routes,
                    children,
                })
            }
            ElementType::Connection => {
                let (source_id, target_id) = self.edge_endpoints(index, draft)?;
                let source = self
                    .route_probe(drafts, &source_id)
                    .ok_or_else(|| invalid(index, "source route does not exist"))?;
                let target = self
                    .route_probe(drafts, &target_id)
                    .ok_or_else(|| invalid(index, "target route does not exist"))?;
                if source.direction != Direction::Output || target.direction != Direction::Input {
                    return Err(invalid(index, "connections run output to input"));
                }
                if source.source.is_some() || target.source.is_some() {
                    return Err(invalid(index, "tagged routes only participate in links"));
                }
                if !source.json_type.compatible(&target.json_type) {
                    return Err(invalid(index, "route json types do not match"));
                }
                if self.connection_exists(&source_id, &target_id)
                    || !batch_connections.insert((source_id.clone(), target_id.clone()))
                {
                    return Err(GraphError::Conflict);
                }
                Ok(Plan::Connection(ConnectionRecord {
                    id,
                    alias: draft.alias.clone(),
                    source_id,
                    target_id,
                }))
            }
            ElementType::Link => {
                let (source_id, target_id) = self.edge_endpoints(index, draft)?;
                let source = self
                    .route_probe(drafts, &source_id)
                    .ok_or_else(|| invalid(index, "source route does not exist"))?;
                let target = self
                    .route_probe(drafts, &target_id)
                    .ok_or_else(|| invalid(index, "target route does not exist"))?;
                if source.direction != Direction::Output || target.direction != Direction::Input {
                    return Err(invalid(index, "links run output to input"));
                }
                match (source.source, target.source) {
                    (Some(a), Some(b)) if a == b => {}
                    _ => {
                        return Err(invalid(
                            index,
                            "link endpoints must be tagged with the same source kind",
                        ))
                    }
                }
                Ok(Plan::Link(LinkRecord {
                    id,
                    alias: draft.alias.clone(),
                    source_id,
                    target_id,
                }))
            }
        }
    }

    /// Reject parenting cycles declared within one batch before anything is
    /// applied, so a bad batch cannot leave the model half-mutated.
    fn check_batch_cycles(&self, plans: &[Plan], drafts: &[Envelope]) -> Result<(), GraphError> {
        let mut declared_parent: FxHashMap<ElementId, ElementId> = FxHashMap::default();
        for plan in plans {
            if let Plan::Group { record, children, .. } = plan {
                for child in children {
                    declared_parent.insert(child.clone(), record.id.clone());
                }
            }
        }
        for (plan, draft) in plans.iter().zip(drafts) {
            if plan.is_node() {
                if let Some(parent) = &draft.parent {
                    declared_parent.insert(plan.id().clone(), parent.clone());
                }
            }
        }

        for plan in plans {
            if !matches!(plan, Plan::Group { .. }) {
                continue;
            }
            let mut seen: FxHashSet<ElementId> = FxHashSet::default();
            let mut cursor = Some(plan.id().clone());
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(GraphError::Validation(
                        "grouping would create a cycle".to_owned(),
                    ));
                }
                cursor = declared_parent
                    .get(&current)
                    .cloned()
                    .or_else(|| self.parent.get(&current).cloned());
            }
        }
        Ok(())
    }

    fn edge_endpoints(
        &self,
        index: usize,
        draft: &Envelope,
    ) -> Result<(ElementId, ElementId), GraphError> {
        let source_id = draft
            .source_id
            .clone()
            .ok_or_else(|| invalid(index, "edge has no source route"))?;
        let target_id = draft
            .target_id
            .clone()
            .ok_or_else(|| invalid(index, "edge has no target route"))?;
        Ok((source_id, target_id))
    }

    fn connection_exists(&self, source: &ElementId, target: &ElementId) -> bool {
        let Some(edges) = self.route_to_edge.get(source) else {
            return false;
        };
        edges.iter().any(|edge| {
            matches!(
                self.elements.get(edge),
                Some(Element::Connection(c)) if &c.target_id == target
            )
        })
    }

    /// Resolve a route id against existing records or in-batch drafts.
    fn route_probe(&self, drafts: &[Envelope], id: &ElementId) -> Option<RouteProbe> {
        if let Some(element) = self.elements.get(id) {
            let Element::Route(route) = element else {
                return None;
            };
            return Some(RouteProbe {
                name: route.name.clone(),
                direction: route.direction,
                json_type: route.json_type,
                source: route.source,
                value: route.value.clone(),
            });
        }
        drafts
            .iter()
            .find(|d| d.id.as_ref() == Some(id) && d.element_type == Some(ElementType::Route))
            .and_then(|d| {
                Some(RouteProbe {
                    name: d.name.clone()?,
                    direction: d.direction?,
                    json_type: d.json_type?,
                    source: d.source,
                    value: d.value.clone(),
                })
            })
    }

    fn visible_type(&self, drafts: &[Envelope], id: &ElementId) -> Option<ElementType> {
        if let Some(element) = self.elements.get(id) {
            return Some(element.element_type());
        }
        drafts
            .iter()
            .find(|d| d.id.as_ref() == Some(id))
            .and_then(|d| d.element_type)
    }

    /// Match supplied routes against the spec's pins by name, direction and
    /// tag, and return them in canonical pin order.
    fn assign_block_routes(
        &self,
        index: usize,
        spec: &'static BlockSpec,
        refs: &[element::RouteRef],
        drafts: &[Envelope],
    ) -> Result<AssignedRoutes, GraphError> {
        let mut inputs: Vec<Option<ElementId>> = vec![None; spec.inputs.len()];
        let mut outputs: Vec<Option<ElementId>> = vec![None; spec.outputs.len()];
        let mut source_pin: Option<ElementId> = None;
        let mut constants = Vec::new();

        for route in refs {
            let probe = self
                .route_probe(drafts, &route.id)
                .ok_or_else(|| invalid(index, format!("route {} is not visible", route.id)))?;
            if probe.source.is_some() {
                if probe.source != Some(spec.source) {
                    return Err(invalid(index, "source pin kind does not match the spec"));
                }
                if source_pin.replace(route.id.clone()).is_some() {
                    return Err(invalid(index, "block has more than one source pin"));
                }
                continue;
            }
            let pins = match probe.direction {
                Direction::Input => spec.inputs,
                Direction::Output => spec.outputs,
            };
            let slot = pins
                .iter()
                .position(|pin| pin.name == probe.name)
                .ok_or_else(|| {
                    invalid(index, format!("spec {} has no pin {}", spec.name, probe.name))
                })?;
            let assigned = match probe.direction {
                Direction::Input => &mut inputs[slot],
                Direction::Output => &mut outputs[slot],
            };
            if assigned.replace(route.id.clone()).is_some() {
                return Err(invalid(index, format!("pin {} assigned twice", probe.name)));
            }
            if probe.direction == Direction::Input {
                if let Some(value) = probe.value {
                    constants.push((route.id.clone(), value));
                }
            }
        }

        if spec.source != SourceKind::None && source_pin.is_none() {
            return Err(invalid(index, "block is missing its source pin"));
        }

        let mut routes = Vec::with_capacity(refs.len());
        for (slot, id) in inputs.into_iter().enumerate() {
            routes.push(id.ok_or_else(|| {
                invalid(index, format!("missing input {}", spec.inputs[slot].name))
            })?);
        }
        for (slot, id) in outputs.into_iter().enumerate() {
            routes.push(id.ok_or_else(|| {
                invalid(index, format!("missing output {}", spec.outputs[slot].name))
            })?);
        }
        routes.extend(source_pin);

        Ok(AssignedRoutes { routes, constants })
    }

    fn apply_plan(&mut self, plan: &Plan) {
        match plan {
            Plan::Route(record) => self.add_route(record.clone()),
            Plan::Block {
                record,
                spec,
                synthesized,
                ..
            } => {
                for route in synthesized {
                    self.add_route(route.clone());
                }
                self.register_pins(&record.id, &record.routes, spec.inputs.len(), spec.outputs.len());
                self.elements
                    .insert(record.id.clone(), Element::Block(record.clone()));
                self.pending.push(Pending::Op(RuntimeOp::SpawnBlock {
                    id: record.id.clone(),
                    spec,
                }));
            }
            Plan::Source {
                record,
                spec,
                synthesized,
            } => {
                for route in synthesized {
                    self.add_route(route.clone());
                }
                for route in &record.routes {
                    self.route_pins.insert(
                        route.clone(),
                        PinRef {
                            node: record.id.clone(),
                            kind: PinKind::SourceOut,
                        },
                    );
                    self.route_to_element
                        .entry(route.clone())
                        .or_default()
                        .insert(record.id.clone());
                }
                self.elements
                    .insert(record.id.clone(), Element::Source(record.clone()));
                self.pending.push(Pending::Op(RuntimeOp::SpawnSource {
                    id: record.id.clone(),
                    spec,
                }));
            }
            Plan::Group { record, .. } => {
                self.elements
                    .insert(record.id.clone(), Element::Group(record.clone()));
            }
            Plan::Connection(record) => {
                for route in [&record.source_id, &record.target_id] {
                    self.route_to_edge
                        .entry(route.clone())
                        .or_default()
                        .insert(record.id.clone());
                }
                self.elements
                    .insert(record.id.clone(), Element::Connection(record.clone()));
            }
            Plan::Link(record) => {
                for route in [&record.source_id, &record.target_id] {
                    self.route_to_edge
                        .entry(route.clone())
                        .or_default()
                        .insert(record.id.clone());
                }
                self.elements
                    .insert(record.id.clone(), Element::Link(record.clone()));
            }
        }
    }

    fn add_route(&mut self, record: RouteRecord) {
        self.route_to_edge.entry(record.id.clone()).or_default();
        self.route_to_element.entry(record.id.clone()).or_default();
        self.elements.insert(record.id.clone(), Element::Route(record));
    }

    fn register_pins(&mut self, node: &ElementId, routes: &[ElementId], inputs: usize, outputs: usize) {
        for (slot, route) in routes.iter().enumerate() {
            let kind = if slot < inputs {
                PinKind::Input(slot)
            } else if slot < inputs + outputs {
                PinKind::Output(slot - inputs)
            } else {
                PinKind::SourcePin
            };
            self.route_pins.insert(
                route.clone(),
                PinRef {
                    node: node.clone(),
                    kind,
                },
            );
            self.route_to_element
                .entry(route.clone())
                .or_default()
                .insert(node.clone());
        }
    }

    fn apply_declared_routes(
        &mut self,
        group: &ElementId,
        declared: &[(ElementId, Option<bool>, Option<String>)],
    ) {
        for (route, hidden, alias) in declared {
            let parent = self.parent.get(group).cloned();
            let mut withdrew = false;
            if let Some(Element::Group(record)) = self.elements.get_mut(group) {
                if let Some(entry) = record.routes.iter_mut().find(|r| &r.id == route) {
                    if let Some(alias) = alias {
                        entry.alias = alias.clone();
                    }
                    if let Some(hidden) = hidden {
                        if *hidden && !entry.hidden {
                            entry.hidden = true;
                            withdrew = true;
                        }
                    }
                }
            }
            if withdrew {
                if let Some(parent) = parent {
                    self.delete_route_ascending(&parent, route);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Ascending route propagation
    // ------------------------------------------------------------------

    /// Expose a route on a group and, while it stays non-hidden, on every
    /// ancestor group up to the root.
    fn add_route_ascending(&mut self, group_id: &ElementId, route_id: &ElementId) {
        let mut current = Some(group_id.clone());
        while let Some(gid) = current.take() {
            let Some(Element::Group(group)) = self.elements.get_mut(&gid) else {
                return;
            };
            let (inserted, hidden) =
                match group.routes.iter().find(|entry| &entry.id == route_id) {
                    Some(entry) => (false, entry.hidden),
                    None => {
                        let at = group.routes.partition_point(|entry| entry.id < *route_id);
                        group.routes.insert(
                            at,
                            GroupRouteRef {
                                id: route_id.clone(),
                                hidden: false,
                                alias: String::new(),
                            },
                        );
                        (true, false)
                    }
                };
            if inserted {
                self.route_to_element
                    .entry(route_id.clone())
                    .or_default()
                    .insert(gid.clone());
                let data = self.envelope_value(route_id);
                self.publish(
                    &gid,
                    Diff {
                        id: Some(route_id.clone()),
                        data,
                        ..Diff::new(DiffAction::Create)
                    },
                );
            }
            if !hidden {
                current = self.parent.get(&gid).cloned();
            }
        }
    }

    /// Withdraw a route from a group and from every ancestor that saw it
    /// through a non-hidden entry.
    fn delete_route_ascending(&mut self, group_id: &ElementId, route_id: &ElementId) {
        let mut current = Some(group_id.clone());
        while let Some(gid) = current.take() {
            let Some(Element::Group(group)) = self.elements.get_mut(&gid) else {
                return;
            };
            let Some(at) = group.routes.iter().position(|entry| &entry.id == route_id) else {
                return;
            };
            let entry = group.routes.remove(at);
            if let Some(exposing) = self.route_to_element.get_mut(route_id) {
                exposing.remove(&gid);
            }
            self.publish(
                &gid,
                Diff {
                    id: Some(route_id.clone()),
                    ..Diff::new(DiffAction::Delete)
                },
            );
            if !entry.hidden {
                current = self.parent.get(&gid).cloned();
            }
        }
    }

    /// Routes a node contributes to its parent: everything it owns for blocks
    /// and sources, the non-hidden exposed set for groups.
    fn exposed_routes_of(&self, node: &ElementId) -> Vec<ElementId> {
        match self.elements.get(node) {
            Some(Element::Group(group)) => group
                .routes
                .iter()
                .filter(|entry| !entry.hidden)
                .map(|entry| entry.id.clone())
                .collect(),
            Some(element) => element.owned_routes().to_vec(),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Parent / child
    // ------------------------------------------------------------------

    pub fn add_child(
        &mut self,
        parent_id: &ElementId,
        child_id: &ElementId,
    ) -> Result<(), GraphError> {
        if parent_id == child_id {
            return Err(GraphError::Validation(
                "cannot add a node as a child of itself".to_owned(),
            ));
        }
        if !matches!(self.expect(parent_id)?, Element::Group(_)) {
            return Err(GraphError::Validation(format!(
                "parent {parent_id} is not a group"
            )));
        }
        if !self.expect(child_id)?.is_node() {
            return Err(GraphError::Validation(format!(
                "{child_id} cannot be grouped"
            )));
        }
        let mut cursor = self.parent.get(parent_id).cloned();
        while let Some(ancestor) = cursor {
            if &ancestor == child_id {
                return Err(GraphError::Validation(
                    "grouping would create a cycle".to_owned(),
                ));
            }
            cursor = self.parent.get(&ancestor).cloned();
        }

        if let Some(previous) = self.parent.get(child_id).cloned() {
            self.remove_child(&previous, child_id)?;
        }

        if let Some(Element::Group(group)) = self.elements.get_mut(parent_id) {
            let at = group.children.partition_point(|c| c < child_id);
            group.children.insert(at, child_id.clone());
        }
        self.parent.insert(child_id.clone(), parent_id.clone());

        let data = self.envelope_value(child_id);
        self.publish(
            parent_id,
            Diff {
                id: Some(child_id.clone()),
                data,
                ..Diff::new(DiffAction::Create)
            },
        );

        for route in self.exposed_routes_of(child_id) {
            self.add_route_ascending(parent_id, &route);
        }
        Ok(())
    }

    pub fn remove_child(
        &mut self,
        parent_id: &ElementId,
        child_id: &ElementId,
    ) -> Result<(), GraphError> {
        if !matches!(self.expect(parent_id)?, Element::Group(_)) {
            return Err(GraphError::Validation(format!(
                "parent {parent_id} is not a group"
            )));
        }
        if self.parent.get(child_id) != Some(parent_id) {
            return Err(GraphError::Validation(format!(
                "{child_id} is not a child of {parent_id}"
            )));
        }

        for route in self.exposed_routes_of(child_id) {
            self.delete_route_ascending(parent_id, &route);
        }

        if let Some(Element::Group(group)) = self.elements.get_mut(parent_id) {
            group.children.retain(|c| c != child_id);
        }
        self.parent.remove(child_id);

        self.publish(
            parent_id,
            Diff {
                id: Some(child_id.clone()),
                ..Diff::new(DiffAction::Delete)
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    pub fn update(&mut self, id: &ElementId, patch: &UpdateElement) -> Result<(), GraphError> {
        self.expect(id)?;

        if let Some(value) = &patch.value {
            let topics = match self.elements.get_mut(id) {
                Some(Element::Route(route)) => {
                    route.value = value.clone();
                    self.route_to_element
                        .get(id)
                        .map(|set| set.iter().cloned().collect::<Vec<_>>())
                        .unwrap_or_default()
                }
                _ => {
                    return Err(GraphError::Validation(format!(
                        "{id} does not carry a value"
                    )))
                }
            };
            for topic in topics {
                self.publish(
                    &topic,
                    Diff {
                        id: Some(id.clone()),
                        value: Some(value.clone().unwrap_or(Value::Null)),
                        ..Diff::new(DiffAction::UpdateValue)
                    },
                );
            }
            self.pending.push(Pending::SetRouteConstant {
                route: id.clone(),
                value: value.clone(),
            });
        }

        if let Some(position) = patch.position {
            let updated = match self.elements.get_mut(id) {
                Some(element) => match element.position_mut() {
                    Some(slot) => {
                        *slot = position;
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if !updated {
                return Err(GraphError::Validation(format!(
                    "{id} does not have a position"
                )));
            }
            if let Some(parent) = self.parent.get(id).cloned() {
                self.publish(
                    &parent,
                    Diff {
                        id: Some(id.clone()),
                        position: Some(position),
                        ..Diff::new(DiffAction::UpdatePosition)
                    },
                );
            }
        }

        if let Some(alias) = &patch.alias {
            let mut announce_to = None;
            if let Some(element) = self.elements.get_mut(id) {
                *element.alias_mut() = Some(alias.clone());
                if element.is_node() {
                    announce_to = self.parent.get(id).cloned();
                }
            }
            if let Some(parent) = announce_to {
                self.publish(
                    &parent,
                    Diff {
                        id: Some(id.clone()),
                        alias: Some(alias.clone()),
                        ..Diff::new(DiffAction::UpdateAlias)
                    },
                );
            }
        }

        Ok(())
    }

    /// Patch one exposed-route entry of a group: alias, and hidden with the
    /// matching ascent. Hiding withdraws the route from the parent chain but
    /// never from the group itself, and the entry keeps its alias across
    /// hide/unhide.
    pub fn update_group_route(
        &mut self,
        group_id: &ElementId,
        route_id: &ElementId,
        patch: &UpdateElement,
    ) -> Result<(), GraphError> {
        let parent = self.parent.get(group_id).cloned();

        let (alias_change, hidden_change) = {
            let Some(Element::Group(group)) = self.elements.get_mut(group_id) else {
                return Err(GraphError::NotFound(group_id.clone()));
            };
            let Some(entry) = group.routes.iter_mut().find(|r| &r.id == route_id) else {
                return Err(GraphError::NotFound(route_id.clone()));
            };
            let mut alias_change = None;
            if let Some(alias) = &patch.alias {
                entry.alias = alias.clone();
                alias_change = Some(alias.clone());
            }
            let mut hidden_change = None;
            if let Some(hidden) = patch.hidden {
                if hidden != entry.hidden {
                    entry.hidden = hidden;
                    hidden_change = Some(hidden);
                }
            }
            (alias_change, hidden_change)
        };

        if let Some(alias) = alias_change {
            self.publish(
                group_id,
                Diff {
                    id: Some(group_id.clone()),
                    route: Some(route_id.clone()),
                    alias: Some(alias),
                    ..Diff::new(DiffAction::UpdateGroupRouteAlias)
                },
            );
        }
        if let Some(hidden) = hidden_change {
            self.publish(
                group_id,
                Diff {
                    id: Some(group_id.clone()),
                    route: Some(route_id.clone()),
                    hidden: Some(hidden),
                    ..Diff::new(DiffAction::UpdateGroupRouteHidden)
                },
            );
            if let Some(parent) = parent {
                if hidden {
                    self.delete_route_ascending(&parent, route_id);
                } else {
                    self.add_route_ascending(&parent, route_id);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Shift positions by a delta; one translate diff per affected parent.
    pub fn batch_translate(
        &mut self,
        ids: &[ElementId],
        dx: i64,
        dy: i64,
    ) -> Result<(), GraphError> {
        for id in ids {
            if !self.expect(id)?.is_node() {
                return Err(GraphError::Validation(format!("{id} cannot be moved")));
            }
        }

        let mut by_parent: IndexMap<ElementId, Vec<ElementId>> = IndexMap::new();
        for id in ids {
            if let Some(element) = self.elements.get_mut(id) {
                if let Some(position) = element.position_mut() {
                    position.x += dx;
                    position.y += dy;
                }
            }
            if let Some(parent) = self.parent.get(id) {
                by_parent.entry(parent.clone()).or_default().push(id.clone());
            }
        }

        for (parent, moved) in by_parent {
            self.publish(
                &parent,
                Diff {
                    data: serde_json::to_value(&moved).ok(),
                    position: Some(Position { x: dx, y: dy }),
                    ..Diff::new(DiffAction::Translate)
                },
            );
        }
        Ok(())
    }

    /// Delete the transitive closure of the given nodes and edges: incident
    /// edges first, then nodes bottom-up, routes with their owners.
    pub fn batch_delete(&mut self, ids: &[ElementId]) -> Result<(), GraphError> {
        for id in ids {
            let element = self.expect(id)?;
            if !element.is_node() && !element.is_edge() {
                return Err(GraphError::Validation(format!(
                    "{id} is deleted with its owner"
                )));
            }
        }

        let mut edges: BTreeSet<ElementId> = BTreeSet::new();
        let mut nodes: Vec<ElementId> = Vec::new();
        let mut visited: FxHashSet<ElementId> = FxHashSet::default();
        for id in ids {
            self.collect_delete(id, &mut visited, &mut edges, &mut nodes);
        }
        for node in &nodes {
            if let Some(element) = self.elements.get(node) {
                for route in element.owned_routes() {
                    if let Some(incident) = self.route_to_edge.get(route) {
                        edges.extend(incident.iter().cloned());
                    }
                }
            }
        }

        for edge in &edges {
            self.delete_edge(edge);
        }
        for node in nodes {
            self.delete_node(&node)?;
        }
        Ok(())
    }

    /// Children before parents, so cascades tear down from the leaves.
    fn collect_delete(
        &self,
        id: &ElementId,
        visited: &mut FxHashSet<ElementId>,
        edges: &mut BTreeSet<ElementId>,
        nodes: &mut Vec<ElementId>,
    ) {
        if !visited.insert(id.clone()) {
            return;
        }
        match self.elements.get(id) {
            Some(Element::Group(group)) => {
                for child in group.children.clone() {
                    self.collect_delete(&child, visited, edges, nodes);
                }
                nodes.push(id.clone());
            }
            Some(element) if element.is_edge() => {
                edges.insert(id.clone());
            }
            Some(_) => nodes.push(id.clone()),
            None => {}
        }
    }

    fn delete_edge(&mut self, id: &ElementId) {
        let Some(element) = self.elements.get(id) else {
            return;
        };
        let (source_id, target_id, is_link) = match element {
            Element::Connection(c) => (c.source_id.clone(), c.target_id.clone(), false),
            Element::Link(l) => (l.source_id.clone(), l.target_id.clone(), true),
            _ => return,
        };

        if is_link {
            if let Some(PinRef {
                node,
                kind: PinKind::SourcePin,
            }) = self.route_pins.get(&target_id)
            {
                self.pending.push(Pending::Op(RuntimeOp::SetSource {
                    block: node.clone(),
                    source: None,
                }));
            }
        } else if let Some(PinRef {
            node,
            kind: PinKind::Output(output),
        }) = self.route_pins.get(&source_id)
        {
            self.pending.push(Pending::Op(RuntimeOp::Disconnect {
                connection: id.clone(),
                from: node.clone(),
                output: *output,
            }));
        }

        for route in [&source_id, &target_id] {
            if let Some(incident) = self.route_to_edge.get_mut(route) {
                incident.remove(id);
            }
        }
        self.publish_edge(id, &source_id, &target_id, DiffAction::Delete);
        self.elements.shift_remove(id);
    }

    fn delete_node(&mut self, id: &ElementId) -> Result<(), GraphError> {
        if let Some(parent) = self.parent.get(id).cloned() {
            self.remove_child(&parent, id)?;
        } else if matches!(self.elements.get(id), Some(Element::Group(_))) {
            self.pubsub.publish(
                ANNOUNCE,
                Diff {
                    id: Some(id.clone()),
                    ..Diff::new(DiffAction::RootGroupDelete)
                },
            );
        }

        let Some(element) = self.elements.get(id) else {
            return Ok(());
        };
        let routes = element.owned_routes().to_vec();
        let kind = element.element_type();
        for route in routes {
            self.route_to_edge.remove(&route);
            self.route_to_element.remove(&route);
            self.route_pins.remove(&route);
            self.elements.shift_remove(&route);
        }
        match kind {
            ElementType::Block => self
                .pending
                .push(Pending::Op(RuntimeOp::Stop { id: id.clone() })),
            ElementType::Source => self
                .pending
                .push(Pending::Op(RuntimeOp::DropSource { id: id.clone() })),
            _ => {}
        }
        self.elements.shift_remove(id);
        Ok(())
    }

    /// Dissolve groups: reparent every child into the group's parent, then
    /// delete the group.
    pub fn batch_ungroup(&mut self, ids: &[ElementId]) -> Result<(), GraphError> {
        for id in ids {
            if !matches!(self.expect(id)?, Element::Group(_)) {
                return Err(GraphError::Validation(format!("{id} is not a group")));
            }
        }
        for id in ids {
            let parent = self.parent.get(id).cloned();
            let children = match self.elements.get(id) {
                Some(Element::Group(group)) => group.children.clone(),
                _ => continue,
            };
            for child in children {
                self.remove_child(id, &child)?;
                match &parent {
                    Some(parent) => self.add_child(parent, &child)?,
                    None => {
                        if matches!(self.elements.get(&child), Some(Element::Group(_))) {
                            self.pubsub.publish(
                                ANNOUNCE,
                                Diff {
                                    id: Some(child.clone()),
                                    ..Diff::new(DiffAction::RootGroupCreate)
                                },
                            );
                        }
                    }
                }
            }
            self.batch_delete(&[id.clone()])?;
        }
        Ok(())
    }

    /// Reset blocks (abandon the crank, clear internal state) and sources
    /// (restore the fresh body), recursively through groups.
    pub fn batch_reset(&mut self, ids: &[ElementId]) -> Result<(), GraphError> {
        for id in ids {
            if !self.expect(id)?.is_node() {
                return Err(GraphError::Validation(format!("{id} cannot be reset")));
            }
        }
        let mut stack: Vec<ElementId> = ids.to_vec();
        let mut visited: FxHashSet<ElementId> = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match self.elements.get(&id) {
                Some(Element::Group(group)) => stack.extend(group.children.iter().cloned()),
                Some(Element::Block(_)) | Some(Element::Source(_)) => {
                    self.pending.push(Pending::Op(RuntimeOp::Reset { id }));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // PubSub
    // ------------------------------------------------------------------

    /// Subscribe to a topic. Element topics are seeded with an
    /// acknowledgement followed by a `create` carrying the element's recursive
    /// export; a missing element topic auto-instantiates a root group of that
    /// id.
    pub fn subscribe(
        &mut self,
        topic: &str,
        subscriber: Sender<Diff>,
    ) -> Result<SubscriptionId, GraphError> {
        if topic == ANNOUNCE {
            return Ok(self.pubsub.subscribe(topic, subscriber, |tx| {
                let _ = tx.send(Diff::new(DiffAction::Subscribe));
            }));
        }

        let id = ElementId::from(topic);
        if !self.elements.contains_key(&id) {
            self.create(
                vec![Envelope {
                    id: Some(id.clone()),
                    element_type: Some(ElementType::Group),
                    ..Default::default()
                }],
                None,
            )?;
        }
        let data = serde_json::to_value(self.get(&id)?).ok();
        Ok(self.pubsub.subscribe(topic, subscriber, |tx| {
            let _ = tx.send(Diff {
                id: Some(id.clone()),
                ..Diff::new(DiffAction::Subscribe)
            });
            let _ = tx.send(Diff {
                id: Some(id.clone()),
                data,
                ..Diff::new(DiffAction::Create)
            });
        }))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.pubsub.unsubscribe(subscription);
    }

    pub fn unsubscribe_all(&self, subscriptions: &[SubscriptionId]) {
        self.pubsub.unsubscribe_all(subscriptions);
    }

    /// Edge diffs go to every node exposing either endpoint.
    fn publish_edge(
        &self,
        edge: &ElementId,
        source: &ElementId,
        target: &ElementId,
        action: DiffAction,
    ) {
        let mut topics: BTreeSet<ElementId> = BTreeSet::new();
        for route in [source, target] {
            if let Some(exposing) = self.route_to_element.get(route) {
                topics.extend(exposing.iter().cloned());
            }
        }
        let data = match action {
            DiffAction::Create => self.envelope_value(edge),
            _ => None,
        };
        for topic in topics {
            self.publish(
                &topic,
                Diff {
                    id: Some(edge.clone()),
                    data: data.clone(),
                    ..Diff::new(action)
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Runtime staging
    // ------------------------------------------------------------------

    /// Resolve and drain the runtime operations staged by the transaction.
    /// Spawns come first so that edges created in the same batch find their
    /// executors; stops and source drops go last.
    pub fn drain_ops(&mut self) -> Vec<RuntimeOp> {
        let pending = std::mem::take(&mut self.pending);
        let mut spawns = Vec::new();
        let mut middle = Vec::new();
        let mut stops = Vec::new();
        for entry in pending {
            match entry {
                Pending::Op(op @ (RuntimeOp::SpawnBlock { .. } | RuntimeOp::SpawnSource { .. })) => {
                    spawns.push(op)
                }
                Pending::Op(op @ (RuntimeOp::Stop { .. } | RuntimeOp::DropSource { .. })) => {
                    stops.push(op)
                }
                Pending::Op(op) => middle.push(op),
                Pending::ConnectRoutes {
                    connection,
                    source_route,
                    target_route,
                } => match (
                    self.route_pins.get(&source_route),
                    self.route_pins.get(&target_route),
                ) {
                    (
                        Some(PinRef {
                            node: from,
                            kind: PinKind::Output(output),
                        }),
                        Some(PinRef {
                            node: to,
                            kind: PinKind::Input(input),
                        }),
                    ) => middle.push(RuntimeOp::Connect {
                        connection,
                        from: from.clone(),
                        output: *output,
                        to: to.clone(),
                        input: *input,
                    }),
                    _ => warn!("connection {connection} does not address block pins"),
                },
                Pending::LinkRoutes {
                    link,
                    source_route,
                    target_route,
                } => match (
                    self.route_pins.get(&source_route),
                    self.route_pins.get(&target_route),
                ) {
                    (
                        Some(PinRef {
                            node: source,
                            kind: PinKind::SourceOut,
                        }),
                        Some(PinRef {
                            node: block,
                            kind: PinKind::SourcePin,
                        }),
                    ) => middle.push(RuntimeOp::SetSource {
                        block: block.clone(),
                        source: Some(source.clone()),
                    }),
                    _ => warn!("link {link} does not address a source and a source pin"),
                },
                Pending::SetRouteConstant { route, value } => {
                    if let Some(PinRef {
                        node,
                        kind: PinKind::Input(input),
                    }) = self.route_pins.get(&route)
                    {
                        middle.push(RuntimeOp::SetInput {
                            block: node.clone(),
                            input: *input,
                            value,
                        });
                    }
                }
            }
        }
        spawns.extend(middle);
        spawns.extend(stops);
        spawns
    }

    /// Discard staged operations after a failed transaction.
    pub fn discard_ops(&mut self) {
        self.pending.clear();
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

struct AssignedRoutes {
    routes: Vec<ElementId>,
    constants: Vec<(ElementId, Value)>,
}

#[cfg(test)]
mod tests {
    use super::element::ChildRef;
    use super::*;

    fn draft(element_type: ElementType) -> Envelope {
        Envelope {
            element_type: Some(element_type),
            ..Default::default()
        }
    }

    fn block(spec: &str) -> Envelope {
        Envelope {
            spec: Some(spec.to_owned()),
            ..draft(ElementType::Block)
        }
    }

    #[test]
    fn ids_are_rewritten_on_collision() {
        let mut graph = Graph::new();
        let first = graph
            .create(
                vec![Envelope {
                    id: Some("9".into()),
                    ..block("+")
                }],
                None,
            )
            .unwrap();
        assert_eq!(first[0], "9".into());

        // same self-id again: reassigned, fresh id, no clash
        let second = graph
            .create(
                vec![Envelope {
                    id: Some("9".into()),
                    ..block("+")
                }],
                None,
            )
            .unwrap();
        assert_ne!(second[0], first[0]);
        assert!(graph.element(&second[0]).is_some());
    }

    #[test]
    fn create_is_all_or_nothing() {
        let mut graph = Graph::new();
        let err = graph.create(vec![block("+"), block("doesNotExist")], None);
        assert!(matches!(err, Err(GraphError::Invalid { index: 1, .. })));
        assert!(graph.is_empty());
        graph.discard_ops();
    }

    #[test]
    fn ascending_exposure_reaches_grandparents() {
        let mut graph = Graph::new();
        let ids = graph
            .create(
                vec![
                    Envelope {
                        id: Some("b".into()),
                        ..block("identity")
                    },
                    Envelope {
                        id: Some("inner".into()),
                        children: Some(vec![ChildRef { id: "b".into() }]),
                        ..draft(ElementType::Group)
                    },
                    Envelope {
                        id: Some("outer".into()),
                        children: Some(vec![ChildRef { id: "inner".into() }]),
                        ..draft(ElementType::Group)
                    },
                ],
                None,
            )
            .unwrap();
        assert_eq!(ids.len(), 3);

        let routes = match graph.element(&"b".into()).unwrap() {
            Element::Block(b) => b.routes.clone(),
            _ => unreachable!(),
        };
        for route in &routes {
            let exposing = graph.route_elements(route).unwrap();
            assert!(exposing.contains(&"b".into()));
            assert!(exposing.contains(&"inner".into()));
            assert!(exposing.contains(&"outer".into()));
        }
        graph.discard_ops();
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = Graph::new();
        graph
            .create(
                vec![
                    Envelope {
                        id: Some("inner".into()),
                        ..draft(ElementType::Group)
                    },
                    Envelope {
                        id: Some("outer".into()),
                        children: Some(vec![ChildRef { id: "inner".into() }]),
                        ..draft(ElementType::Group)
                    },
                ],
                None,
            )
            .unwrap();
        let err = graph.add_child(&"inner".into(), &"outer".into());
        assert!(matches!(err, Err(GraphError::Validation(_))));
        graph.discard_ops();
    }
}
