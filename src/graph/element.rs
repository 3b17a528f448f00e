//! Element records and the wire envelope.
//!
//! Seven element kinds share a common identity of `{id, type, alias}`. The
//! [`Envelope`] is the flat JSON shape used both for create requests and for
//! export output, with every optional field omitted when absent, so that the
//! output of an export is directly re-importable.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::source::SourceKind;

/// A process-unique opaque identifier.
///
/// Ids are stringified integers allocated from a monotonic counter; every "id
/// order" in the crate (exposed route lists, children, export ordering) is the
/// lexicographic order of the string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ElementId {
    fn from(s: String) -> Self {
        ElementId(s)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        ElementId(s.to_owned())
    }
}

impl From<u64> for ElementId {
    fn from(n: u64) -> Self {
        ElementId(n.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Block,
    Group,
    Source,
    Connection,
    Link,
    Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// The JSON type carried by a route. Connections require equal types on both
/// ends, with `any` compatible with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Any,
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl JsonType {
    pub fn compatible(&self, other: &JsonType) -> bool {
        matches!(self, JsonType::Any) || matches!(other, JsonType::Any) || self == other
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

/// A typed pin owned by exactly one node.
#[derive(Debug, Clone)]
pub struct RouteRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub name: String,
    pub direction: Direction,
    pub json_type: JsonType,
    /// Constant value: a block input with a value set no longer reads its
    /// channel.
    pub value: Option<Value>,
    /// The shared-state kind this pin consumes or provides, if any. Tagged
    /// routes participate in links, untagged routes in connections.
    pub source: Option<SourceKind>,
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub spec: String,
    pub position: Position,
    /// Owned routes: inputs, then outputs, then the source pin if the spec
    /// declares one.
    pub routes: Vec<ElementId>,
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub spec: String,
    pub position: Position,
    /// A single output route tagged with the source kind.
    pub routes: Vec<ElementId>,
}

/// An exposed-route entry on a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRouteRef {
    pub id: ElementId,
    pub hidden: bool,
    pub alias: String,
}

#[derive(Debug, Clone, Default)]
pub struct GroupRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub position: Position,
    /// Exposed routes in ascending id order.
    pub routes: Vec<GroupRouteRef>,
    /// Children in ascending id order.
    pub children: Vec<ElementId>,
}

impl GroupRecord {
    pub fn route_entry(&self, id: &ElementId) -> Option<&GroupRouteRef> {
        self.routes.iter().find(|r| &r.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub source_id: ElementId,
    pub target_id: ElementId,
}

#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub id: ElementId,
    pub alias: Option<String>,
    pub source_id: ElementId,
    pub target_id: ElementId,
}

/// One element record in the graph.
#[derive(Debug, Clone)]
pub enum Element {
    Block(BlockRecord),
    Source(SourceRecord),
    Group(GroupRecord),
    Connection(ConnectionRecord),
    Link(LinkRecord),
    Route(RouteRecord),
}

impl Element {
    pub fn id(&self) -> &ElementId {
        match self {
            Element::Block(b) => &b.id,
            Element::Source(s) => &s.id,
            Element::Group(g) => &g.id,
            Element::Connection(c) => &c.id,
            Element::Link(l) => &l.id,
            Element::Route(r) => &r.id,
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Element::Block(_) => ElementType::Block,
            Element::Source(_) => ElementType::Source,
            Element::Group(_) => ElementType::Group,
            Element::Connection(_) => ElementType::Connection,
            Element::Link(_) => ElementType::Link,
            Element::Route(_) => ElementType::Route,
        }
    }

    /// Blocks, sources and groups can be group children and carry a position.
    pub fn is_node(&self) -> bool {
        matches!(
            self,
            Element::Block(_) | Element::Source(_) | Element::Group(_)
        )
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, Element::Connection(_) | Element::Link(_))
    }

    pub fn alias_mut(&mut self) -> &mut Option<String> {
        match self {
            Element::Block(b) => &mut b.alias,
            Element::Source(s) => &mut s.alias,
            Element::Group(g) => &mut g.alias,
            Element::Connection(c) => &mut c.alias,
            Element::Link(l) => &mut l.alias,
            Element::Route(r) => &mut r.alias,
        }
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        match self {
            Element::Block(b) => Some(&mut b.position),
            Element::Source(s) => Some(&mut s.position),
            Element::Group(g) => Some(&mut g.position),
            _ => None,
        }
    }

    /// The routes owned by this node, in order.
    pub fn owned_routes(&self) -> &[ElementId] {
        match self {
            Element::Block(b) => &b.routes,
            Element::Source(s) => &s.routes,
            _ => &[],
        }
    }
}

/// A route reference inside a group envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRef {
    pub id: ElementId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    pub id: ElementId,
}

/// The flat wire shape for one element: create request input and export
/// output. Optional fields are omitted when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ElementId>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChildRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<ElementId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ElementId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ElementId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_type: Option<JsonType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A patch applied by `Update` and `UpdateGroupRoute`.
///
/// `value` distinguishes "absent" from "set to null": an explicit null clears
/// a route's constant so the input reads its channel again.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateElement {
    pub alias: Option<String>,
    pub position: Option<Position>,
    #[serde(default, deserialize_with = "nullable_value")]
    pub value: Option<Option<Value>>,
    pub hidden: Option<bool>,
}

fn nullable_value<'de, D>(deserializer: D) -> Result<Option<Option<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(Some(if v.is_null() { None } else { Some(v) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_absent_fields() {
        let envelope = Envelope {
            id: Some("3".into()),
            element_type: Some(ElementType::Block),
            spec: Some("+".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "id": "3", "type": "block", "spec": "+" })
        );
    }

    #[test]
    fn update_distinguishes_null_from_absent() {
        let set: UpdateElement = serde_json::from_value(json!({ "value": 4 })).unwrap();
        assert_eq!(set.value, Some(Some(json!(4))));

        let clear: UpdateElement = serde_json::from_value(json!({ "value": null })).unwrap();
        assert_eq!(clear.value, Some(None));

        let untouched: UpdateElement = serde_json::from_value(json!({ "alias": "x" })).unwrap();
        assert_eq!(untouched.value, None);
    }
}
