//! Refinery wire model
//!
//! Fact messages describe one entity (keyed by its conformed dimensions),
//! its mutable properties, and its connections to other entities. Upstream
//! harvesters publish these messages; the refinery merges them into a shared
//! property graph.
//!
//! This crate holds the message types, the graph value type ([`PropValue`]),
//! the per-node ownership bookkeeping ([`OwnershipRecord`]) used for
//! source-priority conflict resolution, and the inbound schema checks.

pub mod validate;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Base label shared by every refined node.
pub const BASE_LABEL: &str = "Card";

/// Node identity, assigned once at first creation.
pub const UUID_KEY: &str = "Uuid";
/// Display name, rewritten on every merge.
pub const NAME_KEY: &str = "Name";
/// True while a node exists only as the far end of someone's connection.
pub const PENDING_MERGE_KEY: &str = "PendingMerge";
/// Creation timestamp, assigned once at first creation.
pub const ADDED_DATE_KEY: &str = "AddedDate";
/// Ordered list of source systems that have written to the node.
pub const SOURCE_SYSTEMS_KEY: &str = "SourceSystems";
/// Priorities parallel to [`SOURCE_SYSTEMS_KEY`], same length always.
pub const SOURCE_SYSTEM_PRIORITIES_KEY: &str = "SourceSystemPriorities";
/// Prefix of the per-system list of property keys that system last wrote.
pub const SOURCE_SYSTEM_PROPS_PREFIX: &str = "SourceSystemProps_";

/// Node property key under which `system`'s last-written property keys live.
pub fn source_system_props_key(system: &str) -> String {
    format!("{SOURCE_SYSTEM_PROPS_PREFIX}{system}")
}

// ============================================================================
// Graph values
// ============================================================================

/// A property value as stored on a node or relationship.
///
/// Inbound JSON never produces `DateTime` directly; the date-typing pass
/// reclassifies ISO-8601 strings after conflict resolution. `Map` only
/// occurs as a statement parameter (bulk property merges), never as a
/// stored property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
    DateTime(DateTime<FixedOffset>),
}

/// Ordered property map; ordering keeps rendered statements deterministic.
pub type PropMap = BTreeMap<String, PropValue>;

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Int(i) => Some(*i as f64),
            PropValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String elements of a list value. Non-string elements are skipped.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            PropValue::List(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for PropValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropValue::Null,
            serde_json::Value::Bool(b) => PropValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropValue::Int(i),
                None => PropValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => PropValue::String(s),
            serde_json::Value::Array(items) => {
                PropValue::List(items.into_iter().map(PropValue::from).collect())
            }
            serde_json::Value::Object(fields) => PropValue::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, PropValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::String(s.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::String(s)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Bool(b)
    }
}

impl From<i64> for PropValue {
    fn from(i: i64) -> Self {
        PropValue::Int(i)
    }
}

impl From<f64> for PropValue {
    fn from(f: f64) -> Self {
        PropValue::Float(f)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// One fact message from an upstream source system.
///
/// Field names on the wire are PascalCase, matching the harvester schema.
/// Unknown fields are rejected at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Message {
    pub name: String,
    pub node_type: String,
    /// Natural key. Must be non-empty for the message to compile.
    pub conformed_dimensions: PropMap,
    #[serde(default)]
    pub properties: PropMap,
    /// Properties that must land as typed date values regardless of shape.
    #[serde(default)]
    pub date_properties: PropMap,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default)]
    pub delete_node: bool,
    #[serde(default)]
    pub delete_properties: Vec<String>,
    /// Replaces the `Card` base label when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A connection from the primary entity to a related entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Connection {
    #[serde(default)]
    pub name: Option<String>,
    pub node_type: String,
    pub rel_type: String,
    /// True for `(primary)-[rel]->(related)`, false for the reverse.
    pub forward_rel: bool,
    pub conformed_dimensions: PropMap,
    #[serde(default)]
    pub properties: PropMap,
    #[serde(default)]
    pub rel_props: PropMap,
    #[serde(default)]
    pub date_properties: PropMap,
    #[serde(default)]
    pub date_rel_props: PropMap,
    #[serde(default)]
    pub delete_properties: Vec<String>,
    #[serde(default)]
    pub delete_rel_props: Vec<String>,
    #[serde(default)]
    pub delete_relationship: bool,
    #[serde(default)]
    pub delete_node: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Message {
    /// Base label: the override when present, `Card` otherwise.
    pub fn effective_label(&self) -> &str {
        self.label.as_deref().unwrap_or(BASE_LABEL)
    }

    /// Labels on the merged node, base label first.
    pub fn labels(&self) -> Vec<String> {
        node_labels(self.effective_label(), &self.node_type)
    }
}

impl Connection {
    pub fn effective_label(&self) -> &str {
        self.label.as_deref().unwrap_or(BASE_LABEL)
    }

    pub fn labels(&self) -> Vec<String> {
        node_labels(self.effective_label(), &self.node_type)
    }
}

fn node_labels(base: &str, node_type: &str) -> Vec<String> {
    if base == node_type {
        vec![base.to_owned()]
    } else {
        vec![base.to_owned(), node_type.to_owned()]
    }
}

// ============================================================================
// Ownership bookkeeping
// ============================================================================

/// Per-node record of which source system last wrote which property keys.
///
/// Persisted on the node itself as `SourceSystems`,
/// `SourceSystemPriorities` and one `SourceSystemProps_<system>` list per
/// contributing system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub source_systems: Vec<String>,
    pub priorities: Vec<f64>,
    pub props_by_system: BTreeMap<String, Vec<String>>,
}

impl OwnershipRecord {
    /// The parallel arrays are only trustworthy when their lengths agree.
    pub fn is_coherent(&self) -> bool {
        self.source_systems.len() == self.priorities.len()
    }

    pub fn priority_of(&self, system: &str) -> Option<f64> {
        self.source_systems
            .iter()
            .position(|s| s == system)
            .and_then(|idx| self.priorities.get(idx).copied())
    }

    /// Rebuild the record from a node's stored properties. Absent or
    /// mis-typed bookkeeping fields simply come back empty; the resolver
    /// treats incoherent records as "no ownership" (fail-open).
    pub fn from_props(props: &PropMap) -> Self {
        let source_systems = props
            .get(SOURCE_SYSTEMS_KEY)
            .and_then(PropValue::as_string_list)
            .unwrap_or_default();
        let priorities = match props.get(SOURCE_SYSTEM_PRIORITIES_KEY) {
            Some(PropValue::List(items)) => {
                items.iter().filter_map(PropValue::as_f64).collect()
            }
            _ => Vec::new(),
        };
        let props_by_system = props
            .iter()
            .filter_map(|(key, value)| {
                let system = key.strip_prefix(SOURCE_SYSTEM_PROPS_PREFIX)?;
                Some((system.to_owned(), value.as_string_list()?))
            })
            .collect();
        Self {
            source_systems,
            priorities,
            props_by_system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "Name": "Konrad Aust",
            "NodeType": "Employee",
            "ConformedDimensions": { "Email": "konrad@example.com" },
            "Properties": { "Status": "active", "PreferredName": "The Chazzinator", "ResumeSkills": "programming" },
            "SourceSystem": "HRSystem",
            "Priority": 1,
            "Connections": [
                {
                    "Name": "Victoria Office",
                    "NodeType": "Office",
                    "RelType": "LocatedInOffice",
                    "ForwardRel": true,
                    "ConformedDimensions": { "City": "Victoria" }
                },
                {
                    "Name": "Refinery Rollout",
                    "NodeType": "Project",
                    "RelType": "WorkedOnProject",
                    "ForwardRel": true,
                    "ConformedDimensions": { "Code": "5" }
                }
            ]
        }"#
    }

    #[test]
    fn parses_harvester_message() {
        let msg: Message = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(msg.name, "Konrad Aust");
        assert_eq!(msg.node_type, "Employee");
        assert_eq!(msg.priority, Some(1.0));
        assert_eq!(msg.connections.len(), 2);
        assert!(msg.connections[0].forward_rel);
        assert_eq!(msg.connections[0].rel_type, "LocatedInOffice");
        assert_eq!(
            msg.conformed_dimensions.get("Email"),
            Some(&PropValue::String("konrad@example.com".into()))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{
            "Name": "x", "NodeType": "T",
            "ConformedDimensions": {"K": 1},
            "Bogus": true
        }"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn labels_replace_base_on_override() {
        let mut msg: Message = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(msg.labels(), vec!["Card", "Employee"]);
        msg.label = Some("Person".into());
        assert_eq!(msg.labels(), vec!["Person", "Employee"]);
        msg.label = Some("Employee".into());
        assert_eq!(msg.labels(), vec!["Employee"]);
    }

    #[test]
    fn json_numbers_map_to_int_or_float() {
        assert_eq!(PropValue::from(serde_json::json!(3)), PropValue::Int(3));
        assert_eq!(
            PropValue::from(serde_json::json!(2.5)),
            PropValue::Float(2.5)
        );
    }

    #[test]
    fn ownership_roundtrips_through_node_props() {
        let mut props = PropMap::new();
        props.insert(
            SOURCE_SYSTEMS_KEY.into(),
            PropValue::List(vec!["A".into(), "B".into()]),
        );
        props.insert(
            SOURCE_SYSTEM_PRIORITIES_KEY.into(),
            PropValue::List(vec![PropValue::Int(5), PropValue::Float(1.0)]),
        );
        props.insert(
            source_system_props_key("A"),
            PropValue::List(vec!["x".into()]),
        );

        let record = OwnershipRecord::from_props(&props);
        assert!(record.is_coherent());
        assert_eq!(record.source_systems, vec!["A", "B"]);
        assert_eq!(record.priorities, vec![5.0, 1.0]);
        assert_eq!(record.props_by_system["A"], vec!["x"]);
        assert_eq!(record.priority_of("B"), Some(1.0));
    }

    #[test]
    fn malformed_bookkeeping_reads_as_empty() {
        let mut props = PropMap::new();
        props.insert(SOURCE_SYSTEMS_KEY.into(), PropValue::String("A".into()));
        let record = OwnershipRecord::from_props(&props);
        assert!(record.source_systems.is_empty());
        assert!(record.is_coherent());
    }
}
