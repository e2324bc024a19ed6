//! ComfyUI job-graph model and structural editing.
//!
//! A job graph (ComfyUI "API format" workflow) maps node IDs to nodes,
//! each carrying a `class_type` and an ordered set of inputs. Input
//! values form a small tagged tree: scalars, references to another
//! node's output (`["4", 0]`), nested mappings and sequences.
//!
//! The editing helpers here are purely structural: they locate nodes by
//! class type and overwrite existing field values. They never add or
//! remove nodes and never check that a new value makes sense for the
//! field it replaces.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Class type of the node whose outputs are the job's final artifacts.
pub const OUTPUT_NODE_CLASS: &str = "SaveImage";

/// Key that marks a mapping as node-shaped.
const CLASS_TYPE_KEY: &str = "class_type";

const INPUTS_KEY: &str = "inputs";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A ComfyUI job graph: node ID -> node, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: IndexMap<String, Node>,
}

/// A single node of a job graph.
///
/// Node-level keys are written back in the order the source document
/// used; built nodes write `inputs`, `class_type`, then the extras.
#[derive(Debug, Clone)]
pub struct Node {
    /// Input field name -> value, in document order.
    pub inputs: IndexMap<String, GraphValue>,
    /// ComfyUI class type (e.g. "KSampler", "SaveImage").
    pub class_type: String,
    /// Any other node-level keys (e.g. `_meta`), kept verbatim.
    pub extra: IndexMap<String, serde_json::Value>,
    /// Node-level keys as they appeared in the source document.
    key_order: Vec<String>,
}

/// Reference to output slot `.1` of node `.0`.
///
/// Serialized the way ComfyUI writes it: a two-element array
/// `["<node id>", <slot>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef(pub String, pub u32);

/// A value held by a node input.
///
/// Variant order matters for deserialization: a two-element
/// `[string, integer]` array is read as a [`NodeRef`] before being
/// considered as a plain sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphValue {
    Reference(NodeRef),
    Sequence(Vec<GraphValue>),
    Mapping(IndexMap<String, GraphValue>),
    /// Null, bool, number or string. Never an array or object.
    Scalar(serde_json::Value),
}

/// Errors from loading or inspecting a job graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The graph file could not be read.
    #[error("failed to read graph file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid ComfyUI API-format graph.
    #[error("invalid graph JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The graph has no node of the required output class.
    #[error("graph has no {class_type} output node")]
    MissingOutputNode { class_type: &'static str },
}

// ---------------------------------------------------------------------------
// JobGraph
// ---------------------------------------------------------------------------

impl JobGraph {
    /// Parse a graph from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Number of top-level nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node by ID for in-place editing.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Iterate over `(id, node)` pairs in document order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }
}

impl FromIterator<(String, Node)> for JobGraph {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl Node {
    /// Create a node with no inputs.
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            inputs: IndexMap::new(),
            class_type: class_type.into(),
            extra: IndexMap::new(),
            key_order: Vec::new(),
        }
    }

    /// Builder-style input setter.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<GraphValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }
}

/// Key order is layout, not content.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.class_type == other.class_type && self.inputs == other.inputs && self.extra == other.extra
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.extra.len()))?;
        let keys = self
            .key_order
            .iter()
            .map(String::as_str)
            .chain([INPUTS_KEY, CLASS_TYPE_KEY])
            .chain(self.extra.keys().map(String::as_str));

        let mut written = HashSet::new();
        for key in keys {
            if !written.insert(key) {
                continue;
            }
            match key {
                INPUTS_KEY => map.serialize_entry(key, &self.inputs)?,
                CLASS_TYPE_KEY => map.serialize_entry(key, &self.class_type)?,
                _ => {
                    // Extras dropped after parsing have no value left.
                    if let Some(value) = self.extra.get(key) {
                        map.serialize_entry(key, value)?;
                    }
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let key_order = raw.keys().cloned().collect();

        let mut inputs = IndexMap::new();
        let mut class_type = None;
        let mut extra = IndexMap::new();
        for (key, value) in raw {
            match key.as_str() {
                INPUTS_KEY => {
                    inputs = IndexMap::<String, GraphValue>::deserialize(value).map_err(D::Error::custom)?;
                }
                CLASS_TYPE_KEY => {
                    class_type = Some(String::deserialize(value).map_err(D::Error::custom)?);
                }
                _ => {
                    extra.insert(key, value);
                }
            }
        }

        Ok(Self {
            inputs,
            class_type: class_type.ok_or_else(|| D::Error::missing_field(CLASS_TYPE_KEY))?,
            extra,
            key_order,
        })
    }
}

// ---------------------------------------------------------------------------
// GraphValue conversions
// ---------------------------------------------------------------------------

impl GraphValue {
    /// Build a reference to `slot` of node `node_id`.
    pub fn reference(node_id: impl Into<String>, slot: u32) -> Self {
        Self::Reference(NodeRef(node_id.into(), slot))
    }

    /// String content if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for GraphValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Array(items) => {
                if let [Value::String(id), Value::Number(slot)] = items.as_slice() {
                    if let Some(slot) = slot.as_u64().and_then(|s| u32::try_from(s).ok()) {
                        return Self::reference(id.clone(), slot);
                    }
                }
                Self::Sequence(items.into_iter().map(Self::from).collect())
            }
            Value::Object(map) => {
                Self::Mapping(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
            scalar => Self::Scalar(scalar),
        }
    }
}

impl From<&str> for GraphValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<String> for GraphValue {
    fn from(value: String) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<i64> for GraphValue {
    fn from(value: i64) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<u64> for GraphValue {
    fn from(value: u64) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<f64> for GraphValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<bool> for GraphValue {
    fn from(value: bool) -> Self {
        Self::Scalar(value.into())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read and parse a job graph from a JSON file.
pub async fn load_graph(path: impl AsRef<Path>) -> Result<JobGraph, GraphError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| GraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
    JobGraph::from_json_str(&text)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Find the key of the `SaveImage` output node.
///
/// See [`find_node_of_type`] for the traversal order.
pub fn find_output_node(graph: &JobGraph) -> Option<&str> {
    find_node_of_type(graph, OUTPUT_NODE_CLASS)
}

/// Like [`find_output_node`], but a missing output node is an error.
pub fn require_output_node(graph: &JobGraph) -> Result<&str, GraphError> {
    find_output_node(graph).ok_or(GraphError::MissingOutputNode {
        class_type: OUTPUT_NODE_CLASS,
    })
}

/// Depth-first search for the first node whose class type matches.
///
/// Nodes are visited in document order; each node's inputs are searched
/// (for nested node-shaped mappings) before moving on to the next node.
/// With several matching nodes the first one in that order wins.
pub fn find_node_of_type<'a>(graph: &'a JobGraph, class_type: &str) -> Option<&'a str> {
    graph.nodes.iter().find_map(|(id, node)| {
        if node.class_type == class_type {
            return Some(id.as_str());
        }
        node.inputs
            .iter()
            .find_map(|(key, value)| find_in_value(key, value, class_type))
    })
}

fn find_in_value<'a>(key: &'a str, value: &'a GraphValue, class_type: &str) -> Option<&'a str> {
    match value {
        GraphValue::Mapping(map) => {
            if mapping_class_type(map) == Some(class_type) {
                return Some(key);
            }
            map.iter().find_map(|(k, v)| find_in_value(k, v, class_type))
        }
        GraphValue::Sequence(items) => items
            .iter()
            .find_map(|item| find_in_value(key, item, class_type)),
        GraphValue::Reference(_) | GraphValue::Scalar(_) => None,
    }
}

fn mapping_class_type(map: &IndexMap<String, GraphValue>) -> Option<&str> {
    map.get(CLASS_TYPE_KEY).and_then(GraphValue::as_str)
}

// ---------------------------------------------------------------------------
// Replacement
// ---------------------------------------------------------------------------

/// Overwrite `field` with `new_value` on every eligible node.
///
/// With `exclude = true`, a node is eligible unless its class type is in
/// `class_types` (no filter means every node). With `exclude = false`,
/// only nodes whose class type is in `class_types` are eligible (no
/// filter means no node).
///
/// Nested mappings inside inputs are visited too; their class type is
/// their own `class_type` entry, if any. Fields that do not already
/// exist are never added. Returns the number of fields overwritten.
pub fn replace_field(
    graph: &mut JobGraph,
    field: &str,
    new_value: &GraphValue,
    class_types: Option<&[&str]>,
    exclude: bool,
) -> usize {
    let mut replaced = 0;

    for node in graph.nodes.values_mut() {
        let eligible = is_eligible(Some(node.class_type.as_str()), class_types, exclude);
        replaced += replace_in_mapping(&mut node.inputs, eligible, field, new_value, class_types, exclude);
    }

    replaced
}

fn replace_in_mapping(
    map: &mut IndexMap<String, GraphValue>,
    eligible: bool,
    field: &str,
    new_value: &GraphValue,
    class_types: Option<&[&str]>,
    exclude: bool,
) -> usize {
    let mut replaced = 0;
    let mut overwritten = false;

    if eligible {
        if let Some(slot) = map.get_mut(field) {
            *slot = new_value.clone();
            overwritten = true;
            replaced += 1;
        }
    }

    for (key, value) in map.iter_mut() {
        if overwritten && key == field {
            continue;
        }
        replaced += replace_in_value(value, field, new_value, class_types, exclude);
    }

    replaced
}

fn replace_in_value(
    value: &mut GraphValue,
    field: &str,
    new_value: &GraphValue,
    class_types: Option<&[&str]>,
    exclude: bool,
) -> usize {
    match value {
        GraphValue::Mapping(map) => {
            let eligible = is_eligible(mapping_class_type(map), class_types, exclude);
            replace_in_mapping(map, eligible, field, new_value, class_types, exclude)
        }
        GraphValue::Sequence(items) => items
            .iter_mut()
            .map(|item| replace_in_value(item, field, new_value, class_types, exclude))
            .sum(),
        GraphValue::Reference(_) | GraphValue::Scalar(_) => 0,
    }
}

fn is_eligible(class_type: Option<&str>, class_types: Option<&[&str]>, exclude: bool) -> bool {
    match (exclude, class_types) {
        (true, None) => true,
        (true, Some(filter)) => class_type.map_or(true, |ct| !filter.contains(&ct)),
        (false, None) => false,
        (false, Some(filter)) => class_type.is_some_and(|ct| filter.contains(&ct)),
    }
}
