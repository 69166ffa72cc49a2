//! Core types: resources, lifecycle operations and operation nodes

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A document value (template fragment, argument, fact)
pub type Value = serde_json::Value;

/// An ordered string-keyed mapping of document values
pub type Mapping = serde_json::Map<String, Value>;

/// One tool-specific executable instruction (e.g. an Ansible task)
pub type Instruction = Mapping;

/// Interface implemented by node templates
pub const STANDARD_INTERFACE: &str = "Standard";

/// Interface implemented by relationship templates
pub const CONFIGURE_INTERFACE: &str = "Configure";

// ============================================================================
// Type names
// ============================================================================

/// Whether a template is a node or a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Node,
    Relationship,
}

impl ElementKind {
    /// Category segment used in namespaced type names
    pub fn category(&self) -> &'static str {
        match self {
            Self::Node => "nodes",
            Self::Relationship => "relationships",
        }
    }

    /// The lifecycle interface templates of this kind implement
    pub fn interface(&self) -> &'static str {
        match self {
            Self::Node => STANDARD_INTERFACE,
            Self::Relationship => CONFIGURE_INTERFACE,
        }
    }
}

/// A namespaced type name: `provider.category.type-name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    pub namespace: String,
    pub category: String,
    pub name: String,
}

impl TypeName {
    /// Split a type name into its three segments.
    ///
    /// Returns `None` for anything that is not namespaced, which is how
    /// template names are told apart from type names in requirements.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(category), Some(name))
                if !namespace.is_empty() && !category.is_empty() && !name.is_empty() =>
            {
                Some(Self {
                    namespace: namespace.to_string(),
                    category: category.to_string(),
                    name: name.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Element kind derived from the category segment
    pub fn kind(&self) -> Option<ElementKind> {
        match self.category.as_str() {
            "nodes" => Some(ElementKind::Node),
            "relationships" => Some(ElementKind::Relationship),
            _ => None,
        }
    }
}

// ============================================================================
// Lifecycle operations
// ============================================================================

/// One named phase in a resource's managed lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOp {
    Create,
    Configure,
    Start,
    Stop,
    Delete,
    PreConfigureSource,
    PreConfigureTarget,
    PostConfigureSource,
    PostConfigureTarget,
    AddSource,
}

impl LifecycleOp {
    /// Optional node operations after `create`, in execution order
    pub const NODE_CHAIN: [LifecycleOp; 4] = [Self::Configure, Self::Start, Self::Stop, Self::Delete];

    /// Node operations from the end of the chain back to `create`
    pub const REVERSED_NODE_CHAIN: [LifecycleOp; 5] = [
        Self::Delete,
        Self::Stop,
        Self::Start,
        Self::Configure,
        Self::Create,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::PreConfigureSource => "pre_configure_source",
            Self::PreConfigureTarget => "pre_configure_target",
            Self::PostConfigureSource => "post_configure_source",
            Self::PostConfigureTarget => "post_configure_target",
            Self::AddSource => "add_source",
        }
    }

    /// Whether this operation belongs to the relationship `Configure` interface
    pub fn is_relationship_op(&self) -> bool {
        matches!(
            self,
            Self::PreConfigureSource
                | Self::PreConfigureTarget
                | Self::PostConfigureSource
                | Self::PostConfigureTarget
                | Self::AddSource
        )
    }

    /// For relationship operations, whether the peer is the source (else target)
    pub fn acts_on_source(&self) -> bool {
        matches!(
            self,
            Self::PreConfigureSource | Self::PostConfigureSource | Self::AddSource
        )
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "configure" => Ok(Self::Configure),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            "pre_configure_source" => Ok(Self::PreConfigureSource),
            "pre_configure_target" => Ok(Self::PreConfigureTarget),
            "post_configure_source" => Ok(Self::PostConfigureSource),
            "post_configure_target" => Ok(Self::PostConfigureTarget),
            "add_source" => Ok(Self::AddSource),
            other => Err(Error::Topology(format!("unknown lifecycle operation '{other}'"))),
        }
    }
}

/// Scheduling key of an operation: `(resource, operation)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub resource: String,
    pub operation: LifecycleOp,
}

impl OperationKey {
    pub fn new(resource: impl Into<String>, operation: LifecycleOp) -> Self {
        Self {
            resource: resource.into(),
            operation,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.operation)
    }
}

// ============================================================================
// Templates
// ============================================================================

/// A named link from one resource to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    /// Target node template name (or node type, before resolution)
    pub node: Option<String>,
    /// Relationship template name or relationship type
    pub relationship: Option<String>,
    pub capability: Option<String>,
    /// Properties of the target, used for path traversal
    pub node_filter: Option<Mapping>,
}

/// A node or relationship template with derived scheduling data
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTemplate {
    pub name: String,
    pub kind: ElementKind,
    pub type_name: String,
    /// Declared body: properties, attributes, requirements, interfaces, ...
    pub tmpl: Mapping,
    pub requirements: Vec<Requirement>,
    pub is_software_component: bool,
    /// Resource this one is hosted on
    pub host_link: Option<String>,
    /// Inventory variable holding the hosting resource's address
    pub host_address: Option<String>,
    /// Relationship source node
    pub source: Option<String>,
    /// Relationship target node
    pub target: Option<String>,
    /// Arguments handed to the emitter for the resource module
    pub configuration_args: Mapping,
    /// Attribute names the executor should report back
    pub attribute_names: Vec<String>,
    /// Node types named by the type's requirement definitions
    pub requirement_node_types: Vec<String>,
}

impl ResourceTemplate {
    fn section(&self, key: &str) -> Option<&Mapping> {
        self.tmpl.get(key).and_then(Value::as_object)
    }

    pub fn properties(&self) -> Option<&Mapping> {
        self.section("properties")
    }

    pub fn attributes(&self) -> Option<&Mapping> {
        self.section("attributes")
    }

    pub fn capabilities(&self) -> Option<&Mapping> {
        self.section("capabilities")
    }

    /// Operations of one interface, e.g. `Standard`
    pub fn interface(&self, name: &str) -> Option<&Mapping> {
        self.section("interfaces")
            .and_then(|interfaces| interfaces.get(name))
            .and_then(Value::as_object)
    }

    /// Whether the lifecycle interface of this kind implements `op`
    pub fn implements(&self, op: LifecycleOp) -> bool {
        self.interface(self.kind.interface())
            .is_some_and(|ops| ops.contains_key(op.as_str()))
    }

    pub fn requirement(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.name == name)
    }
}

/// The unit of scheduling: a resource paired with one lifecycle operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub key: OperationKey,
    /// Working copy, resolved in place before emission
    pub tmpl: ResourceTemplate,
    /// Execution target, set by the scheduler
    pub host: Option<String>,
}

impl OperationNode {
    pub fn new(tmpl: ResourceTemplate, operation: LifecycleOp) -> Self {
        Self {
            key: OperationKey::new(tmpl.name.clone(), operation),
            tmpl,
            host: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.key.resource
    }

    pub fn operation(&self) -> LifecycleOp {
        self.key.operation
    }

    pub fn source(&self) -> Option<&str> {
        self.tmpl.source.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.tmpl.target.as_deref()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Deep-merge `overrides` into `base`.
///
/// Nested mappings merge key by key, sequences are concatenated, anything
/// else is replaced.
pub fn deep_merge(base: &mut Mapping, overrides: &Mapping) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                existing.extend(incoming.iter().cloned());
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Render a scalar as text the way string functions expect it
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
