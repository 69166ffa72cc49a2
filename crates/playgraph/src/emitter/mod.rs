//! Tool emitters - render operations as executable instructions
//!
//! One [`Emitter`] per target automation tool. The set of tools is closed:
//! [`Tool`] is the registry, selected by name.

mod ansible;
mod tasks;
mod terraform;

pub use ansible::AnsibleEmitter;
pub use tasks::{Implementation, interface_scripts};
pub use terraform::TerraformEmitter;

use crate::config::ProviderConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::state::InstanceStore;
use crate::types::{Instruction, Mapping, OperationNode, TypeName, Value};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Human description and module of a resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescription {
    pub description: String,
    /// Module (or resource type) that manages the resource
    pub module: String,
    /// Key of the module's result object holding observed attributes
    pub attribute_matcher: String,
}

/// Everything an emitter may read while rendering
pub struct EmitContext<'a> {
    pub run: &'a RunContext,
    pub store: &'a InstanceStore,
    pub provider: &'a ProviderConfig,
}

/// Renders one operation as tool-specific instructions
pub trait Emitter: Send + Sync {
    fn tool(&self) -> Tool;

    /// Instructions that provision the resource
    fn render_create(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>>;

    /// Instructions that remove every recorded instance of the resource
    fn render_delete(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>>;

    /// Instructions running the interface implementation of `node`'s operation
    fn render_interface_scripts(
        &self,
        node: &OperationNode,
        ctx: &EmitContext<'_>,
    ) -> Result<Vec<Instruction>> {
        interface_scripts(node, ctx)
    }

    fn describe_type(&self, type_name: &str, provider: &ProviderConfig) -> TypeDescription;
}

// ============================================================================
// Registry
// ============================================================================

/// Supported target automation tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Ansible,
    Terraform,
}

impl Tool {
    pub const ALL: [Tool; 2] = [Tool::Ansible, Tool::Terraform];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ansible => "ansible",
            Self::Terraform => "terraform",
        }
    }

    pub fn emitter(&self) -> Box<dyn Emitter> {
        match self {
            Self::Ansible => Box::new(AnsibleEmitter),
            Self::Terraform => Box::new(TerraformEmitter),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownTool {
                name: s.to_string(),
                known: Self::ALL.map(|t| t.as_str()).join(", "),
            })
    }
}

// ============================================================================
// Rendered script
// ============================================================================

/// One play of the rendered script
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Play {
    pub name: String,
    pub hosts: String,
    pub gather_facts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<Mapping>,
    pub tasks: Vec<Instruction>,
}

/// Render plays as a YAML document
pub fn render_script(plays: &[Play]) -> Result<String> {
    Ok(serde_yaml::to_string(plays)?)
}

// ============================================================================
// Helpers shared by emitters
// ============================================================================

/// `CamelCase` → `camel_case`
pub(crate) fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if i > 0 && (prev_lower || (next_lower && chars[i - 1].is_uppercase())) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if *c == '.' || *c == '-' {
            out.push('_');
        } else {
            out.push(*c);
        }
    }
    out
}

/// Short type name, e.g. `FloatingIp` for `openstack.nodes.FloatingIp`
pub(crate) fn short_type(type_name: &str) -> &str {
    type_name.rsplit('.').next().unwrap_or(type_name)
}

/// Register name of a resource's task
pub(crate) fn register_name(resource: &str) -> String {
    resource.replace('-', "_")
}

/// Shallow-merge extra arguments into a task
pub(crate) fn with_extra(mut task: Instruction, extra: &Mapping) -> Instruction {
    for (key, value) in extra {
        task.insert(key.clone(), value.clone());
    }
    task
}

/// Settings mapping for a type, or a description derived from its name
pub(crate) fn describe(
    type_name: &str,
    provider: &ProviderConfig,
    default_module: impl FnOnce(&str) -> String,
) -> TypeDescription {
    let mapping = provider.type_mapping(type_name);
    let short = short_type(type_name);
    let module = mapping
        .and_then(|m| m.module.clone())
        .unwrap_or_else(|| default_module(short));
    let attribute_matcher = mapping
        .and_then(|m| m.attribute_matcher.clone())
        .unwrap_or_else(|| {
            provider
                .module_prefix
                .as_deref()
                .and_then(|prefix| module.strip_prefix(prefix))
                .unwrap_or(&module)
                .to_string()
        });
    TypeDescription {
        description: mapping
            .and_then(|m| m.description.clone())
            .unwrap_or_else(|| format!("{short} resource")),
        module,
        attribute_matcher,
    }
}

/// Namespace of a type, or an empty string
pub(crate) fn namespace(type_name: &str) -> String {
    TypeName::parse(type_name).map(|t| t.namespace).unwrap_or_default()
}

/// Recorded `id` attributes of every instance of a resource
pub(crate) fn recorded_ids(store: &InstanceStore, name: &str) -> Vec<Value> {
    store
        .instances(name)
        .into_iter()
        .filter_map(|snapshot| snapshot.attributes().and_then(|a| a.get("id")).cloned())
        .filter(|id| !id.is_null())
        .collect()
}
