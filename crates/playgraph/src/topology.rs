//! Topology model: type flattening and resource templates
//!
//! A topology document is parsed once per run. Type definitions (from the
//! provider's definition file and the document itself) are flattened with
//! their parents, then every node and relationship template is turned into a
//! [`ResourceTemplate`] carrying the data the dependency resolver and the
//! emitters need.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::types::{
    ElementKind, Mapping, Requirement, ResourceTemplate, TypeName, Value, deep_merge,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

/// Short name of the normative software component type
const SOFTWARE_COMPONENT: &str = "SoftwareComponent";

/// Short name of the hosting relationship type
const HOSTED_ON: &str = "HostedOn";

/// Requirement name that orders resources without passing arguments
const DEPENDENCY: &str = "dependency";

/// Host address parameters a topology can be addressed through
pub const HOST_IP_PARAMETERS: [&str; 2] = ["public_address", "private_address"];

// ============================================================================
// Documents
// ============================================================================

/// A parsed topology document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyDocument {
    #[serde(default)]
    pub node_types: Option<Mapping>,
    #[serde(default)]
    pub relationship_types: Option<Mapping>,
    #[serde(default)]
    pub topology_template: TemplateSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateSection {
    #[serde(default)]
    pub inputs: Option<Mapping>,
    #[serde(default)]
    pub node_templates: Option<Mapping>,
    #[serde(default)]
    pub relationship_templates: Option<Mapping>,
    #[serde(default)]
    pub outputs: Option<Mapping>,
}

/// Type definitions loaded from a provider definition file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypeDefinitions {
    #[serde(default)]
    pub node_types: Option<Mapping>,
    #[serde(default)]
    pub relationship_types: Option<Mapping>,
}

impl TopologyDocument {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    fn node_templates(&self) -> &Mapping {
        static EMPTY: std::sync::OnceLock<Mapping> = std::sync::OnceLock::new();
        self.topology_template
            .node_templates
            .as_ref()
            .unwrap_or_else(|| EMPTY.get_or_init(Mapping::new))
    }

    /// Provider namespace, taken from the first node template's type
    pub fn provider(&self) -> Result<String> {
        let (name, body) = self
            .node_templates()
            .iter()
            .next()
            .ok_or_else(|| Error::Topology("topology has no node templates".into()))?;
        let type_name = template_type(name, body)?;
        TypeName::parse(type_name)
            .map(|t| t.namespace)
            .ok_or_else(|| Error::Topology(format!("node '{name}' has unqualified type '{type_name}'")))
    }
}

impl TypeDefinitions {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }
}

fn template_type<'a>(name: &str, body: &'a Value) -> Result<&'a str> {
    body.get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Topology(format!("template '{name}' has no type")))
}

// ============================================================================
// Type catalog
// ============================================================================

/// Flattened type definitions plus the set of software types
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    definitions: BTreeMap<String, Mapping>,
    software: BTreeSet<String>,
}

impl TypeCatalog {
    /// Flatten every definition with its `derived_from` ancestors.
    ///
    /// Parents outside `provider`'s namespace may be absent (normative
    /// types); a missing provider parent is an error.
    pub fn build(raw: &Mapping, provider: &str) -> Result<Self> {
        let mut catalog = Self::default();
        let mut visiting = BTreeSet::new();
        for name in raw.keys() {
            catalog.flatten(raw, name, provider, &mut visiting)?;
        }
        Ok(catalog)
    }

    fn flatten(
        &mut self,
        raw: &Mapping,
        name: &str,
        provider: &str,
        visiting: &mut BTreeSet<String>,
    ) -> Result<()> {
        if self.definitions.contains_key(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(Error::SelfDerivedType(name.to_string()));
        }

        let own = raw.get(name).and_then(Value::as_object).cloned().unwrap_or_default();
        let mut is_software = short_name(name) == SOFTWARE_COMPONENT;
        let mut definition = own.clone();

        if let Some(parent) = own.get("derived_from").and_then(Value::as_str) {
            if parent == name {
                return Err(Error::SelfDerivedType(name.to_string()));
            }
            if raw.contains_key(parent) {
                self.flatten(raw, parent, provider, visiting)?;
                let mut merged = self.definitions.get(parent).cloned().unwrap_or_default();
                deep_merge(&mut merged, &own);
                definition = merged;
                is_software |= self.software.contains(parent);
            } else if TypeName::parse(parent).is_some_and(|t| t.namespace == provider) {
                return Err(Error::UnknownType(parent.to_string()));
            } else {
                is_software |= short_name(parent) == SOFTWARE_COMPONENT;
            }
        }

        if is_software {
            self.software.insert(name.to_string());
        }
        self.definitions.insert(name.to_string(), definition);
        visiting.remove(name);
        Ok(())
    }

    pub fn definition(&self, type_name: &str) -> Option<&Mapping> {
        self.definitions.get(type_name)
    }

    /// Whether a type is, or derives from, the software component type
    pub fn is_software(&self, type_name: &str) -> bool {
        self.software.contains(type_name) || short_name(type_name) == SOFTWARE_COMPONENT
    }
}

fn short_name(type_name: &str) -> &str {
    type_name.rsplit('.').next().unwrap_or(type_name)
}

// ============================================================================
// Topology
// ============================================================================

/// A topology ready for dependency resolution
#[derive(Debug, Clone)]
pub struct Topology {
    pub provider: String,
    /// Input definitions (`type`, `default`, ...)
    pub inputs: Mapping,
    pub outputs: Mapping,
    /// Provider nodes then relationships, in declaration order
    pub resources: Vec<ResourceTemplate>,
    pub catalog: TypeCatalog,
}

impl Topology {
    /// Parse a topology, pulling provider definitions from settings.
    pub fn load(source: &str, settings: &Settings, host_ip_parameter: &str) -> Result<Self> {
        let document = TopologyDocument::parse(source)?;
        let provider = document.provider()?;
        let provider_config = settings.provider(&provider)?;

        let external = match provider_config.definition_path() {
            Some(path) => {
                let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                log::debug!("Loaded {} type definitions from {}", provider, path.display());
                TypeDefinitions::parse(&content)?
            }
            None => TypeDefinitions::default(),
        };

        Self::build(document, external, host_ip_parameter)
    }

    /// Build from an already parsed document and provider definitions.
    pub fn build(
        document: TopologyDocument,
        external: TypeDefinitions,
        host_ip_parameter: &str,
    ) -> Result<Self> {
        let provider = document.provider()?;

        let mut raw_types = Mapping::new();
        for section in [
            external.node_types,
            external.relationship_types,
            document.node_types.clone(),
            document.relationship_types.clone(),
        ]
        .into_iter()
        .flatten()
        {
            raw_types.extend(section);
        }
        let catalog = TypeCatalog::build(&raw_types, &provider)?;

        let host_ip_parameter = if HOST_IP_PARAMETERS.contains(&host_ip_parameter) {
            host_ip_parameter
        } else {
            "private_address"
        };

        let section = &document.topology_template;
        let node_templates = document.node_templates();
        let relationship_templates = section.relationship_templates.clone().unwrap_or_default();

        let builder = Builder {
            provider: &provider,
            catalog: &catalog,
            node_templates,
            relationship_templates: &relationship_templates,
            host_ip_parameter,
        };
        let links = builder.relationship_links()?;

        let mut resources = Vec::new();
        for (name, body) in node_templates {
            if let Some(resource) = builder.node(name, body)? {
                resources.push(resource);
            }
        }
        for (name, body) in &relationship_templates {
            resources.push(builder.relationship(name, body, links.get(name))?);
        }

        Ok(Self {
            provider,
            inputs: section.inputs.clone().unwrap_or_default(),
            outputs: section.outputs.clone().unwrap_or_default(),
            resources,
            catalog,
        })
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceTemplate> {
        self.resources.iter().find(|r| r.name == name)
    }
}

struct Builder<'a> {
    provider: &'a str,
    catalog: &'a TypeCatalog,
    node_templates: &'a Mapping,
    relationship_templates: &'a Mapping,
    host_ip_parameter: &'a str,
}

impl Builder<'_> {
    /// Source and target of every relationship template named by a requirement
    fn relationship_links(&self) -> Result<BTreeMap<String, (String, Option<String>)>> {
        let mut links = BTreeMap::new();
        for (name, body) in self.node_templates {
            for req in parse_requirements(name, body.get("requirements"))? {
                if let Some(rel) = req.relationship.as_deref()
                    && TypeName::parse(rel).is_none()
                {
                    if !self.relationship_templates.contains_key(rel) {
                        return Err(Error::UndeclaredTarget {
                            from: name.clone(),
                            target: rel.to_string(),
                        });
                    }
                    links.insert(rel.to_string(), (name.clone(), req.node.clone()));
                }
            }
        }
        Ok(links)
    }

    fn node(&self, name: &str, body: &Value) -> Result<Option<ResourceTemplate>> {
        let type_name = template_type(name, body)?;
        let parsed = TypeName::parse(type_name);
        let is_software = self.catalog.is_software(type_name);
        let in_provider = parsed.as_ref().is_some_and(|t| t.namespace == self.provider);
        let is_node = parsed.as_ref().and_then(TypeName::kind) == Some(ElementKind::Node);

        if (!in_provider && !is_software) || !is_node {
            log::warn!(
                "Node '{}' of type '{}' is not a software component and not a '{}' node, it will be ignored",
                name,
                type_name,
                self.provider
            );
            return Ok(None);
        }

        let definition = match self.catalog.definition(type_name) {
            Some(def) => def.clone(),
            None if in_provider => return Err(Error::UnknownType(type_name.to_string())),
            None => Mapping::new(),
        };

        let mut tmpl = body.as_object().cloned().unwrap_or_default();
        apply_property_defaults(&mut tmpl, &definition);

        let mut requirements = parse_requirements(name, body.get("requirements"))?;
        for req in &mut requirements {
            let Some(target) = req.node.clone() else {
                continue;
            };
            if TypeName::parse(&target).is_some() {
                continue;
            }
            let target_body = self.node_templates.get(&target).ok_or_else(|| {
                Error::UndeclaredTarget {
                    from: name.to_string(),
                    target: target.clone(),
                }
            })?;
            req.node_filter = Some(node_filter(target_body));
        }

        let requirement_defs = requirement_definitions(&definition);
        let host_link = self.host_link(name, &requirements, &requirement_defs)?;

        let requirement_node_types = requirement_defs
            .iter()
            .filter_map(|(_, def)| def.get("node").and_then(Value::as_str))
            .filter(|node_type| *node_type != type_name)
            .map(str::to_string)
            .collect();

        let mut configuration_args = declared_properties(&tmpl, &definition);
        configuration_args.extend(capability_arguments(&tmpl, &definition));
        configuration_args.extend(requirement_arguments(&requirements));

        Ok(Some(ResourceTemplate {
            name: name.to_string(),
            kind: ElementKind::Node,
            type_name: type_name.to_string(),
            attribute_names: attribute_names(&tmpl, &definition),
            host_address: host_link
                .as_ref()
                .map(|host| format!("{host}_{}", self.host_ip_parameter)),
            host_link,
            tmpl,
            requirements,
            is_software_component: is_software,
            source: None,
            target: None,
            configuration_args,
            requirement_node_types,
        }))
    }

    fn relationship(
        &self,
        name: &str,
        body: &Value,
        link: Option<&(String, Option<String>)>,
    ) -> Result<ResourceTemplate> {
        let type_name = template_type(name, body)?;
        let definition = self.catalog.definition(type_name).cloned().unwrap_or_default();
        let mut tmpl = body.as_object().cloned().unwrap_or_default();
        apply_property_defaults(&mut tmpl, &definition);

        let (source, target) = match link {
            Some((source, target)) => (Some(source.clone()), target.clone()),
            None => {
                log::warn!("Relationship '{}' is not used by any requirement", name);
                (None, None)
            }
        };
        if let Some(target) = &target
            && !self.node_templates.contains_key(target)
        {
            return Err(Error::UndeclaredTarget {
                from: name.to_string(),
                target: target.clone(),
            });
        }

        Ok(ResourceTemplate {
            name: name.to_string(),
            kind: ElementKind::Relationship,
            type_name: type_name.to_string(),
            attribute_names: attribute_names(&tmpl, &definition),
            configuration_args: declared_properties(&tmpl, &definition),
            tmpl,
            requirements: Vec::new(),
            is_software_component: false,
            host_link: None,
            host_address: None,
            source,
            target,
            requirement_node_types: Vec::new(),
        })
    }

    /// Target of the single `HostedOn` requirement, if any
    fn host_link(
        &self,
        name: &str,
        requirements: &[Requirement],
        definitions: &[(String, Mapping)],
    ) -> Result<Option<String>> {
        let mut host = None;
        for req in requirements {
            let relationship = req.relationship.clone().or_else(|| {
                definitions
                    .iter()
                    .find(|(def_name, _)| *def_name == req.name)
                    .and_then(|(_, def)| def.get("relationship"))
                    .and_then(relationship_type_of)
            });
            let Some(relationship) = relationship else {
                continue;
            };
            let relationship_type = match self.relationship_templates.get(&relationship) {
                Some(body) => template_type(&relationship, body)?.to_string(),
                None => relationship,
            };
            if short_name(&relationship_type) == HOSTED_ON
                && let Some(node) = &req.node
            {
                if host.is_some() {
                    return Err(Error::Topology(format!(
                        "node '{name}' can be hosted only on one node"
                    )));
                }
                host = Some(node.clone());
            }
        }
        Ok(host)
    }
}

// ============================================================================
// Template helpers
// ============================================================================

fn relationship_type_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("type").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Parse the `requirements` list of a node template.
///
/// Each element is a single-key mapping; the value is either a node name or
/// a mapping with `node`, `relationship`, `capability` and `node_filter`.
pub fn parse_requirements(owner: &str, raw: Option<&Value>) -> Result<Vec<Requirement>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let list = raw.as_array().ok_or_else(|| {
        Error::Topology(format!("requirements of '{owner}' must be a list"))
    })?;

    let mut requirements = Vec::new();
    for entry in list {
        let entry = entry.as_object().ok_or_else(|| {
            Error::Topology(format!("requirement of '{owner}' must be a mapping"))
        })?;
        for (name, body) in entry {
            let requirement = match body {
                Value::String(node) => Requirement {
                    name: name.clone(),
                    node: Some(node.clone()),
                    relationship: None,
                    capability: None,
                    node_filter: None,
                },
                Value::Object(fields) => Requirement {
                    name: name.clone(),
                    node: fields.get("node").and_then(Value::as_str).map(str::to_string),
                    relationship: fields.get("relationship").and_then(relationship_type_of),
                    capability: fields
                        .get("capability")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    node_filter: fields.get("node_filter").and_then(Value::as_object).cloned(),
                },
                _ => {
                    return Err(Error::Topology(format!(
                        "requirement '{name}' of '{owner}' has an unsupported shape"
                    )));
                }
            };
            requirements.push(requirement);
        }
    }
    Ok(requirements)
}

/// Requirement definitions of a type as `(name, definition)` pairs
fn requirement_definitions(definition: &Mapping) -> Vec<(String, Mapping)> {
    definition
        .get("requirements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .flat_map(|entry| {
            entry.iter().filter_map(|(name, def)| {
                def.as_object().map(|def| (name.clone(), def.clone()))
            })
        })
        .collect()
}

fn apply_property_defaults(tmpl: &mut Mapping, definition: &Mapping) {
    let Some(property_defs) = definition.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (prop_name, prop_def) in property_defs {
        let Some(default) = prop_def.get("default").filter(|d| !d.is_null()) else {
            continue;
        };
        let properties = tmpl
            .entry("properties")
            .or_insert_with(|| Value::Object(Mapping::new()));
        if let Value::Object(properties) = properties
            && properties.get(prop_name).is_none_or(Value::is_null)
        {
            properties.insert(prop_name.clone(), default.clone());
        }
    }
}

/// Template properties declared by the type definition
fn declared_properties(tmpl: &Mapping, definition: &Mapping) -> Mapping {
    let values = tmpl.get("properties").and_then(Value::as_object);
    definition
        .get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|defs| defs.keys())
        .filter_map(|key| {
            values
                .and_then(|v| v.get(key))
                .filter(|v| !v.is_null())
                .map(|v| (key.clone(), v.clone()))
        })
        .collect()
}

/// Capability properties declared by the type's capability definitions
fn capability_arguments(tmpl: &Mapping, definition: &Mapping) -> Mapping {
    let mut args = Mapping::new();
    let Some(capability_defs) = definition.get("capabilities").and_then(Value::as_object) else {
        return args;
    };
    for (cap_name, cap_def) in capability_defs {
        let Some(values) = tmpl
            .get("capabilities")
            .and_then(|caps| caps.get(cap_name))
            .and_then(|cap| cap.get("properties"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let declared = cap_def.get("properties").and_then(Value::as_object);
        for key in declared.into_iter().flat_map(|d| d.keys()) {
            if let Some(value) = values.get(key).filter(|v| is_truthy(v)) {
                args.insert(key.clone(), value.clone());
            }
        }
    }
    args
}

/// Non-dependency requirements rendered as their target node names
fn requirement_arguments(requirements: &[Requirement]) -> Mapping {
    let mut args = Mapping::new();
    for req in requirements.iter().filter(|r| r.name != DEPENDENCY) {
        let Some(node) = &req.node else {
            continue;
        };
        let value = Value::String(node.clone());
        match args.get_mut(&req.name) {
            Some(Value::Array(list)) => list.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                args.insert(req.name.clone(), value);
            }
        }
    }
    args
}

fn attribute_names(tmpl: &Mapping, definition: &Mapping) -> Vec<String> {
    let mut names = BTreeSet::new();
    for source in [tmpl, definition] {
        if let Some(attributes) = source.get("attributes").and_then(Value::as_object) {
            names.extend(attributes.keys().cloned());
        }
    }
    names.insert("id".to_string());
    names.into_iter().collect()
}

/// Properties of a requirement's target, used for path traversal
fn node_filter(target: &Value) -> Mapping {
    let mut filter = Mapping::new();
    if let Some(properties) = target.get("properties").and_then(Value::as_object) {
        filter.insert("properties".into(), Value::Object(properties.clone()));
    }
    if let Some(capabilities) = target.get("capabilities").and_then(Value::as_object) {
        let caps: Mapping = capabilities
            .iter()
            .map(|(cap_name, cap)| {
                let props = cap
                    .get("properties")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Mapping::new()));
                let mut body = Mapping::new();
                body.insert("properties".into(), props);
                (cap_name.clone(), Value::Object(body))
            })
            .collect();
        filter.insert("capabilities".into(), Value::Object(caps));
    }
    filter
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    }
}
