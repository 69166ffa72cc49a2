//! Intrinsic function resolver
//!
//! Evaluates `get_input`, `get_property`, `get_attribute`,
//! `get_operation_output`, `concat`, `join` and `token` expressions embedded
//! in templates. Cross-resource reads go through the instance state store
//! and always use instance 1: the declared template merged with whatever
//! the first instance reported so far.

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::state::InstanceStore;
use crate::types::{
    Mapping, OperationNode, Requirement, ResourceTemplate, TypeName, Value, value_to_string,
};

/// Nesting limit for expressions whose results contain expressions
const MAX_DEPTH: usize = 32;

/// Revision every cross-reference reads from
const BASE_REVISION: usize = 1;

pub const GET_INPUT: &str = "get_input";
pub const GET_PROPERTY: &str = "get_property";
pub const GET_ATTRIBUTE: &str = "get_attribute";
pub const GET_OPERATION_OUTPUT: &str = "get_operation_output";
pub const CONCAT: &str = "concat";
pub const JOIN: &str = "join";
pub const TOKEN: &str = "token";

const FUNCTIONS: [&str; 7] = [
    GET_INPUT,
    GET_PROPERTY,
    GET_ATTRIBUTE,
    GET_OPERATION_OUTPUT,
    CONCAT,
    JOIN,
    TOKEN,
];

/// The resource an expression is evaluated for
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub name: &'a str,
    pub host: Option<&'a str>,
    pub source: Option<&'a str>,
    pub target: Option<&'a str>,
}

impl<'a> Scope<'a> {
    /// Scope without selector links
    pub fn named(name: &'a str) -> Self {
        Self {
            name,
            host: None,
            source: None,
            target: None,
        }
    }
}

impl<'a> From<&'a ResourceTemplate> for Scope<'a> {
    fn from(tmpl: &'a ResourceTemplate) -> Self {
        Self {
            name: &tmpl.name,
            host: tmpl.host_link.as_deref(),
            source: tmpl.source.as_deref(),
            target: tmpl.target.as_deref(),
        }
    }
}

/// If `value` is a single-key mapping naming a function, its name and args
pub fn as_function(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (name, args) = map.iter().next()?;
    FUNCTIONS.contains(&name.as_str()).then_some((name.as_str(), args))
}

/// Evaluates expressions against the graph, the store and topology inputs
pub struct Resolver<'a> {
    graph: &'a DependencyGraph,
    store: &'a InstanceStore,
    /// Input definitions from the topology
    inputs: &'a Mapping,
    /// Values supplied for this run
    input_values: &'a Mapping,
}

impl<'a> Resolver<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        store: &'a InstanceStore,
        inputs: &'a Mapping,
        input_values: &'a Mapping,
    ) -> Self {
        Self {
            graph,
            store,
            inputs,
            input_values,
        }
    }

    /// Resolve every expression inside `value`
    pub fn resolve(&self, value: &Value, scope: Scope<'_>) -> Result<Value> {
        self.resolve_at(value, scope, 0)
    }

    /// Resolve what the emitters read for this operation, in place: the
    /// configuration arguments and the operation's interface entry
    pub fn resolve_node(&self, node: &mut OperationNode) -> Result<()> {
        let tmpl = &node.tmpl;
        let scope = Scope::from(tmpl);
        let args = self.resolve(&Value::Object(tmpl.configuration_args.clone()), scope)?;

        let interface = tmpl.kind.interface();
        let op = node.key.operation.as_str();
        let entry = tmpl
            .interface(interface)
            .and_then(|ops| ops.get(op))
            .map(|entry| self.resolve(entry, scope))
            .transpose()?;

        if let Value::Object(args) = args {
            node.tmpl.configuration_args = args;
        }
        if let Some(entry) = entry
            && let Some(ops) = node
                .tmpl
                .tmpl
                .get_mut("interfaces")
                .and_then(|i| i.get_mut(interface))
                .and_then(Value::as_object_mut)
        {
            ops.insert(op.to_string(), entry);
        }
        Ok(())
    }

    fn resolve_at(&self, value: &Value, scope: Scope<'_>, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::resolution(
                "expression",
                scope.name,
                "nesting too deep, expressions may reference each other",
            ));
        }
        if let Some((function, args)) = as_function(value) {
            return self.call(function, args, scope, depth);
        }
        match value {
            Value::Object(map) => {
                let mut resolved = Mapping::new();
                for (key, child) in map {
                    resolved.insert(key.clone(), self.resolve_at(child, scope, depth + 1)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_at(item, scope, depth + 1))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn call(&self, function: &str, args: &Value, scope: Scope<'_>, depth: usize) -> Result<Value> {
        let args = self.resolve_at(args, scope, depth + 1)?;
        match function {
            GET_INPUT => self.get_input(&args, scope),
            GET_PROPERTY | GET_ATTRIBUTE => {
                let (target, found) = self.get_value(function, &args, scope)?;
                let target_scope = self
                    .graph
                    .find_by_name(target.as_str())
                    .map(|node| Scope::from(&node.tmpl))
                    .unwrap_or_else(|| Scope::named(target.as_str()));
                self.resolve_at(&found, target_scope, depth + 1)
            }
            GET_OPERATION_OUTPUT => self.get_operation_output(&args, scope),
            CONCAT => {
                let items = list_args(function, &args, scope)?;
                Ok(Value::String(items.iter().map(value_to_string).collect()))
            }
            JOIN => join(&args, scope),
            TOKEN => token(&args, scope),
            other => Err(Error::resolution(other, scope.name, "unknown function")),
        }
    }

    fn get_input(&self, args: &Value, scope: Scope<'_>) -> Result<Value> {
        let name = match args {
            Value::String(s) => s.as_str(),
            Value::Array(items) if items.len() == 1 => items[0]
                .as_str()
                .ok_or_else(|| Error::resolution(GET_INPUT, scope.name, "input name must be a string"))?,
            _ => return Err(Error::resolution(GET_INPUT, scope.name, "expects an input name")),
        };
        if let Some(value) = self.input_values.get(name) {
            return Ok(value.clone());
        }
        self.inputs
            .get(name)
            .and_then(|def| def.get("default"))
            .filter(|d| !d.is_null())
            .cloned()
            .ok_or_else(|| Error::MissingInput(name.to_string()))
    }

    /// Rewrite `SELF`, `HOST`, `SOURCE` and `TARGET` to a resource name
    pub fn rewrite_selector(&self, function: &str, selector: &str, scope: Scope<'_>) -> Result<String> {
        let linked = |link: Option<&str>, what: &str| -> Result<String> {
            let name = link.ok_or_else(|| {
                Error::resolution(function, scope.name, format!("{selector} used without a {what}"))
            })?;
            if self.graph.find_by_name(name).is_none() && self.store.read(name, BASE_REVISION).is_none() {
                return Err(Error::resolution(
                    function,
                    scope.name,
                    format!("{what} '{name}' not found"),
                ));
            }
            Ok(name.to_string())
        };
        match selector {
            "SELF" => Ok(scope.name.to_string()),
            "HOST" => linked(scope.host, "host"),
            "SOURCE" => linked(scope.source, "source"),
            "TARGET" => linked(scope.target, "target"),
            literal => Ok(literal.to_string()),
        }
    }

    /// Evaluate `get_property` / `get_attribute`; returns the resource the
    /// value was found on together with the raw value
    fn get_value(&self, function: &str, args: &Value, scope: Scope<'_>) -> Result<(String, Value)> {
        let items = list_args(function, args, scope)?;
        if items.len() < 2 {
            return Err(Error::resolution(function, scope.name, "expects [target, name, ...]"));
        }
        let selector = items[0]
            .as_str()
            .ok_or_else(|| Error::resolution(function, scope.name, "target must be a string"))?;
        let target = self.rewrite_selector(function, selector, scope)?;
        let path: Vec<String> = items[1..].iter().map(value_to_string).collect();
        self.traverse(function, &target, &path, scope, 0)
    }

    fn traverse(
        &self,
        function: &str,
        resource: &str,
        path: &[String],
        scope: Scope<'_>,
        hops: usize,
    ) -> Result<(String, Value)> {
        let missing = |what: String| Error::resolution(function, scope.name, what);
        if hops > MAX_DEPTH {
            return Err(missing(format!("requirement chain from '{resource}' does not end")));
        }
        let Some((first, rest)) = path.split_first() else {
            return Ok((resource.to_string(), Value::String(resource.to_string())));
        };

        let snapshot = self.store.require(resource, BASE_REVISION)?;
        let template = &snapshot.template;

        // Requirement node filter, then the requirement's target node
        if let Some(req) = self.requirement(resource, template, first) {
            if let Some((key, tail)) = rest.split_first()
                && let Some(value) = req.node_filter.as_ref().and_then(|f| node_filter_lookup(f, key))
            {
                return descend(value, tail)
                    .map(|v| (resource.to_string(), v))
                    .ok_or_else(|| missing(format!("'{}' not found under requirement '{first}'", tail.join("."))));
            }
            if let Some(node) = req.node.as_deref()
                && TypeName::parse(node).is_none()
            {
                return self.traverse(function, node, rest, scope, hops + 1);
            }
        }

        // Capability properties / attributes
        if let Some(capability) = template
            .get("capabilities")
            .and_then(|caps| caps.get(first.as_str()))
            && let Some((key, tail)) = rest.split_first()
        {
            for section in sections(function) {
                if let Some(value) = capability.get(section).and_then(|s| s.get(key.as_str())) {
                    return descend(value, tail)
                        .map(|v| (resource.to_string(), v))
                        .ok_or_else(|| missing(format!("'{}' not found in capability '{first}'", tail.join("."))));
                }
            }
        }

        // Resource-level properties / attributes
        for section in sections(function) {
            if let Some(value) = template.get(section).and_then(|s| s.get(first.as_str())) {
                return descend(value, rest)
                    .map(|v| (resource.to_string(), v))
                    .ok_or_else(|| missing(format!("'{}' not found in '{resource}'", path.join("."))));
            }
        }

        Err(missing(format!("'{first}' is not defined for '{resource}'")))
    }

    fn requirement(&self, resource: &str, template: &Mapping, name: &str) -> Option<Requirement> {
        if let Some(node) = self.graph.find_by_name(resource) {
            return node.tmpl.requirement(name).cloned();
        }
        crate::topology::parse_requirements(resource, template.get("requirements"))
            .ok()?
            .into_iter()
            .find(|r| r.name == name)
    }

    fn get_operation_output(&self, args: &Value, scope: Scope<'_>) -> Result<Value> {
        let items = list_args(GET_OPERATION_OUTPUT, args, scope)?;
        let [selector, _interface, operation, output] = items.as_slice() else {
            return Err(Error::resolution(
                GET_OPERATION_OUTPUT,
                scope.name,
                "expects [target, interface, operation, output]",
            ));
        };
        let target = self.rewrite_selector(GET_OPERATION_OUTPUT, &value_to_string(selector), scope)?;
        let operation = value_to_string(operation).to_lowercase();
        let output = value_to_string(output);

        let snapshot = self.store.require(&target, BASE_REVISION)?;
        snapshot
            .template
            .get("outputs")
            .and_then(|o| o.get(operation.as_str()))
            .and_then(|o| o.get(output.as_str()))
            .cloned()
            .ok_or_else(|| {
                Error::resolution(
                    GET_OPERATION_OUTPUT,
                    scope.name,
                    format!("output '{output}' of {target}:{operation} was not recorded"),
                )
            })
    }
}

/// Section lookup order: attributes first for `get_attribute`
fn sections(function: &str) -> [&'static str; 2] {
    if function == GET_ATTRIBUTE {
        ["attributes", "properties"]
    } else {
        ["properties", "attributes"]
    }
}

fn node_filter_lookup<'f>(filter: &'f Mapping, key: &str) -> Option<&'f Value> {
    if let Some(value) = filter.get("properties").and_then(|p| p.get(key)) {
        return Some(value);
    }
    filter
        .get("capabilities")
        .and_then(Value::as_object)?
        .values()
        .find_map(|cap| cap.get("properties").and_then(|p| p.get(key)))
}

/// Follow the remaining path segments; numeric segments index lists
fn descend(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn list_args<'v>(function: &str, args: &'v Value, scope: Scope<'_>) -> Result<&'v Vec<Value>> {
    args.as_array()
        .ok_or_else(|| Error::resolution(function, scope.name, "arguments must be a list"))
}

fn join(args: &Value, scope: Scope<'_>) -> Result<Value> {
    let items = list_args(JOIN, args, scope)?;
    let (list, delimiter) = match items.as_slice() {
        [list] => (list, String::new()),
        [list, delimiter] => (list, value_to_string(delimiter)),
        _ => return Err(Error::resolution(JOIN, scope.name, "expects [list, delimiter]")),
    };
    let list = list_args(JOIN, list, scope)?;
    let parts: Vec<String> = list.iter().map(value_to_string).collect();
    Ok(Value::String(parts.join(&delimiter)))
}

fn token(args: &Value, scope: Scope<'_>) -> Result<Value> {
    let items = list_args(TOKEN, args, scope)?;
    let [string, delimiter, index] = items.as_slice() else {
        return Err(Error::resolution(
            TOKEN,
            scope.name,
            format!("expects [string, delimiter, index], got {} arguments", items.len()),
        ));
    };
    let index = index
        .as_u64()
        .or_else(|| index.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| Error::resolution(TOKEN, scope.name, "index must be a non-negative integer"))?;
    let string = value_to_string(string);
    let delimiter = value_to_string(delimiter);
    string
        .split(delimiter.as_str())
        .nth(usize::try_from(index).unwrap_or(usize::MAX))
        .map(|part| Value::String(part.to_string()))
        .ok_or_else(|| {
            Error::resolution(TOKEN, scope.name, format!("'{string}' has no token {index}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::state::StateField;
    use crate::testing;
    use serde_json::json;

    struct Fixture {
        graph: DependencyGraph,
        store: InstanceStore,
        inputs: Mapping,
    }

    fn fixture(source: &str) -> Fixture {
        let topology = testing::topology(source);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        let mut store = InstanceStore::in_memory("test");
        store.initialize(&topology.resources).unwrap();
        Fixture {
            graph,
            store,
            inputs: topology.inputs,
        }
    }

    impl Fixture {
        fn resolver<'a>(&'a self, values: &'a Mapping) -> Resolver<'a> {
            Resolver::new(&self.graph, &self.store, &self.inputs, values)
        }

        fn scope(&self, name: &str) -> Scope<'_> {
            Scope::from(&self.graph.find_by_name(name).unwrap().tmpl)
        }
    }

    #[test]
    fn test_plain_values_pass_through() {
        let fx = fixture(testing::COMPUTE_WITH_FIP);
        let values = Mapping::new();
        let value = json!({"a": [1, {"b": "c"}], "d": {"x": 1, "y": 2}});
        let resolved = fx.resolver(&values).resolve(&value, fx.scope("compute")).unwrap();
        assert_eq!(resolved, value);
    }

    #[test]
    fn test_get_input_value_default_and_missing() {
        let fx = fixture(testing::COMPUTE_WITH_FIP);
        let mut values = Mapping::new();
        values.insert("flavor".into(), json!("m1.large"));
        let resolver = fx.resolver(&values);
        let scope = fx.scope("compute");

        assert_eq!(resolver.resolve(&json!({"get_input": "flavor"}), scope).unwrap(), json!("m1.large"));
        assert_eq!(resolver.resolve(&json!({"get_input": "image"}), scope).unwrap(), json!("cirros"));
        assert!(matches!(
            resolver.resolve(&json!({"get_input": "key_name"}), scope),
            Err(Error::MissingInput(name)) if name == "key_name"
        ));
    }

    #[test]
    fn test_get_property_and_attribute() {
        let mut fx = fixture(testing::COMPUTE_WITH_FIP);
        fx.store
            .append(
                "compute",
                "openstack.nodes.Server",
                &[json!({"private_address": "10.0.0.5"}).as_object().cloned().unwrap()],
                StateField::Attributes,
                false,
            )
            .unwrap();
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let scope = fx.scope("fip");

        assert_eq!(
            resolver.resolve(&json!({"get_property": ["compute", "flavor"]}), scope).unwrap(),
            json!("m1.small")
        );
        assert_eq!(
            resolver.resolve(&json!({"get_attribute": ["compute", "private_address"]}), scope).unwrap(),
            json!("10.0.0.5")
        );
        assert!(matches!(
            resolver.resolve(&json!({"get_attribute": ["compute", "nothing"]}), scope),
            Err(Error::Resolution { .. })
        ));
    }

    #[test]
    fn test_self_selector_and_nested_path() {
        let fx = fixture(testing::COMPUTE_WITH_FIP);
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        assert_eq!(
            resolver
                .resolve(&json!({"get_property": ["SELF", "meta", "tags", 1]}), fx.scope("compute"))
                .unwrap(),
            json!("db")
        );
    }

    #[test]
    fn test_requirement_node_filter_and_hop() {
        let mut fx = fixture(testing::COMPUTE_WITH_FIP);
        fx.store
            .append(
                "compute",
                "openstack.nodes.Server",
                &[json!({"id": "srv-1"}).as_object().cloned().unwrap()],
                StateField::Attributes,
                false,
            )
            .unwrap();
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let scope = fx.scope("fip");
        // through the requirement's node filter
        assert_eq!(
            resolver.resolve(&json!({"get_property": ["SELF", "server", "flavor"]}), scope).unwrap(),
            json!("m1.small")
        );
        // hop to the target resource when the filter does not have it
        assert_eq!(
            resolver.resolve(&json!({"get_attribute": ["SELF", "server", "id"]}), scope).unwrap(),
            json!("srv-1")
        );
    }

    #[test]
    fn test_source_selector_matches_literal() {
        let mut fx = fixture(testing::RELATIONSHIP_TOPOLOGY);
        fx.store
            .append(
                "server",
                "openstack.nodes.Server",
                &[json!({"ip": "10.0.0.7"}).as_object().cloned().unwrap()],
                StateField::Attributes,
                false,
            )
            .unwrap();
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let scope = fx.scope("attach");

        let via_selector = resolver.resolve(&json!({"get_attribute": ["SOURCE", "ip"]}), scope).unwrap();
        let via_literal = resolver.resolve(&json!({"get_attribute": ["server", "ip"]}), scope).unwrap();
        assert_eq!(via_selector, via_literal);
        assert_eq!(via_selector, json!("10.0.0.7"));
    }

    #[test]
    fn test_host_selector_requires_host() {
        let fx = fixture(testing::SOFTWARE_ON_SERVER);
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        assert_eq!(
            resolver.resolve(&json!({"get_property": ["HOST", "flavor"]}), fx.scope("app")).unwrap(),
            json!("m1.small")
        );
        assert!(matches!(
            resolver.resolve(&json!({"get_property": ["HOST", "flavor"]}), fx.scope("server")),
            Err(Error::Resolution { .. })
        ));
    }

    #[test]
    fn test_string_functions() {
        let fx = fixture(testing::COMPUTE_WITH_FIP);
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let scope = fx.scope("compute");

        assert_eq!(
            resolver
                .resolve(&json!({"concat": ["http://", {"get_property": ["SELF", "flavor"]}, ":", 80]}), scope)
                .unwrap(),
            json!("http://m1.small:80")
        );
        assert_eq!(resolver.resolve(&json!({"join": [["a", "b", "c"], "-"]}), scope).unwrap(), json!("a-b-c"));
        assert_eq!(resolver.resolve(&json!({"join": [["a", "b"]]}), scope).unwrap(), json!("ab"));
        assert_eq!(
            resolver.resolve(&json!({"token": ["10.0.0.5", ".", 3]}), scope).unwrap(),
            json!("5")
        );
        assert!(resolver.resolve(&json!({"token": ["a.b", "."]}), scope).is_err());
        assert!(resolver.resolve(&json!({"token": ["a.b", ".", 7]}), scope).is_err());
    }

    #[test]
    fn test_get_operation_output() {
        let mut fx = fixture(testing::COMPUTE_WITH_FIP);
        fx.store
            .append(
                "compute",
                "openstack.nodes.Server",
                &[json!({"create": {"token": "abc"}}).as_object().cloned().unwrap()],
                StateField::Outputs,
                false,
            )
            .unwrap();
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let expr = json!({"get_operation_output": ["compute", "Standard", "Create", "token"]});
        assert_eq!(resolver.resolve(&expr, fx.scope("fip")).unwrap(), json!("abc"));

        let missing = json!({"get_operation_output": ["SELF", "Standard", "create", "token"]});
        assert!(resolver.resolve(&missing, fx.scope("fip")).is_err());
    }

    #[test]
    fn test_resolve_node_rewrites_arguments() {
        let fx = fixture(testing::COMPUTE_WITH_FIP);
        let values = Mapping::new();
        let resolver = fx.resolver(&values);
        let mut node = fx.graph.find_by_name("compute").unwrap().clone();
        resolver.resolve_node(&mut node).unwrap();
        assert_eq!(node.tmpl.configuration_args["image"], json!("cirros"));
    }

    #[test]
    fn test_as_function_requires_single_known_key() {
        assert!(as_function(&json!({"get_input": "x"})).is_some());
        assert!(as_function(&json!({"get_input": "x", "other": 1})).is_none());
        assert!(as_function(&json!({"not_a_function": 1})).is_none());
    }
}
