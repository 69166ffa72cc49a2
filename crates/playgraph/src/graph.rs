//! Dependency resolver - builds the operation graph of a topology
//!
//! Every node resource expands into a chain of lifecycle operations
//! (`create → configure → start → stop → delete`, restricted to what its
//! `Standard` interface implements). Relationship operations are spliced in
//! next to the source/target operations they configure.

use crate::error::{Error, Result};
use crate::types::{ElementKind, LifecycleOp, OperationKey, OperationNode, ResourceTemplate, TypeName};
use std::collections::{BTreeMap, BTreeSet};

/// Relationship operations that are recognized but never scheduled
const UNSUPPORTED_RELATIONSHIP_OPS: [&str; 3] = ["add_target", "target_changed", "remove_target"];

/// Reserved selector for the referencing resource itself
const SELF: &str = "SELF";

/// Operations keyed by `(resource, operation)` with their dependencies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: BTreeMap<OperationKey, OperationNode>,
    /// Every node is a key; values are the keys it depends on
    edges: BTreeMap<OperationKey, BTreeSet<OperationKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node with no dependencies (keeps existing edges)
    pub fn insert(&mut self, node: OperationNode) {
        self.edges.entry(node.key.clone()).or_default();
        self.nodes.insert(node.key.clone(), node);
    }

    /// Record that `dependent` must wait for `dependency`
    pub fn add_edge(&mut self, dependent: &OperationKey, dependency: &OperationKey) {
        self.edges
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
    }

    pub fn node(&self, key: &OperationKey) -> Option<&OperationNode> {
        self.nodes.get(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OperationNode> {
        self.nodes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &OperationKey> {
        self.edges.keys()
    }

    pub fn contains(&self, key: &OperationKey) -> bool {
        self.edges.contains_key(key)
    }

    /// Keys `key` depends on
    pub fn dependencies(&self, key: &OperationKey) -> impl Iterator<Item = &OperationKey> {
        self.edges.get(key).into_iter().flatten()
    }

    /// All `(dependent, dependency)` pairs
    pub fn edges(&self) -> impl Iterator<Item = (&OperationKey, &OperationKey)> {
        self.edges
            .iter()
            .flat_map(|(from, deps)| deps.iter().map(move |to| (from, to)))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// First operation node of the named resource, searching the live graph
    pub fn find_by_name(&self, name: &str) -> Option<&OperationNode> {
        self.nodes.values().find(|node| node.name() == name)
    }

    /// Operations of one resource, in key order
    pub fn operations_of(&self, name: &str) -> Vec<LifecycleOp> {
        self.edges
            .keys()
            .filter(|key| key.resource == name)
            .map(|key| key.operation)
            .collect()
    }

    /// The graph with every edge inverted.
    ///
    /// Graphs with at most one node are their own reversal.
    pub fn reversed(&self) -> Self {
        if self.len() <= 1 {
            return self.clone();
        }
        let mut reversed = Self {
            nodes: self.nodes.clone(),
            edges: self.edges.keys().map(|k| (k.clone(), BTreeSet::new())).collect(),
        };
        for (dependent, dependency) in self.edges() {
            reversed.add_edge(dependency, dependent);
        }
        reversed
    }

    /// Kahn ordering; a leftover node means a cycle
    pub fn topological_order(&self) -> Result<Vec<OperationKey>> {
        let mut remaining: BTreeMap<&OperationKey, usize> = self
            .edges
            .iter()
            .map(|(key, deps)| (key, deps.len()))
            .collect();
        let mut dependents: BTreeMap<&OperationKey, Vec<&OperationKey>> = BTreeMap::new();
        for (dependent, dependency) in self.edges() {
            dependents.entry(dependency).or_default().push(dependent);
        }

        let mut ready: BTreeSet<&OperationKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(key) = ready.pop_first() {
            order.push(key.clone());
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < self.len() {
            let placed: BTreeSet<&OperationKey> = order.iter().collect();
            let stuck: Vec<String> = self
                .edges
                .keys()
                .filter(|key| !placed.contains(key))
                .map(ToString::to_string)
                .collect();
            return Err(Error::Cycle(stuck.join(", ")));
        }
        Ok(order)
    }
}

/// Build the forward and teardown graphs of a set of resources.
pub fn build_graph(resources: &[ResourceTemplate]) -> Result<(DependencyGraph, DependencyGraph)> {
    let by_name: BTreeMap<&str, &ResourceTemplate> =
        resources.iter().map(|r| (r.name.as_str(), r)).collect();
    let template_deps = template_dependencies(resources, &by_name);

    let mut graph = DependencyGraph::new();

    // Node chains
    for resource in resources.iter().filter(|r| r.kind == ElementKind::Node) {
        let mut chain = vec![LifecycleOp::Create];
        chain.extend(
            LifecycleOp::NODE_CHAIN
                .into_iter()
                .filter(|op| resource.implements(*op)),
        );
        for op in &chain {
            graph.insert(OperationNode::new(resource.clone(), *op));
        }
        for pair in chain.windows(2) {
            graph.add_edge(
                &OperationKey::new(&resource.name, pair[1]),
                &OperationKey::new(&resource.name, pair[0]),
            );
        }
    }

    // External dependencies attach to `create`, pointing at the last
    // operation of each dependency's chain
    for (name, deps) in &template_deps {
        let Some(resource) = by_name.get(name.as_str()) else {
            continue;
        };
        if resource.kind != ElementKind::Node {
            continue;
        }
        let create = OperationKey::new(name.as_str(), LifecycleOp::Create);
        for dep in deps {
            let latest = LifecycleOp::REVERSED_NODE_CHAIN
                .into_iter()
                .map(|op| OperationKey::new(dep.as_str(), op))
                .find(|key| graph.contains(key));
            if let Some(latest) = latest {
                graph.add_edge(&create, &latest);
            }
        }
    }

    for resource in resources.iter().filter(|r| r.kind == ElementKind::Relationship) {
        add_relationship_operations(&mut graph, resource)?;
    }

    graph.topological_order()?;
    let reversed = graph.reversed();
    log::debug!(
        "Built operation graph: {} operations, {} edges",
        graph.len(),
        graph.edge_count()
    );
    Ok((graph, reversed))
}

/// Resource-level dependencies, restricted to declared resources
fn template_dependencies(
    resources: &[ResourceTemplate],
    by_name: &BTreeMap<&str, &ResourceTemplate>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut add = |from: &str, to: &str| {
        if to != SELF && from != to && by_name.contains_key(to) {
            deps.entry(from.to_string()).or_default().insert(to.to_string());
        }
    };

    for resource in resources {
        for req in &resource.requirements {
            if let Some(rel) = req.relationship.as_deref()
                && TypeName::parse(rel).is_none()
                && let Some(target) = by_name.get(rel).and_then(|r| r.target.as_deref())
            {
                add(&resource.name, target);
            }
            if let Some(node) = req.node.as_deref()
                && TypeName::parse(node).is_none()
            {
                add(&resource.name, node);
            }
        }
        for other in resources {
            if resource.requirement_node_types.contains(&other.type_name) {
                add(&resource.name, &other.name);
            }
        }
    }
    deps
}

fn add_relationship_operations(graph: &mut DependencyGraph, rel: &ResourceTemplate) -> Result<()> {
    let Some(configure) = rel.interface(rel.kind.interface()) else {
        return Ok(());
    };
    for op in UNSUPPORTED_RELATIONSHIP_OPS {
        if configure.contains_key(op) {
            log::warn!("Operation {} of '{}' is not supported, it will be skipped", op, rel.name);
        }
    }

    let implemented: Vec<LifecycleOp> = [
        LifecycleOp::PreConfigureSource,
        LifecycleOp::PreConfigureTarget,
        LifecycleOp::PostConfigureSource,
        LifecycleOp::PostConfigureTarget,
        LifecycleOp::AddSource,
    ]
    .into_iter()
    .filter(|op| configure.contains_key(op.as_str()))
    .collect();
    if implemented.is_empty() {
        return Ok(());
    }

    for op in implemented {
        let peer = if op.acts_on_source() { &rel.source } else { &rel.target };
        let Some(peer) = peer else {
            let side = if op.acts_on_source() { "source" } else { "target" };
            log::warn!("Relationship '{}' has no {} peer, {} skipped", rel.name, side, op);
            continue;
        };

        let anchor_op = match op {
            LifecycleOp::PostConfigureSource | LifecycleOp::PostConfigureTarget
                if graph.contains(&OperationKey::new(peer.as_str(), LifecycleOp::Configure)) =>
            {
                LifecycleOp::Configure
            }
            _ => LifecycleOp::Create,
        };
        let anchor = OperationKey::new(peer.as_str(), anchor_op);
        if !graph.contains(&anchor) {
            return Err(Error::UndeclaredTarget {
                from: rel.name.clone(),
                target: peer.clone(),
            });
        }

        let banned = match op {
            LifecycleOp::PreConfigureSource => Some(LifecycleOp::AddSource),
            LifecycleOp::AddSource => Some(LifecycleOp::PreConfigureSource),
            _ => None,
        };
        graph.insert(OperationNode::new(rel.clone(), op));
        splice(graph, &OperationKey::new(rel.name.as_str(), op), &anchor, banned);
    }
    Ok(())
}

/// Run `rel_key` after `anchor` and before everything else waiting on `anchor`
fn splice(
    graph: &mut DependencyGraph,
    rel_key: &OperationKey,
    anchor: &OperationKey,
    banned: Option<LifecycleOp>,
) {
    graph.add_edge(rel_key, anchor);
    let banned_key = banned.map(|op| OperationKey::new(rel_key.resource.as_str(), op));
    let followers: Vec<OperationKey> = graph
        .edges
        .iter()
        .filter(|(key, deps)| {
            *key != rel_key && Some(*key) != banned_key.as_ref() && deps.contains(anchor)
        })
        .map(|(key, _)| key.clone())
        .collect();
    for follower in followers {
        graph.add_edge(&follower, rel_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn key(name: &str, op: LifecycleOp) -> OperationKey {
        OperationKey::new(name, op)
    }

    #[test]
    fn test_compute_with_fip_has_single_edge() {
        let topology = testing::topology(testing::COMPUTE_WITH_FIP);
        let (graph, _) = build_graph(&topology.resources).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 1);
        let edges: Vec<_> = graph.edges().collect();
        assert_eq!(
            edges,
            vec![(&key("fip", LifecycleOp::Create), &key("compute", LifecycleOp::Create))]
        );
    }

    #[test]
    fn test_reversed_graph_inverts_every_edge() {
        let topology = testing::topology(testing::LINEAR_CHAIN);
        let (graph, reversed) = build_graph(&topology.resources).unwrap();

        assert_eq!(graph.edge_count(), reversed.edge_count());
        for (from, to) in graph.edges() {
            assert!(reversed.dependencies(to).any(|k| k == from), "missing {to} -> {from}");
        }
        for key in graph.keys() {
            assert!(reversed.contains(key));
        }
    }

    #[test]
    fn test_single_node_reversal_is_identity() {
        let topology = testing::topology(testing::SINGLE_SERVER);
        let (graph, reversed) = build_graph(&topology.resources).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph, reversed);
    }

    #[test]
    fn test_chain_follows_implemented_operations() {
        let topology = testing::topology(testing::SOFTWARE_ON_SERVER);
        let (graph, _) = build_graph(&topology.resources).unwrap();

        assert_eq!(
            graph.operations_of("app"),
            vec![LifecycleOp::Create, LifecycleOp::Configure, LifecycleOp::Start]
        );
        let start: Vec<_> = graph.dependencies(&key("app", LifecycleOp::Start)).collect();
        assert_eq!(start, vec![&key("app", LifecycleOp::Configure)]);
        let create: Vec<_> = graph.dependencies(&key("app", LifecycleOp::Create)).collect();
        assert_eq!(create, vec![&key("server", LifecycleOp::Create)]);
    }

    #[test]
    fn test_dependency_attaches_to_end_of_chain() {
        let topology = testing::topology(testing::SOFTWARE_ON_SERVER);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        // `site` requires `app`, whose chain ends with `start`
        let create: Vec<_> = graph.dependencies(&key("site", LifecycleOp::Create)).collect();
        assert_eq!(create, vec![&key("app", LifecycleOp::Start)]);
    }

    #[test]
    fn test_relationship_operations_are_spliced() {
        let topology = testing::topology(testing::RELATIONSHIP_TOPOLOGY);
        let (graph, _) = build_graph(&topology.resources).unwrap();

        let pre_source = key("attach", LifecycleOp::PreConfigureSource);
        let pre_target = key("attach", LifecycleOp::PreConfigureTarget);
        let add_source = key("attach", LifecycleOp::AddSource);

        assert!(graph.dependencies(&pre_source).any(|k| *k == key("server", LifecycleOp::Create)));
        assert!(graph.dependencies(&pre_target).any(|k| *k == key("volume", LifecycleOp::Create)));
        // server:configure waited on server:create, so it now waits on the hook too
        assert!(
            graph
                .dependencies(&key("server", LifecycleOp::Configure))
                .any(|k| *k == pre_source)
        );
        assert!(!graph.dependencies(&pre_source).any(|k| *k == add_source));
        assert!(!graph.dependencies(&add_source).any(|k| *k == pre_source));
        assert!(!graph.contains(&OperationKey::new("attach", LifecycleOp::Create)));
    }

    #[test]
    fn test_unsupported_relationship_operations_are_not_scheduled() {
        let topology = testing::topology(testing::SOFTWARE_RELATIONSHIP);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        assert_eq!(
            graph.operations_of("connect"),
            vec![LifecycleOp::PreConfigureSource, LifecycleOp::PreConfigureTarget]
        );
    }

    #[test]
    fn test_post_configure_anchors_on_configure() {
        let topology = testing::topology(testing::RELATIONSHIP_TOPOLOGY);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        let post_source = key("attach", LifecycleOp::PostConfigureSource);
        assert!(
            graph
                .dependencies(&post_source)
                .any(|k| *k == key("server", LifecycleOp::Configure))
        );
    }

    #[test]
    fn test_cycle_is_fatal() {
        let source = r#"
topology_template:
  node_templates:
    a:
      type: openstack.nodes.Server
      requirements:
        - dependency: b
    b:
      type: openstack.nodes.Server
      requirements:
        - dependency: a
"#;
        let topology = testing::topology(source);
        let err = build_graph(&topology.resources).unwrap_err();
        assert!(matches!(err, Error::Cycle(msg) if msg.contains("a:create")));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let topology = testing::topology(testing::LINEAR_CHAIN);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        let order = graph.topological_order().unwrap();
        let position = |k: &OperationKey| order.iter().position(|o| o == k).unwrap();
        for (from, to) in graph.edges() {
            assert!(position(to) < position(from));
        }
    }

    #[test]
    fn test_find_by_name() {
        let topology = testing::topology(testing::COMPUTE_WITH_FIP);
        let (graph, _) = build_graph(&topology.resources).unwrap();
        assert_eq!(graph.find_by_name("fip").unwrap().operation(), LifecycleOp::Create);
        assert!(graph.find_by_name("ghost").is_none());
    }
}
