//! Operation scheduler
//!
//! Walks the dependency graph and renders one play per ready operation.
//! With an executor attached, plays are dispatched to a bounded worker pool
//! and their results flow back over a channel. The coordinating loop is the
//! only writer of node states and of the instance store, and a node is only
//! marked done after its results are recorded, so dependents always observe
//! them.

use crate::config::ProviderConfig;
use crate::context::{RunContext, SchedulerObserver};
use crate::emitter::{EmitContext, Emitter, Implementation, Play, render_script};
use crate::error::{Error, Result};
use crate::executor::{ExecutorClient, Job, JobOutcome, run_operation};
use crate::functions::Resolver;
use crate::graph::DependencyGraph;
use crate::state::{InstanceStore, StateField};
use crate::types::{Instruction, LifecycleOp, Mapping, OperationKey, OperationNode, Value};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// Back-off while waiting for completions
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Scheduling state of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Active,
    Done,
}

/// Executor and session settings for live runs
struct Live<'a> {
    client: &'a dyn ExecutorClient,
    inventory_path: String,
    env: BTreeMap<String, String>,
}

/// Drives one run over a dependency graph
pub struct Scheduler<'a> {
    emitter: &'a dyn Emitter,
    provider: &'a ProviderConfig,
    inputs: &'a Mapping,
    input_values: &'a Mapping,
    live: Option<Live<'a>>,
    jobs: usize,
}

impl<'a> Scheduler<'a> {
    /// A render-only scheduler
    pub fn new(
        emitter: &'a dyn Emitter,
        provider: &'a ProviderConfig,
        inputs: &'a Mapping,
        input_values: &'a Mapping,
    ) -> Self {
        Self {
            emitter,
            provider,
            inputs,
            input_values,
            live: None,
            jobs: 1,
        }
    }

    /// Dispatch rendered operations to `client`
    pub fn with_executor(
        mut self,
        client: &'a dyn ExecutorClient,
        inventory_path: impl Into<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        self.live = Some(Live {
            client,
            inventory_path: inventory_path.into(),
            env,
        });
        self
    }

    /// Bound on concurrently running operations
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn is_render_only(&self) -> bool {
        self.live.is_none()
    }

    /// Walk `graph` (or `reversed` for teardown runs) and return the
    /// rendered script.
    pub fn run(
        &self,
        graph: &DependencyGraph,
        reversed: &DependencyGraph,
        ctx: &RunContext,
        store: &mut InstanceStore,
        observer: &mut dyn SchedulerObserver,
    ) -> Result<String> {
        let graph = if ctx.is_delete { reversed } else { graph };
        graph.topological_order()?;
        let mut walk = Walk::new(graph);

        match &self.live {
            None => self.render_only(&mut walk, ctx, store, observer)?,
            Some(live) => {
                self.run_live(live, &mut walk, ctx, store, observer)?;
                if ctx.is_delete {
                    store.delete()?;
                }
            }
        }
        render_script(&walk.plays)
    }

    fn render_only(
        &self,
        walk: &mut Walk<'_>,
        ctx: &RunContext,
        store: &mut InstanceStore,
        observer: &mut dyn SchedulerObserver,
    ) -> Result<()> {
        loop {
            let ready = walk.promote();
            if ready.is_empty() {
                return walk.ensure_finished();
            }
            for key in ready {
                if self.step(&key, walk, ctx, store, observer)?.is_some() {
                    walk.set(&key, NodeState::Done);
                    observer.on_complete(&key);
                }
            }
        }
    }

    fn run_live(
        &self,
        live: &Live<'_>,
        walk: &mut Walk<'_>,
        ctx: &RunContext,
        store: &mut InstanceStore,
        observer: &mut dyn SchedulerObserver,
    ) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| Error::Protocol(format!("failed to create worker pool: {e}")))?;
        let (tx, rx) = mpsc::channel::<(OperationKey, Result<JobOutcome>)>();
        let client = live.client;
        let inventory_path = live.inventory_path.as_str();
        let env = &live.env;

        pool.in_place_scope(|scope| {
            loop {
                let mut progressed = false;
                for key in walk.promote() {
                    match self.step(&key, walk, ctx, store, observer)? {
                        Some(job) => {
                            walk.set(&key, NodeState::Active);
                            observer.on_dispatch(&key, &job.host);
                            log::info!("Dispatching {key} to '{}'", job.host);
                            let tx = tx.clone();
                            scope.spawn(move |_| {
                                let outcome = run_operation(client, &job, inventory_path, env);
                                // The receiver only goes away once the run has failed
                                let _ = tx.send((job.key.clone(), outcome));
                            });
                        }
                        None => progressed = true,
                    }
                }

                if walk.finished() {
                    return Ok(());
                }
                if progressed {
                    continue;
                }
                if walk.active() == 0 {
                    return walk.ensure_finished();
                }

                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok((key, outcome)) => {
                        let outcome = outcome?;
                        check_completion(&key, &outcome)?;
                        self.complete(outcome, walk, ctx, store, observer)?;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::Protocol("completion channel closed".into()));
                    }
                }
            }
        })
    }

    /// Render one ready operation.
    ///
    /// Returns the job to dispatch, or `None` when the node was settled
    /// without execution.
    fn step(
        &self,
        key: &OperationKey,
        walk: &mut Walk<'_>,
        ctx: &RunContext,
        store: &InstanceStore,
        observer: &mut dyn SchedulerObserver,
    ) -> Result<Option<Job>> {
        let graph = walk.graph;
        let mut node = graph
            .node(key)
            .cloned()
            .ok_or_else(|| Error::Topology(format!("operation {key} is not in the graph")))?;

        if ctx.is_delete {
            match key.operation {
                LifecycleOp::Create => node.key.operation = LifecycleOp::Delete,
                LifecycleOp::Delete => {}
                _ => {
                    log::debug!("Skipping {key} during teardown");
                    walk.set(key, NodeState::Done);
                    observer.on_skip(key, "not part of teardown");
                    return Ok(None);
                }
            }
        } else {
            Resolver::new(graph, store, self.inputs, self.input_values).resolve_node(&mut node)?;
        }

        let host = self.execution_host(&node, walk, ctx)?;
        node.host = Some(host.clone());
        if key.operation == LifecycleOp::Create {
            walk.create_hosts.insert(node.name().to_string(), host.clone());
        }

        let emit = EmitContext {
            run: ctx,
            store,
            provider: self.provider,
        };
        // Software components have no provider module, only their scripts
        let provisioned = !node.tmpl.is_software_component;
        let instructions = match (ctx.is_delete, key.operation) {
            (true, LifecycleOp::Create) if provisioned => self.emitter.render_delete(&node, &emit)?,
            (true, LifecycleOp::Create) => Vec::new(),
            (false, LifecycleOp::Create) => {
                let mut instructions = if provisioned {
                    self.emitter.render_create(&node, &emit)?
                } else {
                    Vec::new()
                };
                instructions.extend(self.emitter.render_interface_scripts(&node, &emit)?);
                instructions
            }
            _ => self.emitter.render_interface_scripts(&node, &emit)?,
        };

        if instructions.is_empty() {
            log::debug!("{key} renders no instructions");
            walk.set(key, NodeState::Done);
            observer.on_skip(key, "nothing to run");
            return Ok(None);
        }

        let gather_facts = host != ctx.local_host;
        walk.plays.push(play_for(&node, &host, gather_facts, instructions.clone()));
        Ok(Some(self.job_for(key, &node, host, gather_facts, instructions, ctx)))
    }

    fn job_for(
        &self,
        key: &OperationKey,
        node: &OperationNode,
        host: String,
        gather_facts: bool,
        instructions: Vec<Instruction>,
        ctx: &RunContext,
    ) -> Job {
        let described = self.emitter.describe_type(&node.tmpl.type_name, self.provider);
        let mut attribute_names = node.tmpl.attribute_names.clone();
        if !attribute_names.iter().any(|n| n == "id") {
            attribute_names.push("id".to_string());
        }
        Job {
            key: key.clone(),
            host,
            instructions,
            gather_facts,
            extra_vars: play_vars(node).unwrap_or_default(),
            attribute_names,
            attribute_matcher: described.attribute_matcher,
            create_description: described.description,
            outputs: ctx
                .outputs_for(node.name(), node.operation())
                .into_iter()
                .map(|r| (r.id.clone(), r.output.clone()))
                .collect(),
        }
    }

    /// Host an operation runs on.
    ///
    /// An `operation_host` selector borrows the host of the selected
    /// resource's create. Otherwise software components, and relationship
    /// operations whose acting peer is one, run on the local host.
    fn execution_host(&self, node: &OperationNode, walk: &Walk<'_>, ctx: &RunContext) -> Result<String> {
        if let Some(implementation) = Implementation::of(&node.tmpl, node.operation())?
            && let Some(selector) = implementation.operation_host.as_deref()
        {
            let selected = match selector {
                "ORCHESTRATOR" => return Ok(ctx.local_host.clone()),
                "SELF" => Some(node.name()),
                "HOST" => node.tmpl.host_link.as_deref(),
                "SOURCE" => node.source(),
                "TARGET" => node.target(),
                name => Some(name),
            };
            if let Some(host) = selected.and_then(|name| walk.create_hosts.get(name)) {
                return Ok(host.clone());
            }
            log::warn!(
                "operation_host '{selector}' of {} has no provisioned host, using the default",
                node.key
            );
        }

        let operation = node.operation();
        let peer_is_software = operation.is_relationship_op() && {
            let peer = if operation.acts_on_source() {
                node.source()
            } else {
                node.target()
            };
            peer.and_then(|name| walk.graph.find_by_name(name))
                .is_some_and(|peer| peer.tmpl.is_software_component)
        };

        if node.tmpl.is_software_component || peer_is_software {
            Ok(ctx.local_host.clone())
        } else {
            Ok(ctx.default_host.clone())
        }
    }

    /// Record a finished operation, then release its dependents
    fn complete(
        &self,
        outcome: JobOutcome,
        walk: &mut Walk<'_>,
        ctx: &RunContext,
        store: &mut InstanceStore,
        observer: &mut dyn SchedulerObserver,
    ) -> Result<()> {
        let key = outcome.key;
        let graph = walk.graph;
        let node = graph
            .node(&key)
            .ok_or_else(|| Error::Protocol(format!("completion for unknown operation {key}")))?;
        if walk.state(&key) != Some(NodeState::Active) {
            return Err(Error::Protocol(format!("completion for {key}, which is not running")));
        }

        if !outcome.attributes.is_empty() {
            store.append(
                node.name(),
                &node.tmpl.type_name,
                &outcome.attributes,
                StateField::Attributes,
                ctx.is_delete,
            )?;
        }

        if !outcome.outputs.is_empty() {
            let target = graph.find_by_name(node.name()).ok_or_else(|| {
                Error::resolution(
                    crate::functions::GET_OPERATION_OUTPUT,
                    node.name(),
                    "output target is not in the graph",
                )
            })?;
            let mut delta = Mapping::new();
            delta.insert(key.operation.as_str().to_string(), Value::Object(outcome.outputs));
            store.append(
                target.name(),
                &target.tmpl.type_name,
                &[delta],
                StateField::Outputs,
                ctx.is_delete,
            )?;
        }

        walk.set(&key, NodeState::Done);
        observer.on_complete(&key);
        log::info!("Completed {key}");
        Ok(())
    }
}

/// A worker must report the operation it was dispatched for
fn check_completion(dispatched: &OperationKey, outcome: &JobOutcome) -> Result<()> {
    if outcome.key != *dispatched {
        return Err(Error::Protocol(format!(
            "completion for {} reported as {dispatched}",
            outcome.key
        )));
    }
    Ok(())
}

/// Variables the operation's instructions may reference
fn play_vars(node: &OperationNode) -> Option<Mapping> {
    node.tmpl.host_address.as_ref().map(|address| {
        let mut vars = Mapping::new();
        vars.insert("host_address".into(), json!(format!("{{{{ {address} }}}}")));
        vars
    })
}

fn play_for(node: &OperationNode, host: &str, gather_facts: bool, tasks: Vec<Instruction>) -> Play {
    Play {
        name: node.key.to_string(),
        hosts: host.to_string(),
        gather_facts,
        vars: play_vars(node),
        tasks,
    }
}

// ============================================================================
// Walk state
// ============================================================================

struct Walk<'g> {
    graph: &'g DependencyGraph,
    states: BTreeMap<OperationKey, NodeState>,
    plays: Vec<Play>,
    /// Host each resource's create ran on
    create_hosts: BTreeMap<String, String>,
}

impl<'g> Walk<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        Self {
            graph,
            states: graph.keys().map(|key| (key.clone(), NodeState::Pending)).collect(),
            plays: Vec::new(),
            create_hosts: BTreeMap::new(),
        }
    }

    /// Move every pending node whose dependencies are done to ready
    fn promote(&mut self) -> Vec<OperationKey> {
        let graph = self.graph;
        let ready: Vec<OperationKey> = self
            .states
            .iter()
            .filter(|(_, state)| **state == NodeState::Pending)
            .filter(|(key, _)| {
                graph
                    .dependencies(key)
                    .all(|dep| self.states.get(dep) == Some(&NodeState::Done))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ready {
            log::debug!("{key} is ready");
            self.states.insert(key.clone(), NodeState::Ready);
        }
        ready
    }

    fn set(&mut self, key: &OperationKey, state: NodeState) {
        self.states.insert(key.clone(), state);
    }

    fn state(&self, key: &OperationKey) -> Option<NodeState> {
        self.states.get(key).copied()
    }

    fn active(&self) -> usize {
        self.states.values().filter(|s| **s == NodeState::Active).count()
    }

    fn finished(&self) -> bool {
        self.states.values().all(|s| *s == NodeState::Done)
    }

    fn ensure_finished(&self) -> Result<()> {
        if self.finished() {
            return Ok(());
        }
        let stuck: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| **s != NodeState::Done)
            .map(|(key, _)| key.to_string())
            .collect();
        Err(Error::Cycle(stuck.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::emitter::Tool;
    use crate::graph::build_graph;
    use crate::testing::{self, Event, MockExecutor, RecordingObserver};
    use crate::topology::Topology;
    use tempfile::TempDir;

    struct Fixture {
        topology: Topology,
        graph: DependencyGraph,
        reversed: DependencyGraph,
        provider: ProviderConfig,
        values: Mapping,
    }

    fn fixture(source: &str) -> Fixture {
        let topology = testing::topology(source);
        let (graph, reversed) = build_graph(&topology.resources).unwrap();
        Fixture {
            topology,
            graph,
            reversed,
            provider: testing::settings().providers["openstack"].clone(),
            values: Mapping::new(),
        }
    }

    fn position(events: &[Event], wanted: &Event) -> usize {
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("missing event {wanted:?} in {events:?}"))
    }

    #[test]
    fn test_render_only_compute_with_fip() {
        let f = fixture(testing::COMPUTE_WITH_FIP);
        let emitter = Tool::Ansible.emitter();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let mut values = Mapping::new();
        values.insert("flavor".into(), json!("m1.large"));
        let scheduler = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &values);
        let script = scheduler
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();

        assert_eq!(f.graph.edge_count(), 1);
        let plays: Vec<serde_yaml::Value> = serde_yaml::from_str(&script).unwrap();
        assert_eq!(plays.len(), 2);
        assert_eq!(plays[0]["name"], serde_yaml::Value::from("compute:create"));
        assert_eq!(plays[1]["name"], serde_yaml::Value::from("fip:create"));
        assert_eq!(plays[0]["hosts"], serde_yaml::Value::from("cloud"));
        assert!(script.contains("image: cirros"));
        assert!(script.contains("os_server"));
    }

    #[test]
    fn test_dependents_dispatch_after_completion() {
        let f = fixture(testing::LINEAR_CHAIN);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::default();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();
        let mut observer = RecordingObserver::default();

        Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .with_jobs(4)
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut observer)
            .unwrap();

        let events = &observer.events;
        let a = OperationKey::new("a", LifecycleOp::Create);
        let b = OperationKey::new("b", LifecycleOp::Create);
        let c = OperationKey::new("c", LifecycleOp::Create);
        assert!(position(events, &Event::Dispatch(b.clone())) > position(events, &Event::Complete(a)));
        assert!(position(events, &Event::Dispatch(c.clone())) > position(events, &Event::Complete(b)));
        assert!(events.contains(&Event::Complete(c)));
        assert_eq!(client.stopped().len(), 3);
    }

    #[test]
    fn test_results_are_recorded_before_dependents_run() {
        let f = fixture(testing::COMPUTE_WITH_FIP);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::default().with_facts(json!({
            "server": {"id": "srv-1", "public_address": "10.0.0.5"}
        }));
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();

        let compute = store.read("compute", 1).unwrap();
        assert_eq!(compute.attributes().unwrap()["id"], json!("srv-1"));
        assert_eq!(client.batches().len(), 2);
    }

    #[test]
    fn test_teardown_skips_non_create_operations() {
        let f = fixture(testing::SOFTWARE_ON_SERVER);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::default();
        let dir = TempDir::new().unwrap();
        let mut store = InstanceStore::open(dir.path(), "c1").unwrap();
        store.initialize(&f.topology.resources).unwrap();
        for (name, type_name) in [("server", "openstack.nodes.Server"), ("app", "tosca.nodes.SoftwareComponent")] {
            let delta = json!({"id": format!("{name}-1")}).as_object().cloned().unwrap();
            store
                .append(name, type_name, &[delta], StateField::Attributes, false)
                .unwrap();
        }
        let ctx = RunContext::new("c1", true, "cloud");
        let mut observer = RecordingObserver::default();

        let script = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut observer)
            .unwrap();

        let configure = OperationKey::new("app", LifecycleOp::Configure);
        assert!(observer.events.contains(&Event::Skip(configure.clone())));
        assert!(!observer.events.contains(&Event::Dispatch(configure)));

        // Software components have nothing to remove
        let app = OperationKey::new("app", LifecycleOp::Create);
        let server = OperationKey::new("server", LifecycleOp::Create);
        assert!(!observer.events.contains(&Event::Dispatch(app.clone())));
        assert!(position(&observer.events, &Event::Dispatch(server)) > position(&observer.events, &Event::Skip(app)));
        assert!(script.contains("state: absent"));
        assert!(script.contains("server:delete"));
        assert!(!script.contains("app:delete"));
        assert_eq!(client.batches().len(), 1);
        assert!(store.path().is_some_and(|p| !p.exists()));
    }

    #[test]
    fn test_software_components_run_on_local_host() {
        let f = fixture(testing::SOFTWARE_ON_SERVER);
        let emitter = Tool::Ansible.emitter();
        let ctx = RunContext::new("c1", false, "cloud").with_local_host("control");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let script = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();
        let plays: Vec<serde_yaml::Value> = serde_yaml::from_str(&script).unwrap();
        let app = plays
            .iter()
            .find(|p| p["name"] == serde_yaml::Value::from("app:create"))
            .unwrap();
        assert_eq!(app["hosts"], serde_yaml::Value::from("control"));
        assert_eq!(app["gather_facts"], serde_yaml::Value::from(false));
        assert_eq!(
            app["vars"]["host_address"],
            serde_yaml::Value::from("{{ server_public_address }}")
        );
    }

    #[test]
    fn test_software_components_render_only_their_scripts() {
        let f = fixture(testing::SOFTWARE_ON_SERVER);
        let emitter = Tool::Ansible.emitter();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let script = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();
        let plays: Vec<serde_yaml::Value> = serde_yaml::from_str(&script).unwrap();
        let app = plays
            .iter()
            .find(|p| p["name"] == serde_yaml::Value::from("app:create"))
            .unwrap();
        let tasks = app["tasks"].as_sequence().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["include"], serde_yaml::Value::from("artifacts/install.yaml"));
        assert!(!script.contains("os_software_component"));
        assert!(script.contains("os_server"));
    }

    #[test]
    fn test_session_vars_carry_host_address() {
        let f = fixture(testing::SOFTWARE_ON_SERVER);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::default();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();

        let inits = client.inits();
        let app = inits.iter().find(|init| init.hosts == "localhost").unwrap();
        assert_eq!(app.extra_vars["host_address"], json!("{{ server_public_address }}"));
        let server = inits.iter().find(|init| init.hosts == "cloud").unwrap();
        assert!(server.extra_vars.is_empty());
    }

    #[test]
    fn test_relationship_hook_of_software_peer_runs_locally() {
        let f = fixture(testing::SOFTWARE_RELATIONSHIP);
        let emitter = Tool::Ansible.emitter();
        let ctx = RunContext::new("c1", false, "cloud").with_local_host("control");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let script = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();
        let plays: Vec<serde_yaml::Value> = serde_yaml::from_str(&script).unwrap();
        let hosts_of = |name: &str| {
            plays
                .iter()
                .find(|p| p["name"] == serde_yaml::Value::from(name))
                .map(|p| p["hosts"].clone())
                .unwrap_or_else(|| panic!("missing play {name}"))
        };
        assert_eq!(hosts_of("connect:pre_configure_source"), serde_yaml::Value::from("control"));
        assert_eq!(hosts_of("connect:pre_configure_target"), serde_yaml::Value::from("cloud"));
        assert!(!script.contains("add_target"));
        assert!(!script.contains("remove_target"));
    }

    #[test]
    fn test_operation_outputs_reach_target_state() {
        let f = fixture(testing::OPERATION_OUTPUTS);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::default().with_facts(json!({
            "ansible_facts": {"token_1": "abc", "token_2": "def"}
        }));
        let mut ctx = RunContext::new("c1", false, "cloud");
        ctx.collect_operation_outputs(&f.topology.resources);
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap();

        let server = store.read("server", 1).unwrap();
        assert_eq!(server.template["outputs"]["create"]["token"], json!("abc"));
        assert_eq!(server.template["outputs"]["configure"]["token"], json!("def"));
        let client_state = store.read("client", 1).unwrap();
        assert!(client_state.template.get("outputs").is_none());
    }

    #[test]
    fn test_mismatched_completion_is_protocol_error() {
        let dispatched = OperationKey::new("a", LifecycleOp::Create);
        let outcome = JobOutcome {
            key: OperationKey::new("b", LifecycleOp::Create),
            attributes: Vec::new(),
            outputs: Mapping::new(),
        };
        let err = check_completion(&dispatched, &outcome).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "completion for b:create reported as a:create"));

        let matching = JobOutcome {
            key: dispatched.clone(),
            ..outcome
        };
        assert!(check_completion(&dispatched, &matching).is_ok());
    }

    #[test]
    fn test_completion_for_idle_operation_is_rejected() {
        let f = fixture(testing::LINEAR_CHAIN);
        let emitter = Tool::Ansible.emitter();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();
        let scheduler = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values);
        let mut walk = Walk::new(&f.graph);
        let outcome = JobOutcome {
            key: OperationKey::new("a", LifecycleOp::Create),
            attributes: vec![json!({"id": "a-1"}).as_object().cloned().unwrap()],
            outputs: Mapping::new(),
        };

        let err = scheduler
            .complete(outcome.clone(), &mut walk, &ctx, &mut store, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("not running")));
        assert_eq!(walk.state(&outcome.key), Some(NodeState::Pending));
        assert!(store.read("a", 1).unwrap().attributes().is_none());

        walk.set(&outcome.key, NodeState::Active);
        scheduler
            .complete(outcome.clone(), &mut walk, &ctx, &mut store, &mut NoProgress)
            .unwrap();
        assert_eq!(walk.state(&outcome.key), Some(NodeState::Done));
    }

    #[test]
    fn test_failed_instruction_aborts_run() {
        let f = fixture(testing::SINGLE_SERVER);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::failing_on(0, "quota exceeded");
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let err = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap_err();

        assert!(matches!(err, Error::TaskFailed { ref message, .. } if message == "quota exceeded"));
        assert_eq!(client.stopped(), vec!["session-1".to_string()]);
    }

    #[test]
    fn test_malformed_results_are_protocol_errors() {
        let f = fixture(testing::SINGLE_SERVER);
        let emitter = Tool::Ansible.emitter();
        let client = MockExecutor::malformed();
        let ctx = RunContext::new("c1", false, "cloud");
        let mut store = InstanceStore::in_memory("c1");
        store.initialize(&f.topology.resources).unwrap();

        let err = Scheduler::new(emitter.as_ref(), &f.provider, &f.topology.inputs, &f.values)
            .with_executor(&client, "hosts.ini", BTreeMap::new())
            .run(&f.graph, &f.reversed, &ctx, &mut store, &mut NoProgress)
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(ref m) if m.starts_with("malformed run response")));
        assert_eq!(client.stopped().len(), 1);
    }
}
