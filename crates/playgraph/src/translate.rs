//! Top-level translation entry point
//!
//! Parses a topology, builds its operation graph and hands it to the
//! scheduler, either render-only or against a live executor.

use crate::config::Settings;
use crate::context::{ConfirmCallback, RunContext, SchedulerObserver};
use crate::emitter::Tool;
use crate::error::Result;
use crate::executor::ExecutorClient;
use crate::functions::{Resolver, Scope};
use crate::graph::build_graph;
use crate::scheduler::Scheduler;
use crate::state::InstanceStore;
use crate::topology::Topology;
use crate::types::{Mapping, Value};

/// One translation request
#[derive(Debug, Clone)]
pub struct TranslateRequest {
    /// Topology document text
    pub template: String,
    pub cluster: String,
    pub tool: Tool,
    pub is_delete: bool,
    pub validate_only: bool,
    /// Extra task arguments: `global` and per-element mappings
    pub extra: Mapping,
    /// Values for topology inputs
    pub inputs: Mapping,
    /// `public_address` or `private_address`
    pub host_ip_parameter: String,
    /// Overrides `main.jobs`
    pub jobs: Option<usize>,
}

impl TranslateRequest {
    pub fn new(template: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            cluster: cluster.into(),
            tool: Tool::Ansible,
            is_delete: false,
            validate_only: false,
            extra: Mapping::new(),
            inputs: Mapping::new(),
            host_ip_parameter: "public_address".to_string(),
            jobs: None,
        }
    }
}

/// Result of [`translate`]
#[derive(Debug, Clone, PartialEq)]
pub enum TranslateOutput {
    /// Validate-only runs report what they checked
    Validated(String),
    /// The rendered script, plus topology outputs resolved after a live create
    Rendered { script: String, outputs: Mapping },
    /// Teardown was declined
    Cancelled,
}

/// Translate a topology and, when `client` is given, execute it.
///
/// Render-only create runs use a scratch state store so nothing is
/// persisted; teardown always reads the cluster's recorded state.
pub fn translate(
    request: &TranslateRequest,
    settings: &Settings,
    store: &mut InstanceStore,
    client: Option<&dyn ExecutorClient>,
    observer: &mut dyn SchedulerObserver,
    confirm: &mut dyn ConfirmCallback,
) -> Result<TranslateOutput> {
    let default_host = settings.default_host()?;
    let topology = Topology::load(&request.template, settings, &request.host_ip_parameter)?;
    let (graph, reversed) = build_graph(&topology.resources)?;

    if request.validate_only {
        let message = format!(
            "The input topology template is valid: {} resources, {} operations, {} dependencies",
            topology.resources.len(),
            graph.len(),
            graph.edge_count()
        );
        log::info!("{message}");
        return Ok(TranslateOutput::Validated(message));
    }

    let provider = settings.provider(&topology.provider)?;
    let mut ctx = RunContext::new(&request.cluster, request.is_delete, default_host)
        .with_local_host(&settings.main.local_host)
        .with_artifacts_dir(&settings.main.artifacts_dir)
        .with_extra(request.extra.clone());

    let mut scratch;
    let store = if request.is_delete {
        if store.is_empty() {
            log::warn!("No recorded state for cluster '{}', nothing will be removed", request.cluster);
        }
        if client.is_some() {
            let prompt = format!(
                "Tear down cluster '{}' ({} resources)?",
                request.cluster,
                topology.resources.len()
            );
            if !confirm.confirm(&prompt)? {
                return Ok(TranslateOutput::Cancelled);
            }
        }
        store
    } else {
        ctx.collect_operation_outputs(&topology.resources);
        let target = if client.is_some() {
            store
        } else {
            scratch = InstanceStore::in_memory(&request.cluster);
            &mut scratch
        };
        target.initialize(&topology.resources)?;
        target
    };

    let emitter = request.tool.emitter();
    let mut scheduler = Scheduler::new(emitter.as_ref(), provider, &topology.inputs, &request.inputs)
        .with_jobs(request.jobs.unwrap_or(settings.main.jobs));
    if let Some(client) = client {
        let inventory = crate::config::expand_path(&settings.main.inventory_path);
        scheduler = scheduler.with_executor(
            client,
            inventory.display().to_string(),
            settings.executor.env.clone(),
        );
    }

    log::info!(
        "{} cluster '{}' with {} ({} operations)",
        if request.is_delete { "Tearing down" } else { "Deploying" },
        request.cluster,
        request.tool,
        graph.len()
    );
    let script = scheduler.run(&graph, &reversed, &ctx, store, observer)?;

    let mut outputs = Mapping::new();
    if client.is_some() && !request.is_delete {
        let resolver = Resolver::new(&graph, store, &topology.inputs, &request.inputs);
        for (name, output) in &topology.outputs {
            let Some(value) = output.get("value") else {
                continue;
            };
            outputs.insert(name.clone(), resolver.resolve(value, Scope::named(name))?);
        }
    }

    Ok(TranslateOutput::Rendered { script, outputs })
}

/// Render an output mapping as `name: value` lines
pub fn format_outputs(outputs: &Mapping) -> Vec<String> {
    outputs
        .iter()
        .map(|(name, value)| match value {
            Value::String(s) => format!("{name}: {s}"),
            other => format!("{name}: {other}"),
        })
        .collect()
}
