//! Run context and scheduler callbacks
//!
//! These traits let the scheduler report progress and ask for
//! confirmation without depending on a terminal UI.

use crate::error::Result;
use crate::functions::{GET_OPERATION_OUTPUT, as_function};
use crate::types::{LifecycleOp, Mapping, OperationKey, ResourceTemplate, Value, value_to_string};
use std::collections::BTreeMap;

/// Progress callback for scheduling events
pub trait SchedulerObserver: Send {
    /// Called when an operation's instructions are sent to the executor
    fn on_dispatch(&mut self, key: &OperationKey, host: &str);

    /// Called once the operation's results are recorded
    fn on_complete(&mut self, key: &OperationKey);

    /// Called when an operation is marked done without dispatch
    fn on_skip(&mut self, key: &OperationKey, reason: &str);
}

/// Confirmation callback for destructive runs
pub trait ConfirmCallback: Send {
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op observer
pub struct NoProgress;

impl SchedulerObserver for NoProgress {
    fn on_dispatch(&mut self, _key: &OperationKey, _host: &str) {}
    fn on_complete(&mut self, _key: &OperationKey) {}
    fn on_skip(&mut self, _key: &OperationKey, _reason: &str) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// A `get_operation_output` request and the fact id carrying its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    /// Resource whose operation produces the output
    pub target: String,
    /// Lower-cased operation name
    pub operation: String,
    pub output: String,
    /// Fact name the interface script stores the value under
    pub id: String,
}

/// Per-run state threaded through the scheduler and emitters
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cluster: String,
    pub is_delete: bool,
    pub default_host: String,
    pub local_host: String,
    pub artifacts_dir: String,
    /// Extra task arguments: `global` plus one mapping per resource name
    pub extra: Mapping,
    output_counters: BTreeMap<String, usize>,
    output_requests: Vec<OutputRequest>,
}

impl RunContext {
    pub fn new(cluster: impl Into<String>, is_delete: bool, default_host: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            is_delete,
            default_host: default_host.into(),
            local_host: "localhost".to_string(),
            artifacts_dir: "artifacts".to_string(),
            extra: Mapping::new(),
            output_counters: BTreeMap::new(),
            output_requests: Vec::new(),
        }
    }

    pub fn with_local_host(mut self, local_host: impl Into<String>) -> Self {
        self.local_host = local_host.into();
        self
    }

    pub fn with_artifacts_dir(mut self, artifacts_dir: impl Into<String>) -> Self {
        self.artifacts_dir = artifacts_dir.into();
        self
    }

    pub fn with_extra(mut self, extra: Mapping) -> Self {
        self.extra = extra;
        self
    }

    /// Register every `get_operation_output` used by the given resources.
    ///
    /// Each distinct `(target, operation, output)` gets one id of the form
    /// `<output>_<n>`.
    pub fn collect_operation_outputs(&mut self, resources: &[ResourceTemplate]) {
        for resource in resources {
            let mut found = Vec::new();
            find_operation_outputs(&Value::Object(resource.tmpl.clone()), &mut found);
            for args in found {
                let [target, _interface, operation, output] = args.as_slice() else {
                    log::warn!("Malformed get_operation_output in '{}' ignored", resource.name);
                    continue;
                };
                let target = match target.as_str() {
                    "SELF" => resource.name.clone(),
                    other => other.to_string(),
                };
                let operation = operation.to_lowercase();
                let exists = self.output_requests.iter().any(|r| {
                    r.target == target && r.operation == operation && r.output == *output
                });
                if !exists {
                    let id = self.next_output_id(output);
                    self.output_requests.push(OutputRequest {
                        target,
                        operation,
                        output: output.clone(),
                        id,
                    });
                }
            }
        }
    }

    fn next_output_id(&mut self, output: &str) -> String {
        let counter = self.output_counters.entry(output.to_string()).or_insert(0);
        *counter += 1;
        format!("{output}_{counter}")
    }

    /// Output requests produced by one operation
    pub fn outputs_for(&self, resource: &str, operation: LifecycleOp) -> Vec<&OutputRequest> {
        self.output_requests
            .iter()
            .filter(|r| r.target == resource && r.operation == operation.as_str())
            .collect()
    }

    pub fn output_requests(&self) -> &[OutputRequest] {
        &self.output_requests
    }

    /// Extra arguments for a resource: `global` deep-merged with its own
    pub fn extra_for(&self, resource: &str) -> Mapping {
        let mut merged = self
            .extra
            .get("global")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(own) = self.extra.get(resource).and_then(Value::as_object) {
            crate::types::deep_merge(&mut merged, own);
        }
        merged
    }
}

fn find_operation_outputs(value: &Value, found: &mut Vec<Vec<String>>) {
    if let Some((GET_OPERATION_OUTPUT, args)) = as_function(value) {
        if let Some(items) = args.as_array() {
            found.push(items.iter().map(value_to_string).collect());
        }
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| find_operation_outputs(v, found)),
        Value::Array(items) => items.iter().for_each(|v| find_operation_outputs(v, found)),
        _ => {}
    }
}
