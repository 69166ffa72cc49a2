//! Interface implementation scripts
//!
//! An operation entry of the `Standard` or `Configure` interface is either a
//! script path or a mapping with `implementation` and `inputs`. The
//! implementation itself may be a path, a list of paths, or a mapping with
//! `primary`, `dependencies`, `timeout` and `operation_host`.

use super::{EmitContext, with_extra};
use crate::error::{Error, Result};
use crate::types::{Instruction, LifecycleOp, Mapping, OperationNode, ResourceTemplate, Value};
use serde_json::json;

/// Parsed implementation of one interface operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Implementation {
    pub scripts: Vec<String>,
    /// Seconds, rendered as an asynchronous task
    pub timeout: Option<u64>,
    /// Selector of the resource whose host runs the scripts
    pub operation_host: Option<String>,
    /// Files copied and verified before the scripts run
    pub dependencies: Vec<Mapping>,
    pub inputs: Mapping,
}

impl Implementation {
    /// Implementation of `op` on the lifecycle interface of `tmpl`, if declared
    pub fn of(tmpl: &ResourceTemplate, op: LifecycleOp) -> Result<Option<Self>> {
        let Some(entry) = tmpl
            .interface(tmpl.kind.interface())
            .and_then(|ops| ops.get(op.as_str()))
        else {
            return Ok(None);
        };
        let invalid = |what: &str| {
            Error::Topology(format!("{}:{} {what}", tmpl.name, op))
        };

        let mut implementation = Self::default();
        let body = match entry {
            Value::String(script) => {
                implementation.scripts.push(script.clone());
                return Ok(Some(implementation));
            }
            Value::Object(fields) => {
                if let Some(inputs) = fields.get("inputs") {
                    implementation.inputs = inputs
                        .as_object()
                        .cloned()
                        .ok_or_else(|| invalid("inputs must be a mapping"))?;
                }
                match fields.get("implementation") {
                    Some(body) => body,
                    None => return Ok(Some(implementation)),
                }
            }
            Value::Null => return Ok(None),
            _ => return Err(invalid("has an unsupported interface entry")),
        };

        match body {
            Value::String(script) => implementation.scripts.push(script.clone()),
            Value::Array(scripts) => {
                for script in scripts {
                    let script = script
                        .as_str()
                        .ok_or_else(|| invalid("implementation list must contain paths"))?;
                    implementation.scripts.push(script.to_string());
                }
            }
            Value::Object(fields) => {
                if let Some(timeout) = fields.get("timeout") {
                    let seconds = timeout
                        .as_u64()
                        .or_else(|| timeout.as_str().and_then(|s| s.trim().parse().ok()))
                        .ok_or_else(|| invalid("timeout must be a string or integer value"))?;
                    implementation.timeout = Some(seconds);
                }
                if let Some(host) = fields.get("operation_host") {
                    let host = host
                        .as_str()
                        .ok_or_else(|| invalid("operation_host must be a string value"))?;
                    implementation.operation_host = Some(host.to_string());
                }
                if let Some(dependencies) = fields.get("dependencies") {
                    let list = dependencies
                        .as_array()
                        .ok_or_else(|| invalid("dependencies must be a list"))?;
                    implementation.dependencies = list
                        .iter()
                        .filter_map(Value::as_object)
                        .filter(|d| d.contains_key("file"))
                        .cloned()
                        .collect();
                }
                if let Some(primary) = fields.get("primary") {
                    let primary = primary
                        .as_str()
                        .ok_or_else(|| invalid("primary implementation must be a string"))?;
                    implementation.scripts.push(primary.to_string());
                }
            }
            _ => return Err(invalid("has an unsupported implementation")),
        }
        Ok(Some(implementation))
    }
}

/// Render the interface implementation of `node`'s operation.
///
/// Dependencies become copy / checksum tasks, inputs become `set_fact`
/// tasks, and every script is included from the artifacts directory.
/// Requested operation outputs are captured as facts afterwards.
pub fn interface_scripts(node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>> {
    let Some(implementation) = Implementation::of(&node.tmpl, node.operation())? else {
        return Ok(Vec::new());
    };
    let artifacts = ctx.run.artifacts_dir.trim_end_matches('/');
    let extra = ctx.run.extra_for(node.name());
    let mut tasks = Vec::new();

    for dependency in &implementation.dependencies {
        let file = dependency.get("file").map(crate::types::value_to_string).unwrap_or_default();
        let local = format!("{artifacts}/{file}");
        if let Some(dest) = dependency.get("deploy_path") {
            tasks.push(task(json!({"copy": {"src": local, "dest": dest}})));
        }
        if let (Some(checksum), Some(algorithm)) =
            (dependency.get("checksum"), dependency.get("checksum_algorithm"))
        {
            let expected = crate::types::value_to_string(checksum);
            tasks.push(task(json!({
                "stat": {"checksum_algorithm": algorithm, "get_checksum": "yes", "path": local},
                "register": "checksum",
            })));
            tasks.push(task(json!({"debug": {"msg": "{{ checksum }}"}})));
            tasks.push(task(json!({
                "fail": {"msg": format!("Checksum of {file} file is incorrect")},
                "when": format!("checksum.stat.checksum != \"{expected}\""),
            })));
        }
    }

    for (name, value) in &implementation.inputs {
        let mut fact = Mapping::new();
        fact.insert(name.clone(), value.clone());
        tasks.push(task(json!({"set_fact": fact})));
    }

    let mut tasks: Vec<Instruction> = tasks.into_iter().map(|t| with_extra(t, &extra)).collect();

    for script in &implementation.scripts {
        let mut include = Mapping::new();
        if let Some(timeout) = implementation.timeout {
            include.insert("async".into(), json!(timeout));
        }
        include.insert("include".into(), json!(format!("{artifacts}/{script}")));
        tasks.push(include);
    }

    for request in ctx.run.outputs_for(node.name(), node.operation()) {
        let mut fact = Mapping::new();
        fact.insert(request.id.clone(), json!(format!("{{{{ {} }}}}", request.output)));
        tasks.push(task(json!({"set_fact": fact})));
    }

    Ok(tasks)
}

fn task(value: Value) -> Instruction {
    match value {
        Value::Object(map) => map,
        _ => Mapping::new(),
    }
}
