//! Executor client contract and per-operation execution
//!
//! One dispatched operation is one executor session: start, init, run the
//! whole instruction batch, stop. A failed or unreachable instruction aborts
//! the operation after the session is closed.

mod http;

pub use http::HttpExecutorClient;

use crate::error::{Error, Result};
use crate::types::{Instruction, Mapping, OperationKey, Value, deep_merge};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Session settings sent before the instructions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionConfig {
    pub hosts: String,
    pub inventory_path: String,
    pub env: BTreeMap<String, String>,
    pub extra_vars: Mapping,
    pub gather_facts: bool,
}

/// Outcome of one instruction as reported by the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionResult {
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub is_unreachable: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub msg: String,
    /// Structured result of the task (`ansible_facts`, module objects, ...)
    #[serde(default)]
    pub facts: Value,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    results: Vec<InstructionResult>,
}

/// Decode the body of a run response
pub fn decode_results(body: &str) -> Result<Vec<InstructionResult>> {
    serde_json::from_str::<RunResponse>(body)
        .map(|response| response.results)
        .map_err(|e| Error::Protocol(format!("malformed run response: {e}")))
}

impl InstructionResult {
    fn succeeded(&self) -> bool {
        !self.is_failed && !self.is_unreachable
    }

    /// First non-empty diagnostic of a failed instruction
    fn failure_message(&self) -> String {
        [&self.stderr, &self.msg, &self.stdout]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| {
                if self.is_unreachable {
                    "host unreachable".to_string()
                } else {
                    self.facts.to_string()
                }
            })
    }
}

/// Remote runner of instruction batches
pub trait ExecutorClient: Send + Sync {
    fn start_session(&self) -> Result<String>;

    fn init_execution(&self, session: &str, config: &ExecutionConfig) -> Result<()>;

    fn run_instructions(
        &self,
        session: &str,
        instructions: &[Instruction],
    ) -> Result<Vec<InstructionResult>>;

    fn stop_session(&self, session: &str) -> Result<()>;
}

// ============================================================================
// Jobs
// ============================================================================

/// One rendered operation ready for dispatch
#[derive(Debug, Clone)]
pub struct Job {
    pub key: OperationKey,
    pub host: String,
    pub instructions: Vec<Instruction>,
    pub gather_facts: bool,
    /// Variables the session is initialized with
    pub extra_vars: Mapping,
    /// Attribute names to pick from results
    pub attribute_names: Vec<String>,
    /// Key of the module result object
    pub attribute_matcher: String,
    /// Task name prefix marking the provisioning task
    pub create_description: String,
    /// `(fact id, output name)` pairs the operation must report
    pub outputs: Vec<(String, String)>,
}

/// Values observed while running a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub key: OperationKey,
    /// One delta per observed instance
    pub attributes: Vec<Mapping>,
    /// Operation outputs by output name
    pub outputs: Mapping,
}

/// Run one job in its own session.
///
/// The session is stopped exactly once whatever the outcome.
pub fn run_operation(
    client: &dyn ExecutorClient,
    job: &Job,
    inventory_path: &str,
    env: &BTreeMap<String, String>,
) -> Result<JobOutcome> {
    let session = client.start_session()?;
    log::debug!("Session {session} opened for {}", job.key);

    let config = ExecutionConfig {
        hosts: job.host.clone(),
        inventory_path: inventory_path.to_string(),
        env: env.clone(),
        extra_vars: job.extra_vars.clone(),
        gather_facts: job.gather_facts,
    };
    let outcome = run_in_session(client, &session, job, &config);

    match client.stop_session(&session) {
        Ok(()) => log::debug!("Session {session} closed"),
        Err(err) if outcome.is_err() => {
            log::warn!("Failed to close session {session}: {err}");
        }
        Err(err) => return Err(err),
    }
    outcome
}

fn run_in_session(
    client: &dyn ExecutorClient,
    session: &str,
    job: &Job,
    config: &ExecutionConfig,
) -> Result<JobOutcome> {
    client.init_execution(session, config)?;
    let results = client.run_instructions(session, &job.instructions)?;

    if let Some(failed) = results.iter().find(|r| !r.succeeded()) {
        return Err(Error::TaskFailed {
            operation: job.key.to_string(),
            task: failed.task_name.clone(),
            message: failed.failure_message(),
        });
    }

    Ok(JobOutcome {
        key: job.key.clone(),
        attributes: extract_attributes(&results, job),
        outputs: extract_outputs(&results, job),
    })
}

/// Attribute deltas from successful results.
///
/// Facts and the provisioning task's module object merge into the first
/// instance; every element of a looped task's `results` is one instance.
pub fn extract_attributes(results: &[InstructionResult], job: &Job) -> Vec<Mapping> {
    let mut primary = Mapping::new();
    let mut looped = Vec::new();

    for result in results {
        if let Some(facts) = result.facts.get("ansible_facts").and_then(Value::as_object) {
            pick(facts, &job.attribute_names, &mut primary);
        }
        let is_create_task = !job.create_description.is_empty()
            && result.task_name.contains(&job.create_description);
        if !is_create_task {
            continue;
        }
        if let Some(object) = result.facts.get(&job.attribute_matcher).and_then(Value::as_object) {
            pick(object, &job.attribute_names, &mut primary);
        }
        if let Some(items) = result.facts.get("results").and_then(Value::as_array) {
            for item in items {
                let mut instance = Mapping::new();
                if let Some(object) = item.get(&job.attribute_matcher).and_then(Value::as_object) {
                    pick(object, &job.attribute_names, &mut instance);
                }
                if !instance.is_empty() {
                    looped.push(instance);
                }
            }
        }
    }

    if !primary.is_empty() {
        match looped.first_mut() {
            Some(first) => deep_merge(first, &primary),
            None => looped.push(primary),
        }
    }
    looped
}

fn pick(source: &Mapping, names: &[String], into: &mut Mapping) {
    for name in names {
        if let Some(value) = source.get(name)
            && !value.is_null()
        {
            into.insert(name.clone(), value.clone());
        }
    }
}

/// Requested operation outputs, read from the facts their ids were set as
pub fn extract_outputs(results: &[InstructionResult], job: &Job) -> Mapping {
    let mut outputs = Mapping::new();
    for result in results {
        let Some(facts) = result.facts.get("ansible_facts").and_then(Value::as_object) else {
            continue;
        };
        for (id, output) in &job.outputs {
            if let Some(value) = facts.get(id) {
                outputs.insert(output.clone(), value.clone());
            }
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;
    use crate::types::LifecycleOp;
    use serde_json::json;

    fn job() -> Job {
        Job {
            key: OperationKey::new("server", LifecycleOp::Create),
            host: "cloud".into(),
            instructions: vec![json!({"name": "Create server"}).as_object().cloned().unwrap()],
            gather_facts: false,
            extra_vars: json!({"host_address": "{{ server_public_address }}"})
                .as_object()
                .cloned()
                .unwrap(),
            attribute_names: vec!["id".into(), "public_address".into()],
            attribute_matcher: "server".into(),
            create_description: "Create server".into(),
            outputs: vec![("token_1".into(), "token".into())],
        }
    }

    fn result(task: &str, facts: Value) -> InstructionResult {
        InstructionResult {
            task_name: task.into(),
            facts,
            ..Default::default()
        }
    }

    #[test]
    fn test_extracts_module_object_and_facts() {
        let results = vec![
            result("Create server", json!({"server": {"id": "srv-1", "status": "ACTIVE"}})),
            result("set_fact", json!({"ansible_facts": {"public_address": "10.0.0.5", "token_1": "abc"}})),
        ];
        let attributes = extract_attributes(&results, &job());
        assert_eq!(attributes, vec![json!({"id": "srv-1", "public_address": "10.0.0.5"}).as_object().cloned().unwrap()]);
        assert_eq!(Value::Object(extract_outputs(&results, &job())), json!({"token": "abc"}));
    }

    #[test]
    fn test_looped_results_are_separate_instances() {
        let results = vec![result(
            "Create server",
            json!({"results": [{"server": {"id": "a"}}, {"server": {"id": "b"}}, {"skipped": true}]}),
        )];
        let attributes = extract_attributes(&results, &job());
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1]["id"], json!("b"));
    }

    #[test]
    fn test_module_object_ignored_outside_create_task() {
        let results = vec![result("include", json!({"server": {"id": "srv-1"}}))];
        assert!(extract_attributes(&results, &job()).is_empty());
    }

    #[test]
    fn test_failed_instruction_closes_session_once() {
        let client = MockExecutor::failing_on(0, "boom");
        let err = run_operation(&client, &job(), "hosts.ini", &BTreeMap::new()).unwrap_err();
        match err {
            Error::TaskFailed { operation, message, .. } => {
                assert_eq!(operation, "server:create");
                assert_eq!(message, "boom");
            }
            other => panic!("Expected TaskFailed, got {other:?}"),
        }
        assert_eq!(client.stopped(), vec!["session-1".to_string()]);
    }

    #[test]
    fn test_successful_run_passes_session_config() {
        let client = MockExecutor::default();
        let mut env = BTreeMap::new();
        env.insert("OS_CLOUD".to_string(), "devstack".to_string());
        let outcome = run_operation(&client, &job(), "hosts.ini", &env).unwrap();

        assert_eq!(outcome.key, OperationKey::new("server", LifecycleOp::Create));
        let inits = client.inits();
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].hosts, "cloud");
        assert_eq!(inits[0].env["OS_CLOUD"], "devstack");
        assert_eq!(inits[0].extra_vars["host_address"], json!("{{ server_public_address }}"));
        assert_eq!(client.stopped().len(), 1);
    }

    #[test]
    fn test_decode_results() {
        let results = decode_results(r#"{"results": [{"task_name": "t", "is_failed": true}]}"#).unwrap();
        assert!(results[0].is_failed);
        assert!(results[0].stderr.is_empty());

        for body in [r#"{"results": "nope"}"#, r#"{"output": []}"#, "not json"] {
            let err = decode_results(body).unwrap_err();
            assert!(matches!(err, Error::Protocol(ref m) if m.starts_with("malformed run response")), "{body}");
        }
    }

    #[test]
    fn test_failure_message_fallbacks() {
        let mut failed = InstructionResult {
            is_unreachable: true,
            ..Default::default()
        };
        assert_eq!(failed.failure_message(), "host unreachable");
        failed.msg = "no route".into();
        assert_eq!(failed.failure_message(), "no route");
    }
}
