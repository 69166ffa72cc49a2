//! Shared fixtures for unit tests

use crate::config::Settings;
use crate::context::SchedulerObserver;
use crate::error::Result;
use crate::executor::{ExecutionConfig, ExecutorClient, InstructionResult, decode_results};
use crate::topology::{Topology, TopologyDocument, TypeDefinitions};
use crate::types::{Instruction, OperationKey, Value};
use std::sync::Mutex;

pub const OPENSTACK_DEFINITIONS: &str = r#"
node_types:
  openstack.nodes.Server:
    derived_from: tosca.nodes.Compute
    properties:
      flavor: { type: string }
      image: { type: string }
      auto_ip: { type: boolean, default: false }
      meta: { type: map, required: false }
    attributes:
      id: { type: string }
      public_address: { type: string }
      private_address: { type: string }
  openstack.nodes.FloatingIp:
    derived_from: tosca.nodes.Root
    properties:
      network: { type: string }
    attributes:
      floating_ip_address: { type: string }
    requirements:
      - server:
          node: openstack.nodes.Server
  openstack.nodes.Volume:
    derived_from: tosca.nodes.Root
    properties:
      size: { type: integer, default: 1 }
"#;

pub const COMPUTE_WITH_FIP: &str = r#"
topology_template:
  inputs:
    image: { type: string, default: cirros }
    flavor: { type: string, default: m1.tiny }
    key_name: { type: string }
  node_templates:
    compute:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
        image: { get_input: image }
        meta:
          tags: [web, db]
    fip:
      type: openstack.nodes.FloatingIp
      properties:
        network: public
      requirements:
        - server: compute
"#;

pub const SOFTWARE_ON_SERVER: &str = r#"
topology_template:
  node_templates:
    server:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
        image: cirros
    app:
      type: tosca.nodes.SoftwareComponent
      requirements:
        - host: { node: server, relationship: tosca.relationships.HostedOn }
      interfaces:
        Standard:
          create: install.yaml
          configure:
            implementation:
              primary: configure.yaml
              timeout: 60
              dependencies:
                - type: tosca.artifacts.File
                  file: nginx.conf
                  deploy_path: /etc/nginx/nginx.conf
                  checksum: abc123
                  checksum_algorithm: sha256
            inputs:
              port: 8080
          start: start.yaml
    site:
      type: tosca.nodes.SoftwareComponent
      requirements:
        - dependency: app
"#;

pub const RELATIONSHIP_TOPOLOGY: &str = r#"
topology_template:
  node_templates:
    server:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
      requirements:
        - local_storage: { node: volume, relationship: attach }
      interfaces:
        Standard:
          configure: server_configure.yaml
    volume:
      type: openstack.nodes.Volume
  relationship_templates:
    attach:
      type: tosca.relationships.AttachesTo
      interfaces:
        Configure:
          pre_configure_source: pre_source.yaml
          pre_configure_target: pre_target.yaml
          post_configure_source: post_source.yaml
          add_source: add_source.yaml
"#;

pub const SOFTWARE_RELATIONSHIP: &str = r#"
topology_template:
  node_templates:
    server:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
    app:
      type: tosca.nodes.SoftwareComponent
      requirements:
        - host: { node: server, relationship: tosca.relationships.HostedOn }
        - database: { node: db, relationship: connect }
    db:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
  relationship_templates:
    connect:
      type: tosca.relationships.ConnectsTo
      interfaces:
        Configure:
          pre_configure_source: wire_app.yaml
          pre_configure_target: open_port.yaml
          add_target: add_target.yaml
          target_changed: target_changed.yaml
          remove_target: remove_target.yaml
"#;

pub const LINEAR_CHAIN: &str = r#"
topology_template:
  node_templates:
    a:
      type: openstack.nodes.Server
      properties: { flavor: m1.small }
    b:
      type: openstack.nodes.Server
      properties: { flavor: m1.small }
      requirements:
        - dependency: a
    c:
      type: openstack.nodes.Server
      properties: { flavor: m1.small }
      requirements:
        - dependency: b
"#;

pub const SINGLE_SERVER: &str = r#"
topology_template:
  node_templates:
    server:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
        image: cirros
"#;

pub const OPERATION_OUTPUTS: &str = r#"
topology_template:
  node_templates:
    server:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
      attributes:
        first_token: { get_operation_output: [SELF, Standard, create, token] }
      interfaces:
        Standard:
          create: create_token.yaml
          configure: rotate_token.yaml
    client:
      type: openstack.nodes.Server
      properties:
        flavor: m1.small
      attributes:
        token: { get_operation_output: [server, Standard, configure, token] }
      requirements:
        - dependency: server
"#;

pub const SETTINGS: &str = r#"
[main]
default_host = "cloud"

[providers.openstack]
module_prefix = "os_"

[providers.openstack.types."openstack.nodes.Server"]
description = "Create OpenStack server"
module = "os_server"
attribute_matcher = "server"
"#;

pub fn definitions() -> TypeDefinitions {
    TypeDefinitions::parse(OPENSTACK_DEFINITIONS).unwrap()
}

pub fn settings() -> Settings {
    Settings::from_toml_str(SETTINGS).unwrap()
}

/// Build a topology against the OpenStack fixture definitions
pub fn topology(source: &str) -> Topology {
    let document = TopologyDocument::parse(source).unwrap();
    Topology::build(document, definitions(), "public_address").unwrap()
}

// ============================================================================
// Mock executor
// ============================================================================

#[derive(Debug, Default)]
struct Calls {
    sessions: usize,
    runs: usize,
    inits: Vec<ExecutionConfig>,
    batches: Vec<Vec<Instruction>>,
    stopped: Vec<String>,
}

/// In-process executor recording every call
#[derive(Debug, Default)]
pub struct MockExecutor {
    /// Run index (0-based) whose first instruction fails, with its stderr
    fail_on: Option<(usize, String)>,
    malformed: bool,
    facts: Value,
    calls: Mutex<Calls>,
}

impl MockExecutor {
    pub fn failing_on(run: usize, stderr: &str) -> Self {
        Self {
            fail_on: Some((run, stderr.to_string())),
            ..Self::default()
        }
    }

    pub fn malformed() -> Self {
        Self {
            malformed: true,
            ..Self::default()
        }
    }

    /// Facts reported for every instruction
    pub fn with_facts(mut self, facts: Value) -> Self {
        self.facts = facts;
        self
    }

    pub fn inits(&self) -> Vec<ExecutionConfig> {
        self.calls.lock().unwrap().inits.clone()
    }

    pub fn batches(&self) -> Vec<Vec<Instruction>> {
        self.calls.lock().unwrap().batches.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.calls.lock().unwrap().stopped.clone()
    }
}

impl ExecutorClient for MockExecutor {
    fn start_session(&self) -> Result<String> {
        let mut calls = self.calls.lock().unwrap();
        calls.sessions += 1;
        Ok(format!("session-{}", calls.sessions))
    }

    fn init_execution(&self, _session: &str, config: &ExecutionConfig) -> Result<()> {
        self.calls.lock().unwrap().inits.push(config.clone());
        Ok(())
    }

    fn run_instructions(
        &self,
        _session: &str,
        instructions: &[Instruction],
    ) -> Result<Vec<InstructionResult>> {
        let mut calls = self.calls.lock().unwrap();
        let run = calls.runs;
        calls.runs += 1;
        calls.batches.push(instructions.to_vec());

        if self.malformed {
            return decode_results(r#"{"results": {"task_name": "Create server"}}"#);
        }
        let failing = self.fail_on.as_ref().filter(|(index, _)| *index == run);

        Ok(instructions
            .iter()
            .enumerate()
            .map(|(i, instruction)| InstructionResult {
                task_name: instruction
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_failed: failing.is_some() && i == 0,
                stderr: failing
                    .filter(|_| i == 0)
                    .map(|(_, stderr)| stderr.clone())
                    .unwrap_or_default(),
                facts: self.facts.clone(),
                ..Default::default()
            })
            .collect())
    }

    fn stop_session(&self, session: &str) -> Result<()> {
        self.calls.lock().unwrap().stopped.push(session.to_string());
        Ok(())
    }
}

// ============================================================================
// Recording observer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dispatch(OperationKey),
    Complete(OperationKey),
    Skip(OperationKey),
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Vec<Event>,
}

impl SchedulerObserver for RecordingObserver {
    fn on_dispatch(&mut self, key: &OperationKey, _host: &str) {
        self.events.push(Event::Dispatch(key.clone()));
    }

    fn on_complete(&mut self, key: &OperationKey) {
        self.events.push(Event::Complete(key.clone()));
    }

    fn on_skip(&mut self, key: &OperationKey, _reason: &str) {
        self.events.push(Event::Skip(key.clone()));
    }
}
