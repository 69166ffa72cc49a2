use super::{
    EmitContext, Emitter, Tool, TypeDescription, describe, recorded_ids, register_name, snake_case,
    with_extra,
};
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::types::{Instruction, Mapping, OperationNode, Value};
use serde_json::json;

/// Renders operations as Ansible tasks calling provider modules
pub struct AnsibleEmitter;

impl Emitter for AnsibleEmitter {
    fn tool(&self) -> Tool {
        Tool::Ansible
    }

    fn render_create(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>> {
        let described = self.describe_type(&node.tmpl.type_name, ctx.provider);
        let mut task = Mapping::new();
        task.insert("name".into(), json!(described.description));
        task.insert(
            described.module,
            Value::Object(node.tmpl.configuration_args.clone()),
        );
        task.insert("register".into(), json!(register_name(node.name())));
        Ok(vec![with_extra(task, &ctx.run.extra_for(node.name()))])
    }

    fn render_delete(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>> {
        let ids = recorded_ids(ctx.store, node.name());
        if ids.is_empty() {
            log::debug!("No recorded instances of '{}', nothing to delete", node.name());
            return Ok(Vec::new());
        }
        let described = self.describe_type(&node.tmpl.type_name, ctx.provider);
        let mut task = Mapping::new();
        task.insert("name".into(), json!(described.description));
        task.insert(
            described.module,
            json!({"name": "{{ item }}", "state": "absent"}),
        );
        task.insert("with_list".into(), Value::Array(ids));
        Ok(vec![with_extra(task, &ctx.run.extra_for("global"))])
    }

    fn describe_type(&self, type_name: &str, provider: &ProviderConfig) -> TypeDescription {
        let prefix = provider.module_prefix.clone().unwrap_or_default();
        describe(type_name, provider, |short| format!("{prefix}{}", snake_case(short)))
    }
}
