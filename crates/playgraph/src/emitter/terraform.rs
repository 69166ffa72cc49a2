use super::{
    EmitContext, Emitter, Tool, TypeDescription, describe, namespace, register_name, snake_case,
    with_extra,
};
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::types::{Instruction, Mapping, OperationNode, Value};
use serde_json::json;

/// Renders operations as Terraform projects applied by Ansible tasks
pub struct TerraformEmitter;

impl TerraformEmitter {
    fn terraform_task(description: &str, project: &str, state: &str) -> Instruction {
        let mut task = Mapping::new();
        task.insert("name".into(), json!(description));
        let mut args = Mapping::new();
        args.insert("project_path".into(), json!(project));
        args.insert("state".into(), json!(state));
        if state == "present" {
            args.insert("force_init".into(), json!(true));
        }
        task.insert("terraform".into(), Value::Object(args));
        task
    }
}

impl Emitter for TerraformEmitter {
    fn tool(&self) -> Tool {
        Tool::Terraform
    }

    fn render_create(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>> {
        let described = self.describe_type(&node.tmpl.type_name, ctx.provider);
        let project = register_name(node.name());
        let config = json!({
            "resource": {
                described.module.as_str(): {
                    project.as_str(): node.tmpl.configuration_args,
                }
            }
        });
        let body = serde_json::to_string_pretty(&config)?;

        let mut shell = Mapping::new();
        shell.insert("name".into(), json!(described.description));
        shell.insert(
            "shell".into(),
            json!(format!("mkdir -p {project} && cat > {project}/main.tf.json << EOF\n{body}\nEOF")),
        );

        let mut apply = Self::terraform_task(&described.description, &project, "present");
        apply.insert("register".into(), json!(project));
        let apply = with_extra(apply, &ctx.run.extra_for(node.name()));

        Ok(vec![shell, apply])
    }

    fn render_delete(&self, node: &OperationNode, ctx: &EmitContext<'_>) -> Result<Vec<Instruction>> {
        let described = self.describe_type(&node.tmpl.type_name, ctx.provider);
        let project = register_name(node.name());
        let task = Self::terraform_task(&described.description, &project, "absent");
        Ok(vec![with_extra(task, &ctx.run.extra_for("global"))])
    }

    fn describe_type(&self, type_name: &str, provider: &ProviderConfig) -> TypeDescription {
        let namespace = namespace(type_name);
        describe(type_name, provider, |short| {
            if namespace.is_empty() {
                snake_case(short)
            } else {
                format!("{namespace}_{}", snake_case(short))
            }
        })
    }
}
