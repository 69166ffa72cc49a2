use anyhow::{Context as _, Result, bail};
use playgraph::types::{Mapping, Value};
use playgraph::{
    ExecutorClient, HttpExecutorClient, InstanceStore, Settings, Tool, TranslateOutput,
    TranslateRequest, format_outputs,
};
use std::fs;

use crate::cli::{ToolArg, TranslateArgs};
use crate::progress::{PromptConfirm, SpinnerObserver};
use crate::{Context, paths, ui};

pub fn run(ctx: &Context, args: TranslateArgs) -> Result<()> {
    let settings_path = paths::settings_file()?;
    let settings = Settings::load(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    let template = fs::read_to_string(&args.template)
        .with_context(|| format!("Failed to read template {}", args.template.display()))?;

    let mut request = TranslateRequest::new(template, &args.cluster);
    request.tool = match args.tool {
        ToolArg::Ansible => Tool::Ansible,
        ToolArg::Terraform => Tool::Terraform,
    };
    request.is_delete = args.delete;
    request.validate_only = args.validate_only;
    request.host_ip_parameter = args.host_ip_parameter.clone();
    request.jobs = args.jobs;
    request.extra = parse_extra(args.extra.as_deref())?;
    request.inputs = parse_inputs(&args.inputs)?;

    let endpoint = if args.render_only || args.validate_only {
        None
    } else {
        args.endpoint
            .clone()
            .or_else(|| settings.executor.endpoint.clone())
    };
    let client = endpoint.as_deref().map(HttpExecutorClient::new);
    match &client {
        Some(client) => log::info!("Using executor at {}", client.endpoint()),
        None if !args.validate_only => log::info!("No executor endpoint, rendering only"),
        None => {}
    }

    let state_dir = paths::state_dir()?;
    let mut store = InstanceStore::open(&state_dir, &args.cluster)?;
    let mut observer = SpinnerObserver::new(ctx.quiet);
    let mut confirm = PromptConfirm::new(args.yes);

    let result = playgraph::translate(
        &request,
        &settings,
        &mut store,
        client.as_ref().map(|c| c as &dyn ExecutorClient),
        &mut observer,
        &mut confirm,
    );
    observer.finish();
    let output = result.map_err(report)?;

    match output {
        TranslateOutput::Validated(message) => ui::success(&message),
        TranslateOutput::Cancelled => ui::warn("Teardown cancelled"),
        TranslateOutput::Rendered { script, outputs } => {
            match &args.output {
                Some(path) => {
                    fs::write(path, &script)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    if !ctx.quiet {
                        ui::success(&format!("Wrote {}", path.display()));
                    }
                }
                None => print!("{script}"),
            }

            if client.is_some() && !ctx.quiet {
                let verb = if args.delete { "torn down" } else { "deployed" };
                ui::success(&format!(
                    "Cluster '{}' {verb} ({} operations run, {} skipped)",
                    args.cluster,
                    observer.completed(),
                    observer.skipped()
                ));
            }
            if !outputs.is_empty() {
                ui::section("Outputs");
                for line in format_outputs(&outputs) {
                    println!("  {line}");
                }
            }
        }
    }

    Ok(())
}

/// Show category and advice before handing the error to `main`
fn report(err: playgraph::Error) -> anyhow::Error {
    let category = err.category();
    ui::error(category.description());
    ui::dim(category.advice());
    anyhow::Error::new(err)
}

/// Parse `--extra` YAML into a mapping
fn parse_extra(raw: Option<&str>) -> Result<Mapping> {
    let Some(raw) = raw else {
        return Ok(Mapping::new());
    };
    let value: Value = serde_yaml::from_str(raw).context("Invalid --extra YAML")?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => bail!("--extra must be a YAML mapping"),
    }
}

/// Parse repeated `KEY=VALUE` inputs; values are read as YAML scalars
fn parse_inputs(raw: &[String]) -> Result<Mapping> {
    let mut inputs = Mapping::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("Invalid input '{item}', expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid input '{item}', key is empty");
        }
        let parsed = match serde_yaml::from_str::<Value>(value) {
            Ok(Value::Null) | Err(_) => Value::String(value.to_string()),
            Ok(v) => v,
        };
        inputs.insert(key.to_string(), parsed);
    }
    Ok(inputs)
}
