use anyhow::Result;
use dialoguer::Confirm;
use playgraph::types::Value;
use playgraph::{InstanceStore, Snapshot};
use std::path::Path;

use crate::cli::StateCommand;
use crate::{Context, paths, ui};

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    let state_dir = paths::state_dir()?;
    match cmd {
        StateCommand::Show { cluster } => show(&state_dir, &cluster, ctx.verbose > 0),
        StateCommand::Clear { cluster, yes } => clear(&state_dir, &cluster, yes),
    }
}

fn show(state_dir: &Path, cluster: &str, with_outputs: bool) -> Result<()> {
    let store = InstanceStore::open(state_dir, cluster)?;
    if store.is_empty() {
        ui::info(&format!("No recorded state for cluster '{cluster}'"));
        return Ok(());
    }

    ui::header(&format!("Cluster '{cluster}'"));
    if let Some(path) = store.path() {
        ui::kv("Log", &path.display().to_string());
    }

    for name in store.resources() {
        for snapshot in store.instances(name) {
            ui::section(&snapshot.label);
            for line in describe(snapshot, with_outputs) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Lines shown for one snapshot; operation outputs only on request
fn describe(snapshot: &Snapshot, with_outputs: bool) -> Vec<String> {
    let mut lines = vec![
        format!("  type: {}", type_of(snapshot)),
        format!(
            "  recorded: {}",
            snapshot.recorded_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
    ];
    if let Some(attributes) = snapshot.attributes() {
        for (key, value) in attributes {
            lines.push(format!("  {key}: {}", display(value)));
        }
    }
    if with_outputs
        && let Some(outputs) = snapshot.template.get("outputs").and_then(Value::as_object)
    {
        for (operation, values) in outputs {
            let Some(values) = values.as_object() else {
                continue;
            };
            for (name, value) in values {
                lines.push(format!("  {operation}.{name}: {}", display(value)));
            }
        }
    }
    lines
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_of(snapshot: &Snapshot) -> &str {
    snapshot
        .template
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

fn clear(state_dir: &Path, cluster: &str, yes: bool) -> Result<()> {
    let mut store = InstanceStore::open(state_dir, cluster)?;
    if store.is_empty() {
        ui::info(&format!("No recorded state for cluster '{cluster}'"));
        return Ok(());
    }

    let resources = store.resources().len();
    if !yes
        && !Confirm::new()
            .with_prompt(format!(
                "Forget state of cluster '{cluster}' ({resources} resources)?"
            ))
            .default(false)
            .interact()?
    {
        ui::warn("Aborted");
        return Ok(());
    }

    store.delete()?;
    ui::success(&format!("Cleared state of cluster '{cluster}'"));
    Ok(())
}
