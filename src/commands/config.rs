use anyhow::{Context as _, Result};
use playgraph::Settings;

use crate::cli::ConfigCommand;
use crate::{Context, paths, ui};

pub fn run(_ctx: &Context, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(),
    }
}

fn show() -> Result<()> {
    ui::header("Configuration");

    let settings_path = paths::settings_file()?;
    ui::kv("Config directory", &paths::config_dir()?.display().to_string());
    ui::kv("State directory", &paths::state_dir()?.display().to_string());
    ui::kv("Settings file", &settings_path.display().to_string());

    if !settings_path.exists() {
        println!();
        ui::warn("Settings file not found, defaults are in effect");
    }
    let settings = Settings::load(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    ui::section("Hosts");
    ui::kv(
        "default_host",
        settings.main.default_host.as_deref().unwrap_or("(not set)"),
    );
    ui::kv("local_host", &settings.main.local_host);
    ui::kv("jobs", &settings.main.jobs.to_string());

    ui::section("Providers");
    if settings.providers.is_empty() {
        ui::dim("none configured");
    }
    for (name, provider) in &settings.providers {
        let definitions = provider
            .definition_path()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());
        ui::kv(name, &format!("{} type mappings, definitions {definitions}", provider.types.len()));
    }

    ui::section("Executor");
    ui::kv(
        "endpoint",
        settings
            .executor
            .endpoint
            .as_deref()
            .unwrap_or("(render only)"),
    );

    ui::section("Effective settings");
    let rendered = toml::to_string_pretty(&settings).context("Failed to render settings")?;
    for line in rendered.lines() {
        ui::dim(line);
    }

    if settings.default_host().is_err() {
        println!();
        ui::warn("main.default_host is required before running 'topoplay translate'");
    }
    Ok(())
}
