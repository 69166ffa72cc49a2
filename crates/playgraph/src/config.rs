//! Run settings: hosts, provider type mappings and executor endpoint
//!
//! Settings are read from a TOML document:
//!
//! ```toml
//! [main]
//! default_host = "cloud"
//! local_host = "localhost"
//!
//! [providers.openstack]
//! definition_file = "~/topoplay/openstack.yaml"
//! module_prefix = "os_"
//!
//! [providers.openstack.types."openstack.nodes.Server"]
//! description = "Create OpenStack server"
//! module = "os_server"
//! attribute_matcher = "server"
//!
//! [executor]
//! endpoint = "http://localhost:9090"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub main: MainSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainSettings {
    /// Host group that provisioning operations run against (required)
    pub default_host: Option<String>,
    /// Control host for software components
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Directory interface scripts are copied to
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
    #[serde(default = "default_inventory_path")]
    pub inventory_path: String,
    /// Concurrently running operations
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}

fn default_inventory_path() -> String {
    "hosts.ini".to_string()
}

fn default_jobs() -> usize {
    4
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            default_host: None,
            local_host: default_local_host(),
            artifacts_dir: default_artifacts_dir(),
            inventory_path: default_inventory_path(),
            jobs: default_jobs(),
        }
    }
}

/// Per-provider mapping from topology types to tool modules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// YAML file with `node_types` / `relationship_types`
    pub definition_file: Option<String>,
    /// Prefix stripped from module names to find result objects
    pub module_prefix: Option<String>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMapping {
    pub description: Option<String>,
    pub module: Option<String>,
    /// Key of the module result object holding observed attributes
    pub attribute_matcher: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor base URL; without it runs are render-only
    pub endpoint: Option<String>,
    /// Environment passed to every execution session
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)?;
        if settings.main.jobs == 0 {
            return Err(Error::config("main.jobs", "must be at least 1"));
        }
        Ok(settings)
    }

    /// Load settings from a file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&content)
    }

    /// The default execution host, which every run needs.
    pub fn default_host(&self) -> Result<&str> {
        self.main
            .default_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config("main.default_host", "required for every run"))
    }

    /// Provider section for `name`; absence is a configuration error.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::config(format!("providers.{name}"), "provider is not configured"))
    }
}

impl ProviderConfig {
    /// Expanded path of the definition file, if any
    pub fn definition_path(&self) -> Option<PathBuf> {
        self.definition_file.as_deref().map(expand_path)
    }

    pub fn type_mapping(&self, type_name: &str) -> Option<&TypeMapping> {
        self.types.get(type_name)
    }
}

/// Expand `~` and environment variables in a path string
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}
