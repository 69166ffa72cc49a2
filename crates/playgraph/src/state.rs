//! Instance state store - append-only log of observed resource state
//!
//! Each entry is a full snapshot of one resource instance, labelled
//! `<name>_<index>`. Index 1 is the declared template; higher indexes hold
//! further instances discovered from executor results. Reads scan newest
//! first, so the latest snapshot for a label wins.

use crate::error::{Error, Result};
use crate::types::{ElementKind, Mapping, ResourceTemplate, TypeName, Value, deep_merge};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ============================================================================
// Snapshots
// ============================================================================

/// One entry of the instance state log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `<name>_<revision>`
    pub label: String,
    pub name: String,
    pub revision: usize,
    pub category: ElementKind,
    pub template: Mapping,
    pub recorded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn attributes(&self) -> Option<&Mapping> {
        self.template.get("attributes").and_then(Value::as_object)
    }
}

/// Template section a delta is merged under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    Attributes,
    Properties,
    Outputs,
}

impl StateField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attributes => "attributes",
            Self::Properties => "properties",
            Self::Outputs => "outputs",
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Per-cluster instance state log, optionally backed by a JSON lines file
#[derive(Debug, Clone)]
pub struct InstanceStore {
    cluster: String,
    path: Option<PathBuf>,
    entries: Vec<Snapshot>,
}

impl InstanceStore {
    /// File name of a cluster's log
    pub fn file_name(cluster: &str) -> String {
        format!("instance_model_{cluster}.jsonl")
    }

    /// Open (or start) the log of `cluster` inside `state_dir`
    pub fn open(state_dir: &Path, cluster: &str) -> Result<Self> {
        let path = state_dir.join(Self::file_name(cluster));
        let mut entries = Vec::new();
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                entries.push(serde_json::from_str(line)?);
            }
            log::debug!("Loaded {} snapshots from {}", entries.len(), path.display());
        }
        Ok(Self {
            cluster: cluster.to_string(),
            path: Some(path),
            entries,
        })
    }

    /// A store that never touches the filesystem
    pub fn in_memory(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            path: None,
            entries: Vec::new(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the declared template of every resource as revision 1
    pub fn initialize(&mut self, resources: &[ResourceTemplate]) -> Result<()> {
        for resource in resources {
            self.append_revision(&resource.name, resource.kind, 1, resource.tmpl.clone())?;
        }
        Ok(())
    }

    /// Merge observed deltas into the instances of `name`.
    ///
    /// Delta `i` (1-based) extends the latest snapshot of instance `i`, or
    /// revision 1 when instance `i` was never recorded. Delete operations
    /// never write state.
    pub fn append(
        &mut self,
        name: &str,
        type_name: &str,
        deltas: &[Mapping],
        field: StateField,
        is_delete: bool,
    ) -> Result<()> {
        if is_delete {
            return Ok(());
        }
        let category = TypeName::parse(type_name)
            .and_then(|t| t.kind())
            .ok_or_else(|| Error::Topology(format!("unknown element type '{type_name}'")))?;

        for (i, delta) in deltas.iter().enumerate() {
            let revision = i + 1;
            let base = self
                .read(name, revision)
                .or_else(|| self.read(name, 1))
                .map(|s| s.template.clone())
                .unwrap_or_default();
            let mut template = base;
            let mut wrapped = Mapping::new();
            wrapped.insert(field.as_str().to_string(), Value::Object(delta.clone()));
            deep_merge(&mut template, &wrapped);
            self.append_revision(name, category, revision, template)?;
        }
        Ok(())
    }

    /// Append a full snapshot for `(name, revision)`
    pub fn append_revision(
        &mut self,
        name: &str,
        category: ElementKind,
        revision: usize,
        template: Mapping,
    ) -> Result<()> {
        let snapshot = Snapshot {
            label: format!("{name}_{revision}"),
            name: name.to_string(),
            revision,
            category,
            template,
            recorded_at: Utc::now(),
        };
        if let Some(path) = &self.path {
            write_line(path, &snapshot)?;
        }
        log::debug!("Recorded {} in cluster '{}'", snapshot.label, self.cluster);
        self.entries.push(snapshot);
        Ok(())
    }

    /// Latest snapshot of `name` at `revision`, falling back to the nearest
    /// lower revision that was recorded
    pub fn read(&self, name: &str, revision: usize) -> Option<&Snapshot> {
        // max_by_key keeps the last maximum, i.e. the newest entry
        self.entries
            .iter()
            .filter(|s| s.name == name && s.revision <= revision)
            .max_by_key(|s| s.revision)
    }

    /// Like [`read`](Self::read), but absence is an error
    pub fn require(&self, name: &str, revision: usize) -> Result<&Snapshot> {
        self.read(name, revision).ok_or_else(|| Error::StateNotFound {
            cluster: self.cluster.clone(),
            name: name.to_string(),
        })
    }

    /// Latest snapshot of each recorded instance of `name`, by revision
    pub fn instances(&self, name: &str) -> Vec<&Snapshot> {
        let mut latest: Vec<&Snapshot> = Vec::new();
        for snapshot in self.entries.iter().rev().filter(|s| s.name == name) {
            if !latest.iter().any(|s| s.revision == snapshot.revision) {
                latest.push(snapshot);
            }
        }
        latest.sort_by_key(|s| s.revision);
        latest
    }

    /// Names of every recorded resource, in first-seen order
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for snapshot in &self.entries {
            if !names.contains(&snapshot.name.as_str()) {
                names.push(&snapshot.name);
            }
        }
        names
    }

    /// Drop the whole log, removing its file
    pub fn delete(&mut self) -> Result<()> {
        self.entries.clear();
        if let Some(path) = &self.path
            && path.exists()
        {
            fs::remove_file(path).map_err(|e| Error::io(path, e))?;
            log::info!("Removed instance state of cluster '{}'", self.cluster);
        }
        Ok(())
    }
}

fn write_line(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut line = serde_json::to_string(snapshot)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(line.as_bytes()).map_err(|e| Error::io(path, e))
}
