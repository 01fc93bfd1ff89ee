//! Configuration management for pmctl.
//!
//! This module defines the structure of the project file (`projects.toml` or
//! `projects.json`) and provides functionality to locate, load and parse it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SupervisorError, SupervisorResult};

/// Environment variable that points at the project file.
pub const CONFIG_ENV: &str = "PMCTL_CONFIG";

const DEFAULT_CONFIG_FILES: [&str; 2] = ["projects.toml", "projects.json"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding the state file, the lock file and project logs.
    pub state_dir: Option<String>,
    /// Time to wait after sending SIGINT before escalating (0 skips the stage).
    pub shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing.
    pub shutdown_sigterm_ms: Option<u64>,
    /// How long a project with a port may take to open it.
    pub ready_timeout_ms: Option<u64>,
    /// Delay before the first liveness check of a project without a port.
    pub start_settle_ms: Option<u64>,
    /// Bind address of the dashboard.
    pub dashboard_host: Option<String>,
    /// Port of the dashboard.
    pub dashboard_port: Option<u16>,
    /// Base URL of a port registry service consulted by `web`.
    pub port_registry: Option<String>,
    /// List of projects, in declared order.
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Unique project name.
    pub name: String,
    /// Command line to execute.
    #[serde(alias = "cmd", skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Script run through `/bin/bash` when no command is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_script: Option<String>,
    /// Working directory; relative paths resolve against the config file.
    #[serde(alias = "path", alias = "cwd", skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Port the project listens on once ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Ports list as written by older project files; the first one is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Environment variables to set for the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Log file override; relative paths resolve against the workdir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

/// Resolves the project file from an explicit path, the environment or the
/// current directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> SupervisorResult<PathBuf> {
    find_config_path(explicit).ok_or_else(|| {
        SupervisorError::Config(format!(
            "no project file found (looked for {}; use --config or {})",
            DEFAULT_CONFIG_FILES.join(", "),
            CONFIG_ENV
        ))
    })
}

/// Like `resolve_config_path`, but falls back to a new `projects.toml` in the
/// current directory.
pub fn resolve_config_path_for_write(explicit: Option<PathBuf>) -> PathBuf {
    find_config_path(explicit).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]))
}

fn find_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> SupervisorResult<Config> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        SupervisorError::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            err
        ))
    })?;
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&raw),
        _ => toml::from_str(&raw).map_err(|err| err.to_string()),
    };
    parsed.map_err(|err| {
        SupervisorError::Config(format!(
            "failed to parse config file {}: {}",
            path.display(),
            err
        ))
    })
}

// JSON files carry `projects` either as an array or as an object keyed by name.
fn parse_json(raw: &str) -> Result<Config, String> {
    let mut value: Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    let projects = value
        .as_object_mut()
        .ok_or_else(|| "expected a JSON object at the top level".to_string())?
        .remove("projects");
    let mut config: Config = serde_json::from_value(value).map_err(|err| err.to_string())?;
    config.projects = match projects {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|err| err.to_string()))
            .collect::<Result<_, _>>()?,
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(name, mut entry)| {
                let Some(fields) = entry.as_object_mut() else {
                    return Err(format!("project '{}' must be an object", name));
                };
                fields
                    .entry("name")
                    .or_insert_with(|| Value::String(name.clone()));
                serde_json::from_value(entry).map_err(|err| format!("project '{}': {}", name, err))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err("`projects` must be an array or an object".to_string()),
    };
    Ok(config)
}

/// Appends a project entry to the file at `path`, creating the file when it
/// does not exist yet. Keys this crate does not know are kept, comments in
/// TOML files are not.
pub fn append_project(path: &Path, entry: &ProjectConfig) -> SupervisorResult<()> {
    let raw = read_existing(path)?;
    let updated = if is_json(path) {
        let mut doc: Value = match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| edit_error(path, err))?,
            None => serde_json::json!({ "projects": [] }),
        };
        let root = doc
            .as_object_mut()
            .ok_or_else(|| edit_error(path, "expected a JSON object at the top level"))?;
        let projects = root
            .entry("projects")
            .or_insert_with(|| Value::Array(Vec::new()));
        let mut value = serde_json::to_value(entry)?;
        match projects {
            Value::Array(items) => items.push(value),
            Value::Object(entries) => {
                if let Some(fields) = value.as_object_mut() {
                    fields.remove("name");
                }
                entries.insert(entry.name.clone(), value);
            }
            _ => return Err(edit_error(path, "`projects` must be an array or an object")),
        }
        serde_json::to_string_pretty(&doc)? + "\n"
    } else {
        let mut doc: toml::Table = match raw {
            Some(raw) => raw.parse().map_err(|err| edit_error(path, err))?,
            None => toml::Table::new(),
        };
        let value = toml::Value::try_from(entry).map_err(|err| edit_error(path, err))?;
        match doc
            .entry("project")
            .or_insert_with(|| toml::Value::Array(Vec::new()))
        {
            toml::Value::Array(items) => items.push(value),
            _ => return Err(edit_error(path, "`project` must be an array of tables")),
        }
        toml::to_string_pretty(&doc).map_err(|err| edit_error(path, err))?
    };
    write_document(path, &updated)
}

/// Removes the project called `name` from the file at `path`. Returns
/// `false` when the file has no such project.
pub fn remove_project(path: &Path, name: &str) -> SupervisorResult<bool> {
    let raw = read_existing(path)?
        .ok_or_else(|| SupervisorError::Config(format!("{} does not exist", path.display())))?;
    let (removed, updated) = if is_json(path) {
        let mut doc: Value = serde_json::from_str(&raw).map_err(|err| edit_error(path, err))?;
        let removed = match doc.get_mut("projects") {
            Some(Value::Array(items)) => {
                let before = items.len();
                items.retain(|item| item.get("name").and_then(Value::as_str) != Some(name));
                items.len() != before
            }
            Some(Value::Object(entries)) => entries.shift_remove(name).is_some(),
            _ => false,
        };
        (removed, serde_json::to_string_pretty(&doc)? + "\n")
    } else {
        let mut doc: toml::Table = raw.parse().map_err(|err| edit_error(path, err))?;
        let removed = match doc.get_mut("project") {
            Some(toml::Value::Array(items)) => {
                let before = items.len();
                items.retain(|item| item.get("name").and_then(toml::Value::as_str) != Some(name));
                items.len() != before
            }
            _ => false,
        };
        let updated = toml::to_string_pretty(&doc).map_err(|err| edit_error(path, err))?;
        (removed, updated)
    };
    if removed {
        write_document(path, &updated)?;
    }
    Ok(removed)
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

fn read_existing(path: &Path) -> SupervisorResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SupervisorError::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            err
        ))),
    }
}

fn edit_error(path: &Path, err: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::Config(format!("cannot update {}: {}", path.display(), err))
}

// Replace the file in one step so a running watcher never reads half of it.
fn write_document(path: &Path, contents: &str) -> SupervisorResult<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "projects".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
