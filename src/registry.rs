//! Project definitions and their validated registry.
//!
//! `ProjectRegistry` turns the raw `[[project]]` entries of the config file into
//! immutable `Project` values, resolving commands and working directories and
//! rejecting anything the supervisor could not act on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{self, Config, ProjectConfig};
use crate::error::{SupervisorError, SupervisorResult};

/// A named, independently runnable unit managed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Unique project name.
    pub name: String,
    /// Command line as written in the config file.
    pub command: String,
    /// Executable resolved from `command`.
    pub program: String,
    /// Arguments resolved from `command`.
    pub args: Vec<String>,
    /// Working directory the command runs in.
    pub workdir: PathBuf,
    /// Port the project listens on, used for readiness checks.
    pub port: Option<u16>,
    pub description: Option<String>,
    pub notes: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Explicit log file, if configured.
    pub log_file: Option<PathBuf>,
}

/// The validated set of projects, in file-declared order.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: Vec<Project>,
    index: HashMap<String, usize>,
    source: Option<PathBuf>,
}

impl ProjectRegistry {
    /// Loads the registry from a project file.
    pub fn load(path: &Path) -> SupervisorResult<Self> {
        Self::load_with_config(path).map(|(_, registry)| registry)
    }

    /// Loads the registry together with the supervisor options of the file.
    pub fn load_with_config(path: &Path) -> SupervisorResult<(Config, Self)> {
        let config = config::load_config(path)?;
        let path = absolute(path)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut registry = Self::from_config(&config, &base)?;
        registry.source = Some(path);
        Ok((config, registry))
    }

    /// Validates `entry` against the projects already in the file at `path`
    /// and appends it. A missing file is created.
    pub fn add_to_file(path: &Path, entry: ProjectConfig) -> SupervisorResult<Project> {
        let path = absolute(path)?;
        let existing = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let project = project_from_config(&entry, &base)?;
        if existing.index.contains_key(&project.name) {
            return Err(SupervisorError::Config(format!(
                "project '{}' already exists",
                project.name
            )));
        }
        if !project.workdir.is_dir() {
            return Err(SupervisorError::Config(format!(
                "workdir {} is not a directory",
                project.workdir.display()
            )));
        }
        config::append_project(&path, &entry)?;
        Ok(project)
    }

    /// Deletes the project called `name` from the file at `path`.
    pub fn remove_from_file(path: &Path, name: &str) -> SupervisorResult<()> {
        if config::remove_project(path, name)? {
            Ok(())
        } else {
            Err(SupervisorError::NotFound(name.to_string()))
        }
    }

    /// Builds a registry from parsed configuration; relative workdirs resolve
    /// against `base`.
    pub fn from_config(config: &Config, base: &Path) -> SupervisorResult<Self> {
        let projects = config
            .projects
            .iter()
            .map(|entry| project_from_config(entry, base))
            .collect::<SupervisorResult<Vec<_>>>()?;
        Self::new(projects)
    }

    /// Builds a registry from already resolved projects.
    pub fn new(projects: Vec<Project>) -> SupervisorResult<Self> {
        ensure_unique_names(&projects)?;
        let index = projects
            .iter()
            .enumerate()
            .map(|(idx, project)| (project.name.clone(), idx))
            .collect();
        Ok(Self {
            projects,
            index,
            source: None,
        })
    }

    /// Returns the project with the given name.
    pub fn get(&self, name: &str) -> SupervisorResult<&Project> {
        self.index
            .get(name)
            .map(|idx| &self.projects[*idx])
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Iterates over all projects in declared order. The iterator borrows the
    /// registry, so calling `list` again restarts from the first project.
    pub fn list(&self) -> impl Iterator<Item = &Project> + '_ {
        self.projects.iter()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// The file this registry was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Ports declared by more than one project, with the projects sharing them.
    pub fn port_conflicts(&self) -> BTreeMap<u16, Vec<String>> {
        let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for project in &self.projects {
            if let Some(port) = project.port {
                by_port.entry(port).or_default().push(project.name.clone());
            }
        }
        by_port.retain(|_, names| names.len() > 1);
        by_port
    }
}

/// Finds a launcher script in `dir`: `start.sh`, `start-*.sh`, `run.sh` or
/// `run_*.sh`, in that order of preference.
pub fn detect_start_script(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    let pick = |prefix: &str, exact: bool| {
        names.iter().find(|name| {
            if exact {
                name.as_str() == prefix
            } else {
                name.starts_with(prefix) && name.ends_with(".sh")
            }
        })
    };
    pick("start.sh", true)
        .or_else(|| pick("start-", false))
        .or_else(|| pick("run.sh", true))
        .or_else(|| pick("run_", false))
        .cloned()
}

fn absolute(path: &Path) -> SupervisorResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"))
}

fn project_from_config(config: &ProjectConfig, base: &Path) -> SupervisorResult<Project> {
    let name = config.name.trim().to_string();
    if !name_pattern().is_match(&name) {
        return Err(SupervisorError::Config(format!(
            "invalid project name '{}' (use letters, digits, '.', '_' or '-')",
            config.name
        )));
    }

    let workdir = match config.workdir.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => resolve_path(base, Path::new(dir)),
        _ => {
            return Err(SupervisorError::Config(format!(
                "project '{}' has no workdir",
                name
            )))
        }
    };

    let command = match (&config.command, &config.start_script) {
        (Some(command), _) => command.clone(),
        (None, Some(script)) => {
            shell_words::join(["/bin/bash", workdir.join(script).to_string_lossy().as_ref()])
        }
        (None, None) => {
            return Err(SupervisorError::Config(format!(
                "project '{}' has no command",
                name
            )))
        }
    };
    let mut parts = shell_words::split(&command).map_err(|err| {
        SupervisorError::Config(format!("failed to parse command for {}: {}", name, err))
    })?;
    if parts.is_empty() {
        return Err(SupervisorError::Config(format!("empty command for {}", name)));
    }
    let program = parts.remove(0);

    let port = config
        .port
        .or_else(|| config.ports.as_ref().and_then(|ports| ports.first().copied()));
    let log_file = config
        .log_file
        .as_deref()
        .map(|file| resolve_path(&workdir, Path::new(file)));

    Ok(Project {
        name,
        command,
        program,
        args: parts,
        workdir,
        port,
        description: config.description.clone().filter(|s| !s.is_empty()),
        notes: config.notes.clone().filter(|s| !s.is_empty()),
        env: config.env.clone().unwrap_or_default(),
        log_file,
    })
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn ensure_unique_names(projects: &[Project]) -> SupervisorResult<()> {
    let mut seen = HashSet::new();
    for project in projects {
        if !seen.insert(project.name.as_str()) {
            return Err(SupervisorError::Config(format!(
                "duplicate project name: {}",
                project.name
            )));
        }
    }
    Ok(())
}
