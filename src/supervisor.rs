//! The process supervisor.
//!
//! `Supervisor` owns the process table: one slot per project holding at most
//! one `ProcessHandle`. Mutating operations on a project are serialized by the
//! slot's async `action` mutex, so unrelated projects never wait on each other.
//! The handle itself sits behind a short synchronous lock that status queries
//! and liveness polling take without touching the action mutex.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::process::{ExitInfo, Phase, ProcessHandle, ProjectState, StatusSnapshot};
use crate::registry::{Project, ProjectRegistry};
use crate::runner::{self, Liveness, Readiness, ShutdownConfig};
use crate::state::{InstanceLock, PersistedHandle, StateStore};

const KILL_WAIT: Duration = Duration::from_secs(2);

/// Timing knobs of the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub shutdown: ShutdownConfig,
    /// How long a project with a port may take to accept connections.
    pub ready_timeout: Duration,
    /// Delay before the first liveness check of a project without a port.
    pub start_settle: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shutdown: ShutdownConfig::new(0, 2_000),
            ready_timeout: Duration::from_secs(12),
            start_settle: Duration::from_millis(300),
        }
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned; the snapshot shows how readiness resolved.
    Started(StatusSnapshot),
    /// The project was already running; nothing was spawned.
    AlreadyRunning(StatusSnapshot),
}

impl StartOutcome {
    pub fn snapshot(&self) -> &StatusSnapshot {
        match self {
            Self::Started(snapshot) | Self::AlreadyRunning(snapshot) => snapshot,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::AlreadyRunning(_) => "already_running",
        }
    }
}

struct Slot {
    project: RwLock<Project>,
    action: tokio::sync::Mutex<()>,
    inner: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    handle: Option<ProcessHandle>,
    last_exit: Option<ExitInfo>,
}

impl Slot {
    fn new(project: Project, handle: Option<ProcessHandle>) -> Self {
        Self {
            project: RwLock::new(project),
            action: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SlotState {
                handle,
                last_exit: None,
            }),
        }
    }
}

/// Starts, stops and tracks the processes of all registered projects.
pub struct Supervisor {
    settings: SupervisorSettings,
    store: StateStore,
    lock: Option<InstanceLock>,
    order: RwLock<Vec<String>>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    conflicts: RwLock<BTreeMap<u16, Vec<String>>>,
    /// Persisted handles of names absent from the registry, kept on save.
    foreign: Mutex<BTreeMap<String, PersistedHandle>>,
    persist_guard: Mutex<()>,
}

impl Supervisor {
    /// Creates a supervisor over `registry`, re-adopting processes recorded in
    /// `store`. Without an `InstanceLock` the supervisor is read-only: it never
    /// writes the state file.
    pub fn new(
        registry: ProjectRegistry,
        settings: SupervisorSettings,
        store: StateStore,
        lock: Option<InstanceLock>,
    ) -> Self {
        let mut persisted = store.load();
        let mut slots = HashMap::with_capacity(registry.len());
        for project in registry.list() {
            let handle = persisted.remove(&project.name).map(|entry| {
                debug!(project = %project.name, pid = entry.pid, "adopting recorded process");
                ProcessHandle::adopted(entry.pid, entry.started_at)
            });
            slots.insert(
                project.name.clone(),
                Arc::new(Slot::new(project.clone(), handle)),
            );
        }
        if !persisted.is_empty() {
            debug!(
                names = ?persisted.keys().collect::<Vec<_>>(),
                "state file lists projects missing from the registry"
            );
        }
        Self {
            settings,
            store,
            lock,
            order: RwLock::new(registry.list().map(|p| p.name.clone()).collect()),
            slots: RwLock::new(slots),
            conflicts: RwLock::new(registry.port_conflicts()),
            foreign: Mutex::new(persisted),
            persist_guard: Mutex::new(()),
        }
    }

    /// Whether this instance owns the state directory.
    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    /// Current definition of a project.
    pub fn project(&self, name: &str) -> SupervisorResult<Project> {
        Ok(self.slot(name)?.project.read().clone())
    }

    /// All project definitions in reporting order.
    pub fn projects(&self) -> Vec<Project> {
        self.ordered_slots()
            .iter()
            .map(|slot| slot.project.read().clone())
            .collect()
    }

    /// Ports shared by more than one registered project.
    pub fn port_conflicts(&self) -> BTreeMap<u16, Vec<String>> {
        self.conflicts.read().clone()
    }

    /// Log file the project's output is appended to.
    pub fn log_path(&self, name: &str) -> SupervisorResult<PathBuf> {
        let project = self.project(name)?;
        Ok(self.resolve_log_path(&project))
    }

    /// Spawns the project's command unless it is already running.
    pub async fn start(&self, name: &str) -> SupervisorResult<StartOutcome> {
        let slot = self.slot(name)?;
        let project = slot.project.read().clone();
        let pid = {
            let _action = slot.action.lock().await;
            let current = self.observe(&slot);
            if current.state.is_active() {
                debug!(project = name, pid = ?current.pid, "already running");
                return Ok(StartOutcome::AlreadyRunning(current));
            }
            self.warn_port_conflicts(&project);

            let log_path = self.resolve_log_path(&project);
            let (child, pid) = runner::spawn_project(&project, &log_path).map_err(|source| {
                warn!(project = name, error = %source, "spawn failed");
                SupervisorError::Spawn {
                    name: name.to_string(),
                    source,
                }
            })?;
            {
                let mut state = slot.inner.lock();
                state.handle = Some(ProcessHandle::spawned(child, pid));
                state.last_exit = None;
            }
            info!(project = name, pid, command = %project.command, "started");
            self.persist();
            pid
        };

        let readiness = runner::wait_until_ready(
            project.port,
            self.settings.ready_timeout,
            self.settings.start_settle,
            || self.probe_tracked(&slot, pid),
        )
        .await;
        match readiness {
            Readiness::Ready => self.mark_running(&slot, pid),
            Readiness::TimedOut => {
                warn!(
                    project = name,
                    pid,
                    port = ?project.port,
                    "port not open yet, marking running anyway"
                );
                self.mark_running(&slot, pid);
            }
            Readiness::Exited(code) => {
                debug!(project = name, pid, ?code, "exited while starting");
            }
        }
        Ok(StartOutcome::Started(self.observe(&slot)))
    }

    /// Stops the project: graceful signals first, then a forced kill once the
    /// grace period is over.
    pub async fn stop(&self, name: &str) -> SupervisorResult<StatusSnapshot> {
        let slot = self.slot(name)?;
        let _action = slot.action.lock().await;
        let current = self.observe(&slot);
        if !current.state.is_active() {
            return Err(SupervisorError::NotRunning(name.to_string()));
        }
        let pid = {
            let mut state = slot.inner.lock();
            let Some(handle) = state.handle.as_mut() else {
                return Err(SupervisorError::NotRunning(name.to_string()));
            };
            handle.phase = Phase::Stopping;
            handle.pid
        };
        info!(project = name, pid, "stopping");

        let mut exit = None;
        for (signal, timeout) in self.settings.shutdown.stages() {
            debug!(project = name, pid, signal = signal.label(), "sending signal");
            runner::send_signal(pid, signal);
            exit = runner::wait_for_exit(|| self.probe_tracked(&slot, pid), timeout).await;
            if exit.is_some() {
                break;
            }
        }
        if exit.is_none() {
            warn!(
                project = name,
                pid,
                grace_ms = self.settings.shutdown.grace_period().as_millis() as u64,
                "still running after grace period, killing"
            );
            {
                let mut state = slot.inner.lock();
                if let Some(handle) = state.handle.as_mut() {
                    runner::force_kill(handle);
                }
            }
            exit = runner::wait_for_exit(|| self.probe_tracked(&slot, pid), KILL_WAIT).await;
            if exit.is_none() {
                warn!(project = name, pid, "process survived SIGKILL, releasing handle");
            }
        }

        let last_exit = ExitInfo {
            code: exit.flatten(),
            unexpected: false,
        };
        {
            let mut state = slot.inner.lock();
            state.handle = None;
            state.last_exit = Some(last_exit);
        }
        self.persist();
        info!(project = name, pid, code = ?last_exit.code, "stopped");
        let port = slot.project.read().port;
        Ok(StatusSnapshot::idle(name, port, Some(last_exit)))
    }

    /// Stops the project if it runs, then starts it again.
    pub async fn restart(&self, name: &str) -> SupervisorResult<StartOutcome> {
        match self.stop(name).await {
            Ok(_) | Err(SupervisorError::NotRunning(_)) => {}
            Err(err) => return Err(err),
        }
        self.start(name).await
    }

    /// Current snapshot of one project.
    pub fn status(&self, name: &str) -> SupervisorResult<StatusSnapshot> {
        let slot = self.slot(name)?;
        Ok(self.observe(&slot))
    }

    /// Snapshots of every project, including never-started ones.
    pub fn status_all(&self) -> Vec<StatusSnapshot> {
        self.ordered_slots()
            .iter()
            .map(|slot| self.observe(slot))
            .collect()
    }

    /// Swaps in a refreshed registry. Removed projects that still run keep
    /// their slot until they are stopped.
    pub fn reload(&self, registry: ProjectRegistry) {
        let names: HashSet<&str> = registry.list().map(|p| p.name.as_str()).collect();
        {
            let mut slots = self.slots.write();
            for project in registry.list() {
                match slots.get(&project.name) {
                    Some(slot) => *slot.project.write() = project.clone(),
                    None => {
                        slots.insert(
                            project.name.clone(),
                            Arc::new(Slot::new(project.clone(), None)),
                        );
                    }
                }
            }
            slots.retain(|name, slot| {
                names.contains(name.as_str()) || slot.inner.lock().handle.is_some()
            });
        }
        *self.order.write() = registry.list().map(|p| p.name.clone()).collect();
        *self.conflicts.write() = registry.port_conflicts();
        info!(projects = registry.len(), "reloaded project registry");
    }

    fn slot(&self, name: &str) -> SupervisorResult<Arc<Slot>> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    // Registered projects in declared order, then slots kept alive after a reload.
    fn ordered_slots(&self) -> Vec<Arc<Slot>> {
        let order = self.order.read().clone();
        let slots = self.slots.read();
        let mut ordered: Vec<Arc<Slot>> = order
            .iter()
            .filter_map(|name| slots.get(name).cloned())
            .collect();
        let mut extra: Vec<(&String, &Arc<Slot>)> = slots
            .iter()
            .filter(|(name, _)| !order.contains(*name))
            .collect();
        extra.sort_by(|a, b| a.0.cmp(b.0));
        ordered.extend(extra.into_iter().map(|(_, slot)| slot.clone()));
        ordered
    }

    // Snapshot a slot, reclassifying a process that died on its own as crashed
    // and releasing its handle.
    fn observe(&self, slot: &Slot) -> StatusSnapshot {
        let crashed = {
            let project = slot.project.read();
            let mut guard = slot.inner.lock();
            let state = &mut *guard;
            let Some(handle) = state.handle.as_mut() else {
                return StatusSnapshot::idle(&project.name, project.port, state.last_exit);
            };
            let code = match classify(&project.name, handle) {
                Liveness::Alive => {
                    return StatusSnapshot::active(&project.name, project.port, handle)
                }
                Liveness::Exited(code) => code,
                Liveness::Unknown(_) => None,
            };
            if handle.phase == Phase::Stopping {
                // The pending stop owns this transition.
                return StatusSnapshot::active(&project.name, project.port, handle);
            }
            let pid = handle.pid;
            let exit = ExitInfo {
                code,
                unexpected: true,
            };
            state.handle = None;
            state.last_exit = Some(exit);
            warn!(project = %project.name, pid, ?code, "process exited unexpectedly");
            StatusSnapshot {
                name: project.name.clone(),
                state: ProjectState::Crashed,
                pid: Some(pid),
                uptime_secs: None,
                port: project.port,
                last_exit: Some(exit),
            }
        };
        self.persist();
        crashed
    }

    // Only the handle this start spawned moves on; a stop may have replaced it.
    fn mark_running(&self, slot: &Slot, pid: u32) {
        let mut state = slot.inner.lock();
        if let Some(handle) = state
            .handle
            .as_mut()
            .filter(|handle| handle.pid == pid && handle.phase == Phase::Starting)
        {
            handle.phase = Phase::Running;
        }
    }

    fn probe_tracked(&self, slot: &Slot, pid: u32) -> Liveness {
        let project = slot.project.read();
        let mut state = slot.inner.lock();
        match state.handle.as_mut() {
            Some(handle) if handle.pid == pid => classify(&project.name, handle),
            _ => Liveness::Exited(None),
        }
    }

    fn resolve_log_path(&self, project: &Project) -> PathBuf {
        project
            .log_file
            .clone()
            .unwrap_or_else(|| self.store.log_path(&project.name))
    }

    fn warn_port_conflicts(&self, project: &Project) {
        let Some(port) = project.port else {
            return;
        };
        let conflicts = self.conflicts.read();
        let Some(names) = conflicts.get(&port) else {
            return;
        };
        let others: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|other| *other != project.name)
            .collect();
        warn!(
            project = %project.name,
            port,
            shared_with = %others.join(", "),
            "port is also used by other projects; start one of them at a time"
        );
    }

    // Writes every live handle to the state file. Only the lock holder writes.
    fn persist(&self) {
        if self.lock.is_none() {
            return;
        }
        let _guard = self.persist_guard.lock();
        let mut processes = self.foreign.lock().clone();
        {
            let slots = self.slots.read();
            for slot in slots.values() {
                let project = slot.project.read();
                let state = slot.inner.lock();
                if let Some(handle) = &state.handle {
                    processes.insert(
                        project.name.clone(),
                        PersistedHandle {
                            pid: handle.pid,
                            started_at: handle.started_at_secs(),
                        },
                    );
                }
            }
        }
        if let Err(err) = self.store.save(processes) {
            warn!(error = %err, "failed to persist supervisor state");
        }
    }
}

// Probe liveness; a failed probe is logged and counts as a dead process.
fn classify(name: &str, handle: &mut ProcessHandle) -> Liveness {
    match runner::probe(handle) {
        Liveness::Unknown(err) => {
            warn!(project = name, pid = handle.pid, error = %err, "liveness check failed");
            Liveness::Unknown(err)
        }
        other => other,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Instant;

    use super::*;
    use crate::config::{Config, ProjectConfig};

    fn test_settings() -> SupervisorSettings {
        SupervisorSettings {
            shutdown: ShutdownConfig::new(0, 500),
            ready_timeout: Duration::from_secs(2),
            start_settle: Duration::from_millis(50),
        }
    }

    fn registry(dir: &Path, projects: &[(&str, &str)]) -> ProjectRegistry {
        let config = Config {
            projects: projects
                .iter()
                .map(|(name, command)| ProjectConfig {
                    name: name.to_string(),
                    command: Some(command.to_string()),
                    workdir: Some(".".into()),
                    ..ProjectConfig::default()
                })
                .collect(),
            ..Config::default()
        };
        ProjectRegistry::from_config(&config, dir).unwrap()
    }

    fn supervisor(dir: &Path, projects: &[(&str, &str)]) -> Supervisor {
        let state_dir = dir.join("state");
        let lock = InstanceLock::acquire(&state_dir).unwrap();
        Supervisor::new(
            registry(dir, projects),
            test_settings(),
            StateStore::new(state_dir),
            Some(lock),
        )
    }

    #[tokio::test]
    async fn never_started_project_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);
        let snapshot = sup.status("web").unwrap();
        assert_eq!(snapshot.state, ProjectState::Stopped);
        assert_eq!(snapshot.pid, None);
        assert_eq!(sup.status_all().len(), 1);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);

        let first = sup.start("web").await.unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        assert_eq!(first.snapshot().state, ProjectState::Running);
        let pid = first.snapshot().pid.expect("pid");

        let second = sup.start("web").await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadyRunning(_)));
        assert_eq!(second.snapshot().pid, Some(pid));

        let stopped = sup.stop("web").await.unwrap();
        assert_eq!(stopped.state, ProjectState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);

        let (a, b) = tokio::join!(sup.start("web"), sup.start("web"));
        let (a, b) = (a.unwrap(), b.unwrap());
        let started = [&a, &b]
            .iter()
            .filter(|outcome| matches!(outcome, StartOutcome::Started(_)))
            .count();
        let already = [&a, &b]
            .iter()
            .filter(|outcome| matches!(outcome, StartOutcome::AlreadyRunning(_)))
            .count();
        assert_eq!((started, already), (1, 1));
        assert!(a.snapshot().pid.is_some());
        assert_eq!(a.snapshot().pid, b.snapshot().pid);

        sup.stop("web").await.unwrap();
    }

    #[tokio::test]
    async fn external_kill_is_reported_as_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);
        let pid = sup.start("web").await.unwrap().snapshot().pid.unwrap();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        let crashed = loop {
            let snapshot = sup.status("web").unwrap();
            if snapshot.state != ProjectState::Running || Instant::now() > deadline {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(crashed.state, ProjectState::Crashed);
        assert_eq!(crashed.pid, Some(pid));

        let after = sup.status("web").unwrap();
        assert_eq!(after.state, ProjectState::Stopped);
        assert!(after.last_exit.unwrap().unexpected);
        assert!(matches!(
            sup.stop("web").await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn stop_escalates_when_termination_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            &[(
                "stubborn",
                "sh -c 'trap \"\" TERM INT; while true; do sleep 1; done'",
            )],
        );
        sup.start("stubborn").await.unwrap();

        let begin = Instant::now();
        let snapshot = sup.stop("stubborn").await.unwrap();
        let elapsed = begin.elapsed();
        assert_eq!(snapshot.state, ProjectState::Stopped);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(500) + KILL_WAIT);
        assert_eq!(sup.status("stubborn").unwrap().state, ProjectState::Stopped);
    }

    #[tokio::test]
    async fn stop_within_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);
        sup.start("web").await.unwrap();
        let begin = Instant::now();
        let snapshot = sup.stop("web").await.unwrap();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert!(!snapshot.last_exit.unwrap().unexpected);
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);
        assert!(matches!(
            sup.start("unknown").await,
            Err(SupervisorError::NotFound(name)) if name == "unknown"
        ));
        assert!(matches!(sup.status("unknown"), Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("ghost", "/nonexistent/pmctl-test-binary")]);
        assert!(matches!(
            sup.start("ghost").await,
            Err(SupervisorError::Spawn { .. })
        ));
        assert_eq!(sup.status("ghost").unwrap().state, ProjectState::Stopped);
    }

    #[tokio::test]
    async fn immediate_exit_resolves_to_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("oops", "sh -c 'exit 3'")]);
        let outcome = sup.start("oops").await.unwrap();
        assert_eq!(outcome.snapshot().state, ProjectState::Crashed);
        assert_eq!(outcome.snapshot().last_exit.unwrap().code, Some(3));
    }

    #[tokio::test]
    async fn actions_on_other_projects_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("p", "sleep 100"), ("q", "sleep 100")]);
        let slot_p = sup.slot("p").unwrap();
        let held = slot_p.action.lock().await;

        let started = tokio::time::timeout(Duration::from_secs(3), sup.start("q"))
            .await
            .expect("start of q blocked behind p")
            .unwrap();
        assert_eq!(started.snapshot().state, ProjectState::Running);

        drop(held);
        sup.stop("q").await.unwrap();
    }

    #[tokio::test]
    async fn read_only_instance_adopts_recorded_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("web", "sleep 100")]);
        let pid = sup.start("web").await.unwrap().snapshot().pid.unwrap();

        let state_dir = dir.path().join("state");
        assert!(InstanceLock::try_acquire(&state_dir).unwrap().is_none());
        let observer = Supervisor::new(
            registry(dir.path(), &[("web", "sleep 100")]),
            test_settings(),
            StateStore::new(&state_dir),
            None,
        );
        assert!(!observer.is_writable());
        let snapshot = observer.status("web").unwrap();
        assert_eq!(snapshot.state, ProjectState::Running);
        assert_eq!(snapshot.pid, Some(pid));

        sup.stop("web").await.unwrap();
        assert!(StateStore::new(&state_dir).load().is_empty());
    }

    #[tokio::test]
    async fn reload_keeps_running_removed_projects() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("old", "sleep 100"), ("idle", "sleep 100")]);
        sup.start("old").await.unwrap();

        sup.reload(registry(dir.path(), &[("new", "sleep 100")]));
        let names: Vec<_> = sup.status_all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["new", "old"]);
        assert!(matches!(sup.status("idle"), Err(SupervisorError::NotFound(_))));

        sup.stop("old").await.unwrap();
        sup.reload(registry(dir.path(), &[("new", "sleep 100")]));
        assert_eq!(sup.status_all().len(), 1);
    }

    #[tokio::test]
    async fn output_goes_to_project_log() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &[("echo", "sh -c 'echo hello from echo'")]);
        sup.start("echo").await.unwrap();
        let log = std::fs::read_to_string(sup.log_path("echo").unwrap()).unwrap();
        assert!(log.contains("--- pmctl: starting"));
        assert!(log.contains("hello from echo"));
    }
}
