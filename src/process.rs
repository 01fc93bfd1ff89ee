//! Data structures for tracking project processes.
//!
//! This module defines the supervisor's record of a running process
//! (`ProcessHandle`), the per-project lifecycle phase, and the derived
//! `StatusSnapshot` reported to the CLI and the dashboard.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Externally visible lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    /// No process is tracked.
    Stopped,
    /// Spawned, readiness not yet resolved.
    Starting,
    /// Alive and ready.
    Running,
    /// A stop is in progress.
    Stopping,
    /// The process exited without a stop request.
    Crashed,
}

impl ProjectState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }

    /// Whether a process is (still) attached to the project.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Phase of a tracked handle while the process is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
}

impl From<Phase> for ProjectState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Starting => Self::Starting,
            Phase::Running => Self::Running,
            Phase::Stopping => Self::Stopping,
        }
    }
}

/// How the last process of a project ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal or unknown.
    pub code: Option<i32>,
    /// `true` when the process died without a stop request.
    pub unexpected: bool,
}

/// The supervisor's record of a running process instance.
#[derive(Debug)]
pub struct ProcessHandle {
    /// OS process identifier.
    pub pid: u32,
    /// Wall-clock start time.
    pub started_at: SystemTime,
    /// Current phase.
    pub phase: Phase,
    /// The child, when this supervisor spawned it. Handles re-adopted from the
    /// state file only know the pid.
    pub child: Option<tokio::process::Child>,
}

impl ProcessHandle {
    /// Wraps a freshly spawned child.
    pub fn spawned(child: tokio::process::Child, pid: u32) -> Self {
        Self {
            pid,
            started_at: SystemTime::now(),
            phase: Phase::Starting,
            child: Some(child),
        }
    }

    /// Re-adopts a process recorded by an earlier invocation.
    pub fn adopted(pid: u32, started_at_secs: u64) -> Self {
        Self {
            pid,
            started_at: UNIX_EPOCH + Duration::from_secs(started_at_secs),
            phase: Phase::Running,
            child: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    pub fn started_at_secs(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Point-in-time read of a project's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: ProjectState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub port: Option<u16>,
    pub last_exit: Option<ExitInfo>,
}

impl StatusSnapshot {
    /// Snapshot of a project without a tracked process.
    pub fn idle(name: &str, port: Option<u16>, last_exit: Option<ExitInfo>) -> Self {
        Self {
            name: name.to_string(),
            state: ProjectState::Stopped,
            pid: None,
            uptime_secs: None,
            port,
            last_exit,
        }
    }

    /// Snapshot of a live handle.
    pub fn active(name: &str, port: Option<u16>, handle: &ProcessHandle) -> Self {
        Self {
            name: name.to_string(),
            state: handle.phase.into(),
            pid: Some(handle.pid),
            uptime_secs: Some(handle.uptime().as_secs()),
            port,
            last_exit: None,
        }
    }
}

/// Formats an uptime as `1d 2h`, `3h 4m`, `5m 6s` or `7s`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        let snapshot = StatusSnapshot::idle("web", Some(8080), None);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["port"], 8080);
        assert!(json["pid"].is_null());
    }

    #[test]
    fn adopted_handle_keeps_start_time() {
        let handle = ProcessHandle::adopted(42, 1_700_000_000);
        assert_eq!(handle.started_at_secs(), 1_700_000_000);
        assert_eq!(handle.phase, Phase::Running);
        assert!(handle.child.is_none());
    }

    #[test]
    fn formats_uptime() {
        assert_eq!(format_uptime(7), "7s");
        assert_eq!(format_uptime(306), "5m 6s");
        assert_eq!(format_uptime(3 * 3600 + 240), "3h 4m");
        assert_eq!(format_uptime(86_400 + 7200), "1d 2h");
    }
}
