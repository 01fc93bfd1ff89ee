//! Plain-text and JSON rendering of supervisor snapshots for the CLI.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::disk::{format_bytes, DiskUsage};
use crate::error::SupervisorResult;
use crate::process::{format_uptime, ExitInfo, ProjectState, StatusSnapshot};
use crate::registry::Project;

const HEADERS: [&str; 6] = ["NAME", "STATE", "PID", "PORT", "UPTIME", "DESCRIPTION"];

/// Renders the `list` table, one row per snapshot, with a `running/total`
/// footer. Ports shared by several projects are marked with `!`.
pub fn render_list(
    snapshots: &[StatusSnapshot],
    projects: &[Project],
    conflicts: &BTreeMap<u16, Vec<String>>,
    color: bool,
) -> String {
    if snapshots.is_empty() {
        return "no projects defined\n".to_string();
    }
    let rows: Vec<[String; 6]> = snapshots
        .iter()
        .map(|snapshot| {
            let description = projects
                .iter()
                .find(|project| project.name == snapshot.name)
                .and_then(|project| project.description.clone())
                .unwrap_or_default();
            [
                snapshot.name.clone(),
                snapshot.state.label().to_string(),
                snapshot.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                snapshot
                    .port
                    .map(|port| {
                        if conflicts.contains_key(&port) {
                            format!("{}!", port)
                        } else {
                            port.to_string()
                        }
                    })
                    .unwrap_or_else(|| "-".into()),
                snapshot
                    .uptime_secs
                    .map(format_uptime)
                    .unwrap_or_else(|| "-".into()),
                description,
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &HEADERS.map(String::from), &widths, None);
    for (row, snapshot) in rows.iter().zip(snapshots) {
        push_row(&mut out, row, &widths, color.then_some(snapshot.state));
    }

    let running = snapshots
        .iter()
        .filter(|snapshot| snapshot.state.is_active())
        .count();
    let _ = writeln!(out, "\n{}/{} running", running, snapshots.len());
    for (port, names) in conflicts {
        let _ = writeln!(out, "! port {} is shared by {}", port, names.join(", "));
    }
    out
}

/// Renders the `disk` table: size of each working directory and a total.
pub fn render_disk(usages: &[DiskUsage]) -> String {
    if usages.is_empty() {
        return "no projects defined\n".to_string();
    }
    let headers = ["NAME", "SIZE", "WORKDIR"].map(String::from);
    let rows: Vec<[String; 3]> = usages
        .iter()
        .map(|usage| {
            [
                usage.name.clone(),
                usage.bytes.map(format_bytes).unwrap_or_else(|| "?".into()),
                usage.workdir.display().to_string(),
            ]
        })
        .collect();
    let mut widths = headers.clone().map(|cell| cell.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &headers, &widths, None);
    for row in &rows {
        push_row(&mut out, row, &widths, None);
    }
    let total: u64 = usages.iter().filter_map(|usage| usage.bytes).sum();
    let _ = writeln!(out, "\ntotal {}", format_bytes(total));
    out
}

fn push_row(out: &mut String, row: &[String], widths: &[usize], state: Option<ProjectState>) {
    let mut line = String::new();
    for (idx, (cell, width)) in row.iter().zip(widths).enumerate() {
        let padded = format!("{:<width$}", cell, width = width);
        match state {
            Some(state) if idx == 1 => line.push_str(&paint(&padded, state)),
            _ => line.push_str(&padded),
        }
        if idx + 1 < row.len() {
            line.push_str("  ");
        }
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Renders the detail block of one project for `status <name>`.
pub fn render_status(
    snapshot: &StatusSnapshot,
    project: Option<&Project>,
    log_path: Option<&Path>,
    color: bool,
) -> String {
    let state = if color {
        paint(snapshot.state.label(), snapshot.state)
    } else {
        snapshot.state.label().to_string()
    };
    let mut out = format!("{}  {}\n", snapshot.name, state);
    let mut field = |label: &str, value: String| {
        let _ = writeln!(out, "  {:<12}{}", format!("{}:", label), value);
    };
    if let Some(pid) = snapshot.pid {
        field("pid", pid.to_string());
    }
    if let Some(uptime) = snapshot.uptime_secs {
        field("uptime", format_uptime(uptime));
    }
    if let Some(port) = snapshot.port {
        field("port", port.to_string());
    }
    if let Some(project) = project {
        field("command", project.command.clone());
        field("workdir", project.workdir.display().to_string());
        if let Some(description) = &project.description {
            field("description", description.clone());
        }
        if let Some(notes) = &project.notes {
            field("notes", notes.clone());
        }
    }
    if let Some(path) = log_path {
        field("log", path.display().to_string());
    }
    if let Some(exit) = snapshot.last_exit {
        field("last exit", describe_exit(exit));
    }
    out
}

fn describe_exit(exit: ExitInfo) -> String {
    let code = match exit.code {
        Some(code) => format!("code {}", code),
        None => "signal or unknown".to_string(),
    };
    if exit.unexpected {
        format!("{} (unexpected)", code)
    } else {
        code
    }
}

/// Pretty-printed JSON for `--json` output.
pub fn render_json<T: Serialize + ?Sized>(value: &T) -> SupervisorResult<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn paint(text: &str, state: ProjectState) -> String {
    let code = match state {
        ProjectState::Running => "32",
        ProjectState::Starting | ProjectState::Stopping => "33",
        ProjectState::Crashed => "31",
        ProjectState::Stopped => "2",
    };
    format!("\x1b[{}m{}\x1b[0m", code, text)
}
