//! OS-level process primitives.
//!
//! Spawning project commands detached from the calling terminal, probing
//! liveness, delivering termination signals and waiting for readiness. The
//! supervisor layers its state machine on top of these functions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::process::ProcessHandle;
use crate::registry::Project;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Graceful termination signals, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            Self::SigInt => "SIGINT",
            Self::SigTerm => "SIGTERM",
        }
    }
}

/// Per-stage timeouts of the staged shutdown. A zero timeout skips the stage.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    /// Enabled graceful stages with how long each may take.
    pub fn stages(&self) -> Vec<(ProcessSignal, Duration)> {
        let mut stages = Vec::with_capacity(2);
        if self.sigint_ms > 0 {
            stages.push((ProcessSignal::SigInt, Duration::from_millis(self.sigint_ms)));
        }
        if self.sigterm_ms > 0 {
            stages.push((ProcessSignal::SigTerm, Duration::from_millis(self.sigterm_ms)));
        }
        stages
    }

    /// Total grace period before the process is force-killed.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.sigint_ms + self.sigterm_ms)
    }
}

/// Result of a liveness check on a tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The process is gone; the exit code is known only for our own children.
    Exited(Option<i32>),
    /// The check itself failed.
    Unknown(String),
}

/// Outcome of waiting for a freshly spawned process to become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Still alive, but the port never accepted a connection.
    TimedOut,
    Exited(Option<i32>),
}

/// Spawns a project's command in its own session with output appended to
/// `log_path`.
pub fn spawn_project(project: &Project, log_path: &Path) -> std::io::Result<(Child, u32)> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(log, "--- pmctl: starting {} ---", project.command)?;
    let stderr = log.try_clone()?;

    let mut command = Command::new(&project.program);
    command
        .args(&project.args)
        .current_dir(&project.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));
    if !project.env.is_empty() {
        command.envs(&project.env);
    }
    // Projects outlive one-shot CLI invocations.
    command.kill_on_drop(false);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setsid();
            Ok(())
        });
    }

    let child = command.spawn()?;
    let pid = child.id().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "process exited before reporting a pid")
    })?;
    Ok((child, pid))
}

/// Checks whether the process behind `handle` is still alive. Our own
/// children are reaped here so an exited child never lingers as a zombie.
pub fn probe(handle: &mut ProcessHandle) -> Liveness {
    match handle.child.as_mut() {
        Some(child) => match child.try_wait() {
            Ok(Some(status)) => Liveness::Exited(status.code()),
            Ok(None) => Liveness::Alive,
            Err(err) => Liveness::Unknown(err.to_string()),
        },
        None => probe_pid(handle.pid),
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> Liveness {
    let Ok(pid) = i32::try_from(pid) else {
        return Liveness::Unknown(format!("pid {} out of range", pid));
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        // A zombie still answers signal 0 until its parent reaps it.
        if is_zombie(pid) {
            return Liveness::Exited(None);
        }
        return Liveness::Alive;
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Liveness::Exited(None),
        // The process exists but belongs to someone else.
        Some(libc::EPERM) => Liveness::Alive,
        _ => Liveness::Unknown(err.to_string()),
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| stat_state(&stat) == Some('Z'))
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: i32) -> bool {
    false
}

// The state field follows the parenthesised command name, which may itself
// contain spaces or parentheses.
#[cfg(any(target_os = "linux", test))]
fn stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

#[cfg(windows)]
fn probe_pid(pid: u32) -> Liveness {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if process == 0 {
            return Liveness::Exited(None);
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(process, &mut code);
        let err = std::io::Error::last_os_error();
        CloseHandle(process);
        if ok == 0 {
            Liveness::Unknown(err.to_string())
        } else if code == STILL_ACTIVE as u32 {
            Liveness::Alive
        } else {
            Liveness::Exited(Some(code as i32))
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn probe_pid(pid: u32) -> Liveness {
    Liveness::Unknown(format!("cannot probe pid {} on this platform", pid))
}

/// Sends a graceful termination signal to the process group and the process.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: ProcessSignal) {
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
    };
    send_unix_signal(pid, sig);
}

#[cfg(windows)]
pub fn send_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
pub fn send_signal(_pid: u32, _signal: ProcessSignal) {}

/// Terminates the process (group) without giving it a chance to clean up.
pub fn force_kill(handle: &mut ProcessHandle) {
    #[cfg(unix)]
    send_unix_signal(handle.pid, libc::SIGKILL);

    #[cfg(windows)]
    {
        if handle.child.is_none() {
            terminate_pid(handle.pid);
        }
    }

    if let Some(child) = handle.child.as_mut() {
        let _ = child.start_kill();
    }
}

#[cfg(unix)]
fn send_unix_signal(pid: u32, sig: libc::c_int) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn terminate_pid(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let process = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if process != 0 {
            let _ = TerminateProcess(process, 1);
            CloseHandle(process);
        }
    }
}

/// Polls `probe` until the process is gone or `timeout` elapses.
///
/// Returns `Some(code)` once the process exited, `None` on timeout. A failed
/// probe counts as exited.
pub async fn wait_for_exit<F>(mut probe: F, timeout: Duration) -> Option<Option<i32>>
where
    F: FnMut() -> Liveness,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match probe() {
            Liveness::Alive => {}
            Liveness::Exited(code) => return Some(code),
            Liveness::Unknown(_) => return Some(None),
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Waits until a freshly spawned process is ready.
///
/// With a port, readiness means a TCP connection to `127.0.0.1:port`
/// succeeds before `timeout`. Without one the process only has to survive
/// the `settle` delay.
pub async fn wait_until_ready<F>(
    port: Option<u16>,
    timeout: Duration,
    settle: Duration,
    mut probe: F,
) -> Readiness
where
    F: FnMut() -> Liveness,
{
    let Some(port) = port else {
        tokio::time::sleep(settle).await;
        return match probe() {
            Liveness::Alive => Readiness::Ready,
            Liveness::Exited(code) => Readiness::Exited(code),
            Liveness::Unknown(_) => Readiness::Exited(None),
        };
    };

    let end = tokio::time::Instant::now() + timeout;
    loop {
        match probe() {
            Liveness::Alive => {}
            Liveness::Exited(code) => return Readiness::Exited(code),
            Liveness::Unknown(_) => return Readiness::Exited(None),
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Readiness::Ready;
        }
        if tokio::time::Instant::now() >= end {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
