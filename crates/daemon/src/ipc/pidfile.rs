//! PID file utilities for daemon running detection.
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/panehub/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/panehub/daemon.pid` otherwise
//!
//! Stale files (unparseable, or naming a dead process) are removed whenever
//! they are read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("panehub").join("daemon.pid")
}

/// Check if a daemon process is currently running.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Records the current process as the running daemon.
pub fn write_pid_file() -> io::Result<PathBuf> {
    let path = get_pid_file_path();
    write_pid_to(&path, std::process::id())?;
    Ok(path)
}

/// Removes the PID file if it names the current process.
pub fn remove_pid_file() {
    let path = get_pid_file_path();
    if read_pid(&path) == Some(std::process::id()) {
        cleanup_stale_pid_file(&path);
    }
}

/// Reads the PID stored at `path` if that process is still alive.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let Some(pid) = read_pid(path) else {
        if path.exists() {
            cleanup_stale_pid_file(path);
        }
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Writes `pid` to `path`, creating parent directories.
pub fn write_pid_to(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a process with the given PID is running.
#[cfg(target_os = "linux")]
fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the process exists.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

fn cleanup_stale_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale PID file");
        }
    } else {
        tracing::debug!(path = %path.display(), "Removed stale PID file");
    }
}
