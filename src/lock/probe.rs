//! Process liveness and identity backends.

use std::path::PathBuf;

/// Suffix `/proc/<pid>/exe` gains once the binary is replaced on disk.
const DELETED_SUFFIX: &str = " (deleted)";

/// Queries about other processes on this host.
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` names a live, non-zombie process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Executable identity of `pid`, if it can be determined.
    fn identity(&self, pid: u32) -> Option<String>;

    /// Whether [`ProcessProbe::identity`] is meaningful on this platform.
    fn supports_identity(&self) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        let exists = match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        exists && !is_zombie(pid)
    }

    fn identity(&self, pid: u32) -> Option<String> {
        proc_exe(pid).map(|p| p.to_string_lossy().into_owned())
    }

    fn supports_identity(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProbe {
    // No portable liveness query; treat recorded owners as alive so TTL and
    // host checks decide.
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }

    fn identity(&self, _pid: u32) -> Option<String> {
        None
    }

    fn supports_identity(&self) -> bool {
        false
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: "<pid> (<comm>) <state> ...". comm may contain ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn proc_exe(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn proc_exe(_pid: u32) -> Option<PathBuf> {
    None
}

/// `identity` without the marker left when the binary was replaced on disk.
///
/// An upgraded executable still identifies the process that was running it.
pub fn normalize_identity(identity: String) -> String {
    match identity.strip_suffix(DELETED_SUFFIX) {
        Some(path) => path.to_owned(),
        None => identity,
    }
}

/// Identity of the running executable.
pub fn current_identity() -> Option<String> {
    std::env::current_exe()
        .ok()
        .map(|p: PathBuf| p.to_string_lossy().into_owned())
}

/// Host name of this machine.
pub fn current_host() -> String {
    os_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(unix)]
fn os_hostname() -> Option<String> {
    let name = nix::unistd::gethostname().ok()?;
    name.to_str().filter(|n| !n.is_empty()).map(str::to_owned)
}

#[cfg(not(unix))]
fn os_hostname() -> Option<String> {
    None
}
