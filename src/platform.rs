//! Host-specific process termination.
//!
//! Two capabilities are selected once at startup:
//!
//! - a [`Terminator`] stops a process the manager spawned itself. Unix hosts
//!   send SIGTERM to the process group; Windows kills the whole process tree
//!   because children are not reaped with their parent.
//! - a [`PortReclaimer`] finds which processes listen on a port and kills
//!   them. Hosts without a way to do that get [`UnsupportedReclaimer`], which
//!   reports `KillError::Unsupported` instead of doing nothing.

use std::process::{Command, Output};
use std::sync::Arc;

use crate::error::KillError;

/// Stops a process owned by the manager.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<(), KillError>;
}

/// Resolves and kills the owners of a listening port.
pub trait PortReclaimer: Send + Sync {
    /// Pids listening on `port`, possibly including reserved ones.
    fn port_owners(&self, port: u16) -> Result<Vec<u32>, KillError>;
    /// Forcefully kills `pid`.
    fn kill(&self, pid: u32) -> Result<(), KillError>;
}

/// The capability pair used by the lifecycle controller.
#[derive(Clone)]
pub struct Capabilities {
    pub terminator: Arc<dyn Terminator>,
    pub reclaimer: Arc<dyn PortReclaimer>,
}

impl Capabilities {
    /// Picks the implementations for the platform this binary runs on.
    #[cfg(unix)]
    pub fn for_host() -> Self {
        Self {
            terminator: Arc::new(SignalTerminator),
            reclaimer: Arc::new(LsofReclaimer),
        }
    }

    #[cfg(windows)]
    pub fn for_host() -> Self {
        Self {
            terminator: Arc::new(TreeTerminator),
            reclaimer: Arc::new(NetstatReclaimer),
        }
    }

    #[cfg(not(any(unix, windows)))]
    pub fn for_host() -> Self {
        Self {
            terminator: Arc::new(TreeTerminator),
            reclaimer: Arc::new(UnsupportedReclaimer),
        }
    }
}

/// Pids that must never be killed: the idle/system processes, init and the
/// manager itself.
pub fn is_reserved_pid(pid: u32) -> bool {
    if pid == 0 || pid == std::process::id() {
        return true;
    }
    if cfg!(windows) {
        pid == 4
    } else {
        pid == 1
    }
}

/// Sends SIGTERM to the process group led by the pid, then to the pid.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalTerminator;

#[cfg(unix)]
impl Terminator for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<(), KillError> {
        // kill(-0, ..) would signal our own group.
        if is_reserved_pid(pid) {
            return Err(KillError::ReservedPid(pid));
        }
        let pid = pid as i32;
        let group = unsafe { libc::kill(-pid, libc::SIGTERM) };
        let single = unsafe { libc::kill(pid, libc::SIGTERM) };
        if group != 0 && single != 0 {
            return Err(KillError::Io {
                command: format!("kill -TERM {}", pid),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Kills the process tree rooted at the pid with `taskkill /F /T`.
#[cfg_attr(unix, allow(dead_code))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeTerminator;

impl Terminator for TreeTerminator {
    fn terminate(&self, pid: u32) -> Result<(), KillError> {
        if is_reserved_pid(pid) {
            return Err(KillError::ReservedPid(pid));
        }
        let pid = pid.to_string();
        run_checked("taskkill", &["/F", "/T", "/PID", &pid]).map(|_| ())
    }
}

/// Port owners via `lsof`, killed with SIGKILL.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofReclaimer;

#[cfg(unix)]
impl PortReclaimer for LsofReclaimer {
    fn port_owners(&self, port: u16) -> Result<Vec<u32>, KillError> {
        let filter = format!("-iTCP:{}", port);
        let output = run("lsof", &["-nP", "-t", &filter, "-sTCP:LISTEN"])?;
        // lsof exits 1 when nothing matches.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && !stdout.trim().is_empty() {
            return Err(KillError::CommandFailed {
                command: "lsof".to_string(),
                status: output.status.to_string(),
            });
        }
        Ok(parse_lsof_pids(&stdout))
    }

    fn kill(&self, pid: u32) -> Result<(), KillError> {
        if unsafe { libc::kill(pid as i32, libc::SIGKILL) } != 0 {
            return Err(KillError::Io {
                command: format!("kill -KILL {}", pid),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Port owners via `netstat -ano`, killed with `taskkill /F`.
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetstatReclaimer;

impl PortReclaimer for NetstatReclaimer {
    fn port_owners(&self, port: u16) -> Result<Vec<u32>, KillError> {
        let stdout = run_checked("netstat", &["-ano", "-p", "TCP"])?;
        Ok(parse_netstat_listeners(&stdout, port))
    }

    fn kill(&self, pid: u32) -> Result<(), KillError> {
        let pid = pid.to_string();
        run_checked("taskkill", &["/F", "/PID", &pid]).map(|_| ())
    }
}

/// For hosts with no known way to map ports to processes.
#[cfg_attr(any(unix, windows), allow(dead_code))]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedReclaimer;

impl PortReclaimer for UnsupportedReclaimer {
    fn port_owners(&self, _port: u16) -> Result<Vec<u32>, KillError> {
        Err(KillError::Unsupported)
    }

    fn kill(&self, _pid: u32) -> Result<(), KillError> {
        Err(KillError::Unsupported)
    }
}

fn run(program: &str, args: &[&str]) -> Result<Output, KillError> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| KillError::Io {
            command: program.to_string(),
            source,
        })
}

fn run_checked(program: &str, args: &[&str]) -> Result<String, KillError> {
    let output = run(program, args)?;
    if !output.status.success() {
        return Err(KillError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extracts the pids of LISTENING sockets bound to `port` from
/// `netstat -ano` output.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !parts.contains(&"LISTENING") {
            continue;
        }
        if !parts[1].ends_with(&suffix) {
            continue;
        }
        if let Some(pid) = parts.last().and_then(|p| p.parse::<u32>().ok()) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Parses `lsof -t` output, one pid per line.
#[cfg_attr(not(unix), allow(dead_code))]
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in output.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}
