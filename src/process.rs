//! Spawning service processes and tracking their liveness.
//!
//! A service's command string is turned into a `CommandSpec` (an argument
//! vector plus how it should be run), which spawns a `ProcessHandle`. The
//! handle owns the child so its exit status can be polled without blocking.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::catalog::Service;

/// How a service's command string is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Pass the whole string to the platform command interpreter.
    #[default]
    Shell,
    /// Split the string into words and execute the first one directly.
    Direct,
}

impl ExecMode {
    pub fn is_shell(&self) -> bool {
        matches!(self, ExecMode::Shell)
    }
}

/// A fully resolved command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The executable.
    pub program: String,
    /// Arguments for the executable.
    pub args: Vec<String>,
    /// Working directory; `None` inherits the manager's.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Builds the command for `service` according to its exec mode.
    pub fn for_service(service: &Service) -> io::Result<Self> {
        let (program, args) = match service.exec {
            ExecMode::Shell => shell_invocation(&service.command),
            ExecMode::Direct => {
                let mut parts = shell_words::split(&service.command)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                if parts.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "command is empty",
                    ));
                }
                let program = parts.remove(0);
                (program, parts)
            }
        };
        let cwd = if service.cwd.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&service.cwd))
        };
        Ok(Self { program, args, cwd })
    }

    /// Spawns the command detached from the manager's stdin.
    ///
    /// Output is inherited; the child keeps running if the handle is dropped.
    pub fn spawn(&self) -> io::Result<ProcessHandle> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command.stdin(Stdio::null());

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        // Own process group so a terminate signal also reaches the shell's children.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process exited before its pid was read"))?;
        Ok(ProcessHandle { pid, child })
    }
}

#[cfg(windows)]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    ("cmd".to_string(), vec!["/C".to_string(), command.to_string()])
}

#[cfg(not(windows))]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
}

/// A process spawned by the manager.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking check of whether the process is still running.
    ///
    /// A poll error is treated as exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, code = ?status.code(), "process exited");
                false
            }
            Err(err) => {
                tracing::warn!(pid = self.pid, error = %err, "failed to poll process");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::catalog::tests::service;

    #[test]
    fn shell_mode_wraps_the_whole_string() {
        let svc = service("web", "npm run dev -- --port 3000", &[3000]);
        let spec = CommandSpec::for_service(&svc).unwrap();
        assert_eq!(spec.args.last().map(String::as_str), Some("npm run dev -- --port 3000"));
        assert_eq!(spec.cwd, None);
    }

    #[test]
    fn direct_mode_splits_words() {
        let mut svc = service("api", r#"python -m http.server "8000""#, &[8000]);
        svc.exec = ExecMode::Direct;
        svc.cwd = "/srv/api".into();
        let spec = CommandSpec::for_service(&svc).unwrap();
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["-m", "http.server", "8000"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/api")));
    }

    #[test]
    fn direct_mode_rejects_empty_and_unbalanced_commands() {
        let mut svc = service("api", "   ", &[]);
        svc.exec = ExecMode::Direct;
        assert!(CommandSpec::for_service(&svc).is_err());
        svc.command = "echo \"unterminated".into();
        assert!(CommandSpec::for_service(&svc).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_not_alive() {
        let spec = CommandSpec::for_service(&service("quick", "exit 0", &[])).unwrap();
        let mut handle = spec.spawn().unwrap();
        assert!(handle.pid() > 0);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.is_alive() {
            assert!(tokio::time::Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_working_directory() {
        let mut svc = service("bad", "true", &[]);
        svc.cwd = "/definitely/not/a/real/dir".into();
        let spec = CommandSpec::for_service(&svc).unwrap();
        assert!(spec.spawn().is_err());
    }
}
