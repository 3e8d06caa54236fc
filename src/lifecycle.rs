//! Per-service start/stop/status.
//!
//! A service's state is never stored directly. It is inferred from the
//! registry (is there a live handle the manager spawned?) and from the ports
//! the service declares (is anything listening there?):
//!
//! - unmanaged: no handle in the registry,
//! - managed and running: handle present and alive,
//! - managed and stopped: handle present but the process has exited.
//!
//! `start` holds the service's registry slot across the liveness check, the
//! spawn and the insert, so concurrent starts cannot both spawn.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Service};
use crate::error::{KillError, ManagerError};
use crate::platform::{is_reserved_pid, Capabilities, PortReclaimer};
use crate::probe::PortProbe;
use crate::process::CommandSpec;
use crate::registry::ProcessRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

impl StartStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StartStatus::Started => "started",
            StartStatus::AlreadyRunning => "already_running",
        }
    }
}

/// Result of a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub status: StartStatus,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    /// Terminate was sent to a manager-owned process.
    Stopping,
    NotRunning,
    /// At least one kill was attempted on a process holding a declared port.
    StoppingExternal,
}

impl StopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StopStatus::Stopping => "stopping",
            StopStatus::NotRunning => "not_running",
            StopStatus::StoppingExternal => "stopping_external",
        }
    }
}

/// Result of `stop`. `killed` and `failed` are only populated for
/// `StoppingExternal` and list the pids each kill attempt ended with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub status: StopStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub killed: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<u32>,
}

impl StopOutcome {
    fn new(status: StopStatus) -> Self {
        Self {
            status,
            killed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// One row of the status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub project_id: String,
    pub service_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// `manager_running || port_occupied`.
    pub running: bool,
    /// Only set for a live manager-owned process.
    pub pid: Option<u32>,
    pub ports: Vec<u16>,
    pub manager_running: bool,
    pub port_occupied: bool,
}

/// Drives individual services. Cheap to clone.
#[derive(Clone)]
pub struct ServiceController {
    catalog: Arc<Catalog>,
    registry: Arc<ProcessRegistry>,
    probe: PortProbe,
    caps: Capabilities,
}

impl ServiceController {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ProcessRegistry>,
        probe: PortProbe,
        caps: Capabilities,
    ) -> Self {
        Self {
            catalog,
            registry,
            probe,
            caps,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Starts the service unless the manager already has it running.
    pub async fn start(&self, service_id: &str) -> Result<StartOutcome, ManagerError> {
        let service = self
            .catalog
            .find_service(service_id)
            .await
            .ok_or_else(|| ManagerError::ServiceNotFound(service_id.to_string()))?;

        let mut slot = self.registry.lock(service_id).await;
        if let Some(pid) = slot.alive_pid() {
            debug!(service = service_id, pid, "already running");
            return Ok(StartOutcome {
                status: StartStatus::AlreadyRunning,
                pid,
            });
        }

        let spawn_error = |source| ManagerError::Spawn {
            service: service_id.to_string(),
            source,
        };
        let spec = CommandSpec::for_service(&service).map_err(spawn_error)?;
        let handle = spec.spawn().map_err(spawn_error)?;
        let pid = handle.pid();
        slot.set(handle);
        info!(service = service_id, pid, command = %service.command, "started service");
        Ok(StartOutcome {
            status: StartStatus::Started,
            pid,
        })
    }

    /// Asks the service to stop without waiting for it to exit.
    ///
    /// A manager-owned process is terminated. Without a handle, whatever
    /// listens on the service's declared ports is killed on a best-effort
    /// basis.
    ///
    /// The slot stays locked for the whole call, so a concurrent `start`
    /// waits until the port owners have been dealt with.
    pub async fn stop(&self, service_id: &str) -> Result<StopOutcome, ManagerError> {
        let mut slot = self.registry.lock(service_id).await;
        if let Some(handle) = slot.get() {
            if !handle.is_alive() {
                return Ok(StopOutcome::new(StopStatus::NotRunning));
            }
            let pid = handle.pid();
            let terminator = self.caps.terminator.clone();
            match tokio::task::spawn_blocking(move || terminator.terminate(pid)).await {
                Ok(Ok(())) => info!(service = service_id, pid, "sent terminate"),
                Ok(Err(err)) => warn!(service = service_id, pid, error = %err, "terminate failed"),
                Err(err) => {
                    warn!(service = service_id, pid, error = %err, "terminate task failed")
                }
            }
            return Ok(StopOutcome::new(StopStatus::Stopping));
        }

        let service = self
            .catalog
            .find_service(service_id)
            .await
            .ok_or_else(|| ManagerError::ServiceNotFound(service_id.to_string()))?;
        let outcome = self.reclaim_ports(&service).await;
        drop(slot);
        Ok(outcome)
    }

    /// Current status of a service looked up by id.
    pub async fn status(&self, service_id: &str) -> Result<ServiceStatus, ManagerError> {
        let (project_id, service) = self
            .catalog
            .locate_service(service_id)
            .await
            .ok_or_else(|| ManagerError::ServiceNotFound(service_id.to_string()))?;
        Ok(self.status_of(&project_id, &service).await)
    }

    /// Current status of `service`, which belongs to `project_id`.
    pub async fn status_of(&self, project_id: &str, service: &Service) -> ServiceStatus {
        let pid = self.registry.lock(&service.id).await.alive_pid();
        let port_occupied = self.probe.any_open(&service.ports).await;
        let manager_running = pid.is_some();
        ServiceStatus {
            project_id: project_id.to_string(),
            service_id: service.id.clone(),
            name: service.name.clone(),
            kind: service.kind.clone(),
            running: manager_running || port_occupied,
            pid,
            ports: service.ports.clone(),
            manager_running,
            port_occupied,
        }
    }

    async fn reclaim_ports(&self, service: &Service) -> StopOutcome {
        let occupied = self.probe.open_ports(&service.ports).await;
        if occupied.is_empty() {
            return StopOutcome::new(StopStatus::NotRunning);
        }
        let reclaimer = self.caps.reclaimer.clone();
        let service_id = service.id.clone();
        match tokio::task::spawn_blocking(move || {
            reclaim(reclaimer.as_ref(), &service_id, &occupied)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(service = %service.id, error = %err, "port reclaim task failed");
                StopOutcome::new(StopStatus::NotRunning)
            }
        }
    }
}

// Kill every non-reserved owner of the occupied ports. Errors are logged.
fn reclaim(reclaimer: &dyn PortReclaimer, service_id: &str, ports: &[u16]) -> StopOutcome {
    let mut attempted = HashSet::new();
    let mut outcome = StopOutcome::new(StopStatus::NotRunning);
    for &port in ports {
        let owners = match reclaimer.port_owners(port) {
            Ok(owners) => owners,
            Err(KillError::Unsupported) => {
                warn!(service = service_id, port, "cannot resolve port owners on this platform");
                break;
            }
            Err(err) => {
                warn!(service = service_id, port, error = %err, "failed to resolve port owners");
                continue;
            }
        };
        for pid in owners {
            if is_reserved_pid(pid) {
                debug!(service = service_id, port, pid, "skipping reserved pid");
                continue;
            }
            if !attempted.insert(pid) {
                continue;
            }
            match reclaimer.kill(pid) {
                Ok(()) => {
                    info!(service = service_id, port, pid, "killed external process");
                    outcome.killed.push(pid);
                }
                Err(err) => {
                    warn!(
                        service = service_id,
                        port,
                        pid,
                        error = %err,
                        "failed to kill external process"
                    );
                    outcome.failed.push(pid);
                }
            }
        }
    }
    if !attempted.is_empty() {
        outcome.status = StopStatus::StoppingExternal;
    }
    outcome
}
