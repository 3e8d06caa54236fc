//! Project-level fan-out over services.
//!
//! Start and stop walk a project's services in declared order, one at a
//! time, and report every service, including those that failed. Nothing is
//! rolled back.

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::ManagerError;
use crate::lifecycle::{ServiceController, ServiceStatus, StartStatus, StopStatus};

/// What happened to one service during a fan-out: the start or stop status,
/// or `error` when the action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Started,
    AlreadyRunning,
    Stopping,
    NotRunning,
    StoppingExternal,
    Error,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Started => StartStatus::Started.as_str(),
            ReportStatus::AlreadyRunning => StartStatus::AlreadyRunning.as_str(),
            ReportStatus::Stopping => StopStatus::Stopping.as_str(),
            ReportStatus::NotRunning => StopStatus::NotRunning.as_str(),
            ReportStatus::StoppingExternal => StopStatus::StoppingExternal.as_str(),
            ReportStatus::Error => "error",
        }
    }
}

impl From<StartStatus> for ReportStatus {
    fn from(status: StartStatus) -> Self {
        match status {
            StartStatus::Started => ReportStatus::Started,
            StartStatus::AlreadyRunning => ReportStatus::AlreadyRunning,
        }
    }
}

impl From<StopStatus> for ReportStatus {
    fn from(status: StopStatus) -> Self {
        match status {
            StopStatus::Stopping => ReportStatus::Stopping,
            StopStatus::NotRunning => ReportStatus::NotRunning,
            StopStatus::StoppingExternal => ReportStatus::StoppingExternal,
        }
    }
}

/// Per-service entry in a project start/stop report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub service_id: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceReport {
    fn failed(service_id: &str, err: &ManagerError) -> Self {
        Self {
            service_id: service_id.to_string(),
            status: ReportStatus::Error,
            pid: None,
            error: Some(err.to_string()),
        }
    }
}

/// Ordered report for a whole project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectReport {
    pub project_id: String,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Stop,
}

#[derive(Clone)]
pub struct ProjectController {
    services: ServiceController,
}

impl ProjectController {
    pub fn new(services: ServiceController) -> Self {
        Self { services }
    }

    /// Starts every service of the project in declared order.
    pub async fn start(&self, project_id: &str) -> Result<ProjectReport, ManagerError> {
        self.fan_out(project_id, Action::Start).await
    }

    /// Stops every service of the project in declared order.
    pub async fn stop(&self, project_id: &str) -> Result<ProjectReport, ManagerError> {
        self.fan_out(project_id, Action::Stop).await
    }

    async fn fan_out(
        &self,
        project_id: &str,
        action: Action,
    ) -> Result<ProjectReport, ManagerError> {
        let project = self
            .services
            .catalog()
            .project(project_id)
            .await
            .ok_or_else(|| ManagerError::ProjectNotFound(project_id.to_string()))?;

        let mut reports = Vec::with_capacity(project.services.len());
        for service in &project.services {
            let report = match action {
                Action::Start => match self.services.start(&service.id).await {
                    Ok(outcome) => ServiceReport {
                        service_id: service.id.clone(),
                        status: outcome.status.into(),
                        pid: Some(outcome.pid),
                        error: None,
                    },
                    Err(err) => ServiceReport::failed(&service.id, &err),
                },
                Action::Stop => match self.services.stop(&service.id).await {
                    Ok(outcome) => ServiceReport {
                        service_id: service.id.clone(),
                        status: outcome.status.into(),
                        pid: None,
                        error: None,
                    },
                    Err(err) => ServiceReport::failed(&service.id, &err),
                },
            };
            if let Some(error) = &report.error {
                warn!(
                    project = project_id,
                    service = %service.id,
                    ?action,
                    error = %error,
                    "service action failed"
                );
            }
            reports.push(report);
        }
        Ok(ProjectReport {
            project_id: project_id.to_string(),
            services: reports,
        })
    }

    /// Status of every service in the catalog, in catalog order. Services are
    /// probed concurrently.
    pub async fn status_all(&self) -> Vec<ServiceStatus> {
        let projects = self.services.catalog().projects().await;
        let mut probes = JoinSet::new();
        let mut index = 0usize;
        for project in projects {
            for service in project.services {
                let controller = self.services.clone();
                let project_id = project.id.clone();
                let slot = index;
                probes.spawn(async move {
                    (slot, controller.status_of(&project_id, &service).await)
                });
                index += 1;
            }
        }
        let mut rows = Vec::with_capacity(index);
        while let Some(result) = probes.join_next().await {
            match result {
                Ok(row) => rows.push(row),
                Err(err) => warn!(error = %err, "status task failed"),
            }
        }
        rows.sort_unstable_by_key(|(slot, _)| *slot);
        rows.into_iter().map(|(_, status)| status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{project, service};
    use crate::lifecycle::tests::{free_port, host_controller, wait_until_stopped};

    #[test]
    fn report_status_keeps_the_lifecycle_names() {
        let all = [
            ReportStatus::Started,
            ReportStatus::AlreadyRunning,
            ReportStatus::Stopping,
            ReportStatus::NotRunning,
            ReportStatus::StoppingExternal,
            ReportStatus::Error,
        ];
        for status in all {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
        assert_eq!(ReportStatus::from(StartStatus::AlreadyRunning).as_str(), "already_running");
        assert_eq!(
            ReportStatus::from(StopStatus::StoppingExternal).as_str(),
            StopStatus::StoppingExternal.as_str()
        );
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let controller = ProjectController::new(host_controller(vec![]));
        assert!(controller.start("nope").await.unwrap_err().is_not_found());
        assert!(controller.stop("nope").await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_stop_report_every_service_in_order() {
        let web_port = free_port().await;
        let api_port = free_port().await;
        let services = host_controller(vec![project(
            "p1",
            vec![
                service("web", "sleep 30", &[web_port]),
                service("api", "sleep 30", &[api_port]),
            ],
        )]);
        let controller = ProjectController::new(services.clone());

        let report = controller.start("p1").await.unwrap();
        assert_eq!(report.project_id, "p1");
        let ids: Vec<_> = report.services.iter().map(|s| s.service_id.as_str()).collect();
        assert_eq!(ids, vec!["web", "api"]);
        for entry in &report.services {
            assert_eq!(entry.status, ReportStatus::Started);
            assert!(entry.pid.unwrap_or(0) > 0);
        }

        let listing = controller.status_all().await;
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].service_id, "web");
        assert_eq!(listing[1].service_id, "api");
        assert!(listing.iter().all(|s| s.running && s.manager_running));

        let stopped = controller.stop("p1").await.unwrap();
        assert!(stopped
            .services
            .iter()
            .all(|s| s.status == ReportStatus::Stopping && s.pid.is_none()));
        wait_until_stopped(&services, "web").await;
        wait_until_stopped(&services, "api").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn a_failing_service_does_not_abort_the_fan_out() {
        let mut broken = service("broken", "true", &[]);
        broken.cwd = "/definitely/not/a/real/dir".into();
        let services = host_controller(vec![project(
            "p1",
            vec![broken, service("ok", "sleep 30", &[])],
        )]);
        let controller = ProjectController::new(services.clone());

        let report = controller.start("p1").await.unwrap();
        assert_eq!(report.services.len(), 2);
        assert_eq!(report.services[0].status, ReportStatus::Error);
        assert!(report.services[0].error.is_some());
        assert_eq!(report.services[1].status, ReportStatus::Started);

        let stopped = controller.stop("p1").await.unwrap();
        assert_eq!(stopped.services[0].status, ReportStatus::NotRunning);
        assert_eq!(stopped.services[1].status, ReportStatus::Stopping);
        wait_until_stopped(&services, "ok").await;
    }

    #[tokio::test]
    async fn status_all_is_empty_for_an_empty_catalog() {
        let controller = ProjectController::new(host_controller(vec![]));
        assert!(controller.status_all().await.is_empty());
    }
}
