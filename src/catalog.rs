//! Project and service catalog.
//!
//! The catalog is a single JSON document (`{"projects": [...]}`) that is read
//! once at startup and rewritten in full on every change. `CatalogStore` owns
//! the file, `Catalog` is the shared in-memory copy that the lifecycle
//! controllers and the HTTP layer read from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ManagerError;
use crate::process::ExecMode;

/// A runnable command bound to zero or more local TCP ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Identifier, unique across every project in the catalog.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form type tag (e.g. "frontend", "api").
    #[serde(rename = "type")]
    pub kind: String,
    /// Working directory. Empty means the manager's own working directory.
    #[serde(default)]
    pub cwd: String,
    /// Command line to execute.
    pub command: String,
    /// Ports the service is expected to listen on. Only used for probing.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// How `command` is executed.
    #[serde(default, skip_serializing_if = "ExecMode::is_shell")]
    pub exec: ExecMode,
}

/// A named group of services sharing a filesystem root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
    pub services: Vec<Service>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    projects: Vec<Project>,
}

/// Outcome of [`upsert_project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Replaced,
    Added,
}

/// Replaces the project with the same id in place, or appends it.
pub fn upsert_project(projects: &mut Vec<Project>, project: Project) -> Upsert {
    match projects.iter_mut().find(|p| p.id == project.id) {
        Some(existing) => {
            *existing = project;
            Upsert::Replaced
        }
        None => {
            projects.push(project);
            Upsert::Added
        }
    }
}

/// Checks that `project` can be upserted into `projects` without breaking
/// global service id uniqueness.
pub fn validate_project(projects: &[Project], project: &Project) -> Result<(), ManagerError> {
    if project.id.trim().is_empty() {
        return Err(ManagerError::Conflict("project id must not be empty".into()));
    }
    let mut seen = HashSet::new();
    for service in &project.services {
        if service.id.trim().is_empty() {
            return Err(ManagerError::Conflict(format!(
                "project {} has a service with an empty id",
                project.id
            )));
        }
        if !seen.insert(service.id.as_str()) {
            return Err(ManagerError::Conflict(format!(
                "service id {} appears more than once in project {}",
                service.id, project.id
            )));
        }
    }
    for other in projects.iter().filter(|p| p.id != project.id) {
        if let Some(service) = other.services.iter().find(|s| seen.contains(s.id.as_str())) {
            return Err(ManagerError::Conflict(format!(
                "service id {} is already used by project {}",
                service.id, other.id
            )));
        }
    }
    Ok(())
}

/// File-backed storage for the catalog document.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all projects. A missing or blank file is an empty catalog.
    pub fn load(&self) -> Result<Vec<Project>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read catalog {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let document: CatalogDocument = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse catalog {}", self.path.display()))?;
        Ok(document.projects)
    }

    /// Overwrites the whole document with `projects`.
    pub fn save(&self, projects: &[Project]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let document = CatalogDocument {
            projects: projects.to_vec(),
        };
        let serialized = serde_json::to_string_pretty(&document)?;
        std::fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write catalog {}", self.path.display()))?;
        Ok(())
    }
}

/// Shared in-memory catalog. All mutations are persisted before they become
/// visible.
#[derive(Debug)]
pub struct Catalog {
    store: CatalogStore,
    projects: RwLock<Vec<Project>>,
}

impl Catalog {
    /// Loads the catalog from `store`.
    pub fn open(store: CatalogStore) -> Result<Self> {
        let projects = store.load()?;
        Ok(Self::with_projects(store, projects))
    }

    pub fn with_projects(store: CatalogStore, projects: Vec<Project>) -> Self {
        Self {
            store,
            projects: RwLock::new(projects),
        }
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.projects.read().await.clone()
    }

    pub async fn project(&self, project_id: &str) -> Option<Project> {
        self.projects
            .read()
            .await
            .iter()
            .find(|p| p.id == project_id)
            .cloned()
    }

    /// Looks a service up by id across all projects.
    pub async fn find_service(&self, service_id: &str) -> Option<Service> {
        self.projects
            .read()
            .await
            .iter()
            .flat_map(|p| p.services.iter())
            .find(|s| s.id == service_id)
            .cloned()
    }

    /// Like [`Catalog::find_service`], also returning the owning project id.
    pub async fn locate_service(&self, service_id: &str) -> Option<(String, Service)> {
        self.projects.read().await.iter().find_map(|p| {
            p.services
                .iter()
                .find(|s| s.id == service_id)
                .map(|s| (p.id.clone(), s.clone()))
        })
    }

    /// Upserts `project` by id and saves the document.
    pub async fn register(&self, project: Project) -> Result<Upsert, ManagerError> {
        let mut projects = self.projects.write().await;
        validate_project(&projects, &project)?;
        let mut updated = projects.clone();
        let outcome = upsert_project(&mut updated, project);
        *projects = self.persist(updated).await?;
        Ok(outcome)
    }

    /// Removes a project by id and saves the document. Running processes of
    /// the removed services are left alone.
    pub async fn unregister(&self, project_id: &str) -> Result<Project, ManagerError> {
        let mut projects = self.projects.write().await;
        let Some(index) = projects.iter().position(|p| p.id == project_id) else {
            return Err(ManagerError::ProjectNotFound(project_id.to_string()));
        };
        let mut updated = projects.clone();
        let removed = updated.remove(index);
        *projects = self.persist(updated).await?;
        Ok(removed)
    }

    // Writes `projects` on the blocking pool and hands them back once saved.
    async fn persist(&self, projects: Vec<Project>) -> Result<Vec<Project>, ManagerError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&projects).map(|()| projects))
            .await
            .map_err(|err| ManagerError::Catalog(anyhow::Error::new(err)))?
            .map_err(ManagerError::Catalog)
    }
}
