//! `portrack register`: add or replace a project in the catalog.
//!
//! The running API is tried first so the live manager sees the change
//! immediately. If that fails for any reason the catalog file is edited
//! directly, with the same replace-or-append-by-id rule the API applies.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::catalog::{upsert_project, validate_project, CatalogStore, Project, Upsert};

const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Which path ended up recording the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    Api,
    File(Upsert),
}

pub struct RegistrationAgent {
    api_url: String,
    store: CatalogStore,
}

impl RegistrationAgent {
    pub fn new(api_url: impl Into<String>, store: CatalogStore) -> Self {
        Self {
            api_url: api_url.into(),
            store,
        }
    }

    /// Registers `project` through the API, falling back to the catalog file.
    pub async fn register(&self, project: &Project) -> Result<Registered> {
        match self.register_via_api(project).await {
            Ok(()) => {
                info!(project = %project.id, url = %self.api_url, "registered via API");
                Ok(Registered::Api)
            }
            Err(err) => {
                warn!(
                    url = %self.api_url,
                    error = %format!("{:#}", err),
                    "API registration failed, editing catalog file"
                );
                let outcome = self.register_via_file(project.clone())?;
                info!(
                    project = %project.id,
                    path = %self.store.path().display(),
                    ?outcome,
                    "registered via catalog file"
                );
                Ok(Registered::File(outcome))
            }
        }
    }

    async fn register_via_api(&self, project: &Project) -> Result<()> {
        let client = reqwest::Client::builder()
            .user_agent(format!("portrack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(API_TIMEOUT)
            .build()?;
        client
            .post(&self.api_url)
            .json(project)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("API rejected the project")?;
        Ok(())
    }

    fn register_via_file(&self, project: Project) -> Result<Upsert> {
        let mut projects = self.store.load()?;
        validate_project(&projects, &project)?;
        let outcome = upsert_project(&mut projects, project);
        self.store.save(&projects)?;
        Ok(outcome)
    }
}

/// Reads a project document from `path`.
pub fn read_project_file(path: &Path) -> Result<Project> {
    if !path.exists() {
        bail!("input file not found: {}", path.display());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let project: Project = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse project in {}", path.display()))?;
    Ok(project)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::catalog::tests::{project, service};
    use crate::lifecycle::tests::free_port;
    use crate::server::tests::spawn_server;

    #[tokio::test]
    async fn falls_back_to_the_catalog_file_when_the_api_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("config.json"));
        store.save(&[project("other", vec![])]).unwrap();
        let url = format!("http://127.0.0.1:{}/projects", free_port().await);
        let agent = RegistrationAgent::new(url, store.clone());

        let p1 = project("p1", vec![service("web", "npm start", &[3000])]);
        assert_eq!(agent.register(&p1).await.unwrap(), Registered::File(Upsert::Added));

        let mut renamed = p1.clone();
        renamed.name = "renamed".into();
        assert_eq!(
            agent.register(&renamed).await.unwrap(),
            Registered::File(Upsert::Replaced)
        );
        let saved = store.load().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].id, "other");
        assert_eq!(saved[1].name, "renamed");
    }

    #[tokio::test]
    async fn prefers_the_api_when_it_is_up() {
        let server_dir = tempfile::tempdir().unwrap();
        let server_store = CatalogStore::new(server_dir.path().join("config.json"));
        let addr = spawn_server(server_store.clone(), PathBuf::from("static")).await;

        let local_dir = tempfile::tempdir().unwrap();
        let local_store = CatalogStore::new(local_dir.path().join("config.json"));
        let url = format!("http://{}/projects", addr);
        let agent = RegistrationAgent::new(url, local_store.clone());

        let p1 = project("p1", vec![service("web", "npm start", &[3000])]);
        assert_eq!(agent.register(&p1).await.unwrap(), Registered::Api);
        assert_eq!(server_store.load().unwrap(), vec![p1]);
        assert!(!local_store.path().exists());
    }

    #[tokio::test]
    async fn file_fallback_applies_the_same_validation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("config.json"));
        store.save(&[project("a", vec![service("web", "true", &[])])]).unwrap();
        let url = format!("http://127.0.0.1:{}/projects", free_port().await);
        let agent = RegistrationAgent::new(url, store.clone());

        let clash = project("b", vec![service("web", "true", &[])]);
        assert!(agent.register(&clash).await.is_err());
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn read_project_file_requires_core_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        assert!(read_project_file(&path).is_err());

        std::fs::write(&path, r#"{"id": "p1", "name": "P1", "services": []}"#).unwrap();
        assert!(read_project_file(&path).is_err());

        std::fs::write(
            &path,
            r#"{"id": "p1", "name": "P1", "root_path": "/srv/p1", "services": []}"#,
        )
        .unwrap();
        let project = read_project_file(&path).unwrap();
        assert_eq!(project.id, "p1");
        assert!(project.frontend_url.is_none());
    }
}
