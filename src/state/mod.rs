//! Application state: the server-owned project map and its registries.
//!
//! There is no package-level mutable state; a single [`AppState`] value owns
//! the `id -> Project` map and is injected into handlers through the axum
//! router. The default project is created lazily on first use.

pub mod connections;
pub mod project;
pub mod query;
pub mod tokens;

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

pub use connections::ConnectionRegistry;
pub use project::{Project, ProjectError, DEFAULT_PROJECT_ID};
pub use query::{
    generate_query_id, Query, QueryError, QueryOutcome, QueryRegistry, QuerySnapshot, QuerySpec,
    QueryStatus, DEFAULT_SQL_LIMIT,
};
pub use tokens::{new_token, Token, TokenError, TokenStore};

struct StateInner {
    config: ServerConfig,
    projects: DashMap<String, Arc<Project>>,
}

/// Shared application state, cheap to clone across request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl AppState {
    /// Build state around a configuration.
    pub fn new(config: ServerConfig) -> AppState {
        AppState { inner: Arc::new(StateInner { config, projects: DashMap::new() }) }
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Resolve a project by id.
    ///
    /// Known projects get their file-backed state refreshed through the
    /// reload throttle. The default project is created lazily; any other
    /// unknown id yields `None`.
    pub fn project(&self, id: &str) -> Result<Option<Arc<Project>>, ProjectError> {
        if let Some(project) = self.inner.projects.get(id) {
            let project = Arc::clone(project.value());
            // stale state beats failing the request; reload errors are logged
            if let Err(e) = project.load_tokens(false) {
                tracing::warn!(project = %id, error = %e, "token reload failed");
            }
            if let Err(e) = project.load_roles(false) {
                tracing::warn!(project = %id, error = %e, "role reload failed");
            }
            if let Err(e) = project.load_connections(false) {
                tracing::warn!(project = %id, error = %e, "connection reload failed");
            }
            return Ok(Some(project));
        }

        if id != DEFAULT_PROJECT_ID {
            return Ok(None);
        }

        let config = self.config();
        let project = Arc::new(Project::new(id, &config.home_dir, config.no_restriction)?);
        let entry = self
            .inner
            .projects
            .entry(id.to_string())
            .or_insert_with(|| Arc::clone(&project));
        Ok(Some(Arc::clone(entry.value())))
    }

    /// Register a pre-built project (embedding and tests).
    pub fn register_project(&self, project: Project) -> Arc<Project> {
        let project = Arc::new(project);
        self.inner.projects.insert(project.id.clone(), Arc::clone(&project));
        project
    }

    /// All live projects.
    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.inner.projects.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Spawn the query janitor: once per interval, evict queries untouched
    /// for longer than the configured TTL from every project.
    pub fn spawn_janitor(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(state.config().janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let ttl = state.config().query_ttl;
                for project in state.projects() {
                    let evicted = project.queries.evict_stale(ttl);
                    if evicted > 0 {
                        tracing::debug!(project = %project.id, evicted, "evicted stale queries");
                    }
                }
            }
        })
    }

    /// Close every live database handle in every project.
    pub async fn close_all(&self) {
        for project in self.projects() {
            project.close_connections().await;
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("projects", &self.inner.projects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_project_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            home_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let state = AppState::new(config);

        assert!(state.projects().is_empty());
        let project = state.project(DEFAULT_PROJECT_ID).expect("resolve").expect("present");
        assert_eq!(project.id, DEFAULT_PROJECT_ID);
        assert_eq!(state.projects().len(), 1);

        // the same instance comes back
        let again = state.project(DEFAULT_PROJECT_ID).expect("resolve").expect("present");
        assert!(Arc::ptr_eq(&project, &again));
    }

    #[test]
    fn unknown_project_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            home_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let state = AppState::new(config);
        assert!(state.project("ghost").expect("resolve").is_none());
    }
}
