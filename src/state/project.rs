//! Projects: named configuration scopes.
//!
//! A project owns one credential store, one role map, one token store, one
//! connection registry, and one query registry. File-backed state reloads
//! on demand with a small throttle so per-request authentication lookups do
//! not hammer the disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use snafu::Snafu;

use crate::auth::RoleMap;
use crate::config::{ConnectionDescriptor, CredentialStore};
use crate::db::{DatabaseClient, DbError};

use super::connections::ConnectionRegistry;
use super::query::QueryRegistry;
use super::tokens::{Token, TokenError, TokenStore};

/// The implicit project id.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Reload throttle for connections.
const CONNECTIONS_RELOAD_EVERY: Duration = Duration::from_secs(2);
/// Reload throttle for roles and tokens.
const FILES_RELOAD_EVERY: Duration = Duration::from_secs(5);

/// Errors from project state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProjectError {
    /// The credentials file failed to load.
    #[snafu(display("could not load connections: {message}"))]
    Credentials {
        /// Cause.
        message: String,
    },

    /// The roles file failed to load.
    #[snafu(display("could not load roles: {message}"))]
    Roles {
        /// Cause.
        message: String,
    },

    /// The token file failed to load or a token operation failed.
    #[snafu(display("{source}"))]
    Tokens {
        /// The underlying token store error.
        source: TokenError,
    },

    /// A named connection does not exist in this project.
    #[snafu(display("could not find connection {name}"))]
    UnknownConnection {
        /// The requested name.
        name: String,
    },

    /// The driver layer failed to materialise or dial a handle.
    #[snafu(display("could not connect to {name}: {source}"))]
    Connect {
        /// The connection involved.
        name: String,
        /// The driver error.
        source: DbError,
    },
}

struct ProjectInner {
    credentials: CredentialStore,
    roles: RoleMap,
    tokens: TokenStore,
    last_loaded_connections: Option<Instant>,
    last_loaded_roles: Option<Instant>,
    last_loaded_tokens: Option<Instant>,
}

/// A named configuration scope with its live registries.
pub struct Project {
    /// Project id; `"default"` for the implicit project.
    pub id: String,
    /// Directory holding `env.yaml`, `roles.yaml`, and `.tokens`.
    pub directory: PathBuf,
    /// When set, any caller gets full access without a token.
    pub no_restriction: bool,

    env_file: PathBuf,
    roles_file: PathBuf,
    token_file: PathBuf,

    inner: Mutex<ProjectInner>,
    /// Live database handles.
    pub connections: ConnectionRegistry,
    /// Submitted queries.
    pub queries: QueryRegistry,
}

impl Project {
    /// Create a project over `directory`, loading all three files.
    pub fn new(
        id: &str,
        directory: &Path,
        no_restriction: bool,
    ) -> Result<Project, ProjectError> {
        std::fs::create_dir_all(directory)
            .map_err(|e| ProjectError::Credentials { message: e.to_string() })?;

        let project = Project {
            id: id.to_string(),
            directory: directory.to_path_buf(),
            no_restriction,
            env_file: directory.join("env.yaml"),
            roles_file: directory.join("roles.yaml"),
            token_file: directory.join(".tokens"),
            inner: Mutex::new(ProjectInner {
                credentials: CredentialStore::default(),
                roles: RoleMap::default(),
                tokens: TokenStore::default(),
                last_loaded_connections: None,
                last_loaded_roles: None,
                last_loaded_tokens: None,
            }),
            connections: ConnectionRegistry::new(),
            queries: QueryRegistry::new(),
        };

        project.load_connections(true)?;
        project.load_roles(true)?;
        project.load_tokens(true)?;
        tracing::info!(project = %id, directory = %directory.display(), "project loaded");
        Ok(project)
    }

    /// Reload `env.yaml` if forced or the throttle elapsed.
    pub fn load_connections(&self, force: bool) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock();
        if !should_reload(inner.last_loaded_connections, CONNECTIONS_RELOAD_EVERY, force) {
            return Ok(());
        }
        inner.credentials = CredentialStore::load(&self.env_file)
            .map_err(|e| ProjectError::Credentials { message: e.to_string() })?;
        inner.last_loaded_connections = Some(Instant::now());
        Ok(())
    }

    /// Reload `roles.yaml` if forced or the throttle elapsed.
    pub fn load_roles(&self, force: bool) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock();
        if !should_reload(inner.last_loaded_roles, FILES_RELOAD_EVERY, force) {
            return Ok(());
        }
        if self.roles_file.exists() {
            let text = std::fs::read_to_string(&self.roles_file)
                .map_err(|e| ProjectError::Roles { message: e.to_string() })?;
            inner.roles = RoleMap::from_yaml(&text)
                .map_err(|e| ProjectError::Roles { message: e.to_string() })?;
        }
        inner.last_loaded_roles = Some(Instant::now());
        Ok(())
    }

    /// Reload `.tokens` if forced or the throttle elapsed.
    pub fn load_tokens(&self, force: bool) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock();
        if !should_reload(inner.last_loaded_tokens, FILES_RELOAD_EVERY, force) {
            return Ok(());
        }
        inner.tokens =
            TokenStore::load(&self.token_file).map_err(|source| ProjectError::Tokens { source })?;
        inner.last_loaded_tokens = Some(Instant::now());
        Ok(())
    }

    /// Copy of the full role map.
    pub fn roles(&self) -> RoleMap {
        self.inner.lock().roles.clone()
    }

    /// The subset of roles named by a token (case-insensitive).
    pub fn get_role_map(&self, names: &[String]) -> RoleMap {
        self.inner.lock().roles.subset(names)
    }

    /// Authenticate a raw token value.
    pub fn resolve_token(&self, value: &str) -> Option<Token> {
        self.inner.lock().tokens.resolve(value).cloned()
    }

    /// Issue a token after validating its roles.
    pub fn token_add(&self, name: &str, token: Token) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock();
        let roles = inner.roles.clone();
        inner.tokens.add(name, token, &roles).map_err(|source| ProjectError::Tokens { source })
    }

    /// Flip a token's disabled flag.
    pub fn token_toggle(&self, name: &str) -> Result<bool, ProjectError> {
        self.inner.lock().tokens.toggle(name).map_err(|source| ProjectError::Tokens { source })
    }

    /// Revoke a token.
    pub fn token_remove(&self, name: &str) -> Result<(), ProjectError> {
        self.inner.lock().tokens.remove(name).map_err(|source| ProjectError::Tokens { source })
    }

    /// The unmaterialised descriptor for `name`, with the database override
    /// applied when `database` is non-empty.
    pub fn get_conn_object(
        &self,
        name: &str,
        database: &str,
    ) -> Result<ConnectionDescriptor, ProjectError> {
        let inner = self.inner.lock();
        let descriptor = inner
            .credentials
            .get(name)
            .ok_or_else(|| ProjectError::UnknownConnection { name: name.to_lowercase() })?;
        if database.is_empty() {
            Ok(descriptor.clone())
        } else {
            Ok(descriptor.with_database(database))
        }
    }

    /// A live handle for `name`, connecting on first use.
    pub async fn get_conn_instance(
        &self,
        name: &str,
        database: &str,
    ) -> Result<Arc<dyn DatabaseClient>, ProjectError> {
        self.load_connections(false)?;
        let descriptor = {
            let inner = self.inner.lock();
            inner
                .credentials
                .get(name)
                .cloned()
                .ok_or_else(|| ProjectError::UnknownConnection { name: name.to_lowercase() })?
        };
        self.connections
            .get_or_connect(&descriptor, database)
            .await
            .map_err(|source| ProjectError::Connect { name: name.to_lowercase(), source })
    }

    /// Copies of all descriptors, for the `.connections` listing.
    pub fn list_connections(&self) -> Vec<ConnectionDescriptor> {
        self.inner.lock().credentials.list().into_iter().cloned().collect()
    }

    /// Test a connection: materialise a fresh handle, ping it, close it.
    ///
    /// The pooled handle is left untouched.
    pub async fn test_connection(&self, name: &str) -> Result<(), ProjectError> {
        let descriptor = self.get_conn_object(name, "")?;
        let probe = ConnectionRegistry::new();
        let handle = probe
            .get_or_connect(&descriptor, "")
            .await
            .map_err(|source| ProjectError::Connect { name: name.to_lowercase(), source })?;
        let result = handle
            .ping()
            .await
            .map_err(|source| ProjectError::Connect { name: name.to_lowercase(), source });
        probe.close_all().await;
        result
    }

    /// Close all live handles.
    pub async fn close_connections(&self) {
        self.connections.close_all().await;
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("no_restriction", &self.no_restriction)
            .finish()
    }
}

fn should_reload(last: Option<Instant>, every: Duration, force: bool) -> bool {
    force || last.map(|at| at.elapsed() > every).unwrap_or(true)
}
