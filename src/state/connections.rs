//! The connection registry: live database handles per project.
//!
//! One logical handle exists per (connection name, database override) pair.
//! The first request materialises the descriptor and connects; later
//! requests share the same handle. Handles live for the whole process
//! unless the `.close` route or shutdown evicts them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{ConnectionDescriptor, ENV_USE_POOL};
use crate::db::sqlite::SqliteClient;
use crate::db::{DatabaseClient, DbError, DriverKind};

type ConnKey = (String, String);

/// Pool of live handles, keyed by (name, database override).
#[derive(Default)]
pub struct ConnectionRegistry {
    handles: Mutex<HashMap<ConnKey, Arc<dyn DatabaseClient>>>,
}

impl ConnectionRegistry {
    /// New, empty registry.
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Fetch the shared handle for `descriptor`, connecting on first use.
    ///
    /// `database` is the optional override; an empty string means the
    /// descriptor's default.
    pub async fn get_or_connect(
        &self,
        descriptor: &ConnectionDescriptor,
        database: &str,
    ) -> Result<Arc<dyn DatabaseClient>, DbError> {
        let key = (descriptor.name.clone(), database.to_lowercase());

        // the map lock is held across connect, serialising first-time dials
        // for the same pair; established handles return immediately
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let effective = if database.is_empty() {
            descriptor.clone()
        } else {
            descriptor.with_database(database)
        };

        // drivers that pool internally honour this
        std::env::set_var(ENV_USE_POOL, "TRUE");

        let handle = materialize(&effective).await?;
        handle.ping().await?;
        tracing::info!(
            connection = %descriptor.name,
            database = %database,
            kind = %descriptor.kind,
            "connected database handle"
        );

        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Close and evict every handle for `name`. The next request
    /// reconnects. Returns how many handles were closed.
    pub async fn close_connection(&self, name: &str) -> usize {
        let name = name.to_lowercase();
        let removed: Vec<Arc<dyn DatabaseClient>> = {
            let mut handles = self.handles.lock().await;
            let keys: Vec<ConnKey> =
                handles.keys().filter(|(n, _)| *n == name).cloned().collect();
            keys.iter().filter_map(|k| handles.remove(k)).collect()
        };
        let count = removed.len();
        for handle in removed {
            handle.close().await;
        }
        if count > 0 {
            tracing::info!(connection = %name, count, "closed database handles");
        }
        count
    }

    /// Close every handle. Used at shutdown.
    pub async fn close_all(&self) {
        let removed: Vec<Arc<dyn DatabaseClient>> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in removed {
            handle.close().await;
        }
    }

    /// Number of live handles.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Whether any handle is live.
    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish()
    }
}

/// Turn a descriptor into a live handle.
///
/// Only the SQLite driver ships in this crate; other dialects are wired in
/// by embedding code through their own [`DatabaseClient`] implementations.
async fn materialize(
    descriptor: &ConnectionDescriptor,
) -> Result<Arc<dyn DatabaseClient>, DbError> {
    match descriptor.kind {
        DriverKind::Sqlite => {
            let path = sqlite_path(descriptor);
            let client = SqliteClient::open(path).await?;
            Ok(Arc::new(client))
        }
        other => Err(DbError::Unsupported { what: format!("driver '{other}' is not bundled") }),
    }
}

fn sqlite_path(descriptor: &ConnectionDescriptor) -> String {
    if let Some(url) = descriptor.url() {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        if path.is_empty() { ":memory:".to_string() } else { path.to_string() }
    } else if let Some(database) = descriptor.database() {
        database.to_string()
    } else {
        ":memory:".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sqlite_descriptor(name: &str, url: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            name: name.to_string(),
            kind: DriverKind::Sqlite,
            data: [("url".to_string(), url.to_string())].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn first_use_connects_and_later_calls_share() {
        let registry = ConnectionRegistry::new();
        let descriptor = sqlite_descriptor("t", "sqlite://:memory:");

        let a = registry.get_or_connect(&descriptor, "").await.expect("connect");
        let b = registry.get_or_connect(&descriptor, "").await.expect("reuse");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn database_override_is_a_distinct_handle() {
        let dir = tempfile::tempdir().unwrap();
        let alt = dir.path().join("alt.db").display().to_string();
        let registry = ConnectionRegistry::new();
        let descriptor = sqlite_descriptor("t", "sqlite://:memory:");

        let base = registry.get_or_connect(&descriptor, "").await.expect("base");
        let over = registry.get_or_connect(&descriptor, &alt).await.expect("override");
        assert!(!Arc::ptr_eq(&base, &over));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn close_connection_evicts_and_reconnects() {
        let registry = ConnectionRegistry::new();
        let descriptor = sqlite_descriptor("t", "sqlite://:memory:");

        let first = registry.get_or_connect(&descriptor, "").await.expect("connect");
        assert_eq!(registry.close_connection("T").await, 1);
        assert!(registry.is_empty().await);

        let second = registry.get_or_connect(&descriptor, "").await.expect("reconnect");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unbundled_drivers_are_rejected() {
        let registry = ConnectionRegistry::new();
        let descriptor = ConnectionDescriptor {
            name: "pg".to_string(),
            kind: DriverKind::Postgres,
            data: BTreeMap::new(),
        };
        let result = registry.get_or_connect(&descriptor, "").await;
        assert!(matches!(result, Err(DbError::Unsupported { .. })));
    }
}
