//! The credential store: connection descriptors from `env.yaml`.
//!
//! The file is a YAML map of connection name → key/value credential data
//! (either a single `url`, or driver-specific fields plus a `type`). Names
//! canonicalise to lowercase; values may reference `${ENV_VAR}` placeholders
//! which expand at load time. The store never owns live handles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use snafu::Snafu;

use crate::db::DriverKind;

/// Errors from loading or mutating the credential store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CredentialError {
    /// The env file could not be read or written.
    #[snafu(display("could not access credentials file {}: {message}", path.display()))]
    Io {
        /// The file involved.
        path: PathBuf,
        /// OS-level cause.
        message: String,
    },

    /// The env file is not valid YAML of the expected shape.
    #[snafu(display("could not parse credentials file: {message}"))]
    Parse {
        /// Parser-reported cause.
        message: String,
    },

    /// A named connection does not exist.
    #[snafu(display("could not find connection {name}"))]
    UnknownConnection {
        /// The requested name.
        name: String,
    },
}

/// A parsed connection entry.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    /// Canonical (lowercase) connection name.
    pub name: String,
    /// Driver dialect.
    pub kind: DriverKind,
    /// Credential data: `url`, `database`, host/user fields, and so on.
    pub data: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    /// The connection URL, when one is configured.
    pub fn url(&self) -> Option<&str> {
        self.data.get("url").map(String::as_str)
    }

    /// The default database, when one is configured.
    pub fn database(&self) -> Option<&str> {
        self.data.get("database").map(String::as_str)
    }

    /// Clone this descriptor with the database overridden.
    ///
    /// The cached `url` and `schema` entries are dropped so the driver layer
    /// re-derives them from the remaining fields.
    pub fn with_database(&self, database: &str) -> ConnectionDescriptor {
        let mut data = self.data.clone();
        data.remove("url");
        data.remove("schema");
        data.insert("database".to_string(), database.to_lowercase());
        ConnectionDescriptor { name: self.name.clone(), kind: self.kind, data }
    }
}

/// Connection descriptors keyed by canonical name.
#[derive(Debug, Default)]
pub struct CredentialStore {
    path: PathBuf,
    connections: BTreeMap<String, ConnectionDescriptor>,
}

impl CredentialStore {
    /// Load the store from `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<CredentialStore, CredentialError> {
        let mut store =
            CredentialStore { path: path.to_path_buf(), connections: BTreeMap::new() };
        if !path.exists() {
            return Ok(store);
        }

        let text = std::fs::read_to_string(path).map_err(|e| CredentialError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let raw: BTreeMap<String, BTreeMap<String, serde_yaml::Value>> =
            serde_yaml::from_str(&text)
                .map_err(|e| CredentialError::Parse { message: e.to_string() })?;

        for (name, fields) in raw {
            let name = canonical_name(&name);
            let mut data = BTreeMap::new();
            for (key, value) in fields {
                let value = match value {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
                };
                data.insert(key.to_lowercase(), expand_env(&value));
            }

            let Some(kind) = detect_kind(&data) else {
                tracing::debug!(connection = %name, "skipping non-database connection entry");
                continue;
            };
            store.connections.insert(name.clone(), ConnectionDescriptor { name, kind, data });
        }
        Ok(store)
    }

    /// Persist the current entries back to the env file.
    pub fn save(&self) -> Result<(), CredentialError> {
        let mut raw: BTreeMap<&str, &BTreeMap<String, String>> = BTreeMap::new();
        for descriptor in self.connections.values() {
            raw.insert(&descriptor.name, &descriptor.data);
        }
        let text = serde_yaml::to_string(&raw)
            .map_err(|e| CredentialError::Parse { message: e.to_string() })?;
        std::fs::write(&self.path, text).map_err(|e| CredentialError::Io {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Look up a descriptor by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&ConnectionDescriptor> {
        self.connections.get(&canonical_name(name))
    }

    /// All descriptors, ordered by name.
    pub fn list(&self) -> Vec<&ConnectionDescriptor> {
        self.connections.values().collect()
    }

    /// Insert or replace an entry.
    pub fn set(
        &mut self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), CredentialError> {
        let name = canonical_name(name);
        let kind = detect_kind(&data).ok_or_else(|| CredentialError::Parse {
            message: format!("cannot determine driver type for connection {name}"),
        })?;
        self.connections.insert(name.clone(), ConnectionDescriptor { name, kind, data });
        self.save()
    }

    /// Remove an entry.
    pub fn unset(&mut self, name: &str) -> Result<(), CredentialError> {
        let name = canonical_name(name);
        if self.connections.remove(&name).is_none() {
            return Err(CredentialError::UnknownConnection { name });
        }
        self.save()
    }
}

/// Lowercase, with path separators flattened the way connection env vars
/// are spelled.
pub fn canonical_name(name: &str) -> String {
    name.replace('/', "_").to_lowercase()
}

fn detect_kind(data: &BTreeMap<String, String>) -> Option<DriverKind> {
    if let Some(kind) = data.get("type").and_then(|t| DriverKind::parse(t)) {
        return Some(kind);
    }
    let url = data.get("url")?;
    let scheme = url.split("://").next()?;
    DriverKind::parse(scheme)
}

/// Expand `${ENV_VAR}` placeholders. Unset variables expand to empty.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_env(dir: &tempfile::TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("env.yaml");
        std::fs::write(&path, text).expect("write env file");
        path
    }

    #[test]
    fn loads_and_canonicalises_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_env(
            &dir,
            "SQLITE_TEST:\n  url: sqlite://./test.db\nPG_Main:\n  type: postgres\n  database: app\n",
        );
        let store = CredentialStore::load(&path).expect("load");

        let sqlite = store.get("sqlite_test").expect("sqlite entry");
        assert_eq!(sqlite.kind, DriverKind::Sqlite);
        assert_eq!(sqlite.url(), Some("sqlite://./test.db"));

        // lookups are case-insensitive
        assert!(store.get("PG_MAIN").is_some());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&dir.path().join("env.yaml")).expect("load");
        assert!(store.list().is_empty());
    }

    #[test]
    fn skips_entries_without_a_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_env(&dir, "aws_bucket:\n  url: s3://bucket/key\n");
        let store = CredentialStore::load(&path).expect("load");
        assert!(store.list().is_empty());
    }

    #[test]
    fn expands_env_placeholders() {
        std::env::set_var("SQLGATE_TEST_DB_PATH", "/tmp/x.db");
        let dir = tempfile::tempdir().unwrap();
        let path = write_env(&dir, "db:\n  url: sqlite://${SQLGATE_TEST_DB_PATH}\n");
        let store = CredentialStore::load(&path).expect("load");
        assert_eq!(store.get("db").unwrap().url(), Some("sqlite:///tmp/x.db"));
    }

    #[test]
    fn database_override_drops_cached_url() {
        let descriptor = ConnectionDescriptor {
            name: "c".into(),
            kind: DriverKind::Postgres,
            data: [
                ("url".to_string(), "postgres://u@h/app".to_string()),
                ("database".to_string(), "app".to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let overridden = descriptor.with_database("Analytics");
        assert_eq!(overridden.database(), Some("analytics"));
        assert!(overridden.url().is_none());
    }

    #[test]
    fn set_and_unset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.yaml");
        let mut store = CredentialStore::load(&path).expect("load");

        let data: BTreeMap<String, String> =
            [("url".to_string(), "sqlite://./a.db".to_string())].into_iter().collect();
        store.set("NewConn", data).expect("set");

        let reloaded = CredentialStore::load(&path).expect("reload");
        assert!(reloaded.get("newconn").is_some());

        store.unset("newconn").expect("unset");
        assert!(store.unset("newconn").is_err());
    }
}
