//! Roles, role maps, and permission resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::{DriverKind, TableRef};

use super::grants::{pattern_covers, AllowSql, Grant, Permission, Permissions};

/// A role: connection name → grant. The connection name `*` applies the
/// grant to every connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub BTreeMap<String, Grant>);

impl Role {
    /// The grant applicable to `connection`: the exact entry if present,
    /// else the `*` entry.
    pub fn grant_for(&self, connection: &str) -> Option<&Grant> {
        self.0.get(connection).or_else(|| self.0.get("*"))
    }

    /// Whether this role allows reading `table` on `connection`.
    pub fn can_read(&self, connection: &str, table: &TableRef, kind: DriverKind) -> bool {
        self.grant_for(connection)
            .map(|g| g.readable(kind).iter().any(|p| pattern_covers(p, table)))
            .unwrap_or(false)
    }

    /// Whether this role allows writing `table` on `connection`.
    pub fn can_write(&self, connection: &str, table: &TableRef, kind: DriverKind) -> bool {
        self.grant_for(connection)
            .map(|g| g.writable(kind).iter().any(|p| pattern_covers(p, table)))
            .unwrap_or(false)
    }

    /// Whether this role allows ad-hoc SQL on `connection`.
    pub fn can_sql(&self, connection: &str) -> bool {
        self.grant_for(connection)
            .map(|g| g.allow_sql == AllowSql::Any)
            .unwrap_or(false)
    }
}

/// A set of named roles, as resolved for one caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleMap(pub BTreeMap<String, Role>);

impl RoleMap {
    /// Parse a role map from YAML and canonicalise every role and
    /// connection key to lowercase.
    pub fn from_yaml(text: &str) -> Result<RoleMap, serde_yaml::Error> {
        let raw: RoleMap = serde_yaml::from_str(text)?;
        Ok(raw.canonicalized())
    }

    /// Lowercase all role names and connection names.
    pub fn canonicalized(&self) -> RoleMap {
        let mut out = BTreeMap::new();
        for (name, role) in &self.0 {
            let mut grants = BTreeMap::new();
            for (conn, grant) in &role.0 {
                grants.insert(conn.to_lowercase(), grant.clone());
            }
            out.insert(name.to_lowercase(), Role(grants));
        }
        RoleMap(out)
    }

    /// The subset of this map named by `roles` (case-insensitive).
    pub fn subset(&self, roles: &[String]) -> RoleMap {
        let mut out = BTreeMap::new();
        for name in roles {
            let name = name.to_lowercase();
            if let Some(role) = self.0.get(&name) {
                out.insert(name, role.clone());
            }
        }
        RoleMap(out)
    }

    /// The role names present in this map.
    pub fn role_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Whether the map is empty (no roles resolved for the caller).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any role references `connection` (directly or via `*`).
    pub fn has_access(&self, connection: &str) -> bool {
        self.0
            .values()
            .any(|role| role.0.contains_key(connection) || role.0.contains_key("*"))
    }

    /// Whether any applicable grant allows ad-hoc SQL on `connection`.
    pub fn can_sql(&self, connection: &str) -> bool {
        self.0.values().any(|role| role.can_sql(connection))
    }

    /// Whether any role allows reading `table` on `connection`.
    pub fn can_read(&self, connection: &str, table: &TableRef, kind: DriverKind) -> bool {
        self.0.values().any(|role| role.can_read(connection, table, kind))
    }

    /// Whether any role allows writing `table` on `connection`.
    pub fn can_write(&self, connection: &str, table: &TableRef, kind: DriverKind) -> bool {
        self.0.values().any(|role| role.can_write(connection, table, kind))
    }

    /// Flatten all applicable grants into the per-object permission map for
    /// `connection`. Read and write on the same pattern combine into
    /// [`Permission::ReadWrite`].
    pub fn get_permissions(&self, connection: &str, kind: DriverKind) -> Permissions {
        let mut perms = Permissions::new();
        for role in self.0.values() {
            let Some(grant) = role.grant_for(connection) else { continue };

            for table in grant.readable(kind) {
                perms
                    .entry(table.full_name())
                    .and_modify(|p| {
                        if *p == Permission::Write {
                            *p = Permission::ReadWrite;
                        }
                    })
                    .or_insert(Permission::Read);
            }
            for table in grant.writable(kind) {
                perms
                    .entry(table.full_name())
                    .and_modify(|p| {
                        if *p == Permission::Read {
                            *p = Permission::ReadWrite;
                        }
                    })
                    .or_insert(Permission::Write);
            }
        }
        perms
    }
}

/// The role map assigned to callers of unrestricted projects: read, write,
/// and SQL on everything.
pub fn allow_all_role_map() -> RoleMap {
    let grant = Grant {
        allow_read: vec!["*".to_string()],
        allow_write: vec!["*".to_string()],
        allow_sql: AllowSql::Any,
    };
    let mut role = BTreeMap::new();
    role.insert("*".to_string(), grant);
    let mut roles = BTreeMap::new();
    roles.insert("*".to_string(), Role(role));
    RoleMap(roles)
}
