//! Grant and permission value types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::{DriverKind, TableRef};

/// Whether a grant allows ad-hoc SQL submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowSql {
    /// Custom SQL is rejected.
    #[default]
    Disable,
    /// Any SQL text may be submitted.
    Any,
}

/// What a role allows on one connection.
///
/// `allow_read` and `allow_write` hold table patterns: `"schema.table"`,
/// `"schema.*"`, or `"*"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grant {
    /// Table patterns readable under this grant.
    #[serde(default)]
    pub allow_read: Vec<String>,
    /// Table patterns writable under this grant.
    #[serde(default)]
    pub allow_write: Vec<String>,
    /// Ad-hoc SQL policy.
    #[serde(default)]
    pub allow_sql: AllowSql,
}

impl Grant {
    /// The readable patterns, parsed per the connection's dialect.
    pub fn readable(&self, kind: DriverKind) -> Vec<TableRef> {
        self.allow_read.iter().map(|t| TableRef::parse(t, kind)).collect()
    }

    /// The writable patterns, parsed per the connection's dialect.
    pub fn writable(&self, kind: DriverKind) -> Vec<TableRef> {
        self.allow_write.iter().map(|t| TableRef::parse(t, kind)).collect()
    }
}

/// Whether a grant pattern covers a concrete table.
///
/// `*` covers everything; `schema.*` covers the schema; otherwise both parts
/// must match exactly (case-sensitive).
pub(crate) fn pattern_covers(pattern: &TableRef, table: &TableRef) -> bool {
    (pattern.schema.is_empty() && pattern.name == "*")
        || (pattern.schema == table.schema && pattern.name == "*")
        || (pattern.schema == table.schema && pattern.name == table.name)
}

/// The effective access level on one object pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Both; the least upper bound of read and write.
    ReadWrite,
}

impl Permission {
    /// Whether this permission allows reading.
    pub fn can_read(&self) -> bool {
        matches!(self, Permission::Read | Permission::ReadWrite)
    }

    /// Whether this permission allows writing.
    pub fn can_write(&self) -> bool {
        matches!(self, Permission::Write | Permission::ReadWrite)
    }
}

/// Flattened object-pattern → permission map for one connection.
///
/// Keys are `"*"`, `"schema.*"`, or `"schema.table"`. Absent keys mean no
/// permission; no explicit `none` entries exist.
pub type Permissions = HashMap<String, Permission>;
