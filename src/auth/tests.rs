//! Tests for grant resolution and permission flattening.

use super::*;
use crate::db::{DriverKind, TableRef};

fn grant(read: &[&str], write: &[&str], sql: AllowSql) -> Grant {
    Grant {
        allow_read: read.iter().map(|s| s.to_string()).collect(),
        allow_write: write.iter().map(|s| s.to_string()).collect(),
        allow_sql: sql,
    }
}

fn role(conn: &str, g: Grant) -> Role {
    let mut map = std::collections::BTreeMap::new();
    map.insert(conn.to_string(), g);
    Role(map)
}

fn role_map(entries: Vec<(&str, Role)>) -> RoleMap {
    RoleMap(entries.into_iter().map(|(n, r)| (n.to_string(), r)).collect())
}

fn table(s: &str) -> TableRef {
    TableRef::parse(s, DriverKind::Sqlite)
}

#[test]
fn wildcard_grant_reads_everything() {
    let rm = role_map(vec![(
        "role_rw",
        role("sqlite_test", grant(&["*"], &["*"], AllowSql::Any)),
    )]);

    assert!(rm.can_read("sqlite_test", &table("main.place"), DriverKind::Sqlite));
    assert!(rm.can_write("sqlite_test", &table("main.place2"), DriverKind::Sqlite));
    assert!(rm.can_sql("sqlite_test"));
    assert!(rm.has_access("sqlite_test"));
    assert!(!rm.has_access("other_conn"));
}

#[test]
fn exact_table_grant_is_scoped() {
    let rm = role_map(vec![(
        "role_r",
        role("sqlite_test", grant(&["main.place"], &[], AllowSql::Disable)),
    )]);

    assert!(rm.can_read("sqlite_test", &table("main.place"), DriverKind::Sqlite));
    assert!(!rm.can_read("sqlite_test", &table("main.place2"), DriverKind::Sqlite));
    assert!(!rm.can_write("sqlite_test", &table("main.place"), DriverKind::Sqlite));
    assert!(!rm.can_sql("sqlite_test"));
    // referencing the connection at all is enough for access
    assert!(rm.has_access("sqlite_test"));
}

#[test]
fn schema_wildcard_implies_all_tables_in_schema() {
    let rm = role_map(vec![(
        "role_r",
        role("c", grant(&["main.*"], &[], AllowSql::Disable)),
    )]);

    assert!(rm.can_read("c", &table("main.place"), DriverKind::Sqlite));
    assert!(rm.can_read("c", &table("main.anything"), DriverKind::Sqlite));
    assert!(!rm.can_read("c", &table("other.place"), DriverKind::Sqlite));
}

#[test]
fn star_connection_extends_role_to_every_connection() {
    let rm = role_map(vec![("admin", role("*", grant(&["*"], &[], AllowSql::Any)))]);

    assert!(rm.has_access("anything"));
    assert!(rm.can_read("anything", &table("s.t"), DriverKind::Postgres));
    assert!(rm.can_sql("whatever"));
}

#[test]
fn table_matching_is_case_sensitive() {
    let rm = role_map(vec![(
        "role_r",
        role("c", grant(&["main.Place"], &[], AllowSql::Disable)),
    )]);

    assert!(rm.can_read("c", &table("main.Place"), DriverKind::Sqlite));
    assert!(!rm.can_read("c", &table("main.place"), DriverKind::Sqlite));
}

#[test]
fn permissions_take_least_upper_bound() {
    let mut grants = std::collections::BTreeMap::new();
    grants.insert(
        "c".to_string(),
        grant(&["main.place", "main.both"], &["main.both", "main.w"], AllowSql::Disable),
    );
    let rm = role_map(vec![("r", Role(grants))]);

    let perms = rm.get_permissions("c", DriverKind::Sqlite);
    assert_eq!(perms.get("main.place"), Some(&Permission::Read));
    assert_eq!(perms.get("main.w"), Some(&Permission::Write));
    assert_eq!(perms.get("main.both"), Some(&Permission::ReadWrite));
    // absent key means no permission; nothing synthesises a "none" entry
    assert_eq!(perms.get("main.other"), None);
}

#[test]
fn permissions_combine_across_roles() {
    let rm = role_map(vec![
        ("reader", role("c", grant(&["main.t"], &[], AllowSql::Disable))),
        ("writer", role("c", grant(&[], &["main.t"], AllowSql::Disable))),
    ]);

    let perms = rm.get_permissions("c", DriverKind::Sqlite);
    assert_eq!(perms.get("main.t"), Some(&Permission::ReadWrite));
}

#[test]
fn subset_is_case_insensitive() {
    let rm = role_map(vec![("role_rw", role("c", grant(&["*"], &[], AllowSql::Disable)))]);

    let picked = rm.subset(&["ROLE_RW".to_string(), "missing".to_string()]);
    assert_eq!(picked.role_names(), vec!["role_rw".to_string()]);
}

#[test]
fn yaml_round_trip_canonicalises_keys() {
    let yaml = r#"
Role_RW:
  SQLITE_TEST:
    allow_read: ["*"]
    allow_write: ["*"]
    allow_sql: any
"#;
    let rm = RoleMap::from_yaml(yaml).expect("parse roles");
    assert_eq!(rm.role_names(), vec!["role_rw".to_string()]);
    assert!(rm.has_access("sqlite_test"));
    assert!(rm.can_sql("sqlite_test"));
}

#[test]
fn allow_all_map_grants_everything() {
    let rm = allow_all_role_map();
    assert!(rm.has_access("any"));
    assert!(rm.can_sql("any"));
    assert!(rm.can_read("any", &table("s.t"), DriverKind::Mysql));
    assert!(rm.can_write("any", &table("s.t"), DriverKind::Mysql));
}

#[test]
fn missing_allow_sql_defaults_to_disable() {
    let yaml = r#"
reader:
  c:
    allow_read: ["main.place"]
"#;
    let rm = RoleMap::from_yaml(yaml).expect("parse roles");
    assert!(!rm.can_sql("c"));
}

#[test]
fn higher_scope_grant_implies_lower_scope_predicate() {
    // Permissions("*") >= Permissions("schema.*") >= Permissions("schema.table")
    let for_pattern = |pattern: &str| {
        let rm = role_map(vec![(
            "r",
            role("c", grant(&[pattern], &[], AllowSql::Disable)),
        )]);
        rm.can_read("c", &table("main.place"), DriverKind::Sqlite)
    };

    assert!(for_pattern("*"));
    assert!(for_pattern("main.*"));
    assert!(for_pattern("main.place"));
}
