//! Role-based authorization for the gateway.
//!
//! A bearer token maps to roles, roles carry per-connection [`Grant`]s over
//! table patterns, and grants flatten into [`Permissions`] that route
//! handlers can check in O(1). Role names and connection names are
//! canonicalised to lowercase at load time; table identifiers keep the case
//! the dialect parser produced and match case-sensitively.

mod grants;
mod roles;

pub use grants::{AllowSql, Grant, Permission, Permissions};
pub use roles::{allow_all_role_map, Role, RoleMap};

#[cfg(test)]
mod tests;
