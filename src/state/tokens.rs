//! The token store: bearer tokens persisted in the project's `.tokens` file.
//!
//! The file is a JSON map of token name → record. Two indexes exist: by
//! name for administration and by value for authentication. Authentication
//! is whole-string, case-sensitive equality on the 64-char secret, with no
//! scheme prefix.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::auth::RoleMap;

/// Length of generated token secrets.
const TOKEN_LENGTH: usize = 64;

/// Errors from token store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TokenError {
    /// The token file could not be read or written.
    #[snafu(display("could not access token file {}: {message}", path.display()))]
    Io {
        /// The file involved.
        path: PathBuf,
        /// OS-level cause.
        message: String,
    },

    /// The token file is not valid JSON of the expected shape.
    #[snafu(display("could not parse token file: {message}"))]
    Parse {
        /// Parser-reported cause.
        message: String,
    },

    /// A token cannot be added while no roles are defined.
    #[snafu(display("no roles have been defined; create the roles file first"))]
    NoRoles,

    /// A token references a role that does not exist.
    #[snafu(display("invalid role: {role}. Available roles: {available}"))]
    InvalidRole {
        /// The unknown role.
        role: String,
        /// Comma-separated known role names.
        available: String,
    },

    /// The named token does not exist.
    #[snafu(display("token {name} does not exist"))]
    UnknownToken {
        /// The requested name.
        name: String,
    },
}

/// One issued bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// The 64-char secret.
    pub token: String,
    /// Role names this token resolves to.
    pub roles: Vec<String>,
    /// Disabled tokens fail authentication without being deleted.
    #[serde(default)]
    pub disabled: bool,
    /// Issue timestamp.
    pub issued_at: DateTime<Utc>,
}

/// Generate a fresh token for the given roles.
pub fn new_token(roles: Vec<String>) -> Token {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect();
    Token { token: secret, roles, disabled: false, issued_at: Utc::now() }
}

/// Tokens for one project, loaded from its `.tokens` file.
#[derive(Debug, Default)]
pub struct TokenStore {
    path: PathBuf,
    by_name: BTreeMap<String, Token>,
    by_value: HashMap<String, Token>,
}

impl TokenStore {
    /// Load the store, creating an empty file when none exists.
    pub fn load(path: &Path) -> Result<TokenStore, TokenError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            std::fs::write(path, b"{}").map_err(|e| TokenError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }

        let bytes = std::fs::read(path).map_err(|e| TokenError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let by_name: BTreeMap<String, Token> = serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Parse { message: e.to_string() })?;

        let by_value =
            by_name.values().map(|t| (t.token.clone(), t.clone())).collect::<HashMap<_, _>>();

        Ok(TokenStore { path: path.to_path_buf(), by_name, by_value })
    }

    /// Authenticate a raw token value.
    pub fn resolve(&self, value: &str) -> Option<&Token> {
        self.by_value.get(value)
    }

    /// Look up a token by its administrative name.
    pub fn get(&self, name: &str) -> Option<&Token> {
        self.by_name.get(name)
    }

    /// The administrative names, ordered.
    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    /// Add a token after validating its roles against the current role map.
    pub fn add(&mut self, name: &str, token: Token, roles: &RoleMap) -> Result<(), TokenError> {
        let available = roles.role_names();
        if available.is_empty() {
            return Err(TokenError::NoRoles);
        }
        for role in &token.roles {
            if !available.contains(&role.to_lowercase()) {
                return Err(TokenError::InvalidRole {
                    role: role.clone(),
                    available: available.join(","),
                });
            }
        }

        self.by_value.insert(token.token.clone(), token.clone());
        self.by_name.insert(name.to_string(), token);
        self.save()
    }

    /// Flip a token's disabled flag; returns the new state.
    pub fn toggle(&mut self, name: &str) -> Result<bool, TokenError> {
        let token = self
            .by_name
            .get_mut(name)
            .ok_or_else(|| TokenError::UnknownToken { name: name.to_string() })?;
        token.disabled = !token.disabled;
        let disabled = token.disabled;
        let updated = token.clone();
        self.by_value.insert(updated.token.clone(), updated);
        self.save()?;
        Ok(disabled)
    }

    /// Remove a token from both indexes.
    pub fn remove(&mut self, name: &str) -> Result<(), TokenError> {
        let token = self
            .by_name
            .remove(name)
            .ok_or_else(|| TokenError::UnknownToken { name: name.to_string() })?;
        self.by_value.remove(&token.token);
        self.save()
    }

    /// Rewrite the whole file atomically (temp file + rename), so readers
    /// never observe a partial update.
    fn save(&self) -> Result<(), TokenError> {
        let io_err = |message: String| TokenError::Io { path: self.path.clone(), message };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(e.to_string()))?;
        let bytes = serde_json::to_vec_pretty(&self.by_name)
            .map_err(|e| TokenError::Parse { message: e.to_string() })?;
        tmp.write_all(&bytes).map_err(|e| io_err(e.to_string()))?;
        tmp.flush().map_err(|e| io_err(e.to_string()))?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error.to_string()))?;
        Ok(())
    }
}
