//! Backend store boundary.
//!
//! The server core only needs two things from the user database: open a
//! connection, and ask that connection about credentials. [`Backend`] covers
//! the first, [`UserStore`] the second. [`MemoryBackend`] is the in-process
//! implementation shipped with the server and used by the tests.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where and as whom to connect.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub port: u16,
    /// Number of connections opened at startup.
    pub pool_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "root".to_string(),
            password: String::new(),
            database: "webdb".to_string(),
            port: 3306,
            pool_size: 8,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend {host}:{port} unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("backend rejected credentials for user {0}")]
    Rejected(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Opens and closes backend connections for the resource pool.
pub trait Backend: Send + Sync + 'static {
    type Conn: UserStore + Send + 'static;

    fn connect(&self, config: &BackendConfig) -> Result<Self::Conn, BackendError>;

    fn close(&self, conn: Self::Conn) {
        drop(conn);
    }
}

/// Credential queries the request dispatcher runs on a leased connection.
pub trait UserStore {
    /// Stored password for `user`, if the user exists.
    fn password_of(&mut self, user: &str) -> Result<Option<String>, BackendError>;

    /// Insert a new user. `Ok(false)` when the name is already taken.
    fn insert(&mut self, user: &str, password: &str) -> Result<bool, BackendError>;
}

type UserTable = Arc<RwLock<HashMap<String, String>>>;

/// Shared in-memory user table. Every connection handed out by
/// [`MemoryBackend::connect`] sees the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    users: UserTable,
    open: Arc<AtomicUsize>,
    credentials: Option<(String, String)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections authenticating as `user`/`password`.
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.credentials = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.users
            .write()
            .insert(user.to_string(), password.to_string());
        self
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Connections currently open against this backend.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct MemoryConn {
    users: UserTable,
    open: Arc<AtomicUsize>,
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Backend for MemoryBackend {
    type Conn = MemoryConn;

    fn connect(&self, config: &BackendConfig) -> Result<MemoryConn, BackendError> {
        if let Some((user, password)) = &self.credentials {
            if *user != config.user || *password != config.password {
                return Err(BackendError::Rejected(config.user.clone()));
            }
        }
        self.open.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryConn {
            users: self.users.clone(),
            open: self.open.clone(),
        })
    }
}

impl UserStore for MemoryConn {
    fn password_of(&mut self, user: &str) -> Result<Option<String>, BackendError> {
        Ok(self.users.read().get(user).cloned())
    }

    fn insert(&mut self, user: &str, password: &str) -> Result<bool, BackendError> {
        let mut users = self.users.write();
        if users.contains_key(user) {
            return Ok(false);
        }
        users.insert(user.to_string(), password.to_string());
        Ok(true)
    }
}
