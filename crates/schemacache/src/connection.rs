//! Connection descriptors and database identity keys.
//!
//! The `db_key` identifies a source database independently of credentials, so
//! the same schema is shared by every connection to it. It doubles as the
//! in-memory cache key and the discriminator column in the store.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::{CacheError, Result};

/// Attributes of a database connection.
///
/// Only driver, username, host, port and database take part in the identity key.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub driver: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: String,
}

impl ConnectionDescriptor {
    pub fn new(driver: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            username: None,
            password: None,
            host: None,
            port: None,
            database: database.into(),
        }
    }

    /// Descriptor for a SQLite database file
    pub fn sqlite(path: &Path) -> Self {
        Self::new("sqlite", path.to_string_lossy())
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Check the attributes needed to identify a database are present.
    pub fn validate(&self) -> Result<()> {
        if self.driver.trim().is_empty() {
            return Err(CacheError::InvalidDescriptor(
                "driver name is empty".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(CacheError::InvalidDescriptor(
                "database name is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical, credential-free form: `driver://user@host:port/database`
    pub fn identity(&self) -> String {
        let mut url = format!("{}://", self.driver);
        if let Some(user) = &self.username {
            url.push_str(user);
            url.push('@');
        }
        if let Some(host) = &self.host {
            url.push_str(host);
        }
        if let Some(port) = self.port {
            url.push(':');
            url.push_str(&port.to_string());
        }
        url.push('/');
        url.push_str(&self.database);
        url
    }

    /// Deterministic, filesystem-safe key for this database.
    pub fn db_key(&self) -> Result<String> {
        self.validate()?;
        Ok(URL_SAFE_NO_PAD.encode(self.identity()))
    }
}

// Keep passwords out of logs
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}
