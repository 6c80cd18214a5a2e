//! TLS upgrade settings.
//!
//! A connection starts in plaintext. When a node carries `TlsSettings`, every
//! new connection sends `START_TLS`, waits for the matching empty reply and
//! then runs the handshake with the connector below. Credentials, if set,
//! are sent in an `AUTH_REQ` over the encrypted stream.

use std::fmt;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::{ClientError, ClientResult};

/// User name and password sent after the upgrade.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a connection needs to encrypt itself.
#[derive(Clone)]
pub struct TlsSettings {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
    pub credentials: Option<Credentials>,
}

impl TlsSettings {
    /// Builds settings from a rustls client config; `server_name` is the
    /// name verified against the server certificate.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> ClientResult<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name {server_name}: {e}")))?;
        Ok(TlsSettings {
            connector: TlsConnector::from(config),
            server_name,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .field("credentials", &self.credentials)
            .finish()
    }
}
