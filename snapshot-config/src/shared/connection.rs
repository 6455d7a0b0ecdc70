use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions as SqlxConnectOptions, PgSslMode as SqlxSslMode};
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Application name reported by every connection opened by the snapshot subsystem.
///
/// Makes the coordinator, exporter and chunk reader sessions easy to spot in
/// `pg_stat_activity`.
pub const SNAPSHOT_APPLICATION_NAME: &str = "pg_snapshot";

/// Connection parameters of the source Postgres database.
///
/// The same database hosts the snapshot metadata tables, so a single config is used for both the
/// source reads and the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    pub username: String,
    /// Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }
}

/// TLS settings for Postgres connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    /// Fails with [`ValidationError::MissingTrustedRootCerts`] when TLS is enabled without
    /// certificates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Converts [`PgConnectionConfig`] into the connect options of a specific driver.
///
/// The metadata store talks to Postgres through `sqlx` while the source reads go through
/// `tokio_postgres`, so both are implemented from the single config.
pub trait IntoConnectOptions<Output> {
    /// Connect options without a database, used for administrative statements such as
    /// `create database`.
    fn without_db(&self) -> Output;

    /// Connect options targeting [`PgConnectionConfig::name`].
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<SqlxConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> SqlxConnectOptions {
        let ssl_mode = if self.tls.enabled {
            SqlxSslMode::VerifyFull
        } else {
            SqlxSslMode::Prefer
        };
        let options = SqlxConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .application_name(SNAPSHOT_APPLICATION_NAME)
            .ssl_mode(ssl_mode)
            .ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());

        match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }

    fn with_db(&self) -> SqlxConnectOptions {
        let options: SqlxConnectOptions = self.without_db();
        options.database(&self.name)
    }
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> TokioPgConnectOptions {
        // TLS itself is negotiated through rustls when connecting, the mode only tells the
        // driver whether to ask for it.
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };

        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.username.clone())
            .application_name(SNAPSHOT_APPLICATION_NAME)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    fn with_db(&self) -> TokioPgConnectOptions {
        let mut options: TokioPgConnectOptions = self.without_db();
        options.dbname(self.name.clone());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: TlsConfig) -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "orders".to_string(),
            username: "postgres".to_string(),
            password: Some("secret".to_string().into()),
            tls,
        }
    }

    #[test]
    fn tls_without_certificates_is_rejected() {
        let config = config(TlsConfig {
            trusted_root_certs: String::new(),
            enabled: true,
        });

        assert_eq!(
            config.validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        );
    }

    #[test]
    fn tokio_options_target_the_configured_database() {
        let config = config(TlsConfig::default());

        let options: TokioPgConnectOptions = config.with_db();
        assert_eq!(options.get_dbname(), Some("orders"));
        assert_eq!(options.get_user(), Some("postgres"));
        assert_eq!(
            options.get_application_name(),
            Some(SNAPSHOT_APPLICATION_NAME)
        );

        let options: TokioPgConnectOptions = config.without_db();
        assert_eq!(options.get_dbname(), None);
    }
}
