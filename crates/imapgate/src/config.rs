/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fs::File, io::BufReader, io::Read, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;

use crate::{auth::AUTH_REQUEST_TIMEOUT, registry::CLIENT_LOGIN_IDLE_TIMEOUT};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub master: MasterConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Optional implicit-TLS (imaps) listener; requires `[tls]`.
    pub listen_tls: Option<String>,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_true")]
    pub greeting_capability: bool,
    #[serde(default = "default_capability")]
    pub capability: String,
    #[serde(default)]
    pub verbose_proctitle: bool,
    #[serde(default = "default_idle_timeout")]
    pub login_idle_timeout: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    /// Registry capacity; 0 disables oldest-eviction.
    #[serde(default = "default_max_logging_users")]
    pub max_logging_users: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_socket")]
    pub socket: PathBuf,
    #[serde(default = "default_true")]
    pub disable_plaintext_auth: bool,
    /// Seconds; must stay above `login_idle_timeout`.
    #[serde(default = "default_auth_timeout")]
    pub request_timeout: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MasterConfig {
    /// Backend address that authenticated connections are handed to.
    pub backend: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_listen() -> String {
    "127.0.0.1:143".to_string()
}

fn default_greeting() -> String {
    "imapgate ready.".to_string()
}

fn default_capability() -> String {
    "IMAP4rev1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    CLIENT_LOGIN_IDLE_TIMEOUT
}

fn default_max_logging_users() -> usize {
    256
}

fn default_auth_socket() -> PathBuf {
    PathBuf::from("/run/imapgate/auth.sock")
}

fn default_auth_timeout() -> u64 {
    AUTH_REQUEST_TIMEOUT.as_secs()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            listen_tls: None,
            greeting: default_greeting(),
            greeting_capability: true,
            capability: default_capability(),
            verbose_proctitle: false,
            login_idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_logging_users: default_max_logging_users(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            socket: default_auth_socket(),
            disable_plaintext_auth: true,
            request_timeout: default_auth_timeout(),
        }
    }
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())
        .with_context(|| format!("Cannot open {}", config_file.display()))?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    let config: Config = toml::from_str(&config)?;
    anyhow::ensure!(
        config.auth.request_timeout > config.server.login_idle_timeout,
        "auth.request_timeout must be greater than server.login_idle_timeout"
    );
    Ok(config)
}

pub fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&tls.cert).with_context(|| format!("Cannot open {}", tls.cert.display()))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&tls.key).with_context(|| format!("Cannot open {}", tls.key.display()))?,
    ))?
    .ok_or_else(|| anyhow::anyhow!("No private key found in {}", tls.key.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn parse_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:143"
            greeting = "gateway ready."

            [limits]
            max_logging_users = 512

            [auth]
            socket = "/tmp/auth.sock"
            disable_plaintext_auth = false

            [master]
            backend = "127.0.0.1:1143"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:143");
        assert_eq!(config.server.greeting, "gateway ready.");
        assert!(config.server.greeting_capability);
        assert_eq!(config.server.capability, "IMAP4rev1");
        assert_eq!(config.server.login_idle_timeout, 60);
        assert_eq!(config.limits.max_logging_users, 512);
        assert!(!config.auth.disable_plaintext_auth);
        assert_eq!(config.auth.request_timeout, 150);
        assert_eq!(config.master.backend, "127.0.0.1:1143");
        assert!(config.tls.is_none());
    }

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("[master]\nbackend = \"10.0.0.2:143\"\n").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:143");
        assert_eq!(config.limits.max_logging_users, 256);
        assert!(config.auth.disable_plaintext_auth);
    }
}
