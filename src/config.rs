// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::env;

use config::{Environment, File};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imap::auth::{AuthMechanism, Credentials};

pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
/// RFC 3501 lets servers drop a client after 30 idle minutes.
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 29;
pub const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Plain text only, STARTTLS is never attempted.
    Never,
    /// STARTTLS when advertised, plain text otherwise.
    Try,
    /// STARTTLS is mandatory; a server without it is an error.
    Always,
    /// TLS from the first byte (port 993).
    #[default]
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

fn default_port() -> u16 {
    993
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_idle_timeout() -> u64 {
    MAX_IDLE_TIMEOUT_MINUTES
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u32 {
    65536
}

fn default_chunk_threshold() -> u32 {
    98304
}

fn default_connect_timeout() -> u64 {
    30
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub tls_policy: TlsPolicy,
    /// Accept certificates that fail verification. Test servers only.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_minutes: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Empty means every mechanism is allowed.
    #[serde(default)]
    pub allowed_auth: Vec<AuthMechanism>,
    #[serde(default = "default_true")]
    pub use_idle: bool,
    #[serde(default)]
    pub use_subscription: bool,
    /// Header fields fetched in addition to the standard set.
    #[serde(default)]
    pub extra_headers: Vec<String>,
    #[serde(default = "default_true")]
    pub fetch_by_chunks: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u32,
    /// Comma separated quoted prefix lists, e.g. `"INBOX.",""`.
    #[serde(default)]
    pub personal_namespace: Option<String>,
    #[serde(default)]
    pub public_namespace: Option<String>,
    #[serde(default)]
    pub other_users_namespace: Option<String>,
    /// Let server-advertised namespaces replace the configured ones.
    #[serde(default = "default_true")]
    pub override_namespaces: bool,
    #[serde(default)]
    pub trash_folder: Option<String>,
    /// Server-side root prepended to every non-INBOX mailbox.
    #[serde(default)]
    pub online_dir: String,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls_policy", &self.tls_policy)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout_minutes", &self.idle_timeout_minutes)
            .field("allowed_auth", &self.allowed_auth)
            .finish_non_exhaustive()
    }
}

impl AccountConfig {
    pub fn new(host: &str, port: u16, username: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: None,
            oauth_token: None,
            tls_policy: TlsPolicy::default(),
            accept_invalid_certs: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_minutes: MAX_IDLE_TIMEOUT_MINUTES,
            connect_timeout_secs: default_connect_timeout(),
            allowed_auth: Vec::new(),
            use_idle: true,
            use_subscription: false,
            extra_headers: Vec::new(),
            fetch_by_chunks: true,
            chunk_size: default_chunk_size(),
            chunk_threshold: default_chunk_threshold(),
            personal_namespace: None,
            public_namespace: None,
            other_users_namespace: None,
            override_namespaces: true,
            trash_folder: None,
            online_dir: String::new(),
        }
    }

    /// Registry key shared by every connection of this account.
    pub fn server_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            oauth_token: self.oauth_token.clone(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Values below 1 are raised to 1.
    pub fn set_max_connections(&mut self, max: usize) {
        if max == 0 {
            warn!("max_connections of 0 raised to 1");
        }
        self.max_connections = max.max(1);
    }

    pub fn idle_timeout_minutes(&self) -> u64 {
        self.idle_timeout_minutes
    }

    /// Clamps to 1..=29 minutes.
    pub fn set_idle_timeout_minutes(&mut self, minutes: u64) {
        let clamped = minutes.clamp(1, MAX_IDLE_TIMEOUT_MINUTES);
        if clamped != minutes {
            warn!("idle timeout of {} minutes clamped to {}", minutes, clamped);
        }
        self.idle_timeout_minutes = clamped;
    }

    /// Runs the setters over deserialized values.
    pub fn normalize(&mut self) {
        self.set_max_connections(self.max_connections);
        self.set_idle_timeout_minutes(self.idle_timeout_minutes);
        if self.chunk_size == 0 {
            self.fetch_by_chunks = false;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

impl Settings {
    /// Loads defaults, then `config_path` if given, then the environment.
    ///
    /// `IMAPCORE_ACCOUNTS__WORK__HOST=...` overrides `accounts.work.host`;
    /// the short `IMAP_HOST`/`IMAP_PORT`/`IMAP_USER`/`IMAP_PASS` variables
    /// fill in the `default` account.
    pub fn new(config_path: Option<&str>) -> Result<Self, SettingsError> {
        let mut config_builder = config::Config::builder().set_default("log.level", "info")?;

        if let Some(path) = config_path {
            config_builder = config_builder.add_source(File::with_name(path));
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("IMAPCORE")
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true),
        );

        let env_vars = [
            ("IMAP_HOST", "host"),
            ("IMAP_PORT", "port"),
            ("IMAP_USER", "username"),
            ("IMAP_PASS", "password"),
        ];
        for (env_var, field) in &env_vars {
            let Ok(value) = env::var(env_var) else {
                continue;
            };
            let key = format!("accounts.{}.{}", DEFAULT_ACCOUNT, field);
            if *env_var == "IMAP_PORT" {
                match value.parse::<u16>() {
                    Ok(port) => config_builder = config_builder.set_override(key, port)?,
                    Err(_) => warn!("Invalid port value in {}: {}", env_var, value),
                }
            } else {
                config_builder = config_builder.set_override(key, value)?;
            }
        }

        let mut settings: Settings = config_builder.build()?.try_deserialize()?;
        for (name, account) in settings.accounts.iter_mut() {
            if account.host.is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "account {} has no host",
                    name
                )));
            }
            account.normalize();
        }
        Ok(settings)
    }

    pub fn account(&self, name: &str) -> Result<&AccountConfig, SettingsError> {
        self.accounts
            .get(name)
            .ok_or_else(|| SettingsError::UnknownAccount(name.to_string()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            accounts: BTreeMap::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unknown account: {0}")]
    UnknownAccount(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for var in ["IMAP_HOST", "IMAP_PORT", "IMAP_USER", "IMAP_PASS"] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_max_connections_floor() {
        let mut account = AccountConfig::new("imap.example.com", 993, "me");
        assert_eq!(account.max_connections(), 5);
        account.set_max_connections(0);
        assert_eq!(account.max_connections(), 1);
        account.set_max_connections(12);
        assert_eq!(account.max_connections(), 12);
    }

    #[test]
    fn test_idle_timeout_clamped_on_set() {
        let mut account = AccountConfig::new("imap.example.com", 993, "me");
        assert_eq!(account.idle_timeout_minutes(), 29);
        account.set_idle_timeout_minutes(45);
        assert_eq!(account.idle_timeout_minutes(), 29);
        account.set_idle_timeout_minutes(0);
        assert_eq!(account.idle_timeout_minutes(), 1);
        account.set_idle_timeout_minutes(10);
        assert_eq!(account.idle_timeout_minutes(), 10);
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut account = AccountConfig::new("h", 143, "u");
        account.password = Some("s3cret".into());
        assert!(!format!("{:?}", account).contains("s3cret"));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[log]
level = "debug"

[accounts.work]
host = "imap.work.example"
port = 143
username = "alice"
tls_policy = "try"
max_connections = 0
idle_timeout_minutes = 60
allowed_auth = ["cram-md5", "plain"]
personal_namespace = '"INBOX."'
"#
        )
        .unwrap();

        let settings = Settings::new(file.path().to_str()).unwrap();
        assert_eq!(settings.log.level, "debug");
        let work = settings.account("work").unwrap();
        assert_eq!(work.port, 143);
        assert_eq!(work.tls_policy, TlsPolicy::Try);
        assert_eq!(work.max_connections(), 1);
        assert_eq!(work.idle_timeout_minutes(), 29);
        assert_eq!(work.allowed_auth, vec![AuthMechanism::CramMd5, AuthMechanism::Plain]);
        assert_eq!(work.personal_namespace.as_deref(), Some("\"INBOX.\""));
        assert!(work.use_idle);
        assert!(matches!(
            settings.account("missing"),
            Err(SettingsError::UnknownAccount(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_fills_default_account() {
        clear_env();
        env::set_var("IMAP_HOST", "imap.env.example");
        env::set_var("IMAP_PORT", "1143");
        env::set_var("IMAP_USER", "bob");
        env::set_var("IMAP_PASS", "pw");
        let settings = Settings::new(None);
        clear_env();

        let settings = settings.unwrap();
        let account = settings.account(DEFAULT_ACCOUNT).unwrap();
        assert_eq!(account.host, "imap.env.example");
        assert_eq!(account.port, 1143);
        assert_eq!(account.username, "bob");
        assert_eq!(account.password.as_deref(), Some("pw"));
        assert_eq!(account.tls_policy, TlsPolicy::Implicit);
    }

    #[test]
    #[serial]
    fn test_account_without_host_rejected() {
        clear_env();
        env::set_var("IMAP_USER", "nobody");
        let result = Settings::new(None);
        clear_env();
        assert!(result.is_err());
    }
}
