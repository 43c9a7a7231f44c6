// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-host facts shared by every connection of an account.
//!
//! The registry is one map behind one mutex. Accessors hold the lock only for
//! the duration of a read or write and never around network I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use thiserror::Error;

use crate::config::AccountConfig;
use crate::imap::auth::AuthMechanism;
use crate::imap::error::ImapError;
use crate::imap::namespace::{
    from_config_prefixes, to_canonical_path, to_server_path, Namespace, NamespaceTable,
    NamespaceType, CANONICAL_DELIMITER,
};
use crate::imap::types::Capabilities;

pub type HostSessionResult<T> = Result<T, HostSessionError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostSessionError {
    #[error("No host session registered for {0}")]
    UnknownHost(String),
}

impl From<HostSessionError> for ImapError {
    fn from(err: HostSessionError) -> Self {
        match err {
            HostSessionError::UnknownHost(key) => ImapError::UnknownHost(key),
        }
    }
}

#[derive(Debug, Default)]
struct HostSession {
    namespaces: NamespaceTable,
    cached_password: Option<String>,
    failed_auth: HashSet<AuthMechanism>,
    discovery_in_progress: bool,
    ever_discovered_folders: bool,
    namespaces_discovered: bool,
    override_namespaces: bool,
    trash_folder: Option<String>,
    using_subscription: bool,
    capabilities: Capabilities,
    online_dir: String,
}

impl HostSession {
    fn from_config(config: &AccountConfig) -> Self {
        let mut session = HostSession {
            cached_password: config.password.clone(),
            override_namespaces: config.override_namespaces,
            trash_folder: config.trash_folder.clone(),
            using_subscription: config.use_subscription,
            online_dir: config.online_dir.clone(),
            ..HostSession::default()
        };
        let lists = [
            (NamespaceType::Personal, &config.personal_namespace),
            (NamespaceType::Public, &config.public_namespace),
            (NamespaceType::OtherUsers, &config.other_users_namespace),
        ];
        for (ns_type, list) in lists {
            if let Some(list) = list {
                for ns in from_config_prefixes(ns_type, list) {
                    session.namespaces.add_namespace(ns);
                }
            }
        }
        session
    }

    fn delimiter_for(&self, ns: Option<&Namespace>) -> char {
        ns.or_else(|| self.namespaces.default_of_type(NamespaceType::Personal))
            .map(|ns| ns.delimiter)
            .unwrap_or(CANONICAL_DELIMITER)
    }
}

#[derive(Debug, Default)]
pub struct HostSessionRegistry {
    sessions: Mutex<HashMap<String, HostSession>>,
}

impl HostSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HostSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<T, F>(&self, key: &str, f: F) -> HostSessionResult<T>
    where
        F: FnOnce(&mut HostSession) -> T,
    {
        let mut sessions = self.lock();
        match sessions.get_mut(key) {
            Some(session) => Ok(f(session)),
            None => Err(HostSessionError::UnknownHost(key.to_string())),
        }
    }

    /// Creates the session for `key` unless it exists. Returns true if created.
    pub fn register(&self, key: &str, config: &AccountConfig) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(key) {
            return false;
        }
        info!("Registering host session {}", key);
        sessions.insert(key.to_string(), HostSession::from_config(config));
        true
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Discards every session. Call only while no connection is live.
    pub fn reset_all(&self) {
        let mut sessions = self.lock();
        debug!("Discarding {} host sessions", sessions.len());
        sessions.clear();
    }

    pub fn cached_password(&self, key: &str) -> HostSessionResult<Option<String>> {
        self.with(key, |s| s.cached_password.clone())
    }

    pub fn set_cached_password(&self, key: &str, password: &str) -> HostSessionResult<()> {
        self.with(key, |s| s.cached_password = Some(password.to_string()))
    }

    pub fn forget_password(&self, key: &str) -> HostSessionResult<()> {
        self.with(key, |s| s.cached_password = None)
    }

    /// Mechanisms the server rejected; new connections skip them.
    pub fn failed_auth(&self, key: &str) -> HostSessionResult<HashSet<AuthMechanism>> {
        self.with(key, |s| s.failed_auth.clone())
    }

    pub fn record_failed_auth(&self, key: &str, mechanism: AuthMechanism) -> HostSessionResult<()> {
        self.with(key, |s| {
            s.failed_auth.insert(mechanism);
        })
    }

    /// Makes every failed mechanism eligible again, e.g. after new credentials.
    pub fn reset_failed_auth(&self, key: &str) -> HostSessionResult<()> {
        self.with(key, |s| {
            debug!("Clearing {} failed auth mechanisms for {}", s.failed_auth.len(), key);
            s.failed_auth.clear();
        })
    }

    /// Adds a namespace. Server-advertised entries are dropped when the
    /// account keeps its configured namespaces.
    pub fn add_namespace(&self, key: &str, ns: Namespace) -> HostSessionResult<bool> {
        self.with(key, |s| {
            if !ns.from_config && !s.override_namespaces && !s.namespaces.is_empty() {
                debug!("Ignoring server namespace {:?}, config overrides", ns.prefix);
                return false;
            }
            s.namespaces.add_namespace(ns)
        })
    }

    pub fn match_namespace(&self, key: &str, canonical: &str) -> HostSessionResult<Option<Namespace>> {
        self.with(key, |s| s.namespaces.match_folder(canonical).cloned())
    }

    pub fn match_server_namespace(
        &self,
        key: &str,
        server_name: &str,
    ) -> HostSessionResult<Option<Namespace>> {
        self.with(key, |s| s.namespaces.match_server_folder(server_name).cloned())
    }

    pub fn default_namespace(
        &self,
        key: &str,
        ns_type: NamespaceType,
    ) -> HostSessionResult<Option<Namespace>> {
        self.with(key, |s| s.namespaces.default_of_type(ns_type).cloned())
    }

    pub fn namespaces(&self, key: &str) -> HostSessionResult<Vec<Namespace>> {
        self.with(key, |s| s.namespaces.iter().cloned().collect())
    }

    pub fn confirm_namespace_delimiter(
        &self,
        key: &str,
        server_name: &str,
        delimiter: char,
    ) -> HostSessionResult<bool> {
        self.with(key, |s| s.namespaces.confirm_delimiter(server_name, delimiter))
    }

    pub fn folder_is_namespace(
        &self,
        key: &str,
        server_name: &str,
    ) -> HostSessionResult<Option<Namespace>> {
        self.with(key, |s| s.namespaces.folder_is_namespace(server_name).cloned())
    }

    pub fn owner_of(&self, key: &str, server_name: &str) -> HostSessionResult<Option<String>> {
        self.with(key, |s| s.namespaces.owner_of(server_name))
    }

    pub fn namespaces_discovered(&self, key: &str) -> HostSessionResult<bool> {
        self.with(key, |s| s.namespaces_discovered)
    }

    /// Marks namespace discovery finished and returns the final table.
    pub fn commit_namespaces(&self, key: &str) -> HostSessionResult<Vec<Namespace>> {
        self.with(key, |s| {
            s.namespaces_discovered = true;
            s.namespaces.iter().cloned().collect()
        })
    }

    /// Drops server-advertised namespaces so the next connection asks again.
    pub fn clear_server_namespaces(&self, key: &str) -> HostSessionResult<()> {
        self.with(key, |s| {
            s.namespaces.clear_server_advertised();
            s.namespaces_discovered = false;
        })
    }

    pub fn discovery_in_progress(&self, key: &str) -> HostSessionResult<bool> {
        self.with(key, |s| s.discovery_in_progress)
    }

    pub fn set_discovery_in_progress(&self, key: &str, value: bool) -> HostSessionResult<()> {
        self.with(key, |s| s.discovery_in_progress = value)
    }

    pub fn have_ever_discovered_folders(&self, key: &str) -> HostSessionResult<bool> {
        self.with(key, |s| s.ever_discovered_folders)
    }

    pub fn set_have_ever_discovered_folders(&self, key: &str, value: bool) -> HostSessionResult<()> {
        self.with(key, |s| s.ever_discovered_folders = value)
    }

    pub fn trash_folder(&self, key: &str) -> HostSessionResult<Option<String>> {
        self.with(key, |s| s.trash_folder.clone())
    }

    pub fn set_trash_folder(&self, key: &str, canonical: &str) -> HostSessionResult<()> {
        self.with(key, |s| s.trash_folder = Some(canonical.to_string()))
    }

    pub fn using_subscription(&self, key: &str) -> HostSessionResult<bool> {
        self.with(key, |s| s.using_subscription)
    }

    pub fn set_using_subscription(&self, key: &str, value: bool) -> HostSessionResult<()> {
        self.with(key, |s| s.using_subscription = value)
    }

    pub fn capabilities(&self, key: &str) -> HostSessionResult<Capabilities> {
        self.with(key, |s| s.capabilities)
    }

    pub fn set_capabilities(&self, key: &str, caps: Capabilities) -> HostSessionResult<()> {
        self.with(key, |s| s.capabilities = caps)
    }

    pub fn online_dir(&self, key: &str) -> HostSessionResult<String> {
        self.with(key, |s| s.online_dir.clone())
    }

    /// Server spelling of a canonical path, using the matching namespace's
    /// delimiter and the online directory.
    pub fn server_path_for(&self, key: &str, canonical: &str) -> HostSessionResult<String> {
        self.with(key, |s| {
            if canonical.eq_ignore_ascii_case("INBOX") {
                return canonical.to_string();
            }
            let delimiter = s.delimiter_for(s.namespaces.match_folder(canonical));
            let path = to_server_path(canonical, delimiter);
            if s.online_dir.is_empty() || path.starts_with(&s.online_dir) {
                path
            } else {
                format!("{}{}", s.online_dir, path)
            }
        })
    }

    /// Canonical path for a server mailbox name. `delimiter` is the one from
    /// the LIST response when known.
    pub fn canonical_path_for(
        &self,
        key: &str,
        server_name: &str,
        delimiter: Option<char>,
    ) -> HostSessionResult<String> {
        self.with(key, |s| {
            let name = if s.online_dir.is_empty() {
                server_name
            } else {
                server_name
                    .strip_prefix(s.online_dir.as_str())
                    .unwrap_or(server_name)
            };
            let delimiter =
                delimiter.unwrap_or_else(|| s.delimiter_for(s.namespaces.match_server_folder(name)));
            to_canonical_path(name, delimiter)
        })
    }

    /// Hierarchy delimiter to use for a canonical path.
    pub fn delimiter_for(&self, key: &str, canonical: &str) -> HostSessionResult<char> {
        self.with(key, |s| s.delimiter_for(s.namespaces.match_folder(canonical)))
    }
}
