// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL mechanism selection and the built-in mechanisms.
//!
//! [`AuthNegotiator`] picks the strongest mechanism that the server advertises,
//! the account allows, credentials exist for, and that has not failed yet.
//! Each attempt runs as a [`SaslExchange`]; GSSAPI, NTLM and MSN exchanges come
//! from an injected [`SaslAuthenticator`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use log::warn;
use md5::Md5;
use serde::{Deserialize, Serialize};

use crate::imap::error::ImapError;
use crate::imap::types::Capabilities;
use crate::imap::xoauth2::XOAuth2Exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMechanism {
    Gssapi,
    CramMd5,
    Ntlm,
    Msn,
    #[serde(rename = "xoauth2")]
    XOAuth2,
    Plain,
    Login,
}

impl AuthMechanism {
    /// Strongest first.
    pub const PREFERENCE: [AuthMechanism; 7] = [
        AuthMechanism::Gssapi,
        AuthMechanism::CramMd5,
        AuthMechanism::Ntlm,
        AuthMechanism::Msn,
        AuthMechanism::XOAuth2,
        AuthMechanism::Plain,
        AuthMechanism::Login,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::Gssapi => "GSSAPI",
            AuthMechanism::CramMd5 => "CRAM-MD5",
            AuthMechanism::Ntlm => "NTLM",
            AuthMechanism::Msn => "MSN",
            AuthMechanism::XOAuth2 => "XOAUTH2",
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Login => "LOGIN",
        }
    }

    pub fn from_name(name: &str) -> Option<AuthMechanism> {
        AuthMechanism::PREFERENCE
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name.trim()))
    }

    fn capability(self) -> Capabilities {
        match self {
            AuthMechanism::Gssapi => Capabilities::AUTH_GSSAPI,
            AuthMechanism::CramMd5 => Capabilities::AUTH_CRAM_MD5,
            AuthMechanism::Ntlm => Capabilities::AUTH_NTLM,
            AuthMechanism::Msn => Capabilities::AUTH_MSN,
            AuthMechanism::XOAuth2 => Capabilities::AUTH_XOAUTH2,
            AuthMechanism::Plain => Capabilities::AUTH_PLAIN,
            AuthMechanism::Login => Capabilities::AUTH_LOGIN,
        }
    }

    /// LOGIN is usable through the plain LOGIN command unless the server
    /// disabled it.
    pub fn offered_by(self, caps: Capabilities) -> bool {
        match self {
            AuthMechanism::Login => {
                caps.contains(Capabilities::AUTH_LOGIN)
                    || !caps.contains(Capabilities::LOGIN_DISABLED)
            }
            other => caps.contains(other.capability()),
        }
    }

    /// True when this mechanism goes through `AUTHENTICATE`, false when it is
    /// the LOGIN command.
    pub fn uses_authenticate(self, caps: Capabilities) -> bool {
        self != AuthMechanism::Login || caps.contains(Capabilities::AUTH_LOGIN)
    }

    fn is_external(self) -> bool {
        matches!(
            self,
            AuthMechanism::Gssapi | AuthMechanism::Ntlm | AuthMechanism::Msn
        )
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why no mechanism is left to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthExhaustion {
    /// The server offers nothing the account allows.
    NoServerSupport,
    /// Every usable mechanism was rejected.
    AllMechanismsFailed,
    /// Mechanisms are available but no credentials exist for them.
    CredentialsUnavailable,
}

impl fmt::Display for AuthExhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthExhaustion::NoServerSupport => "server offers no allowed mechanism",
            AuthExhaustion::AllMechanismsFailed => "all mechanisms failed",
            AuthExhaustion::CredentialsUnavailable => "no credentials for any offered mechanism",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub oauth_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("oauth_token", &self.oauth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(username: &str, password: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            password: password.map(str::to_string),
            oauth_token: None,
        }
    }

    fn has_password(&self) -> bool {
        self.password.as_deref().map_or(false, |p| !p.is_empty())
    }
}

/// One running SASL exchange.
pub trait SaslExchange: Send {
    fn mechanism(&self) -> AuthMechanism;

    /// Data for SASL-IR, if the mechanism has an initial response.
    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Answers a decoded server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ImapError>;
}

/// Source of exchanges for mechanisms this crate does not implement.
pub trait SaslAuthenticator: Send + Sync {
    fn supports(&self, mechanism: AuthMechanism) -> bool;

    fn begin(
        &self,
        mechanism: AuthMechanism,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn SaslExchange>, ImapError>;
}

pub struct PlainExchange {
    payload: Vec<u8>,
}

impl PlainExchange {
    pub fn new(username: &str, password: &str) -> Self {
        let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(password.as_bytes());
        Self { payload }
    }
}

impl SaslExchange for PlainExchange {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::Plain
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(self.payload.clone())
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, ImapError> {
        Ok(self.payload.clone())
    }
}

/// `AUTHENTICATE LOGIN`: username on the first challenge, password after.
pub struct LoginExchange {
    username: String,
    password: String,
    step: usize,
}

impl LoginExchange {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            step: 0,
        }
    }
}

impl SaslExchange for LoginExchange {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::Login
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, ImapError> {
        self.step += 1;
        match self.step {
            1 => Ok(self.username.as_bytes().to_vec()),
            2 => Ok(self.password.as_bytes().to_vec()),
            _ => Err(ImapError::Parse("unexpected extra LOGIN challenge".into())),
        }
    }
}

pub struct CramMd5Exchange {
    username: String,
    password: String,
}

impl CramMd5Exchange {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl SaslExchange for CramMd5Exchange {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::CramMd5
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ImapError> {
        let digest = hmac_md5(self.password.as_bytes(), challenge)?;
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(format!("{} {}", self.username, hex).into_bytes())
    }
}

/// HMAC-MD5 (RFC 2104).
pub fn hmac_md5(key: &[u8], message: &[u8]) -> Result<[u8; 16], ImapError> {
    let mut mac = Hmac::<Md5>::new_from_slice(key)
        .map_err(|e| ImapError::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Tracks which mechanisms remain for one connection.
#[derive(Clone)]
pub struct AuthNegotiator {
    allowed: Vec<AuthMechanism>,
    failed: HashSet<AuthMechanism>,
    external: Option<Arc<dyn SaslAuthenticator>>,
}

impl fmt::Debug for AuthNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthNegotiator")
            .field("allowed", &self.allowed)
            .field("failed", &self.failed)
            .field("external", &self.external.is_some())
            .finish()
    }
}

impl AuthNegotiator {
    /// `allowed` empty means every mechanism is allowed.
    pub fn new(allowed: Vec<AuthMechanism>, external: Option<Arc<dyn SaslAuthenticator>>) -> Self {
        Self {
            allowed,
            failed: HashSet::new(),
            external,
        }
    }

    /// Starts with mechanisms that already failed on an earlier connection.
    pub fn with_failed(mut self, failed: HashSet<AuthMechanism>) -> Self {
        self.failed = failed;
        self
    }

    fn allows(&self, mechanism: AuthMechanism) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&mechanism)
    }

    fn has_credentials_for(&self, mechanism: AuthMechanism, credentials: &Credentials) -> bool {
        match mechanism {
            AuthMechanism::Plain | AuthMechanism::Login | AuthMechanism::CramMd5 => {
                credentials.has_password()
            }
            AuthMechanism::XOAuth2 => credentials
                .oauth_token
                .as_deref()
                .map_or(false, |t| !t.is_empty()),
            external => self
                .external
                .as_ref()
                .map_or(false, |auth| auth.supports(external)),
        }
    }

    /// Picks the strongest remaining mechanism or explains why there is none.
    pub fn next_mechanism(
        &self,
        caps: Capabilities,
        credentials: &Credentials,
    ) -> Result<AuthMechanism, AuthExhaustion> {
        let offered: Vec<AuthMechanism> = AuthMechanism::PREFERENCE
            .into_iter()
            .filter(|m| m.offered_by(caps) && self.allows(*m))
            .collect();
        if offered.is_empty() {
            return Err(AuthExhaustion::NoServerSupport);
        }
        let usable: Vec<AuthMechanism> = offered
            .into_iter()
            .filter(|m| self.has_credentials_for(*m, credentials))
            .collect();
        if usable.is_empty() {
            return Err(AuthExhaustion::CredentialsUnavailable);
        }
        usable
            .into_iter()
            .find(|m| !self.failed.contains(m))
            .ok_or(AuthExhaustion::AllMechanismsFailed)
    }

    pub fn mark_failed(&mut self, mechanism: AuthMechanism) {
        warn!("{} authentication failed, trying next mechanism", mechanism);
        self.failed.insert(mechanism);
    }


    /// Starts an exchange for `mechanism`.
    pub fn begin(
        &self,
        mechanism: AuthMechanism,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn SaslExchange>, ImapError> {
        let password = || {
            credentials
                .password
                .clone()
                .ok_or(ImapError::AuthExhausted(AuthExhaustion::CredentialsUnavailable))
        };
        let exchange: Box<dyn SaslExchange> = match mechanism {
            AuthMechanism::Plain => Box::new(PlainExchange::new(&credentials.username, &password()?)),
            AuthMechanism::Login => Box::new(LoginExchange::new(&credentials.username, &password()?)),
            AuthMechanism::CramMd5 => {
                Box::new(CramMd5Exchange::new(&credentials.username, &password()?))
            }
            AuthMechanism::XOAuth2 => {
                let token = credentials
                    .oauth_token
                    .as_deref()
                    .ok_or(ImapError::AuthExhausted(AuthExhaustion::CredentialsUnavailable))?;
                Box::new(XOAuth2Exchange::new(&credentials.username, token))
            }
            external if external.is_external() => match &self.external {
                Some(auth) => auth.begin(external, host, credentials)?,
                None => {
                    return Err(ImapError::Config(format!(
                        "no authenticator registered for {}",
                        external
                    )))
                }
            },
            other => return Err(ImapError::Internal(format!("unhandled mechanism {}", other))),
        };
        Ok(exchange)
    }
}
