// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::net::TcpStream;

use thiserror::Error;

use crate::imap::auth::{AuthExhaustion, AuthMechanism};

/// Broad failure classes; they decide who handles an error and whether the
/// request may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect/read/write/handshake failure. Kills the connection; the request
    /// in flight gets one retry on a fresh connection.
    Transport,
    /// Tagged NO/BAD or an untagged BYE. Fails only the command.
    Protocol,
    /// Authentication failure after every mechanism was tried.
    Authentication,
    /// Caller or configuration mistake. Reported immediately, never retried.
    Application,
}

#[derive(Debug, Error, Clone)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("TLS is required but the server does not offer STARTTLS")]
    TlsRequired,

    #[error("Server closed the session: {0}")]
    Bye(String),

    #[error("{command} failed: {text}")]
    No {
        command: String,
        text: String,
        code: Option<String>,
    },

    #[error("{command} rejected by server: {text}")]
    Bad {
        command: String,
        text: String,
        code: Option<String>,
    },

    #[error("{mechanism} authentication rejected: {text}")]
    AuthFailed { mechanism: AuthMechanism, text: String },

    #[error("Authentication exhausted: {0}")]
    AuthExhausted(AuthExhaustion),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid mailbox: {0}")]
    InvalidMailbox(String),

    #[error("Operation requires folder selection: {0}")]
    RequiresFolderSelection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown host session: {0}")]
    UnknownHost(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ImapError::Connection(_)
            | ImapError::ConnectionClosed
            | ImapError::Tls(_)
            | ImapError::Io(_) => ErrorClass::Transport,
            ImapError::Bye(_)
            | ImapError::No { .. }
            | ImapError::Bad { .. }
            | ImapError::Parse(_) => ErrorClass::Protocol,
            ImapError::AuthFailed { .. } | ImapError::AuthExhausted(_) => {
                ErrorClass::Authentication
            }
            ImapError::TlsRequired
            | ImapError::InvalidMailbox(_)
            | ImapError::RequiresFolderSelection(_)
            | ImapError::Config(_)
            | ImapError::UnknownHost(_)
            | ImapError::Interrupted
            | ImapError::Internal(_) => ErrorClass::Application,
        }
    }

    /// Whether the pool may resubmit the request on another connection.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Server-provided text, used as the key for user-visible messages.
    pub fn server_text(&self) -> Option<&str> {
        match self {
            ImapError::No { text, .. }
            | ImapError::Bad { text, .. }
            | ImapError::AuthFailed { text, .. }
            | ImapError::Bye(text) => Some(text),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ImapError::ConnectionClosed,
            _ => ImapError::Io(err.to_string()),
        }
    }
}

impl From<native_tls::Error> for ImapError {
    fn from(err: native_tls::Error) -> Self {
        ImapError::Tls(err.to_string())
    }
}

impl From<native_tls::HandshakeError<TcpStream>> for ImapError {
    fn from(err: native_tls::HandshakeError<TcpStream>) -> Self {
        ImapError::Tls(err.to_string())
    }
}

impl From<base64::DecodeError> for ImapError {
    fn from(err: base64::DecodeError) -> Self {
        ImapError::Parse(format!("Base64 decode error: {}", err))
    }
}
