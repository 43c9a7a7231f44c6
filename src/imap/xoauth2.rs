// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XOAUTH2 SASL exchange (Microsoft 365, Gmail, etc.).
//!
//! Token format: `user=<email>\x01auth=Bearer <access_token>\x01\x01`
//!
//! On failure the server sends a continuation carrying a base64 JSON error
//! document; the client must answer with an empty line before the tagged NO
//! arrives.

use log::warn;
use serde::Deserialize;

use crate::imap::auth::{AuthMechanism, SaslExchange};
use crate::imap::error::ImapError;

/// Error document a server returns for a rejected token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XOAuth2ErrorPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub schemes: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct XOAuth2Exchange {
    /// The pre-formatted XOAUTH2 token string.
    token: String,
    sent: bool,
    last_error: Option<XOAuth2ErrorPayload>,
}

impl XOAuth2Exchange {
    /// `email` is the account address, `access_token` the OAuth2 bearer token.
    pub fn new(email: &str, access_token: &str) -> Self {
        Self {
            token: format!("user={}\x01auth=Bearer {}\x01\x01", email, access_token),
            sent: false,
            last_error: None,
        }
    }

    pub fn last_error(&self) -> Option<&XOAuth2ErrorPayload> {
        self.last_error.as_ref()
    }
}

impl SaslExchange for XOAuth2Exchange {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::XOAuth2
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        self.sent = true;
        Some(self.token.clone().into_bytes())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ImapError> {
        if !self.sent {
            self.sent = true;
            return Ok(self.token.clone().into_bytes());
        }
        match serde_json::from_slice::<XOAuth2ErrorPayload>(challenge) {
            Ok(payload) => {
                warn!(
                    "XOAUTH2 rejected: status={} scope={}",
                    payload.status, payload.scope
                );
                self.last_error = Some(payload);
            }
            Err(e) => warn!("XOAUTH2 rejected with unreadable payload: {}", e),
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xoauth2_token_format() {
        let mut auth = XOAuth2Exchange::new("user@outlook.com", "my-token-123");
        let response = auth.initial_response().unwrap();
        assert_eq!(
            response,
            b"user=user@outlook.com\x01auth=Bearer my-token-123\x01\x01".to_vec()
        );
    }

    #[test]
    fn test_token_sent_on_first_challenge_without_sasl_ir() {
        let mut auth = XOAuth2Exchange::new("a@b.com", "tok");
        let first = auth.respond(b"").unwrap();
        assert_eq!(first, b"user=a@b.com\x01auth=Bearer tok\x01\x01".to_vec());
    }

    #[test]
    fn test_error_payload_answered_with_empty_line() {
        let mut auth = XOAuth2Exchange::new("a@b.com", "tok");
        auth.initial_response();
        let reply = auth
            .respond(br#"{"status":"401","schemes":"bearer","scope":"https://mail.google.com/"}"#)
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(auth.last_error().unwrap().status, "401");

        let reply = auth.respond(b"not json").unwrap();
        assert!(reply.is_empty());
    }
}
