// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP protocol layer: wire parsing, authentication, the per-connection
//! state machine and the thread that drives it over a socket.

pub mod auth;
pub mod connection;
pub mod error;
pub mod flag_state;
pub mod namespace;
pub mod protocol;
pub mod request;
pub mod response;
pub mod sink;
pub mod types;
pub mod xoauth2;

pub use connection::{ConnectionFactory, TcpConnectionFactory};
pub use error::ImapError;
pub use protocol::{ConnectionState, ProtocolMachine};
pub use request::{ImapRequest, RequestHandle, RequestKind, RequestOutcome, RequestResult};
