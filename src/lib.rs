// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Library core for imapcore: pooled IMAP connections, per-host session
//! state and the protocol state machine.

// --- Modules ---
pub mod config;
pub mod connection_pool;
pub mod host_session;
pub mod imap;

// CONSOLIDATED PRELUDE
pub mod prelude {
    // Config
    pub use crate::config::{AccountConfig, Settings, TlsPolicy};

    // Pool and shared host state
    pub use crate::connection_pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, SubmitState};
    pub use crate::host_session::{HostSessionError, HostSessionRegistry};

    // IMAP
    pub use crate::imap::auth::{AuthMechanism, Credentials, SaslAuthenticator};
    pub use crate::imap::error::ImapError;
    pub use crate::imap::flag_state::FlagUidState;
    pub use crate::imap::namespace::{Namespace, NamespaceTable, NamespaceType};
    pub use crate::imap::request::{
        HeaderData, ImapRequest, RequestHandle, RequestKind, RequestOutcome, RequestResult,
    };
    pub use crate::imap::sink::{
        FolderEvent, MailFolderSink, MessageEvent, MessageSink, ServerEvent, ServerSink,
    };
    pub use crate::imap::types::{Capabilities, MailboxFlags, MessageFlags, StoreOperation};

    // Common Libs
    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
