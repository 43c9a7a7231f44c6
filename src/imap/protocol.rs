// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-connection IMAP state machine.
//!
//! [`ProtocolMachine`] never touches a socket. The driver in
//! [`connection`](crate::imap::connection) feeds it parsed server responses and
//! pool work as [`Event`]s and carries out the returned [`Effect`]s in order.

use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{AccountConfig, TlsPolicy};
use crate::host_session::{HostSessionRegistry, HostSessionResult};
use crate::imap::auth::{AuthMechanism, AuthNegotiator, Credentials, SaslAuthenticator, SaslExchange};
use crate::imap::error::ImapError;
use crate::imap::flag_state::FlagUidState;
use crate::imap::request::{
    HeaderData, ImapRequest, RequestKind, RequestOutcome, RequestResult, DEFAULT_HEADER_FIELDS,
};
use crate::imap::response::{FetchData, ListKind, Response, ResponseCode, Status, StatusResponse, Untagged};
use crate::imap::sink::{
    FolderEvent, MailFolderSink, MessageEvent, MessageSink, QuotaResource, ServerEvent, ServerSink,
};
use crate::imap::types::{quote, uid_set, Capabilities, MailboxFlags, MailboxSpec, MessageFlags};

/// Connections a request may be handed to before a transport failure is final.
pub const MAX_ATTEMPTS: u32 = 2;

/// Per-connection settings taken from the account.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub server_key: String,
    pub host: String,
    pub tls_policy: TlsPolicy,
    pub credentials: Credentials,
    pub allowed_auth: Vec<AuthMechanism>,
    pub use_idle: bool,
    pub fetch_by_chunks: bool,
    pub chunk_size: u32,
    pub chunk_threshold: u32,
    pub extra_headers: Vec<String>,
}

impl ConnectionOptions {
    pub fn from_account(account: &AccountConfig) -> Self {
        Self {
            server_key: account.server_key(),
            host: account.host.clone(),
            tls_policy: account.tls_policy,
            credentials: account.credentials(),
            allowed_auth: account.allowed_auth.clone(),
            use_idle: account.use_idle,
            fetch_by_chunks: account.fetch_by_chunks,
            chunk_size: account.chunk_size.max(1),
            chunk_threshold: account.chunk_threshold,
            extra_headers: account.extra_headers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingGreeting,
    QueryingCapability { post_tls: bool },
    StartingTls,
    Authenticating,
    Authenticated,
    Selecting,
    Selected,
    /// Running a request; carries the request kind name.
    Executing(&'static str),
    Idling,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum Event {
    /// Socket open; implicit TLS, if any, is already negotiated.
    Connected,
    Response(Response),
    TlsEstablished,
    Work(ImapRequest),
    /// The driver saw no work for a while.
    EnterIdle,
    /// Pseudo-interrupt raised by the caller.
    Interrupt,
    Shutdown,
    TransportFailed(ImapError),
}

/// A sink call the driver delivers outside of any lock.
pub enum Notification {
    Server(Arc<dyn ServerSink>, ServerEvent),
    Folder(Arc<dyn MailFolderSink>, FolderEvent),
    Message(Arc<dyn MessageSink>, MessageEvent),
}

impl Notification {
    pub fn deliver(self) {
        match self {
            Notification::Server(sink, event) => sink.on_server_event(event),
            Notification::Folder(sink, event) => sink.on_folder_event(event),
            Notification::Message(sink, event) => sink.on_message_event(event),
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Server(_, e) => write!(f, "Server({:?})", e),
            Notification::Folder(_, e) => write!(f, "Folder({:?})", e),
            Notification::Message(_, e) => write!(f, "Message({:?})", e),
        }
    }
}

#[derive(Debug)]
pub enum Effect {
    /// Write one line; the driver appends CRLF.
    Send { line: String, sensitive: bool },
    /// Run the TLS handshake on the open socket, then feed `TlsEstablished`.
    UpgradeTls,
    Notify(Notification),
    Finished { request: Uuid, result: RequestResult },
    /// The connection can no longer serve `request`. `retry` asks the pool
    /// to resubmit it on a fresh connection.
    Abort {
        error: ImapError,
        request: Option<ImapRequest>,
        retry: bool,
    },
    /// Work that arrived while busy, handed back to the pool.
    Requeue(ImapRequest),
    /// Authenticated and without work.
    Ready,
    Close,
}

/// Text for trace logs with credentials removed.
pub fn loggable(line: &str, sensitive: bool) -> Cow<'_, str> {
    if !sensitive {
        return Cow::Borrowed(line);
    }
    let mut words = line.splitn(3, ' ');
    match (words.next(), words.next()) {
        (Some(tag), Some(command)) if command.eq_ignore_ascii_case("AUTHENTICATE") => {
            let mechanism = line.split(' ').nth(2).unwrap_or("");
            Cow::Owned(format!("{} {} {} <redacted>", tag, command, mechanism))
        }
        (Some(tag), Some(command)) if command.eq_ignore_ascii_case("LOGIN") => {
            Cow::Owned(format!("{} {} <redacted>", tag, command))
        }
        _ => Cow::Borrowed("<redacted>"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Namespace,
    List { pattern: String, lsub: bool },
    Select { server: String },
    Noop,
    ResyncFlags,
    MyRights { server: String },
    GetQuotaRoot { server: String },
    FetchHeaders { set: String, fields: String },
    FetchSize { uid: u32 },
    FetchChunk { uid: u32, offset: u32 },
    FetchBody { uid: u32 },
    Store { set: String, item: String, flags: String },
    Expunge,
    UidExpunge { set: String },
    Search { criteria: String },
    Copy { set: String, destination: String },
    Move { set: String, destination: String },
    Create { server: String },
    Delete { server: String, canonical: String },
    Rename { from: String, to: String, canonical_from: String, canonical_to: String },
    Subscribe { server: String },
    Unsubscribe { server: String },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Namespace => "NAMESPACE",
            Step::List { lsub: false, .. } => "LIST",
            Step::List { lsub: true, .. } => "LSUB",
            Step::Select { .. } => "SELECT",
            Step::Noop => "NOOP",
            Step::ResyncFlags
            | Step::FetchHeaders { .. }
            | Step::FetchSize { .. }
            | Step::FetchChunk { .. }
            | Step::FetchBody { .. } => "FETCH",
            Step::MyRights { .. } => "MYRIGHTS",
            Step::GetQuotaRoot { .. } => "GETQUOTAROOT",
            Step::Store { .. } => "STORE",
            Step::Expunge | Step::UidExpunge { .. } => "EXPUNGE",
            Step::Search { .. } => "SEARCH",
            Step::Copy { .. } => "COPY",
            Step::Move { .. } => "MOVE",
            Step::Create { .. } => "CREATE",
            Step::Delete { .. } => "DELETE",
            Step::Rename { .. } => "RENAME",
            Step::Subscribe { .. } => "SUBSCRIBE",
            Step::Unsubscribe { .. } => "UNSUBSCRIBE",
        }
    }

    fn command(&self, chunk_size: u32) -> String {
        match self {
            Step::Namespace => "NAMESPACE".to_string(),
            Step::List { pattern, lsub } => {
                format!("{} \"\" {}", if *lsub { "LSUB" } else { "LIST" }, quote(pattern))
            }
            Step::Select { server } => format!("SELECT {}", quote(server)),
            Step::Noop => "NOOP".to_string(),
            Step::ResyncFlags => "UID FETCH 1:* (FLAGS)".to_string(),
            Step::MyRights { server } => format!("MYRIGHTS {}", quote(server)),
            Step::GetQuotaRoot { server } => format!("GETQUOTAROOT {}", quote(server)),
            Step::FetchHeaders { set, fields } => format!(
                "UID FETCH {} (UID FLAGS RFC822.SIZE BODY.PEEK[HEADER.FIELDS ({})])",
                set, fields
            ),
            Step::FetchSize { uid } => format!("UID FETCH {} (UID RFC822.SIZE)", uid),
            Step::FetchChunk { uid, offset } => {
                format!("UID FETCH {} (UID BODY.PEEK[]<{}.{}>)", uid, offset, chunk_size)
            }
            Step::FetchBody { uid } => format!("UID FETCH {} (UID RFC822.SIZE BODY.PEEK[])", uid),
            Step::Store { set, item, flags } => format!("UID STORE {} {} ({})", set, item, flags),
            Step::Expunge => "EXPUNGE".to_string(),
            Step::UidExpunge { set } => format!("UID EXPUNGE {}", set),
            Step::Search { criteria } => format!("UID SEARCH {}", criteria),
            Step::Copy { set, destination } => format!("UID COPY {} {}", set, quote(destination)),
            Step::Move { set, destination } => format!("UID MOVE {} {}", set, quote(destination)),
            Step::Create { server } => format!("CREATE {}", quote(server)),
            Step::Delete { server, .. } => format!("DELETE {}", quote(server)),
            Step::Rename { from, to, .. } => format!("RENAME {} {}", quote(from), quote(to)),
            Step::Subscribe { server } => format!("SUBSCRIBE {}", quote(server)),
            Step::Unsubscribe { server } => format!("UNSUBSCRIBE {}", quote(server)),
        }
    }
}

struct SelectedMailbox {
    canonical: String,
    server: String,
    flag_state: Arc<FlagUidState>,
    folder_sink: Option<Arc<dyn MailFolderSink>>,
    exists: u32,
    uid_next: Option<u32>,
    read_only: bool,
    confirmed: bool,
}

struct ActiveRequest {
    request: ImapRequest,
    steps: VecDeque<Step>,
    current: Option<Step>,
    mailboxes: Vec<MailboxSpec>,
    seen_mailboxes: HashSet<String>,
    headers: Vec<HeaderData>,
    body: Vec<u8>,
    message_size: Option<u32>,
    chunk_received: u32,
    search: Vec<u32>,
}

impl ActiveRequest {
    fn new(request: ImapRequest, steps: VecDeque<Step>) -> Self {
        Self {
            request,
            steps,
            current: None,
            mailboxes: Vec::new(),
            seen_mailboxes: HashSet::new(),
            headers: Vec::new(),
            body: Vec::new(),
            message_size: None,
            chunk_received: 0,
            search: Vec::new(),
        }
    }
}

struct Outstanding {
    tag: String,
    command: &'static str,
}

pub struct ProtocolMachine {
    id: Uuid,
    options: ConnectionOptions,
    registry: Arc<HostSessionRegistry>,
    server_sink: Option<Arc<dyn ServerSink>>,
    negotiator: AuthNegotiator,
    state: ConnectionState,
    capabilities: Capabilities,
    tls_active: bool,
    preauthenticated: bool,
    tag_counter: u32,
    outstanding: Option<Outstanding>,
    logout_tag: Option<String>,
    auth_mechanism: Option<AuthMechanism>,
    exchange: Option<Box<dyn SaslExchange>>,
    selected: Option<SelectedMailbox>,
    active: Option<ActiveRequest>,
    waiting: Option<ImapRequest>,
    chunking_disabled: bool,
    idle_done_sent: bool,
    bye: Option<String>,
    effects: Vec<Effect>,
}

impl fmt::Debug for ProtocolMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolMachine")
            .field("id", &self.id)
            .field("server_key", &self.options.server_key)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("selected", &self.selected_mailbox())
            .finish()
    }
}

impl ProtocolMachine {
    pub fn new(
        options: ConnectionOptions,
        registry: Arc<HostSessionRegistry>,
        server_sink: Option<Arc<dyn ServerSink>>,
        authenticator: Option<Arc<dyn SaslAuthenticator>>,
    ) -> Self {
        let failed = registry
            .failed_auth(&options.server_key)
            .unwrap_or_default();
        let negotiator =
            AuthNegotiator::new(options.allowed_auth.clone(), authenticator).with_failed(failed);
        Self {
            id: Uuid::new_v4(),
            tls_active: options.tls_policy == TlsPolicy::Implicit,
            options,
            registry,
            server_sink,
            negotiator,
            state: ConnectionState::Connecting,
            capabilities: Capabilities::empty(),
            preauthenticated: false,
            tag_counter: 0,
            outstanding: None,
            logout_tag: None,
            auth_mechanism: None,
            exchange: None,
            selected: None,
            active: None,
            waiting: None,
            chunking_disabled: false,
            idle_done_sent: false,
            bye: None,
            effects: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn selected_mailbox(&self) -> Option<&str> {
        self.selected
            .as_ref()
            .filter(|s| s.confirmed)
            .map(|s| s.canonical.as_str())
    }

    /// A request is running or waiting to run.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.waiting.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// The server owes us a line: a greeting, a tagged reply, or IDLE pushes.
    pub fn awaiting_server(&self) -> bool {
        self.outstanding.is_some()
            || self.logout_tag.is_some()
            || matches!(
                self.state,
                ConnectionState::AwaitingGreeting | ConnectionState::Idling
            )
    }

    pub fn chunking_disabled(&self) -> bool {
        self.chunking_disabled
    }

    pub fn step(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Connected => {
                debug!("[{}] connected to {}", self.id, self.options.host);
                self.state = ConnectionState::AwaitingGreeting;
            }
            Event::Response(response) => self.on_response(response),
            Event::TlsEstablished => self.on_tls_established(),
            Event::Work(request) => self.on_work(request),
            Event::EnterIdle => self.on_enter_idle(),
            Event::Interrupt => self.on_interrupt(ImapError::Interrupted),
            Event::Shutdown => self.on_interrupt(ImapError::Interrupted),
            Event::TransportFailed(err) => self.on_transport_failed(err),
        }
        std::mem::take(&mut self.effects)
    }

    fn host<T: Default>(&self, result: HostSessionResult<T>) -> T {
        result.unwrap_or_else(|e| {
            warn!("[{}] {}", self.id, e);
            T::default()
        })
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{}", self.tag_counter)
    }

    fn send_command(&mut self, command: String, name: &'static str, sensitive: bool) -> String {
        let tag = self.next_tag();
        self.effects.push(Effect::Send {
            line: format!("{} {}", tag, command),
            sensitive,
        });
        self.outstanding = Some(Outstanding {
            tag: tag.clone(),
            command: name,
        });
        tag
    }

    fn send_raw(&mut self, line: String, sensitive: bool) {
        self.effects.push(Effect::Send { line, sensitive });
    }

    fn notify_server(&mut self, event: ServerEvent) {
        if let Some(sink) = &self.server_sink {
            self.effects
                .push(Effect::Notify(Notification::Server(Arc::clone(sink), event)));
        }
    }

    fn notify_folder(&mut self, event: FolderEvent) {
        let sink = self
            .selected
            .as_ref()
            .and_then(|s| s.folder_sink.clone())
            .or_else(|| self.active.as_ref().and_then(|a| a.request.folder_sink.clone()));
        if let Some(sink) = sink {
            self.effects
                .push(Effect::Notify(Notification::Folder(sink, event)));
        }
    }

    fn notify_message(&mut self, event: MessageEvent) {
        if let Some(sink) = self.active.as_ref().and_then(|a| a.request.message_sink.clone()) {
            self.effects
                .push(Effect::Notify(Notification::Message(sink, event)));
        }
    }

    fn on_response(&mut self, response: Response) {
        match response {
            Response::Continuation(text) => self.on_continuation(&text),
            Response::Untagged(untagged) => self.on_untagged(untagged),
            Response::Tagged { tag, status } => {
                if self.logout_tag.as_deref() == Some(tag.as_str()) {
                    debug!("[{}] logged out", self.id);
                    self.state = ConnectionState::Closed;
                    self.effects.push(Effect::Close);
                    return;
                }
                match &self.outstanding {
                    Some(out) if out.tag == tag => {
                        let command = out.command;
                        self.outstanding = None;
                        self.on_tagged(command, status);
                    }
                    _ => warn!("[{}] ignoring response for unknown tag {}", self.id, tag),
                }
            }
        }
    }

    fn on_continuation(&mut self, text: &str) {
        match self.state {
            ConnectionState::Authenticating => self.on_auth_challenge(text),
            ConnectionState::Idling => debug!("[{}] idling: {}", self.id, text),
            _ => trace!("[{}] unexpected continuation: {}", self.id, text),
        }
    }

    fn on_untagged(&mut self, untagged: Untagged) {
        match untagged {
            Untagged::Status(status) => self.on_untagged_status(status),
            Untagged::Capability(tokens) => {
                self.capabilities = Capabilities::from_tokens(tokens.iter().map(String::as_str));
            }
            Untagged::Exists(count) => {
                if let Some(selected) = self.selected.as_mut() {
                    selected.exists = count;
                    self.notify_folder(FolderEvent::Exists(count));
                }
            }
            Untagged::Recent(_) => {}
            Untagged::Expunge(seq) => {
                if let Some(selected) = self.selected.as_mut() {
                    let uid = selected.flag_state.expunge_sequence(seq);
                    selected.exists = selected.exists.saturating_sub(1);
                    self.notify_folder(FolderEvent::Expunged { seq, uid });
                }
            }
            Untagged::Fetch { seq, data } => self.on_fetch(seq, data),
            Untagged::Flags(flags) => debug!("[{}] mailbox flags {:?}", self.id, flags),
            Untagged::List {
                kind,
                attributes,
                delimiter,
                name,
            } => self.on_list(kind, &attributes, delimiter, &name),
            Untagged::Namespace(namespaces) => {
                let key = self.options.server_key.clone();
                for ns in namespaces {
                    debug!("[{}] server namespace {:?} {:?}", self.id, ns.ns_type, ns.prefix);
                    let result = self.registry.add_namespace(&key, ns);
                    self.host(result);
                }
            }
            Untagged::Search(uids) => {
                if let Some(active) = self.active.as_mut() {
                    active.search.extend(uids);
                }
            }
            Untagged::MyRights { mailbox, rights } => {
                let canonical = self.canonical(&mailbox, None);
                self.notify_server(ServerEvent::AclUpdated {
                    mailbox: canonical,
                    rights,
                });
            }
            Untagged::Quota { root, resources } => {
                let mailbox = self
                    .selected
                    .as_ref()
                    .map(|s| s.canonical.clone())
                    .unwrap_or_default();
                let resources = resources
                    .into_iter()
                    .map(|(name, usage, limit)| QuotaResource { name, usage, limit })
                    .collect();
                self.notify_server(ServerEvent::QuotaUpdated {
                    mailbox,
                    root,
                    resources,
                });
            }
            other => trace!("[{}] unhandled untagged {:?}", self.id, other),
        }
    }

    fn on_untagged_status(&mut self, status: StatusResponse) {
        if self.state == ConnectionState::AwaitingGreeting {
            self.on_greeting(status);
            return;
        }
        if status.status == Status::Bye {
            if self.state != ConnectionState::Closing {
                warn!("[{}] server BYE: {}", self.id, status.text);
            }
            self.bye = Some(status.text);
            return;
        }
        match status.code {
            Some(ResponseCode::Alert) => self.notify_server(ServerEvent::Alert(status.text)),
            Some(ResponseCode::Capability(tokens)) => {
                self.capabilities = Capabilities::from_tokens(tokens.iter().map(String::as_str));
            }
            Some(ResponseCode::UidValidity(validity)) => {
                if let Some(selected) = &self.selected {
                    selected.flag_state.set_uid_validity(validity);
                    self.notify_folder(FolderEvent::UidValidity(validity));
                }
            }
            Some(ResponseCode::UidNext(next)) => {
                if let Some(selected) = self.selected.as_mut() {
                    selected.uid_next = Some(next);
                }
            }
            Some(ResponseCode::PermanentFlags(flags)) => {
                if let Some(selected) = &self.selected {
                    selected
                        .flag_state
                        .set_permanent_flags(flags.iter().map(String::as_str));
                    let supported = selected.flag_state.supported_user_flags();
                    self.notify_folder(FolderEvent::PermanentFlags(supported));
                }
            }
            _ => trace!("[{}] untagged {:?}: {}", self.id, status.status, status.text),
        }
    }

    fn on_greeting(&mut self, status: StatusResponse) {
        match status.status {
            Status::Bye => {
                self.state = ConnectionState::Closed;
                let request = self.take_request();
                self.effects.push(Effect::Abort {
                    error: ImapError::Bye(status.text),
                    request,
                    retry: false,
                });
                self.effects.push(Effect::Close);
                return;
            }
            Status::PreAuth => self.preauthenticated = true,
            _ => {}
        }
        info!("[{}] greeting: {}", self.id, status.text);
        match status.code {
            Some(ResponseCode::Capability(tokens)) if !tokens.is_empty() => {
                self.capabilities = Capabilities::from_tokens(tokens.iter().map(String::as_str));
                self.after_capabilities();
            }
            _ => self.query_capabilities(false),
        }
    }

    fn query_capabilities(&mut self, post_tls: bool) {
        self.state = ConnectionState::QueryingCapability { post_tls };
        self.send_command("CAPABILITY".to_string(), "CAPABILITY", false);
    }

    fn after_capabilities(&mut self) {
        if !self.tls_active && !self.preauthenticated {
            let offered = self.capabilities.contains(Capabilities::STARTTLS);
            match self.options.tls_policy {
                TlsPolicy::Try | TlsPolicy::Always if offered => {
                    self.state = ConnectionState::StartingTls;
                    self.send_command("STARTTLS".to_string(), "STARTTLS", false);
                    return;
                }
                TlsPolicy::Always => {
                    error!("[{}] server does not offer STARTTLS", self.id);
                    self.fail_connection(ImapError::TlsRequired);
                    return;
                }
                _ => {}
            }
        }
        if self.preauthenticated {
            self.on_authenticated();
        } else {
            self.begin_auth();
        }
    }

    fn on_tls_established(&mut self) {
        if self.state != ConnectionState::StartingTls {
            warn!("[{}] TLS established in state {:?}", self.id, self.state);
        }
        self.tls_active = true;
        // Capabilities seen before the handshake are not trusted.
        self.capabilities = Capabilities::empty();
        self.query_capabilities(true);
    }

    fn begin_auth(&mut self) {
        loop {
            let mechanism = match self
                .negotiator
                .next_mechanism(self.capabilities, &self.options.credentials)
            {
                Ok(mechanism) => mechanism,
                Err(reason) => {
                    error!("[{}] authentication exhausted: {}", self.id, reason);
                    self.auth_mechanism = None;
                    self.fail_connection(ImapError::AuthExhausted(reason));
                    return;
                }
            };
            self.state = ConnectionState::Authenticating;
            self.auth_mechanism = Some(mechanism);
            info!("[{}] authenticating with {}", self.id, mechanism);

            if !mechanism.uses_authenticate(self.capabilities) {
                let credentials = &self.options.credentials;
                let command = format!(
                    "LOGIN {} {}",
                    quote(&credentials.username),
                    quote(credentials.password.as_deref().unwrap_or_default())
                );
                self.send_command(command, "LOGIN", true);
                return;
            }

            let mut exchange =
                match self
                    .negotiator
                    .begin(mechanism, &self.options.host, &self.options.credentials)
                {
                    Ok(exchange) => exchange,
                    Err(e) => {
                        warn!("[{}] cannot start {}: {}", self.id, mechanism, e);
                        self.mechanism_failed(mechanism);
                        continue;
                    }
                };
            let initial = if self.capabilities.contains(Capabilities::SASL_IR) {
                exchange.initial_response()
            } else {
                None
            };
            let command = match initial {
                Some(data) if data.is_empty() => format!("AUTHENTICATE {} =", mechanism),
                Some(data) => format!("AUTHENTICATE {} {}", mechanism, STANDARD.encode(data)),
                None => format!("AUTHENTICATE {}", mechanism),
            };
            self.exchange = Some(exchange);
            self.send_command(command, "AUTHENTICATE", true);
            return;
        }
    }

    /// Failures outlive this connection until the pool resets them.
    fn mechanism_failed(&mut self, mechanism: AuthMechanism) {
        self.negotiator.mark_failed(mechanism);
        let result = self
            .registry
            .record_failed_auth(&self.options.server_key, mechanism);
        self.host(result);
    }

    fn on_auth_challenge(&mut self, text: &str) {
        let Some(exchange) = self.exchange.as_mut() else {
            warn!("[{}] challenge without a SASL exchange", self.id);
            self.send_raw("*".to_string(), false);
            return;
        };
        let challenge = if text.is_empty() {
            Vec::new()
        } else {
            STANDARD
                .decode(text)
                .unwrap_or_else(|_| text.as_bytes().to_vec())
        };
        match exchange.respond(&challenge) {
            Ok(reply) => self.send_raw(STANDARD.encode(reply), true),
            Err(e) => {
                warn!("[{}] SASL exchange failed: {}", self.id, e);
                self.send_raw("*".to_string(), false);
            }
        }
    }

    fn on_authenticated(&mut self) {
        self.exchange = None;
        self.state = ConnectionState::Authenticated;
        let key = self.options.server_key.clone();
        let result = self.registry.set_capabilities(&key, self.capabilities);
        self.host(result);
        if let Some(password) = self.options.credentials.password.clone() {
            let result = self.registry.set_cached_password(&key, &password);
            self.host(result);
        }
        self.notify_server(ServerEvent::CapabilitiesChanged(self.capabilities));
        match self.waiting.take() {
            Some(request) => self.start_request(request),
            None => self.effects.push(Effect::Ready),
        }
    }

    fn on_tagged(&mut self, command: &'static str, status: StatusResponse) {
        let ok = status.status == Status::Ok;
        match self.state {
            ConnectionState::QueryingCapability { .. } => {
                if ok {
                    self.after_capabilities();
                } else {
                    self.fail_connection(protocol_error(command, status));
                }
            }
            ConnectionState::StartingTls => {
                if ok {
                    self.effects.push(Effect::UpgradeTls);
                } else if self.options.tls_policy == TlsPolicy::Always {
                    self.fail_connection(ImapError::TlsRequired);
                } else {
                    warn!("[{}] STARTTLS refused, continuing without TLS", self.id);
                    self.begin_auth();
                }
            }
            ConnectionState::Authenticating => {
                if ok {
                    if let Some(ResponseCode::Capability(tokens)) = &status.code {
                        self.capabilities =
                            Capabilities::from_tokens(tokens.iter().map(String::as_str));
                    }
                    info!(
                        "[{}] authenticated with {}",
                        self.id,
                        self.auth_mechanism.map_or("?", AuthMechanism::name)
                    );
                    self.on_authenticated();
                } else {
                    self.exchange = None;
                    if let Some(mechanism) = self.auth_mechanism.take() {
                        debug!("[{}] {} rejected: {}", self.id, mechanism, status.text);
                        self.mechanism_failed(mechanism);
                    }
                    self.begin_auth();
                }
            }
            ConnectionState::Idling => {
                debug!("[{}] IDLE finished", self.id);
                self.idle_done_sent = false;
                self.state = ConnectionState::Selected;
                if let Some(request) = self.waiting.take() {
                    self.start_request(request);
                }
            }
            ConnectionState::Selecting | ConnectionState::Executing(_) => {
                self.on_step_done(command, status)
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
            other => warn!("[{}] tagged {} in state {:?}", self.id, command, other),
        }
    }

    fn canonical(&self, server_name: &str, delimiter: Option<char>) -> String {
        let result = self
            .registry
            .canonical_path_for(&self.options.server_key, server_name, delimiter);
        match result {
            Ok(path) => path,
            Err(e) => {
                warn!("[{}] {}", self.id, e);
                server_name.to_string()
            }
        }
    }

    fn on_fetch(&mut self, seq: u32, data: FetchData) {
        let mut parsed_flags = None;
        if let (Some(flags), Some(selected)) = (&data.flags, &self.selected) {
            let uid = data.uid.or_else(|| selected.flag_state.uid_at(seq));
            match uid {
                Some(uid) => {
                    let (bits, keywords) =
                        MessageFlags::from_server_names(flags.iter().map(String::as_str));
                    selected.flag_state.set_flags_at(seq, uid, bits);
                    selected.flag_state.set_custom_flags(uid, keywords.clone());
                    parsed_flags = Some((bits, keywords.clone()));
                    self.notify_folder(FolderEvent::FlagsChanged {
                        uid,
                        flags: bits,
                        keywords,
                    });
                }
                None => debug!("[{}] FLAGS for unknown message {}", self.id, seq),
            }
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        let body = data
            .sections
            .iter()
            .find_map(|s| s.data.clone());
        match active.current.clone() {
            Some(Step::FetchHeaders { .. }) => {
                let Some(uid) = data.uid else {
                    return;
                };
                let (flags, keywords) = parsed_flags.unwrap_or_default();
                let header = body.unwrap_or_default();
                active.headers.push(HeaderData {
                    uid,
                    flags,
                    keywords,
                    size: data.size,
                    header: header.clone(),
                });
                self.notify_message(MessageEvent::HeaderAvailable {
                    uid,
                    flags,
                    size: data.size,
                    header,
                });
            }
            Some(Step::FetchSize { .. }) => {
                if data.size.is_some() {
                    active.message_size = data.size;
                }
            }
            Some(Step::FetchChunk { uid, offset }) => {
                if data.uid.map_or(false, |u| u != uid) {
                    return;
                }
                let Some(chunk) = body else {
                    return;
                };
                active.chunk_received += chunk.len() as u32;
                active.body.extend_from_slice(&chunk);
                let total = active.message_size.unwrap_or(0);
                let current = offset + active.chunk_received;
                self.notify_message(MessageEvent::BodyChunk {
                    uid,
                    offset,
                    data: chunk,
                });
                self.notify_message(MessageEvent::Progress { current, total });
            }
            Some(Step::FetchBody { uid }) => {
                if data.uid.map_or(false, |u| u != uid) {
                    return;
                }
                if data.size.is_some() {
                    active.message_size = data.size;
                }
                if let Some(body) = body {
                    active.body = body;
                }
            }
            _ => {}
        }
    }

    fn on_list(&mut self, kind: ListKind, attributes: &[String], delimiter: Option<char>, name: &str) {
        let key = self.options.server_key.clone();
        if let Some(delimiter) = delimiter {
            let result = self
                .registry
                .confirm_namespace_delimiter(&key, name, delimiter);
            if self.host(result) {
                debug!("[{}] confirmed delimiter {:?} for {}", self.id, delimiter, name);
            }
        }

        let discovering = self
            .active
            .as_ref()
            .map_or(false, |a| a.request.kind == RequestKind::Discover);
        if !discovering {
            return;
        }

        let mut flags = attributes
            .iter()
            .fold(MailboxFlags::empty(), |acc, attr| acc | MailboxFlags::from_attribute(attr));
        if kind == ListKind::Lsub {
            flags.insert(MailboxFlags::SUBSCRIBED);
        }
        if name.eq_ignore_ascii_case("INBOX") {
            flags.insert(MailboxFlags::INBOX);
        }
        let namespace = self.host(self.registry.match_server_namespace(&key, name));
        if let Some(ns) = &namespace {
            flags.insert(MailboxFlags::for_namespace_type(ns.ns_type));
        }
        if self.host(self.registry.folder_is_namespace(&key, name)).is_some() {
            flags.insert(MailboxFlags::NAMESPACE | MailboxFlags::NOSELECT);
        }
        let canonical = self.canonical(name, delimiter);
        match self.host(self.registry.trash_folder(&key)) {
            Some(trash) if trash.eq_ignore_ascii_case(&canonical) => flags.insert(MailboxFlags::TRASH),
            None if flags.contains(MailboxFlags::TRASH) => {
                let result = self.registry.set_trash_folder(&key, &canonical);
                self.host(result);
            }
            _ => {}
        }
        let spec = MailboxSpec {
            server_path: name.to_string(),
            canonical_path: canonical,
            delimiter,
            flags,
            namespace_type: namespace.map(|ns| ns.ns_type),
            owner: self.host(self.registry.owner_of(&key, name)),
        };

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.seen_mailboxes.insert(spec.server_path.clone()) {
            // Same mailbox from another pattern; LSUB only adds the flag.
            if let Some(existing) = active
                .mailboxes
                .iter_mut()
                .find(|m| m.server_path == spec.server_path)
            {
                existing.flags.insert(spec.flags);
            }
            return;
        }
        active.mailboxes.push(spec.clone());
        self.notify_server(ServerEvent::MailboxDiscovered(spec));
    }

    fn on_work(&mut self, mut request: ImapRequest) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => {
                self.effects.push(Effect::Requeue(request));
                return;
            }
            _ if self.is_busy() => {
                warn!("[{}] busy, handing {} back", self.id, request.kind.name());
                self.effects.push(Effect::Requeue(request));
                return;
            }
            _ => {}
        }
        request.attempts += 1;
        match self.state {
            ConnectionState::Idling => {
                if !self.idle_done_sent {
                    self.idle_done_sent = true;
                    self.send_raw("DONE".to_string(), false);
                }
                self.waiting = Some(request);
            }
            ConnectionState::Authenticated | ConnectionState::Selected => {
                self.start_request(request)
            }
            _ => {
                debug!("[{}] holding {} until authenticated", self.id, request.kind.name());
                self.waiting = Some(request);
            }
        }
    }

    fn on_enter_idle(&mut self) {
        let can_idle = self.state == ConnectionState::Selected
            && !self.is_busy()
            && self.options.use_idle
            && self.capabilities.contains(Capabilities::IDLE);
        if can_idle {
            self.state = ConnectionState::Idling;
            self.idle_done_sent = false;
            self.send_command("IDLE".to_string(), "IDLE", false);
        }
    }

    fn resolve(&self, canonical: &str) -> Result<String, ImapError> {
        Ok(self
            .registry
            .server_path_for(&self.options.server_key, canonical)?)
    }

    fn header_fields(&self) -> String {
        let mut fields: Vec<&str> = DEFAULT_HEADER_FIELDS.to_vec();
        for extra in &self.options.extra_headers {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(extra)) {
                fields.push(extra);
            }
        }
        fields.join(" ")
    }

    fn list_steps(&self) -> Vec<Step> {
        let key = &self.options.server_key;
        let lsub = self.host(self.registry.using_subscription(key));
        let namespaces = self.host(self.registry.namespaces(key));
        let mut patterns: Vec<String> = namespaces
            .iter()
            .map(|ns| format!("{}*", ns.prefix))
            .collect();
        if patterns.is_empty() {
            patterns.push("*".to_string());
        }
        if !patterns.iter().any(|p| p == "*") {
            patterns.insert(0, "INBOX".to_string());
        }
        patterns.dedup();
        patterns
            .into_iter()
            .map(|pattern| Step::List { pattern, lsub })
            .collect()
    }

    fn plan(&self, request: &ImapRequest) -> Result<VecDeque<Step>, ImapError> {
        let mut steps = VecDeque::new();
        let caps = self.capabilities;

        if request.needs_selected() {
            let folder = request
                .folder
                .as_deref()
                .ok_or_else(|| ImapError::RequiresFolderSelection(request.kind.name().into()))?;
            let server = self.resolve(folder)?;
            let already = self.selected_mailbox() == Some(folder);
            if already {
                if request.kind == RequestKind::Select {
                    steps.push_back(Step::Noop);
                    steps.push_back(Step::ResyncFlags);
                }
            } else {
                steps.push_back(Step::Select {
                    server: server.clone(),
                });
                steps.push_back(Step::ResyncFlags);
                if request.kind == RequestKind::Select {
                    if caps.contains(Capabilities::ACL) {
                        steps.push_back(Step::MyRights {
                            server: server.clone(),
                        });
                    }
                    if caps.contains(Capabilities::QUOTA) {
                        steps.push_back(Step::GetQuotaRoot { server });
                    }
                }
            }
        }

        match &request.kind {
            RequestKind::Discover => {
                let discovered =
                    self.host(self.registry.namespaces_discovered(&self.options.server_key));
                if caps.contains(Capabilities::NAMESPACE) && !discovered {
                    steps.push_back(Step::Namespace);
                } else {
                    steps.extend(self.list_steps());
                }
            }
            RequestKind::Select | RequestKind::Noop => {
                if steps.is_empty() {
                    steps.push_back(Step::Noop);
                }
            }
            RequestKind::FetchHeaders { uids } => {
                if !uids.is_empty() {
                    steps.push_back(Step::FetchHeaders {
                        set: uid_set(uids),
                        fields: self.header_fields(),
                    });
                }
            }
            RequestKind::FetchMessage { uid } => {
                if self.options.fetch_by_chunks && !self.chunking_disabled {
                    steps.push_back(Step::FetchSize { uid: *uid });
                } else {
                    steps.push_back(Step::FetchBody { uid: *uid });
                }
            }
            RequestKind::Store {
                uids,
                operation,
                flags,
                keywords,
            } => {
                let mut names: Vec<String> =
                    flags.server_names().into_iter().map(str::to_string).collect();
                names.extend(keywords.iter().cloned());
                steps.push_back(Step::Store {
                    set: uid_set(uids),
                    item: operation.as_item().to_string(),
                    flags: names.join(" "),
                });
            }
            RequestKind::Expunge { uids } => match uids {
                Some(uids) if !uids.is_empty() && caps.contains(Capabilities::UIDPLUS) => {
                    steps.push_back(Step::UidExpunge { set: uid_set(uids) })
                }
                _ => steps.push_back(Step::Expunge),
            },
            RequestKind::Search { criteria } => steps.push_back(Step::Search {
                criteria: criteria.clone(),
            }),
            RequestKind::Copy { uids, destination } => steps.push_back(Step::Copy {
                set: uid_set(uids),
                destination: self.resolve(destination)?,
            }),
            RequestKind::Move { uids, destination } => {
                let set = uid_set(uids);
                let destination = self.resolve(destination)?;
                if caps.contains(Capabilities::MOVE) {
                    steps.push_back(Step::Move { set, destination });
                } else {
                    steps.push_back(Step::Copy {
                        set: set.clone(),
                        destination,
                    });
                    steps.push_back(Step::Store {
                        set: set.clone(),
                        item: "+FLAGS.SILENT".to_string(),
                        flags: "\\Deleted".to_string(),
                    });
                    if caps.contains(Capabilities::UIDPLUS) {
                        steps.push_back(Step::UidExpunge { set });
                    } else {
                        steps.push_back(Step::Expunge);
                    }
                }
            }
            RequestKind::Create { path } => steps.push_back(Step::Create {
                server: self.resolve(path)?,
            }),
            RequestKind::Delete { path } => steps.push_back(Step::Delete {
                server: self.resolve(path)?,
                canonical: path.clone(),
            }),
            RequestKind::Rename { from, to } => steps.push_back(Step::Rename {
                from: self.resolve(from)?,
                to: self.resolve(to)?,
                canonical_from: from.clone(),
                canonical_to: to.clone(),
            }),
            RequestKind::Subscribe { path } => steps.push_back(Step::Subscribe {
                server: self.resolve(path)?,
            }),
            RequestKind::Unsubscribe { path } => steps.push_back(Step::Unsubscribe {
                server: self.resolve(path)?,
            }),
        }
        Ok(steps)
    }

    fn start_request(&mut self, request: ImapRequest) {
        debug!(
            "[{}] starting {} (attempt {})",
            self.id,
            request.kind.name(),
            request.attempts
        );
        let steps = match self.plan(&request) {
            Ok(steps) => steps,
            Err(e) => {
                self.effects.push(Effect::Finished {
                    request: request.id,
                    result: Err(e),
                });
                self.effects.push(Effect::Ready);
                return;
            }
        };
        if request.kind == RequestKind::Discover {
            let key = self.options.server_key.clone();
            let result = self.registry.set_discovery_in_progress(&key, true);
            self.host(result);
        }
        self.active = Some(ActiveRequest::new(request, steps));
        self.advance();
    }

    /// Sends the next step or completes the request.
    fn advance(&mut self) {
        let next = self.active.as_mut().and_then(|a| a.steps.pop_front());
        let Some(step) = next else {
            self.complete_request();
            return;
        };

        if let Step::Select { server } = &step {
            let request = self.active.as_ref().map(|a| &a.request);
            let canonical = request.and_then(|r| r.folder.clone()).unwrap_or_default();
            if let Some(previous) = self.selected.take() {
                if let Some(sink) = previous.folder_sink {
                    self.effects.push(Effect::Notify(Notification::Folder(
                        sink,
                        FolderEvent::Released(previous.canonical),
                    )));
                }
            }
            let flag_state = request
                .and_then(|r| r.flag_state.clone())
                .unwrap_or_else(|| Arc::new(FlagUidState::new()));
            let folder_sink = request.and_then(|r| r.folder_sink.clone());
            self.selected = Some(SelectedMailbox {
                canonical,
                server: server.clone(),
                flag_state,
                folder_sink,
                exists: 0,
                uid_next: None,
                read_only: false,
                confirmed: false,
            });
            self.state = ConnectionState::Selecting;
        } else {
            let name = self
                .active
                .as_ref()
                .map_or("request", |a| a.request.kind.name());
            self.state = ConnectionState::Executing(name);
        }

        let chunk_size = self.options.chunk_size;
        let command = step.command(chunk_size);
        let name = step.name();
        if let Some(active) = self.active.as_mut() {
            if matches!(step, Step::FetchChunk { .. }) {
                active.chunk_received = 0;
            }
            active.current = Some(step);
        }
        self.send_command(command, name, false);
    }

    fn on_step_done(&mut self, command: &'static str, status: StatusResponse) {
        let Some(step) = self.active.as_mut().and_then(|a| a.current.take()) else {
            warn!("[{}] tagged {} without a running step", self.id, command);
            return;
        };

        if status.status != Status::Ok {
            self.on_step_failed(step, status);
            return;
        }

        match step {
            Step::Select { .. } => {
                if let Some(selected) = self.selected.as_mut() {
                    selected.confirmed = true;
                    selected.read_only = status.code == Some(ResponseCode::ReadOnly);
                    let canonical = selected.canonical.clone();
                    self.notify_folder(FolderEvent::VerifiedOnline(canonical));
                }
            }
            Step::Namespace => self.commit_namespaces(),
            Step::FetchSize { uid } => {
                let size = self.active.as_ref().and_then(|a| a.message_size);
                let next = match size {
                    Some(size) if size > self.options.chunk_threshold => {
                        Step::FetchChunk { uid, offset: 0 }
                    }
                    _ => Step::FetchBody { uid },
                };
                if let Some(active) = self.active.as_mut() {
                    active.steps.push_front(next);
                }
            }
            Step::FetchChunk { uid, offset } => {
                let chunk_size = self.options.chunk_size;
                if let Some(active) = self.active.as_mut() {
                    let received = active.chunk_received;
                    let total = active.message_size.unwrap_or(u32::MAX);
                    if received == 0 && offset < total {
                        warn!("[{}] empty chunk at {} for uid {}", self.id, offset, uid);
                        self.chunking_disabled = true;
                        active.body.clear();
                        active.steps.push_front(Step::FetchBody { uid });
                    } else if received >= chunk_size && offset + received < total {
                        active.steps.push_front(Step::FetchChunk {
                            uid,
                            offset: offset + received,
                        });
                    }
                }
            }
            Step::Delete { canonical, .. } => {
                if self.selected_mailbox() == Some(canonical.as_str()) {
                    self.selected = None;
                }
                self.notify_folder(FolderEvent::Deleted(canonical));
            }
            Step::Rename {
                canonical_from,
                canonical_to,
                ..
            } => {
                self.notify_folder(FolderEvent::Renamed {
                    from: canonical_from,
                    to: canonical_to,
                });
            }
            _ => {}
        }
        self.advance();
    }

    fn on_step_failed(&mut self, step: Step, status: StatusResponse) {
        match step {
            Step::FetchChunk { uid, offset } => {
                warn!(
                    "[{}] chunk at {} failed ({}), fetching uid {} whole",
                    self.id, offset, status.text, uid
                );
                self.chunking_disabled = true;
                if let Some(active) = self.active.as_mut() {
                    active.body.clear();
                    active.steps.push_front(Step::FetchBody { uid });
                }
                self.advance();
            }
            Step::Namespace => {
                debug!("[{}] NAMESPACE failed: {}", self.id, status.text);
                self.commit_namespaces();
                self.advance();
            }
            Step::MyRights { .. } | Step::GetQuotaRoot { .. } | Step::List { .. } => {
                debug!("[{}] {} failed: {}", self.id, step.name(), status.text);
                self.advance();
            }
            Step::Select { .. } => {
                self.selected = None;
                self.fail_request(protocol_error(step.name(), status));
            }
            _ => self.fail_request(protocol_error(step.name(), status)),
        }
    }

    fn commit_namespaces(&mut self) {
        let key = self.options.server_key.clone();
        let namespaces = self.host(self.registry.commit_namespaces(&key));
        self.notify_server(ServerEvent::NamespacesCommitted(namespaces));
        let steps = self.list_steps();
        if let Some(active) = self.active.as_mut() {
            for step in steps.into_iter().rev() {
                active.steps.push_front(step);
            }
        }
    }

    fn idle_state(&self) -> ConnectionState {
        if self.selected_mailbox().is_some() {
            ConnectionState::Selected
        } else {
            ConnectionState::Authenticated
        }
    }

    fn finish_discovery(&mut self, succeeded: bool) {
        let key = self.options.server_key.clone();
        let result = self.registry.set_discovery_in_progress(&key, false);
        self.host(result);
        if succeeded {
            let result = self.registry.set_have_ever_discovered_folders(&key, true);
            self.host(result);
        }
        self.notify_server(ServerEvent::DiscoveryDone { succeeded });
    }

    fn complete_request(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let kind = active.request.kind.clone();
        let outcome = match &kind {
            RequestKind::Discover => {
                // Notifications route through `self.active`, so restore it briefly.
                let mailboxes = active.mailboxes.clone();
                self.active = Some(active);
                self.finish_discovery(true);
                let active = self.active.take();
                return self.deliver(active, Ok(RequestOutcome::Mailboxes(mailboxes)));
            }
            RequestKind::Select => {
                let selected = self.selected.as_ref();
                RequestOutcome::Selected {
                    exists: selected.map_or(0, |s| s.exists),
                    uid_validity: selected.and_then(|s| s.flag_state.uid_validity()),
                    uid_next: selected.and_then(|s| s.uid_next),
                    read_only: selected.map_or(false, |s| s.read_only),
                }
            }
            RequestKind::FetchHeaders { .. } => RequestOutcome::Headers(active.headers.clone()),
            RequestKind::FetchMessage { uid } => {
                let uid = *uid;
                let data = active.body.clone();
                self.active = Some(active);
                self.notify_message(MessageEvent::MessageComplete {
                    uid,
                    size: data.len(),
                });
                let active = self.active.take();
                return self.deliver(active, Ok(RequestOutcome::Message { uid, data }));
            }
            RequestKind::Search { .. } => {
                let mut hits = active.search.clone();
                hits.sort_unstable();
                hits.dedup();
                self.active = Some(active);
                self.notify_message(MessageEvent::SearchHits(hits.clone()));
                let active = self.active.take();
                return self.deliver(active, Ok(RequestOutcome::SearchResults(hits)));
            }
            _ => RequestOutcome::Completed,
        };
        self.deliver(Some(active), Ok(outcome));
    }

    fn fail_request(&mut self, error: ImapError) {
        warn!("[{}] request failed: {}", self.id, error);
        let discovering = self
            .active
            .as_ref()
            .map_or(false, |a| a.request.kind == RequestKind::Discover);
        if discovering {
            self.finish_discovery(false);
        }
        let active = self.active.take();
        self.deliver(active, Err(error));
    }

    fn deliver(&mut self, active: Option<ActiveRequest>, result: RequestResult) {
        if let Some(active) = active {
            self.effects.push(Effect::Finished {
                request: active.request.id,
                result,
            });
        }
        self.state = self.idle_state();
        match self.waiting.take() {
            Some(request) => self.start_request(request),
            None => self.effects.push(Effect::Ready),
        }
    }

    fn take_request(&mut self) -> Option<ImapRequest> {
        self.active
            .take()
            .map(|a| a.request)
            .or_else(|| self.waiting.take())
    }

    /// Reports `error` to the request (never retried) and logs out.
    fn fail_connection(&mut self, error: ImapError) {
        let request = self.take_request();
        self.effects.push(Effect::Abort {
            error,
            request,
            retry: false,
        });
        self.logout();
    }

    fn logout(&mut self) {
        self.state = ConnectionState::Closing;
        let tag = self.next_tag();
        self.logout_tag = Some(tag.clone());
        self.effects.push(Effect::Send {
            line: format!("{} LOGOUT", tag),
            sensitive: false,
        });
    }

    fn on_interrupt(&mut self, error: ImapError) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => return,
            ConnectionState::Connecting | ConnectionState::AwaitingGreeting => {
                if let Some(request) = self.take_request() {
                    self.effects.push(Effect::Finished {
                        request: request.id,
                        result: Err(error),
                    });
                }
                self.state = ConnectionState::Closed;
                self.effects.push(Effect::Close);
                return;
            }
            ConnectionState::Idling if !self.idle_done_sent => {
                self.idle_done_sent = true;
                self.send_raw("DONE".to_string(), false);
            }
            ConnectionState::Authenticating if self.exchange.is_some() => {
                self.exchange = None;
                self.send_raw("*".to_string(), false);
            }
            _ => {}
        }
        if self.active.as_ref().map_or(false, |a| a.request.kind == RequestKind::Discover) {
            self.finish_discovery(false);
        }
        if let Some(request) = self.take_request() {
            info!("[{}] interrupting {}", self.id, request.kind.name());
            self.effects.push(Effect::Finished {
                request: request.id,
                result: Err(error),
            });
        }
        self.logout();
    }

    fn on_transport_failed(&mut self, error: ImapError) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            self.state = ConnectionState::Closed;
            self.effects.push(Effect::Close);
            return;
        }
        let error = match self.bye.take() {
            Some(text) => ImapError::Bye(text),
            None => error,
        };
        error!("[{}] connection lost in {:?}: {}", self.id, self.state, error);
        if self.active.as_ref().map_or(false, |a| a.request.kind == RequestKind::Discover) {
            self.finish_discovery(false);
        }
        let request = self.take_request();
        // One automatic retry on a fresh connection.
        let retry = request
            .as_ref()
            .map_or(false, |r| r.attempts < MAX_ATTEMPTS);
        self.selected = None;
        self.state = ConnectionState::Closed;
        self.effects.push(Effect::Abort {
            error,
            request,
            retry,
        });
        self.effects.push(Effect::Close);
    }
}

fn protocol_error(command: &str, status: StatusResponse) -> ImapError {
    let code = status.code.as_ref().map(ResponseCode::name);
    match status.status {
        Status::Bad => ImapError::Bad {
            command: command.to_string(),
            text: status.text,
            code,
        },
        _ => ImapError::No {
            command: command.to_string(),
            text: status.text,
            code,
        },
    }
}
