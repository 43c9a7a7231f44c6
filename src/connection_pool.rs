// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, select, Sender};
use log::{debug, error, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AccountConfig;
use crate::host_session::{HostSessionError, HostSessionRegistry};
use crate::imap::auth::SaslAuthenticator;
use crate::imap::connection::{
    self, ConnectionFactory, ConnectionHandle, ConnectionObserver, ConnectionSetup, Job,
    TcpConnectionFactory,
};
use crate::imap::error::ImapError;
use crate::imap::protocol::ConnectionOptions;
use crate::imap::request::{request_channel, ImapRequest, RequestHandle, RequestResult};
use crate::imap::sink::ServerSink;

/// Errors that can occur during pool operations
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("Connection pool is shutting down")]
    ShuttingDown,
    #[error("Failed to start connection: {0}")]
    ConnectionFailed(String),
    #[error(transparent)]
    Session(#[from] HostSessionError),
}

impl From<PoolError> for ImapError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Session(e) => e.into(),
            other => ImapError::Internal(other.to_string()),
        }
    }
}

/// What `submit` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitState {
    #[default]
    NotStarted,
    /// Handed to an idle connection or to a freshly started one.
    RunningImmediately,
    /// Waiting for a busy connection already in the request's mailbox.
    QueuedBusyCompatible,
    Queued,
    /// The pool is shutting down; the handle already holds the error.
    Rejected,
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_connections: usize,
    /// Time before an idle connection is closed
    pub idle_timeout: Duration,
    /// Time between idle sweeps
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(crate::config::MAX_IDLE_TIMEOUT_MINUTES * 60),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_account(account: &AccountConfig) -> Self {
        Self {
            max_connections: account.max_connections(),
            idle_timeout: Duration::from_secs(account.idle_timeout_minutes() * 60),
            ..Self::default()
        }
    }
}

/// A pooled connection with metadata
#[derive(Debug)]
struct PooledConnection {
    handle: ConnectionHandle,
    created_at: Instant,
    last_active: Instant,
    authenticated: bool,
    busy: bool,
    closing: bool,
    selected: Option<String>,
    /// Mailbox of the request currently running.
    target: Option<String>,
}

impl PooledConnection {
    fn new(handle: ConnectionHandle) -> Self {
        let now = Instant::now();
        Self {
            handle,
            created_at: now,
            last_active: now,
            authenticated: false,
            busy: true,
            closing: false,
            selected: None,
            target: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.authenticated && !self.busy && !self.closing
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        !self.busy && self.last_active.elapsed() > idle_timeout
    }

    fn works_in(&self, mailbox: &str) -> bool {
        self.selected.as_deref() == Some(mailbox) || self.target.as_deref() == Some(mailbox)
    }
}

#[derive(Default)]
struct PoolState {
    connections: Vec<PooledConnection>,
    pending: VecDeque<Job>,
    shutting_down: bool,
    server_sink: Option<Arc<dyn ServerSink>>,
    authenticator: Option<Arc<dyn SaslAuthenticator>>,
    total_created: usize,
    total_evicted: usize,
}

impl PoolState {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.connections.iter().position(|c| c.handle.id() == id)
    }

    /// An idle connection, preferring ones without a selected mailbox.
    fn any_idle(&self) -> Option<usize> {
        let mut fallback = None;
        for (index, conn) in self.connections.iter().enumerate() {
            if !conn.is_idle() {
                continue;
            }
            if conn.selected.is_none() {
                return Some(index);
            }
            fallback.get_or_insert(index);
        }
        fallback
    }

    fn idle_compatible(&self, mailbox: Option<&str>) -> Option<usize> {
        match mailbox {
            Some(mailbox) => self
                .connections
                .iter()
                .position(|c| c.is_idle() && c.selected.as_deref() == Some(mailbox)),
            None => self.any_idle(),
        }
    }

    fn busy_compatible(&self, mailbox: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.busy && !c.closing && c.works_in(mailbox))
    }

    /// Sends `job` to connection `index`. A dead connection is marked closing
    /// and the job comes back.
    fn hand_to(&mut self, index: usize, job: Job) -> Result<(), Job> {
        let conn = &mut self.connections[index];
        let kind = job.request.kind.name();
        let target = job
            .request
            .needs_selected()
            .then(|| job.request.folder.clone())
            .flatten();
        conn.busy = true;
        conn.last_active = Instant::now();
        match conn.handle.send(job) {
            Ok(()) => {
                conn.target = target;
                debug!("Handed {} to connection {}", kind, conn.handle.id());
                Ok(())
            }
            Err(job) => {
                warn!("Connection {} is gone, marking it closing", conn.handle.id());
                conn.busy = false;
                conn.closing = true;
                Err(job)
            }
        }
    }
}

enum Placement {
    Placed(SubmitState),
    Wait(Job, SubmitState),
}

struct PoolShared {
    me: Weak<PoolShared>,
    server_key: String,
    options: ConnectionOptions,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<HostSessionRegistry>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_connection(&self, state: &mut PoolState, job: Job) -> Result<(), Job> {
        let Some(observer) = self.me.upgrade() else {
            return Err(job);
        };
        let setup = ConnectionSetup {
            options: self.options.clone(),
            factory: Arc::clone(&self.factory),
            registry: Arc::clone(&self.registry),
            server_sink: state.server_sink.clone(),
            authenticator: state.authenticator.clone(),
            observer,
        };
        let target = job
            .request
            .needs_selected()
            .then(|| job.request.folder.clone())
            .flatten();
        let kind = job.request.kind.name();
        match connection::spawn(setup, Some(job)) {
            Ok(handle) => {
                let id = handle.id();
                let mut conn = PooledConnection::new(handle);
                conn.target = target;
                state.connections.push(conn);
                state.total_created += 1;
                debug!(
                    "Created new connection {} for {} (total: {})",
                    id,
                    kind,
                    state.connections.len()
                );
                Ok(())
            }
            Err(e) => {
                // The job went down with the thread closure; its handle sees the drop.
                error!("Failed to start connection for {}: {}", kind, e);
                Ok(())
            }
        }
    }

    /// Routes `job` following the pool rules without queueing it.
    fn place(&self, state: &mut PoolState, mut job: Job, wait_for_busy: bool) -> Placement {
        if state.shutting_down {
            job.consumer.finish(Err(PoolError::ShuttingDown.into()));
            return Placement::Placed(SubmitState::Rejected);
        }
        let mailbox = job
            .request
            .needs_selected()
            .then(|| job.request.folder.clone())
            .flatten();

        // 1. idle and compatible
        while let Some(index) = state.idle_compatible(mailbox.as_deref()) {
            match state.hand_to(index, job) {
                Ok(()) => return Placement::Placed(SubmitState::RunningImmediately),
                Err(returned) => job = returned,
            }
        }

        // 2. compatible but busy
        if let Some(mailbox) = mailbox.as_deref() {
            if wait_for_busy && state.busy_compatible(mailbox) {
                return Placement::Wait(job, SubmitState::QueuedBusyCompatible);
            }
        }

        // 3. room for another connection
        if state.connections.len() < self.config.max_connections {
            match self.spawn_connection(state, job) {
                Ok(()) => return Placement::Placed(SubmitState::RunningImmediately),
                Err(returned) => job = returned,
            }
        }

        // 4. any free connection
        while let Some(index) = state.any_idle() {
            match state.hand_to(index, job) {
                Ok(()) => return Placement::Placed(SubmitState::RunningImmediately),
                Err(returned) => job = returned,
            }
        }

        // 5.
        Placement::Wait(job, SubmitState::Queued)
    }

    fn dispatch(&self, job: Job) -> SubmitState {
        let mut state = self.lock();
        match self.place(&mut state, job, true) {
            Placement::Placed(result) => result,
            Placement::Wait(job, result) => {
                debug!(
                    "Queueing {} ({} already waiting)",
                    job.request.kind.name(),
                    state.pending.len()
                );
                state.pending.push_back(job);
                result
            }
        }
    }

    /// Hands queued work to free connections in FIFO order.
    fn load_next_queued(&self, state: &mut PoolState) {
        while let Some(job) = state.pending.pop_front() {
            if job.consumer.is_dead() {
                debug!("Dropping queued {} whose caller went away", job.request.kind.name());
                continue;
            }
            match self.place(state, job, false) {
                Placement::Placed(_) => {}
                Placement::Wait(job, _) => {
                    state.pending.push_front(job);
                    break;
                }
            }
        }
    }

    fn reap(&self) {
        let mut state = self.lock();
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0;
        for conn in state.connections.iter_mut() {
            if !conn.closing && conn.is_expired(idle_timeout) {
                info!(
                    "Evicting connection {} idle for {:?}",
                    conn.handle.id(),
                    conn.last_active.elapsed()
                );
                conn.closing = true;
                conn.handle.close();
                evicted += 1;
            }
        }
        state.total_evicted += evicted;
        // Finished threads whose close callback raced with a shutdown.
        state.connections.retain(|c| !(c.closing && c.handle.is_finished()));
    }
}

impl ConnectionObserver for PoolShared {
    fn connection_ready(&self, id: Uuid, selected: Option<&str>) {
        let mut state = self.lock();
        if let Some(index) = state.position(id) {
            let conn = &mut state.connections[index];
            conn.authenticated = true;
            conn.busy = false;
            conn.target = None;
            conn.selected = selected.map(str::to_string);
            conn.last_active = Instant::now();
        }
        self.load_next_queued(&mut state);
    }

    fn connection_closed(&self, id: Uuid) {
        let mut state = self.lock();
        if let Some(index) = state.position(id) {
            // The thread is the caller; dropping the handle detaches it.
            state.connections.remove(index);
            debug!("Connection {} closed ({} left)", id, state.connections.len());
        }
        self.load_next_queued(&mut state);
    }

    fn return_job(&self, job: Job) {
        if job.consumer.is_dead() {
            return;
        }
        let mut state = self.lock();
        match self.place(&mut state, job, false) {
            Placement::Placed(_) => {}
            Placement::Wait(job, _) => state.pending.push_front(job),
        }
    }
}

/// Statistics about the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub live_connections: usize,
    pub busy_connections: usize,
    pub idle_connections: usize,
    pub queued_requests: usize,
    pub max_connections: usize,
    pub total_created: usize,
    pub total_evicted: usize,
}

/// Information about a connection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub created_at: Instant,
    pub last_active: Instant,
    pub authenticated: bool,
    pub busy: bool,
    pub closing: bool,
    pub selected: Option<String>,
}

/// Connections for one account. Requests go to an existing connection, a new
/// one, or the pending queue.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server_key", &self.shared.server_key)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(
        account: &AccountConfig,
        registry: Arc<HostSessionRegistry>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let server_key = account.server_key();
        registry.register(&server_key, account);
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            ..config
        };
        let reap_interval = config.reap_interval;

        let shared = Arc::new_cyclic(|me| PoolShared {
            me: me.clone(),
            server_key,
            options: ConnectionOptions::from_account(account),
            config,
            factory,
            registry,
            state: Mutex::new(PoolState::default()),
        });

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(reap_interval);
        let weak = Arc::downgrade(&shared);
        let reaper = thread::Builder::new()
            .name("imap-pool-reaper".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => match weak.upgrade() {
                        Some(shared) => shared.reap(),
                        None => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(|e| PoolError::ConnectionFailed(e.to_string()))?;

        info!(
            "Connection pool for {} ready (max {} connections)",
            shared.server_key, shared.config.max_connections
        );
        Ok(Self {
            shared,
            reaper: Mutex::new(Some((stop_tx, reaper))),
        })
    }

    /// Pool over real TCP/TLS sockets using the account's settings.
    pub fn connect(account: &AccountConfig, registry: Arc<HostSessionRegistry>) -> Result<Self, PoolError> {
        let factory = TcpConnectionFactory::new(account)
            .map_err(|e| PoolError::ConnectionFailed(e.to_string()))?;
        Self::new(account, registry, Arc::new(factory), PoolConfig::from_account(account))
    }

    pub fn server_key(&self) -> &str {
        &self.shared.server_key
    }

    pub fn registry(&self) -> &Arc<HostSessionRegistry> {
        &self.shared.registry
    }

    /// Sink for connections created from now on.
    pub fn set_server_sink(&self, sink: Option<Arc<dyn ServerSink>>) {
        self.shared.lock().server_sink = sink;
    }

    /// Provider for GSSAPI/NTLM/MSN used by connections created from now on.
    pub fn set_authenticator(&self, authenticator: Option<Arc<dyn SaslAuthenticator>>) {
        self.shared.lock().authenticator = authenticator;
    }

    /// Lets connections created from now on retry mechanisms the server
    /// rejected earlier. Call after the credentials changed.
    pub fn reset_failed_auth(&self) -> Result<(), PoolError> {
        info!("Resetting failed auth mechanisms for {}", self.shared.server_key);
        self.shared.registry.reset_failed_auth(&self.shared.server_key)?;
        Ok(())
    }

    /// Routes `request` and returns where it went plus the handle its result
    /// arrives on. Never blocks on the network.
    pub fn submit(&self, request: ImapRequest) -> (SubmitState, RequestHandle) {
        let (consumer, handle) = request_channel(request.id);
        let kind = request.kind.name();
        let state = self.shared.dispatch(Job { request, consumer });
        debug!("Submitted {} -> {:?}", kind, state);
        (state, handle)
    }

    /// Submits and waits for the result.
    pub fn run(&self, request: ImapRequest) -> RequestResult {
        let (_, handle) = self.submit(request);
        handle.wait()
    }

    /// Hands queued requests to free connections.
    pub fn load_next_queued_url(&self) {
        let mut state = self.shared.lock();
        self.shared.load_next_queued(&mut state);
    }

    /// Force-closes every connection. Queued requests stay queued and run on
    /// new connections.
    pub fn close_cached_connections(&self) {
        let mut state = self.shared.lock();
        info!(
            "Closing {} cached connections for {}",
            state.connections.len(),
            self.shared.server_key
        );
        for conn in state.connections.iter_mut() {
            conn.closing = true;
            conn.handle.interrupt();
            conn.handle.close();
        }
    }

    /// Raises the pseudo-interrupt on every connection.
    pub fn interrupt_all(&self) {
        let state = self.shared.lock();
        for conn in &state.connections {
            debug!("Interrupting connection {}", conn.handle.id());
            conn.handle.interrupt();
        }
    }

    /// Shutdown the pool gracefully
    pub fn shutdown(&self) {
        let (pending, mut connections) = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            info!("Shutting down connection pool for {}", self.shared.server_key);
            state.shutting_down = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.connections),
            )
        };
        for job in pending {
            job.consumer.finish(Err(PoolError::ShuttingDown.into()));
        }
        for conn in &connections {
            conn.handle.interrupt();
            conn.handle.close();
        }
        for conn in connections.iter_mut() {
            conn.handle.join();
        }
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((stop, thread)) = reaper {
            let _ = stop.send(());
            if thread.join().is_err() {
                error!("Pool reaper panicked");
            }
        }
        info!("Connection pool shutdown complete");
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let busy = state.connections.iter().filter(|c| c.busy).count();
        let idle = state.connections.iter().filter(|c| c.is_idle()).count();
        PoolStats {
            live_connections: state.connections.len(),
            busy_connections: busy,
            idle_connections: idle,
            queued_requests: state.pending.len(),
            max_connections: self.shared.config.max_connections,
            total_created: state.total_created,
            total_evicted: state.total_evicted,
        }
    }

    /// Get detailed connection information
    pub fn connections(&self) -> Vec<SessionInfo> {
        self.shared
            .lock()
            .connections
            .iter()
            .map(|conn| SessionInfo {
                id: conn.handle.id(),
                created_at: conn.created_at,
                last_active: conn.last_active,
                authenticated: conn.authenticated,
                busy: conn.busy,
                closing: conn.closing,
                selected: conn.selected.clone(),
            })
            .collect()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
