// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Requests submitted to the pool and the channel their result travels on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::imap::error::ImapError;
use crate::imap::flag_state::FlagUidState;
use crate::imap::sink::{MailFolderSink, MessageSink};
use crate::imap::types::{MailboxSpec, MessageFlags, StoreOperation};

/// Header fields fetched for every message list.
pub const DEFAULT_HEADER_FIELDS: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "References",
    "In-Reply-To",
    "Content-Type",
];

/// One command chain. Mailbox paths are canonical ('/'-delimited).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// NAMESPACE (once per host) followed by LIST/LSUB per namespace.
    Discover,
    /// SELECT or, when already selected, a NOOP + flag resync.
    Select,
    FetchHeaders { uids: Vec<u32> },
    FetchMessage { uid: u32 },
    Store {
        uids: Vec<u32>,
        operation: StoreOperation,
        flags: MessageFlags,
        keywords: Vec<String>,
    },
    /// `uids` limits the expunge when the server supports UIDPLUS.
    Expunge { uids: Option<Vec<u32>> },
    /// Raw IMAP search criteria, e.g. `UNSEEN FROM "bob"`.
    Search { criteria: String },
    Copy { uids: Vec<u32>, destination: String },
    Move { uids: Vec<u32>, destination: String },
    Create { path: String },
    Delete { path: String },
    Rename { from: String, to: String },
    Subscribe { path: String },
    Unsubscribe { path: String },
    Noop,
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Discover => "discover",
            RequestKind::Select => "select",
            RequestKind::FetchHeaders { .. } => "fetch-headers",
            RequestKind::FetchMessage { .. } => "fetch-message",
            RequestKind::Store { .. } => "store",
            RequestKind::Expunge { .. } => "expunge",
            RequestKind::Search { .. } => "search",
            RequestKind::Copy { .. } => "copy",
            RequestKind::Move { .. } => "move",
            RequestKind::Create { .. } => "create",
            RequestKind::Delete { .. } => "delete",
            RequestKind::Rename { .. } => "rename",
            RequestKind::Subscribe { .. } => "subscribe",
            RequestKind::Unsubscribe { .. } => "unsubscribe",
            RequestKind::Noop => "noop",
        }
    }

    /// Whether the request runs against a selected mailbox.
    pub fn needs_selected(&self) -> bool {
        matches!(
            self,
            RequestKind::Select
                | RequestKind::FetchHeaders { .. }
                | RequestKind::FetchMessage { .. }
                | RequestKind::Store { .. }
                | RequestKind::Expunge { .. }
                | RequestKind::Search { .. }
                | RequestKind::Copy { .. }
                | RequestKind::Move { .. }
        )
    }
}

#[derive(Clone)]
pub struct ImapRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    /// Canonical path of the mailbox the request runs in.
    pub folder: Option<String>,
    pub flag_state: Option<Arc<FlagUidState>>,
    pub folder_sink: Option<Arc<dyn MailFolderSink>>,
    pub message_sink: Option<Arc<dyn MessageSink>>,
    /// Times the request has been handed to a connection.
    pub attempts: u32,
}

impl fmt::Debug for ImapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("folder", &self.folder)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl ImapRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            folder: None,
            flag_state: None,
            folder_sink: None,
            message_sink: None,
            attempts: 0,
        }
    }

    pub fn in_folder(mut self, canonical: &str) -> Self {
        self.folder = Some(canonical.to_string());
        self
    }

    pub fn with_flag_state(mut self, state: Arc<FlagUidState>) -> Self {
        self.flag_state = Some(state);
        self
    }

    pub fn with_folder_sink(mut self, sink: Arc<dyn MailFolderSink>) -> Self {
        self.folder_sink = Some(sink);
        self
    }

    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.message_sink = Some(sink);
        self
    }

    pub fn needs_selected(&self) -> bool {
        self.kind.needs_selected()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderData {
    pub uid: u32,
    pub flags: MessageFlags,
    pub keywords: Vec<String>,
    pub size: Option<u32>,
    pub header: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Mailboxes(Vec<MailboxSpec>),
    Selected {
        exists: u32,
        uid_validity: Option<u32>,
        uid_next: Option<u32>,
        read_only: bool,
    },
    Headers(Vec<HeaderData>),
    Message { uid: u32, data: Vec<u8> },
    SearchResults(Vec<u32>),
}

pub type RequestResult = Result<RequestOutcome, ImapError>;

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Connection-side end of a request: delivers exactly one result.
#[derive(Debug)]
pub struct RequestConsumer {
    id: Uuid,
    tx: Sender<RequestResult>,
    shared: Arc<Shared>,
}

impl RequestConsumer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True once the caller cancelled or dropped its handle.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// A queued entry whose request can no longer produce a useful result.
    pub fn is_dead(&self) -> bool {
        self.is_cancelled() || self.is_finished()
    }

    /// Sends the result. Only the first call has any effect.
    pub fn finish(&self, result: RequestResult) {
        if self.shared.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // A dropped handle means nobody is waiting.
        let _ = self.tx.send(result);
    }
}

/// Caller-side end of a request.
#[derive(Debug)]
pub struct RequestHandle {
    id: Uuid,
    rx: Receiver<RequestResult>,
    shared: Arc<Shared>,
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Blocks until the request completes.
    pub fn wait(&self) -> RequestResult {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(ImapError::Internal("request dropped without result".into())))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ImapError::Internal(
                "request dropped without result".into(),
            ))),
        }
    }

    pub fn try_result(&self) -> Option<RequestResult> {
        self.rx.try_recv().ok()
    }

    /// Marks the request cancelled; a queued copy is discarded when dequeued.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.shared.finished.load(Ordering::SeqCst) {
            self.cancel();
        }
    }
}

/// Creates the two ends for request `id`.
pub fn request_channel(id: Uuid) -> (RequestConsumer, RequestHandle) {
    let (tx, rx) = channel::bounded(1);
    let shared = Arc::new(Shared::default());
    (
        RequestConsumer {
            id,
            tx,
            shared: Arc::clone(&shared),
        },
        RequestHandle { id, rx, shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_selected() {
        assert!(RequestKind::Select.needs_selected());
        assert!(RequestKind::FetchMessage { uid: 1 }.needs_selected());
        assert!(!RequestKind::Discover.needs_selected());
        assert!(!RequestKind::Create { path: "a".into() }.needs_selected());
        assert!(!RequestKind::Noop.needs_selected());
    }

    #[test]
    fn test_result_delivered_once() {
        let (consumer, handle) = request_channel(Uuid::new_v4());
        consumer.finish(Ok(RequestOutcome::Completed));
        consumer.finish(Err(ImapError::Interrupted));
        assert_eq!(handle.wait().unwrap(), RequestOutcome::Completed);
        assert!(handle.try_result().is_none());
        assert!(consumer.is_dead());
    }

    #[test]
    fn test_dropping_handle_cancels() {
        let (consumer, handle) = request_channel(Uuid::new_v4());
        assert!(!consumer.is_dead());
        drop(handle);
        assert!(consumer.is_cancelled());
        // Finishing a cancelled request is harmless.
        consumer.finish(Ok(RequestOutcome::Completed));
    }

    #[test]
    fn test_wait_timeout() {
        let (consumer, handle) = request_channel(Uuid::new_v4());
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
        drop(consumer);
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(10)),
            Some(Err(ImapError::Internal(_)))
        ));
    }
}
