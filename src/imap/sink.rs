// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Notification interfaces towards the rest of the mail client.
//!
//! Connections call sinks from their own thread. When the receiving object
//! lives on another thread, wrap it with [`ChannelSink`] and run a
//! [`SinkDispatcher`] there: each call becomes a blocking round trip, so the
//! connection still observes the call as synchronous.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::imap::namespace::Namespace;
use crate::imap::types::{Capabilities, MailboxSpec, MessageFlags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaResource {
    pub name: String,
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    MailboxDiscovered(MailboxSpec),
    DiscoveryDone { succeeded: bool },
    AclUpdated { mailbox: String, rights: String },
    QuotaUpdated {
        mailbox: String,
        root: String,
        resources: Vec<QuotaResource>,
    },
    CapabilitiesChanged(Capabilities),
    NamespacesCommitted(Vec<Namespace>),
    Alert(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
    FlagsChanged {
        uid: u32,
        flags: MessageFlags,
        keywords: Vec<String>,
    },
    Expunged { seq: u32, uid: Option<u32> },
    Exists(u32),
    UidValidity(u32),
    PermanentFlags(MessageFlags),
    Renamed { from: String, to: String },
    Deleted(String),
    VerifiedOnline(String),
    Released(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    HeaderAvailable {
        uid: u32,
        flags: MessageFlags,
        size: Option<u32>,
        header: Vec<u8>,
    },
    BodyChunk { uid: u32, offset: u32, data: Vec<u8> },
    MessageComplete { uid: u32, size: usize },
    SearchHits(Vec<u32>),
    Progress { current: u32, total: u32 },
}

/// Account-level notifications.
pub trait ServerSink: Send + Sync {
    fn on_server_event(&self, event: ServerEvent);
}

/// Notifications for the folder a request runs in.
pub trait MailFolderSink: Send + Sync {
    fn on_folder_event(&self, event: FolderEvent);
}

/// Notifications for message data a request produces.
pub trait MessageSink: Send + Sync {
    fn on_message_event(&self, event: MessageEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Server(ServerEvent),
    Folder(FolderEvent),
    Message(MessageEvent),
}

/// Stores every event it receives. Handy for tools and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<SinkEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn mailboxes(&self) -> Vec<MailboxSpec> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Server(ServerEvent::MailboxDiscovered(spec)) => Some(spec),
                _ => None,
            })
            .collect()
    }
}

impl ServerSink for CollectingSink {
    fn on_server_event(&self, event: ServerEvent) {
        self.push(SinkEvent::Server(event));
    }
}

impl MailFolderSink for CollectingSink {
    fn on_folder_event(&self, event: FolderEvent) {
        self.push(SinkEvent::Folder(event));
    }
}

impl MessageSink for CollectingSink {
    fn on_message_event(&self, event: MessageEvent) {
        self.push(SinkEvent::Message(event));
    }
}

type Envelope = (SinkEvent, Sender<()>);

/// Forwards sink calls to a [`SinkDispatcher`] and waits for each to be
/// handled.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Envelope>,
}

impl ChannelSink {
    fn forward(&self, event: SinkEvent) {
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send((event, ack_tx)).is_err() {
            debug!("Sink dispatcher gone, dropping notification");
            return;
        }
        // Disconnect means the dispatcher dropped the envelope unhandled.
        let _ = ack_rx.recv();
    }
}

impl ServerSink for ChannelSink {
    fn on_server_event(&self, event: ServerEvent) {
        self.forward(SinkEvent::Server(event));
    }
}

impl MailFolderSink for ChannelSink {
    fn on_folder_event(&self, event: FolderEvent) {
        self.forward(SinkEvent::Folder(event));
    }
}

impl MessageSink for ChannelSink {
    fn on_message_event(&self, event: MessageEvent) {
        self.forward(SinkEvent::Message(event));
    }
}

/// Owner-side end of a [`ChannelSink`]. Delivers events to the real sinks on
/// whichever thread calls `dispatch`.
pub struct SinkDispatcher {
    rx: Receiver<Envelope>,
    server: Option<Arc<dyn ServerSink>>,
    folder: Option<Arc<dyn MailFolderSink>>,
    message: Option<Arc<dyn MessageSink>>,
}

impl fmt::Debug for SinkDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkDispatcher")
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl SinkDispatcher {
    pub fn channel(
        server: Option<Arc<dyn ServerSink>>,
        folder: Option<Arc<dyn MailFolderSink>>,
        message: Option<Arc<dyn MessageSink>>,
    ) -> (ChannelSink, SinkDispatcher) {
        let (tx, rx) = channel::unbounded();
        (
            ChannelSink { tx },
            SinkDispatcher {
                rx,
                server,
                folder,
                message,
            },
        )
    }

    fn deliver(&self, (event, ack): Envelope) {
        match event {
            SinkEvent::Server(e) => {
                if let Some(sink) = &self.server {
                    sink.on_server_event(e);
                }
            }
            SinkEvent::Folder(e) => {
                if let Some(sink) = &self.folder {
                    sink.on_folder_event(e);
                }
            }
            SinkEvent::Message(e) => {
                if let Some(sink) = &self.message {
                    sink.on_message_event(e);
                }
            }
        }
        let _ = ack.send(());
    }

    /// Handles at most one event, waiting up to `timeout`. Returns false when
    /// nothing arrived or every `ChannelSink` is gone.
    pub fn dispatch_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => {
                self.deliver(envelope);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Handles everything already queued without blocking.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.deliver(envelope);
            handled += 1;
        }
        handled
    }

    /// Runs until every `ChannelSink` has been dropped.
    pub fn run(&self) {
        while let Ok(envelope) = self.rx.recv() {
            self.deliver(envelope);
        }
    }
}
