// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single connection threads against the scripted server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, FakeServer, Script};
use imapcore::config::AccountConfig;
use imapcore::host_session::HostSessionRegistry;
use imapcore::imap::connection::{
    self, ConnectionHandle, ConnectionObserver, ConnectionSetup, Job, IDLE_DELAY,
};
use imapcore::imap::error::ImapError;
use imapcore::imap::flag_state::FlagUidState;
use imapcore::imap::protocol::ConnectionOptions;
use imapcore::imap::request::{request_channel, ImapRequest, RequestHandle, RequestKind};
use imapcore::imap::sink::{CollectingSink, FolderEvent, MailFolderSink, SinkEvent};
use imapcore::imap::types::MessageFlags;
use serial_test::serial;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Observer {
    ready: Mutex<Vec<Option<String>>>,
    closed: Mutex<Vec<Uuid>>,
}

impl ConnectionObserver for Observer {
    fn connection_ready(&self, _id: Uuid, selected: Option<&str>) {
        self.ready.lock().unwrap().push(selected.map(str::to_string));
    }

    fn connection_closed(&self, id: Uuid) {
        self.closed.lock().unwrap().push(id);
    }

    fn return_job(&self, job: Job) {
        job.consumer
            .finish(Err(ImapError::Internal("returned in test".into())));
    }
}

fn setup(server: &FakeServer, account: &AccountConfig, observer: Arc<Observer>) -> ConnectionSetup {
    let registry = Arc::new(HostSessionRegistry::new());
    registry.register(&account.server_key(), account);
    ConnectionSetup {
        options: ConnectionOptions::from_account(account),
        factory: server.factory(),
        registry,
        server_sink: None,
        authenticator: None,
        observer,
    }
}

fn job(request: ImapRequest) -> (Job, RequestHandle) {
    let (consumer, handle) = request_channel(request.id);
    (Job { request, consumer }, handle)
}

fn finish(mut connection: ConnectionHandle) {
    connection.close();
    connection.join();
}

#[test]
#[serial]
fn test_select_fills_flag_state() {
    let server = FakeServer::start(Script::default());
    let observer = Arc::new(Observer::default());
    let flags = Arc::new(FlagUidState::new());
    let folder_events = Arc::new(CollectingSink::new());
    let folder_sink: Arc<dyn MailFolderSink> = folder_events.clone();

    let (first, handle) = job(
        ImapRequest::new(RequestKind::Select)
            .in_folder("INBOX")
            .with_flag_state(Arc::clone(&flags))
            .with_folder_sink(folder_sink),
    );
    let connection =
        connection::spawn(setup(&server, &server.account(), Arc::clone(&observer)), Some(first))
            .unwrap();

    assert!(handle.wait_timeout(WAIT).unwrap().is_ok());
    assert_eq!(flags.uid_validity(), Some(42));
    assert_eq!(flags.uids(), vec![1, 2]);
    assert!(flags.get_flags(1).0.contains(MessageFlags::SEEN));
    assert!(!flags.get_flags(2).0.contains(MessageFlags::SEEN));
    assert!(folder_events
        .events()
        .contains(&SinkEvent::Folder(FolderEvent::Exists(2))));

    assert!(wait_until(WAIT, || !observer.ready.lock().unwrap().is_empty()));
    assert_eq!(
        observer.ready.lock().unwrap().last().cloned().flatten().as_deref(),
        Some("INBOX")
    );
    finish(connection);
}

#[test]
#[serial]
fn test_interrupt_reports_interrupted_and_logs_out() {
    let server = FakeServer::start(Script::default().slow("NOOP", Duration::from_secs(1)));
    let observer = Arc::new(Observer::default());

    let (first, handle) = job(ImapRequest::new(RequestKind::Noop));
    let mut connection =
        connection::spawn(setup(&server, &server.account(), Arc::clone(&observer)), Some(first))
            .unwrap();

    assert!(wait_until(WAIT, || server.count("NOOP") == 1));
    connection.interrupt();

    assert!(matches!(
        handle.wait_timeout(WAIT).unwrap(),
        Err(ImapError::Interrupted)
    ));
    connection.join();
    assert!(server.count("LOGOUT") == 1);
    assert_eq!(*observer.closed.lock().unwrap(), vec![connection.id()]);
}

#[test]
#[serial]
fn test_work_after_idle_sends_done_first() {
    let server = FakeServer::start(Script::default());
    let observer = Arc::new(Observer::default());
    let mut account = server.account();
    account.use_idle = true;

    let (select, selected) = job(ImapRequest::new(RequestKind::Select).in_folder("INBOX"));
    let connection =
        connection::spawn(setup(&server, &account, Arc::clone(&observer)), Some(select)).unwrap();
    assert!(selected.wait_timeout(WAIT).unwrap().is_ok());
    assert!(wait_until(IDLE_DELAY + WAIT, || server.count("IDLE") == 1));

    let (work, handle) = job(ImapRequest::new(RequestKind::Create {
        path: "Projects".into(),
    }));
    assert!(connection.send(work).is_ok());
    assert!(handle.wait_timeout(WAIT).unwrap().is_ok());

    let commands = server.commands();
    let done = commands.iter().position(|c| c == "DONE").expect("DONE sent");
    let create = commands
        .iter()
        .position(|c| c.ends_with("CREATE \"Projects\""))
        .expect("CREATE sent");
    assert!(done < create);
    finish(connection);
}

#[test]
#[serial]
fn test_unreachable_server_hands_job_back() {
    let server = FakeServer::start(Script::default());
    let mut account = server.account();
    // Nothing listens here once the placeholder listener is dropped.
    let port = {
        let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        placeholder.local_addr().unwrap().port()
    };
    account.port = port;
    let observer = Arc::new(Observer::default());
    let mut conn_setup = setup(&server, &account, Arc::clone(&observer));
    conn_setup.factory = Arc::new(common::LocalFactory(port));

    let (first, handle) = job(ImapRequest::new(RequestKind::Noop));
    let mut connection = connection::spawn(conn_setup, Some(first)).unwrap();

    // A first attempt is retryable, so the observer receives the job.
    assert!(matches!(
        handle.wait_timeout(WAIT).unwrap(),
        Err(ImapError::Internal(_))
    ));
    connection.join();
    assert_eq!(observer.closed.lock().unwrap().len(), 1);
}
