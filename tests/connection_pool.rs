// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests for the connection pool against a scripted server:
//! request routing, queueing at the connection limit, reuse of selected
//! mailboxes, idle eviction and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, FakeServer, Script};
use imapcore::connection_pool::{ConnectionPool, PoolConfig, SubmitState};
use imapcore::host_session::HostSessionRegistry;
use imapcore::imap::error::ImapError;
use imapcore::imap::request::{ImapRequest, RequestKind, RequestOutcome};
use imapcore::imap::sink::{CollectingSink, ServerEvent, ServerSink, SinkEvent};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(10);

fn pool_for(server: &FakeServer, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(
        &server.account(),
        Arc::new(HostSessionRegistry::new()),
        server.factory(),
        config,
    )
    .expect("pool")
}

fn config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        ..PoolConfig::default()
    }
}

#[test]
#[serial]
fn test_third_request_waits_for_a_free_connection() {
    let server = FakeServer::start(Script::default().slow("NOOP", Duration::from_millis(300)));
    let pool = pool_for(&server, config(2));

    let submitted: Vec<_> = (0..3)
        .map(|_| pool.submit(ImapRequest::new(RequestKind::Noop)))
        .collect();
    let states: Vec<SubmitState> = submitted.iter().map(|(state, _)| *state).collect();
    assert_eq!(
        states,
        vec![
            SubmitState::RunningImmediately,
            SubmitState::RunningImmediately,
            SubmitState::Queued
        ]
    );
    assert_eq!(pool.stats().queued_requests, 1);

    for (_, handle) in &submitted {
        let result = handle.wait_timeout(WAIT).expect("request finished");
        assert_eq!(result.unwrap(), RequestOutcome::Completed);
    }

    let stats = pool.stats();
    assert_eq!(stats.total_created, 2);
    assert_eq!(stats.queued_requests, 0);
    assert!(server.peak_live() <= 2);
    assert_eq!(server.count("NOOP"), 3);
}

#[test]
#[serial]
fn test_selected_connection_is_reused() {
    let server = FakeServer::start(Script::default());
    let pool = pool_for(&server, config(3));

    let outcome = pool
        .run(ImapRequest::new(RequestKind::Select).in_folder("INBOX"))
        .unwrap();
    match outcome {
        RequestOutcome::Selected {
            exists,
            uid_validity,
            ..
        } => {
            assert_eq!(exists, 2);
            assert_eq!(uid_validity, Some(42));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(wait_until(WAIT, || pool.stats().idle_connections == 1));

    let (state, handle) = pool.submit(
        ImapRequest::new(RequestKind::Search {
            criteria: "UNSEEN".into(),
        })
        .in_folder("INBOX"),
    );
    assert_eq!(state, SubmitState::RunningImmediately);
    assert_eq!(
        handle.wait_timeout(WAIT).unwrap().unwrap(),
        RequestOutcome::SearchResults(vec![1, 2])
    );

    assert_eq!(pool.stats().total_created, 1);
    // The second request ran in the already selected mailbox.
    assert_eq!(server.count("SELECT"), 1);
    let sessions = pool.connections();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].selected.as_deref(), Some("INBOX"));
}

#[test]
#[serial]
fn test_request_waits_for_busy_connection_in_same_mailbox() {
    let server = FakeServer::start(Script::default().slow("SELECT", Duration::from_millis(300)));
    let pool = pool_for(&server, config(3));

    let (first, select) = pool.submit(ImapRequest::new(RequestKind::Select).in_folder("INBOX"));
    let (second, search) = pool.submit(
        ImapRequest::new(RequestKind::Search {
            criteria: "ALL".into(),
        })
        .in_folder("INBOX"),
    );
    assert_eq!(first, SubmitState::RunningImmediately);
    assert_eq!(second, SubmitState::QueuedBusyCompatible);

    assert!(select.wait_timeout(WAIT).unwrap().is_ok());
    assert!(search.wait_timeout(WAIT).unwrap().is_ok());
    assert_eq!(pool.stats().total_created, 1);
}

#[test]
#[serial]
fn test_discover_reports_mailboxes() {
    let server = FakeServer::start(Script::default());
    let pool = pool_for(&server, config(1));
    let events = Arc::new(CollectingSink::new());
    let sink: Arc<dyn ServerSink> = events.clone();
    pool.set_server_sink(Some(sink));

    let outcome = pool.run(ImapRequest::new(RequestKind::Discover)).unwrap();
    let RequestOutcome::Mailboxes(mailboxes) = outcome else {
        panic!("expected mailboxes");
    };
    let names: Vec<&str> = mailboxes
        .iter()
        .map(|m| m.canonical_path.as_str())
        .collect();
    assert!(names.contains(&"INBOX"));
    assert!(names.contains(&"Archive"));

    assert!(server.count("NAMESPACE") == 1);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, SinkEvent::Server(ServerEvent::DiscoveryDone { succeeded: true }))));
    assert!(pool
        .registry()
        .namespaces_discovered(pool.server_key())
        .unwrap());
}

#[test]
#[serial]
fn test_rejected_login_is_not_retried() {
    let server = FakeServer::start(Script {
        reject_login: true,
        ..Script::default()
    });
    let pool = pool_for(&server, config(2));

    let result = pool.run(ImapRequest::new(RequestKind::Noop));
    assert!(matches!(result, Err(ImapError::AuthExhausted(_))));
    assert_eq!(pool.stats().total_created, 1);
    assert_eq!(server.accepted(), 1);
}

#[test]
#[serial]
fn test_failed_login_stays_failed_until_reset() {
    let server = FakeServer::start(Script {
        reject_login: true,
        ..Script::default()
    });
    let pool = pool_for(&server, config(2));

    let result = pool.run(ImapRequest::new(RequestKind::Noop));
    assert!(matches!(result, Err(ImapError::AuthExhausted(_))));
    let logins = server.count("LOGIN");
    assert!(logins >= 1);

    // The next connection does not send the rejected LOGIN again.
    let result = pool.run(ImapRequest::new(RequestKind::Noop));
    assert!(matches!(result, Err(ImapError::AuthExhausted(_))));
    assert_eq!(server.count("LOGIN"), logins);

    pool.reset_failed_auth().unwrap();
    let result = pool.run(ImapRequest::new(RequestKind::Noop));
    assert!(matches!(result, Err(ImapError::AuthExhausted(_))));
    assert!(server.count("LOGIN") > logins);
}

#[test]
#[serial]
fn test_idle_connections_are_evicted() {
    let server = FakeServer::start(Script::default());
    let pool = pool_for(
        &server,
        PoolConfig {
            max_connections: 2,
            idle_timeout: Duration::from_millis(200),
            reap_interval: Duration::from_millis(50),
        },
    );

    assert!(pool.run(ImapRequest::new(RequestKind::Noop)).is_ok());
    assert!(wait_until(WAIT, || pool.stats().live_connections == 0));
    assert_eq!(pool.stats().total_evicted, 1);
    assert!(wait_until(WAIT, || server.count("LOGOUT") == 1));
}

#[test]
#[serial]
fn test_close_cached_connections_then_reconnect() {
    let server = FakeServer::start(Script::default());
    let pool = pool_for(&server, config(2));

    assert!(pool.run(ImapRequest::new(RequestKind::Noop)).is_ok());
    pool.close_cached_connections();
    assert!(wait_until(WAIT, || pool.stats().live_connections == 0));

    assert!(pool.run(ImapRequest::new(RequestKind::Noop)).is_ok());
    assert_eq!(pool.stats().total_created, 2);
    assert_eq!(server.accepted(), 2);
}

#[test]
#[serial]
fn test_shutdown_fails_queued_requests() {
    let server = FakeServer::start(Script::default().slow("NOOP", Duration::from_millis(500)));
    let pool = pool_for(&server, config(1));

    let (_, running) = pool.submit(ImapRequest::new(RequestKind::Noop));
    let (state, queued) = pool.submit(ImapRequest::new(RequestKind::Noop));
    assert_eq!(state, SubmitState::Queued);

    pool.shutdown();
    assert!(matches!(queued.wait(), Err(ImapError::Internal(_))));
    // The running request was interrupted or had already finished.
    assert!(running.wait_timeout(WAIT).is_some());
    assert_eq!(pool.stats().live_connections, 0);

    let (state, _) = pool.submit(ImapRequest::new(RequestKind::Noop));
    assert_eq!(state, SubmitState::Rejected);
}

#[test]
#[serial]
fn test_cancelled_queued_request_is_skipped() {
    let server = FakeServer::start(Script::default().slow("NOOP", Duration::from_millis(300)));
    let pool = pool_for(&server, config(1));

    let (_, first) = pool.submit(ImapRequest::new(RequestKind::Noop));
    let (_, cancelled) = pool.submit(ImapRequest::new(RequestKind::Noop));
    let (_, last) = pool.submit(ImapRequest::new(RequestKind::Noop));
    cancelled.cancel();

    assert!(first.wait_timeout(WAIT).unwrap().is_ok());
    assert!(last.wait_timeout(WAIT).unwrap().is_ok());
    assert_eq!(server.count("NOOP"), 2);
}
