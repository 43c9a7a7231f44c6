// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use imapcore::config::{Settings, DEFAULT_ACCOUNT};
use imapcore::connection_pool::ConnectionPool;
use imapcore::host_session::HostSessionRegistry;
use imapcore::imap::request::{ImapRequest, RequestKind, RequestOutcome};
use imapcore::imap::sink::{CollectingSink, ServerSink, SinkEvent};

#[derive(Parser, Debug)]
#[command(version, about = "Connects to an IMAP account, discovers its folders and optionally selects one", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "IMAPCORE_CONFIG")]
    config: Option<String>,

    /// Account name from the configuration.
    #[arg(short, long, default_value = DEFAULT_ACCOUNT)]
    account: String,

    /// Canonical path of a folder to select after discovery.
    #[arg(short, long)]
    select: Option<String>,

    /// Seconds to wait for each request.
    #[arg(long, default_value = "60")]
    timeout: u64,
}

fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {}", err);
        exit(1);
    });
    env_logger::Builder::from_env(Env::default().default_filter_or(settings.log.level.as_str()))
        .init();

    let account = match settings.account(&cli.account) {
        Ok(account) => account,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    let registry = Arc::new(HostSessionRegistry::new());
    let pool = match ConnectionPool::connect(account, Arc::clone(&registry)) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Could not create connection pool: {}", e);
            exit(1);
        }
    };
    let server_events = Arc::new(CollectingSink::new());
    let sink: Arc<dyn ServerSink> = server_events.clone();
    pool.set_server_sink(Some(sink));

    let timeout = Duration::from_secs(cli.timeout);
    let run = |request: ImapRequest| {
        let (_, handle) = pool.submit(request);
        handle.wait_timeout(timeout)
    };

    info!("Discovering folders on {}", pool.server_key());
    match run(ImapRequest::new(RequestKind::Discover)) {
        Some(Ok(RequestOutcome::Mailboxes(mailboxes))) => {
            for mailbox in mailboxes {
                println!(
                    "{}\t{}\t{:?}",
                    mailbox.canonical_path, mailbox.server_path, mailbox.flags
                );
            }
        }
        Some(Ok(other)) => info!("Discovery finished: {:?}", other),
        Some(Err(e)) => {
            error!("Discovery failed: {}", e);
            exit(2);
        }
        None => {
            error!("Discovery timed out after {:?}", timeout);
            exit(2);
        }
    }

    if let Some(folder) = cli.select.as_deref() {
        match run(ImapRequest::new(RequestKind::Select).in_folder(folder)) {
            Some(Ok(outcome)) => println!("{}: {:?}", folder, outcome),
            Some(Err(e)) => error!("Selecting {} failed: {}", folder, e),
            None => error!("Selecting {} timed out", folder),
        }
    }

    for event in server_events.take() {
        if let SinkEvent::Server(event) = event {
            info!("Server event: {:?}", event);
        }
    }
    pool.shutdown();
}
