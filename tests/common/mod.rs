// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scripted IMAP server on 127.0.0.1 for integration tests.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use imapcore::config::{AccountConfig, TlsPolicy};
use imapcore::imap::connection::{ConnectionFactory, Stream};
use imapcore::imap::error::ImapError;

/// How the fake server answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub capabilities: String,
    pub mailboxes: Vec<String>,
    /// Commands (first word, or "UID FETCH" style) that sleep before replying.
    pub slow: Vec<(String, Duration)>,
    pub reject_login: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: "IMAP4rev1 IDLE NAMESPACE UIDPLUS".to_string(),
            mailboxes: vec!["INBOX".to_string(), "Archive".to_string()],
            slow: Vec::new(),
            reject_login: false,
        }
    }
}

impl Script {
    pub fn slow(mut self, command: &str, delay: Duration) -> Self {
        self.slow.push((command.to_string(), delay));
        self
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicUsize,
    pub live: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
}

pub struct FakeServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let stats = Arc::new(ServerStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((socket, _)) => {
                            socket.set_nonblocking(false).expect("blocking socket");
                            let stats = Arc::clone(&stats);
                            let script = script.clone();
                            thread::spawn(move || serve(socket, script, stats));
                        }
                        Err(_) => thread::sleep(Duration::from_millis(10)),
                    }
                }
            })
        };

        Self {
            addr,
            stats,
            stop,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepted(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.stats.peak_live.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.stats.commands.lock().unwrap().clone()
    }

    /// Command lines seen so far whose verb is `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|line| verb_of(line) == verb)
            .count()
    }

    /// An account pointing at this server over plain TCP.
    pub fn account(&self) -> AccountConfig {
        let mut account = AccountConfig::new("127.0.0.1", self.port(), "tim");
        account.password = Some("secret".to_string());
        account.tls_policy = TlsPolicy::Never;
        account.use_idle = false;
        account
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(LocalFactory(self.port()))
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct LocalFactory(pub u16);

impl ConnectionFactory for LocalFactory {
    fn connect(&self) -> Result<Stream, ImapError> {
        Ok(Stream::Plain(TcpStream::connect(("127.0.0.1", self.0))?))
    }

    fn start_tls(&self, _tcp: TcpStream) -> Result<Stream, ImapError> {
        Err(ImapError::Tls("plain sockets only".into()))
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn verb_of(line: &str) -> String {
    let mut words = line.split_whitespace().skip(1);
    match words.next().map(str::to_ascii_uppercase) {
        Some(first) if first == "UID" => {
            format!("UID {}", words.next().unwrap_or_default().to_ascii_uppercase())
        }
        Some(first) => first,
        None => String::new(),
    }
}

fn serve(socket: TcpStream, script: Script, stats: Arc<ServerStats>) {
    stats.accepted.fetch_add(1, Ordering::SeqCst);
    let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
    stats.peak_live.fetch_max(live, Ordering::SeqCst);

    let mut writer = socket.try_clone().expect("clone socket");
    let mut reader = BufReader::new(socket);
    let _ = run_session(&mut reader, &mut writer, &script, &stats);

    stats.live.fetch_sub(1, Ordering::SeqCst);
}

fn run_session(
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    script: &Script,
    stats: &ServerStats,
) -> std::io::Result<()> {
    let send = |writer: &mut TcpStream, line: &str| -> std::io::Result<()> {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\r\n")
    };
    send(writer, "* OK fake IMAP ready")?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        stats.commands.lock().unwrap().push(command.clone());
        let tag = command.split_whitespace().next().unwrap_or("*").to_string();
        let verb = verb_of(&command);

        if let Some((_, delay)) = script.slow.iter().find(|(v, _)| *v == verb) {
            thread::sleep(*delay);
        }

        match verb.as_str() {
            "CAPABILITY" => send(writer, &format!("* CAPABILITY {}", script.capabilities))?,
            "LOGIN" | "AUTHENTICATE" if script.reject_login => {
                send(writer, &format!("{} NO [AUTHENTICATIONFAILED] invalid credentials", tag))?;
                continue;
            }
            "NAMESPACE" => send(writer, "* NAMESPACE ((\"\" \"/\")) NIL NIL")?,
            "LIST" | "LSUB" => {
                for mailbox in &script.mailboxes {
                    send(
                        writer,
                        &format!("* {} (\\HasNoChildren) \"/\" \"{}\"", verb, mailbox),
                    )?;
                }
            }
            "SELECT" | "EXAMINE" => {
                send(writer, "* FLAGS (\\Seen \\Deleted \\Flagged)")?;
                send(writer, "* 2 EXISTS")?;
                send(writer, "* 0 RECENT")?;
                send(writer, "* OK [UIDVALIDITY 42] UIDs valid")?;
                send(writer, "* OK [UIDNEXT 3] next")?;
                send(writer, &format!("{} OK [READ-WRITE] SELECT completed", tag))?;
                continue;
            }
            "UID FETCH" => {
                send(writer, "* 1 FETCH (UID 1 FLAGS (\\Seen))")?;
                send(writer, "* 2 FETCH (UID 2 FLAGS ())")?;
            }
            "UID SEARCH" => send(writer, "* SEARCH 1 2")?,
            "IDLE" => {
                send(writer, "+ idling")?;
                let mut done = String::new();
                if reader.read_line(&mut done)? == 0 {
                    return Ok(());
                }
                stats.commands.lock().unwrap().push(done.trim_end().to_string());
            }
            "LOGOUT" => {
                send(writer, "* BYE logging out")?;
                send(writer, &format!("{} OK LOGOUT completed", tag))?;
                return Ok(());
            }
            _ => {}
        }
        send(writer, &format!("{} OK {} completed", tag, verb))?;
    }
}
