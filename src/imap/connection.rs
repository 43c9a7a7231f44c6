// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Socket driver: one OS thread per connection running a [`ProtocolMachine`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use native_tls::{TlsConnector, TlsStream};
use uuid::Uuid;

use crate::config::{AccountConfig, TlsPolicy};
use crate::host_session::HostSessionRegistry;
use crate::imap::auth::SaslAuthenticator;
use crate::imap::error::ImapError;
use crate::imap::protocol::{
    loggable, ConnectionOptions, ConnectionState, Effect, Event, ProtocolMachine,
};
use crate::imap::request::{ImapRequest, RequestConsumer};
use crate::imap::response::{parse_response, ResponseReader};
use crate::imap::sink::ServerSink;

/// How long a blocking read or work wait lasts before flags are rechecked.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Quiet time in a selected mailbox before IDLE is entered.
pub const IDLE_DELAY: Duration = Duration::from_secs(5);
/// Time allowed for the LOGOUT reply before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(tls) => tls.get_ref(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self.tcp().peer_addr().ok();
        match self {
            Stream::Plain(_) => write!(f, "Plain({:?})", peer),
            Stream::Tls(_) => write!(f, "Tls({:?})", peer),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

/// Opens sockets for connections.
pub trait ConnectionFactory: Send + Sync {
    /// TCP connect, plus the TLS handshake when TLS is implicit.
    fn connect(&self) -> Result<Stream, ImapError>;

    /// Runs the client handshake on an open socket after STARTTLS.
    fn start_tls(&self, tcp: TcpStream) -> Result<Stream, ImapError>;
}

/// Factory for real servers.
pub struct TcpConnectionFactory {
    host: String,
    port: u16,
    tls_policy: TlsPolicy,
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl TcpConnectionFactory {
    pub fn new(account: &AccountConfig) -> Result<Self, ImapError> {
        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(account.accept_invalid_certs)
            .danger_accept_invalid_hostnames(account.accept_invalid_certs)
            .build()?;
        Ok(Self {
            host: account.host.clone(),
            port: account.port,
            tls_policy: account.tls_policy,
            connect_timeout: Duration::from_secs(account.connect_timeout_secs.max(1)),
            tls,
        })
    }

    fn handshake(&self, tcp: TcpStream) -> Result<Stream, ImapError> {
        let tls = self.tls.connect(&self.host, tcp)?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self) -> Result<Stream, ImapError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ImapError::Connection(format!("{}:{}: {}", self.host, self.port, e)))?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    debug!("Connected to {} ({})", self.host, addr);
                    return match self.tls_policy {
                        TlsPolicy::Implicit => self.handshake(tcp),
                        _ => Ok(Stream::Plain(tcp)),
                    };
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(ImapError::Connection(match last_error {
            Some(e) => format!("{}:{}: {}", self.host, self.port, e),
            None => format!("{}:{}: no addresses", self.host, self.port),
        }))
    }

    fn start_tls(&self, tcp: TcpStream) -> Result<Stream, ImapError> {
        self.handshake(tcp)
    }
}

/// A request together with the end that reports its result.
#[derive(Debug)]
pub struct Job {
    pub request: ImapRequest,
    pub consumer: RequestConsumer,
}

/// Callbacks from connection threads to their owner. Implementations must not
/// block on I/O.
pub trait ConnectionObserver: Send + Sync {
    /// Authenticated with nothing to do.
    fn connection_ready(&self, id: Uuid, selected: Option<&str>);

    /// The thread is exiting; no more work can be sent.
    fn connection_closed(&self, id: Uuid);

    /// Work handed back, either unstarted or to be retried elsewhere.
    fn return_job(&self, job: Job);
}

#[derive(Debug, Default)]
struct Control {
    interrupt: AtomicBool,
    shutdown: AtomicBool,
}

/// Owner-side handle of a connection thread.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    work: Sender<Job>,
    control: Arc<Control>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queues `job` on the connection; gives it back if the thread is gone.
    pub fn send(&self, job: Job) -> Result<(), Job> {
        self.work.send(job).map_err(|e| e.into_inner())
    }

    /// Raises the pseudo-interrupt. The running request reports `Interrupted`
    /// and the connection logs out.
    pub fn interrupt(&self) {
        self.control.interrupt.store(true, Ordering::SeqCst);
    }

    /// Asks the connection to log out once the current request completes.
    pub fn close(&self) {
        self.control.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Connection thread {} panicked", self.id);
            }
        }
    }
}

/// Everything a new connection thread needs.
#[derive(Clone)]
pub struct ConnectionSetup {
    pub options: ConnectionOptions,
    pub factory: Arc<dyn ConnectionFactory>,
    pub registry: Arc<HostSessionRegistry>,
    pub server_sink: Option<Arc<dyn ServerSink>>,
    pub authenticator: Option<Arc<dyn SaslAuthenticator>>,
    pub observer: Arc<dyn ConnectionObserver>,
}

/// Starts a connection thread, optionally with its first job.
pub fn spawn(setup: ConnectionSetup, first: Option<Job>) -> Result<ConnectionHandle, ImapError> {
    let machine = ProtocolMachine::new(
        setup.options,
        setup.registry,
        setup.server_sink,
        setup.authenticator,
    );
    let id = machine.id();
    let (work_tx, work_rx) = channel::unbounded();
    let control = Arc::new(Control::default());

    let driver = Driver {
        machine,
        factory: setup.factory,
        observer: setup.observer,
        work: work_rx,
        control: Arc::clone(&control),
        consumers: HashMap::new(),
        reader: None,
        responses: ResponseReader::new(),
        last_activity: Instant::now(),
        interrupted: false,
        closing_since: None,
    };
    let thread = thread::Builder::new()
        .name(format!("imap-{}", &id.to_string()[..8]))
        .spawn(move || driver.run(first))?;

    Ok(ConnectionHandle {
        id,
        work: work_tx,
        control,
        thread: Some(thread),
    })
}

struct Driver {
    machine: ProtocolMachine,
    factory: Arc<dyn ConnectionFactory>,
    observer: Arc<dyn ConnectionObserver>,
    work: Receiver<Job>,
    control: Arc<Control>,
    consumers: HashMap<Uuid, RequestConsumer>,
    reader: Option<BufReader<Stream>>,
    responses: ResponseReader,
    last_activity: Instant,
    interrupted: bool,
    closing_since: Option<Instant>,
}

impl Driver {
    fn id(&self) -> Uuid {
        self.machine.id()
    }

    fn run(mut self, first: Option<Job>) {
        if let Some(job) = first {
            self.accept(job);
        }
        self.open();
        while !self.machine.is_closed() {
            self.tick();
        }
        self.teardown();
    }

    fn open(&mut self) {
        match self.factory.connect() {
            Ok(stream) => {
                if let Err(e) = stream.tcp().set_read_timeout(Some(POLL_INTERVAL)) {
                    warn!("[{}] cannot set read timeout: {}", self.id(), e);
                }
                self.reader = Some(BufReader::new(stream));
                self.step(Event::Connected);
            }
            Err(e) => {
                error!("[{}] connect failed: {}", self.id(), e);
                self.step(Event::TransportFailed(e));
            }
        }
    }

    fn tick(&mut self) {
        if !self.interrupted {
            if self.control.interrupt.swap(false, Ordering::SeqCst) {
                self.interrupted = true;
                self.step(Event::Interrupt);
                return;
            }
            if self.control.shutdown.load(Ordering::SeqCst) && !self.machine.is_busy() {
                self.interrupted = true;
                self.step(Event::Shutdown);
                return;
            }
        }
        if let Some(since) = self.closing_since {
            if since.elapsed() > CLOSE_GRACE {
                warn!("[{}] no LOGOUT reply, dropping socket", self.id());
                self.step(Event::TransportFailed(ImapError::ConnectionClosed));
                return;
            }
        }

        if !self.interrupted && !self.machine.is_busy() {
            match self.work.try_recv() {
                Ok(job) => {
                    self.accept(job);
                    return;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.interrupted = true;
                    self.step(Event::Shutdown);
                    return;
                }
            }
        }

        if self.machine.awaiting_server() {
            self.read_one();
            return;
        }

        match self.work.recv_timeout(POLL_INTERVAL) {
            Ok(job) if !self.interrupted => self.accept(job),
            Ok(job) => self.observer.return_job(job),
            Err(RecvTimeoutError::Timeout) => {
                if self.last_activity.elapsed() >= IDLE_DELAY && !self.interrupted {
                    self.step(Event::EnterIdle);
                    self.last_activity = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !self.interrupted {
                    self.interrupted = true;
                    self.step(Event::Shutdown);
                }
            }
        }
    }

    fn accept(&mut self, job: Job) {
        if job.consumer.is_cancelled() {
            debug!("[{}] skipping cancelled {}", self.id(), job.request.kind.name());
            let ready = matches!(
                self.machine.state(),
                ConnectionState::Authenticated | ConnectionState::Selected | ConnectionState::Idling
            );
            if ready {
                self.observer
                    .connection_ready(self.machine.id(), self.machine.selected_mailbox());
            }
            return;
        }
        self.consumers.insert(job.request.id, job.consumer);
        self.last_activity = Instant::now();
        self.step(Event::Work(job.request));
    }

    fn read_one(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            self.step(Event::TransportFailed(ImapError::ConnectionClosed));
            return;
        };
        match self.responses.read_response(reader) {
            Ok(raw) => {
                trace!("[{}] S: {}", self.machine.id(), raw.first_line());
                self.last_activity = Instant::now();
                match parse_response(raw) {
                    Ok(response) => self.step(Event::Response(response)),
                    Err(e) => warn!("[{}] skipping unparsable response: {}", self.id(), e),
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => self.step(Event::TransportFailed(e.into())),
        }
    }

    fn step(&mut self, event: Event) {
        let mut queue: VecDeque<Effect> = self.machine.step(event).into();
        while let Some(effect) = queue.pop_front() {
            if let Some(next) = self.apply(effect) {
                queue.extend(self.machine.step(next));
            }
        }
        if self.closing_since.is_none() && self.machine.state() == ConnectionState::Closing {
            self.closing_since = Some(Instant::now());
        }
    }

    /// Carries out one effect; may produce a follow-up event.
    fn apply(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Send { line, sensitive } => {
                trace!("[{}] C: {}", self.id(), loggable(&line, sensitive));
                match self.write_line(&line) {
                    Ok(()) => None,
                    Err(e) => Some(Event::TransportFailed(e.into())),
                }
            }
            Effect::UpgradeTls => match self.upgrade() {
                Ok(()) => Some(Event::TlsEstablished),
                Err(e) => {
                    error!("[{}] TLS upgrade failed: {}", self.id(), e);
                    Some(Event::TransportFailed(e))
                }
            },
            Effect::Notify(notification) => {
                notification.deliver();
                None
            }
            Effect::Finished { request, result } => {
                match self.consumers.remove(&request) {
                    Some(consumer) => consumer.finish(result),
                    None => warn!("[{}] result for unknown request {}", self.id(), request),
                }
                None
            }
            Effect::Abort {
                error,
                request,
                retry,
            } => {
                match request {
                    Some(request) => match self.consumers.remove(&request.id) {
                        Some(consumer) if retry && !consumer.is_dead() => {
                            info!(
                                "[{}] retrying {} on a new connection: {}",
                                self.id(),
                                request.kind.name(),
                                error
                            );
                            self.observer.return_job(Job { request, consumer });
                        }
                        Some(consumer) => consumer.finish(Err(error)),
                        None => warn!("[{}] abort for unknown request {}", self.id(), request.id),
                    },
                    None => warn!("[{}] connection failed without a request: {}", self.id(), error),
                }
                None
            }
            Effect::Requeue(request) => {
                if let Some(consumer) = self.consumers.remove(&request.id) {
                    self.observer.return_job(Job { request, consumer });
                }
                None
            }
            Effect::Ready => {
                self.last_activity = Instant::now();
                self.observer
                    .connection_ready(self.machine.id(), self.machine.selected_mailbox());
                None
            }
            Effect::Close => {
                if let Some(reader) = self.reader.take() {
                    // Already-closed sockets report NotConnected.
                    let _ = reader.get_ref().tcp().shutdown(Shutdown::Both);
                }
                None
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let stream = reader.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()
    }

    fn upgrade(&mut self) -> Result<(), ImapError> {
        let reader = self.reader.take().ok_or(ImapError::ConnectionClosed)?;
        if !reader.buffer().is_empty() {
            // Bytes after the STARTTLS reply could be injected plaintext.
            return Err(ImapError::Tls("unexpected data before TLS handshake".into()));
        }
        let tcp = match reader.into_inner() {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => return Err(ImapError::Tls("TLS already active".into())),
        };
        tcp.set_read_timeout(None)?;
        let stream = self.factory.start_tls(tcp)?;
        stream.tcp().set_read_timeout(Some(POLL_INTERVAL))?;
        info!("[{}] TLS established", self.id());
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    fn teardown(mut self) {
        let id = self.id();
        for (_, consumer) in self.consumers.drain() {
            consumer.finish(Err(ImapError::ConnectionClosed));
        }
        self.observer.connection_closed(id);
        for job in self.work.try_iter() {
            self.observer.return_job(job);
        }
        debug!("[{}] connection thread exiting", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::request::{request_channel, RequestKind, RequestOutcome};
    use std::io::{BufRead, BufReader as StdBufReader};
    use std::net::TcpListener;
    use std::sync::Mutex;

    struct LocalFactory(u16);

    impl ConnectionFactory for LocalFactory {
        fn connect(&self) -> Result<Stream, ImapError> {
            Ok(Stream::Plain(TcpStream::connect(("127.0.0.1", self.0))?))
        }

        fn start_tls(&self, _tcp: TcpStream) -> Result<Stream, ImapError> {
            Err(ImapError::Tls("not in tests".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        ready: Mutex<Vec<Uuid>>,
        closed: Mutex<Vec<Uuid>>,
        returned: Mutex<Vec<Job>>,
    }

    impl ConnectionObserver for Recorder {
        fn connection_ready(&self, id: Uuid, _selected: Option<&str>) {
            self.ready.lock().unwrap().push(id);
        }

        fn connection_closed(&self, id: Uuid) {
            self.closed.lock().unwrap().push(id);
        }

        fn return_job(&self, job: Job) {
            self.returned.lock().unwrap().push(job);
        }
    }

    fn setup(port: u16, observer: Arc<Recorder>) -> ConnectionSetup {
        let mut account = AccountConfig::new("127.0.0.1", port, "tim");
        account.password = Some("pw".into());
        account.tls_policy = TlsPolicy::Never;
        let registry = Arc::new(HostSessionRegistry::new());
        registry.register(&account.server_key(), &account);
        ConnectionSetup {
            options: ConnectionOptions::from_account(&account),
            factory: Arc::new(LocalFactory(port)),
            registry,
            server_sink: None,
            authenticator: None,
            observer,
        }
    }

    #[test]
    fn test_runs_job_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut lines = StdBufReader::new(socket).lines();
            writer.write_all(b"* OK [CAPABILITY IMAP4rev1] hi\r\n").unwrap();
            let login = lines.next().unwrap().unwrap();
            assert_eq!(login, "A1 LOGIN \"tim\" \"pw\"");
            writer.write_all(b"A1 OK welcome\n").unwrap();
            assert_eq!(lines.next().unwrap().unwrap(), "A2 CREATE \"Work\"");
            writer.write_all(b"A2 OK created\r\n").unwrap();
            assert_eq!(lines.next().unwrap().unwrap(), "A3 LOGOUT");
            writer.write_all(b"* BYE\r\nA3 OK bye\r\n").unwrap();
        });

        let recorder = Arc::new(Recorder::default());
        let request = ImapRequest::new(RequestKind::Create {
            path: "Work".into(),
        });
        let (consumer, handle) = request_channel(request.id);
        let mut connection =
            spawn(setup(port, Arc::clone(&recorder)), Some(Job { request, consumer })).unwrap();

        assert_eq!(handle.wait().unwrap(), RequestOutcome::Completed);
        connection.close();
        connection.join();
        server.join().unwrap();

        assert_eq!(*recorder.closed.lock().unwrap(), vec![connection.id()]);
        assert!(!recorder.ready.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connect_failure_hands_job_back() {
        // Bind then drop so the port refuses connections.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let recorder = Arc::new(Recorder::default());
        let request = ImapRequest::new(RequestKind::Noop);
        let (consumer, _handle) = request_channel(request.id);
        let mut connection =
            spawn(setup(port, Arc::clone(&recorder)), Some(Job { request, consumer })).unwrap();
        connection.join();

        let returned = recorder.returned.lock().unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].request.attempts, 1);
        assert_eq!(recorder.closed.lock().unwrap().len(), 1);
    }
}
