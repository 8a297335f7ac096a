//! The long-lived relay.
//!
//! # Architecture
//!
//! The broker binds one endpoint and serves every connection on its own
//! threads:
//!
//! *   **Accept loop**: polls a non-blocking listener so it can notice shutdown,
//!     and spawns a handler thread per connection.
//! *   **Reader (handler) thread**: performs the upgrade, registers the peer,
//!     then reads messages and applies the relay policy to each.
//! *   **Writer thread**: drains the peer's outbound queue onto the socket, so a
//!     stalled peer only ever stalls its own writer.
//! *   **Reaper thread**: pings every peer once per liveness interval and evicts
//!     the ones that stayed silent for longer than the liveness timeout.
//!
//! # Relay policy
//!
//! *   Text is broadcast verbatim to every peer, the author included. Text
//!     containing [`wire::BROWSER_MARKER`] makes its author the browser, unless
//!     a browser is already connected.
//! *   Binary is a payload. It goes to the browser if there is one and it is
//!     still open, otherwise to every other peer. The author's connection is
//!     then closed by the broker: one payload per connection.
//!
//! All peer state lives in one mutex-guarded [`PeerTable`](peer::PeerTable);
//! errors on one connection tear down that connection only.

pub mod peer;

use crate::config::{Config, ConfigError};
use crate::logging::{RELAY, notice};
use crate::websocket::{self, GOING_AWAY, Message, NORMAL_CLOSURE, Websocket, Writer};
use crate::wire;
use peer::{Forwarded, Outbound, PeerId, PeerInfo, PeerTable, Role};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long shutdown waits for connections to finish their close handshake.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Can't resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Can't bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// True if another process already holds the endpoint.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, BrokerError::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse)
    }
}

/// State shared by every broker thread.
#[derive(Debug)]
struct Shared {
    table: Mutex<PeerTable>,
    shutdown: AtomicBool,
    connections: AtomicUsize,
    config: Config,
    local_addr: SocketAddr,
}

/// What a reader loop does after handling one message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PeerTable> {
        //a panicking handler must not take the whole broker down with it
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Applies the relay policy to one message from `id`.
    fn handle(&self, id: PeerId, message: Message) -> Flow {
        let mut table = self.lock();
        if !table.touch(id) {
            //evicted while we were blocked in read
            return Flow::Stop;
        }
        let Some(addr) = table.get(id).map(|peer| peer.addr) else {
            return Flow::Stop;
        };
        match message {
            Message::Text(text) => {
                logwise::info_sync!(
                    "Text from {addr}: {text}",
                    addr = logwise::privacy::LogIt(&addr),
                    text = logwise::privacy::LogIt(&text)
                );
                let is_marker = wire::is_browser_marker(&text);
                table.broadcast(&Message::Text(text), None);
                if is_marker && table.classify_browser(id) {
                    notice(RELAY, &format!("Browser connected from {addr}"));
                }
                Flow::Continue
            }
            Message::Binary(payload) => {
                let len = payload.len();
                table.mark_sender(id);
                match table.forward(id, payload) {
                    Forwarded::Browser(browser) => {
                        let browser_addr = table.get(browser).map(|peer| peer.addr);
                        notice(
                            RELAY,
                            &format!("Forwarded {len} bytes from {addr} to the browser"),
                        );
                        logwise::info_sync!(
                            "Payload of {len} bytes forwarded to {browser}",
                            len = logwise::privacy::LogIt(&len),
                            browser = logwise::privacy::LogIt(&browser_addr)
                        );
                    }
                    Forwarded::Broadcast(recipients) => {
                        notice(
                            RELAY,
                            &format!(
                                "No browser connected; {len} bytes from {addr} broadcast to {recipients} peer(s)"
                            ),
                        );
                        if let Some(peer) = table.get(id) {
                            peer.send(Message::Text(wire::NO_BROWSER_WARNING.to_string()));
                        }
                    }
                }
                //one payload per connection
                if let Some(peer) = table.get(id) {
                    peer.close(NORMAL_CLOSURE);
                }
                Flow::Stop
            }
            Message::Ping(data) => {
                if let Some(peer) = table.get(id) {
                    peer.send(Message::Pong(data));
                }
                Flow::Continue
            }
            Message::Pong(_) => Flow::Continue,
            Message::Close(_) => {
                if let Some(peer) = table.get(id) {
                    peer.close(NORMAL_CLOSURE);
                }
                Flow::Stop
            }
        }
    }

    /// Removes `id` and tells the others it left.
    fn disconnect(&self, id: PeerId) {
        let mut table = self.lock();
        let Some(peer) = table.remove(id) else {
            return;
        };
        if peer.role == Role::Browser {
            notice(RELAY, &format!("Browser {} disconnected", peer.addr));
        }
        logwise::info_sync!(
            "Peer {addr} left",
            addr = logwise::privacy::LogIt(&peer.addr)
        );
        table.broadcast(&Message::Text(wire::departure_notice(&peer.addr)), None);
    }

    /// Evicts silent peers and pings the rest.
    fn check_liveness(&self, now: Instant) {
        let mut table = self.lock();
        for id in table.stale(now, self.config.liveness_timeout) {
            if let Some(peer) = table.remove(id) {
                logwise::warn_sync!(
                    "Evicting {addr}: silent for longer than {timeout}",
                    addr = logwise::privacy::LogIt(&peer.addr),
                    timeout = logwise::privacy::LogIt(&self.config.liveness_timeout)
                );
                peer.kill();
                table.broadcast(&Message::Text(wire::departure_notice(&peer.addr)), None);
            }
        }
        table.broadcast(&Message::Ping(Vec::new()), None);
    }
}

/// Counts a live handler thread for the duration of its scope.
struct ConnectionGuard<'a>(&'a AtomicUsize);

impl<'a> ConnectionGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard(counter)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A cloneable handle for observing and stopping a broker from other threads.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    shared: Arc<Shared>,
}

impl BrokerHandle {
    /// Asks the broker to stop. [`Broker::run`] returns once it has closed every peer.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.lock().snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.lock().len()
    }

    /// The peer currently classified as the browser.
    pub fn browser(&self) -> Option<PeerInfo> {
        let table = self.shared.lock();
        let id = table.browser()?;
        table.get(id).map(|peer| PeerInfo {
            id,
            addr: peer.addr,
            role: peer.role,
        })
    }
}

/// A bound, not yet running, broker.
#[derive(Debug)]
pub struct Broker {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Broker {
    /// Binds the configured endpoint exclusively.
    ///
    /// Bind failures (address in use, permission denied) are returned, never retried.
    pub fn bind(config: &Config) -> Result<Broker, BrokerError> {
        config.validate()?;
        let addrs: Vec<SocketAddr> = config
            .addr
            .to_socket_addrs()
            .map_err(|source| BrokerError::Resolve {
                addr: config.addr.clone(),
                source,
            })?
            .collect();
        let listener = TcpListener::bind(&addrs[..]).map_err(|source| BrokerError::Bind {
            addr: config.addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Broker {
            listener,
            shared: Arc::new(Shared {
                table: Mutex::new(PeerTable::new()),
                shutdown: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
                config: config.clone(),
                local_addr,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Serves peers until [`BrokerHandle::shutdown`] is called.
    pub fn run(self) -> Result<(), BrokerError> {
        let Broker { listener, shared } = self;
        listener.set_nonblocking(true)?;
        notice(
            RELAY,
            &format!("Server started on {}", shared.local_addr),
        );

        let reaper_shared = shared.clone();
        let reaper = std::thread::Builder::new()
            .name("wsrelay::reaper".to_string())
            .spawn(move || reap(&reaper_shared))?;

        while !shared.is_shutting_down() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    logwise::info_sync!(
                        "Accepted connection from {addr}",
                        addr = logwise::privacy::LogIt(&addr)
                    );
                    let handler_shared = shared.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("wsrelay::peer {addr}"))
                        .spawn(move || serve_peer(&handler_shared, stream, addr));
                    if let Err(e) = spawned {
                        logwise::error_sync!(
                            "Can't spawn a handler for {addr}: {e}",
                            addr = logwise::privacy::LogIt(&addr),
                            e = logwise::privacy::LogIt(&e)
                        );
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(wire::BACKOFF_DURATION);
                }
                Err(e) => {
                    //e.g. out of file descriptors; the listener itself is still fine
                    logwise::warn_sync!(
                        "Accept failed: {e}",
                        e = logwise::privacy::LogIt(&e)
                    );
                    std::thread::sleep(wire::BACKOFF_DURATION);
                }
            }
        }

        drop(listener);
        notice(RELAY, "Shutting down...");
        for peer in shared.lock().drain() {
            peer.close(GOING_AWAY);
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while shared.connections.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(wire::BACKOFF_DURATION);
        }
        if reaper.join().is_err() {
            logwise::error_sync!("Reaper thread panicked");
        }
        Ok(())
    }
}

/// Installs a SIGINT/SIGTERM hook that shuts the broker down cleanly.
///
/// Only one hook can be installed per process.
pub fn install_termination_hook(handle: BrokerHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || handle.shutdown())
}

fn reap(shared: &Shared) {
    let interval = shared.config.liveness_timeout;
    let mut next_check = Instant::now() + interval;
    while !shared.is_shutting_down() {
        std::thread::sleep(wire::BACKOFF_DURATION.min(interval));
        let now = Instant::now();
        if now >= next_check {
            shared.check_liveness(now);
            next_check = now + interval;
        }
    }
}

fn serve_peer(shared: &Shared, stream: TcpStream, addr: SocketAddr) {
    let _guard = ConnectionGuard::new(&shared.connections);
    if let Err(e) = stream.set_nonblocking(false) {
        logwise::warn_sync!(
            "Can't make {addr} blocking: {e}",
            addr = logwise::privacy::LogIt(&addr),
            e = logwise::privacy::LogIt(&e)
        );
        return;
    }
    let (websocket, upgrade) = match Websocket::accept(stream, shared.config.liveness_timeout) {
        Ok(accepted) => accepted,
        Err(e) => {
            logwise::warn_sync!(
                "Rejected connection from {addr}: {e}",
                addr = logwise::privacy::LogIt(&addr),
                e = logwise::privacy::LogIt(&e)
            );
            return;
        }
    };
    let socket = match websocket.shutdown_handle() {
        Ok(socket) => socket,
        Err(e) => {
            logwise::warn_sync!(
                "Can't clone socket for {addr}: {e}",
                addr = logwise::privacy::LogIt(&addr),
                e = logwise::privacy::LogIt(&e)
            );
            return;
        }
    };
    let (mut reader, writer) = websocket.split();
    let (outbox, inbox) = channel();
    let writer_thread = match std::thread::Builder::new()
        .name(format!("wsrelay::writer {addr}"))
        .spawn(move || write_loop(writer, inbox, addr))
    {
        Ok(handle) => handle,
        Err(e) => {
            logwise::error_sync!(
                "Can't spawn a writer for {addr}: {e}",
                addr = logwise::privacy::LogIt(&addr),
                e = logwise::privacy::LogIt(&e)
            );
            return;
        }
    };

    let id = {
        let mut table = shared.lock();
        if shared.is_shutting_down() {
            let _ = outbox.send(Outbound::Close(GOING_AWAY));
            None
        } else {
            let id = table.insert(addr, outbox, socket);
            if let Some(peer) = table.get(id) {
                peer.send(Message::Text(wire::WELCOME.to_string()));
            }
            if wire::is_browser_query(&upgrade.query) && table.classify_browser(id) {
                notice(RELAY, &format!("Browser connected from {addr}"));
            }
            Some(id)
        }
    };

    if let Some(id) = id {
        logwise::info_sync!(
            "Peer {addr} entered the room",
            addr = logwise::privacy::LogIt(&addr)
        );
        loop {
            let message = match reader.read() {
                Ok(message) => message,
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    logwise::warn_sync!(
                        "Dropping {addr}: {e}",
                        addr = logwise::privacy::LogIt(&addr),
                        e = logwise::privacy::LogIt(&e)
                    );
                    break;
                }
            };
            if shared.handle(id, message) == Flow::Stop {
                break;
            }
        }
        shared.disconnect(id);
    }

    if writer_thread.join().is_err() {
        logwise::error_sync!(
            "Writer for {addr} panicked",
            addr = logwise::privacy::LogIt(&addr)
        );
    }
}

fn write_loop(mut writer: Writer, inbox: Receiver<Outbound>, addr: SocketAddr) {
    for outbound in inbox {
        let result = match outbound {
            Outbound::Message(message) => writer.send(message),
            Outbound::Close(code) => {
                let result = writer.send(Message::close(code));
                if result.is_ok() {
                    break;
                }
                result
            }
        };
        if let Err(e) = result {
            log_write_error(&e, addr);
            break;
        }
    }
    writer.shutdown();
}

fn log_write_error(e: &websocket::Error, addr: SocketAddr) {
    if e.is_disconnect() {
        logwise::info_sync!(
            "{addr} went away while writing",
            addr = logwise::privacy::LogIt(&addr)
        );
    } else {
        logwise::warn_sync!(
            "Write to {addr} failed: {e}",
            addr = logwise::privacy::LogIt(&addr),
            e = logwise::privacy::LogIt(e)
        );
    }
}
