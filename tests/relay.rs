//! End-to-end relay behavior over real sockets on ephemeral ports.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wsrelay::bootstrap::{self, Decision};
use wsrelay::broker::peer::Role;
use wsrelay::broker::{Broker, BrokerError, BrokerHandle};
use wsrelay::config::Config;
use wsrelay::sender::{self, SendError};
use wsrelay::websocket::{CloseFrame, GOING_AWAY, Message, NORMAL_CLOSURE, Websocket};
use wsrelay::wire;

const PATIENCE: Duration = Duration::from_secs(5);
const BROWSER_HELLO: &str = r#"{"from":"web","version":1}"#;

struct Relay {
    handle: BrokerHandle,
    thread: JoinHandle<Result<(), BrokerError>>,
}

impl Relay {
    fn start(config: Config) -> Relay {
        let broker = Broker::bind(&config.with_addr("127.0.0.1:0")).unwrap();
        let handle = broker.handle();
        let thread = std::thread::spawn(move || broker.run());
        Relay { handle, thread }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    fn sender_config(&self) -> Config {
        Config::default().with_addr(self.addr().to_string())
    }

    fn stop(self) {
        self.handle.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

/// A test peer; reads time out instead of hanging the test.
struct Peer {
    websocket: Websocket,
    local_addr: SocketAddr,
}

impl Peer {
    fn connect(relay: &Relay, path_and_query: &str) -> Peer {
        let stream = TcpStream::connect(relay.addr()).unwrap();
        let local_addr = stream.local_addr().unwrap();
        let mut websocket =
            Websocket::client(stream, &relay.addr().to_string(), path_and_query, PATIENCE)
                .unwrap();
        websocket
            .shutdown_handle()
            .unwrap()
            .set_read_timeout(Some(PATIENCE))
            .unwrap();
        assert_eq!(
            websocket.read().unwrap(),
            Message::Text(wire::WELCOME.to_string())
        );
        Peer {
            websocket,
            local_addr,
        }
    }

    fn browser(relay: &Relay) -> Peer {
        let mut peer = Peer::connect(relay, "/");
        peer.send(Message::Text(BROWSER_HELLO.to_string()));
        assert_eq!(peer.next_text(), BROWSER_HELLO);
        wait_until(|| relay.handle.browser().map(|b| b.addr) == Some(peer.local_addr));
        peer
    }

    fn send(&mut self, message: Message) {
        self.websocket.send(message).unwrap();
    }

    fn read_timeout(&self, timeout: Duration) {
        self.websocket
            .shutdown_handle()
            .unwrap()
            .set_read_timeout(Some(timeout))
            .unwrap();
    }

    /// Next text message, skipping pings.
    fn next_text(&mut self) -> String {
        loop {
            match self.websocket.read().unwrap() {
                Message::Text(text) => return text,
                Message::Ping(_) => {}
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    /// Next binary message, skipping text and pings.
    fn next_binary(&mut self) -> Vec<u8> {
        loop {
            match self.websocket.read().unwrap() {
                Message::Binary(data) => return data,
                Message::Text(_) | Message::Ping(_) => {}
                other => panic!("expected binary, got {other:?}"),
            }
        }
    }

    /// Next close frame, skipping everything else.
    fn next_close(&mut self) -> Option<CloseFrame> {
        loop {
            if let Message::Close(close) = self.websocket.read().unwrap() {
                return close;
            }
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn payload_file(dir: &tempfile::TempDir, len: usize) -> (PathBuf, Vec<u8>) {
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join("sketch.ino.hex");
    std::fs::write(&path, &payload).unwrap();
    (path, payload)
}

#[test]
fn payload_reaches_the_browser() {
    let relay = Relay::start(Config::default());
    let mut browser = Peer::browser(&relay);
    let dir = tempfile::tempdir().unwrap();
    let (path, payload) = payload_file(&dir, 4096);

    let delivery = sender::send_file(&path, &relay.sender_config()).unwrap();
    assert_eq!(delivery.bytes, 4096);
    assert!(
        !delivery
            .received
            .contains(&wire::NO_BROWSER_WARNING.to_string())
    );
    assert_eq!(browser.next_binary(), payload);

    //the sender was closed and removed; only the browser is left
    wait_until(|| relay.handle.peer_count() == 1);
    assert_eq!(relay.handle.peers()[0].role, Role::Browser);
    relay.stop();
}

#[test]
fn sender_is_closed_after_one_payload() {
    let relay = Relay::start(Config::default());
    let mut browser = Peer::browser(&relay);
    let mut raw = Peer::connect(&relay, "/?from=cli");

    raw.send(Message::Binary(vec![1]));
    assert_eq!(
        raw.next_close().map(|close| close.code),
        Some(NORMAL_CLOSURE)
    );

    assert_eq!(browser.next_binary(), vec![1]);
    wait_until(|| relay.handle.peer_count() == 1);
    browser.read_timeout(Duration::from_millis(300));
    loop {
        match browser.websocket.read() {
            Ok(Message::Binary(data)) => panic!("payload relayed twice: {data:?}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    relay.stop();
}

#[test]
fn without_browser_payload_goes_to_everyone_else() {
    let relay = Relay::start(Config::default());
    let mut a = Peer::connect(&relay, "/");
    let mut b = Peer::connect(&relay, "/");
    let dir = tempfile::tempdir().unwrap();
    let (path, payload) = payload_file(&dir, 512);

    let delivery = sender::send_file(&path, &relay.sender_config()).unwrap();
    assert!(
        delivery
            .received
            .contains(&wire::NO_BROWSER_WARNING.to_string())
    );
    assert_eq!(a.next_binary(), payload);
    assert_eq!(b.next_binary(), payload);
    relay.stop();
}

#[test]
fn lone_sender_still_completes() {
    let relay = Relay::start(Config::default());
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = payload_file(&dir, 16);

    let delivery = sender::send_file(&path, &relay.sender_config()).unwrap();
    assert_eq!(delivery.bytes, 16);
    assert!(!delivery.acknowledged);
    wait_until(|| relay.handle.peer_count() == 0);
    relay.stop();
}

#[test]
fn text_is_mirrored_and_first_browser_sticks() {
    let relay = Relay::start(Config::default());
    let mut first = Peer::browser(&relay);
    let mut second = Peer::connect(&relay, "/");

    second.send(Message::Text(BROWSER_HELLO.to_string()));
    assert_eq!(second.next_text(), BROWSER_HELLO);
    assert_eq!(first.next_text(), BROWSER_HELLO);
    assert_eq!(
        relay.handle.browser().map(|b| b.addr),
        Some(first.local_addr)
    );

    let first_addr = first.local_addr;
    drop(first);
    assert_eq!(second.next_text(), wire::departure_notice(&first_addr));
    assert_eq!(relay.handle.browser(), None);

    second.send(Message::Text(BROWSER_HELLO.to_string()));
    assert_eq!(second.next_text(), BROWSER_HELLO);
    wait_until(|| relay.handle.browser().map(|b| b.addr) == Some(second.local_addr));
    relay.stop();
}

#[test]
fn browser_query_classifies_at_connect() {
    let relay = Relay::start(Config::default());
    let peer = Peer::connect(&relay, "/?from=web");
    wait_until(|| relay.handle.browser().map(|b| b.addr) == Some(peer.local_addr));
    relay.stop();
}

#[test]
fn silent_peers_are_evicted() {
    let relay = Relay::start(Config::default().with_liveness_timeout(Duration::from_millis(200)));
    let _silent = Peer::connect(&relay, "/");
    let mut chatty = Peer::connect(&relay, "/");

    let deadline = Instant::now() + PATIENCE;
    while relay.handle.peer_count() > 1 {
        assert!(Instant::now() < deadline, "silent peer was never evicted");
        chatty.send(Message::Ping(Vec::new()));
        std::thread::sleep(Duration::from_millis(50));
    }
    let peers = relay.handle.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr, chatty.local_addr);
    relay.stop();
}

#[test]
fn shutdown_closes_every_peer() {
    let relay = Relay::start(Config::default());
    let mut a = Peer::connect(&relay, "/");
    let mut b = Peer::browser(&relay);

    relay.stop();
    assert_eq!(a.next_close().map(|close| close.code), Some(GOING_AWAY));
    assert_eq!(b.next_close().map(|close| close.code), Some(GOING_AWAY));
}

#[test]
fn first_invocation_relays_and_second_sends() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let config = Config::default().with_addr(addr);
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = payload_file(&dir, 64);

    let broker = match bootstrap::attempt(&path, &config).unwrap() {
        Decision::Promoted(broker) => broker,
        Decision::Delivered(d) => panic!("nobody was listening, yet delivered {d:?}"),
    };
    let handle = broker.handle();
    let thread = std::thread::spawn(move || broker.run());

    match bootstrap::attempt(&path, &config).unwrap() {
        Decision::Delivered(delivery) => assert_eq!(delivery.bytes, 64),
        Decision::Promoted(_) => panic!("second invocation should have found the relay"),
    }
    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn racing_invocations_elect_one_relay() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let config = Config::default()
        .with_addr(addr)
        .with_connect_timeout(Duration::from_millis(300));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = payload_file(&dir, 8);
    let barrier = std::sync::Barrier::new(2);

    let (first, second) = std::thread::scope(|scope| {
        let race = || {
            barrier.wait();
            bootstrap::attempt(&path, &config)
        };
        let first = scope.spawn(race);
        let second = scope.spawn(race);
        (first.join().unwrap(), second.join().unwrap())
    });

    let mut promoted = 0;
    for outcome in [first, second] {
        match outcome {
            Ok(Decision::Promoted(_)) => promoted += 1,
            //the winner was bound but not yet serving, or already serving
            Ok(Decision::Delivered(_)) => {}
            Err(bootstrap::Error::Broker(e)) => assert!(e.is_addr_in_use(), "{e:?}"),
            Err(e) => panic!("unexpected failure: {e:?}"),
        }
    }
    assert_eq!(promoted, 1);
}

#[test]
fn malformed_frame_drops_only_its_peer() {
    let relay = Relay::start(Config::default());
    let mut browser = Peer::browser(&relay);
    let rogue = Peer::connect(&relay, "/");
    wait_until(|| relay.handle.peer_count() == 2);

    //masked, empty, reserved opcode 0x3
    let mut socket = rogue.websocket.shutdown_handle().unwrap();
    socket.write_all(&[0x83, 0x80, 0, 0, 0, 0]).unwrap();
    wait_until(|| relay.handle.peer_count() == 1);
    assert_eq!(
        relay.handle.browser().map(|b| b.addr),
        Some(browser.local_addr)
    );

    let dir = tempfile::tempdir().unwrap();
    let (path, payload) = payload_file(&dir, 256);
    sender::send_file(&path, &relay.sender_config()).unwrap();
    assert_eq!(browser.next_binary(), payload);
    relay.stop();
}

#[test]
fn browser_on_any_path_is_served() {
    let relay = Relay::start(Config::default());
    let mut browser = Peer::connect(&relay, "/ws?from=web");
    wait_until(|| relay.handle.browser().map(|b| b.addr) == Some(browser.local_addr));

    let dir = tempfile::tempdir().unwrap();
    let (path, payload) = payload_file(&dir, 32);
    sender::send_file(&path, &relay.sender_config()).unwrap();
    assert_eq!(browser.next_binary(), payload);
    relay.stop();
}

#[cfg(target_os = "linux")]
#[test]
fn unreadable_payload_never_promotes() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let config = Config::default().with_addr(addr.clone());

    let err = bootstrap::run(Path::new("/proc/self/mem"), &config).unwrap_err();
    assert!(
        matches!(err, bootstrap::Error::Send(SendError::ReadFile { .. })),
        "{err:?}"
    );
    assert_eq!(err.exit_code(), 1);
    std::net::TcpListener::bind(&addr).unwrap();
}
