//! The one-shot sender.
//!
//! A sender walks `Connecting → Sending → AwaitingClose → Done`:
//!
//! 1.  **Connecting**: one TCP connect plus the WebSocket upgrade, both bounded
//!     by [`Config::connect_timeout`]. Any failure here means no relay is
//!     listening, reported as [`SendError::ConnectionUnavailable`].
//! 2.  **Sending**: the file, read whole before connecting, is written as a
//!     single binary message, preceded by the optional text preamble (board change, circuit
//!     description).
//! 3.  **AwaitingClose**: the sender never closes first. A returned `send`
//!     says nothing about delivery; the relay closes the connection once it has
//!     passed the payload on, and that close is what completes the transfer.

use crate::config::Config;
use crate::logging::{SENDER, notice};
use crate::websocket::{self, Message, NORMAL_CLOSURE, Websocket};
use crate::wire;
use serde::{Deserialize, Serialize};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// A completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Size of the payload written.
    pub bytes: usize,
    /// Whether the acknowledgment token arrived before the close. Advisory.
    pub acknowledged: bool,
    /// Text messages received while waiting for the close.
    pub received: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Nothing answered at the endpoint; the caller may become the relay.
    #[error("No relay reachable at {addr}: {reason}")]
    ConnectionUnavailable { addr: String, reason: String },
    #[error("Can't read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The connection broke after it was established.
    #[error("Transfer failed: {0}")]
    Transport(#[from] websocket::Error),
}

#[derive(Serialize)]
struct BoardCommand<'a> {
    action: &'static str,
    board: &'a str,
}

#[derive(Serialize)]
struct CircuitCommand {
    action: &'static str,
    data: String,
}

#[derive(Deserialize)]
struct BuildOptions {
    #[serde(rename = "sketchLocation")]
    sketch_location: Option<String>,
}

/// Reads a payload whole. Done before any network activity.
pub fn read_payload(path: &Path) -> Result<Vec<u8>, SendError> {
    std::fs::read(path).map_err(|source| SendError::ReadFile {
        path: path.to_owned(),
        source,
    })
}

/// Delivers the file at `path` to the relay at `config.addr`.
pub fn send_file(path: &Path, config: &Config) -> Result<Delivery, SendError> {
    let payload = read_payload(path)?;
    send_payload(path, payload, config)
}

/// Delivers an already-read payload. `path` names it in notices and locates
/// the build directory for the preamble.
pub fn send_payload(path: &Path, payload: Vec<u8>, config: &Config) -> Result<Delivery, SendError> {
    let mut websocket = connect(config)?;
    logwise::info_sync!(
        "Connected to {addr}",
        addr = logwise::privacy::LogIt(&websocket.peer_addr())
    );

    for text in preamble(path, config) {
        websocket.send(Message::Text(text))?;
    }
    let bytes = payload.len();
    websocket.send(Message::Binary(payload))?;
    notice(
        SENDER,
        &format!("Sent {} ({bytes} bytes)", path.display()),
    );

    let (acknowledged, received) = await_close(&mut websocket)?;
    Ok(Delivery {
        bytes,
        acknowledged,
        received,
    })
}

fn connect(config: &Config) -> Result<Websocket, SendError> {
    let unavailable = |reason: String| SendError::ConnectionUnavailable {
        addr: config.addr.clone(),
        reason,
    };
    let addrs = config
        .addr
        .to_socket_addrs()
        .map_err(|e| unavailable(e.to_string()))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                let path_and_query = format!("/?{}", wire::SENDER_QUERY);
                return Websocket::client(stream, &config.addr, &path_and_query, config.connect_timeout)
                    .map_err(|e| unavailable(e.to_string()));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(unavailable(match last_error {
        Some(e) => e.to_string(),
        None => "address resolved to nothing".to_string(),
    }))
}

/// Text messages sent ahead of the payload.
fn preamble(path: &Path, config: &Config) -> Vec<String> {
    let mut texts = Vec::new();
    if let Some(board) = &config.board {
        let command = BoardCommand {
            action: "change-board",
            board,
        };
        match serde_json::to_string(&command) {
            Ok(text) => {
                notice(SENDER, &format!("Board changed to: {board}"));
                texts.push(text);
            }
            Err(e) => logwise::warn_sync!(
                "Can't encode board command: {e}",
                e = logwise::privacy::LogIt(&e)
            ),
        }
    }
    if let Some(text) = circuit_command(path) {
        texts.push(text);
    }
    texts
}

/// Looks for `websim.json` in the sketch directory recorded by the build.
///
/// Every step is optional: a missing or malformed file just means no circuit is sent.
fn circuit_command(path: &Path) -> Option<String> {
    let build_options = path.parent()?.join("build.options.json");
    let options = std::fs::read(&build_options).ok()?;
    let options: BuildOptions = serde_json::from_slice(&options).ok()?;
    let circuit_path = Path::new(&options.sketch_location?).join("websim.json");
    let data = std::fs::read_to_string(&circuit_path).ok()?;
    let command = CircuitCommand {
        action: "load-circuit-json",
        data,
    };
    let text = serde_json::to_string(&command).ok()?;
    notice(
        SENDER,
        &format!("Sending circuit from {}", circuit_path.display()),
    );
    Some(text)
}

/// Blocks until the relay closes the connection.
fn await_close(websocket: &mut Websocket) -> Result<(bool, Vec<String>), SendError> {
    let mut acknowledged = false;
    let mut received = Vec::new();
    loop {
        match websocket.read() {
            Ok(Message::Text(text)) => {
                notice(SENDER, &format!("received: {text}"));
                if text == wire::ACK_TOKEN {
                    acknowledged = true;
                }
                received.push(text);
            }
            Ok(Message::Binary(data)) => {
                logwise::info_sync!(
                    "Ignoring {len} binary bytes while waiting for close",
                    len = logwise::privacy::LogIt(&data.len())
                );
            }
            Ok(Message::Ping(data)) => match websocket.send(Message::Pong(data)) {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => break,
                Err(e) => return Err(e.into()),
            },
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                //reply so the relay sees a clean close; it may already be gone
                let _ = websocket.send(Message::close(NORMAL_CLOSURE));
                break;
            }
            Err(e) if e.is_disconnect() => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok((acknowledged, received))
}
