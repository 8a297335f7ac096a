//! A small blocking WebSocket implementation over [`TcpStream`].
//!
//! Browsers cannot accept inbound connections, so everything reaches the tab
//! through a WebSocket it opens to the relay. The relay speaks just enough of
//! RFC 6455 to carry text and binary messages in both directions, answer pings
//! and close cleanly. There is no async runtime: each connection is driven by
//! ordinary threads, one reading and (on the broker) one writing.
//!
//! A [`Websocket`] is opened with [`Websocket::accept`] on the server side or
//! [`Websocket::client`] on the client side, and can be split into a
//! [`Reader`] and a [`Writer`] so that both directions run concurrently.

pub mod frame;
pub mod handshake;

use frame::{Frame, FrameError, FrameParser, Opcode};
use handshake::{ParseResult, RequestParser, ResponseParser, ResponseResult, UpgradeRequest};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code used when the broker is shutting down.
pub const GOING_AWAY: u16 = 1001;

/// The status carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

impl Message {
    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::new(Opcode::Text, text.into_bytes()),
            Message::Binary(data) => Frame::new(Opcode::Binary, data),
            Message::Ping(data) => Frame::new(Opcode::Ping, data),
            Message::Pong(data) => Frame::new(Opcode::Pong, data),
            Message::Close(None) => Frame::new(Opcode::Close, Vec::new()),
            Message::Close(Some(close)) => {
                let mut payload = close.code.to_be_bytes().to_vec();
                payload.extend_from_slice(close.reason.as_bytes());
                //control frames are capped at 125 bytes
                payload.truncate(125);
                Frame::new(Opcode::Close, payload)
            }
        }
    }

    /// A close message with `code` and an empty reason.
    pub fn close(code: u16) -> Message {
        Message::Close(Some(CloseFrame {
            code,
            reason: String::new(),
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("Handshake rejected: {0}")]
    Handshake(String),
    #[error("Text message is not valid UTF-8")]
    InvalidUtf8,
    #[error("Data frame interleaved with an unfinished fragmented message")]
    Fragmentation,
    #[error("Connection closed by peer")]
    Closed,
}

impl Error {
    /// True if the error only says the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Which end of the connection we are. Clients mask their frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// The receiving half of a connection.
#[derive(Debug)]
pub struct Reader {
    tcp: TcpStream,
    frame_parser: FrameParser,
    partial: Option<(Opcode, Vec<u8>)>,
}

impl Reader {
    fn new(tcp: TcpStream, leftover: &[u8]) -> Reader {
        let mut frame_parser = FrameParser::new();
        frame_parser.push(leftover);
        Reader {
            tcp,
            frame_parser,
            partial: None,
        }
    }

    /// Blocks until a complete message arrives.
    ///
    /// Control messages are returned as soon as they arrive, even in the middle
    /// of a fragmented data message. End of stream is reported as [`Error::Closed`].
    pub fn read(&mut self) -> Result<Message, Error> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(message) = self.try_assemble()? {
                return Ok(message);
            }
            let read = match self.tcp.read(&mut buf) {
                Ok(0) => return Err(Error::Closed),
                Ok(read) => read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.frame_parser.push(&buf[..read]);
        }
    }

    fn try_assemble(&mut self) -> Result<Option<Message>, Error> {
        while let Some(frame) = self.frame_parser.parse()? {
            match frame.opcode {
                Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
                Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
                Opcode::Close => return Ok(Some(parse_close(&frame.payload))),
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(Error::Fragmentation);
                    }
                    if frame.fin {
                        return finish(frame.opcode, frame.payload).map(Some);
                    }
                    self.partial = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut data)) = self.partial.take() else {
                        return Err(Error::Fragmentation);
                    };
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return finish(opcode, data).map(Some);
                    }
                    self.partial = Some((opcode, data));
                }
            }
        }
        Ok(None)
    }
}

fn finish(opcode: Opcode, data: Vec<u8>) -> Result<Message, Error> {
    match opcode {
        Opcode::Text => String::from_utf8(data)
            .map(Message::Text)
            .map_err(|_| Error::InvalidUtf8),
        _ => Ok(Message::Binary(data)),
    }
}

fn parse_close(payload: &[u8]) -> Message {
    if payload.len() < 2 {
        return Message::Close(None);
    }
    Message::Close(Some(CloseFrame {
        code: u16::from_be_bytes([payload[0], payload[1]]),
        reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
    }))
}

/// The sending half of a connection.
#[derive(Debug)]
pub struct Writer {
    tcp: TcpStream,
    side: Side,
}

impl Writer {
    /// Writes one message as a single frame.
    pub fn send(&mut self, message: Message) -> Result<(), Error> {
        let mask = match self.side {
            Side::Client => Some(rand::random::<[u8; 4]>()),
            Side::Server => None,
        };
        let bytes = message.into_frame().encode(mask);
        self.tcp.write_all(&bytes)?;
        self.tcp.flush()?;
        Ok(())
    }

    /// Shuts the socket down in both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        //the peer may already be gone; nothing left to do in that case
        let _ = self.tcp.shutdown(Shutdown::Both);
    }
}

/// An open WebSocket connection.
#[derive(Debug)]
pub struct Websocket {
    reader: Reader,
    writer: Writer,
    peer_addr: SocketAddr,
}

impl Websocket {
    /// Performs the server side of the upgrade on a freshly accepted stream.
    ///
    /// The request must arrive within `timeout`. Any request target is
    /// accepted; requests that are not a WebSocket upgrade get a short HTTP
    /// error and are dropped.
    pub fn accept(stream: TcpStream, timeout: Duration) -> Result<(Websocket, UpgradeRequest), Error> {
        let peer_addr = stream.peer_addr()?;
        stream.set_read_timeout(Some(timeout))?;
        let mut parser = RequestParser::new();
        let mut buf = [0u8; 1024];
        let upgrade = loop {
            let read = (&stream).read(&mut buf)?;
            if read == 0 {
                return Err(Error::Closed);
            }
            parser.push(&buf[..read]);
            match parser.pop() {
                ParseResult::NotReady => {}
                ParseResult::Rejected(reason) => {
                    let _ = (&stream).write_all(handshake::rejection("400 Bad Request").as_bytes());
                    return Err(Error::Handshake(reason));
                }
                ParseResult::Upgrade(upgrade) => break upgrade,
            }
        };
        (&stream).write_all(handshake::switching_protocols(&upgrade.key).as_bytes())?;
        (&stream).flush()?;
        stream.set_read_timeout(None)?;
        let websocket = Websocket::from_stream(stream, &upgrade.leftover, Side::Server, peer_addr)?;
        Ok((websocket, upgrade))
    }

    /// Performs the client side of the upgrade on a connected stream.
    ///
    /// `path_and_query` is the request target, e.g. `/?from=cli`. The server's
    /// response must arrive within `timeout`.
    pub fn client(
        stream: TcpStream,
        host: &str,
        path_and_query: &str,
        timeout: Duration,
    ) -> Result<Websocket, Error> {
        let peer_addr = stream.peer_addr()?;
        let key = handshake::new_client_key();
        (&stream).write_all(handshake::client_request(host, path_and_query, &key).as_bytes())?;
        (&stream).flush()?;
        stream.set_read_timeout(Some(timeout))?;
        let mut parser = ResponseParser::new(&key);
        let mut buf = [0u8; 1024];
        let leftover = loop {
            let read = (&stream).read(&mut buf)?;
            if read == 0 {
                return Err(Error::Closed);
            }
            parser.push(&buf[..read]);
            match parser.pop() {
                ResponseResult::NotReady => {}
                ResponseResult::Rejected(reason) => return Err(Error::Handshake(reason)),
                ResponseResult::Accepted(leftover) => break leftover,
            }
        };
        stream.set_read_timeout(None)?;
        Websocket::from_stream(stream, &leftover, Side::Client, peer_addr)
    }

    fn from_stream(
        stream: TcpStream,
        leftover: &[u8],
        side: Side,
        peer_addr: SocketAddr,
    ) -> Result<Websocket, Error> {
        let write_stream = stream.try_clone()?;
        Ok(Websocket {
            reader: Reader::new(stream, leftover),
            writer: Writer {
                tcp: write_stream,
                side,
            },
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn read(&mut self) -> Result<Message, Error> {
        self.reader.read()
    }

    pub fn send(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send(message)
    }

    /// A clone of the underlying socket, for shutting it down from another thread.
    pub fn shutdown_handle(&self) -> Result<TcpStream, Error> {
        Ok(self.writer.tcp.try_clone()?)
    }

    /// Splits into independently owned halves.
    pub fn split(self) -> (Reader, Writer) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Websocket, Websocket, UpgradeRequest) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Websocket::accept(stream, Duration::from_secs(5)).unwrap()
        });
        let stream = TcpStream::connect(addr).unwrap();
        let client = Websocket::client(stream, &addr.to_string(), "/?from=test", Duration::from_secs(5))
            .unwrap();
        let (server, upgrade) = server.join().unwrap();
        (client, server, upgrade)
    }

    #[test]
    fn exchanges_text_and_binary_both_ways() {
        let (mut client, mut server, upgrade) = pair();
        assert_eq!(upgrade.query, "from=test");

        client.send(Message::Text("hello".to_string())).unwrap();
        assert_eq!(server.read().unwrap(), Message::Text("hello".to_string()));

        let payload: Vec<u8> = (0..70_000u32).map(|i| i as u8).collect();
        server.send(Message::Binary(payload.clone())).unwrap();
        assert_eq!(client.read().unwrap(), Message::Binary(payload));
    }

    #[test]
    fn reassembles_fragments_around_a_ping() {
        let (client, mut server, _) = pair();
        let (_, mut client_writer) = client.split();
        let mut bytes = Frame {
            fin: false,
            opcode: Opcode::Text,
            payload: b"hel".to_vec(),
        }
        .encode(Some([1, 1, 1, 1]));
        bytes.extend(Frame::new(Opcode::Ping, b"p".to_vec()).encode(Some([2, 2, 2, 2])));
        bytes.extend(Frame::new(Opcode::Continuation, b"lo".to_vec()).encode(Some([3, 3, 3, 3])));
        client_writer.tcp.write_all(&bytes).unwrap();

        assert_eq!(server.read().unwrap(), Message::Ping(b"p".to_vec()));
        assert_eq!(server.read().unwrap(), Message::Text("hello".to_string()));
    }

    #[test]
    fn close_frame_and_eof_are_reported() {
        let (mut client, mut server, _) = pair();
        server.send(Message::close(NORMAL_CLOSURE)).unwrap();
        assert_eq!(
            client.read().unwrap(),
            Message::Close(Some(CloseFrame {
                code: NORMAL_CLOSURE,
                reason: String::new()
            }))
        );
        server.shutdown_handle().unwrap().shutdown(Shutdown::Both).unwrap();
        let err = client.read().unwrap_err();
        assert!(err.is_disconnect(), "{err:?}");
    }
}
