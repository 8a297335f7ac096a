//! The HTTP/1.1 upgrade that opens a WebSocket, for both ends.

use base64::Engine;
use sha1::Digest;
use std::collections::HashMap;

/// Requests with headers larger than this are rejected.
const MAX_HEADER_BYTES: usize = 16 * 1024;

//https://datatracker.ietf.org/doc/html/rfc6455#section-1.3
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = sha1::Sha1::default();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::prelude::BASE64_STANDARD.encode(hasher.finalize())
}

/// A fresh random `Sec-WebSocket-Key`.
pub fn new_client_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::prelude::BASE64_STANDARD.encode(nonce)
}

/// The 101 response completing a server-side upgrade.
pub fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n",
        accept = accept_key(key)
    )
}

/// The response sent before dropping a request that is not an upgrade.
pub fn rejection(status: &str) -> String {
    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
}

/// The upgrade request a client sends.
pub fn client_request(host: &str, path_and_query: &str, key: &str) -> String {
    format!(
        "GET {path_and_query} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    /// Everything after `?`, empty if absent.
    pub query: String,
    pub key: String,
    /// Bytes that arrived after the header block; they belong to the first frame.
    pub leftover: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    NotReady,
    Rejected(String),
    Upgrade(UpgradeRequest),
}

/// Splits off the header block, returning its lines and the offset of the body.
fn split_head(buf: &[u8]) -> Option<(Vec<&[u8]>, usize)> {
    let mut lines = Vec::new();
    let mut pos = 0;
    for line in buf.split(|c| *c == b'\n') {
        if pos + line.len() >= buf.len() {
            //last fragment has no newline yet
            return None;
        }
        pos += line.len() + 1;
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Some((lines, pos));
        }
        lines.push(line);
    }
    None
}

fn parse_headers(lines: &[&[u8]]) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    for line in lines {
        let mut split = line.splitn(2, |&b| b == b':');
        let key = split.next().unwrap_or_default();
        let val = split.next().ok_or_else(|| {
            format!("Invalid header line: {}", String::from_utf8_lossy(line))
        })?;
        //http headers are case-insensitive, so we convert to lowercase
        headers.insert(
            String::from_utf8_lossy(key).trim().to_lowercase(),
            String::from_utf8_lossy(val).trim().to_owned(),
        );
    }
    Ok(headers)
}

fn header_has_token(headers: &HashMap<String, String>, name: &str, token: &str) -> bool {
    headers
        .get(name)
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// Incremental parser for the client's upgrade request.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn pop(&mut self) -> ParseResult {
        let Some((lines, pos)) = split_head(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return ParseResult::Rejected("Header block too large".to_string());
            }
            return ParseResult::NotReady;
        };
        let Some((request_line, header_lines)) = lines.split_first() else {
            return ParseResult::Rejected("No request line found".to_string());
        };

        //get method, url and version
        let mut split_line = request_line.split(|&b| b == b' ');
        let (Some(method), Some(url), Some(_version)) =
            (split_line.next(), split_line.next(), split_line.next())
        else {
            return ParseResult::Rejected(format!(
                "Invalid request line: {}",
                String::from_utf8_lossy(request_line)
            ));
        };
        let headers = match parse_headers(header_lines) {
            Ok(headers) => headers,
            Err(reason) => return ParseResult::Rejected(reason),
        };

        let url = String::from_utf8_lossy(url);
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_owned(), query.to_owned()),
            None => (url.into_owned(), String::new()),
        };
        if method != b"GET" || !header_has_token(&headers, "upgrade", "websocket") {
            return ParseResult::Rejected(format!(
                "Not a websocket upgrade: {}",
                String::from_utf8_lossy(request_line)
            ));
        }
        let Some(key) = headers.get("sec-websocket-key").filter(|k| !k.is_empty()) else {
            return ParseResult::Rejected("Missing Sec-WebSocket-Key".to_string());
        };
        ParseResult::Upgrade(UpgradeRequest {
            path,
            query,
            key: key.clone(),
            leftover: self.buf[pos..].to_vec(),
        })
    }
}

/// Outcome of reading the server's reply to our upgrade request.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseResult {
    NotReady,
    Rejected(String),
    /// Upgrade accepted; carries bytes that followed the header block.
    Accepted(Vec<u8>),
}

/// Incremental parser for the server's upgrade response.
#[derive(Debug)]
pub struct ResponseParser {
    buf: Vec<u8>,
    expected_accept: String,
}

impl ResponseParser {
    pub fn new(key: &str) -> ResponseParser {
        ResponseParser {
            buf: Vec::new(),
            expected_accept: accept_key(key),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn pop(&mut self) -> ResponseResult {
        let Some((lines, pos)) = split_head(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return ResponseResult::Rejected("Header block too large".to_string());
            }
            return ResponseResult::NotReady;
        };
        let Some((status_line, header_lines)) = lines.split_first() else {
            return ResponseResult::Rejected("No status line found".to_string());
        };
        let status = String::from_utf8_lossy(status_line);
        if status.split(' ').nth(1) != Some("101") {
            return ResponseResult::Rejected(format!("Unexpected status: {status}"));
        }
        let headers = match parse_headers(header_lines) {
            Ok(headers) => headers,
            Err(reason) => return ResponseResult::Rejected(reason),
        };
        match headers.get("sec-websocket-accept") {
            Some(accept) if *accept == self.expected_accept => {
                ResponseResult::Accepted(self.buf[pos..].to_vec())
            }
            Some(accept) => ResponseResult::Rejected(format!("Bad Sec-WebSocket-Accept: {accept}")),
            None => ResponseResult::Rejected("Missing Sec-WebSocket-Accept".to_string()),
        }
    }
}
