//! Wire-level constants shared by the sender and the broker.
//!
//! Everything a browser tab has to agree on with the relay lives here: the
//! endpoint, the marker that identifies the browser, and the advisory texts
//! the relay writes to its peers.

use std::time::Duration;

/// The default address the broker listens on and the sender connects to.
pub const ADDR: &str = "127.0.0.1:8887";

/// How long the sender waits for the TCP connect and the upgrade response.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default liveness timeout for idle peers.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(100);

/// The default backoff duration for polling loops.
pub const BACKOFF_DURATION: Duration = Duration::from_millis(10);

/// Substring identifying a text frame sent by the browser tab.
pub const BROWSER_MARKER: &str = r#"{"from":"web""#;

/// Query parameter a browser may put on the upgrade request instead of sending the marker.
pub const BROWSER_QUERY: &str = "from=web";

/// Query parameter the sender puts on its upgrade request.
pub const SENDER_QUERY: &str = "from=cli";

/// Reserved text a peer may send after a payload arrived. Advisory only.
pub const ACK_TOKEN: &str = "/cmd/received";

/// Text sent to every peer when it connects.
pub const WELCOME: &str = "Welcome to the WebSIM server!";

/// Text sent to a sender whose payload arrived while no browser was known.
pub const NO_BROWSER_WARNING: &str = "###### WARN: NO WEB Client connected !!";

/// Builds the notice broadcast when a peer leaves.
pub fn departure_notice(addr: &std::net::SocketAddr) -> String {
    format!("{addr} has left the room!")
}

/// True if `text` carries the browser marker.
pub fn is_browser_marker(text: &str) -> bool {
    text.contains(BROWSER_MARKER)
}

/// True if an upgrade request query string announces a browser.
pub fn is_browser_query(query: &str) -> bool {
    query.split('&').any(|pair| pair == BROWSER_QUERY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_matches_existing_pages() {
        assert_eq!(WELCOME, "Welcome to the WebSIM server!");
    }

    #[test]
    fn marker_matches_anywhere_in_text() {
        assert!(is_browser_marker(r#"{"from":"web","action":"hello"}"#));
        assert!(is_browser_marker(r#"prefix {"from":"web"}"#));
        assert!(!is_browser_marker(r#"{"from":"cli"}"#));
        assert!(!is_browser_marker(r#"{ "from": "web" }"#));
    }

    #[test]
    fn browser_query_is_matched_per_pair() {
        assert!(is_browser_query("from=web"));
        assert!(is_browser_query("x=1&from=web"));
        assert!(!is_browser_query("from=website"));
        assert!(!is_browser_query(SENDER_QUERY));
        assert!(!is_browser_query(""));
    }
}
