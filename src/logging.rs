//! User-facing progress notices.
//!
//! Internal diagnostics go through `logwise`. The handful of lines a person at
//! the terminal is meant to read (which role this process took, where the
//! payload went) are written here instead, tagged with the role that printed
//! them:
//!
//! ```
//! # mod logging {
//! #     pub fn notice(tag: &str, str: &str) {
//! #         eprintln!("[{}] {}", tag, str);
//! #     }
//! # }
//! # use logging::notice;
//! notice("sender", "Sent 4096 bytes");
//! // prints "[sender] Sent 4096 bytes" to stderr
//! ```

/// Tag for notices printed by the broker.
pub const RELAY: &str = "relay";
/// Tag for notices printed by the sender.
pub const SENDER: &str = "sender";

/// Writes a notice to stderr so it never mixes with anything a caller pipes from stdout.
pub fn notice(tag: &str, str: &str) {
    eprintln!("[{}] {}", tag, str);
}
