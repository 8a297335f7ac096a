//! Runtime configuration shared by the sender, the broker and the bootstrap.

use crate::wire;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("liveness timeout must be greater than zero")]
    ZeroLivenessTimeout,
    #[error("connect timeout must be greater than zero")]
    ZeroConnectTimeout,
}

/// Settings for one invocation.
///
/// Defaults come from [`crate::wire`]; the command line overrides individual fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the broker binds and the sender connects to.
    pub addr: String,
    /// Bound on the sender's connect and upgrade.
    pub connect_timeout: Duration,
    /// Peers silent for longer than this are evicted by the broker.
    pub liveness_timeout: Duration,
    /// Optional board name announced before the payload.
    pub board: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: wire::ADDR.to_string(),
            connect_timeout: wire::CONNECT_TIMEOUT,
            liveness_timeout: wire::LIVENESS_TIMEOUT,
            board: None,
        }
    }
}

impl Config {
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_timeout.is_zero() {
            return Err(ConfigError::ZeroLivenessTimeout);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        Ok(())
    }
}
