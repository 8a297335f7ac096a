//! Decides, per invocation, whether this process sends or relays.
//!
//! The first invocation finds nobody listening and becomes the relay; every
//! later invocation finds it and just sends. There is no lock file and no
//! tie-breaking: whoever binds the endpoint first is the relay, and a process
//! that loses the race between its failed connect and its bind simply tries
//! to send once more, this time to the winner.

use crate::broker::{self, Broker, BrokerError};
use crate::config::{Config, ConfigError};
use crate::logging::{RELAY, SENDER, notice};
use crate::sender::{self, Delivery, SendError};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Error {
    /// The process exit status for this error.
    ///
    /// Local problems (missing or unreadable file, bad options) are 1, a relay
    /// that cannot bind is 2. A transfer that broke midway has already been
    /// reported and exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::FileNotFound(_) | Error::Config(_) => 1,
            Error::Send(SendError::Transport(_)) => 0,
            Error::Send(_) => 1,
            Error::Broker(BrokerError::Config(_)) => 1,
            Error::Broker(_) => 2,
        }
    }
}

/// What [`attempt`] ended up doing.
#[derive(Debug)]
pub enum Decision {
    /// A relay was reachable and took the payload.
    Delivered(Delivery),
    /// Nobody was listening; this process now holds the endpoint.
    Promoted(Broker),
}

/// How [`run`] finished.
#[derive(Debug)]
pub enum Outcome {
    Delivered(Delivery),
    /// This process relayed until it was told to stop.
    ShutDown,
}

/// Sends `path` if a relay is reachable, otherwise binds the endpoint.
///
/// A promoted broker is returned bound but not yet running.
pub fn attempt(path: &Path, config: &Config) -> Result<Decision, Error> {
    config.validate()?;
    if !path.is_file() {
        return Err(Error::FileNotFound(path.to_owned()));
    }
    //an unreadable file is fatal; it must never lead to promotion
    let payload = sender::read_payload(path)?;
    notice(
        SENDER,
        &format!("Sending {} to {}", path.display(), config.addr),
    );
    match sender::send_payload(path, payload.clone(), config) {
        Ok(delivery) => return Ok(Decision::Delivered(delivery)),
        Err(SendError::ConnectionUnavailable { reason, .. }) => {
            notice(
                SENDER,
                &format!("No relay at {} ({reason}); starting one", config.addr),
            );
        }
        Err(e) => return Err(e.into()),
    }

    match Broker::bind(config) {
        Ok(broker) => Ok(Decision::Promoted(broker)),
        Err(e) if e.is_addr_in_use() => {
            logwise::info_sync!(
                "Lost the race for {addr}; sending again",
                addr = logwise::privacy::LogIt(&config.addr)
            );
            notice(
                SENDER,
                &format!("Another relay just started on {}; retrying", config.addr),
            );
            match sender::send_payload(path, payload, config) {
                Ok(delivery) => Ok(Decision::Delivered(delivery)),
                //the winner went away again; report why we couldn't take over
                Err(SendError::ConnectionUnavailable { .. }) => Err(e.into()),
                Err(other) => Err(other.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Runs one invocation to completion.
///
/// If this process is promoted, the relay runs in the foreground until
/// SIGINT or SIGTERM.
pub fn run(path: &Path, config: &Config) -> Result<Outcome, Error> {
    match attempt(path, config)? {
        Decision::Delivered(delivery) => {
            notice(
                SENDER,
                &format!("Delivered {} bytes; relay closed the connection", delivery.bytes),
            );
            Ok(Outcome::Delivered(delivery))
        }
        Decision::Promoted(broker) => {
            notice(
                SENDER,
                &format!(
                    "{} was not sent; open the simulator page, then run the upload again",
                    path.display()
                ),
            );
            relay(broker)?;
            Ok(Outcome::ShutDown)
        }
    }
}

/// Runs a relay without sending anything first.
pub fn serve(config: &Config) -> Result<(), Error> {
    config.validate()?;
    let broker = Broker::bind(config)?;
    relay(broker)
}

fn relay(broker: Broker) -> Result<(), Error> {
    if let Err(e) = broker::install_termination_hook(broker.handle()) {
        //still usable, it just can't shut down gracefully on a signal
        logwise::warn_sync!(
            "Can't install termination hook: {e}",
            e = logwise::privacy::LogIt(&e)
        );
    }
    notice(
        RELAY,
        &format!("Relaying on {}; press Ctrl-C to stop", broker.local_addr()),
    );
    broker.run()?;
    Ok(())
}
