//! The `wsrelay` command line tool.
//!
//! # Architecture
//!
//! 1.  **Argument Parsing**: reads flags into a [`Config`] and picks out the file to send.
//! 2.  **Bootstrap**: sends the file to a running relay, or becomes the relay if none is running.
//! 3.  **Exit Status**: maps the outcome to the process exit code.

use std::path::PathBuf;
use std::time::Duration;
use wsrelay::bootstrap::{self, Outcome};
use wsrelay::config::Config;

/// What the command line asked for.
#[derive(Debug, PartialEq)]
enum Invocation {
    Help,
    Send(PathBuf, Config),
    Serve(Config),
}

fn main() {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    let invocation = match parse(args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Try: wsrelay --help");
            std::process::exit(1);
        }
    };
    let result = match invocation {
        Invocation::Help => {
            help();
            return;
        }
        Invocation::Send(path, config) => bootstrap::run(&path, &config).map(|outcome| {
            if let Outcome::Delivered(delivery) = outcome {
                if !delivery.acknowledged {
                    logwise::info_sync!("Relay closed without an acknowledgment");
                }
            }
        }),
        Invocation::Serve(config) => bootstrap::serve(&config),
    };
    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn parse(args: Vec<String>) -> Result<Invocation, String> {
    let mut config = Config::default();
    let mut path = None;
    let mut serve = false;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "--serve" => serve = true,
            "--addr" => config.addr = value(&arg, args.next())?,
            "--board" => config.board = Some(value(&arg, args.next())?),
            "--liveness-timeout" => {
                let secs = number(&arg, args.next())?;
                config.liveness_timeout = Duration::from_secs(secs);
            }
            "--connect-timeout" => {
                let millis = number(&arg, args.next())?;
                config.connect_timeout = Duration::from_millis(millis);
            }
            flag if flag.starts_with("--") => return Err(format!("Unknown option: {flag}")),
            _ => {
                if path.is_some() {
                    return Err(format!("Unexpected argument: {arg}"));
                }
                path = Some(PathBuf::from(arg));
            }
        }
    }
    config.validate().map_err(|e| e.to_string())?;
    match (serve, path) {
        (true, None) => Ok(Invocation::Serve(config)),
        (true, Some(_)) => Err("--serve does not take a file".to_string()),
        (false, Some(path)) => Ok(Invocation::Send(path, config)),
        (false, None) => Err("Missing file to send".to_string()),
    }
}

fn value(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{flag} needs a value"))
}

fn number(flag: &str, value: Option<String>) -> Result<u64, String> {
    let value = self::value(flag, value)?;
    value
        .parse()
        .map_err(|_| format!("{flag} expects a whole number, got {value}"))
}

fn help() {
    eprintln!("Relay a file from the command line to a browser tab over a local WebSocket");
    eprintln!();
    eprintln!("Usage: wsrelay [OPTIONS] <FILE>");
    eprintln!("       wsrelay --serve [OPTIONS]");
    eprintln!();
    eprintln!("The first invocation becomes the relay and keeps running; later ones send and exit.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --addr <HOST:PORT>         Relay endpoint (default 127.0.0.1:8887)");
    eprintln!("  --board <NAME>             Ask the browser to switch boards before loading");
    eprintln!("  --liveness-timeout <SECS>  Evict peers silent for this long (default 100)");
    eprintln!("  --connect-timeout <MILLIS> Give up on a relay after this long (default 2000)");
    eprintln!("  --serve                    Run the relay without sending anything");
    eprintln!("  -h, --help                 Show this help");
}
