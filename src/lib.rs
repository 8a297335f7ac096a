/*!
A self-electing WebSocket relay that carries a file from the command line to a browser tab.

wsrelay moves one binary payload per invocation from a CLI to a web page listening on a
local WebSocket. There is no separate server to start: the first invocation finds nobody
listening, binds the endpoint and becomes the relay; every later invocation connects to it,
sends its file and exits.

# Overview

Three roles share one process image:

* **Sender**: connects to the relay, writes the file as a single binary message, then waits
  for the relay to close the connection. The close is the delivery receipt.
* **Broker**: accepts any number of WebSocket peers. A peer that sends a text message starting
  with `{"from":"web"` (or connects with `?from=web`) is the browser. Binary messages go to
  the browser, or to every other peer when no browser is connected, and the connection that
  carried them is then closed.
* **Bootstrap**: tries to be a sender; if nothing answers, becomes the broker.

Everything runs on plain threads over `std::net`. No async runtime is required.

# Quick Start

Relay a file from code:

```no_run
use std::path::Path;
use wsrelay::bootstrap::{self, Outcome};
use wsrelay::config::Config;

let config = Config::default().with_board("uno");
match bootstrap::run(Path::new("build/sketch.ino.hex"), &config) {
    Ok(Outcome::Delivered(delivery)) => println!("sent {} bytes", delivery.bytes),
    Ok(Outcome::ShutDown) => println!("relay stopped"),
    Err(e) => {
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}
```

Or run a relay on an ephemeral port and watch who connects:

```no_run
use wsrelay::broker::Broker;
use wsrelay::config::Config;

let broker = Broker::bind(&Config::default().with_addr("127.0.0.1:0")).unwrap();
let handle = broker.handle();
let relay = std::thread::spawn(move || broker.run());
println!("relay on {}, browser: {:?}", handle.local_addr(), handle.browser());
handle.shutdown();
relay.join().unwrap().unwrap();
```

# Logging

Internal events are logged with [logwise](https://sealedabstract.com/code/logwise). Progress a
person should read (which role was taken, where a payload went) is printed to stderr prefixed
with `[sender]` or `[relay]`.
*/

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod logging;
pub mod sender;
pub mod websocket;
pub mod wire;
