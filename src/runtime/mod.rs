//! Networking runtime.
//!
//! A single-threaded mio event loop (epoll on Linux, kqueue on macOS)
//! driving one `Connection` state machine per accepted socket.

mod connection;
mod event_loop;

pub use connection::{Connection, ReadOutcome, WriteOutcome};
pub use event_loop::{Server, ShutdownHandle};

use crate::config::Config;
use crate::handler::SearchHandler;

/// Serve `config.listen` with the built-in search handler until interrupted.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut server = Server::bind(config, SearchHandler::new())?;
    server.run()
}
