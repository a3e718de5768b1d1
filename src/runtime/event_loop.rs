//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! mio readiness is edge-triggered, so every read or write event is
//! serviced until the socket reports would-block.
//!
//! A connection is registered for `READABLE` while its request is being
//! decoded and for `WRITABLE` only once the request is ready. The handler
//! runs on the first write-ready notification.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConnectionMode};
use crate::error::Result;
use crate::handler::MessageHandler;
use crate::protocol::Phase;
use crate::runtime::connection::{Connection, ReadOutcome, WriteOutcome};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

/// Registered socket plus its protocol state.
struct Session {
    stream: TcpStream,
    conn: Connection,
}

/// What to do with a connection after servicing an event.
enum Disposition {
    Keep,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    mode: ConnectionMode,
    read_chunk_size: usize,
    max_payload_size: usize,
    poll_timeout: Option<Duration>,
}

/// Stops a running `Server` from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Ask the loop to exit after the current iteration.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded readiness-driven server.
///
/// Owns its poll instance, listener, and every connection, so several
/// servers can run side by side in one process.
pub struct Server<H> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Slab<Session>,
    handler: H,
    settings: Settings,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    signals: Option<Signals>,
}

impl<H: MessageHandler> Server<H> {
    /// Bind the listening socket and register it for readiness.
    pub fn bind(config: &Config, handler: H) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let poll = Poll::new()?;

        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(addr = %local_addr, mode = ?config.mode, "Listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            local_addr,
            sessions: Slab::new(),
            handler,
            settings: Settings {
                mode: config.mode,
                read_chunk_size: config.read_chunk_size,
                max_payload_size: config.max_payload_size,
                poll_timeout: config.poll_timeout,
            },
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            signals: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            requested: Arc::clone(&self.shutdown),
        }
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve until SIGINT/SIGTERM or a `ShutdownHandle` fires.
    ///
    /// Connections still open at that point are dropped without draining.
    pub fn run(&mut self) -> io::Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        self.poll
            .registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        self.signals = Some(signals);

        while !self.shutdown.load(Ordering::Acquire) {
            self.run_once(self.settings.poll_timeout)?;
        }

        self.teardown();
        Ok(())
    }

    /// Wait for readiness once and dispatch every reported event.
    ///
    /// Returns the number of events handled. Only failures of the poll
    /// itself are returned; connection errors close that connection.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let registry = self.poll.registry();
        let mut handled = 0;

        for event in self.events.iter() {
            handled += 1;
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&self.listener, registry, &mut self.sessions, &self.settings);
                }
                WAKER_TOKEN => {}
                SIGNAL_TOKEN => {
                    if let Some(signals) = self.signals.as_mut() {
                        for signal in signals.pending() {
                            info!(signal, "Caught interrupt, exiting");
                            self.shutdown.store(true, Ordering::Release);
                        }
                    }
                }
                Token(conn_id) => {
                    let Some(session) = self.sessions.get_mut(conn_id) else {
                        continue;
                    };
                    let peer = session.conn.peer();

                    match service_connection(
                        conn_id,
                        event,
                        registry,
                        session,
                        &mut self.handler,
                        self.settings.mode,
                    ) {
                        Ok(Disposition::Keep) => {}
                        Ok(Disposition::Close) => {
                            close_connection(registry, &mut self.sessions, conn_id);
                        }
                        Err(e) => {
                            if e.is_peer_closed() {
                                debug!(conn_id, peer = %peer, "Peer closed");
                            } else {
                                warn!(conn_id, peer = %peer, error = %e, "Connection error");
                            }
                            close_connection(registry, &mut self.sessions, conn_id);
                        }
                    }
                }
            }
        }

        Ok(handled)
    }

    fn teardown(&mut self) {
        let registry = self.poll.registry();
        let abandoned = self.sessions.len();

        for mut session in self.sessions.drain() {
            let _ = registry.deregister(&mut session.stream);
        }
        if let Some(mut signals) = self.signals.take() {
            let _ = registry.deregister(&mut signals);
        }

        info!(abandoned, "Event loop stopped");
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    sessions: &mut Slab<Session>,
    settings: &Settings,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }

                let entry = sessions.vacant_entry();
                let conn_id = entry.key();
                if let Err(e) = registry.register(&mut stream, Token(conn_id), Interest::READABLE) {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    continue;
                }

                entry.insert(Session {
                    stream,
                    conn: Connection::new(
                        peer_addr,
                        settings.read_chunk_size,
                        settings.max_payload_size,
                    ),
                });

                debug!(conn_id, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn service_connection<H: MessageHandler + ?Sized>(
    conn_id: usize,
    event: &Event,
    registry: &Registry,
    session: &mut Session,
    handler: &mut H,
    mode: ConnectionMode,
) -> Result<Disposition> {
    let token = Token(conn_id);

    // A ready request is not read past; the peer may half-close after sending.
    if (event.is_readable() || event.is_read_closed())
        && session.conn.phase() != Phase::RequestReady
        && read_until_blocked(session)?
    {
        debug!(conn_id, peer = %session.conn.peer(), "Request ready");
        registry.reregister(&mut session.stream, token, Interest::WRITABLE)?;
    }

    if event.is_writable() && session.conn.phase() == Phase::RequestReady {
        session.conn.respond(handler)?;

        if write_until_blocked(session)? {
            match mode {
                ConnectionMode::SingleShot => return Ok(Disposition::Close),
                ConnectionMode::Persistent => {
                    let interest = if session.conn.recycle()? {
                        Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    registry.reregister(&mut session.stream, token, interest)?;
                }
            }
        }
    }

    Ok(Disposition::Keep)
}

/// Read until would-block or a complete request. Returns `true` when ready.
fn read_until_blocked(session: &mut Session) -> Result<bool> {
    loop {
        match session.conn.receive(&mut session.stream)? {
            ReadOutcome::NeedData => continue,
            ReadOutcome::WouldBlock => return Ok(false),
            ReadOutcome::RequestReady => return Ok(true),
        }
    }
}

/// Write until would-block or drained. Returns `true` when drained.
fn write_until_blocked(session: &mut Session) -> Result<bool> {
    loop {
        match session.conn.send(&mut session.stream)? {
            WriteOutcome::Partial(_) => continue,
            WriteOutcome::WouldBlock => return Ok(false),
            WriteOutcome::Drained => return Ok(true),
        }
    }
}

fn close_connection(registry: &Registry, sessions: &mut Slab<Session>, conn_id: usize) {
    if let Some(mut session) = sessions.try_remove(conn_id) {
        let _ = registry.deregister(&mut session.stream);
        debug!(
            conn_id,
            peer = %session.conn.peer(),
            cycles = session.conn.completed_cycles(),
            "Connection closed"
        );
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {listen:?}"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
