//! Trigger server for boxsync
//!
//! A small line-oriented TCP server. Each client sends a fixed number of
//! newline-terminated lines and receives a textual reply ending in `OK` or
//! `ERROR`. All connections are multiplexed on one thread running a
//! current-thread tokio runtime; every connection has its own idle deadline
//! and the handler is invoked at most once per connection, never
//! concurrently.

pub mod connection;

pub use connection::{Connection, Framer, Progress};

use boxsync_core::ServerConfig;
use futures::stream::{FuturesUnordered, StreamExt};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Sent to a client that did not finish its request in time
pub const TIMEOUT_REPLY: &[u8] = b"timed out\nERROR\n";

/// Sent to a client whose request made the handler fail
pub const INTERNAL_ERROR_REPLY: &[u8] = b"internal server error\nERROR\n";

/// Errors raised by the trigger server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no free port in {first}..={last} on {host}")]
    NoFreePort { host: IpAddr, first: u16, last: u16 },

    #[error("failed to start the server runtime")]
    Runtime(#[source] io::Error),

    #[error("{0} consecutive requests failed, stopping server")]
    TooManyFailures(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Processes one complete request
pub trait Handler {
    /// Handle the `lines` a client sent, writing the reply to `reply`
    ///
    /// An `Err` (or a panic) is answered with a generic internal error and
    /// counts towards the server's failure threshold.
    fn handle(&mut self, lines: &[String], reply: &mut dyn Write, peer: SocketAddr)
        -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: FnMut(&[String], &mut dyn Write, SocketAddr) -> anyhow::Result<()>,
{
    fn handle(
        &mut self,
        lines: &[String],
        reply: &mut dyn Write,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        self(lines, reply, peer)
    }
}

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: IpAddr,
    /// Candidate ports, tried in order; `0..=0` lets the OS choose
    pub ports: RangeInclusive<u16>,
    /// Lines that make up one request
    pub lines_per_request: usize,
    pub idle_timeout: Duration,
    pub max_line_len: usize,
    /// Consecutive handler failures that stop the server; 0 never stops
    pub max_handler_failures: u32,
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig, lines_per_request: usize) -> Self {
        let (first, last) = config.port_range;
        Self {
            host: config.host,
            ports: first..=last,
            lines_per_request,
            idle_timeout: config.idle_timeout(),
            max_line_len: config.max_line_len,
            max_handler_failures: config.max_handler_failures,
        }
    }
}

/// Stops a running server from any thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Bound, not yet running trigger server
pub struct TriggerServer {
    listener: std::net::TcpListener,
    addr: SocketAddr,
    options: ServerOptions,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TriggerServer {
    /// Bind the first free port of the candidate range
    pub fn bind(options: ServerOptions) -> Result<Self, ServerError> {
        let listener = options
            .ports
            .clone()
            .find_map(|port| match std::net::TcpListener::bind((options.host, port)) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("Port {} unavailable: {}", port, e);
                    None
                }
            })
            .ok_or(ServerError::NoFreePort {
                host: options.host,
                first: *options.ports.start(),
                last: *options.ports.end(),
            })?;

        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("Listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            listener,
            addr,
            options,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Serve until shut down or until too many handler failures
    ///
    /// Blocks the calling thread, which becomes the server's event loop.
    pub fn run<H: Handler>(self, handler: H) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        runtime.block_on(self.serve(handler))
    }

    async fn serve<H: Handler>(self, mut handler: H) -> Result<(), ServerError> {
        let TriggerServer {
            listener,
            options,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
            ..
        } = self;
        let listener = TcpListener::from_std(listener)?;
        let mut pending = FuturesUnordered::new();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    debug!("Shutdown requested, dropping {} pending connections", pending.len());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        let conn = Connection {
                            stream,
                            peer,
                            framer: Framer::new(options.lines_per_request, options.max_line_len),
                        };
                        let deadline = Instant::now() + options.idle_timeout;
                        pending.push(read_request(conn, deadline));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some((conn, outcome)) = pending.next() => {
                    match outcome {
                        ReadOutcome::Done if conn.framer.is_complete() => {
                            if respond(&mut handler, conn, options.idle_timeout) {
                                failures = 0;
                            } else {
                                failures += 1;
                                if options.max_handler_failures > 0
                                    && failures >= options.max_handler_failures
                                {
                                    return Err(ServerError::TooManyFailures(failures));
                                }
                            }
                        }
                        ReadOutcome::Done => {
                            debug!(
                                "{} closed after {} of {} lines",
                                conn.peer,
                                conn.framer.lines().len(),
                                options.lines_per_request
                            );
                        }
                        ReadOutcome::TimedOut => {
                            info!("Connection from {} timed out", conn.peer);
                            let _ = conn.stream.try_write(TIMEOUT_REPLY);
                        }
                        ReadOutcome::Failed(e) => {
                            warn!("Read from {} failed: {}", conn.peer, e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

enum ReadOutcome {
    /// Request complete, line cap hit, or peer closed
    Done,
    TimedOut,
    Failed(io::Error),
}

async fn read_request(mut conn: Connection, deadline: Instant) -> (Connection, ReadOutcome) {
    let mut buf = vec![0u8; conn.framer.read_limit()];
    loop {
        let limit = conn.framer.read_limit();
        let read = match timeout_at(deadline, conn.stream.read(&mut buf[..limit])).await {
            Ok(read) => read,
            Err(_) => return (conn, ReadOutcome::TimedOut),
        };

        match read {
            Ok(0) => {
                conn.framer.finish();
                return (conn, ReadOutcome::Done);
            }
            Ok(n) => match conn.framer.feed(&buf[..n]) {
                Progress::Pending => {}
                Progress::Complete | Progress::Overflow => return (conn, ReadOutcome::Done),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (conn, ReadOutcome::Failed(e)),
        }
    }
}

/// Run the handler on a finished connection; false if it failed
fn respond<H: Handler>(handler: &mut H, conn: Connection, write_timeout: Duration) -> bool {
    let Connection {
        stream,
        peer,
        framer,
    } = conn;

    let mut stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Dropping request from {}: {}", peer, e);
            return true;
        }
    };
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_write_timeout(Some(write_timeout)))
    {
        warn!("Failed to configure reply stream for {}: {}", peer, e);
    }

    let lines = framer.into_lines();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle(&lines, &mut stream, peer)
    }));

    let failure = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => format!("{:#}", e),
        Err(_) => "handler panicked".to_string(),
    };
    error!("Request from {} failed: {}", peer, failure);
    let _ = stream.write_all(INTERNAL_ERROR_REPLY);
    false
}
