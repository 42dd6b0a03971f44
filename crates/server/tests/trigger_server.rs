//! End-to-end tests driving the trigger server over real sockets

use anyhow::bail;
use crossbeam_channel::{unbounded, Receiver};
use hookserver::{ServerError, ServerOptions, ShutdownHandle, TriggerServer};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_TIMEOUT: Duration = Duration::from_millis(300);

fn options() -> ServerOptions {
    ServerOptions {
        host: IpAddr::from([127, 0, 0, 1]),
        ports: 0..=0,
        lines_per_request: 2,
        idle_timeout: IDLE_TIMEOUT,
        max_line_len: 1024,
        max_handler_failures: 3,
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    calls: Receiver<Vec<String>>,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn stop(self) -> Result<(), ServerError> {
        self.shutdown.shutdown();
        self.thread.join().unwrap()
    }
}

/// Start a server that echoes requests back; a first line of "fail" makes
/// the handler return an error and "panic" makes it panic
fn start(options: ServerOptions) -> Running {
    let server = TriggerServer::bind(options).unwrap();
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let (tx, calls) = unbounded();

    let thread = thread::spawn(move || {
        server.run(
            move |lines: &[String], reply: &mut dyn Write, _peer: SocketAddr| {
                tx.send(lines.to_vec()).unwrap();
                match lines[0].as_str() {
                    "fail" => bail!("handler failed"),
                    "panic" => panic!("handler panicked"),
                    _ => {}
                }
                writeln!(reply, "got {}", lines.join(" "))?;
                writeln!(reply, "OK")?;
                Ok(())
            },
        )
    });

    Running {
        addr,
        shutdown,
        calls,
        thread,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_reply(mut stream: TcpStream) -> String {
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    reply
}

#[test]
fn test_single_write_request() {
    let server = start(options());

    let mut client = connect(server.addr);
    client.write_all(b"secret\nrev1234\n").unwrap();

    assert_eq!(read_reply(client), "got secret rev1234\nOK\n");
    assert_eq!(server.calls.try_recv().unwrap(), vec!["secret", "rev1234"]);
    server.stop().unwrap();
}

#[test]
fn test_split_writes_frame_identically() {
    let server = start(options());

    let mut client = connect(server.addr);
    client.write_all(b"sec").unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"ret\nrev1").unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"234\n").unwrap();

    assert_eq!(read_reply(client), "got secret rev1234\nOK\n");
    server.stop().unwrap();
}

#[test]
fn test_idle_connection_is_evicted() {
    let server = start(options());

    let mut client = connect(server.addr);
    client.write_all(b"secret\n").unwrap();

    assert_eq!(read_reply(client), "timed out\nERROR\n");
    assert!(server.calls.try_recv().is_err());
    server.stop().unwrap();
}

#[test]
fn test_early_close_skips_handler() {
    let server = start(options());

    let mut client = connect(server.addr);
    client.write_all(b"secret\n").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    assert_eq!(read_reply(client), "");
    assert!(server.calls.recv_timeout(IDLE_TIMEOUT).is_err());
    server.stop().unwrap();
}

#[test]
fn test_unterminated_last_line_counts_on_close() {
    let server = start(options());

    let mut client = connect(server.addr);
    client.write_all(b"secret\nrev1234").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    assert_eq!(read_reply(client), "got secret rev1234\nOK\n");
    server.stop().unwrap();
}

#[test]
fn test_slow_client_does_not_block_others() {
    let server = start(options());

    let mut idle = connect(server.addr);
    idle.write_all(b"secret\n").unwrap();

    let mut client = connect(server.addr);
    client.write_all(b"a\nb\n").unwrap();
    assert_eq!(read_reply(client), "got a b\nOK\n");

    assert_eq!(read_reply(idle), "timed out\nERROR\n");
    server.stop().unwrap();
}

#[test]
fn test_handler_failure_is_isolated() {
    let server = start(options());

    for first in ["fail", "panic"] {
        let mut client = connect(server.addr);
        write!(client, "{}\nrev\n", first).unwrap();
        assert_eq!(read_reply(client), "internal server error\nERROR\n");
    }

    let mut client = connect(server.addr);
    client.write_all(b"secret\nrev\n").unwrap();
    assert_eq!(read_reply(client), "got secret rev\nOK\n");

    assert_eq!(server.calls.try_iter().count(), 3);
    server.stop().unwrap();
}

#[test]
fn test_consecutive_failures_stop_server() {
    let server = start(options());

    for _ in 0..3 {
        let mut client = connect(server.addr);
        client.write_all(b"fail\nrev\n").unwrap();
        assert_eq!(read_reply(client), "internal server error\nERROR\n");
    }

    let result = server.thread.join().unwrap();
    assert!(matches!(result, Err(ServerError::TooManyFailures(3))));
}

#[test]
fn test_port_range_exhausted() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut options = options();
    options.ports = port..=port;
    let result = TriggerServer::bind(options);
    assert!(matches!(result, Err(ServerError::NoFreePort { .. })));
}

#[test]
fn test_first_free_port_wins() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut options = options();
    options.ports = port..=port.saturating_add(20);
    match TriggerServer::bind(options) {
        Ok(server) => assert!(server.port() > port),
        // Every neighbour happened to be taken as well
        Err(ServerError::NoFreePort { .. }) => {}
        Err(e) => panic!("unexpected error: {}", e),
    }
}
