//! End-to-end server behavior over real sockets.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reactor_net::{EventLoopThread, ServerOptions, TcpServer};

/// Connect with retries: listen() is queued on the base loop, so an
/// immediate connect can race it and get refused.
fn connect(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                return stream;
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    panic!("connect to {addr} failed: {e}");
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

struct EchoServer {
    // Dropped last; keeps the base loop alive for the server's lifetime.
    _loop_thread: EventLoopThread,
    server: Arc<TcpServer>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

fn start_echo_server(options: ServerOptions) -> EchoServer {
    let loop_thread = EventLoopThread::start("echo-base").unwrap();
    let base_loop = loop_thread.event_loop().clone();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_loop, addr, "echo", options).unwrap();

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ev = events.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        ev.lock().push(if conn.connected() { "up" } else { "down" });
    }));
    let ev = events.clone();
    server.set_message_callback(Arc::new(move |conn, buf, _when| {
        ev.lock().push("msg");
        let data = buf.retrieve_all_as_string();
        conn.send(data.as_bytes());
    }));

    server.start().unwrap();

    EchoServer {
        _loop_thread: loop_thread,
        server,
        events,
    }
}

#[test]
fn test_echo_round_trip() {
    let echo = start_echo_server(ServerOptions::default());

    let mut client = connect(echo.server.local_addr());
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    client.write_all(b"hello reactor").unwrap();
    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello reactor");
}

#[test]
fn test_callback_order_up_msg_down() {
    let echo = start_echo_server(ServerOptions::default());

    {
        let mut client = connect(echo.server.local_addr());
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
    } // client drops; server observes EOF

    // Wait for the close path to run.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if echo.events.lock().last() == Some(&"down") {
            break;
        }
        assert!(Instant::now() < deadline, "close path never ran");
        std::thread::sleep(Duration::from_millis(10));
    }

    let events = echo.events.lock().clone();
    assert_eq!(events.first(), Some(&"up"));
    assert_eq!(events.last(), Some(&"down"));
    assert!(events[1..events.len() - 1].iter().all(|e| *e == "msg"));

    // Registry cleanup follows the downward callback.
    let deadline = Instant::now() + Duration::from_secs(2);
    while echo.server.connection_count() != 0 {
        assert!(Instant::now() < deadline, "connection never removed");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_connections_distributed_across_io_loops() {
    let echo = start_echo_server(ServerOptions {
        threads: 2,
        ..ServerOptions::default()
    });

    let mut clients = Vec::new();
    for i in 0..4 {
        let mut c = connect(echo.server.local_addr());
        c.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let msg = format!("client-{}", i);
        c.write_all(msg.as_bytes()).unwrap();
        let mut buf = vec![0u8; msg.len()];
        c.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg.as_bytes());
        clients.push(c);
    }
    assert_eq!(echo.server.connection_count(), 4);
}

#[test]
fn test_idle_timeout_force_closes() {
    let echo = start_echo_server(ServerOptions {
        idle_timeout: Duration::from_millis(300),
        ..ServerOptions::default()
    });

    let mut client = connect(echo.server.local_addr());
    client
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    // Send nothing; the server should force-close and the client observe
    // EOF.
    let start = Instant::now();
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes", n),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected error: {e}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[test]
fn test_activity_refreshes_idle_timer() {
    let echo = start_echo_server(ServerOptions {
        idle_timeout: Duration::from_millis(400),
        ..ServerOptions::default()
    });

    let mut client = connect(echo.server.local_addr());
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // Keep the connection busy past several idle windows.
    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(200));
        client.write_all(b"ka").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ka");
    }
}
