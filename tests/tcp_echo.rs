//! End-to-end stream echo over the TCP service.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use coil::runtime::ops;
use coil::{AsyncContext, ContextState, ContextThread, StreamConn, StreamHandler, TcpService, TERMINATE};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Sends every received buffer back on the same connection, then asks
/// for the next one.
struct EchoHandler;

impl StreamHandler for EchoHandler {
    fn emit(&self, ctx: &AsyncContext, conn: &StreamConn, buf: Option<&[u8]>) {
        let Some(data) = buf else {
            return; // connection closed
        };
        let reply = data.to_vec();
        let socket = conn.socket().clone();
        let conn = conn.clone();
        ops::send(ctx, &socket, reply, move |ctx, result| {
            if result.is_ok() {
                conn.resume(ctx);
            }
        });
    }
}

fn start_echo_service() -> (ContextThread, Arc<TcpService<EchoHandler>>) {
    let thread = ContextThread::new();
    let service = Arc::new(TcpService::new("127.0.0.1:0".parse().unwrap(), EchoHandler));

    {
        let service = service.clone();
        thread.start(move || service).unwrap();
    }
    let state = thread
        .wait_state(|s| s != ContextState::Pending, Duration::from_secs(5))
        .expect("service comes up");
    assert_eq!(state, ContextState::Started);

    (thread, service)
}

#[test]
fn echoes_one_byte_at_a_time_in_order() {
    init_tracing();
    let (thread, service) = start_echo_service();
    let addr = service.local_addr().expect("ephemeral port recorded");
    assert_ne!(addr.port(), 0);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    for byte in b'a'..=b'z' {
        client.write_all(&[byte]).unwrap();
        let mut echoed = [0u8; 1];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed[0], byte, "echo out of order");
    }

    drop(client);
    let begin = Instant::now();
    thread.signal(TERMINATE);
    thread
        .wait_state(|s| s == ContextState::Stopped, Duration::from_secs(5))
        .expect("loop drains after terminate");
    assert!(begin.elapsed() < Duration::from_millis(500), "drain took too long");
}

#[test]
fn serves_concurrent_connections() {
    init_tracing();
    let (thread, service) = start_echo_service();
    let addr = service.local_addr().unwrap();

    let mut clients: Vec<TcpStream> = (0..4)
        .map(|_| {
            let client = TcpStream::connect(addr).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            client
        })
        .collect();

    for round in 0u8..8 {
        for (index, client) in clients.iter_mut().enumerate() {
            let payload = [round, index as u8];
            client.write_all(&payload).unwrap();
            let mut echoed = [0u8; 2];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, payload);
        }
    }

    drop(clients);
    thread.signal(TERMINATE);
    thread
        .wait_state(|s| s == ContextState::Stopped, Duration::from_secs(5))
        .expect("loop drains");
}

#[test]
fn bind_failure_stops_without_starting() {
    init_tracing();

    // 192.0.2.1 is TEST-NET-1; binding a non-local address fails.
    let thread = ContextThread::new();
    let service = Arc::new(TcpService::new("192.0.2.1:0".parse().unwrap(), EchoHandler));

    {
        let service = service.clone();
        thread.start(move || service).unwrap();
    }
    let state = thread
        .wait_state(|s| s == ContextState::Stopped, Duration::from_secs(5))
        .expect("bind failure tears the context down");
    assert_eq!(state, ContextState::Stopped);
    assert!(service.local_addr().is_none());
}
