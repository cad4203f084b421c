//! End-to-end datagram echo over the UDP service, v4 and v6.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use coil::runtime::ops;
use coil::{
    AsyncContext, ContextState, ContextThread, DatagramConn, DatagramHandler, UdpService,
    TERMINATE,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Echoes every datagram back to its sender, then re-arms the reader.
/// An empty buffer is the shutdown notice and ends the pipeline.
struct EchoHandler;

impl DatagramHandler for EchoHandler {
    fn emit(&self, ctx: &AsyncContext, conn: &DatagramConn, buf: Option<&[u8]>) {
        let (Some(data), Some(peer)) = (buf, conn.peer()) else {
            return;
        };
        if data.is_empty() {
            return;
        }
        let reply = data.to_vec();
        let socket = conn.socket().clone();
        let conn = conn.clone();
        ops::send_to(ctx, &socket, reply, peer, move |ctx, result| {
            if result.is_ok() {
                conn.resume(ctx);
            }
        });
    }
}

fn run_echo(bind: SocketAddr, client_bind: SocketAddr) {
    let thread = ContextThread::new();
    let service = Arc::new(UdpService::new(bind, EchoHandler));

    {
        let service = service.clone();
        thread.start(move || service).unwrap();
    }
    let state = thread
        .wait_state(|s| s != ContextState::Pending, Duration::from_secs(5))
        .expect("service comes up");
    assert_eq!(state, ContextState::Started);

    let addr = service.local_addr().expect("ephemeral port recorded");
    assert_ne!(addr.port(), 0);

    let client = UdpSocket::bind(client_bind).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    for byte in b'a'..=b'z' {
        client.send_to(&[byte], addr).unwrap();
        let mut echoed = [0u8; 4];
        let (len, from) = client.recv_from(&mut echoed).unwrap();
        assert_eq!(len, 1);
        assert_eq!(echoed[0], byte);
        assert_eq!(from, addr, "reply must come from the service's bound address");
    }

    thread.signal(TERMINATE);
    let state = thread
        .wait_state(|s| s == ContextState::Stopped, Duration::from_secs(5))
        .expect("half-shutdown unblocks the reader and the loop drains");
    assert_eq!(state, ContextState::Stopped);
}

#[test]
fn echoes_datagrams_over_v4() {
    init_tracing();
    run_echo("127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap());
}

#[test]
fn echoes_datagrams_over_v6() {
    init_tracing();
    // Skip quietly on hosts without a loopback v6 stack.
    if UdpSocket::bind("[::1]:0").is_err() {
        eprintln!("skipping: IPv6 loopback unavailable");
        return;
    }
    run_echo("[::1]:0".parse().unwrap(), "[::1]:0".parse().unwrap());
}
