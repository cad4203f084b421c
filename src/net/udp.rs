//! Datagram service: read and emit, no stream semantics.
//!
//! Unlike the stream service there is no acceptor and the reader does
//! not respawn itself; the handler owns the re-arm cadence entirely and
//! calls `conn.resume(ctx)` when it wants the next datagram.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::net::sockets::{self, RawAddr, SocketHandle, INVALID_SOCKET};
use crate::net::{ReadContext, ReadCtx};
use crate::runtime::context::{AsyncContext, TERMINATE};
use crate::runtime::ops;
use crate::runtime::poller::SocketDialog;
use crate::runtime::service::Service;

/// User hook of a datagram service.
///
/// An empty buffer (or `None`, on a read error) is the close notice: it
/// is what the in-flight read reports after the terminate half-shutdown.
pub trait DatagramHandler: Send + Sync + 'static {
    /// Runs between socket creation and `bind`; a returned error aborts
    /// service startup.
    fn initialize(&self, _socket: &SocketHandle) -> io::Result<()> {
        Ok(())
    }

    fn emit(&self, ctx: &AsyncContext, conn: &DatagramConn, buf: Option<&[u8]>);
}

/// The server dialog plus the read scratch carrying the sender of the
/// most recent datagram.
#[derive(Clone)]
pub struct DatagramConn {
    socket: SocketDialog,
    rctx: ReadCtx,
    resume: Rc<dyn Fn(&AsyncContext, &DatagramConn)>,
}

impl DatagramConn {
    pub fn socket(&self) -> &SocketDialog {
        &self.socket
    }

    pub fn read_context(&self) -> &ReadCtx {
        &self.rctx
    }

    /// Source address of the datagram currently being emitted.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.rctx.borrow().peer
    }

    /// Arms the reader for the next datagram.
    pub fn resume(&self, ctx: &AsyncContext) {
        (self.resume)(ctx, self);
    }
}

/// Reader → emit pipeline over a bound datagram socket.
pub struct UdpService<H: DatagramHandler> {
    handler: H,
    requested: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    server_fd: AtomicI32,
}

impl<H: DatagramHandler> UdpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        Self {
            handler,
            requested: address,
            bound: Mutex::new(None),
            server_fd: AtomicI32::new(INVALID_SOCKET),
        }
    }

    /// The bound address once the service has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    fn prepare(&self, socket: &SocketHandle) -> io::Result<()> {
        sockets::set_reuseaddr(socket.raw(), true)?;
        self.handler.initialize(socket)?;

        let raw = RawAddr::from_socket_addr(&self.requested);
        sockets::bind_socket(socket.raw(), &raw)?;

        let bound = sockets::local_addr(socket.raw())?.to_socket_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported address family")
        })?;
        *self.bound.lock() = Some(bound);
        Ok(())
    }

    fn reader(service: Arc<Self>, ctx: &AsyncContext, conn: DatagramConn) {
        let socket = conn.socket.clone();
        let rctx = conn.rctx.clone();
        ops::recv_from(ctx, &socket, &rctx, move |ctx, result| match result {
            Ok(len) => {
                let guard = conn.rctx.borrow();
                service.emit(ctx, &conn, Some(&guard.buffer[..len]));
            }
            Err(error) => {
                debug!(%error, "datagram read failed");
                service.emit(ctx, &conn, None);
            }
        });
    }

    fn emit(&self, ctx: &AsyncContext, conn: &DatagramConn, buf: Option<&[u8]>) {
        self.handler.emit(ctx, conn, buf);
    }
}

impl<H: DatagramHandler> Service for UdpService<H> {
    fn start(self: Arc<Self>, ctx: &AsyncContext) {
        let socket = match SocketHandle::datagram(sockets::family_of(&self.requested)) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(%error, "udp socket creation failed");
                ctx.scope().request_stop();
                return;
            }
        };

        if let Err(error) = self.prepare(&socket) {
            warn!(%error, address = %self.requested, "udp service initialization failed");
            ctx.scope().request_stop();
            return;
        }

        // Recorded for the terminate half-shutdown.
        self.server_fd.store(socket.raw(), Ordering::Release);

        let dialog = match ctx.poller().emplace(socket) {
            Ok(dialog) => dialog,
            Err(error) => {
                warn!(%error, "server registration failed");
                self.server_fd.store(INVALID_SOCKET, Ordering::Release);
                ctx.scope().request_stop();
                return;
            }
        };

        let resume: Rc<dyn Fn(&AsyncContext, &DatagramConn)> = {
            let service = self.clone();
            Rc::new(move |ctx, conn| Self::reader(service.clone(), ctx, conn.clone()))
        };
        let conn = DatagramConn { socket: dialog, rctx: ReadContext::fresh(), resume };
        Self::reader(self, ctx, conn);
    }

    fn signal_handler(&self, signum: u8) {
        if signum == TERMINATE {
            let fd = self.server_fd.swap(INVALID_SOCKET, Ordering::AcqRel);
            if fd != INVALID_SOCKET {
                // Completes the in-flight read with a zero-length result.
                let _ = sockets::shutdown_socket(fd, libc::SHUT_RD);
            }
        }
    }
}
