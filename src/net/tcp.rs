//! Stream-socket service: accept, read, emit.
//!
//! The service owns the listening socket and an acceptor continuation
//! that respawns itself after every accepted connection. Each connection
//! gets a reader whose received buffers are emitted to the user handler;
//! the handler owns the continuation and re-arms the reader through the
//! connection handle when it wants more.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::net::constants::LISTEN_BACKLOG;
use crate::net::sockets::{self, RawAddr, SocketHandle, INVALID_SOCKET};
use crate::net::{ReadContext, ReadCtx};
use crate::runtime::context::{AsyncContext, TERMINATE};
use crate::runtime::ops;
use crate::runtime::poller::SocketDialog;
use crate::runtime::scope::StopSource;
use crate::runtime::service::Service;

/// User hook of a stream service.
///
/// `emit` receives every buffer a connection produces; `buf` is a
/// borrowed view valid only for the duration of the call, and `None`
/// means the connection closed (end of stream or read error). The
/// handler decides whether the connection continues by calling
/// `conn.resume(ctx)`.
pub trait StreamHandler: Send + Sync + 'static {
    /// Runs between socket creation and `bind`; a returned error aborts
    /// service startup.
    fn initialize(&self, _socket: &SocketHandle) -> io::Result<()> {
        Ok(())
    }

    fn emit(&self, ctx: &AsyncContext, conn: &StreamConn, buf: Option<&[u8]>);
}

/// One accepted connection: its dialog, its read scratch, and the
/// capability to re-arm the reader.
#[derive(Clone)]
pub struct StreamConn {
    socket: SocketDialog,
    rctx: ReadCtx,
    resume: Rc<dyn Fn(&AsyncContext, &StreamConn)>,
}

impl StreamConn {
    pub fn socket(&self) -> &SocketDialog {
        &self.socket
    }

    pub fn read_context(&self) -> &ReadCtx {
        &self.rctx
    }

    /// Re-arms the reader for the next buffer. A no-op once stop has
    /// been requested on the scope.
    pub fn resume(&self, ctx: &AsyncContext) {
        (self.resume)(ctx, self);
    }
}

/// Shutdown state shared with the signal handler: the scope's stop
/// source and the self-connect socket that unblocks a pending accept.
struct StopHook {
    source: Mutex<Option<StopSource>>,
    wake: AtomicI32,
}

impl StopHook {
    fn new() -> Self {
        Self { source: Mutex::new(None), wake: AtomicI32::new(INVALID_SOCKET) }
    }

    fn arm(&self, source: StopSource) {
        *self.source.lock() = Some(source);
    }

    fn fire(&self, addr: Option<SocketAddr>) {
        let Some(source) = self.source.lock().clone() else {
            return;
        };
        source.request_stop();

        if self.wake.load(Ordering::Acquire) != INVALID_SOCKET {
            return;
        }
        let Some(addr) = addr else {
            return;
        };
        // Connect to our own listening socket so the pending accept
        // becomes ready and can observe the stop token. The descriptor
        // stays open until the service drops; closing it early could
        // reset the connection out of the listen backlog.
        match SocketHandle::stream(sockets::family_of(&addr)) {
            Ok(handle) => {
                let raw = RawAddr::from_socket_addr(&addr);
                match sockets::connect_socket(handle.raw(), &raw) {
                    Ok(()) => {
                        self.wake.store(handle.into_raw(), Ordering::Release);
                    }
                    Err(error) => debug!(%error, "shutdown self-connect failed"),
                }
            }
            Err(error) => debug!(%error, "shutdown socket creation failed"),
        }
    }
}

impl Drop for StopHook {
    fn drop(&mut self) {
        let fd = self.wake.swap(INVALID_SOCKET, Ordering::AcqRel);
        if fd != INVALID_SOCKET {
            sockets::close_socket(fd);
        }
    }
}

/// Acceptor → reader → emit pipeline over a bound listening socket.
pub struct TcpService<H: StreamHandler> {
    handler: H,
    requested: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    stop: StopHook,
}

impl<H: StreamHandler> TcpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        Self { handler, requested: address, bound: Mutex::new(None), stop: StopHook::new() }
    }

    /// The bound address once the service has started; observes the
    /// ephemeral port for a port-zero bind.
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

        sockets::listen_socket(socket.raw(), LISTEN_BACKLOG)
    }

    fn acceptor(service: Arc<Self>, ctx: &AsyncContext, socket: SocketDialog) {
        if ctx.scope().stop_requested() {
            return;
        }
        let listener = socket.clone();
        ops::accept(ctx, &socket, move |ctx, result| match result {
            Ok((dialog, _peer)) => {
                Self::spawn_connection(service.clone(), ctx, dialog);
                Self::acceptor(service, ctx, listener);
            }
            Err(error) => debug!(%error, "accept failed"),
        });
    }

    fn spawn_connection(service: Arc<Self>, ctx: &AsyncContext, dialog: SocketDialog) {
        let resume: Rc<dyn Fn(&AsyncContext, &StreamConn)> = {
            let service = service.clone();
            Rc::new(move |ctx, conn| Self::reader(service.clone(), ctx, conn.clone()))
        };
        let conn = StreamConn { socket: dialog, rctx: ReadContext::fresh(), resume };
        Self::reader(service, ctx, conn);
    }

    fn reader(service: Arc<Self>, ctx: &AsyncContext, conn: StreamConn) {
        if ctx.scope().stop_requested() {
            return;
        }
        let socket = conn.socket.clone();
        let rctx = conn.rctx.clone();
        ops::recv(ctx, &socket, &rctx, move |ctx, result| match result {
            Ok(len) if len > 0 => {
                let guard = conn.rctx.borrow();
                service.emit(ctx, &conn, Some(&guard.buffer[..len]));
            }
            Ok(_) => service.emit(ctx, &conn, None),
            Err(error) => {
                debug!(%error, "stream read failed");
                service.emit(ctx, &conn, None);
            }
        });
    }

    fn emit(&self, ctx: &AsyncContext, conn: &StreamConn, buf: Option<&[u8]>) {
        self.handler.emit(ctx, conn, buf);
    }
}

impl<H: StreamHandler> Service for TcpService<H> {
    fn start(self: Arc<Self>, ctx: &AsyncContext) {
        let socket = match SocketHandle::stream(sockets::family_of(&self.requested)) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(%error, "tcp socket creation failed");
                ctx.scope().request_stop();
                return;
            }
        };

        if let Err(error) = self.prepare(&socket) {
            warn!(%error, address = %self.requested, "tcp service initialization failed");
            ctx.scope().request_stop();
            return;
        }

        self.stop.arm(ctx.scope().stop_source());

        let dialog = match ctx.poller().emplace(socket) {
            Ok(dialog) => dialog,
            Err(error) => {
                warn!(%error, "listener registration failed");
                ctx.scope().request_stop();
                return;
            }
        };

        Self::acceptor(self, ctx, dialog);
    }

    fn signal_handler(&self, signum: u8) {
        if signum == TERMINATE {
            self.stop.fire(self.local_addr());
        }
    }
}
