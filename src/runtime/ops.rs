//! Asynchronous operation submissions.
//!
//! Each function enqueues one non-blocking step on the loop: an attempt
//! that parks on `WouldBlock` and otherwise hands its result to the
//! completion continuation. Continuations receive the context by
//! reference and may submit follow-up operations; cancellation is the
//! caller's business — a continuation that observes a stop token simply
//! declines to respawn.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;

use tracing::trace;

use crate::net::constants::ISR_BUFFER_SIZE;
use crate::net::sockets::{self, RawAddr};
use crate::net::ReadCtx;
use crate::runtime::context::AsyncContext;
use crate::runtime::poller::{OpInterest, OpStatus, SocketDialog};

thread_local! {
    /// Fixed per-loop scratch for draining the interrupt pipe.
    static ISR_BUFFER: RefCell<[u8; ISR_BUFFER_SIZE]> = const { RefCell::new([0; ISR_BUFFER_SIZE]) };
}

/// Awaits a connection on a listening dialog. The accepted socket is
/// registered with the same poller and handed to the continuation with
/// the peer address.
pub fn accept<F>(ctx: &AsyncContext, socket: &SocketDialog, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<(SocketDialog, Option<SocketAddr>)>) + 'static,
{
    let dialog = socket.clone();
    let mut complete = Some(complete);
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Readable,
        Box::new(move |ctx| {
            let result = match sockets::accept_socket(dialog.raw()) {
                Err(error) if sockets::would_block(&error) => return OpStatus::Pending,
                Err(error) => Err(error),
                Ok((fd, peer)) => ctx
                    .poller()
                    .adopt(fd)
                    .map(|accepted| (accepted, peer.to_socket_addr())),
            };
            if let Some(complete) = complete.take() {
                complete(ctx, result);
            }
            OpStatus::Complete
        }),
    );
}

/// Awaits bytes on a stream dialog, reading into the context's buffer.
/// The continuation receives the byte count; zero means end of stream.
pub fn recv<F>(ctx: &AsyncContext, socket: &SocketDialog, rctx: &ReadCtx, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<usize>) + 'static,
{
    let dialog = socket.clone();
    let rctx = rctx.clone();
    let mut complete = Some(complete);
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Readable,
        Box::new(move |ctx| {
            let result = {
                let mut guard = rctx.borrow_mut();
                sockets::recv_socket(dialog.raw(), &mut guard.buffer, 0)
            };
            match result {
                Err(error) if sockets::would_block(&error) => OpStatus::Pending,
                result => {
                    if let Some(complete) = complete.take() {
                        complete(ctx, result);
                    }
                    OpStatus::Complete
                }
            }
        }),
    );
}

/// Awaits a datagram, recording the sender address in the read context.
pub fn recv_from<F>(ctx: &AsyncContext, socket: &SocketDialog, rctx: &ReadCtx, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<usize>) + 'static,
{
    let dialog = socket.clone();
    let rctx = rctx.clone();
    let mut complete = Some(complete);
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Readable,
        Box::new(move |ctx| {
            let result = {
                let mut guard = rctx.borrow_mut();
                match sockets::recv_from_socket(dialog.raw(), &mut guard.buffer) {
                    Ok((len, peer)) => {
                        guard.peer = peer.to_socket_addr();
                        Ok(len)
                    }
                    Err(error) => Err(error),
                }
            };
            match result {
                Err(error) if sockets::would_block(&error) => OpStatus::Pending,
                result => {
                    if let Some(complete) = complete.take() {
                        complete(ctx, result);
                    }
                    OpStatus::Complete
                }
            }
        }),
    );
}

/// Writes the whole buffer to a stream dialog, resuming across short
/// writes. The continuation receives the total byte count.
pub fn send<F>(ctx: &AsyncContext, socket: &SocketDialog, data: Vec<u8>, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<usize>) + 'static,
{
    let dialog = socket.clone();
    let mut complete = Some(complete);
    let mut offset = 0usize;
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Writable,
        Box::new(move |ctx| {
            while offset < data.len() {
                match sockets::send_socket(dialog.raw(), &data[offset..], 0) {
                    Ok(sent) => offset += sent,
                    Err(error) if sockets::would_block(&error) => return OpStatus::Pending,
                    Err(error) => {
                        if let Some(complete) = complete.take() {
                            complete(ctx, Err(error));
                        }
                        return OpStatus::Complete;
                    }
                }
            }
            if let Some(complete) = complete.take() {
                complete(ctx, Ok(offset));
            }
            OpStatus::Complete
        }),
    );
}

/// Sends one datagram to `peer`.
pub fn send_to<F>(
    ctx: &AsyncContext,
    socket: &SocketDialog,
    data: Vec<u8>,
    peer: SocketAddr,
    complete: F,
) where
    F: FnOnce(&AsyncContext, io::Result<usize>) + 'static,
{
    let dialog = socket.clone();
    let addr = RawAddr::from_socket_addr(&peer);
    let mut complete = Some(complete);
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Writable,
        Box::new(move |ctx| {
            match sockets::send_to_socket(dialog.raw(), &data, &addr) {
                Err(error) if sockets::would_block(&error) => OpStatus::Pending,
                result => {
                    if let Some(complete) = complete.take() {
                        complete(ctx, result);
                    }
                    OpStatus::Complete
                }
            }
        }),
    );
}

/// Initiates a connect and completes when the handshake resolves, with
/// `SO_ERROR` deciding the outcome.
pub fn connect<F>(ctx: &AsyncContext, socket: &SocketDialog, peer: SocketAddr, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<()>) + 'static,
{
    let dialog = socket.clone();
    let addr = RawAddr::from_socket_addr(&peer);
    let mut complete = Some(complete);
    let mut initiated = false;
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Writable,
        Box::new(move |ctx| {
            if !initiated {
                initiated = true;
                if let Err(error) = sockets::connect_socket(dialog.raw(), &addr) {
                    if let Some(complete) = complete.take() {
                        complete(ctx, Err(error));
                    }
                    return OpStatus::Complete;
                }
                // Completion is observed as writability.
                return OpStatus::Pending;
            }
            let result = match sockets::socket_error(dialog.raw()) {
                Ok(None) => Ok(()),
                Ok(Some(code)) => Err(io::Error::from_raw_os_error(code)),
                Err(error) => Err(error),
            };
            if let Some(complete) = complete.take() {
                complete(ctx, result);
            }
            OpStatus::Complete
        }),
    );
}

/// Reads and discards up to one ISR buffer's worth of bytes. Used to
/// drain the interrupt pipe; the payload carries no information.
pub fn drain<F>(ctx: &AsyncContext, socket: &SocketDialog, complete: F)
where
    F: FnOnce(&AsyncContext, io::Result<usize>) + 'static,
{
    let dialog = socket.clone();
    let mut complete = Some(complete);
    ctx.poller().submit(
        ctx,
        socket,
        OpInterest::Readable,
        Box::new(move |ctx| {
            let result = ISR_BUFFER
                .with(|buffer| sockets::recv_socket(dialog.raw(), &mut buffer.borrow_mut()[..], 0));
            match result {
                Err(error) if sockets::would_block(&error) => OpStatus::Pending,
                result => {
                    trace!(?result, "interrupt pipe drained");
                    if let Some(complete) = complete.take() {
                        complete(ctx, result);
                    }
                    OpStatus::Complete
                }
            }
        }),
    );
}
