//! Readiness multiplexer and socket dialogs.
//!
//! A dialog ties one non-blocking socket to the poller under a stable
//! token. Asynchronous operations are closures that attempt their
//! syscall and either complete or park under an interest; readiness
//! events re-run the parked attempts. Submissions made while an
//! operation is running are queued and attempted as soon as the running
//! operation returns, which keeps attempts off the caller's stack and
//! outside any borrows the caller still holds.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::net::sockets::{self, SocketHandle};
use crate::runtime::context::AsyncContext;

/// Outcome of one attempt of an asynchronous operation.
pub(crate) enum OpStatus {
    /// The operation invoked its continuation; it will not run again.
    Complete,
    /// The attempt would block; park until the next readiness event.
    Pending,
}

/// Readiness an operation parks under.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpInterest {
    Readable,
    Writable,
}

pub(crate) type OpFn = Box<dyn FnMut(&AsyncContext) -> OpStatus + 'static>;

struct Submission {
    dialog: SocketDialog,
    interest: OpInterest,
    op: OpFn,
}

#[derive(Default)]
struct Slot {
    readers: VecDeque<OpFn>,
    writers: VecDeque<OpFn>,
}

struct PollerInner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    slots: RefCell<Vec<Option<Slot>>>,
    free: RefCell<Vec<usize>>,
    incoming: RefCell<VecDeque<Submission>>,
}

/// Cheaply cloneable handle to one loop's multiplexer. Thread-affine.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<PollerInner>,
}

/// A socket registered with the poller, closed and deregistered when the
/// last handle drops. Operations keep the dialog alive by capture.
#[derive(Clone)]
pub struct SocketDialog {
    inner: Rc<DialogInner>,
}

struct DialogInner {
    fd: RawFd,
    token: usize,
    poller: Weak<PollerInner>,
}

impl SocketDialog {
    pub fn raw(&self) -> RawFd {
        self.inner.fd
    }

    pub(crate) fn token(&self) -> usize {
        self.inner.token
    }

    /// The socket's bound local address, when it has one.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let raw = sockets::local_addr(self.inner.fd)?;
        raw.to_socket_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
    }
}

impl Drop for DialogInner {
    fn drop(&mut self) {
        if let Some(inner) = self.poller.upgrade() {
            let _ = inner.poll.borrow().registry().deregister(&mut SourceFd(&self.fd));
            if let Some(slot) = inner.slots.borrow_mut().get_mut(self.token) {
                *slot = None;
            }
            inner.free.borrow_mut().push(self.token);
        }
        sockets::close_socket(self.fd);
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(PollerInner {
                poll: RefCell::new(Poll::new()?),
                events: RefCell::new(Events::with_capacity(256)),
                slots: RefCell::new(Vec::new()),
                free: RefCell::new(Vec::new()),
                incoming: RefCell::new(VecDeque::new()),
            }),
        })
    }

    /// Registers an owned socket and returns its dialog.
    pub fn emplace(&self, handle: SocketHandle) -> io::Result<SocketDialog> {
        self.adopt(handle.into_raw())
    }

    /// Registers a raw descriptor, taking ownership of it.
    pub fn adopt(&self, fd: RawFd) -> io::Result<SocketDialog> {
        let token = {
            let mut free = self.inner.free.borrow_mut();
            match free.pop() {
                Some(token) => token,
                None => {
                    let mut slots = self.inner.slots.borrow_mut();
                    slots.push(None);
                    slots.len() - 1
                }
            }
        };

        let registered = self.inner.poll.borrow().registry().register(
            &mut SourceFd(&fd),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        );
        if let Err(error) = registered {
            self.inner.free.borrow_mut().push(token);
            sockets::close_socket(fd);
            return Err(error);
        }

        self.inner.slots.borrow_mut()[token] = Some(Slot::default());

        Ok(SocketDialog {
            inner: Rc::new(DialogInner { fd, token, poller: Rc::downgrade(&self.inner) }),
        })
    }

    /// Enqueues an operation on the dialog. The attempt runs from the
    /// loop's dispatch machinery, never on the submitter's stack.
    pub(crate) fn submit(
        &self,
        ctx: &AsyncContext,
        dialog: &SocketDialog,
        interest: OpInterest,
        op: OpFn,
    ) {
        ctx.scope().spawned();
        self.inner.incoming.borrow_mut().push_back(Submission {
            dialog: dialog.clone(),
            interest,
            op,
        });
    }

    fn park(&self, ctx: &AsyncContext, token: usize, interest: OpInterest, op: OpFn) {
        let mut slots = self.inner.slots.borrow_mut();
        if let Some(Some(slot)) = slots.get_mut(token) {
            match interest {
                OpInterest::Readable => slot.readers.push_back(op),
                OpInterest::Writable => slot.writers.push_back(op),
            }
        } else {
            // The dialog is gone; the operation can never run again, so
            // it must not be counted against quiescence.
            drop(slots);
            drop(op);
            ctx.scope().completed();
        }
    }

    fn run_op(&self, ctx: &AsyncContext, token: usize, interest: OpInterest, mut op: OpFn) -> usize {
        match op(ctx) {
            OpStatus::Complete => {
                ctx.scope().completed();
                1
            }
            OpStatus::Pending => {
                self.park(ctx, token, interest, op);
                0
            }
        }
    }

    /// Attempts every queued submission, including ones enqueued by the
    /// continuations it runs. Returns the number of completions.
    fn flush(&self, ctx: &AsyncContext) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.incoming.borrow_mut().pop_front();
            let Some(submission) = next else {
                break;
            };
            let token = submission.dialog.token();
            ran += self.run_op(ctx, token, submission.interest, submission.op);
        }
        ran
    }

    /// One multiplexer step: attempt queued submissions, poll for at most
    /// `timeout` (`None` waits indefinitely), and re-run parked
    /// operations whose sockets became ready. Returns the number of
    /// continuations completed; zero signals a timeout to the driver.
    pub(crate) fn wait_for(
        &self,
        ctx: &AsyncContext,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut ran = self.flush(ctx);
        // Work already happened; poll without sleeping so the driver can
        // recompute its timer wait before the next blocking poll.
        let timeout = if ran > 0 { Some(Duration::ZERO) } else { timeout };

        let batch: Vec<(usize, bool, bool)> = {
            let mut poll = self.inner.poll.borrow_mut();
            let mut events = self.inner.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(ran),
                Err(error) => return Err(error),
            }
            events
                .iter()
                .map(|event| {
                    let closed = event.is_error() || event.is_read_closed() || event.is_write_closed();
                    (
                        event.token().0,
                        event.is_readable() || closed,
                        event.is_writable() || closed,
                    )
                })
                .collect()
        };

        for (token, readable, writable) in batch {
            trace!(token, readable, writable, "readiness event");
            let mut runq: Vec<(OpInterest, OpFn)> = Vec::new();
            {
                let mut slots = self.inner.slots.borrow_mut();
                if let Some(Some(slot)) = slots.get_mut(token) {
                    if readable {
                        runq.extend(slot.readers.drain(..).map(|op| (OpInterest::Readable, op)));
                    }
                    if writable {
                        runq.extend(slot.writers.drain(..).map(|op| (OpInterest::Writable, op)));
                    }
                }
            }
            for (interest, op) in runq {
                ran += self.run_op(ctx, token, interest, op);
                ran += self.flush(ctx);
            }
        }

        Ok(ran)
    }
}
