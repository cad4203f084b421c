//! A small, embeddable asynchronous networking runtime.
//!
//! One `AsyncContext` is one single-threaded event loop: a readiness
//! multiplexer dispatching I/O continuations, a min-heap timer wheel
//! with a cross-thread wakeup, and a bitmask signal channel drained by a
//! self-pipe interrupt service routine. `TcpService` and `UdpService`
//! install protocol pipelines on the loop and emit received buffers to
//! user handlers; `ContextThread` owns one loop on a private worker
//! thread behind a thread-safe signal/terminate interface.

pub mod error;
pub mod net;
pub mod runtime;

pub use error::{Error, Result};
pub use net::{
    DatagramConn, DatagramHandler, ReadContext, ReadCtx, SocketHandle, StreamConn, StreamHandler,
    TcpService, UdpService,
};
pub use runtime::ops;
pub use runtime::{
    AsyncContext, AsyncScope, ContextShared, ContextState, ContextThread, Poller, Service,
    SocketDialog, StateCell, StopToken, TimerId, TimerWheel, INVALID_TIMER, SIGNAL_END, TERMINATE,
    USER1,
};
