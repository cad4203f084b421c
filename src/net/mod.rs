//! Protocol services and the socket layer underneath them.

pub mod constants;
pub mod sockets;
pub mod tcp;
pub mod udp;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use constants::READ_BUFFER_SIZE;

/// Per-operation read scratch: the backing buffer and, for datagrams,
/// the sender of the most recent message.
pub struct ReadContext {
    pub buffer: [u8; READ_BUFFER_SIZE],
    pub peer: Option<SocketAddr>,
}

/// Shared handle to a `ReadContext`; a reader respawns with the same
/// context by cloning the handle into its next step.
pub type ReadCtx = Rc<RefCell<ReadContext>>;

impl ReadContext {
    pub fn fresh() -> ReadCtx {
        Rc::new(RefCell::new(ReadContext { buffer: [0; READ_BUFFER_SIZE], peer: None }))
    }
}

pub use sockets::SocketHandle;
pub use tcp::{StreamConn, StreamHandler, TcpService};
pub use udp::{DatagramConn, DatagramHandler, UdpService};
