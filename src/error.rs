use std::io;

use thiserror::Error;

/// Errors surfaced to caller-thread code.
///
/// Everything that goes wrong inside the event loop is handled at the
/// continuation boundary (logged and discarded, or turned into a close
/// notice); only context-thread startup can fail towards the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// `ContextThread::start` was invoked on an already started thread.
    #[error("context thread already started")]
    AlreadyStarted,

    /// An I/O error during worker-thread creation.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
