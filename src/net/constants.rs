use std::time::Duration;

/// Backlog passed to `listen(2)` by the TCP service.
pub const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;

/// Size of the per-connection read buffer inside a `ReadContext`.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Size of the fixed per-loop buffer used to drain the interrupt pipe.
/// Contents are discarded; coalesced wakeups fit comfortably.
pub const ISR_BUFFER_SIZE: usize = 1024;

/// Period of the safety-net timer that re-fires `signal_handler(TERMINATE)`
/// while a terminating loop is still draining.
pub const DRAIN_REARM_INTERVAL: Duration = Duration::from_secs(1);
