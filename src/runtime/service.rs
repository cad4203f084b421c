use std::sync::Arc;

use crate::runtime::context::AsyncContext;

/// A protocol handler that can be installed on an event loop.
///
/// Implementations are shared behind `Arc` between the loop's
/// continuations, the interrupt service routine, and the shutdown
/// safety-net timer, hence the `Send + Sync` bound.
pub trait Service: Send + Sync + 'static {
    /// Installs whatever continuations the service needs onto the
    /// context. Must not panic; failures are reported by requesting stop
    /// on the scope, in which case no continuation is installed and the
    /// context transitions straight to `Stopped`.
    fn start(self: Arc<Self>, ctx: &AsyncContext);

    /// Delivers one pending signal bit. Invoked on the loop thread only,
    /// from the interrupt service routine or the drain safety net; must
    /// be idempotent, must not panic, and must return promptly.
    fn signal_handler(&self, signum: u8);
}
