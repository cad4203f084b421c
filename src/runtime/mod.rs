//! Event loop core: interrupt source, timer wheel, scope, poller, and
//! the context/context-thread surface that ties them together.

pub mod context;
pub mod context_thread;
pub mod interrupt;
pub mod ops;
pub mod poller;
pub mod scope;
pub mod service;
pub mod state;
pub mod timer_wheel;

pub use context::{AsyncContext, ContextShared, SIGNAL_END, TERMINATE, USER1};
pub use context_thread::{ContextThread, PipeFactory};
pub use interrupt::InterruptSource;
pub use poller::{Poller, SocketDialog};
pub use scope::{AsyncScope, StopSource, StopToken};
pub use service::Service;
pub use state::{ContextState, StateCell};
pub use timer_wheel::{TimerId, TimerWheel, INVALID_TIMER};
