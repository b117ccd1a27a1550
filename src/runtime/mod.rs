//! Callback dispatch runtime.
//!
//! Engines run their network I/O on a thread they own and report what
//! happens through [`Trampolines`]. The runtime turns each report into an
//! owned [`Event`](crate::event::Event) and delivers it to the handler the
//! user registered for that kind of event.
//!
//! # Dispatch Modes
//!
//! - **Inline**: no dispatch thread is running. The handler runs on the
//!   engine thread before the trampoline returns, so a handler that blocks
//!   stalls the network loop.
//! - **Threaded**: a dedicated dispatch thread drains a callback queue and
//!   runs handlers there. Trampolines only enqueue.
//!
//! The queue is a LIFO stack: when several events are waiting, the newest is
//! delivered first.

pub(crate) mod event_loop;
pub(crate) mod handlers;
pub(crate) mod queue;
pub(crate) mod trampoline;

pub use handlers::{
    ConnectHandler, DisconnectHandler, LogHandler, MessageHandler, PublishHandler,
    SubscribeHandler, UnsubscribeHandler,
};
pub use trampoline::Trampolines;
