//! Handler slots and the handler invoker.
//!
//! Each event kind has one nullable slot. The handler signature is fixed per
//! kind, so a callable with the wrong number of arguments is rejected when it
//! is registered rather than when an event is dispatched.
//!
//! Re-registering a handler while an event of the same kind is in flight is
//! allowed: the in-flight call keeps the handler it already resolved and the
//! next event sees the new one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DispatchError, HandlerFailure, HandlerResult};
use crate::event::{Event, EventKind, LogLevel};
use crate::message::{Message, MessageId};

pub type ConnectHandler = dyn Fn(i32) -> HandlerResult + Send + Sync;
pub type DisconnectHandler = dyn Fn(i32) -> HandlerResult + Send + Sync;
pub type PublishHandler = dyn Fn(MessageId) -> HandlerResult + Send + Sync;
pub type MessageHandler = dyn Fn(Message) -> HandlerResult + Send + Sync;
pub type SubscribeHandler = dyn Fn(MessageId, &[u8]) -> HandlerResult + Send + Sync;
pub type UnsubscribeHandler = dyn Fn(MessageId) -> HandlerResult + Send + Sync;
pub type LogHandler = dyn Fn(LogLevel, &str) -> HandlerResult + Send + Sync;

#[derive(Default, Clone)]
struct Slots {
    connect: Option<Arc<ConnectHandler>>,
    disconnect: Option<Arc<DisconnectHandler>>,
    publish: Option<Arc<PublishHandler>>,
    message: Option<Arc<MessageHandler>>,
    subscribe: Option<Arc<SubscribeHandler>>,
    unsubscribe: Option<Arc<UnsubscribeHandler>>,
    log: Option<Arc<LogHandler>>,
}

/// The seven handler slots of a connection.
#[derive(Default)]
pub(crate) struct HandlerTable {
    slots: RwLock<Slots>,
}

macro_rules! slot_setter {
    ($name:ident, $field:ident, fn($($arg:ty),*)) => {
        pub(crate) fn $name<F>(&self, handler: F)
        where
            F: Fn($($arg),*) -> HandlerResult + Send + Sync + 'static,
        {
            self.write().$field = Some(Arc::new(handler));
        }
    };
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Slots {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    slot_setter!(set_connect, connect, fn(i32));
    slot_setter!(set_disconnect, disconnect, fn(i32));
    slot_setter!(set_publish, publish, fn(MessageId));
    slot_setter!(set_message, message, fn(Message));
    slot_setter!(set_subscribe, subscribe, fn(MessageId, &[u8]));
    slot_setter!(set_unsubscribe, unsubscribe, fn(MessageId));
    slot_setter!(set_log, log, fn(LogLevel, &str));

    /// Empties the slot for `kind`. Returns `true` if a handler was registered.
    pub(crate) fn clear(&self, kind: EventKind) -> bool {
        let mut slots = self.write();
        match kind {
            EventKind::Connect => slots.connect.take().is_some(),
            EventKind::Disconnect => slots.disconnect.take().is_some(),
            EventKind::Publish => slots.publish.take().is_some(),
            EventKind::Message => slots.message.take().is_some(),
            EventKind::Subscribe => slots.subscribe.take().is_some(),
            EventKind::Unsubscribe => slots.unsubscribe.take().is_some(),
            EventKind::Log => slots.log.take().is_some(),
        }
    }

    pub(crate) fn is_set(&self, kind: EventKind) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match kind {
            EventKind::Connect => slots.connect.is_some(),
            EventKind::Disconnect => slots.disconnect.is_some(),
            EventKind::Publish => slots.publish.is_some(),
            EventKind::Message => slots.message.is_some(),
            EventKind::Subscribe => slots.subscribe.is_some(),
            EventKind::Unsubscribe => slots.unsubscribe.is_some(),
            EventKind::Log => slots.log.is_some(),
        }
    }

    /// Calls the handler registered for the event's kind and consumes the event.
    ///
    /// An empty slot is a silent no-op. Errors returned by the handler and
    /// panics raised inside it are both reported as a [`DispatchError`]; the
    /// event is released on every path.
    pub(crate) fn invoke(&self, event: Event) -> Result<(), DispatchError> {
        let kind = event.kind();
        // Resolve the handler without holding the lock across the call, so a
        // handler may register other handlers.
        let slots = self.snapshot();

        let outcome = panic::catch_unwind(AssertUnwindSafe(move || match event {
            Event::Connect { rc } => slots.connect.map(|h| h(rc)),
            Event::Disconnect { rc } => slots.disconnect.map(|h| h(rc)),
            Event::Publish { mid } => slots.publish.map(|h| h(mid)),
            Event::Message(message) => slots.message.map(|h| h(message)),
            Event::Subscribe { mid, granted_qos } => {
                slots.subscribe.map(|h| h(mid, granted_qos.as_slice()))
            }
            Event::Unsubscribe { mid } => slots.unsubscribe.map(|h| h(mid)),
            Event::Log { level, text } => slots.log.map(|h| h(level, text.as_str())),
        }));

        match outcome {
            Ok(None) | Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(err))) => Err(DispatchError::new(kind, HandlerFailure::Returned(err))),
            Err(payload) => Err(DispatchError::new(
                kind,
                HandlerFailure::Panicked(panic_message(payload.as_ref())),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
