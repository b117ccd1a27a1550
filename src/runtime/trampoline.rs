//! Entry points called by the engine.
//!
//! An engine receives one [`Trampolines`] handle when it is attached to a
//! client and calls the matching method from its network thread whenever
//! something happens on the connection. Each method snapshots its arguments
//! into an owned [`Event`] and hands it to the dispatcher.

use std::sync::Arc;

use super::event_loop::Dispatcher;
use crate::error::{ConnectReasonCode, MqttError};
use crate::event::{Event, LogLevel};
use crate::message::{EngineMessage, Message, MessageId};

/// Callback entry points for an [`Engine`](crate::engine::Engine).
///
/// Cheap to clone; every clone feeds the same connection. In threaded mode
/// the methods only enqueue and return `Ok(())`. In inline mode they run the
/// handler before returning, and a handler failure comes back as
/// [`MqttError::Handler`].
#[derive(Clone)]
pub struct Trampolines {
    dispatcher: Arc<Dispatcher>,
}

impl Trampolines {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// The broker answered a connection attempt.
    ///
    /// Codes 1 to 3 are refusals. They are reported as
    /// [`MqttError::ConnectionRefused`] and never reach the connect handler.
    pub fn on_connect(&self, rc: i32) -> Result<(), MqttError> {
        let code = ConnectReasonCode::from(rc);
        if code.is_refusal() {
            warn!("connection refused ({code})");
            self.dispatcher
                .shared()
                .failures
                .record(MqttError::ConnectionRefused(code));
            return Err(MqttError::ConnectionRefused(code));
        }
        self.dispatch(Event::Connect { rc })
    }

    pub fn on_disconnect(&self, rc: i32) -> Result<(), MqttError> {
        self.dispatch(Event::Disconnect { rc })
    }

    pub fn on_publish(&self, mid: MessageId) -> Result<(), MqttError> {
        self.dispatch(Event::Publish { mid })
    }

    /// Copies the message out of the engine's buffers before dispatching it.
    pub fn on_message(&self, message: &EngineMessage<'_>) -> Result<(), MqttError> {
        self.dispatch(Event::Message(Message::from(message)))
    }

    pub fn on_subscribe(&self, mid: MessageId, granted_qos: &[u8]) -> Result<(), MqttError> {
        self.dispatch(Event::Subscribe {
            mid,
            granted_qos: granted_qos.to_vec(),
        })
    }

    pub fn on_unsubscribe(&self, mid: MessageId) -> Result<(), MqttError> {
        self.dispatch(Event::Unsubscribe { mid })
    }

    pub fn on_log(&self, level: LogLevel, text: &str) -> Result<(), MqttError> {
        self.dispatch(Event::Log {
            level,
            text: text.to_owned(),
        })
    }

    fn dispatch(&self, event: Event) -> Result<(), MqttError> {
        self.dispatcher
            .enqueue_or_run_inline(event)
            .map_err(MqttError::Handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event_loop::StopMode;
    use crate::config::ClientOptions;
    use crate::event::EventKind;
    use crate::message::QoS;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn trampolines() -> (Arc<Dispatcher>, Trampolines) {
        let dispatcher = Arc::new(Dispatcher::new(&ClientOptions::default()));
        let trampolines = Trampolines::new(Arc::clone(&dispatcher));
        (dispatcher, trampolines)
    }

    #[test]
    fn refused_connect_never_reaches_handler() {
        let (dispatcher, trampolines) = trampolines();
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        dispatcher.shared().handlers.set_connect(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        let err = trampolines.on_connect(2).unwrap_err();
        assert!(matches!(
            err,
            MqttError::ConnectionRefused(ConnectReasonCode::IdentifierRejected)
        ));
        assert_eq!(err.to_string(), "connection refused (identifier rejected)");
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(dispatcher.shared().failures.len(), 1);

        // Codes outside 1..=3 are forwarded untouched.
        trampolines.on_connect(5).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn inline_failure_is_returned_to_engine() {
        let (dispatcher, trampolines) = trampolines();
        dispatcher
            .shared()
            .handlers
            .set_unsubscribe(|_| Err("nope".into()));

        match trampolines.on_unsubscribe(4) {
            Err(MqttError::Handler(err)) => assert_eq!(err.kind(), EventKind::Unsubscribe),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn message_outlives_engine_buffer() {
        let (dispatcher, trampolines) = trampolines();
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        dispatcher.shared().handlers.set_message(move |message| {
            *sink.lock().unwrap() = Some(message);
            Ok(())
        });
        dispatcher.start().unwrap();

        {
            let mut buffer = b"21.5".to_vec();
            trampolines
                .on_message(&EngineMessage {
                    mid: 0,
                    topic: "sensors/temp",
                    payload: &buffer,
                    qos: QoS::AtMostOnce,
                    retain: false,
                })
                .unwrap();
            buffer.fill(0);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while received.lock().unwrap().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let message = received.lock().unwrap().take().unwrap();
        assert_eq!(message.topic(), "sensors/temp");
        assert_eq!(message.payload(), b"21.5");
        assert_eq!(message.len(), 4);
        assert!(dispatcher.stop(StopMode::Drain));
    }
}
