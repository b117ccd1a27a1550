//! # MQTT Client
//!
//! [`Client`] ties an [`Engine`] to the dispatch runtime. It owns the handler
//! slots, the dispatcher and the failure sink of one connection, and forwards
//! network operations to the engine.
//!
//! ```ignore
//! let client = Client::new(engine, ClientOptions::builder().client_id("sensor-1").build())?;
//! client.on_message(|message| {
//!     println!("{}: {message}", message.topic());
//!     Ok(())
//! });
//! client.loop_start()?;
//! client.connect("broker.local", 1883)?;
//! client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! ```
//!
//! Handlers registered with the `on_*` methods run on the dispatch thread
//! while [`loop_start`](Client::loop_start) is in effect, and on the engine
//! thread otherwise.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientOptions;
use crate::engine::Engine;
use crate::error::{HandlerResult, MqttError};
use crate::event::{EventKind, LogLevel};
use crate::message::{Message, MessageId, QoS};
use crate::runtime::Trampolines;
use crate::runtime::event_loop::{Dispatcher, StopMode};
use crate::runtime::handlers::HandlerTable;

/// One connection to a broker, driven by the engine `E`.
pub struct Client<E: Engine> {
    engine: E,
    dispatcher: Arc<Dispatcher>,
    options: ClientOptions,
}

impl<E: Engine> Client<E> {
    /// Creates a client and attaches it to `engine`.
    ///
    /// Fails with [`MqttError::InvalidParams`] when `options` asks for a
    /// persistent session without a client id.
    pub fn new(mut engine: E, options: ClientOptions) -> Result<Self, MqttError> {
        if options.client_id.is_none() && !options.clean_session {
            return Err(MqttError::InvalidParams);
        }

        let dispatcher = Arc::new(Dispatcher::new(&options));
        engine.attach(
            options.client_id.as_deref(),
            options.clean_session,
            Trampolines::new(Arc::clone(&dispatcher)),
        )?;

        debug!(
            "client {} attached (clean session: {})",
            options.client_id.as_deref().unwrap_or("<generated>"),
            options.clean_session
        );
        Ok(Self {
            engine,
            dispatcher,
            options,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn handlers(&self) -> &HandlerTable {
        &self.dispatcher.shared().handlers
    }

    // Handler registration

    /// Called with the broker's return code when a connection attempt succeeds
    /// or fails with a code outside 1 to 3.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(i32) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_connect(handler);
    }

    /// Called when the connection closes; `rc` is 0 after [`disconnect`](Self::disconnect).
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(i32) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_disconnect(handler);
    }

    pub fn on_publish<F>(&self, handler: F)
    where
        F: Fn(MessageId) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_publish(handler);
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_message(handler);
    }

    /// Called with the request id and the QoS granted for each requested topic.
    pub fn on_subscribe<F>(&self, handler: F)
    where
        F: Fn(MessageId, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_subscribe(handler);
    }

    pub fn on_unsubscribe<F>(&self, handler: F)
    where
        F: Fn(MessageId) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_unsubscribe(handler);
    }

    pub fn on_log<F>(&self, handler: F)
    where
        F: Fn(LogLevel, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().set_log(handler);
    }

    /// Registers a log handler that forwards engine log lines to the `log`
    /// facade under the `mqtt` target.
    #[cfg(feature = "log")]
    pub fn forward_engine_logs(&self) {
        self.on_log(|level, text| {
            log::log!(target: "mqtt", level.to_log_level(), "{text}");
            Ok(())
        });
    }

    /// Removes the handler for `kind`. Returns `true` if one was registered.
    pub fn clear_handler(&self, kind: EventKind) -> bool {
        self.handlers().clear(kind)
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers().is_set(kind)
    }

    // Connection

    /// Connects using the keep-alive interval from the client options.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), MqttError> {
        self.connect_with_keep_alive(host, port, self.options.keep_alive)
    }

    pub fn connect_with_keep_alive(
        &self,
        host: &str,
        port: u16,
        keep_alive: u16,
    ) -> Result<(), MqttError> {
        debug!("connecting to {host}:{port}");
        self.engine
            .connect(host, port, keep_alive)
            .inspect_err(|err| debug!("connect to {host}:{port} failed: {err}"))
    }

    pub fn connect_async(&self, host: &str, port: u16) -> Result<(), MqttError> {
        self.engine.connect_async(host, port, self.options.keep_alive)
    }

    pub fn reconnect(&self) -> Result<(), MqttError> {
        self.engine.reconnect()
    }

    pub fn disconnect(&self) -> Result<(), MqttError> {
        self.engine.disconnect()
    }

    // Messaging

    /// Publishes a message and returns the id later passed to the publish handler.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, MqttError> {
        self.engine
            .publish(topic, payload, qos, retain)
            .inspect_err(|err| debug!("publish to {topic} failed: {err}"))
    }

    pub fn subscribe(&self, pattern: &str, qos: QoS) -> Result<MessageId, MqttError> {
        self.engine
            .subscribe(pattern, qos)
            .inspect_err(|err| debug!("subscribe to {pattern} failed: {err}"))
    }

    pub fn unsubscribe(&self, pattern: &str) -> Result<MessageId, MqttError> {
        self.engine
            .unsubscribe(pattern)
            .inspect_err(|err| debug!("unsubscribe from {pattern} failed: {err}"))
    }

    // Session setup

    pub fn will_set(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.engine.will_set(topic, payload, qos, retain)
    }

    pub fn will_clear(&self) -> Result<(), MqttError> {
        self.engine.will_clear()
    }

    pub fn auth(&self, username: &str, password: Option<&str>) -> Result<(), MqttError> {
        self.engine.auth(username, password)
    }

    // Network loop

    pub fn socket(&self) -> Option<i32> {
        self.engine.socket()
    }

    pub fn want_write(&self) -> bool {
        self.engine.want_write()
    }

    /// Runs one iteration of the engine's network loop on the calling thread.
    pub fn run_loop(&self, timeout: Duration, max_packets: u32) -> Result<(), MqttError> {
        self.engine.run_loop(timeout, max_packets)
    }

    pub fn loop_forever(&self, timeout: Duration, max_packets: u32) -> Result<(), MqttError> {
        self.engine.loop_forever(timeout, max_packets)
    }

    pub fn loop_read(&self, max_packets: u32) -> Result<(), MqttError> {
        self.engine.loop_read(max_packets)
    }

    pub fn loop_write(&self, max_packets: u32) -> Result<(), MqttError> {
        self.engine.loop_write(max_packets)
    }

    pub fn loop_misc(&self) -> Result<(), MqttError> {
        self.engine.loop_misc()
    }

    // Lifecycle

    /// Starts the dispatch thread, then the engine's network thread.
    ///
    /// If the engine fails to start, a dispatch thread started by this call
    /// is stopped again.
    pub fn loop_start(&self) -> Result<(), MqttError> {
        let started = self.dispatcher.start()?;
        if let Err(err) = self.engine.loop_start() {
            if started {
                self.dispatcher.stop(StopMode::Discard);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Stops the engine's network thread, then the dispatch thread.
    ///
    /// Events already queued are handled before this returns, unless `force`
    /// is set, in which case they are dropped and counted in
    /// [`discarded_events`](Self::discarded_events). The dispatch thread is
    /// stopped even if the engine reports an error, which is then returned.
    pub fn loop_stop(&self, force: bool) -> Result<(), MqttError> {
        let engine_result = self.engine.loop_stop(force);
        let mode = if force {
            StopMode::Discard
        } else {
            StopMode::Drain
        };
        self.dispatcher.stop(mode);
        engine_result
    }

    /// Starts only the dispatch thread, for engines driven with [`run_loop`](Self::run_loop).
    ///
    /// Returns `Ok(false)` if it was already running.
    pub fn start_dispatch(&self) -> Result<bool, MqttError> {
        self.dispatcher.start()
    }

    /// Stops only the dispatch thread after it has handled every queued
    /// event. Returns `false` if it was not running.
    pub fn stop_dispatch(&self) -> bool {
        self.dispatcher.stop(StopMode::Drain)
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Number of events queued for the dispatch thread.
    pub fn pending_events(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Number of queued events dropped by forced stops and by dropping the client.
    pub fn discarded_events(&self) -> usize {
        self.dispatcher.discarded()
    }

    /// Number of failures waiting to be taken.
    pub fn failure_count(&self) -> usize {
        self.dispatcher.shared().failures.len()
    }

    /// Drains the failures raised where no caller could receive them: handler
    /// failures on the dispatch thread and refused connections.
    pub fn take_failures(&self) -> Vec<MqttError> {
        self.dispatcher.shared().failures.take()
    }
}

impl<E: Engine> Drop for Client<E> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.loop_stop(true) {
            trace!("engine loop not stopped on drop: {err}");
        }
        self.dispatcher.stop(StopMode::Discard);
    }
}
