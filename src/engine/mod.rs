//! # MQTT Engine Abstraction
//!
//! This module defines the [`Engine`] trait, which abstracts the library that
//! actually speaks MQTT on the wire. The dispatch runtime never touches a
//! socket: it hands the engine a [`Trampolines`] handle and the engine calls
//! back through it from whatever thread runs its network loop.
//!
//! Engines are internally synchronized, so every operation takes `&self` and
//! may be called from a handler running on the dispatch thread.
//!
//! Optional capabilities have default implementations returning
//! [`MqttError::NotSupported`].

use std::time::Duration;

use crate::error::MqttError;
use crate::message::{MessageId, QoS};
use crate::runtime::Trampolines;

pub mod loopback;

pub use loopback::LoopbackEngine;

/// A trait representing an MQTT protocol engine.
pub trait Engine: Send + Sync {
    /// Binds the engine to a client.
    ///
    /// Called exactly once by [`Client::new`](crate::Client::new), before any
    /// other operation. `client_id` is `None` when the engine should generate
    /// an identifier.
    fn attach(
        &mut self,
        client_id: Option<&str>,
        clean_session: bool,
        trampolines: Trampolines,
    ) -> Result<(), MqttError>;

    /// Connects to a broker, blocking until the request has been sent.
    fn connect(&self, host: &str, port: u16, keep_alive: u16) -> Result<(), MqttError>;

    /// Connects without blocking; the outcome is reported to the connect handler.
    fn connect_async(&self, _host: &str, _port: u16, _keep_alive: u16) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    /// Reconnects using the parameters of the last successful `connect`.
    fn reconnect(&self) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    fn disconnect(&self) -> Result<(), MqttError>;

    /// Sends a message and returns the id reported later to the publish handler.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, MqttError>;

    fn subscribe(&self, pattern: &str, qos: QoS) -> Result<MessageId, MqttError>;

    fn unsubscribe(&self, pattern: &str) -> Result<MessageId, MqttError>;

    /// Registers the message the broker publishes if the client disappears.
    fn will_set(
        &self,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    fn will_clear(&self) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    /// Sets the credentials sent with the next connect.
    fn auth(&self, _username: &str, _password: Option<&str>) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    /// The raw socket descriptor, if the engine has one open.
    fn socket(&self) -> Option<i32> {
        None
    }

    /// Whether the engine has outgoing data waiting for the socket to become writable.
    fn want_write(&self) -> bool {
        false
    }

    /// Runs one iteration of the network loop, waiting at most `timeout` for activity.
    fn run_loop(&self, timeout: Duration, max_packets: u32) -> Result<(), MqttError>;

    /// Runs the network loop on the calling thread until the client disconnects.
    fn loop_forever(&self, timeout: Duration, max_packets: u32) -> Result<(), MqttError>;

    fn loop_read(&self, _max_packets: u32) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    fn loop_write(&self, _max_packets: u32) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    fn loop_misc(&self) -> Result<(), MqttError> {
        Err(MqttError::NotSupported)
    }

    /// Starts a network thread owned by the engine.
    fn loop_start(&self) -> Result<(), MqttError>;

    /// Stops the network thread. With `force`, the thread does not wait for
    /// pending traffic to be processed.
    fn loop_stop(&self, force: bool) -> Result<(), MqttError>;
}
