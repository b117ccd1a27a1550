//! # Callback Dispatch for MQTT Clients
//!
//! `myrtio-mqtt-dispatch` sits between an MQTT protocol engine and the
//! application. The engine owns the socket and runs its network loop on a
//! thread of its own; this crate turns each engine callback into an owned
//! event and runs the handler the application registered for it.
//!
//! ## Core Features
//!
//! - **Engine Agnostic:** The [`Engine`] trait abstracts the library that
//!   speaks MQTT on the wire. An in-process [`LoopbackEngine`] is included.
//! - **Two Dispatch Modes:** Handlers run inline on the engine thread, or on a
//!   dedicated dispatch thread fed by a callback queue, so slow handlers never
//!   stall the network loop.
//! - **Owned Events:** Message topics and payloads are copied out of engine
//!   buffers before the engine callback returns.
//! - **Observable Failures:** Handler errors and panics are caught. Inline
//!   failures are returned to the engine; failures on the dispatch thread are
//!   logged and kept until [`Client::take_failures`] is called.
//! - **Optional Logging:** Internal logging goes through the `log` facade,
//!   enabled by the default `log` feature.
//!
//! ## Usage
//!
//! ```ignore
//! use myrtio_mqtt_dispatch::{Client, ClientOptions, LoopbackEngine, QoS};
//!
//! let client = Client::new(LoopbackEngine::new(), ClientOptions::default())?;
//! client.on_connect(|rc| {
//!     println!("connected: {rc}");
//!     Ok(())
//! });
//! client.on_message(|message| {
//!     println!("{} -> {message}", message.topic());
//!     Ok(())
//! });
//!
//! client.loop_start()?;
//! client.connect("localhost", 1883)?;
//! client.subscribe("sensors/#", QoS::AtMostOnce)?;
//! client.publish("sensors/temp", b"21.5", QoS::AtMostOnce, false)?;
//! client.loop_stop(false)?;
//! ```
//!
//! ## Writing an Engine
//!
//! An engine receives a [`Trampolines`] handle in [`Engine::attach`] and calls
//! `on_connect`, `on_message`, and the other entry points from its network
//! thread. The trampolines decide whether to run the handler right away or to
//! queue the event for the dispatch thread.

#[macro_use]
mod fmt;

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod runtime;

// Re-export key types for easier access at the crate root.
pub use client::Client;
pub use config::{ClientOptions, ClientOptionsBuilder, FailurePolicy};
pub use engine::{Engine, LoopbackEngine};
pub use error::{
    ConnectReasonCode, DispatchError, HandlerError, HandlerFailure, HandlerResult, MqttError,
    ReturnCode,
};
pub use event::{Event, EventKind, LogLevel};
pub use message::{EngineMessage, Message, MessageId, QoS};
pub use runtime::Trampolines;
