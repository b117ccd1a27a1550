//! # Event Records
//!
//! An [`Event`] is an owned snapshot of one engine callback. It is created on
//! the engine thread by a trampoline and consumed by whichever thread runs the
//! handler. Every buffer it references is owned, because engine buffers are
//! transient.

use std::fmt;

use crate::message::{Message, MessageId};

/// The kinds of network events delivered to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    Connect,
    Disconnect,
    Publish,
    Message,
    Subscribe,
    Unsubscribe,
    Log,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Publish,
        EventKind::Message,
        EventKind::Subscribe,
        EventKind::Unsubscribe,
        EventKind::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Publish => "publish",
            EventKind::Message => "message",
            EventKind::Subscribe => "subscribe",
            EventKind::Unsubscribe => "unsubscribe",
            EventKind::Log => "log",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an engine log line.
///
/// Engines report levels as bit flags so that a log callback can be filtered
/// with a mask; the known flags are exposed as associated constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogLevel(pub i32);

impl LogLevel {
    pub const NONE: LogLevel = LogLevel(0x00);
    pub const INFO: LogLevel = LogLevel(0x01);
    pub const NOTICE: LogLevel = LogLevel(0x02);
    pub const WARNING: LogLevel = LogLevel(0x04);
    pub const ERR: LogLevel = LogLevel(0x08);
    pub const DEBUG: LogLevel = LogLevel(0x10);
    pub const SUBSCRIBE: LogLevel = LogLevel(0x20);
    pub const UNSUBSCRIBE: LogLevel = LogLevel(0x40);
    pub const ALL: LogLevel = LogLevel(0xFFFF);

    pub fn bits(&self) -> i32 {
        self.0
    }

    /// The `log` facade level used when engine log lines are forwarded.
    #[cfg(feature = "log")]
    pub fn to_log_level(&self) -> log::Level {
        match *self {
            LogLevel::ERR => log::Level::Error,
            LogLevel::WARNING => log::Level::Warn,
            LogLevel::INFO | LogLevel::NOTICE => log::Level::Info,
            LogLevel::DEBUG => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }
}

impl From<i32> for LogLevel {
    fn from(bits: i32) -> Self {
        LogLevel(bits)
    }
}

/// One captured network callback, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The broker answered a connection attempt.
    Connect { rc: i32 },
    /// The connection was closed; `rc == 0` means the client asked for it.
    Disconnect { rc: i32 },
    /// A publish request left the client (QoS 0) or was acknowledged.
    Publish { mid: MessageId },
    /// A message arrived on a subscribed topic.
    Message(Message),
    /// A subscribe request was acknowledged with the granted QoS per topic.
    Subscribe { mid: MessageId, granted_qos: Vec<u8> },
    /// An unsubscribe request was acknowledged.
    Unsubscribe { mid: MessageId },
    /// The engine emitted a log line.
    Log { level: LogLevel, text: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Disconnect { .. } => EventKind::Disconnect,
            Event::Publish { .. } => EventKind::Publish,
            Event::Message(_) => EventKind::Message,
            Event::Subscribe { .. } => EventKind::Subscribe,
            Event::Unsubscribe { .. } => EventKind::Unsubscribe,
            Event::Log { .. } => EventKind::Log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QoS;

    #[test]
    fn kind_matches_variant() {
        let events = [
            Event::Connect { rc: 0 },
            Event::Disconnect { rc: 0 },
            Event::Publish { mid: 1 },
            Event::Message(Message::new(1, "a", "b", QoS::AtMostOnce, false)),
            Event::Subscribe {
                mid: 1,
                granted_qos: vec![0],
            },
            Event::Unsubscribe { mid: 1 },
            Event::Log {
                level: LogLevel::INFO,
                text: "x".into(),
            },
        ];
        let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, EventKind::ALL);
    }

    #[cfg(feature = "log")]
    #[test]
    fn engine_levels_map_to_facade() {
        assert_eq!(LogLevel::ERR.to_log_level(), log::Level::Error);
        assert_eq!(LogLevel::NOTICE.to_log_level(), log::Level::Info);
        assert_eq!(LogLevel::SUBSCRIBE.to_log_level(), log::Level::Trace);
    }
}
