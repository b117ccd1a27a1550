//! # Messages
//!
//! `EngineMessage` is the view an engine hands to the message trampoline. It
//! borrows the engine's receive buffer and is only valid for the duration of
//! that call. `Message` is the owned copy delivered to user handlers.

use std::fmt;

/// Identifier correlating a publish/subscribe/unsubscribe request with its acknowledgment.
pub type MessageId = u16;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// An incoming publish as seen by the engine.
///
/// The topic and payload borrow from a buffer the engine may reuse as soon as
/// the trampoline returns.
#[derive(Debug, Clone, Copy)]
pub struct EngineMessage<'a> {
    pub mid: MessageId,
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// A message received from the broker.
///
/// Built by deep-copying an [`EngineMessage`], so it stays valid after the
/// engine has released its buffers. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    mid: MessageId,
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

impl Message {
    pub fn new(
        mid: MessageId,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            mid,
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Message identifier. Engines assign ids to QoS 0 messages as well so
    /// they can still be tracked.
    pub fn mid(&self) -> MessageId {
        self.mid
    }

    /// Topic this message was published on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Whether the broker delivered this message as a retained message.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Consumes the message, returning the owned payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl From<&EngineMessage<'_>> for Message {
    fn from(msg: &EngineMessage<'_>) -> Self {
        Self {
            mid: msg.mid,
            topic: msg.topic.to_owned(),
            payload: msg.payload.to_vec(),
            qos: msg.qos,
            retain: msg.retain,
        }
    }
}

/// Renders the payload as text, replacing invalid UTF-8 sequences.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_outlives_engine_buffer() {
        let mut buffer = b"sensors/temp21.5".to_vec();
        let message = {
            let (topic, payload) = buffer.split_at(12);
            let raw = EngineMessage {
                mid: 7,
                topic: std::str::from_utf8(topic).unwrap(),
                payload,
                qos: QoS::AtLeastOnce,
                retain: false,
            };
            Message::from(&raw)
        };
        buffer.fill(0);

        assert_eq!(message.topic(), "sensors/temp");
        assert_eq!(message.to_string(), "21.5");
        assert_eq!(message.qos(), QoS::AtLeastOnce);
        assert_eq!(message.len(), 4);
        assert!(!message.retain());
        assert_eq!(message.mid(), 7);
    }

    #[test]
    fn qos_from_raw() {
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(3), Err(3));
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }
}
