//! An in-process engine that acts as its own broker.
//!
//! `LoopbackEngine` keeps a single session in memory. Every operation queues
//! the packets a broker would answer with, and the loop functions deliver
//! them through the trampolines on the thread that runs the loop. Messages
//! published to a topic the client is subscribed to come straight back.
//!
//! It is meant for tests and demos of the dispatch runtime, and for
//! exercising handler code without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

use super::Engine;
use crate::error::{MqttError, ReturnCode};
use crate::event::LogLevel;
use crate::message::{EngineMessage, MessageId, QoS};
use crate::runtime::Trampolines;

/// How long the network thread waits for traffic before checking for stop.
const NETWORK_POLL_INTERVAL: Duration = Duration::from_millis(5);

const NETWORK_THREAD_NAME: &str = "mqtt-loopback";

static NEXT_CLIENT: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone)]
struct Delivery {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

/// A packet on its way from the simulated broker to the client.
#[derive(Debug)]
enum Packet {
    ConnAck(i32),
    PubAck(MessageId),
    Deliver(MessageId, Delivery),
    SubAck(MessageId, Vec<u8>),
    UnsubAck(MessageId),
    Disconnect(i32),
    Log(LogLevel, String),
}

#[derive(Debug, Default)]
struct Session {
    client_id: String,
    clean_session: bool,
    connected: bool,
    last_mid: MessageId,
    broker: Option<(String, u16, u16)>,
    username: Option<String>,
    will: Option<Delivery>,
    refuse_next: Option<i32>,
    subscriptions: Vec<(String, QoS)>,
    retained: Vec<Delivery>,
    inbound: VecDeque<Packet>,
}

impl Session {
    fn next_mid(&mut self) -> MessageId {
        self.last_mid = self.last_mid.wrapping_add(1);
        if self.last_mid == 0 {
            self.last_mid = 1;
        }
        self.last_mid
    }

    fn log(&mut self, text: String) {
        self.inbound.push_back(Packet::Log(LogLevel::DEBUG, text));
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        if self.connected {
            Ok(())
        } else {
            ReturnCode::NoConn.into_result()
        }
    }

    fn is_idle(&self) -> bool {
        !self.connected && self.inbound.is_empty()
    }

    /// Queues `delivery` with the QoS downgraded to what the client subscribed with.
    fn deliver(&mut self, mut delivery: Delivery, granted: QoS) {
        delivery.qos = delivery.qos.min(granted);
        let mid = match delivery.qos {
            QoS::AtMostOnce => 0,
            _ => self.next_mid(),
        };
        self.inbound.push_back(Packet::Deliver(mid, delivery));
    }

    fn retain(&mut self, delivery: &Delivery) {
        self.retained.retain(|kept| kept.topic != delivery.topic);
        if !delivery.payload.is_empty() {
            self.retained.push(delivery.clone());
        }
    }

    fn start_connect(&mut self, host: &str, port: u16, keep_alive: u16) -> Result<(), MqttError> {
        if host.is_empty() {
            return Err(MqttError::InvalidParams);
        }
        self.broker = Some((host.to_owned(), port, keep_alive));

        let rc = self.refuse_next.take().unwrap_or(0);
        self.connected = rc == 0;
        if self.clean_session {
            self.subscriptions.clear();
        }

        let id = &self.client_id;
        let sending = format!("Client {id} sending CONNECT");
        let received = format!("Client {id} received CONNACK ({rc})");
        self.log(sending);
        self.log(received);
        self.inbound.push_back(Packet::ConnAck(rc));
        Ok(())
    }
}

struct Inner {
    session: Mutex<Session>,
    arrived: Condvar,
    trampolines: OnceLock<Trampolines>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` on the session and wakes a waiting loop if it queued packets.
    fn with_session<T>(&self, op: impl FnOnce(&mut Session) -> T) -> T {
        let mut session = self.lock();
        let queued = session.inbound.len();
        let out = op(&mut session);
        if session.inbound.len() > queued {
            self.arrived.notify_all();
        }
        out
    }

    /// Delivers every queued packet, first waiting up to `timeout` for one to arrive.
    ///
    /// The session lock is released before each trampoline call, so handlers
    /// running inline may call back into the engine.
    fn pump(&self, timeout: Option<Duration>) -> Result<(), MqttError> {
        if let Some(timeout) = timeout {
            let session = self.lock();
            let _ = self
                .arrived
                .wait_timeout_while(session, timeout, |s| s.inbound.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
        }

        loop {
            let Some(packet) = self.lock().inbound.pop_front() else {
                return Ok(());
            };
            self.deliver(packet)?;
        }
    }

    fn deliver(&self, packet: Packet) -> Result<(), MqttError> {
        let trampolines = self.trampolines.get().ok_or(MqttError::InvalidParams)?;
        match packet {
            Packet::ConnAck(rc) => trampolines.on_connect(rc),
            Packet::PubAck(mid) => trampolines.on_publish(mid),
            Packet::Deliver(mid, delivery) => trampolines.on_message(&EngineMessage {
                mid,
                topic: &delivery.topic,
                payload: &delivery.payload,
                qos: delivery.qos,
                retain: delivery.retain,
            }),
            Packet::SubAck(mid, granted) => trampolines.on_subscribe(mid, &granted),
            Packet::UnsubAck(mid) => trampolines.on_unsubscribe(mid),
            Packet::Disconnect(rc) => trampolines.on_disconnect(rc),
            Packet::Log(level, text) => trampolines.on_log(level, &text),
        }
    }

    fn wake(&self) {
        let _session = self.lock();
        self.arrived.notify_all();
    }
}

struct NetworkThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
}

/// An [`Engine`] that loops traffic back to the client without a network.
pub struct LoopbackEngine {
    inner: Arc<Inner>,
    network: Mutex<Option<NetworkThread>>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session::default()),
                arrived: Condvar::new(),
                trampolines: OnceLock::new(),
            }),
            network: Mutex::new(None),
        }
    }

    /// Makes the next connect attempt answer with `rc` instead of success.
    pub fn refuse_next_connect(&self, rc: i32) {
        self.inner.lock().refuse_next = Some(rc);
    }

    /// Simulates a message published to this client by the broker.
    pub fn inject_message(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if !is_valid_topic(topic) {
            return Err(MqttError::InvalidParams);
        }
        let delivery = Delivery {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        self.inner
            .with_session(|session| session.deliver(delivery, QoS::ExactlyOnce));
        Ok(())
    }

    /// Simulates the network dropping the connection.
    ///
    /// The disconnect handler sees a non-zero code. A retained will is kept
    /// by the simulated broker.
    pub fn lose_connection(&self) -> Result<(), MqttError> {
        self.inner.with_session(|session| {
            session.ensure_connected()?;
            session.connected = false;
            if let Some(will) = session.will.clone() {
                if will.retain {
                    session.retain(&will);
                }
            }
            session
                .inbound
                .push_back(Packet::Disconnect(ReturnCode::ConnLost as i32));
            Ok(())
        })
    }

    /// The identifier the engine connects with.
    pub fn client_id(&self) -> String {
        self.inner.lock().client_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn username(&self) -> Option<String> {
        self.inner.lock().username.clone()
    }

    fn lock_network(&self) -> MutexGuard<'_, Option<NetworkThread>> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for LoopbackEngine {
    fn attach(
        &mut self,
        client_id: Option<&str>,
        clean_session: bool,
        trampolines: Trampolines,
    ) -> Result<(), MqttError> {
        if client_id.is_none() && !clean_session {
            return Err(MqttError::InvalidParams);
        }
        self.inner
            .trampolines
            .set(trampolines)
            .map_err(|_| MqttError::InvalidParams)?;

        let mut session = self.inner.lock();
        session.client_id = match client_id {
            Some(id) => id.to_owned(),
            None => format!("loopback-{}", NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)),
        };
        session.clean_session = clean_session;
        Ok(())
    }

    fn connect(&self, host: &str, port: u16, keep_alive: u16) -> Result<(), MqttError> {
        self.inner
            .with_session(|session| session.start_connect(host, port, keep_alive))
    }

    fn connect_async(&self, host: &str, port: u16, keep_alive: u16) -> Result<(), MqttError> {
        self.connect(host, port, keep_alive)
    }

    fn reconnect(&self) -> Result<(), MqttError> {
        self.inner.with_session(|session| {
            let (host, port, keep_alive) = session.broker.clone().ok_or(MqttError::InvalidParams)?;
            session.start_connect(&host, port, keep_alive)
        })
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.inner.with_session(|session| {
            session.ensure_connected()?;
            session.connected = false;
            let text = format!("Client {} sending DISCONNECT", session.client_id);
            session.log(text);
            session.inbound.push_back(Packet::Disconnect(0));
            Ok(())
        })
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, MqttError> {
        if !is_valid_topic(topic) {
            return Err(MqttError::InvalidParams);
        }
        self.inner.with_session(|session| {
            session.ensure_connected()?;
            let mid = session.next_mid();
            let text = format!(
                "Client {} sending PUBLISH (d0, q{}, r{}, m{mid}, '{topic}', ... ({} bytes))",
                session.client_id,
                u8::from(qos),
                u8::from(retain),
                payload.len()
            );
            session.log(text);
            session.inbound.push_back(Packet::PubAck(mid));

            let delivery = Delivery {
                topic: topic.to_owned(),
                payload: payload.to_vec(),
                qos,
                retain: false,
            };
            if retain {
                session.retain(&Delivery {
                    retain: true,
                    ..delivery.clone()
                });
            }
            // One delivery per message, at the highest QoS among matching subscriptions.
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, qos)| *qos)
                .max();
            if let Some(granted) = granted {
                session.deliver(delivery, granted);
            }
            Ok(mid)
        })
    }

    fn subscribe(&self, pattern: &str, qos: QoS) -> Result<MessageId, MqttError> {
        if !is_valid_filter(pattern) {
            return Err(MqttError::InvalidParams);
        }
        self.inner.with_session(|session| {
            session.ensure_connected()?;
            let mid = session.next_mid();
            let text = format!(
                "Client {} sending SUBSCRIBE (Mid: {mid}, Topic: {pattern}, QoS: {})",
                session.client_id,
                u8::from(qos)
            );
            session.log(text);

            session.subscriptions.retain(|(filter, _)| filter != pattern);
            session.subscriptions.push((pattern.to_owned(), qos));
            session.inbound.push_back(Packet::SubAck(mid, vec![qos.into()]));

            let retained: Vec<Delivery> = session
                .retained
                .iter()
                .filter(|kept| topic_matches(pattern, &kept.topic))
                .cloned()
                .collect();
            for delivery in retained {
                session.deliver(delivery, qos);
            }
            Ok(mid)
        })
    }

    fn unsubscribe(&self, pattern: &str) -> Result<MessageId, MqttError> {
        if !is_valid_filter(pattern) {
            return Err(MqttError::InvalidParams);
        }
        self.inner.with_session(|session| {
            session.ensure_connected()?;
            let mid = session.next_mid();
            let text = format!(
                "Client {} sending UNSUBSCRIBE (Mid: {mid}, Topic: {pattern})",
                session.client_id
            );
            session.log(text);
            session.subscriptions.retain(|(filter, _)| filter != pattern);
            session.inbound.push_back(Packet::UnsubAck(mid));
            Ok(mid)
        })
    }

    fn will_set(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if !is_valid_topic(topic) {
            return Err(MqttError::InvalidParams);
        }
        self.inner.lock().will = Some(Delivery {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn will_clear(&self) -> Result<(), MqttError> {
        self.inner.lock().will = None;
        Ok(())
    }

    fn auth(&self, username: &str, _password: Option<&str>) -> Result<(), MqttError> {
        if username.is_empty() {
            return Err(MqttError::InvalidParams);
        }
        self.inner.lock().username = Some(username.to_owned());
        Ok(())
    }

    fn want_write(&self) -> bool {
        !self.inner.lock().inbound.is_empty()
    }

    /// `max_packets` is ignored; everything queued is delivered.
    fn run_loop(&self, timeout: Duration, _max_packets: u32) -> Result<(), MqttError> {
        if self.inner.lock().is_idle() {
            return Err(MqttError::NotConnected);
        }
        self.inner.pump(Some(timeout))
    }

    fn loop_forever(&self, timeout: Duration, max_packets: u32) -> Result<(), MqttError> {
        loop {
            self.run_loop(timeout, max_packets)?;
            if self.inner.lock().is_idle() {
                return Ok(());
            }
        }
    }

    fn loop_read(&self, _max_packets: u32) -> Result<(), MqttError> {
        if self.inner.lock().is_idle() {
            return Err(MqttError::NotConnected);
        }
        self.inner.pump(None)
    }

    fn loop_write(&self, _max_packets: u32) -> Result<(), MqttError> {
        self.inner.lock().ensure_connected()
    }

    fn loop_misc(&self) -> Result<(), MqttError> {
        self.inner.lock().ensure_connected()
    }

    fn loop_start(&self) -> Result<(), MqttError> {
        let mut network = self.lock_network();
        if network.as_ref().is_some_and(|net| !net.handle.is_finished()) {
            return Err(MqttError::InvalidParams);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let force = Arc::new(AtomicBool::new(false));
        let handle = Builder::new().name(NETWORK_THREAD_NAME.to_string()).spawn({
            let inner = Arc::clone(&self.inner);
            let stop = Arc::clone(&stop);
            let force = Arc::clone(&force);
            move || {
                while !stop.load(Ordering::Acquire) {
                    if let Err(err) = inner.pump(Some(NETWORK_POLL_INTERVAL)) {
                        warn!("loopback network loop: {err}");
                    }
                }
                if !force.load(Ordering::Acquire) {
                    if let Err(err) = inner.pump(None) {
                        warn!("loopback network loop: {err}");
                    }
                }
            }
        })?;

        *network = Some(NetworkThread {
            handle,
            stop,
            force,
        });
        Ok(())
    }

    fn loop_stop(&self, force: bool) -> Result<(), MqttError> {
        let Some(network) = self.lock_network().take() else {
            return Err(MqttError::InvalidParams);
        };
        network.force.store(force, Ordering::Release);
        network.stop.store(true, Ordering::Release);
        self.inner.wake();

        if network.handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        network
            .handle
            .join()
            .map_err(|_| MqttError::Io(std::io::Error::other("loopback network thread panicked")))
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        if self.lock_network().is_some() {
            let _ = self.loop_stop(true);
        }
    }
}

fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" => return levels.peek().is_none(),
            "+" => {}
            _ if level.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}

/// Matches a topic against a subscription filter with `+` and `#` wildcards.
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::runtime::event_loop::Dispatcher;

    fn attached(client_id: Option<&str>) -> (Arc<Dispatcher>, LoopbackEngine) {
        let dispatcher = Arc::new(Dispatcher::new(&ClientOptions::default()));
        let mut engine = LoopbackEngine::new();
        engine
            .attach(client_id, true, Trampolines::new(Arc::clone(&dispatcher)))
            .unwrap();
        (dispatcher, engine)
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/#", "sensors"));
        assert!(topic_matches("sensors/#", "sensors/kitchen/temp"));
        assert!(topic_matches("#", "a/b/c"));
        assert!(!topic_matches("sensors/+", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/+", "sensors"));
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn filter_validation() {
        assert!(is_valid_filter("a/+/c"));
        assert!(is_valid_filter("a/#"));
        assert!(!is_valid_filter("a/#/c"));
        assert!(!is_valid_filter("a/b+"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_topic("a/+"));
    }

    #[test]
    fn anonymous_persistent_session_is_rejected() {
        let dispatcher = Arc::new(Dispatcher::new(&ClientOptions::default()));
        let mut engine = LoopbackEngine::new();
        let err = engine
            .attach(None, false, Trampolines::new(dispatcher))
            .unwrap_err();
        assert!(matches!(err, MqttError::InvalidParams));
    }

    #[test]
    fn generated_client_id() {
        let (_, engine) = attached(None);
        assert!(engine.client_id().starts_with("loopback-"));
    }

    #[test]
    fn operations_require_connection() {
        let (_, engine) = attached(Some("bench"));
        assert!(matches!(
            engine.publish("a", b"x", QoS::AtMostOnce, false),
            Err(MqttError::NotConnected)
        ));
        assert!(matches!(engine.disconnect(), Err(MqttError::NotConnected)));
        assert!(matches!(
            engine.run_loop(Duration::from_millis(1), 1),
            Err(MqttError::NotConnected)
        ));
    }

    #[test]
    fn publish_loops_back_to_matching_subscription() {
        let (dispatcher, engine) = attached(Some("bench"));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        dispatcher.shared().handlers.set_message(move |message| {
            sink.lock().unwrap().push(message);
            Ok(())
        });

        engine.connect("localhost", 1883, 10).unwrap();
        engine.subscribe("sensors/+", QoS::AtLeastOnce).unwrap();
        engine
            .publish("sensors/temp", b"21.5", QoS::ExactlyOnce, false)
            .unwrap();
        engine.publish("other", b"x", QoS::AtMostOnce, false).unwrap();
        engine.run_loop(Duration::from_millis(10), 1).unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic(), "sensors/temp");
        assert_eq!(received[0].qos(), QoS::AtLeastOnce);
        assert_ne!(received[0].mid(), 0);
    }

    #[test]
    fn retained_message_delivered_on_subscribe() {
        let (dispatcher, engine) = attached(Some("bench"));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        dispatcher.shared().handlers.set_message(move |message| {
            sink.lock().unwrap().push((message.topic().to_owned(), message.retain()));
            Ok(())
        });

        engine.connect("localhost", 1883, 10).unwrap();
        engine
            .publish("status", b"online", QoS::AtMostOnce, true)
            .unwrap();
        engine.subscribe("status", QoS::AtMostOnce).unwrap();
        engine.loop_read(1).unwrap();

        assert_eq!(*received.lock().unwrap(), vec![("status".to_owned(), true)]);
    }

    #[test]
    fn lost_connection_reports_non_zero_code() {
        let (dispatcher, engine) = attached(Some("bench"));
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        dispatcher.shared().handlers.set_disconnect(move |rc| {
            sink.lock().unwrap().push(rc);
            Ok(())
        });

        engine.connect("localhost", 1883, 10).unwrap();
        engine.lose_connection().unwrap();
        engine.loop_read(1).unwrap();

        assert_eq!(*codes.lock().unwrap(), vec![ReturnCode::ConnLost as i32]);
        assert!(!engine.is_connected());
        engine.reconnect().unwrap();
        assert!(engine.is_connected());
    }

    #[test]
    fn network_thread_delivers_until_stopped() {
        let (dispatcher, engine) = attached(Some("bench"));
        let acked = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&acked);
        dispatcher.shared().handlers.set_publish(move |mid| {
            sink.lock().unwrap().push(mid);
            Ok(())
        });

        engine.loop_start().unwrap();
        assert!(matches!(engine.loop_start(), Err(MqttError::InvalidParams)));
        engine.connect("localhost", 1883, 10).unwrap();
        let mid = engine.publish("a", b"x", QoS::AtMostOnce, false).unwrap();
        engine.loop_stop(false).unwrap();

        assert_eq!(*acked.lock().unwrap(), vec![mid]);
        assert!(matches!(engine.loop_stop(false), Err(MqttError::InvalidParams)));
    }
}
