use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use myrtio_mqtt_dispatch::{
    Client, ClientOptions, EventKind, FailurePolicy, LoopbackEngine, MqttError, QoS,
};

fn client(options: ClientOptions) -> Client<LoopbackEngine> {
    Client::new(LoopbackEngine::new(), options).unwrap()
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn round_trip_on_dispatch_thread() {
    let client = client(ClientOptions::builder().client_id("thermostat").build());
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    client.on_message(move |message| {
        let thread = thread::current().name().unwrap_or_default().to_owned();
        sink.lock().unwrap().push((thread, message));
        Ok(())
    });

    client.loop_start().unwrap();
    client.connect("localhost", 1883).unwrap();
    client.subscribe("sensors/+", QoS::AtLeastOnce).unwrap();
    client
        .publish("sensors/temp", b"21.5", QoS::AtLeastOnce, false)
        .unwrap();

    assert!(wait_until(|| !received.lock().unwrap().is_empty()));
    client.loop_stop(false).unwrap();

    let received = received.lock().unwrap();
    let (thread, message) = &received[0];
    assert_eq!(thread, "mqtt-dispatch");
    assert_eq!(message.topic(), "sensors/temp");
    assert_eq!(message.to_string(), "21.5");
    assert_eq!(message.qos(), QoS::AtLeastOnce);
}

#[test]
fn loop_forever_returns_after_disconnect() {
    let client = Arc::new(client(ClientOptions::default()));
    let codes = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&client);
    client.on_connect(move |_| {
        if let Some(client) = weak.upgrade() {
            client.disconnect()?;
        }
        Ok(())
    });
    let sink = Arc::clone(&codes);
    client.on_disconnect(move |rc| {
        sink.lock().unwrap().push(rc);
        Ok(())
    });

    client.connect("localhost", 1883).unwrap();
    client
        .loop_forever(Duration::from_millis(10), 1)
        .unwrap();

    assert_eq!(*codes.lock().unwrap(), vec![0]);
    assert!(!client.engine().is_connected());
}

#[test]
fn stop_loop_policy_ends_dispatch_thread() {
    let client = client(
        ClientOptions::builder()
            .failure_policy(FailurePolicy::StopLoop)
            .dispatch_thread_name("handlers")
            .build(),
    );
    client.on_publish(|mid| Err(format!("cannot confirm {mid}").into()));

    client.start_dispatch().unwrap();
    client.connect("localhost", 1883).unwrap();
    let mid = client.publish("jobs", b"run", QoS::AtMostOnce, false).unwrap();
    client.run_loop(Duration::from_millis(10), 1).unwrap();

    assert!(wait_until(|| !client.is_dispatching()));
    let failures = client.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].to_string(),
        format!("publish handler failed: cannot confirm {mid}")
    );

    // With the dispatch thread gone, the failure reaches the loop caller.
    client.publish("jobs", b"run", QoS::AtMostOnce, false).unwrap();
    assert!(matches!(
        client.run_loop(Duration::from_millis(10), 1),
        Err(MqttError::Handler(err)) if err.kind() == EventKind::Publish
    ));
}

#[test]
fn panicking_handler_does_not_kill_dispatch_thread() {
    let client = client(ClientOptions::default());
    let acked = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&acked);
    client.on_publish(move |mid| {
        if mid == 1 {
            panic!("first ack");
        }
        sink.lock().unwrap().push(mid);
        Ok(())
    });

    client.loop_start().unwrap();
    client.connect("localhost", 1883).unwrap();
    client.publish("a", b"1", QoS::AtMostOnce, false).unwrap();
    assert!(wait_until(|| client.failure_count() == 1));
    let second = client.publish("a", b"2", QoS::AtMostOnce, false).unwrap();

    assert!(wait_until(|| acked.lock().unwrap().contains(&second)));
    assert!(client.is_dispatching());
    match &client.take_failures()[..] {
        [MqttError::Handler(err)] => assert!(err.is_panic()),
        other => panic!("unexpected failures: {other:?}"),
    }
    client.loop_stop(true).unwrap();
}

#[test]
fn retained_will_survives_lost_connection() {
    let client = client(ClientOptions::builder().client_id("lamp").build());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    client.on_message(move |message| {
        sink.lock()
            .unwrap()
            .push(format!("{} {message} {}", message.topic(), message.retain()));
        Ok(())
    });

    client.auth("lamp", Some("secret")).unwrap();
    client
        .will_set("lamp/status", b"offline", QoS::AtLeastOnce, true)
        .unwrap();
    client.connect("localhost", 1883).unwrap();
    client.engine().lose_connection().unwrap();
    client.loop_read(1).unwrap();

    client.reconnect().unwrap();
    client.subscribe("lamp/#", QoS::AtMostOnce).unwrap();
    client.run_loop(Duration::from_millis(10), 1).unwrap();

    assert_eq!(client.engine().username().as_deref(), Some("lamp"));
    assert_eq!(
        *received.lock().unwrap(),
        vec!["lamp/status offline true".to_string()]
    );
}

#[cfg(feature = "log")]
mod forwarded_logs {
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};

    static CAPTURED: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

    struct Capture;

    impl Log for Capture {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.target() == "mqtt"
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                CAPTURED
                    .lock()
                    .unwrap()
                    .push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: Capture = Capture;

    pub(super) fn install() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Trace);
    }

    pub(super) fn captured() -> Vec<(Level, String)> {
        CAPTURED.lock().unwrap().clone()
    }
}

#[cfg(feature = "log")]
#[test]
fn engine_logs_can_be_forwarded() {
    forwarded_logs::install();
    let client = client(ClientOptions::builder().client_id("logger-test").build());
    client.forward_engine_logs();
    assert!(client.has_handler(EventKind::Log));

    client.connect("localhost", 1883).unwrap();
    client.run_loop(Duration::from_millis(10), 1).unwrap();

    let captured = forwarded_logs::captured();
    assert!(captured.contains(&(
        log::Level::Debug,
        "Client logger-test sending CONNECT".to_string()
    )));
    assert!(captured.contains(&(
        log::Level::Debug,
        "Client logger-test received CONNACK (0)".to_string()
    )));
}
