#![cfg(feature = "async")]
mod env;

use crate::env::broker::Broker;
use crate::env::{frame, payload, until};
use macro_rules_attribute::apply;
use pretty_assertions::assert_eq;
use smol_macros::test;
use sterne::{encode, Binding, HandlerError, Payload, RunError, Subscriber, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

// Records every payload the pipeline hands to the handler.
#[derive(Clone, Default)]
struct Recorder {
    records: Arc<Mutex<Vec<Payload>>>,
}

impl Recorder {
    fn handler(&self) -> impl FnMut(Payload) -> HandlerFuture + Send + 'static {
        let records = self.records.clone();
        move |payload| {
            let records = records.clone();
            Box::pin(async move {
                records.lock().unwrap().push(payload);
                Ok(())
            })
        }
    }

    fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Payload> {
        self.records.lock().unwrap().clone()
    }
}

// Deliver a single-subject frame end to end: the handler must observe the
// decoded payload exactly once, after the subscription was flushed.
#[apply(test!)]
async fn test_single_source_passthrough() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    assert_eq!(broker.servers(), vec!["nats://localhost:4222".to_string()]);
    assert_eq!(broker.subjects(), vec!["foo".to_string()]);

    broker.publish("foo", frame(&[("a", Value::Int(7))])).await;
    until(|| recorder.count() == 1).await;

    assert_eq!(recorder.snapshot(), vec![payload(&[("a", Value::Int(7))])]);
}

// Two sources joined on msg_uuid: one merged payload, fields overlaid in
// source-declaration order with the later source winning conflicts.
#[apply(test!)]
async fn test_two_source_join() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("raw", ["nats://localhost:4222/raw"])
                .source("enriched", ["nats://localhost:4222/enriched"])
                .key("msg_uuid")
                .build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;
    assert_eq!(broker.subjects(), vec!["raw".to_string(), "enriched".to_string()]);

    broker
        .publish(
            "raw",
            frame(&[
                ("msg_uuid", Value::from("1")),
                ("x", Value::Int(1)),
                ("over", Value::from("raw")),
            ]),
        )
        .await;
    broker
        .publish(
            "enriched",
            frame(&[
                ("msg_uuid", Value::from("1")),
                ("over", Value::from("enriched")),
                ("y", Value::Int(2)),
            ]),
        )
        .await;
    until(|| recorder.count() == 1).await;

    assert_eq!(
        recorder.snapshot(),
        vec![payload(&[
            ("msg_uuid", Value::from("1")),
            ("x", Value::Int(1)),
            ("over", Value::from("enriched")),
            ("y", Value::Int(2)),
        ])]
    );

    // No second emission sneaks in afterwards.
    smol::Timer::after(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);
}

// A frame whose top level is not a map is dropped; the pipeline keeps
// accepting messages.
#[apply(test!)]
async fn test_poisoned_frame_is_isolated() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    let poison = encode::value(&Value::Array(vec![Value::Int(1), Value::Int(2)]));
    broker.publish("foo", poison).await;
    broker.publish("foo", frame(&[("a", Value::Int(7))])).await;
    until(|| recorder.count() == 1).await;

    assert_eq!(recorder.snapshot(), vec![payload(&[("a", Value::Int(7))])]);
}

// A re-delivered fragment replaces its predecessor instead of producing a
// second emission; the merge carries the replacement.
#[apply(test!)]
async fn test_duplicate_fragment_does_not_duplicate_emit() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("raw", ["nats://localhost:4222/raw"])
                .source("enriched", ["nats://localhost:4222/enriched"])
                .key("msg_uuid")
                .build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    for x in [1, 10] {
        broker
            .publish(
                "raw",
                frame(&[("msg_uuid", Value::from("1")), ("x", Value::Int(x))]),
            )
            .await;
    }
    broker
        .publish(
            "enriched",
            frame(&[("msg_uuid", Value::from("1")), ("y", Value::Int(2))]),
        )
        .await;
    until(|| recorder.count() == 1).await;

    assert_eq!(recorder.snapshot()[0].get("x"), Some(&Value::Int(10)));

    smol::Timer::after(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);
}

// An incomplete join older than max_age is gone; its late half starts a
// fresh entry instead of completing.
#[apply(test!)]
async fn test_partial_join_evicted() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("raw", ["nats://localhost:4222/raw"])
                .source("enriched", ["nats://localhost:4222/enriched"])
                .key("msg_uuid")
                .max_age(Some(Duration::from_millis(200)))
                .build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    broker
        .publish("raw", frame(&[("msg_uuid", Value::from("1"))]))
        .await;
    smol::Timer::after(Duration::from_millis(500)).await;

    // This push evicts the stale "1" entry...
    broker
        .publish("raw", frame(&[("msg_uuid", Value::from("2"))]))
        .await;
    // ...so the late enriched half of "1" cannot complete anything.
    broker
        .publish("enriched", frame(&[("msg_uuid", Value::from("1"))]))
        .await;
    // Key "2" still completes normally.
    broker
        .publish("enriched", frame(&[("msg_uuid", Value::from("2"))]))
        .await;
    until(|| recorder.count() == 1).await;

    assert_eq!(
        recorder.snapshot()[0].get("msg_uuid"),
        Some(&Value::from("2"))
    );
}

// A fragment without the join key is dropped without poisoning the join.
#[apply(test!)]
async fn test_missing_join_key_drops_fragment() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("raw", ["nats://localhost:4222/raw"])
                .source("enriched", ["nats://localhost:4222/enriched"])
                .key("msg_uuid")
                .build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    broker.publish("raw", frame(&[("x", Value::Int(9))])).await;
    broker
        .publish("raw", frame(&[("msg_uuid", Value::from("1"))]))
        .await;
    broker
        .publish("enriched", frame(&[("msg_uuid", Value::from("1"))]))
        .await;
    until(|| recorder.count() == 1).await;

    assert_eq!(recorder.snapshot()[0].get("x"), None);
}

// Scenario: topics spanning two servers must fail before any connection is
// opened.
#[apply(test!)]
async fn test_multi_endpoint_rejected_without_connecting() {
    let broker = Broker::new();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("source", ["nats://a:4222/s", "nats://b:4222/s"])
                .key("msg_uuid")
                .build(),
            |payload| Ok(payload),
            Recorder::default().handler(),
        )
        .unwrap();

    let result = subscriber.run(broker.clone()).await;
    assert!(matches!(result, Err(RunError::MultipleEndpoints(..))));
    assert_eq!(broker.servers(), Vec::<String>::new());
}

#[apply(test!)]
async fn test_connect_failure_propagates() {
    let broker = Broker::refusing_connections();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            Recorder::default().handler(),
        )
        .unwrap();

    let result = subscriber.run(broker).await;
    assert!(matches!(result, Err(RunError::Connect(..))));
}

#[apply(test!)]
async fn test_connection_loss_ends_the_run() {
    let broker = Broker::new();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            Recorder::default().handler(),
        )
        .unwrap();

    let task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    broker.close();
    let result = task.await;
    assert!(matches!(result, Err(RunError::ConnectionClosed)));
}

// A validator rejection drops the message; later messages still flow.
#[apply(test!)]
async fn test_validator_rejection_is_isolated() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload: Payload| {
                if payload.get("a").is_none() {
                    return Err("field \"a\" is required".into());
                }
                Ok(payload)
            },
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    broker.publish("foo", frame(&[("b", Value::Int(1))])).await;
    broker.publish("foo", frame(&[("a", Value::Int(7))])).await;
    until(|| recorder.count() == 1).await;

    assert_eq!(recorder.snapshot(), vec![payload(&[("a", Value::Int(7))])]);
}

// A failing handler is logged and swallowed; the pipeline keeps delivering.
#[apply(test!)]
async fn test_handler_failure_is_isolated() {
    let broker = Broker::new();
    let seen = Arc::new(Mutex::new(Vec::<Payload>::new()));

    let mut subscriber = Subscriber::new();
    let records = seen.clone();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            move |payload: Payload| {
                let records = records.clone();
                Box::pin(async move {
                    let boom = payload.get("boom").is_some();
                    records.lock().unwrap().push(payload);
                    if boom {
                        return Err("handler exploded".into());
                    }
                    Ok(())
                }) as HandlerFuture
            },
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    broker.publish("foo", frame(&[("boom", Value::Int(1))])).await;
    broker.publish("foo", frame(&[("a", Value::Int(7))])).await;
    until(|| seen.lock().unwrap().len() == 2).await;
}

// Frames on one subject reach the handler in delivery order.
#[apply(test!)]
async fn test_frames_are_handled_in_order() {
    let broker = Broker::new();
    let recorder = Recorder::default();

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload| Ok(payload),
            recorder.handler(),
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    for n in 0..5 {
        broker.publish("foo", frame(&[("n", Value::Int(n))])).await;
    }
    until(|| recorder.count() == 5).await;

    let expected: Vec<Payload> = (0..5).map(|n| payload(&[("n", Value::Int(n))])).collect();
    assert_eq!(recorder.snapshot(), expected);
}

// Drive the async client against a scripted NATS server on a real socket:
// handshake, subscribe, flush, one delivery.
#[apply(test!)]
async fn test_client_against_scripted_server() {
    use futures_lite::{AsyncReadExt, AsyncWriteExt, StreamExt};
    use sterne::aio::Client;
    use sterne::Connection;

    let listener = async_net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let expected = frame(&[("a", Value::Int(7))]);
    let served = expected.clone();
    let _server = smol::spawn(async move {
        let mut stream = listener.incoming().next().await.unwrap().unwrap();
        stream
            .write_all(b"INFO {\"max_payload\":1048576}\r\n")
            .await
            .unwrap();

        // Collect CONNECT, SUB and PING, in whatever chunks they arrive.
        let mut received = Vec::new();
        let mut buffer = [0u8; 1024];
        while !received.windows(6).any(|window| window == b"PING\r\n") {
            let count = stream.read(&mut buffer).await.unwrap();
            assert!(count > 0, "client closed the connection early");
            received.extend_from_slice(&buffer[..count]);
        }
        let text = String::from_utf8_lossy(&received).into_owned();
        assert!(text.contains("CONNECT {"), "missing CONNECT in {text:?}");
        assert!(
            text.contains("SUB nova.parsed 1\r\n"),
            "missing SUB in {text:?}"
        );

        stream.write_all(b"PONG\r\n").await.unwrap();

        let header = format!("MSG nova.parsed 1 {}\r\n", served.len());
        stream.write_all(header.as_bytes()).await.unwrap();
        stream.write_all(&served).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();

        // Keep the connection open until the test ends.
        std::future::pending::<()>().await;
    });

    let stream = async_net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (mut handle, task) = Client::new(stream).spawn();
    let _task = smol::spawn(task);

    let (sink, deliveries) = async_channel::bounded(10);
    handle.subscribe("nova.parsed", sink).await.unwrap();
    handle.flush().await.unwrap();

    let message = deliveries.recv().await.unwrap();
    assert_eq!(message.subject, "nova.parsed");
    assert_eq!(message.payload, expected);
    assert_eq!(
        sterne::payload::from_bytes(&message.payload).unwrap(),
        payload(&[("a", Value::Int(7))])
    );
}

// A handler that suspends is awaited before the next delivery is handled.
#[apply(test!)]
async fn test_suspending_handler_is_awaited() {
    let broker = Broker::new();
    let records = Arc::new(Mutex::new(Vec::<i64>::new()));

    let mut subscriber = Subscriber::new();
    let seen = records.clone();
    subscriber
        .subscribe(
            Binding::builder().topic("nats://localhost:4222/foo").build(),
            |payload: Payload| {
                payload
                    .get("n")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| "field \"n\" is required".into())
            },
            move |n| {
                let seen = seen.clone();
                Box::pin(async move {
                    smol::Timer::after(Duration::from_millis(10)).await;
                    seen.lock().unwrap().push(n);
                    Ok(())
                }) as HandlerFuture
            },
        )
        .unwrap();

    let _task = smol::spawn(subscriber.run(broker.clone()));
    until(|| broker.flushes() == 1).await;

    for n in 0..3 {
        broker.publish("foo", frame(&[("n", Value::Int(n))])).await;
    }
    until(|| records.lock().unwrap().len() == 3).await;

    assert_eq!(records.lock().unwrap().clone(), vec![0, 1, 2]);
}
