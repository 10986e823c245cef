//! Joins the raw and enriched halves of each event, correlated by
//! `msg_uuid`, and prints the merged payload.
use log::info;
use std::env;
use sterne::aio::NetConnector;
use sterne::{Binding, SchemaError, Subscriber, Value};

fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();
    let broker = env::args().nth(1).unwrap_or(String::from("localhost:4222"));

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .source("raw", [format!("nats://{broker}/nova.raw")])
                .source("enriched", [format!("nats://{broker}/nova.enriched")])
                .key("msg_uuid")
                .build(),
            |payload| {
                // A joined event must carry a position.
                match (payload.get("lat"), payload.get("lon")) {
                    (Some(Value::F64(..)), Some(Value::F64(..))) => Ok(payload),
                    _ => Err(SchemaError::new("lat/lon are required")),
                }
            },
            |payload| async move {
                info!(
                    "event {:?} at ({:?}, {:?})",
                    payload.get("msg_uuid"),
                    payload.get("lat"),
                    payload.get("lon")
                );
                Ok(())
            },
        )
        .expect("Failed to register the subscription.");

    smol::block_on(subscriber.run(NetConnector::new())).expect("The pipeline stopped.");
}
