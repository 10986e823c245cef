use log::info;
use std::env;
use sterne::aio::NetConnector;
use sterne::{Binding, Subscriber};

fn main() {
    simple_logger::init_with_level(log::Level::Debug).unwrap();
    let broker = env::args().nth(1).unwrap_or(String::from("localhost:4222"));

    let mut subscriber = Subscriber::new();
    subscriber
        .subscribe(
            Binding::builder()
                .topic(format!("nats://{broker}/nova.parsed"))
                .build(),
            |payload| Ok(payload),
            |payload| async move {
                info!("received {payload:?}");
                Ok(())
            },
        )
        .expect("Failed to register the subscription.");

    smol::block_on(subscriber.run(NetConnector::new())).expect("The pipeline stopped.");
}
