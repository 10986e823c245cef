pub mod broker;

use bytes::Bytes;
use sterne::{encode, Payload, Value};
use std::time::Duration;

/// Build a payload map from field/value pairs.
pub fn payload(entries: &[(&str, Value)]) -> Payload {
    entries
        .iter()
        .map(|(field, value)| (field.to_string(), value.clone()))
        .collect()
}

/// Encode field/value pairs as one MessagePack frame.
pub fn frame(entries: &[(&str, Value)]) -> Bytes {
    let map = Value::Map(
        entries
            .iter()
            .map(|(field, value)| (Value::from(*field), value.clone()))
            .collect(),
    );
    Bytes::from(encode::value(&map))
}

/// Poll `condition` until it holds, or panic after one second. The running
/// pipeline is a background task; tests have nothing else to await on.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        smol::Timer::after(Duration::from_millis(1)).await;
    }
    panic!("condition not met within 1 second");
}
