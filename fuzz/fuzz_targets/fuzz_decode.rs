#![no_main]
use libfuzzer_sys::fuzz_target;
use sterne::{decode, encode};

fuzz_target!(|data: &[u8]| {
    // Verify this call doesn't panic, whatever the bytes are.
    let Ok(value) = decode::value(data) else {
        return;
    };

    // An accepted frame must re-encode to a stable canonical form.
    let canonical = encode::value(&value);
    let reread = decode::value(&canonical).expect("canonical encoding must decode");
    assert_eq!(encode::value(&reread), canonical);
});
