#![no_main]
use libfuzzer_sys::fuzz_target;
use sterne::{decode, encode, DecodingError, Value};

fuzz_target!(|value: Value| {
    let bytes = encode::value(&value);

    match decode::value(&bytes) {
        // Comparing the encodings sidesteps NaN inequality.
        Ok(decoded) => assert_eq!(encode::value(&decoded), bytes),
        // Arbitrary values may nest deeper than the decoder accepts.
        Err(DecodingError::NestingTooDeep) => {}
        Err(error) => panic!("encoded value failed to decode: {error}"),
    }
});
