#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use squall::proxy;

fuzz_target!(|data: &[u8]| {
    let fallback = "198.51.100.1:40000".parse().unwrap();
    let datagram = Bytes::copy_from_slice(data);

    // Stripping should not panic on any input, and must leave the input
    // untouched.
    let before = datagram.clone();
    let stripped = proxy::strip(&datagram, fallback);
    assert_eq!(datagram, before);

    // The payload is always a suffix of the input.
    assert!(stripped.payload.len() <= datagram.len());
});
