#![no_main]
use libfuzzer_sys::fuzz_target;
use squall::wire::{Control, HandshakeRsp};

fuzz_target!(|data: &[u8]| {
    // Decoding should not panic on any input.
    let control = Control::decode(data);
    if data.len() != 20 {
        assert!(control.is_none());
    }
    let _ = HandshakeRsp::decode(data);
});
