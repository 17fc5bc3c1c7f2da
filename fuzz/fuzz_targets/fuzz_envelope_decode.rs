//! Fuzz target for wire message decoding.
//!
//! Arbitrary bytes must decode to a message, a sibling skip, or an error.
//! Never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use realm_replica::{Message, PostcardCodec};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(message)) = Message::decode(&PostcardCodec, data) {
        // Anything that decodes must re-encode.
        let _ = message.encode(&PostcardCodec);
    }
});
