//! Fuzz target for snapshot import.
//!
//! Covers zstd detection, decoding, and slot parsing. A failed import must
//! leave the store exactly as it was.

#![no_main]

use libfuzzer_sys::fuzz_target;
use realm_replica::value::fields;
use realm_replica::{PostcardCodec, Store, Value};

fuzz_target!(|data: &[u8]| {
    let mut store = Store::new("fuzz");
    let _ = store.add_entity("players", "p1", fields([("hp", Value::Int(1))]));
    let before = store.snapshot_value();

    if store.import_snapshot(&PostcardCodec, data).is_err() {
        assert_eq!(store.snapshot_value(), before);
    }
});
