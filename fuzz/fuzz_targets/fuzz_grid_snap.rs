//! Fuzz target for grid snapping and neighborhoods.
//!
//! Extreme and non-finite coordinates must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use realm_replica::{Position, RealmCoord};

fuzz_target!(|input: (f64, f64, f64, u32, u8)| {
    let (x, y, z, size, radius) = input;
    if size == 0 {
        return;
    }
    let cell = RealmCoord::containing(Position::new(x, y, z), size);
    let cells = cell.neighborhood(u32::from(radius % 4));
    for other in &cells {
        let _ = cell.is_near(other, u32::from(radius % 4));
    }
});
