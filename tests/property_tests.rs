//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;
use realm_replica::codec::{maybe_compress, maybe_decompress};
use realm_replica::store::Topic;
use realm_replica::value::fields;
use realm_replica::{Message, PostcardCodec, Position, RealmCoord, Store, StoreEvent, Value};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-z]{0,12}".prop_map(Value::Str),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

fn seeded_store() -> Store {
    let mut store = Store::new("prop");
    store
        .add_entity("players", "p1", fields([("hp", Value::Int(0))]))
        .unwrap();
    store
}

// =============================================================================
// Arbitration Properties
// =============================================================================

proptest! {
    /// The surviving epoch is the maximum ever offered, and among writes at
    /// that epoch the first one wins.
    #[test]
    fn arbitration_keeps_first_write_at_max_epoch(
        writes in proptest::collection::vec((0u64..20, any::<i64>()), 1..40)
    ) {
        let mut store = seeded_store();
        for (epoch, value) in &writes {
            store
                .apply_client_write("players", "p1", "hp", *epoch, Value::Int(*value))
                .unwrap();
        }

        let max = writes.iter().map(|(e, _)| *e).max().unwrap();
        let record = store.entity("p1").unwrap();
        prop_assert_eq!(record.epoch("hp"), max);

        if max > 0 {
            let first = writes.iter().find(|(e, _)| *e == max).unwrap().1;
            prop_assert_eq!(record.value("hp"), Some(&Value::Int(first)));
        } else {
            prop_assert_eq!(record.value("hp"), Some(&Value::Int(0)));
        }
    }

    /// Epochs never decrease under client writes.
    #[test]
    fn arbitration_epoch_monotonic(
        writes in proptest::collection::vec((0u64..50, value_strategy()), 1..40)
    ) {
        let mut store = seeded_store();
        let mut last = 0;
        for (epoch, value) in writes {
            store.apply_client_write("players", "p1", "hp", epoch, value).unwrap();
            let now = store.entity("p1").unwrap().epoch("hp");
            prop_assert!(now >= last);
            last = now;
        }
    }

    /// Re-applying an authoritative write is a no-op that emits nothing.
    #[test]
    fn authoritative_write_idempotent(epoch in 0u64..1000, value in value_strategy()) {
        let mut store = seeded_store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(
            Topic::Set { collection: "players".to_string(), entity: "p1".to_string() },
            tx,
        );

        store
            .apply_authoritative_write("players", "p1", "hp", epoch, value.clone())
            .unwrap();
        let second = store
            .apply_authoritative_write("players", "p1", "hp", epoch, value.clone())
            .unwrap();

        let initial_pair = epoch == 0 && value == Value::Int(0);
        let mut events = 0;
        while let Ok(event) = rx.try_recv() {
            prop_assert!(matches!(event, StoreEvent::Updated { .. }), "expected StoreEvent::Updated");
            events += 1;
        }
        prop_assert!(second.is_none());
        prop_assert_eq!(events, if initial_pair { 0 } else { 1 });
    }
}

// =============================================================================
// Snapshot Properties
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Add(String, String),
    Remove(String, String),
    Set(String, String, u64, Value),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let collection = prop_oneof![Just("players".to_string()), Just("items".to_string())];
    let entity = "[a-d]";
    prop_oneof![
        (collection.clone(), entity).prop_map(|(c, e)| Op::Add(c, e)),
        (collection.clone(), entity).prop_map(|(c, e)| Op::Remove(c, e)),
        (collection, entity, 0u64..10, value_strategy())
            .prop_map(|(c, e, epoch, v)| Op::Set(c, e, epoch, v)),
    ]
}

fn apply_ops(ops: &[Op]) -> Store {
    let mut store = Store::new("prop");
    for op in ops {
        // Entity ids are scoped per collection so no record has two owners.
        // Failures (unknown entity or collection) leave the store unchanged.
        let _ = match op {
            Op::Add(c, e) => store.add_entity(c, &format!("{c}.{e}"), fields([("n", Value::Int(1))])),
            Op::Remove(c, e) => store.remove_entity(c, &format!("{c}.{e}")),
            Op::Set(c, e, epoch, v) => store
                .apply_client_write(c, &format!("{c}.{e}"), "n", *epoch, v.clone())
                .map(|_| ()),
        };
    }
    store
}

proptest! {
    /// Any reachable store survives export then import.
    #[test]
    fn snapshot_round_trip(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let store = apply_ops(&ops);
        let bytes = store.export_snapshot(&PostcardCodec).unwrap();

        let mut copy = Store::new("copy");
        copy.import_snapshot(&PostcardCodec, &bytes).unwrap();
        prop_assert_eq!(copy.snapshot_value(), store.snapshot_value());
    }

    /// Compressed snapshots import to the same state.
    #[test]
    fn compressed_snapshot_round_trip(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let store = apply_ops(&ops);
        let bytes = store.export_compressed(&PostcardCodec, 0, 3).unwrap();

        let mut copy = Store::new("copy");
        copy.import_snapshot(&PostcardCodec, &bytes).unwrap();
        prop_assert_eq!(copy.snapshot_value(), store.snapshot_value());
    }

    /// Collection members always name existing entity records.
    #[test]
    fn no_dangling_members(ops in proptest::collection::vec(op_strategy(), 0..60)) {
        let store = apply_ops(&ops);
        prop_assert!(store.dangling_members().is_empty());
    }

    /// Decompression never panics on arbitrary bytes.
    #[test]
    fn decompress_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = maybe_decompress(&data);
    }

    /// Data below the threshold passes through unchanged.
    #[test]
    fn compress_below_threshold_is_identity(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let out = maybe_compress(data.clone(), 1024, 3).unwrap();
        prop_assert_eq!(out, data);
    }

    /// Message decoding never panics on arbitrary bytes.
    #[test]
    fn message_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(&PostcardCodec, &data);
    }
}

// =============================================================================
// Grid Properties
// =============================================================================

proptest! {
    /// A position lies inside the cell it snaps to.
    #[test]
    fn snap_contains_position(
        xi in -1_000_000i64..1_000_000,
        zi in -1_000_000i64..1_000_000,
        frac in 0.0f64..0.99,
        size in 1u32..512,
    ) {
        let cell = RealmCoord::containing(
            Position::new(xi as f64 + frac, 0.0, zi as f64 + frac),
            size,
        );
        let size = i64::from(size);
        prop_assert!(cell.x <= xi && xi < cell.x + size);
        prop_assert!(cell.z <= zi && zi < cell.z + size);
        prop_assert_eq!(cell.x.rem_euclid(size), 0);
        prop_assert_eq!(cell.z.rem_euclid(size), 0);
    }

    /// Snapping is idempotent.
    #[test]
    fn snap_idempotent(x in -1.0e6f64..1.0e6, z in -1.0e6f64..1.0e6, size in 1u32..512) {
        let cell = RealmCoord::containing(Position::new(x, 0.0, z), size);
        let again = RealmCoord::containing(
            Position::new(cell.x as f64, cell.y as f64, cell.z as f64),
            size,
        );
        prop_assert_eq!(cell, again);
    }

    /// A neighborhood has (2r+1)² distinct cells, all near the center.
    #[test]
    fn neighborhood_shape(
        i in -1000i64..1000,
        k in -1000i64..1000,
        size in 1u32..64,
        radius in 0u32..4,
    ) {
        let center = RealmCoord { x: i * i64::from(size), y: 0, z: k * i64::from(size), size };
        let cells = center.neighborhood(radius);
        let side = 2 * radius as usize + 1;
        prop_assert_eq!(cells.len(), side * side);

        let unique: BTreeSet<_> = cells.iter().copied().collect();
        prop_assert_eq!(unique.len(), cells.len());
        prop_assert!(unique.contains(&center));
        for cell in &cells {
            prop_assert!(center.is_near(cell, radius));
            prop_assert_eq!(cell.y, center.y);
        }
    }
}
