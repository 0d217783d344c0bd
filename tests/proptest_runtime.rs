//! Property-based tests.
//!
//! Covers: Value JSON round-trips, window bucket arithmetic, and stage name
//! generation invariants.

use indexmap::IndexMap;
use proptest::prelude::*;
use tributary::{Topology, Value, WindowSpec};

/// Strategy for generating arbitrary JSON-representable values.
fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>()
            .prop_filter("must be finite", |f| f.is_finite())
            .prop_map(Value::Float),
        "[a-zA-Z0-9_ ]{0,32}".prop_map(Value::Str),
    ];
    leaf.prop_recursive(3, 32, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z][a-z0-9_]{0,8}", inner), 0..4).prop_map(|pairs| {
                let mut map = IndexMap::new();
                for (key, value) in pairs {
                    map.insert(key, value);
                }
                Value::Map(map)
            }),
        ]
    })
}

proptest! {
    /// JSON-shaped values survive the trip through serde_json unchanged.
    #[test]
    fn value_json_roundtrip(value in arb_value()) {
        let json = value.to_json();
        let back = Value::from_json(&json);
        prop_assert_eq!(back, value);
    }

    /// Every bucket returned for a timestamp actually contains it, is
    /// aligned to the step, and for tumbling windows there is exactly one.
    #[test]
    fn bucket_starts_contain_timestamp(
        size_s in 1i64..3600,
        step_div in 1i64..8,
        ts_ms in -1_000_000_000i64..1_000_000_000_000,
    ) {
        let size = chrono::Duration::seconds(size_s);
        let step = chrono::Duration::milliseconds((size_s * 1000) / step_div);
        prop_assume!(step > chrono::Duration::zero());
        let window = WindowSpec::sliding(size, step);

        let starts = window.bucket_starts(ts_ms);
        prop_assert!(!starts.is_empty());
        let size_ms = size.num_milliseconds();
        let step_ms = step.num_milliseconds();
        for start in &starts {
            prop_assert!(*start <= ts_ms && ts_ms < start + size_ms);
            prop_assert_eq!(start.rem_euclid(step_ms), 0);
        }
        if window.is_tumbling() {
            prop_assert_eq!(starts.len(), 1);
        }
    }

    /// Generated stage names are unique, zero-padded and sequential.
    #[test]
    fn generated_names_unique_and_formatted(count in 1usize..40) {
        let topology = Topology::new();
        let mut names = Vec::new();
        for _ in 0..count {
            let source = topology.stream(["orders"]).unwrap();
            names.push(source.name().to_string());
        }

        for (i, name) in names.iter().enumerate() {
            prop_assert_eq!(name.clone(), format!("source{i:010}"));
        }
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), names.len());
    }
}
