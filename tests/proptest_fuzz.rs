//! Property-based tests for the snapshot codec.
//!
//! Generates random field values and random byte strings and checks that
//! encoding round-trips, is deterministic, and that decoding garbage only
//! ever returns clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use proptest::prelude::*;

use tiered_orm::codec::{self, Value};
use tiered_orm::schema::{EnumDefinition, FieldDescriptor, FieldLayout};

// =============================================================================
// Layout under test
// =============================================================================

fn layout() -> FieldLayout {
    let mut enums = HashMap::new();
    enums.insert(
        "color".to_string(),
        Arc::new(EnumDefinition::new("color", &["red", "green", "blue"]).unwrap()),
    );
    let descriptors = vec![
        FieldDescriptor::uint("Age").bits(16),
        FieldDescriptor::uint("Score").nullable(),
        FieldDescriptor::int("Balance"),
        FieldDescriptor::boolean("Active"),
        FieldDescriptor::float("Price", 2),
        FieldDescriptor::text("Name"),
        FieldDescriptor::bytes("Blob"),
        FieldDescriptor::enumeration("Color", "color"),
        FieldDescriptor::set("Tags", "color"),
        FieldDescriptor::date("Born").nullable(),
        FieldDescriptor::reference("Owner", "User"),
        FieldDescriptor::references("Friends", "User"),
        FieldDescriptor::structure(
            "Address",
            vec![FieldDescriptor::text("City"), FieldDescriptor::uint("Zip").bits(32)],
        ),
    ];
    FieldLayout::build(&descriptors, "", &enums).unwrap()
}

// =============================================================================
// Strategies
// =============================================================================

fn color() -> impl Strategy<Value = String> {
    prop_oneof![Just("red"), Just("green"), Just("blue")].prop_map(str::to_string)
}

fn date() -> impl Strategy<Value = Option<NaiveDate>> {
    prop::option::of((1971i32..2100, 1u32..13, 1u32..29).prop_map(|(y, m, d)| {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }))
}

fn raw_values() -> impl Strategy<Value = Vec<Value>> {
    (
        (0u64..65536, prop::option::of(any::<u64>()), any::<i64>(), any::<bool>()),
        (-1.0e9f64..1.0e9, ".{0,40}", prop::collection::vec(any::<u8>(), 0..64)),
        (prop::option::of(color()), prop::collection::vec(color(), 0..4), date()),
        (any::<u64>(), prop::collection::vec(1u64..1_000_000, 0..8)),
        ("[a-zA-Z ]{0,20}", any::<u32>()),
    )
        .prop_map(|((age, score, balance, active), (price, name, blob), (color, tags, born), (owner, friends), (city, zip))| {
            vec![
                Value::Uint(age),
                score.map(Value::Uint).unwrap_or(Value::Null),
                Value::Int(balance),
                Value::Bool(active),
                Value::Float(price),
                Value::Text(name),
                Value::Bytes(blob),
                color.map(Value::Enum).unwrap_or(Value::Null),
                Value::Set(tags),
                born.map(Value::Date).unwrap_or(Value::Null),
                Value::Reference(owner),
                Value::References(friends),
                Value::Struct(vec![Value::Text(city), Value::Uint(zip as u64)]),
            ]
        })
}

fn normalized(layout: &FieldLayout, raw: Vec<Value>) -> Vec<Value> {
    layout
        .fields()
        .iter()
        .zip(raw)
        .map(|(field, value)| codec::normalize(field, value).unwrap())
        .collect()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn round_trip_preserves_every_field(raw in raw_values()) {
        let layout = layout();
        let values = normalized(&layout, raw);
        let bytes = codec::encode(&layout, &values).unwrap();
        let decoded = codec::decode(&layout, &bytes).unwrap();
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn encoding_is_deterministic(raw in raw_values()) {
        let layout = layout();
        let values = normalized(&layout, raw);
        let first = codec::encode(&layout, &values).unwrap();
        let second = codec::encode(&layout, &values.clone()).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn identical_states_diff_empty(raw in raw_values()) {
        let layout = layout();
        let values = normalized(&layout, raw);
        let (old, new) = codec::diff(&layout, &values, &values, 0).unwrap();
        prop_assert!(old.is_empty());
        prop_assert!(new.is_empty());
    }

    #[test]
    fn single_field_decode_matches_full_decode(raw in raw_values(), index in 0usize..13) {
        let layout = layout();
        let values = normalized(&layout, raw);
        let bytes = codec::encode(&layout, &values).unwrap();
        prop_assert_eq!(codec::decode_field(&layout, &bytes, index).unwrap(), values[index].clone());
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let layout = layout();
        let _ = codec::decode(&layout, &bytes);
    }

    #[test]
    fn decode_never_panics_on_truncated_snapshot(raw in raw_values(), cut in 0usize..512) {
        let layout = layout();
        let values = normalized(&layout, raw);
        let bytes = codec::encode(&layout, &values).unwrap();
        let cut = cut.min(bytes.len());
        let result = codec::decode(&layout, &bytes[..cut]);
        if cut < bytes.len() {
            prop_assert!(result.is_err());
        }
    }
}
