//! Tests for the safe value encoder: round-trips, bounds, sentinels.

use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tideflow::engine::value::{
    self, CYCLE_SENTINEL, DEFAULT_MAX_LEN, EncodeLimits, SafeValue, encode, encode_as,
    encode_with,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    symbol: String,
    amount: f64,
    tags: Vec<String>,
}

fn sample_order() -> Order {
    Order {
        id: 42,
        symbol: "BTC-EUR".to_string(),
        amount: 0.5,
        tags: vec!["limit".to_string(), "post-only".to_string()],
    }
}

// --- Round trips ---

#[test]
fn scalars_round_trip() {
    assert_eq!(value::decode::<bool>(&encode(&true)).unwrap(), true);
    assert_eq!(value::decode::<i64>(&encode(&-7i64)).unwrap(), -7);
    assert_eq!(value::decode::<u64>(&encode(&7u64)).unwrap(), 7);
    assert_eq!(value::decode::<f64>(&encode(&1.25f64)).unwrap(), 1.25);
    assert_eq!(
        value::decode::<String>(&encode(&"hello".to_string())).unwrap(),
        "hello"
    );
    assert_eq!(value::decode::<Option<i64>>(&SafeValue::Null).unwrap(), None);
}

#[test]
fn struct_round_trips() {
    let order = sample_order();
    let encoded = encode(&order);
    let decoded: Order = value::decode(&encoded).unwrap();
    assert_eq!(decoded, order);
}

#[test]
fn map_round_trips_as_mapping() {
    let mut m = HashMap::new();
    m.insert("a".to_string(), 1i64);
    m.insert("b".to_string(), 2i64);

    let encoded = encode(&m);
    assert!(matches!(encoded, SafeValue::Map(_)));
    let decoded: HashMap<String, i64> = value::decode(&encoded).unwrap();
    assert_eq!(decoded, m);
}

#[test]
fn sequence_round_trips() {
    let v = vec![1i64, 2, 3];
    let decoded: Vec<i64> = value::decode(&encode(&v)).unwrap();
    assert_eq!(decoded, v);
}

#[test]
fn timestamp_round_trips() {
    let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
    let decoded: chrono::DateTime<Utc> = value::decode(&encode(&ts)).unwrap();
    assert_eq!(decoded, ts);

    // The typed variant decodes identically.
    let typed = SafeValue::from(ts);
    let decoded: chrono::DateTime<Utc> = value::decode(&typed).unwrap();
    assert_eq!(decoded, ts);
}

#[test]
fn uuid_round_trips() {
    let id = Uuid::new_v4();
    let typed = SafeValue::from(id);
    let decoded: Uuid = value::decode(&typed).unwrap();
    assert_eq!(decoded, id);
}

#[test]
fn duration_round_trips() {
    let d = std::time::Duration::from_millis(1500);
    let typed = SafeValue::from(d);
    let decoded: std::time::Duration = value::decode(&typed).unwrap();
    assert_eq!(decoded, d);
}

#[test]
fn nested_structures_round_trip() {
    let mut nested: BTreeMap<String, Vec<Order>> = BTreeMap::new();
    nested.insert("orders".to_string(), vec![sample_order(), sample_order()]);
    let decoded: BTreeMap<String, Vec<Order>> = value::decode(&encode(&nested)).unwrap();
    assert_eq!(decoded, nested);
}

// --- Type hints ---

#[test]
fn encode_as_records_type_hint() {
    let encoded = encode_as(&sample_order());
    match &encoded {
        SafeValue::Record {
            type_hint: Some(hint),
            ..
        } => assert!(hint.contains("Order")),
        other => panic!("expected a type-hinted record, got {:?}", other),
    }

    // Records still decode by field-name lookup.
    let decoded: Order = value::decode(&encoded).unwrap();
    assert_eq!(decoded, sample_order());
}

#[test]
fn scalars_pass_through_encode_as() {
    assert_eq!(encode_as(&5i64), SafeValue::Int(5));
}

// --- Bounds and sentinels ---

#[test]
fn depth_bound_substitutes_cycle_sentinel() {
    // Build a JSON chain far deeper than the bound.
    let mut v = serde_json::json!(1);
    for _ in 0..300 {
        v = serde_json::json!({ "next": v });
    }

    let encoded = encode(&v);
    let rendered = serde_json::to_string(&encoded).unwrap();
    assert!(rendered.contains(CYCLE_SENTINEL));
}

#[test]
fn shallow_depth_limit_applies() {
    let v = serde_json::json!({ "a": { "b": { "c": 1 } } });
    let encoded = encode_with(
        &v,
        EncodeLimits {
            max_depth: 2,
            max_len: DEFAULT_MAX_LEN,
        },
    );
    let rendered = serde_json::to_string(&encoded).unwrap();
    assert!(rendered.contains(CYCLE_SENTINEL));
}

#[test]
fn long_sequences_truncate_with_overflow_sentinel() {
    let v: Vec<i64> = (0..80).collect();
    let encoded = encode(&v);

    match encoded {
        SafeValue::Seq(items) => {
            // 50 kept plus the overflow marker.
            assert_eq!(items.len(), DEFAULT_MAX_LEN + 1);
            match items.last().unwrap() {
                SafeValue::Opaque(s) => assert_eq!(s, "[overflow:30]"),
                other => panic!("expected overflow sentinel, got {:?}", other),
            }
        }
        other => panic!("expected a sequence, got {:?}", other),
    }
}

#[test]
fn large_maps_record_dropped_count() {
    let mut m = BTreeMap::new();
    for i in 0..60 {
        m.insert(format!("k{:03}", i), i);
    }
    let encoded = encode(&m);
    match encoded {
        SafeValue::Map(fields) => {
            assert_eq!(fields.get("[overflow]"), Some(&SafeValue::UInt(10)));
        }
        other => panic!("expected a mapping, got {:?}", other),
    }
}

// --- Failure behavior ---

#[test]
fn decode_mismatch_is_an_error_not_a_panic() {
    let encoded = encode(&"not a number".to_string());
    let result = value::decode::<i64>(&encoded);
    assert!(result.is_err());
    let msg = result.unwrap_err().to_string();
    assert!(msg.contains("i64"));
}

#[test]
fn opaque_values_decode_as_strings() {
    let opaque = SafeValue::Opaque("[unencodable:thread handle]".to_string());
    let s: String = value::decode(&opaque).unwrap();
    assert!(s.contains("unencodable"));
}

#[test]
fn summary_is_compact() {
    assert_eq!(SafeValue::Int(3).summary(), "3");
    assert_eq!(SafeValue::Seq(vec![SafeValue::Null; 4]).summary(), "[4 items]");
}
