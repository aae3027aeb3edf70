//! Property tests for list merging on update.

use p2pcommons_sdk::MergePolicy;
use proptest::prelude::*;
use serde_json::Value;

fn entries() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-f0-9]{4}", 0..8)
}

fn to_value(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

proptest! {
    #[test]
    fn prop_union_keeps_current_prefix(current in entries(), incoming in entries()) {
        let merged = MergePolicy::Union.apply(Some(&to_value(&current)), &to_value(&incoming));
        let merged = merged.as_array().unwrap();
        prop_assert!(merged.len() >= current.len());
        for (i, item) in current.iter().enumerate() {
            prop_assert_eq!(merged[i].as_str(), Some(item.as_str()));
        }
        for item in &incoming {
            prop_assert!(merged.iter().any(|v| v.as_str() == Some(item.as_str())));
        }
    }

    #[test]
    fn prop_union_is_idempotent(current in entries(), incoming in entries()) {
        let once = MergePolicy::Union.apply(Some(&to_value(&current)), &to_value(&incoming));
        let twice = MergePolicy::Union.apply(Some(&once), &to_value(&incoming));
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_overwrite_takes_incoming(current in entries(), incoming in entries()) {
        let merged = MergePolicy::Overwrite.apply(Some(&to_value(&current)), &to_value(&incoming));
        prop_assert_eq!(merged, to_value(&incoming));
    }
}
