//! Property-based tests for p2pcommons-meta using proptest.

use p2pcommons_meta::{
    codec,
    normalize::{flatten, unflatten},
    url,
    validate::{is_unique, validate_authors, validate_follows, ValidationContext},
    ContentFields, HyperKey, Links, ModuleKind, ModuleRecord, ProfileFields, StorageEnvelope,
    ValidationCode,
};
use proptest::prelude::*;
use serde_json::json;

fn any_key() -> impl Strategy<Value = HyperKey> {
    any::<[u8; 32]>().prop_map(HyperKey::from_bytes)
}

fn versioned(key: HyperKey, version: Option<u64>) -> String {
    match version {
        Some(v) => format!("{}+{}", key.to_hex(), v),
        None => key.to_hex(),
    }
}

fn any_main() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "([a-z]{1,8}/)?[a-z]{1,8}\\.md"]
}

fn any_kind() -> impl Strategy<Value = ModuleKind> {
    let content = (
        "[A-Za-z0-9]{0,8}",
        any_main(),
        proptest::collection::vec(any_key(), 0..4),
        proptest::collection::vec((any_key(), 0u64..1000), 0..4),
    )
        .prop_map(|(subtype, main, authors, parents)| {
            ModuleKind::Content(ContentFields {
                subtype,
                main,
                authors: authors.iter().map(HyperKey::to_hex).collect(),
                parents: parents.into_iter().map(|(k, v)| versioned(k, Some(v))).collect(),
            })
        });
    let profile = (
        "[A-Za-z0-9]{0,8}",
        any_main(),
        prop_oneof![Just(String::new()), "[a-z]{1,8}\\.png"],
        proptest::collection::vec((any_key(), proptest::option::of(0u64..1000)), 0..4),
        proptest::collection::vec((any_key(), proptest::option::of(0u64..1000)), 0..4),
    )
        .prop_map(|(subtype, main, avatar, follows, contents)| {
            ModuleKind::Profile(ProfileFields {
                subtype,
                main,
                avatar,
                follows: follows.into_iter().map(|(k, v)| versioned(k, v)).collect(),
                contents: contents.into_iter().map(|(k, v)| versioned(k, v)).collect(),
            })
        });
    prop_oneof![content, profile]
}

fn any_record() -> impl Strategy<Value = ModuleRecord> {
    (any_key(), "[A-Za-z][A-Za-z0-9 ]{0,60}", ".{0,80}", any_kind()).prop_map(
        |(key, title, description, p2pcommons)| ModuleRecord {
            title,
            description,
            url: key.to_url(),
            links: Links::default(),
            p2pcommons,
        },
    )
}

fn any_envelope() -> impl Strategy<Value = StorageEnvelope> {
    (any_record(), any::<bool>(), any::<u64>(), 0i64..4_000_000_000_000).prop_map(
        |(record, is_writable, version, ms)| {
            let mut env = StorageEnvelope::new(record, is_writable, version);
            env.last_modified = codec::date_from_wire(ms);
            env
        },
    )
}

proptest! {
    /// flatten(unflatten(m)) == flatten(m) and unflatten(flatten(m)) == unflatten(m)
    #[test]
    fn test_normalize_idempotent(record in any_record()) {
        let nested = serde_json::to_value(&record).unwrap();
        let flat = flatten(&nested);
        prop_assert_eq!(flatten(&unflatten(&flat)), flatten(&flat));
        prop_assert_eq!(flatten(&unflatten(&nested)), flatten(&nested));
        prop_assert_eq!(unflatten(&flatten(&nested)), unflatten(&nested));
        prop_assert_eq!(unflatten(&flatten(&flat)), unflatten(&flat));
    }

    #[test]
    fn test_codec_round_trip(env in any_envelope()) {
        let bytes = codec::encode(&env).unwrap();
        prop_assert_eq!(codec::decode(&bytes).unwrap(), env.clone());
        prop_assert_eq!(codec::encode(&env).unwrap(), bytes);
    }

    #[test]
    fn test_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn test_url_parse_is_total(input in ".{0,120}") {
        let parsed = url::parse(&input);
        if let Some(host) = parsed.host {
            prop_assert!(HyperKey::from_hex(&host).is_some());
        }
    }

    #[test]
    fn test_url_parse_recovers_key(key in any_key(), version in proptest::option::of(any::<u64>())) {
        let input = format!("hyper://{}", versioned(key, version));
        let parsed = url::parse(&input);
        prop_assert_eq!(parsed.host, Some(key.to_hex()));
        prop_assert_eq!(parsed.version, version);
    }

    /// Entries that differ only by version suffix are distinct.
    #[test]
    fn test_version_suffix_is_not_a_duplicate(key in any_key(), a in 0u64..100, b in 100u64..200) {
        let entries = vec![versioned(key, Some(a)), versioned(key, Some(b)), versioned(key, None)];
        prop_assert!(is_unique(&entries));
        let ctx = ValidationContext::new(HyperKey::from_bytes([0; 32]));
        let meta = json!({"p2pcommons": {"type": "profile", "follows": entries}});
        prop_assert!(validate_follows(&meta, &ctx).is_ok());
    }

    #[test]
    fn test_exact_duplicates_rejected(keys in proptest::collection::vec(any_key(), 1..5), dup in 0usize..5) {
        let mut authors: Vec<String> = keys.iter().map(HyperKey::to_hex).collect();
        let repeated = authors[dup % authors.len()].clone();
        authors.push(repeated);
        prop_assert!(!is_unique(&authors));
        let ctx = ValidationContext::new(HyperKey::from_bytes([0; 32]));
        let meta = json!({"p2pcommons": {"type": "content", "authors": authors}});
        let err = validate_authors(&meta, &ctx).unwrap_err();
        prop_assert_eq!(err.code, ValidationCode::AuthorsUnique);
    }
}
