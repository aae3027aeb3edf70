//! Conversion between the flat and nested metadata shapes.
//!
//! Callers and `index.json` use the flat shape; validators and the codec use
//! the nested shape with a `p2pcommons` sub-object. Untyped documents are
//! detected by shape: a `p2pcommons` object means nested, anything else is
//! treated as flat. Typed records convert explicitly via [`FlatRecord`] and
//! [`ModuleRecord`].

use serde_json::{Map, Value};

use crate::error::{ValidationCode, ValidationError};
use crate::types::{
    ContentFields, FlatRecord, ModuleKind, ModuleRecord, ModuleType, ProfileFields,
};

/// Keys that live under `p2pcommons` in the nested shape.
pub const P2PCOMMONS_KEYS: [&str; 8] = [
    "type", "subtype", "main", "avatar", "authors", "parents", "follows", "contents",
];

/// Returns true if the document carries a `p2pcommons` object.
pub fn is_nested(value: &Value) -> bool {
    matches!(value.get("p2pcommons"), Some(Value::Object(_)))
}

/// Lifts `p2pcommons.*` keys to the top level. Non-objects are returned as is.
pub fn flatten(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let Some(Value::Object(inner)) = map.get("p2pcommons") else {
        return value.clone();
    };
    let mut out: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| k.as_str() != "p2pcommons")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in inner {
        out.insert(k.clone(), v.clone());
    }
    Value::Object(out)
}

/// Moves the fixed `p2pcommons` key set into a sub-object.
///
/// Already nested documents, and documents without any of those keys, are
/// returned unchanged.
pub fn unflatten(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    if is_nested(value) {
        return value.clone();
    }
    let mut out = Map::new();
    let mut inner = Map::new();
    for (k, v) in map {
        if P2PCOMMONS_KEYS.contains(&k.as_str()) {
            inner.insert(k.clone(), v.clone());
        } else {
            out.insert(k.clone(), v.clone());
        }
    }
    if inner.is_empty() {
        return value.clone();
    }
    out.insert("p2pcommons".to_string(), Value::Object(inner));
    Value::Object(out)
}

/// Builds a typed record from a validated document of either shape.
pub fn record_from_value(value: &Value) -> Result<ModuleRecord, serde_json::Error> {
    serde_json::from_value(unflatten(value))
}

impl From<ModuleRecord> for FlatRecord {
    fn from(record: ModuleRecord) -> Self {
        let module_type = record.module_type();
        let mut flat = FlatRecord {
            title: record.title,
            description: record.description,
            url: record.url,
            links: record.links,
            module_type,
            subtype: String::new(),
            main: String::new(),
            avatar: None,
            authors: None,
            parents: None,
            follows: None,
            contents: None,
        };
        match record.p2pcommons {
            ModuleKind::Content(c) => {
                flat.subtype = c.subtype;
                flat.main = c.main;
                flat.authors = Some(c.authors);
                flat.parents = Some(c.parents);
            }
            ModuleKind::Profile(p) => {
                flat.subtype = p.subtype;
                flat.main = p.main;
                flat.avatar = Some(p.avatar);
                flat.follows = Some(p.follows);
                flat.contents = Some(p.contents);
            }
        }
        flat
    }
}

impl TryFrom<FlatRecord> for ModuleRecord {
    type Error = ValidationError;

    fn try_from(flat: FlatRecord) -> Result<Self, Self::Error> {
        let p2pcommons = match flat.module_type {
            ModuleType::Content => {
                reject_foreign(flat.avatar.is_some(), ValidationCode::AvatarModuleType, "avatar")?;
                reject_foreign(flat.follows.is_some(), ValidationCode::FollowsModuleType, "follows")?;
                reject_foreign(
                    flat.contents.is_some(),
                    ValidationCode::ContentsModuleType,
                    "contents",
                )?;
                ModuleKind::Content(ContentFields {
                    subtype: flat.subtype,
                    main: flat.main,
                    authors: flat.authors.unwrap_or_default(),
                    parents: flat.parents.unwrap_or_default(),
                })
            }
            ModuleType::Profile => {
                reject_foreign(flat.authors.is_some(), ValidationCode::AuthorsModuleType, "authors")?;
                reject_foreign(flat.parents.is_some(), ValidationCode::ParentsModuleType, "parents")?;
                ModuleKind::Profile(ProfileFields {
                    subtype: flat.subtype,
                    main: flat.main,
                    avatar: flat.avatar.unwrap_or_default(),
                    follows: flat.follows.unwrap_or_default(),
                    contents: flat.contents.unwrap_or_default(),
                })
            }
        };
        Ok(ModuleRecord {
            title: flat.title,
            description: flat.description,
            url: flat.url,
            links: flat.links,
            p2pcommons,
        })
    }
}

fn reject_foreign(
    present: bool,
    code: ValidationCode,
    property: &str,
) -> Result<(), ValidationError> {
    if present {
        return Err(ValidationError::new(
            format!("Field '{}' does not belong to this module type", property),
            code,
            property,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Links;
    use serde_json::json;

    fn nested() -> Value {
        json!({
            "title": "demo",
            "description": "lorem ipsum",
            "url": "hyper://aa",
            "links": {"license": [], "spec": []},
            "p2pcommons": {"type": "content", "subtype": "", "main": "", "authors": [], "parents": []}
        })
    }

    #[test]
    fn test_flatten_lifts_keys() {
        let flat = flatten(&nested());
        assert_eq!(flat["type"], "content");
        assert!(flat.get("p2pcommons").is_none());
        assert_eq!(flat["title"], "demo");
    }

    #[test]
    fn test_unflatten_inverts_flatten() {
        let n = nested();
        assert_eq!(unflatten(&flatten(&n)), n);
    }

    #[test]
    fn test_idempotent() {
        let n = nested();
        let f = flatten(&n);
        assert_eq!(flatten(&f), f);
        assert_eq!(unflatten(&n), n);
        assert_eq!(unflatten(&unflatten(&f)), unflatten(&f));
    }

    #[test]
    fn test_without_module_keys_is_untouched() {
        let doc = json!({"title": "x"});
        assert_eq!(unflatten(&doc), doc);
        assert_eq!(flatten(&doc), doc);
    }

    #[test]
    fn test_typed_round_trip() {
        let record = ModuleRecord {
            title: "t".into(),
            description: String::new(),
            url: "hyper://k".into(),
            links: Links::default(),
            p2pcommons: ModuleKind::empty(ModuleType::Profile),
        };
        let flat = FlatRecord::from(record.clone());
        assert_eq!(flat.follows, Some(vec![]));
        assert_eq!(flat.authors, None);
        assert_eq!(ModuleRecord::try_from(flat).unwrap(), record);
    }

    #[test]
    fn test_typed_rejects_foreign_field() {
        let record = ModuleRecord {
            title: "t".into(),
            description: String::new(),
            url: "hyper://k".into(),
            links: Links::default(),
            p2pcommons: ModuleKind::empty(ModuleType::Content),
        };
        let mut flat = FlatRecord::from(record);
        flat.follows = Some(vec![]);
        let err = ModuleRecord::try_from(flat).unwrap_err();
        assert_eq!(err.code, ValidationCode::FollowsModuleType);
    }

    #[test]
    fn test_flat_record_json_matches_value_flatten() {
        let record: ModuleRecord = record_from_value(&json!({
            "title": "demo",
            "description": "d",
            "url": "hyper://k",
            "links": {"license": [{"href": "l"}], "spec": [{"href": "s"}]},
            "type": "content", "subtype": "", "main": "", "authors": [], "parents": []
        }))
        .unwrap();
        let flat_json = serde_json::to_value(FlatRecord::from(record.clone())).unwrap();
        let value_json = flatten(&serde_json::to_value(&record).unwrap());
        assert_eq!(flat_json, value_json);
    }
}
