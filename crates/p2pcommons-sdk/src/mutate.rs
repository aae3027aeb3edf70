//! Updates to local modules: `set` and the profile list operations built on it.

use p2pcommons_meta::cross::{
    validate_on_follow, validate_on_register, validate_parents_on_update, ModuleLookup,
};
use p2pcommons_meta::normalize::{record_from_value, unflatten};
use p2pcommons_meta::validate::{validate_nested, validate_partial, ValidationContext};
use p2pcommons_meta::{
    FlatRecord, HyperKey, InvalidKeyError, ModuleRecord, ModuleType, TypeError, ValidationCode,
    ValidationError, VersionedKey,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::engine::{kind_of, Engine, ModuleView};
use crate::error::{Result, SdkError};
use crate::events::EngineEvent;

/// Fields `set` accepts.
pub const SETTABLE_FIELDS: [&str; 9] = [
    "title",
    "description",
    "main",
    "subtype",
    "avatar",
    "authors",
    "parents",
    "follows",
    "contents",
];

const LIST_FIELDS: [&str; 4] = ["authors", "parents", "follows", "contents"];

/// How an incoming field value combines with the stored one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MergePolicy {
    /// The incoming value replaces the stored one.
    Overwrite,
    /// Incoming list entries are appended unless already present.
    Union,
}

impl MergePolicy {
    /// Policy for `field`. Lists are unioned unless `force` is set.
    pub fn for_field(field: &str, force: bool) -> Self {
        if LIST_FIELDS.contains(&field) && !force {
            MergePolicy::Union
        } else {
            MergePolicy::Overwrite
        }
    }

    /// Combines `current` with `incoming`.
    pub fn apply(self, current: Option<&Value>, incoming: &Value) -> Value {
        match (self, current, incoming) {
            (MergePolicy::Union, Some(Value::Array(current)), Value::Array(incoming)) => {
                let mut merged = current.clone();
                for item in incoming {
                    if !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
                Value::Array(merged)
            }
            _ => incoming.clone(),
        }
    }
}

impl Engine {
    /// Updates fields of a local module.
    ///
    /// `fields` is a flat object of settable fields. The incoming values are
    /// validated alone, then merged ([`MergePolicy`]) and the merged record
    /// is validated in full, including parents registration and the
    /// existence of newly followed profiles and listed contents. Nothing is
    /// written unless every check passes.
    pub async fn set(&self, url: &str, fields: Value, force: bool) -> Result<ModuleView> {
        let Value::Object(fields) = fields else {
            return Err(TypeError::new("object", kind_of(&fields), "params").into());
        };
        if let Some(invalid) = fields
            .keys()
            .find(|k| !SETTABLE_FIELDS.contains(&k.as_str()))
        {
            return Err(InvalidKeyError {
                invalid: invalid.clone(),
            }
            .into());
        }

        let key = self.parse_url(url)?.key;
        let envelope = self.writable_envelope(&key)?;
        let dir = self.module_dir(&key);
        let ctx = ValidationContext::new(key)
            .with_version(envelope.version)
            .with_module_dir(&dir);

        let mut incoming = fields.clone();
        incoming.insert("type".into(), json!(envelope.module_type.as_str()));
        validate_partial(&unflatten(&Value::Object(incoming)), &ctx)?;

        let mut merged = serde_json::to_value(FlatRecord::from(envelope.raw_json.clone()))?;
        if let Value::Object(map) = &mut merged {
            for (field, value) in &fields {
                let combined = MergePolicy::for_field(field, force).apply(map.get(field), value);
                map.insert(field.clone(), combined);
            }
        }
        let nested = unflatten(&merged);
        validate_nested(&nested, &ctx)?;
        let record = record_from_value(&nested)?;
        if record == envelope.raw_json {
            debug!(key = %key, "set changed nothing");
            return Ok(envelope.into());
        }
        self.validate_references(&envelope.raw_json, &record, &fields)
            .await?;

        let drive = self.drive_for(&key).await?;
        let updated = self.persist(drive.as_ref(), &record).await?;
        info!(key = %key, version = updated.version, "module updated");
        self.events.publish(EngineEvent::ModuleUpdated {
            key: key.to_hex(),
            version: updated.version,
        });
        Ok(updated.into())
    }

    /// Checks that references added by an update resolve.
    async fn validate_references(
        &self,
        previous: &ModuleRecord,
        record: &ModuleRecord,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        if fields.contains_key("parents") {
            validate_parents_on_update(record, self).await?;
        }
        let (Some(before), Some(after)) = (previous.as_profile(), record.as_profile()) else {
            return Ok(());
        };
        if fields.contains_key("follows") {
            for entry in added(&before.follows, &after.follows) {
                let target = self.resolve_reference(entry).await?;
                validate_on_follow(&target)?;
            }
        }
        if fields.contains_key("contents") {
            for entry in added(&before.contents, &after.contents) {
                let target = self.resolve_reference(entry).await?;
                if target.module_type() != ModuleType::Content {
                    return Err(
                        TypeError::new("content", target.module_type().as_str(), "contents").into(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn resolve_reference(&self, entry: &str) -> Result<ModuleRecord> {
        let reference: VersionedKey = entry
            .parse()
            .map_err(|()| TypeError::new("module key", entry, "key"))?;
        self.lookup(&reference)
            .await?
            .ok_or_else(|| SdkError::not_found(entry))
    }

    /// Pins an unversioned reference to the version this peer resolves.
    async fn pin_version(&self, reference: VersionedKey) -> Result<VersionedKey> {
        if reference.version.is_some() {
            return Ok(reference);
        }
        let view = self.clone_module(&reference.key.to_hex(), false).await?;
        Ok(reference.key.at(view.version))
    }

    /// Adds a content snapshot to a local profile's `contents`.
    ///
    /// An unversioned content url is pinned to its current version. The
    /// content must list the profile among its authors and, when it is
    /// local, its main file must exist.
    pub async fn register(&self, content_url: &str, profile_url: &str) -> Result<ModuleView> {
        let profile_key = self.parse_url(profile_url)?.key;
        let profile = self.writable_envelope(&profile_key)?;
        let content_ref = self.pin_version(self.parse_url(content_url)?).await?;
        let content = self
            .lookup(&content_ref)
            .await?
            .ok_or_else(|| SdkError::not_found(content_ref))?;

        let local_dir = self
            .index
            .get(&content_ref.key)?
            .filter(|e| e.is_writable)
            .map(|_| self.module_dir(&content_ref.key));
        validate_on_register(&content, local_dir.as_deref(), &profile.raw_json)?;

        let entry = content_ref.to_string();
        let registered = profile
            .raw_json
            .as_profile()
            .is_some_and(|p| p.contents.contains(&entry));
        if registered {
            return Err(ValidationError::new(
                format!("Content '{}' is already registered", entry),
                ValidationCode::ContentsUnique,
                "contents",
            )
            .into());
        }
        self.set(&profile_key.to_hex(), json!({ "contents": [entry] }), false)
            .await
    }

    /// Removes a content snapshot from a local profile's `contents`.
    pub async fn deregister(&self, content_url: &str, profile_url: &str) -> Result<ModuleView> {
        let profile_key = self.parse_url(profile_url)?.key;
        let profile = self.writable_envelope(&profile_key)?;
        let content_ref = self.pin_version(self.parse_url(content_url)?).await?;
        let entry = content_ref.to_string();

        let mut contents = profile
            .raw_json
            .as_profile()
            .map(|p| p.contents.clone())
            .unwrap_or_default();
        let Some(position) = contents.iter().position(|c| *c == entry) else {
            return Err(SdkError::NotRegistered {
                content: entry,
                profile: profile_key.to_hex(),
            });
        };
        contents.remove(position);
        self.set(&profile_key.to_hex(), json!({ "contents": contents }), true)
            .await
    }

    /// Drops every snapshot of `content` from every local profile.
    pub(crate) async fn deregister_everywhere(&self, content: &HyperKey) -> Result<()> {
        for envelope in self.index.list()? {
            if !envelope.is_writable {
                continue;
            }
            let Some(profile) = envelope.raw_json.as_profile() else {
                continue;
            };
            let remaining: Vec<&String> = profile
                .contents
                .iter()
                .filter(|c| c.parse::<VersionedKey>().map(|r| r.key) != Ok(*content))
                .collect();
            if remaining.len() == profile.contents.len() {
                continue;
            }
            let Some(profile_key) = envelope.key() else {
                continue;
            };
            debug!(profile = %profile_key, content = %content, "deregistering deleted content");
            self.set(&profile_key.to_hex(), json!({ "contents": remaining }), true)
                .await?;
        }
        Ok(())
    }

    /// Adds a profile to a local profile's `follows`.
    pub async fn follow(&self, profile_url: &str, target_url: &str) -> Result<ModuleView> {
        let profile_key = self.parse_url(profile_url)?.key;
        let profile = self.writable_envelope(&profile_key)?;
        let target = self.parse_url(target_url)?;
        if target.key == profile_key {
            return Err(ValidationError::new(
                "A profile cannot follow itself",
                ValidationCode::FollowsNoSelfReference,
                "follows",
            )
            .into());
        }
        let entry = target.to_string();
        let following = profile
            .raw_json
            .as_profile()
            .is_some_and(|p| p.follows.contains(&entry));
        if following {
            return Err(ValidationError::new(
                format!("Profile '{}' is already followed", entry),
                ValidationCode::FollowsUnique,
                "follows",
            )
            .into());
        }
        self.set(&profile_key.to_hex(), json!({ "follows": [entry] }), false)
            .await
    }

    /// Removes a profile from a local profile's `follows`.
    pub async fn unfollow(&self, profile_url: &str, target_url: &str) -> Result<ModuleView> {
        let profile_key = self.parse_url(profile_url)?.key;
        let profile = self.writable_envelope(&profile_key)?;
        let entry = self.parse_url(target_url)?.to_string();
        let mut follows = profile
            .raw_json
            .as_profile()
            .map(|p| p.follows.clone())
            .unwrap_or_default();
        let Some(position) = follows.iter().position(|f| *f == entry) else {
            return Err(SdkError::NotFollowing {
                target: entry,
                profile: profile_key.to_hex(),
            });
        };
        follows.remove(position);
        self.set(&profile_key.to_hex(), json!({ "follows": follows }), true)
            .await
    }
}

fn added<'a>(before: &'a [String], after: &'a [String]) -> impl Iterator<Item = &'a String> {
    after.iter().filter(move |entry| !before.contains(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_policy_selection() {
        assert_eq!(MergePolicy::for_field("title", false), MergePolicy::Overwrite);
        assert_eq!(MergePolicy::for_field("authors", false), MergePolicy::Union);
        assert_eq!(MergePolicy::for_field("authors", true), MergePolicy::Overwrite);
        assert_eq!(MergePolicy::for_field("main", true), MergePolicy::Overwrite);
    }

    #[test]
    fn test_union_keeps_order_and_drops_duplicates() {
        let merged = MergePolicy::Union.apply(Some(&json!(["a", "b"])), &json!(["b", "c", "a"]));
        assert_eq!(merged, json!(["a", "b", "c"]));
        let merged = MergePolicy::Union.apply(None, &json!(["x"]));
        assert_eq!(merged, json!(["x"]));
        let merged = MergePolicy::Overwrite.apply(Some(&json!(["a"])), &json!([]));
        assert_eq!(merged, json!([]));
    }

    #[test]
    fn test_added_entries() {
        let before = vec!["a".to_string(), "b".to_string()];
        let after = vec!["b".to_string(), "c".to_string()];
        assert_eq!(added(&before, &after).collect::<Vec<_>>(), vec!["c"]);
    }
}
