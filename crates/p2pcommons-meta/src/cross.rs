//! Validation rules that span more than one module.
//!
//! Registration and following only need the two records involved. The
//! parents rule needs to resolve other modules, which goes through the
//! [`ModuleLookup`] collaborator (local index first, swarm fallback).

use std::path::Path;

use async_trait::async_trait;

use crate::error::{ValidationCode as Code, ValidationError};
use crate::types::{HyperKey, ModuleRecord, ModuleType, VersionedKey};

/// Resolves module references to records.
#[async_trait]
pub trait ModuleLookup: Send + Sync {
    /// Error raised when a lookup cannot complete.
    type Error: From<ValidationError> + Send;

    /// Returns the record for `key`; versioned keys resolve to that snapshot.
    /// `Ok(None)` means the module is unknown.
    async fn lookup(&self, key: &VersionedKey) -> Result<Option<ModuleRecord>, Self::Error>;
}

/// Checks that `content` may be registered in `profile`.
///
/// `content_dir` enables the on-disk check of the content's main file.
pub fn validate_on_register(
    content: &ModuleRecord,
    content_dir: Option<&Path>,
    profile: &ModuleRecord,
) -> Result<(), ValidationError> {
    let Some(fields) = content.as_content() else {
        return Err(ValidationError::new(
            "Only content modules can be registered",
            Code::OnRegisterModuleType,
            "type",
        ));
    };
    if profile.module_type() != ModuleType::Profile {
        return Err(ValidationError::new(
            "Content can only be registered in a profile",
            Code::OnRegisterModuleType,
            "type",
        ));
    }
    let profile_key = profile.key().map(|k| k.to_hex()).unwrap_or_default();
    if !fields.authors.iter().any(|a| *a == profile_key) {
        return Err(ValidationError::new(
            "Content authors must include the registering profile",
            Code::OnRegisterAuthorsContainsProfileKey,
            "authors",
        ));
    }
    if fields.main.is_empty() {
        return Err(ValidationError::new(
            "Content must have a main file before it can be registered",
            Code::MainExists,
            "main",
        ));
    }
    if let Some(dir) = content_dir {
        if !dir.join(&fields.main).is_file() {
            return Err(ValidationError::new(
                format!("Main file '{}' does not exist", fields.main),
                Code::MainExists,
                "main",
            ));
        }
    }
    Ok(())
}

/// Checks that `target` can be followed.
pub fn validate_on_follow(target: &ModuleRecord) -> Result<(), ValidationError> {
    if target.module_type() != ModuleType::Profile {
        return Err(ValidationError::new(
            "Only profiles can be followed",
            Code::OnFollowModuleType,
            "type",
        ));
    }
    Ok(())
}

/// Checks that every parent of `record` is registered by one of its authors.
///
/// A parent `<key>+<v>` is registered when at least one author listed in that
/// parent snapshot carries exactly `<key>+<v>` in its `contents`.
pub async fn validate_parents_on_update<L: ModuleLookup + ?Sized>(
    record: &ModuleRecord,
    lookup: &L,
) -> Result<(), L::Error> {
    let Some(fields) = record.as_content() else {
        return Ok(());
    };
    for entry in &fields.parents {
        let Ok(parent_ref) = entry.parse::<VersionedKey>() else {
            return Err(ValidationError::new(
                format!("Parent '{}' is not a versioned key", entry),
                Code::ParentsFormat,
                "parents",
            )
            .into());
        };
        if !is_registered(entry, &parent_ref, lookup).await? {
            return Err(ValidationError::new(
                format!("Parent '{}' is not registered by any of its authors", entry),
                Code::ParentsRegistered,
                "parents",
            )
            .into());
        }
    }
    Ok(())
}

async fn is_registered<L: ModuleLookup + ?Sized>(
    entry: &str,
    parent_ref: &VersionedKey,
    lookup: &L,
) -> Result<bool, L::Error> {
    let Some(parent) = lookup.lookup(parent_ref).await? else {
        return Ok(false);
    };
    let Some(parent_fields) = parent.as_content() else {
        return Ok(false);
    };
    for author in &parent_fields.authors {
        let Some(author_key) = HyperKey::from_hex(author) else {
            continue;
        };
        let profile = lookup.lookup(&VersionedKey::latest(author_key)).await?;
        let registered = profile
            .as_ref()
            .and_then(ModuleRecord::as_profile)
            .is_some_and(|p| p.contents.iter().any(|c| c == entry));
        if registered {
            return Ok(true);
        }
    }
    Ok(false)
}
