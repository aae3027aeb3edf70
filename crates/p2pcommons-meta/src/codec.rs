//! Binary encoding of storage envelopes.
//!
//! Three layers, each bincode-encoded:
//!
//! 1. the envelope `{is_writable, last_modified, version, raw_json}` where
//!    `raw_json` holds the bytes of layer 2,
//! 2. a generic `{type, value}` wrapper whose `type` tag selects the schema,
//! 3. the concrete content or profile payload.
//!
//! The envelope schema never changes when a module shape does. Logical-type
//! checks run on every field at both encode and decode time, so malformed
//! records are rejected at the binary boundary independently of the
//! field validators.

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CodecError, ValidationCode, ValidationError};
use crate::types::{
    from_millis, ContentFields, HyperKey, Links, ModuleKind, ModuleRecord, ModuleType,
    ProfileFields, StorageEnvelope, VersionedKey, HYPER_SCHEME, MAX_TITLE_LEN,
};
use crate::validate::is_relative_path;

/// Upper bound on a single encoded envelope.
pub const MAX_ENCODED_LEN: u64 = 16 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENCODED_LEN)
}

#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    is_writable: bool,
    last_modified: i64,
    version: u64,
    raw_json: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct GenericWire {
    tag: String,
    value: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ContentWire {
    title: String,
    description: String,
    url: String,
    links: Links,
    p2pcommons: ContentFields,
}

#[derive(Serialize, Deserialize)]
struct ProfileWire {
    title: String,
    description: String,
    url: String,
    links: Links,
    p2pcommons: ProfileFields,
}

/// Semantic constraints attached to individual wire fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogicalType {
    /// Non-empty string of at most 300 characters.
    Title,
    /// Relative path; empty allowed unless `required`.
    Path {
        /// Whether the empty string is rejected.
        required: bool,
    },
    /// Unversioned module key, with or without the `hyper://` scheme.
    DatUrl {
        /// Whether the `hyper://` prefix is expected.
        with_scheme: bool,
    },
    /// Module key with a version suffix, optional unless `required`.
    DatUrlVersion {
        /// Whether the `+<version>` suffix is mandatory.
        required: bool,
    },
}

impl LogicalType {
    /// Name used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalType::Title => "Title",
            LogicalType::Path { .. } => "Path",
            LogicalType::DatUrl { .. } => "DatUrl",
            LogicalType::DatUrlVersion { .. } => "DatUrlVersion",
        }
    }

    /// Checks `value` of `field` against this logical type.
    pub fn check(&self, field: &str, value: &str) -> Result<(), CodecError> {
        let reason = match self {
            LogicalType::Title => {
                let len = value.chars().count();
                (len == 0 || len > MAX_TITLE_LEN)
                    .then(|| format!("length {} outside 1..={}", len, MAX_TITLE_LEN))
            }
            LogicalType::Path { required } => {
                if value.is_empty() {
                    required.then(|| "path is required".to_string())
                } else {
                    (!is_relative_path(value)).then(|| "not a relative path".to_string())
                }
            }
            LogicalType::DatUrl { with_scheme } => {
                let bare = if *with_scheme {
                    value.strip_prefix(HYPER_SCHEME)
                } else {
                    Some(value)
                };
                bare.and_then(HyperKey::from_hex)
                    .is_none()
                    .then(|| "not an unversioned module key".to_string())
            }
            LogicalType::DatUrlVersion { required } => match value.parse::<VersionedKey>() {
                Ok(k) if k.version.is_some() || !required => None,
                Ok(_) => Some("version suffix is required".to_string()),
                Err(()) => Some("not a module key".to_string()),
            },
        };
        match reason {
            None => Ok(()),
            Some(reason) => Err(CodecError::LogicalType {
                logical: self.name(),
                field: field.to_string(),
                reason,
            }),
        }
    }

    fn check_all(&self, field: &str, values: &[String]) -> Result<(), CodecError> {
        values.iter().try_for_each(|v| self.check(field, v))
    }
}

/// Converts a timestamp to its wire form (integer milliseconds).
pub fn date_to_wire(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts integer milliseconds back to a timestamp.
pub fn date_from_wire(ms: i64) -> DateTime<Utc> {
    from_millis(ms)
}

/// Runs the logical-type checks [`encode`] applies to a record.
pub fn check_record(record: &ModuleRecord) -> Result<(), CodecError> {
    LogicalType::Title.check("title", &record.title)?;
    LogicalType::DatUrl { with_scheme: true }.check("url", &record.url)?;
    let path = LogicalType::Path { required: false };
    match &record.p2pcommons {
        ModuleKind::Content(c) => {
            path.check("main", &c.main)?;
            LogicalType::DatUrl { with_scheme: false }.check_all("authors", &c.authors)?;
            LogicalType::DatUrlVersion { required: true }.check_all("parents", &c.parents)?;
        }
        ModuleKind::Profile(p) => {
            path.check("main", &p.main)?;
            path.check("avatar", &p.avatar)?;
            let any_version = LogicalType::DatUrlVersion { required: false };
            any_version.check_all("follows", &p.follows)?;
            any_version.check_all("contents", &p.contents)?;
        }
    }
    Ok(())
}

/// Encodes an envelope. Deterministic: equal envelopes give equal bytes.
pub fn encode(envelope: &StorageEnvelope) -> Result<Vec<u8>, CodecError> {
    let record = &envelope.raw_json;
    if record.module_type() != envelope.module_type {
        return Err(ValidationError::new(
            format!(
                "envelope is tagged {} but p2pcommons.type is {}",
                envelope.module_type,
                record.module_type()
            ),
            ValidationCode::TypeValue,
            "p2pcommons.type",
        )
        .into());
    }
    check_record(record)?;

    let value = match &record.p2pcommons {
        ModuleKind::Content(fields) => options().serialize(&ContentWire {
            title: record.title.clone(),
            description: record.description.clone(),
            url: record.url.clone(),
            links: record.links.clone(),
            p2pcommons: fields.clone(),
        })?,
        ModuleKind::Profile(fields) => options().serialize(&ProfileWire {
            title: record.title.clone(),
            description: record.description.clone(),
            url: record.url.clone(),
            links: record.links.clone(),
            p2pcommons: fields.clone(),
        })?,
    };
    let generic = options().serialize(&GenericWire {
        tag: envelope.module_type.as_str().to_string(),
        value,
    })?;
    Ok(options().serialize(&EnvelopeWire {
        is_writable: envelope.is_writable,
        last_modified: date_to_wire(&envelope.last_modified),
        version: envelope.version,
        raw_json: generic,
    })?)
}

fn decode_stage<'a, T: Deserialize<'a>>(stage: &'static str, bytes: &'a [u8]) -> Result<T, CodecError> {
    options().deserialize(bytes).map_err(|e| {
        warn!(stage, error = %e, "failed to decode stored module");
        CodecError::Decode {
            stage,
            reason: e.to_string(),
        }
    })
}

/// Decodes bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<StorageEnvelope, CodecError> {
    let envelope: EnvelopeWire = decode_stage("envelope", bytes)?;
    let generic: GenericWire = decode_stage("generic", &envelope.raw_json)?;

    let (module_type, record) = match generic.tag.as_str() {
        "content" => {
            let wire: ContentWire = decode_stage("content", &generic.value)?;
            let record = ModuleRecord {
                title: wire.title,
                description: wire.description,
                url: wire.url,
                links: wire.links,
                p2pcommons: ModuleKind::Content(wire.p2pcommons),
            };
            (ModuleType::Content, record)
        }
        "profile" => {
            let wire: ProfileWire = decode_stage("profile", &generic.value)?;
            let record = ModuleRecord {
                title: wire.title,
                description: wire.description,
                url: wire.url,
                links: wire.links,
                p2pcommons: ModuleKind::Profile(wire.p2pcommons),
            };
            (ModuleType::Profile, record)
        }
        other => {
            warn!(tag = other, "stored module has an unknown record tag");
            return Err(CodecError::UnknownTag(other.to_string()));
        }
    };
    check_record(&record)?;

    Ok(StorageEnvelope {
        is_writable: envelope.is_writable,
        last_modified: date_from_wire(envelope.last_modified),
        version: envelope.version,
        raw_json: record,
        module_type,
    })
}
