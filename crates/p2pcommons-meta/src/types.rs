//! Core types: module keys, module records and the storage envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// License every module is published under (CC0 1.0).
pub const LICENSE_HREF: &str = "https://creativecommons.org/publicdomain/zero/1.0/legalcode";

/// Module spec version written into new records.
pub const SPEC_HREF: &str = "https://p2pcommons.com/specs/module/1.0.0";

/// URL scheme of module URLs.
pub const HYPER_SCHEME: &str = "hyper://";

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 300;

/// Name of the metadata file inside every module.
pub const INDEX_JSON: &str = "index.json";

/// Length of a hex-encoded module key.
pub const KEY_HEX_LEN: usize = 64;

/// Public key identifying a module (32 bytes, rendered as 64 lowercase hex chars).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HyperKey([u8; 32]);

impl HyperKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        HyperKey(bytes)
    }

    /// Parses 64 lowercase hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_HEX_LEN || !is_lower_hex(s) {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(HyperKey(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the 64-char hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the unversioned module URL (`hyper://<hex>`).
    pub fn to_url(&self) -> String {
        format!("{}{}", HYPER_SCHEME, self.to_hex())
    }

    /// Derives the discovery key announced on the swarm.
    ///
    /// Peers only ever see the discovery key, never the module key itself.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, b"hypercore").as_bytes())
    }

    /// Pins this key to a version.
    pub fn at(self, version: u64) -> VersionedKey {
        VersionedKey {
            key: self,
            version: Some(version),
        }
    }
}

impl fmt::Display for HyperKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Topic under which a module is announced and looked up on the swarm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A module reference, optionally pinned to an immutable snapshot.
///
/// Rendered as `<hex>` or `<hex>+<version>`, the form used inside
/// `authors`, `parents`, `follows` and `contents`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    /// Module key.
    pub key: HyperKey,
    /// Snapshot version, `None` for the latest state.
    pub version: Option<u64>,
}

impl VersionedKey {
    /// Reference to the latest state of `key`.
    pub fn latest(key: HyperKey) -> Self {
        Self { key, version: None }
    }

    /// Returns the module URL (`hyper://<hex>[+<version>]`).
    pub fn to_url(&self) -> String {
        format!("{}{}", HYPER_SCHEME, self)
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}+{}", self.key, v),
            None => write!(f, "{}", self.key),
        }
    }
}

impl FromStr for VersionedKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, version) = match s.split_once('+') {
            Some((host, v)) => (host, Some(parse_version(v).ok_or(())?)),
            None => (s, None),
        };
        let key = HyperKey::from_hex(host).ok_or(())?;
        Ok(Self { key, version })
    }
}

fn parse_version(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub(crate) fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Discriminant of the two module shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// A unit of published content.
    Content,
    /// A researcher profile.
    Profile,
}

impl ModuleType {
    /// Returns `"content"` or `"profile"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::Content => "content",
            ModuleType::Profile => "profile",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(ModuleType::Content),
            "profile" => Ok(ModuleType::Profile),
            _ => Err(()),
        }
    }
}

/// A single `{href}` link object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link target.
    pub href: String,
}

/// The `links` block of a module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    /// Exactly one license link.
    pub license: Vec<Link>,
    /// Exactly one module spec link.
    pub spec: Vec<Link>,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            license: vec![Link {
                href: LICENSE_HREF.to_string(),
            }],
            spec: vec![Link {
                href: SPEC_HREF.to_string(),
            }],
        }
    }
}

/// Type-specific fields of a content module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFields {
    /// Free-form alphanumeric subtype.
    pub subtype: String,
    /// Relative path of the main file.
    pub main: String,
    /// Unversioned profile keys.
    pub authors: Vec<String>,
    /// Versioned content keys this module derives from.
    pub parents: Vec<String>,
}

/// Type-specific fields of a profile module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    /// Free-form alphanumeric subtype.
    pub subtype: String,
    /// Relative path of the main file (may be empty).
    pub main: String,
    /// Relative path of the avatar image (may be empty).
    #[serde(default)]
    pub avatar: String,
    /// Followed profiles, versioned or not.
    pub follows: Vec<String>,
    /// Registered content, versioned or not.
    pub contents: Vec<String>,
}

/// The `p2pcommons` block: a tagged union on `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModuleKind {
    /// `type: "content"`.
    Content(ContentFields),
    /// `type: "profile"`.
    Profile(ProfileFields),
}

impl ModuleKind {
    /// Default fields for a freshly created module of the given type.
    pub fn empty(module_type: ModuleType) -> Self {
        match module_type {
            ModuleType::Content => ModuleKind::Content(ContentFields::default()),
            ModuleType::Profile => ModuleKind::Profile(ProfileFields::default()),
        }
    }

    /// Returns the discriminant.
    pub fn module_type(&self) -> ModuleType {
        match self {
            ModuleKind::Content(_) => ModuleType::Content,
            ModuleKind::Profile(_) => ModuleType::Profile,
        }
    }

    /// Returns the `main` path.
    pub fn main(&self) -> &str {
        match self {
            ModuleKind::Content(c) => &c.main,
            ModuleKind::Profile(p) => &p.main,
        }
    }

    /// Returns the `subtype`.
    pub fn subtype(&self) -> &str {
        match self {
            ModuleKind::Content(c) => &c.subtype,
            ModuleKind::Profile(p) => &p.subtype,
        }
    }
}

/// Canonical nested module metadata, the shape of `p2pcommons` records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Module title.
    pub title: String,
    /// Module description.
    pub description: String,
    /// Unversioned module URL.
    pub url: String,
    /// License and spec links.
    pub links: Links,
    /// Type-specific fields.
    pub p2pcommons: ModuleKind,
}

impl ModuleRecord {
    /// Returns the discriminant of the type-specific block.
    pub fn module_type(&self) -> ModuleType {
        self.p2pcommons.module_type()
    }

    /// Returns the module key encoded in `url`, if well formed.
    pub fn key(&self) -> Option<HyperKey> {
        self.url
            .strip_prefix(HYPER_SCHEME)
            .and_then(HyperKey::from_hex)
    }

    /// Returns the content fields, if this is a content module.
    pub fn as_content(&self) -> Option<&ContentFields> {
        match &self.p2pcommons {
            ModuleKind::Content(c) => Some(c),
            ModuleKind::Profile(_) => None,
        }
    }

    /// Returns the profile fields, if this is a profile module.
    pub fn as_profile(&self) -> Option<&ProfileFields> {
        match &self.p2pcommons {
            ModuleKind::Profile(p) => Some(p),
            ModuleKind::Content(_) => None,
        }
    }
}

/// The flattened shape handed to callers and written as `index.json`.
///
/// `p2pcommons.*` keys sit next to `title/description/url/links`; the
/// type-specific arrays are present only for the matching module type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRecord {
    /// Module title.
    pub title: String,
    /// Module description.
    pub description: String,
    /// Unversioned module URL.
    pub url: String,
    /// License and spec links.
    pub links: Links,
    /// Module type.
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    /// Subtype.
    pub subtype: String,
    /// Main file path.
    pub main: String,
    /// Avatar path (profiles only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Authors (content only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Parents (content only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<String>>,
    /// Follows (profiles only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<Vec<String>>,
    /// Contents (profiles only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<String>>,
}

/// The locally persisted wrapper around a module record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEnvelope {
    /// True iff this peer holds the module's secret key.
    pub is_writable: bool,
    /// Last modification time (millisecond precision).
    pub last_modified: DateTime<Utc>,
    /// Drive version the record was read from or written at.
    pub version: u64,
    /// The module metadata.
    pub raw_json: ModuleRecord,
    /// Cached tag of `raw_json.p2pcommons`.
    pub module_type: ModuleType,
}

impl StorageEnvelope {
    /// Wraps a record, caching its module type.
    pub fn new(raw_json: ModuleRecord, is_writable: bool, version: u64) -> Self {
        Self {
            is_writable,
            last_modified: now_millis(),
            version,
            module_type: raw_json.module_type(),
            raw_json,
        }
    }

    /// Returns the module key, if the record url is well formed.
    pub fn key(&self) -> Option<HyperKey> {
        self.raw_json.key()
    }
}

/// The current time truncated to millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Converts integer milliseconds since the epoch to a timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}
