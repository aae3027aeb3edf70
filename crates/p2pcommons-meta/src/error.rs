//! Error types for metadata validation, encoding and persistence.
//!
//! Every error that reaches a caller carries a stable, machine-checkable
//! discriminant: validation failures carry a [`ValidationCode`], the other
//! structural errors are distinct types with their own `code()`.

use std::fmt;

use thiserror::Error;

macro_rules! validation_codes {
    ($($variant:ident => $code:literal,)+) => {
        /// Stable identifier of a single validation rule.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ValidationCode {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
        }

        impl ValidationCode {
            /// Returns the wire-stable string form of this code.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ValidationCode::$variant => $code,)+
                }
            }

            /// Looks a code up by its string form.
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some(ValidationCode::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

validation_codes! {
    TitleRequired => "title_required",
    TitleType => "title_type",
    TitleLength => "title_length",
    TitleWhitespace => "title_whitespace",
    DescriptionRequired => "description_required",
    DescriptionType => "description_type",
    UrlRequired => "url_required",
    UrlType => "url_type",
    UrlFormat => "url_format",
    UrlKey => "url_key",
    LinksRequired => "links_required",
    LinksType => "links_type",
    LinksLicenseRequired => "links_license_required",
    LinksLicenseFormat => "links_license_format",
    LinksLicenseHref => "links_license_href",
    LinksSpecRequired => "links_spec_required",
    LinksSpecFormat => "links_spec_format",
    LinksSpecHref => "links_spec_validurl",
    P2pcommonsRequired => "p2pcommons_required",
    P2pcommonsType => "p2pcommons_type",
    TypeRequired => "type_required",
    TypeType => "type_type",
    TypeValue => "type_value",
    SubtypeRequired => "subtype_required",
    SubtypeType => "subtype_type",
    SubtypeFormat => "subtype_format",
    MainRequired => "main_required",
    MainType => "main_type",
    MainNotDotfile => "main_notdotfile",
    MainRelativePath => "main_relativepath",
    MainExists => "main_exists",
    MainExtension => "main_extension",
    AvatarModuleType => "avatar_moduletype",
    AvatarType => "avatar_type",
    AvatarRelativePath => "avatar_relativepath",
    AuthorsModuleType => "authors_moduletype",
    AuthorsRequired => "authors_required",
    AuthorsType => "authors_type",
    AuthorsUnique => "authors_unique",
    AuthorsFormat => "authors_format",
    ParentsModuleType => "parents_moduletype",
    ParentsRequired => "parents_required",
    ParentsType => "parents_type",
    ParentsUnique => "parents_unique",
    ParentsFormat => "parents_format",
    ParentsNoSelfReference => "parents_noselfreference",
    ParentsRegistered => "parents_registered",
    FollowsModuleType => "follows_moduletype",
    FollowsRequired => "follows_required",
    FollowsType => "follows_type",
    FollowsUnique => "follows_unique",
    FollowsFormat => "follows_format",
    FollowsNoSelfReference => "follows_noselfreference",
    ContentsModuleType => "contents_moduletype",
    ContentsRequired => "contents_required",
    ContentsType => "contents_type",
    ContentsUnique => "contents_unique",
    ContentsFormat => "contents_format",
    OnRegisterModuleType => "onregister_moduletype",
    OnRegisterAuthorsContainsProfileKey => "onregister_authorscontainsprofilekey",
    OnFollowModuleType => "onfollow_moduletype",
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule violation found while validating module metadata.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {description} (property '{property}')")]
pub struct ValidationError {
    /// Human readable explanation.
    pub description: String,
    /// Rule that failed.
    pub code: ValidationCode,
    /// Metadata property the rule applies to.
    pub property: String,
}

impl ValidationError {
    /// Creates a new validation error.
    pub fn new(
        description: impl Into<String>,
        code: ValidationCode,
        property: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            code,
            property: property.into(),
        }
    }
}

/// A parameter had the wrong shape.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid type for '{key}': expected {expected}, received {received}")]
pub struct TypeError {
    /// What was expected.
    pub expected: String,
    /// What was received, rendered as text.
    pub received: String,
    /// Name of the offending parameter.
    pub key: String,
}

impl TypeError {
    /// Creates a new type error.
    pub fn new(
        expected: impl Into<String>,
        received: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            expected: expected.into(),
            received: received.into(),
            key: key.into(),
        }
    }
}

/// An update named a field that cannot be set.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid key: '{invalid}'")]
pub struct InvalidKeyError {
    /// The rejected field name.
    pub invalid: String,
}

/// A required parameter was not supplied.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("missing required parameter: {param}")]
pub struct MissingParam {
    /// Name of the missing parameter.
    pub param: String,
}

/// A file was busy while the module directory was being synchronised.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("resource busy: {message} ({key})")]
pub struct EBusyError {
    /// Description of the busy resource.
    pub message: String,
    /// Module key the resource belongs to.
    pub key: String,
}

/// Errors raised by the binary codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record handed to `encode` is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A logical-type check failed on a field at the binary boundary.
    #[error("logical type {logical} rejected field '{field}': {reason}")]
    LogicalType {
        /// Logical type name (Title, Path, DatUrl, ...).
        logical: &'static str,
        /// Field that failed the check.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The generic wrapper carries a tag no schema is registered for.
    #[error("unknown record tag '{0}'")]
    UnknownTag(String),

    /// Persisted bytes could not be decoded.
    #[error("decode failed at {stage}: {reason}")]
    Decode {
        /// Which layer of the envelope failed.
        stage: &'static str,
        /// Underlying reason.
        reason: String,
    },

    /// Serialization failure while encoding.
    #[error("encode failed: {0}")]
    Encode(#[from] bincode::Error),
}

impl CodecError {
    /// Stable discriminant for callers that branch on the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::Validation(e) => e.code.as_str(),
            CodecError::LogicalType { .. } => "codec_logical_type",
            CodecError::UnknownTag(_) => "codec_unknown_tag",
            CodecError::Decode { .. } => "codec_decode",
            CodecError::Encode(_) => "codec_encode",
        }
    }
}

/// Errors from the key-value layer and the local index.
#[derive(Debug, Error)]
pub enum MetaError {
    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// The sled backend failed.
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// A stored envelope could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A seed entry could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
