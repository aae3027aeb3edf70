//! Field-level validation of module metadata.
//!
//! Validators run against the nested document shape (see
//! [`crate::normalize`]) so that wrong JSON types can be reported with their
//! own codes. Each validator stops at its first failing rule; pipelines run
//! validators in a fixed order and return the first failure.
//!
//! Two pipelines exist: [`validate_nested`] checks every field and reports
//! missing ones, [`validate_partial`] checks only the fields that are present.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ValidationCode as Code, ValidationError};
use crate::normalize::unflatten;
use crate::types::{HyperKey, ModuleRecord, VersionedKey, LICENSE_HREF, MAX_TITLE_LEN};

/// Bytes inspected when deciding whether a main file is text.
const SNIFF_LEN: usize = 8 * 1024;

/// Extensions accepted for `main` without inspecting the file.
pub const OPEN_FORMATS: &[&str] = &[
    "txt", "md", "markdown", "rst", "adoc", "tex", "bib", "html", "htm", "xhtml", "css", "js",
    "json", "jsonld", "xml", "csv", "tsv", "yaml", "yml", "toml", "ini", "svg", "ipynb", "r",
    "py", "rs", "c", "h", "cpp", "hpp", "java", "go", "rb", "jl", "m", "sh", "sql", "pdf", "odt",
    "ods", "odp", "odg", "epub", "png", "jpg", "jpeg", "gif", "webp", "tif", "tiff", "flac",
    "ogg", "oga", "opus", "wav", "webm", "mkv", "nc", "h5", "hdf5", "zip", "gz", "tar",
];

/// Context a validator may need beyond the document itself.
#[derive(Clone, Debug)]
pub struct ValidationContext<'a> {
    /// Key of the module being validated.
    pub key: HyperKey,
    /// Current stored version of the module, if it has been persisted.
    pub db_version: Option<u64>,
    /// Directory holding the module files; disk checks are skipped when `None`.
    pub module_dir: Option<&'a Path>,
}

impl<'a> ValidationContext<'a> {
    /// Context for the module with the given key.
    pub fn new(key: HyperKey) -> Self {
        Self {
            key,
            db_version: None,
            module_dir: None,
        }
    }

    /// Sets the stored version used by the parent self-reference rule.
    pub fn with_version(mut self, version: u64) -> Self {
        self.db_version = Some(version);
        self
    }

    /// Enables disk checks against `dir`.
    pub fn with_module_dir(mut self, dir: &'a Path) -> Self {
        self.module_dir = Some(dir);
        self
    }
}

type Validator = fn(&Value, &ValidationContext<'_>) -> Result<(), ValidationError>;

/// Where a validated property lives in the nested document.
#[derive(Copy, Clone)]
enum Location {
    Top,
    Module,
}

const PIPELINE: &[(&str, Location, Validator)] = &[
    ("title", Location::Top, validate_title),
    ("description", Location::Top, validate_description),
    ("url", Location::Top, validate_url),
    ("links", Location::Top, validate_links),
    ("p2pcommons", Location::Top, validate_p2pcommons),
    ("type", Location::Module, validate_type),
    ("subtype", Location::Module, validate_subtype),
    ("main", Location::Module, validate_main),
    ("avatar", Location::Module, validate_avatar),
    ("authors", Location::Module, validate_authors),
    ("parents", Location::Module, validate_parents),
    ("follows", Location::Module, validate_follows),
    ("contents", Location::Module, validate_contents),
];

/// Validates every field of a nested document.
pub fn validate_nested(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    for (_, _, validator) in PIPELINE {
        validator(meta, ctx)?;
    }
    Ok(())
}

/// Validates every field of a flat document.
pub fn validate_flat(flat: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    validate_nested(&unflatten(flat), ctx)
}

/// Validates only the fields present in a nested document.
pub fn validate_partial(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    for (name, location, validator) in PIPELINE {
        let present = match location {
            Location::Top => meta.get(*name).is_some(),
            Location::Module => module_field(meta, name).is_some(),
        };
        if present {
            validator(meta, ctx)?;
        }
    }
    Ok(())
}

/// Validates only the fields present in a flat document.
pub fn validate_partial_flat(
    flat: &Value,
    ctx: &ValidationContext<'_>,
) -> Result<(), ValidationError> {
    validate_partial(&unflatten(flat), ctx)
}

/// Validates a typed record with the full pipeline.
pub fn validate_record(
    record: &ModuleRecord,
    ctx: &ValidationContext<'_>,
) -> Result<(), ValidationError> {
    let value = serde_json::to_value(record).map_err(|e| {
        ValidationError::new(e.to_string(), Code::P2pcommonsType, "p2pcommons")
    })?;
    validate_nested(&value, ctx)
}

fn fail(code: Code, property: &str, description: impl Into<String>) -> Result<(), ValidationError> {
    Err(ValidationError::new(description, code, property))
}

fn p2p(meta: &Value) -> Option<&Map<String, Value>> {
    meta.get("p2pcommons").and_then(Value::as_object)
}

fn module_field<'v>(meta: &'v Value, name: &str) -> Option<&'v Value> {
    p2p(meta).and_then(|m| m.get(name))
}

fn module_type(meta: &Value) -> Option<&str> {
    module_field(meta, "type").and_then(Value::as_str)
}

fn unversioned_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{64}$").expect("static regex"))
}

fn versioned_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{64}\+\d+$").expect("static regex"))
}

fn maybe_versioned_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{64}(\+\d+)?$").expect("static regex"))
}

fn module_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^hyper://[a-f0-9]{64}$").expect("static regex"))
}

fn spec_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https://p2pcommons\.com/specs/module/\d+\.\d+\.\d+$").expect("static regex")
    })
}

fn subtype_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]*$").expect("static regex"))
}

/// Returns true for a non-empty relative path that cannot escape its root.
pub fn is_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return false;
    }
    if path.contains(':') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Returns true if the last path segment starts with a dot.
pub fn is_dotfile(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Validates a module key list and returns its entries.
fn string_array<'v>(value: &'v Value, code: Code, property: &str) -> Result<Vec<&'v str>, ValidationError> {
    let Some(items) = value.as_array() else {
        return Err(ValidationError::new(
            format!("'{}' must be an array", property),
            code,
            property,
        ));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().ok_or_else(|| {
                ValidationError::new(
                    format!("'{}' must only contain strings", property),
                    code,
                    property,
                )
            })
        })
        .collect()
}

/// True if no two entries are the exact same string.
pub fn is_unique<S: AsRef<str>>(items: &[S]) -> bool {
    let set: HashSet<&str> = items.iter().map(AsRef::as_ref).collect();
    set.len() == items.len()
}

/// Title: required string of 1..=300 characters, not only whitespace.
pub fn validate_title(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match meta.get("title") {
        None => fail(Code::TitleRequired, "title", "Title is required"),
        Some(Value::String(title)) => {
            let len = title.chars().count();
            if len == 0 || len > MAX_TITLE_LEN {
                return fail(
                    Code::TitleLength,
                    "title",
                    format!("Title must be between 1 and {} characters long", MAX_TITLE_LEN),
                );
            }
            if title.trim().is_empty() {
                return fail(Code::TitleWhitespace, "title", "Title must not consist of whitespace only");
            }
            Ok(())
        }
        Some(_) => fail(Code::TitleType, "title", "Title must be a string"),
    }
}

/// Description: required string, may be empty.
pub fn validate_description(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match meta.get("description") {
        None => fail(Code::DescriptionRequired, "description", "Description is required"),
        Some(Value::String(_)) => Ok(()),
        Some(_) => fail(Code::DescriptionType, "description", "Description must be a string"),
    }
}

/// Url: required unversioned `hyper://` URL of this very module.
pub fn validate_url(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let url = match meta.get("url") {
        None => return fail(Code::UrlRequired, "url", "Url is required"),
        Some(Value::String(url)) => url,
        Some(_) => return fail(Code::UrlType, "url", "Url must be a string"),
    };
    if !module_url_re().is_match(url) {
        return fail(Code::UrlFormat, "url", "Url must be hyper:// followed by a 64 character hex key");
    }
    if *url != ctx.key.to_url() {
        return fail(Code::UrlKey, "url", "Url must match the module key");
    }
    Ok(())
}

fn single_href<'v>(
    links: &'v Map<String, Value>,
    name: &str,
    required: Code,
    format: Code,
) -> Result<&'v str, ValidationError> {
    let property = format!("links.{}", name);
    let Some(value) = links.get(name) else {
        return Err(ValidationError::new(
            format!("Links must contain a {} entry", name),
            required,
            property,
        ));
    };
    let href = value
        .as_array()
        .filter(|items| items.len() == 1)
        .and_then(|items| items[0].as_object())
        .and_then(|obj| obj.get("href"))
        .and_then(Value::as_str);
    href.ok_or_else(|| {
        ValidationError::new(
            format!("links.{} must be an array with exactly one {{href}} object", name),
            format,
            property,
        )
    })
}

/// Links: one CC0 license link and one module spec link.
pub fn validate_links(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let links = match meta.get("links") {
        None => return fail(Code::LinksRequired, "links", "Links are required"),
        Some(Value::Object(links)) => links,
        Some(_) => return fail(Code::LinksType, "links", "Links must be an object"),
    };
    let license = single_href(
        links,
        "license",
        Code::LinksLicenseRequired,
        Code::LinksLicenseFormat,
    )?;
    if license != LICENSE_HREF {
        return fail(
            Code::LinksLicenseHref,
            "links.license",
            format!("License href must be {}", LICENSE_HREF),
        );
    }
    let spec = single_href(links, "spec", Code::LinksSpecRequired, Code::LinksSpecFormat)?;
    if !spec_url_re().is_match(spec) {
        return fail(
            Code::LinksSpecHref,
            "links.spec",
            "Spec href must be https://p2pcommons.com/specs/module/<semver>",
        );
    }
    Ok(())
}

/// p2pcommons: required object.
pub fn validate_p2pcommons(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match meta.get("p2pcommons") {
        None => fail(Code::P2pcommonsRequired, "p2pcommons", "p2pcommons block is required"),
        Some(Value::Object(_)) => Ok(()),
        Some(_) => fail(Code::P2pcommonsType, "p2pcommons", "p2pcommons must be an object"),
    }
}

/// Type: required, `content` or `profile`.
pub fn validate_type(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match module_field(meta, "type") {
        None => fail(Code::TypeRequired, "type", "Type is required"),
        Some(Value::String(t)) if t == "content" || t == "profile" => Ok(()),
        Some(Value::String(_)) => fail(Code::TypeValue, "type", "Type must be 'content' or 'profile'"),
        Some(_) => fail(Code::TypeType, "type", "Type must be a string"),
    }
}

/// Subtype: required alphanumeric string, may be empty.
pub fn validate_subtype(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match module_field(meta, "subtype") {
        None => fail(Code::SubtypeRequired, "subtype", "Subtype is required"),
        Some(Value::String(s)) if subtype_re().is_match(s) => Ok(()),
        Some(Value::String(_)) => fail(Code::SubtypeFormat, "subtype", "Subtype may only contain letters and digits"),
        Some(_) => fail(Code::SubtypeType, "subtype", "Subtype must be a string"),
    }
}

/// Main: required relative path to an open-format or text file.
///
/// An empty main is accepted at this level; registration requires a file.
pub fn validate_main(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let main = match module_field(meta, "main") {
        None => return fail(Code::MainRequired, "main", "Main is required"),
        Some(Value::String(main)) => main,
        Some(_) => return fail(Code::MainType, "main", "Main must be a string"),
    };
    if main.is_empty() {
        return Ok(());
    }
    if is_dotfile(main) {
        return fail(Code::MainNotDotfile, "main", "Main must not be a dotfile");
    }
    if !is_relative_path(main) {
        return fail(Code::MainRelativePath, "main", "Main must be a relative path");
    }
    let file = ctx.module_dir.map(|dir| dir.join(main));
    if let Some(file) = &file {
        if !file.is_file() {
            return fail(Code::MainExists, "main", format!("Main file '{}' does not exist", main));
        }
    }
    let extension = Path::new(main)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if extension.as_deref().is_some_and(|ext| OPEN_FORMATS.contains(&ext)) {
        return Ok(());
    }
    match &file {
        Some(file) if !looks_like_text(file) => fail(
            Code::MainExtension,
            "main",
            "Main must be an open format or a text file",
        ),
        _ => Ok(()),
    }
}

fn looks_like_text(path: &Path) -> bool {
    let mut buf = Vec::with_capacity(SNIFF_LEN);
    let read = std::fs::File::open(path)
        .and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut buf));
    if read.is_err() {
        return false;
    }
    if buf.contains(&0) {
        return false;
    }
    match std::str::from_utf8(&buf) {
        Ok(_) => true,
        // a multi-byte character cut off by the sniff window
        Err(e) => e.error_len().is_none(),
    }
}

/// Avatar: profile-only relative path, may be empty.
pub fn validate_avatar(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let Some(avatar) = module_field(meta, "avatar") else {
        return Ok(());
    };
    if module_type(meta) != Some("profile") {
        return fail(Code::AvatarModuleType, "avatar", "Avatar is only allowed on profiles");
    }
    match avatar {
        Value::String(a) if a.is_empty() || is_relative_path(a) => Ok(()),
        Value::String(_) => fail(Code::AvatarRelativePath, "avatar", "Avatar must be a relative path"),
        _ => fail(Code::AvatarType, "avatar", "Avatar must be a string"),
    }
}

struct KeyListRule {
    property: &'static str,
    owner: &'static str,
    module_type: Code,
    required: Code,
    type_code: Code,
    unique: Code,
    format: Code,
    pattern: fn() -> &'static Regex,
    format_hint: &'static str,
}

/// Shared checks of the four key-list fields. Returns the entries when the
/// field is present and well formed.
fn check_key_list<'v>(meta: &'v Value, rule: &KeyListRule) -> Result<Option<Vec<&'v str>>, ValidationError> {
    let field = module_field(meta, rule.property);
    let owner_matches = module_type(meta) == Some(rule.owner);
    match field {
        Some(_) if !owner_matches => {
            return Err(ValidationError::new(
                format!("'{}' is only allowed on {} modules", rule.property, rule.owner),
                rule.module_type,
                rule.property,
            ))
        }
        None if owner_matches => {
            return Err(ValidationError::new(
                format!("'{}' is required", rule.property),
                rule.required,
                rule.property,
            ))
        }
        None => return Ok(None),
        Some(_) => {}
    }
    let entries = string_array(field.unwrap_or(&Value::Null), rule.type_code, rule.property)?;
    if !is_unique(&entries) {
        return Err(ValidationError::new(
            format!("'{}' must not contain duplicates", rule.property),
            rule.unique,
            rule.property,
        ));
    }
    if let Some(bad) = entries
        .iter()
        .find(|e| !(rule.pattern)().is_match(e) || e.parse::<VersionedKey>().is_err())
    {
        return Err(ValidationError::new(
            format!("'{}' entry '{}' must be {}", rule.property, bad, rule.format_hint),
            rule.format,
            rule.property,
        ));
    }
    Ok(Some(entries))
}

/// Authors: content-only list of unique unversioned keys.
pub fn validate_authors(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    check_key_list(
        meta,
        &KeyListRule {
            property: "authors",
            owner: "content",
            module_type: Code::AuthorsModuleType,
            required: Code::AuthorsRequired,
            type_code: Code::AuthorsType,
            unique: Code::AuthorsUnique,
            format: Code::AuthorsFormat,
            pattern: unversioned_re,
            format_hint: "an unversioned 64 character hex key",
        },
    )
    .map(|_| ())
}

/// Parents: content-only list of unique versioned keys, never pointing at
/// the current or a future version of the module itself.
pub fn validate_parents(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let entries = check_key_list(
        meta,
        &KeyListRule {
            property: "parents",
            owner: "content",
            module_type: Code::ParentsModuleType,
            required: Code::ParentsRequired,
            type_code: Code::ParentsType,
            unique: Code::ParentsUnique,
            format: Code::ParentsFormat,
            pattern: versioned_re,
            format_hint: "a versioned key (<hex>+<version>)",
        },
    )?;
    let current = ctx.db_version.unwrap_or(0);
    for entry in entries.unwrap_or_default() {
        let Ok(parent) = entry.parse::<VersionedKey>() else {
            return fail(
                Code::ParentsFormat,
                "parents",
                format!("Parent '{}' is not a versioned key", entry),
            );
        };
        if parent.key == ctx.key && parent.version.unwrap_or(u64::MAX) >= current {
            return fail(
                Code::ParentsNoSelfReference,
                "parents",
                format!("Parent '{}' refers to the current or a future version of this module", entry),
            );
        }
    }
    Ok(())
}

/// Follows: profile-only list of unique keys, never the profile itself.
pub fn validate_follows(meta: &Value, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    let entries = check_key_list(
        meta,
        &KeyListRule {
            property: "follows",
            owner: "profile",
            module_type: Code::FollowsModuleType,
            required: Code::FollowsRequired,
            type_code: Code::FollowsType,
            unique: Code::FollowsUnique,
            format: Code::FollowsFormat,
            pattern: maybe_versioned_re,
            format_hint: "a 64 character hex key, optionally versioned",
        },
    )?;
    for entry in entries.unwrap_or_default() {
        if entry.parse::<VersionedKey>().map(|k| k.key) == Ok(ctx.key) {
            return fail(Code::FollowsNoSelfReference, "follows", "A profile cannot follow itself");
        }
    }
    Ok(())
}

/// Contents: profile-only list of unique keys.
pub fn validate_contents(meta: &Value, _ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    check_key_list(
        meta,
        &KeyListRule {
            property: "contents",
            owner: "profile",
            module_type: Code::ContentsModuleType,
            required: Code::ContentsRequired,
            type_code: Code::ContentsType,
            unique: Code::ContentsUnique,
            format: Code::ContentsFormat,
            pattern: maybe_versioned_re,
            format_hint: "a 64 character hex key, optionally versioned",
        },
    )
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const KEY: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const OTHER: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn ctx() -> ValidationContext<'static> {
        ValidationContext::new(HyperKey::from_hex(KEY).unwrap()).with_version(5)
    }

    fn content() -> Value {
        json!({
            "title": "demo",
            "description": "lorem ipsum",
            "url": format!("hyper://{}", KEY),
            "links": {
                "license": [{"href": LICENSE_HREF}],
                "spec": [{"href": "https://p2pcommons.com/specs/module/1.0.0"}]
            },
            "p2pcommons": {"type": "content", "subtype": "", "main": "", "authors": [], "parents": []}
        })
    }

    fn profile() -> Value {
        let mut p = content();
        p["p2pcommons"] = json!({
            "type": "profile", "subtype": "", "main": "", "avatar": "", "follows": [], "contents": []
        });
        p
    }

    fn code_of(meta: &Value) -> Code {
        validate_nested(meta, &ctx()).unwrap_err().code
    }

    #[test]
    fn test_valid_documents() {
        validate_nested(&content(), &ctx()).unwrap();
        validate_nested(&profile(), &ctx()).unwrap();
    }

    #[test]
    fn test_title_boundaries() {
        let mut m = content();
        m["title"] = json!("a".repeat(300));
        validate_nested(&m, &ctx()).unwrap();
        m["title"] = json!("a".repeat(301));
        assert_eq!(code_of(&m), Code::TitleLength);
        m["title"] = json!("");
        assert_eq!(code_of(&m), Code::TitleLength);
        m["title"] = json!("   \t ");
        assert_eq!(code_of(&m), Code::TitleWhitespace);
        m["title"] = json!(42);
        assert_eq!(code_of(&m), Code::TitleType);
        m.as_object_mut().unwrap().remove("title");
        assert_eq!(code_of(&m), Code::TitleRequired);
    }

    #[test]
    fn test_description_may_be_empty() {
        let mut m = content();
        m["description"] = json!("");
        validate_nested(&m, &ctx()).unwrap();
        m["description"] = json!(null);
        assert_eq!(code_of(&m), Code::DescriptionType);
    }

    #[test]
    fn test_url_rules() {
        let mut m = content();
        m["url"] = json!(format!("hyper://{}+3", KEY));
        assert_eq!(code_of(&m), Code::UrlFormat);
        m["url"] = json!(format!("hyper://{}", OTHER));
        assert_eq!(code_of(&m), Code::UrlKey);
    }

    #[test]
    fn test_links_rules() {
        let mut m = content();
        m["links"]["license"] = json!([{"href": "https://example.com"}]);
        assert_eq!(code_of(&m), Code::LinksLicenseHref);
        m["links"]["license"] = json!([{"href": LICENSE_HREF}, {"href": LICENSE_HREF}]);
        assert_eq!(code_of(&m), Code::LinksLicenseFormat);
        m["links"]["license"] = json!([{"href": LICENSE_HREF}]);
        m["links"]["spec"] = json!([{"href": "https://p2pcommons.com/specs/module/1.0"}]);
        assert_eq!(code_of(&m), Code::LinksSpecHref);
        m["links"].as_object_mut().unwrap().remove("spec");
        assert_eq!(code_of(&m), Code::LinksSpecRequired);
    }

    #[test]
    fn test_type_and_subtype() {
        let mut m = content();
        m["p2pcommons"]["type"] = json!("article");
        assert_eq!(code_of(&m), Code::TypeValue);
        let mut m = content();
        m["p2pcommons"]["subtype"] = json!("Q-1");
        assert_eq!(code_of(&m), Code::SubtypeFormat);
        m["p2pcommons"]["subtype"] = json!("Q1");
        validate_nested(&m, &ctx()).unwrap();
    }

    #[test]
    fn test_main_path_rules() {
        let mut m = content();
        m["p2pcommons"]["main"] = json!(".hidden.md");
        assert_eq!(code_of(&m), Code::MainNotDotfile);
        m["p2pcommons"]["main"] = json!("/etc/passwd.txt");
        assert_eq!(code_of(&m), Code::MainRelativePath);
        m["p2pcommons"]["main"] = json!("../up.txt");
        assert_eq!(code_of(&m), Code::MainRelativePath);
        m["p2pcommons"]["main"] = json!("docs/paper.md");
        validate_nested(&m, &ctx()).unwrap();
    }

    #[test]
    fn test_main_checked_on_disk() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx().with_module_dir(dir.path());
        let mut m = content();
        m["p2pcommons"]["main"] = json!("paper.md");
        assert_eq!(validate_nested(&m, &ctx).unwrap_err().code, Code::MainExists);
        std::fs::write(dir.path().join("paper.md"), "# hi").unwrap();
        validate_nested(&m, &ctx).unwrap();

        std::fs::write(dir.path().join("notes.weird"), "plain text").unwrap();
        m["p2pcommons"]["main"] = json!("notes.weird");
        validate_nested(&m, &ctx).unwrap();

        std::fs::write(dir.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
        m["p2pcommons"]["main"] = json!("blob.bin");
        assert_eq!(validate_nested(&m, &ctx).unwrap_err().code, Code::MainExtension);
    }

    #[test]
    fn test_module_type_restrictions() {
        let mut m = content();
        m["p2pcommons"]["avatar"] = json!("me.png");
        assert_eq!(code_of(&m), Code::AvatarModuleType);
        let mut m = content();
        m["p2pcommons"]["follows"] = json!([]);
        assert_eq!(code_of(&m), Code::FollowsModuleType);
        let mut m = profile();
        m["p2pcommons"]["authors"] = json!([]);
        assert_eq!(code_of(&m), Code::AuthorsModuleType);
        let mut m = content();
        m["p2pcommons"].as_object_mut().unwrap().remove("authors");
        assert_eq!(code_of(&m), Code::AuthorsRequired);
    }

    #[test]
    fn test_uniqueness_ignores_version_differences() {
        let mut m = profile();
        m["p2pcommons"]["contents"] = json!([format!("{}+1", OTHER), format!("{}+2", OTHER)]);
        validate_nested(&m, &ctx()).unwrap();
        m["p2pcommons"]["contents"] = json!([format!("{}+1", OTHER), format!("{}+1", OTHER)]);
        assert_eq!(code_of(&m), Code::ContentsUnique);

        let mut m = content();
        m["p2pcommons"]["authors"] = json!([OTHER, OTHER]);
        assert_eq!(code_of(&m), Code::AuthorsUnique);
    }

    #[test]
    fn test_formats() {
        let mut m = content();
        m["p2pcommons"]["authors"] = json!([format!("{}+1", OTHER)]);
        assert_eq!(code_of(&m), Code::AuthorsFormat);
        let mut m = content();
        m["p2pcommons"]["parents"] = json!([OTHER]);
        assert_eq!(code_of(&m), Code::ParentsFormat);
        let mut m = content();
        m["p2pcommons"]["parents"] = json!("nope");
        assert_eq!(code_of(&m), Code::ParentsType);
    }

    #[test]
    fn test_version_overflow_is_a_format_error() {
        let huge = "99999999999999999999999";
        let mut m = content();
        m["p2pcommons"]["parents"] = json!([format!("{}+{}", KEY, huge)]);
        assert_eq!(code_of(&m), Code::ParentsFormat);
        m["p2pcommons"]["parents"] = json!([format!("{}+{}", OTHER, huge)]);
        assert_eq!(code_of(&m), Code::ParentsFormat);
        let mut m = profile();
        m["p2pcommons"]["follows"] = json!([format!("{}+{}", OTHER, huge)]);
        assert_eq!(code_of(&m), Code::FollowsFormat);
        let mut m = profile();
        m["p2pcommons"]["contents"] = json!([format!("{}+{}", OTHER, huge)]);
        assert_eq!(code_of(&m), Code::ContentsFormat);
    }

    #[test]
    fn test_parent_self_reference() {
        let mut m = content();
        m["p2pcommons"]["parents"] = json!([format!("{}+4", KEY)]);
        validate_nested(&m, &ctx()).unwrap();
        m["p2pcommons"]["parents"] = json!([format!("{}+5", KEY)]);
        assert_eq!(code_of(&m), Code::ParentsNoSelfReference);
        m["p2pcommons"]["parents"] = json!([format!("{}+9", KEY)]);
        assert_eq!(code_of(&m), Code::ParentsNoSelfReference);
    }

    #[test]
    fn test_follows_self_reference() {
        let mut m = profile();
        m["p2pcommons"]["follows"] = json!([KEY]);
        assert_eq!(code_of(&m), Code::FollowsNoSelfReference);
        m["p2pcommons"]["follows"] = json!([format!("{}+2", KEY)]);
        assert_eq!(code_of(&m), Code::FollowsNoSelfReference);
        m["p2pcommons"]["follows"] = json!([OTHER]);
        validate_nested(&m, &ctx()).unwrap();
    }

    #[test]
    fn test_partial_skips_missing_fields() {
        let partial = json!({"title": "ok", "p2pcommons": {"type": "profile"}});
        validate_partial(&partial, &ctx()).unwrap();
        assert_eq!(
            validate_nested(&partial, &ctx()).unwrap_err().code,
            Code::DescriptionRequired
        );
        let partial = json!({"p2pcommons": {"type": "content", "follows": []}});
        assert_eq!(
            validate_partial(&partial, &ctx()).unwrap_err().code,
            Code::FollowsModuleType
        );
    }

    #[test]
    fn test_flat_entry_point() {
        let flat = crate::normalize::flatten(&content());
        validate_flat(&flat, &ctx()).unwrap();
        validate_partial_flat(&json!({"type": "content", "authors": [OTHER]}), &ctx()).unwrap();
    }

    #[test]
    fn test_first_failure_wins() {
        let mut m = content();
        m["title"] = json!("");
        m["description"] = json!(1);
        assert_eq!(code_of(&m), Code::TitleLength);
    }
}
