//! Module URL parsing.
//!
//! Accepts bare hex keys, `hyper://<key>[+<version>]`, and the legacy
//! `dat://` / `http(s)://<base32-subdomain>.<domain>` forms. Parsing is total:
//! anything unrecognised yields a [`ParsedUrl`] with `None` fields.

use crate::types::{is_lower_hex, HyperKey, VersionedKey, KEY_HEX_LEN};

/// Length of a base32-encoded 32-byte key.
const BASE32_KEY_LEN: usize = 52;

const KNOWN_SCHEMES: [&str; 4] = ["hyper://", "dat://", "https://", "http://"];

/// Result of parsing a module URL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Hex module key, when one could be recovered.
    pub host: Option<String>,
    /// Version suffix, when present and numeric.
    pub version: Option<u64>,
    /// The hostname exactly as it appeared in the input.
    pub key: Option<String>,
}

impl ParsedUrl {
    /// Converts to a typed reference, if the host is a valid key.
    pub fn versioned_key(&self) -> Option<VersionedKey> {
        let key = HyperKey::from_hex(self.host.as_deref()?)?;
        Some(VersionedKey {
            key,
            version: self.version,
        })
    }
}

/// Parses any accepted module URL form. Never fails.
pub fn parse(input: &str) -> ParsedUrl {
    let input = input.trim();
    let lowered = input.to_ascii_lowercase();
    let (scheme, rest) = match KNOWN_SCHEMES
        .iter()
        .find(|s| lowered.starts_with(*s))
    {
        Some(s) => (*s, &input[s.len()..]),
        None if input.contains("://") => return ParsedUrl::default(),
        None => ("hyper://", input),
    };

    let hostname = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    if hostname.is_empty() {
        return ParsedUrl::default();
    }

    let (raw_host, version) = match hostname.split_once('+') {
        Some((h, v)) => (h, v.parse::<u64>().ok()),
        None => (hostname, None),
    };

    // http(s) links address modules through a `<key>.<gateway>` subdomain
    let label = if scheme.starts_with("http") {
        raw_host.split('.').next().unwrap_or_default()
    } else {
        raw_host
    };
    let label = label.to_ascii_lowercase();

    let host = if label.len() == KEY_HEX_LEN && is_lower_hex(&label) {
        Some(label)
    } else if label.len() == BASE32_KEY_LEN {
        base32_decode(&label).map(hex::encode)
    } else {
        None
    };

    ParsedUrl {
        host,
        version,
        key: Some(hostname.to_string()),
    }
}

/// Parses a URL into a typed reference.
pub fn parse_key(input: &str) -> Option<VersionedKey> {
    parse(input).versioned_key()
}

/// Normalises any accepted form to `hyper://<hex>[+<version>]`.
pub fn normalize(input: &str) -> Option<String> {
    parse_key(input).map(|k| k.to_url())
}

// RFC 4648 alphabet, lowercase, unpadded
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for c in s.bytes() {
        let value = match c {
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u32::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    if out.len() == 32 {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "8af39eb4ba1d3a9c7a1ff5d1e8d6c6f4fe4a7b6cfb5c5b9e1c1e5f0d2a3b4c5d";

    fn base32_encode(bytes: &[u8]) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
        let mut out = String::new();
        let mut buffer: u32 = 0;
        let mut bits = 0;
        for &b in bytes {
            buffer = (buffer << 8) | u32::from(b);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((buffer >> bits) & 31) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
        }
        out
    }

    #[test]
    fn test_bare_hex() {
        let parsed = parse(HEX);
        assert_eq!(parsed.host.as_deref(), Some(HEX));
        assert_eq!(parsed.version, None);
        assert_eq!(parsed.key.as_deref(), Some(HEX));
    }

    #[test]
    fn test_hyper_with_version_and_path() {
        let parsed = parse(&format!("hyper://{}+5/index.json", HEX));
        assert_eq!(parsed.host.as_deref(), Some(HEX));
        assert_eq!(parsed.version, Some(5));
        assert_eq!(parsed.key, Some(format!("{}+5", HEX)));
    }

    #[test]
    fn test_legacy_dat_scheme() {
        let parsed = parse(&format!("dat://{}", HEX));
        assert_eq!(parsed.host.as_deref(), Some(HEX));
    }

    #[test]
    fn test_base32_subdomain() {
        let bytes = hex::decode(HEX).unwrap();
        let encoded = base32_encode(&bytes);
        assert_eq!(encoded.len(), 52);
        let parsed = parse(&format!("https://{}.gateway.example/", encoded));
        assert_eq!(parsed.host.as_deref(), Some(HEX));
    }

    #[test]
    fn test_garbage_is_all_none() {
        assert_eq!(parse(""), ParsedUrl::default());
        assert_eq!(parse("ftp://something"), ParsedUrl::default());
        let parsed = parse("not a key");
        assert_eq!(parsed.host, None);
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_non_numeric_version_is_dropped() {
        let parsed = parse(&format!("hyper://{}+abc", HEX));
        assert_eq!(parsed.host.as_deref(), Some(HEX));
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(&format!("{}+3", HEX)),
            Some(format!("hyper://{}+3", HEX))
        );
        assert_eq!(normalize("zzz"), None);
    }
}
