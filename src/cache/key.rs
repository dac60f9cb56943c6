//! Cache key generation.
//!
//! Keys are SHA-256 digests over a canonical, type-preserving byte encoding of
//! the generator fingerprint, the method, and the selected input fields in
//! caller order. Every string and container is length-prefixed, so no two
//! distinct inputs share an encoding.

use crate::types::{Method, Request};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

const KEY_DOMAIN: &[u8] = b"dgt-lm/cache-key/v1";
const FINGERPRINT_DOMAIN: &[u8] = b"dgt-lm/fingerprint/v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Digest of everything in a generator's configuration that can change its
/// output for identical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratorFingerprint(String);

impl GeneratorFingerprint {
    pub fn from_config(config: &Value) -> Result<Self> {
        let mut buf = Vec::with_capacity(128);
        encode_value(config, "fingerprint", &mut buf)?;
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&buf);
        Ok(Self(hex(&hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GeneratorFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds cache keys for one generator fingerprint.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    fingerprint: GeneratorFingerprint,
}

impl KeyBuilder {
    pub fn new(fingerprint: GeneratorFingerprint) -> Self {
        Self { fingerprint }
    }

    pub fn fingerprint(&self) -> &GeneratorFingerprint {
        &self.fingerprint
    }

    pub fn build_key<S: AsRef<str>>(
        &self,
        method: Method,
        field_names: &[S],
        request: &Request,
    ) -> Result<CacheKey> {
        build_key(&self.fingerprint, method, field_names, request)
    }
}

/// Derive the key for `request` from the named fields, read in the given order.
pub fn build_key<S: AsRef<str>>(
    fingerprint: &GeneratorFingerprint,
    method: Method,
    field_names: &[S],
    request: &Request,
) -> Result<CacheKey> {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hash_str(&mut hasher, fingerprint.as_str());
    hash_str(&mut hasher, method.as_str());
    hasher.update((field_names.len() as u64).to_be_bytes());

    let mut buf = Vec::with_capacity(256);
    for name in field_names {
        let name = name.as_ref();
        let value = request.field(name).ok_or_else(|| {
            Error::key_encoding_with_context(
                format!("request {} has no field '{}'", request.id(), name),
                ErrorContext::new()
                    .with_field_path(format!("request.fields.{}", name))
                    .with_source("key_builder"),
            )
        })?;
        buf.clear();
        encode_value(value, name, &mut buf)?;
        hash_str(&mut hasher, name);
        hasher.update((buf.len() as u64).to_be_bytes());
        hasher.update(&buf);
    }
    Ok(CacheKey::new(hex(&hasher.finalize())))
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

/// Canonical encoding of a JSON value. Object keys are sorted bytewise so the
/// map's own iteration order never leaks into the key.
fn encode_value(value: &Value, path: &str, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(true) => out.push(b'T'),
        Value::Bool(false) => out.push(b'F'),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push(b'i');
                out.extend_from_slice(&i.to_be_bytes());
            } else if let Some(u) = n.as_u64() {
                out.push(b'u');
                out.extend_from_slice(&u.to_be_bytes());
            } else {
                let f = n.as_f64().filter(|f| f.is_finite()).ok_or_else(|| {
                    Error::key_encoding_with_context(
                        format!("number {} has no canonical encoding", n),
                        ErrorContext::new()
                            .with_field_path(path.to_string())
                            .with_source("key_builder"),
                    )
                })?;
                // -0.0 and 0.0 are the same value
                let f = if f == 0.0 { 0.0 } else { f };
                out.push(b'd');
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
        }
        Value::String(s) => {
            out.push(b's');
            push_len(out, s.len());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'a');
            push_len(out, items.len());
            for (i, item) in items.iter().enumerate() {
                encode_value(item, &format!("{}[{}]", path, i), out)?;
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'o');
            push_len(out, entries.len());
            for (k, v) in entries {
                push_len(out, k.len());
                out.extend_from_slice(k.as_bytes());
                encode_value(v, &format!("{}.{}", path, k), out)?;
            }
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
