//! Persistent, process-shared cache of [`Token`]s, keyed by provider/user
//! identity (4.B in the design doc).

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use sha2::{Digest, Sha256};

use crate::provider::Provider;
use crate::token::Token;

/// `BTreeMap` keeps keys sorted for free, matching the "pretty-printed JSON
/// with sorted keys" requirement without an extra sort pass on save.
pub type TokenCache = BTreeMap<String, Token>;

/// `serde_json::to_string_pretty` hardcodes a 2-space indent; spec.md §4.B
/// and §6 require 4-space indentation for the on-disk cache, so this
/// drives the serializer with an explicit 4-space `PrettyFormatter`.
fn to_pretty_json(cache: &TokenCache) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = Serializer::with_formatter(&mut buf, formatter);
    cache.serialize(&mut ser).context("serializing token cache as JSON")?;
    String::from_utf8(buf).context("token cache JSON was not valid UTF-8")
}

/// Reads the cache file at `path`. A missing or empty file is an empty
/// cache, not an error.
pub fn load(path: &Path) -> Result<TokenCache> {
    if !path.exists() {
        return Ok(TokenCache::new());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading token cache {}", path.display()))?;

    if contents.trim().is_empty() {
        return Ok(TokenCache::new());
    }

    serde_json::from_str(&contents)
        .with_context(|| format!("parsing token cache {}", path.display()))
}

/// Rewrites the cache file, 4-space indented with sorted keys, holding an
/// exclusive advisory lock across the write so sibling processes (forked
/// sessions, the `auth` bootstrap) never observe a torn write.
pub fn save(path: &Path, cache: &TokenCache) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening token cache {} for write", path.display()))?;

    file.lock_exclusive()
        .context("acquiring exclusive lock on token cache")?;

    let json = to_pretty_json(cache).context("serializing token cache")?;

    let result = (|| -> Result<()> {
        file.set_len(0)?;
        (&file).seek(SeekFrom::Start(0))?;
        (&file).write_all(json.as_bytes())?;
        (&file).write_all(b"\n")?;
        Ok(())
    })();

    FileExt::unlock(&file).context("releasing lock on token cache")?;
    result
}

/// Stable identifier for the provider/user combination this token belongs
/// to: SHA-256 of the five named fields joined by spaces, skipping any
/// that are absent. Depends on nothing else in the `Provider`.
pub fn token_key(provider: &Provider) -> String {
    const FIELDS: [&str; 5] = [
        "authorize-endpoint",
        "tenant",
        "client-secret",
        "client-id",
        "username",
    ];

    let joined = FIELDS
        .iter()
        .filter_map(|field| provider.get(field))
        .collect::<Vec<_>>()
        .join(" ");

    let digest = Sha256::digest(joined.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
