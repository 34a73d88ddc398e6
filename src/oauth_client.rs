//! Performs authorization-code and refresh-token grants against a
//! provider's token endpoint (4.C in the design doc). Grounded in
//! `examples/original_source/oauth2imap/oauth2.py`'s `get_access_token`
//! (same silent-refresh-then-fail shape), translated onto the
//! `token-endpoint` + form-POST model spec.md §4.C actually specifies.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local};
use log::debug;
use serde::Deserialize;

use crate::provider::Provider;
use crate::token::Token;
use crate::token_cache::{self, TokenCache};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// `POST`s `params` as `application/x-www-form-urlencoded` to
/// `provider.token-endpoint` and parses the JSON result into a [`Token`].
pub fn exchange(provider: &Provider, params: &BTreeMap<String, String>) -> Result<Token> {
    let endpoint = provider.require("token-endpoint")?;

    let response = reqwest::blocking::Client::new()
        .post(endpoint)
        .form(params)
        .send()
        .with_context(|| format!("POST {endpoint}"))?;

    let body = response
        .text()
        .context("reading token endpoint response body")?;

    let parsed: TokenResponse = serde_json::from_str(&body)
        .with_context(|| format!("parsing token endpoint response: {body}"))?;

    if let Some(message) = parsed.error_description.or(parsed.error) {
        bail!("{message}");
    }

    let (Some(access_token), Some(expires_in)) = (parsed.access_token, parsed.expires_in) else {
        bail!("unable to refresh token");
    };

    Ok(Token {
        access_token,
        access_token_expiration: Local::now().naive_local() + Duration::seconds(expires_in),
        refresh_token: parsed.refresh_token.unwrap_or_default(),
    })
}

/// Refreshes `token` against `provider`. Fails fast when there is no
/// refresh token to spend (spec.md §8 boundary behaviour).
pub fn refresh(provider: &Provider, token: &Token) -> Result<Token> {
    if token.refresh_token.is_empty() {
        bail!("token has no refresh_token to exchange");
    }

    let mut params = BTreeMap::new();
    params.insert(
        "client_id".to_string(),
        provider.require("client-id")?.to_string(),
    );
    params.insert("refresh_token".to_string(), token.refresh_token.clone());
    params.insert("grant_type".to_string(), "refresh_token".to_string());
    if let Some(tenant) = provider.get("tenant") {
        params.insert("tenant".to_string(), tenant.to_string());
    }

    exchange(provider, &params)
}

/// Looks up the cached token for `provider`, refreshing (and writing back)
/// when it has expired. Unlike the reference Python implementation, a
/// successful refresh here *is* persisted — see SPEC_FULL.md §9 decision 1.
pub fn obtain_access_token(provider: &Provider, tokens_file: &Path) -> Result<String> {
    let key = token_cache::token_key(provider);
    let mut cache: TokenCache = token_cache::load(tokens_file)?;

    let cached = cache
        .get(&key)
        .cloned()
        .with_context(|| format!("no cached token for key {key}; run the auth bootstrap first"))?;

    if cached.is_valid() {
        return Ok(cached.access_token);
    }

    debug!("cached token {key} has expired, attempting refresh");
    let refreshed = refresh(provider, &cached).context("refreshing expired access token")?;

    cache.insert(key, refreshed.clone());
    token_cache::save(tokens_file, &cache).context("writing back refreshed token")?;

    Ok(refreshed.access_token)
}
