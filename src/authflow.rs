//! The authorization front-end (4.G item 3): PKCE authorization-code
//! bootstrap that populates the token store. Grounded in
//! `examples/original_source/oauth2imap/_token.py` (`HTTPRequestHandler`,
//! `get_localhost_authcode`, `get_available_port`, `main`) and in the
//! teacher's `src/auth/oauth.rs::perform_pkce_flow`, which already wires
//! `oauth2`'s PKCE helpers to a `tiny_http` loopback capture.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::info;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope};
use tiny_http::{Response, Server};
use url::Url;

use crate::oauth_client;
use crate::provider::Provider;
use crate::token_cache;

/// Isolates *how* the authorization code is captured from the rest of the
/// bootstrap flow, per spec.md §9's Design Note.
pub trait AuthCodeSource {
    fn get(&self, authorize_url: &Url) -> Result<String>;
}

/// Prompts the user to paste the code back from the browser's address bar.
pub struct StdinPasteSource;

impl AuthCodeSource for StdinPasteSource {
    fn get(&self, authorize_url: &Url) -> Result<String> {
        println!("Visit this URL to authorize the application:\n{authorize_url}");
        print!(
            "Enter the code from the redirect (it may be in the browser's address bar): "
        );
        io::stdout().flush().ok();

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let code = line.trim().to_string();
        if code.is_empty() {
            return Err(anyhow!("did not obtain an authcode"));
        }
        Ok(code)
    }
}

/// Runs a one-shot HTTP server on an ephemeral loopback port and reads the
/// `code` query parameter off the provider's redirect.
pub struct LoopbackHttpSource {
    port: u16,
}

impl LoopbackHttpSource {
    /// Picks an available loopback port without holding the listener open,
    /// mirroring `_token.py`'s `get_available_port`.
    pub fn bind() -> Result<Self> {
        let listener =
            TcpListener::bind(("127.0.0.1", 0)).context("finding an available loopback port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(Self { port })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

impl AuthCodeSource for LoopbackHttpSource {
    fn get(&self, authorize_url: &Url) -> Result<String> {
        println!("URL: {authorize_url}");
        println!("Visit the displayed URL to authorize this application. Waiting...");
        let _ = open::that(authorize_url.as_str());

        let addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        let server =
            Server::http(addr).map_err(|e| anyhow!("binding loopback HTTP server: {e}"))?;

        let request = server
            .recv()
            .context("waiting for the authorization redirect")?;

        let full = format!("http://127.0.0.1:{}{}", self.port, request.url());
        let parsed = Url::parse(&full).context("parsing the redirect URL")?;
        let code = parsed
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.into_owned());

        let _ = request.respond(Response::from_string(
            "<html><head><title>Authorization result</title></head><body><p>Authorization \
             redirect completed. You may close this window.</p></body></html>",
        ));

        code.ok_or_else(|| anyhow!("did not obtain an authcode"))
    }
}

/// Runs the full PKCE bootstrap against `provider` and writes the
/// resulting token into the cache at `tokens_file` under its token key.
pub fn run(provider: &Provider, tokens_file: &Path, source: &dyn AuthCodeSource) -> Result<()> {
    let redirect_uri = provider.require("redirect-uri")?.to_string();

    // Reuses the teacher's own `oauth2::basic::BasicClient` call chain
    // (`authorize_url().add_scope().set_pkce_challenge().url()`) to build
    // the `code_challenge`/`code_challenge_method`/`response_type` query
    // parameters, then layers on `login_hint`/`tenant`, which the oauth2
    // crate's authorize_url builder has no first-class support for.
    let client_id = ClientId::new(provider.require("client-id")?.to_string());
    let auth_url = AuthUrl::new(provider.require("authorize-endpoint")?.to_string())
        .context("parsing authorize-endpoint")?;
    let client = BasicClient::new(client_id, None, auth_url, None)
        .set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (mut authorize_url, _csrf_token) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new(provider.require("scope")?.to_string()))
        .set_pkce_challenge(pkce_challenge)
        .url();

    authorize_url
        .query_pairs_mut()
        .append_pair("login_hint", provider.require("username")?);
    if let Some(tenant) = provider.get("tenant") {
        authorize_url.query_pairs_mut().append_pair("tenant", tenant);
    }

    let authcode = source.get(&authorize_url)?;

    let mut exchange_params = BTreeMap::new();
    exchange_params.insert("grant_type".to_string(), "authorization_code".to_string());
    exchange_params.insert("client_id".to_string(), provider.require("client-id")?.to_string());
    exchange_params.insert(
        "client_secret".to_string(),
        provider.require("client-secret")?.to_string(),
    );
    exchange_params.insert("code".to_string(), authcode);
    exchange_params.insert("code_verifier".to_string(), pkce_verifier.secret().to_string());
    exchange_params.insert("redirect_uri".to_string(), redirect_uri);
    if let Some(tenant) = provider.get("tenant") {
        exchange_params.insert("tenant".to_string(), tenant.to_string());
    }

    let token = oauth_client::exchange(provider, &exchange_params)
        .context("exchanging authorization code for a token")?;

    let key = token_cache::token_key(provider);
    let mut cache = token_cache::load(tokens_file)?;
    cache.insert(key, token);
    token_cache::save(tokens_file, &cache)?;

    info!("token stored for this provider/user");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_source_binds_to_a_usable_port() {
        let source = LoopbackHttpSource::bind().unwrap();
        assert!(source.port > 0);
        assert!(source.redirect_uri().starts_with("http://127.0.0.1:"));
    }

    #[test]
    fn authorize_url_carries_required_params() {
        let provider = crate::provider::resolve("google", &BTreeMap::new()).unwrap();
        let mut url = Url::parse(provider.require("authorize-endpoint").unwrap()).unwrap();
        url.query_pairs_mut()
            .append_pair("client_id", "abc")
            .append_pair("response_type", "code");
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("client_id"), Some(&"abc".to_string()));
        assert_eq!(pairs.get("response_type"), Some(&"code".to_string()));
    }
}
