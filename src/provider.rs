//! Static catalog of known OAuth2 providers (4.A in the design doc), merged
//! with user overrides and template-substituted into a concrete [`Provider`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Result, anyhow};

/// A resolved or unresolved provider: a flat string-to-string map. Keeping
/// this as a map rather than a struct lets config overrides reach any key,
/// including ones this crate doesn't interpret directly (e.g. `scope`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider(BTreeMap<String, String>);

impl Provider {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow!("provider is missing required key `{key}`"))
    }
}

fn defaults(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn registry() -> &'static BTreeMap<&'static str, BTreeMap<String, String>> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, BTreeMap<String, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m = BTreeMap::new();

        m.insert(
            "google",
            defaults(&[
                ("sasl-method", "OAUTHBEARER"),
                ("imap-endpoint", "imap.gmail.com"),
                ("authority", "https://accounts.google.com/o/oauth2"),
                ("authorize-endpoint", "${authority}/auth"),
                ("token-endpoint", "${authority}/token"),
                ("redirect-uri", "urn:ietf:wg:oauth:2.0:oob"),
                ("scope", "https://mail.google.com/"),
            ]),
        );

        m.insert(
            "microsoft",
            defaults(&[
                ("sasl-method", "XOAUTH2"),
                ("imap-endpoint", "outlook.office365.com"),
                ("tenant", "common"),
                ("authority", "https://login.microsoftonline.com/${tenant}"),
                (
                    "authorize-endpoint",
                    "${authority}/oauth2/v2.0/authorize",
                ),
                ("token-endpoint", "${authority}/oauth2/v2.0/token"),
                (
                    "redirect-uri",
                    "https://login.microsoftonline.com/common/oauth2/nativeclient",
                ),
                (
                    "scope",
                    "https://outlook.office365.com/.default offline_access",
                ),
            ]),
        );

        m
    })
}

/// Looks up a provider's static defaults, unresolved (placeholders intact).
pub fn lookup(name: &str) -> Option<Provider> {
    registry().get(name).cloned().map(Provider)
}

/// Builds a fresh, resolved [`Provider`] from the static registry merged
/// with `overrides` (typically the `[upstream]` table from the config
/// file, minus the `provider` selector key itself), then template
/// substitutes every value to a fixed point against the merged table, so
/// that chained placeholders (e.g. `authorize-endpoint` referencing
/// `${authority}`, which itself references `${tenant}`) expand fully.
pub fn resolve(name: &str, overrides: &BTreeMap<String, String>) -> Result<Provider> {
    let mut merged = registry()
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("unknown upstream provider `{name}`"))?;

    for (key, value) in overrides {
        if key == "provider" {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }

    // Re-substitute against the table's own latest values until nothing
    // changes, bounded by the number of keys (the longest possible chain
    // of placeholder references). A key whose expansion never stabilizes
    // (a placeholder cycle) is left as-is after the bound is reached.
    for _ in 0..merged.len().max(1) {
        let mut changed = false;
        let next: BTreeMap<String, String> = merged
            .iter()
            .map(|(k, v)| {
                let substituted = substitute(v, &merged);
                if &substituted != v {
                    changed = true;
                }
                (k.clone(), substituted)
            })
            .collect();
        merged = next;
        if !changed {
            break;
        }
    }

    Ok(Provider(merged))
}

/// Single-pass `${name}` substitution: each placeholder is replaced by the
/// matching key's *current* (possibly still-templated) value in `table`;
/// a placeholder whose key is absent is left as the literal text.
fn substitute(value: &str, table: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match table.get(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_resolves_authority_placeholders() {
        let provider = resolve("google", &BTreeMap::new()).unwrap();
        assert_eq!(
            provider.get("authorize-endpoint"),
            Some("https://accounts.google.com/o/oauth2/auth")
        );
        assert_eq!(provider.get("sasl-method"), Some("OAUTHBEARER"));
    }

    #[test]
    fn microsoft_tenant_override_reflows_into_authority() {
        let mut overrides = BTreeMap::new();
        overrides.insert("tenant".to_string(), "contoso".to_string());

        let provider = resolve("microsoft", &overrides).unwrap();
        assert_eq!(
            provider.get("authority"),
            Some("https://login.microsoftonline.com/contoso")
        );
        assert_eq!(
            provider.get("authorize-endpoint"),
            Some("https://login.microsoftonline.com/contoso/oauth2/v2.0/authorize")
        );
        assert_eq!(
            provider.get("token-endpoint"),
            Some("https://login.microsoftonline.com/contoso/oauth2/v2.0/token")
        );
    }

    #[test]
    fn microsoft_default_tenant_fully_expands_chained_placeholders() {
        // `authorize-endpoint` references `${authority}`, which itself
        // references `${tenant}` — both levels must resolve even with no
        // config override at all.
        let provider = resolve("microsoft", &BTreeMap::new()).unwrap();
        assert_eq!(
            provider.get("authority"),
            Some("https://login.microsoftonline.com/common")
        );
        assert_eq!(
            provider.get("authorize-endpoint"),
            Some("https://login.microsoftonline.com/common/oauth2/v2.0/authorize")
        );
        assert_eq!(
            provider.get("token-endpoint"),
            Some("https://login.microsoftonline.com/common/oauth2/v2.0/token")
        );
    }

    #[test]
    fn unknown_provider_fails() {
        assert!(resolve("yahoo", &BTreeMap::new()).is_err());
    }

    #[test]
    fn missing_placeholder_is_left_literal() {
        let mut table = BTreeMap::new();
        table.insert("x".to_string(), "${y}".to_string());
        assert_eq!(substitute("${y}", &table), "${y}");
    }

    #[test]
    fn template_idempotence_on_plain_values() {
        let mut table = BTreeMap::new();
        table.insert("x".to_string(), "plain-value".to_string());
        assert_eq!(substitute("plain-value", &table), "plain-value");
    }
}
