//! Builds the SASL initial response sent upstream after `AUTHENTICATE`
//! (4.D in the design doc). Represented as a tagged variant rather than a
//! string comparison so the binder is a total function — see SPEC_FULL.md
//! §4.F's Design Note.

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMethod {
    XOAuth2,
    OAuthBearer,
}

impl SaslMethod {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "XOAUTH2" => Ok(Self::XOAuth2),
            "OAUTHBEARER" => Ok(Self::OAuthBearer),
            other => Err(anyhow!("unsupported sasl-method `{other}`")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::XOAuth2 => "XOAUTH2",
            Self::OAuthBearer => "OAUTHBEARER",
        }
    }
}

/// Builds the SASL initial response bytes carrying the bearer token.
pub fn build_initial_response(method: SaslMethod, user: &str, host: &str, token: &str) -> Vec<u8> {
    match method {
        SaslMethod::XOAuth2 => format!("user={user}\x01auth=Bearer {token}\x01\x01").into_bytes(),
        SaslMethod::OAuthBearer => {
            format!("n,a={user},\x01host={host}\x01port=993\x01auth=Bearer {token}\x01\x01")
                .into_bytes()
        }
    }
}
