//! The `Token` shape persisted in the [`crate::token_cache`] (3. DATA MODEL).

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub access_token_expiration: NaiveDateTime,
    #[serde(default)]
    pub refresh_token: String,
}

impl Token {
    /// A token is valid iff its expiration is strictly in the future,
    /// compared against local (not UTC) time — see SPEC_FULL.md §9.2.
    pub fn is_valid(&self) -> bool {
        self.access_token_expiration > Local::now().naive_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_expiring_in(seconds: i64) -> Token {
        Token {
            access_token: "A".to_string(),
            access_token_expiration: Local::now().naive_local() + Duration::seconds(seconds),
            refresh_token: "R".to_string(),
        }
    }

    #[test]
    fn future_expiration_is_valid() {
        assert!(token_expiring_in(3600).is_valid());
    }

    #[test]
    fn past_expiration_is_invalid() {
        assert!(!token_expiring_in(-1).is_valid());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let token = token_expiring_in(60);
        let json = serde_json::to_string(&token).unwrap();
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(token, back);
    }
}
