//! Authenticates the *client* against locally configured credentials
//! (4.E in the design doc). Ported line-for-line from the semantics of
//! `examples/original_source/oauth2imap/auth.py`; the downstream never
//! sees a bearer token.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacMd5 = Hmac<Md5>;

/// A freshly minted CRAM-MD5 challenge: `raw` is hashed against the
/// configured password, `base64` is what gets sent as the continuation
/// payload.
pub struct CramChallenge {
    pub raw: String,
    pub base64: String,
}

pub fn new_cram_challenge() -> CramChallenge {
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let rnd: u32 = rand::thread_rng().gen_range(0..u32::MAX);

    let raw = format!("<{pid}.{nanos}.{rnd}@oauth2imap>");
    let base64 = STANDARD.encode(&raw);

    CramChallenge { raw, base64 }
}

/// Verifies a client's CRAM-MD5 response line against the challenge that
/// produced it. Returns `(ok, message)` as spec.md's 4.E describes.
pub fn verify_cram_md5(
    challenge: &CramChallenge,
    configured_user: &str,
    configured_password: &str,
    response_line: &str,
) -> (bool, String) {
    let decoded = match STANDARD.decode(response_line.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return (false, "couldn't decode your credentials".to_string()),
    };

    let decoded = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return (false, "couldn't decode your credentials".to_string()),
    };

    let fields: Vec<&str> = decoded.splitn(2, ' ').collect();
    if fields.len() != 2 {
        return (false, "wrong number of fields in the token".to_string());
    }
    let (given_user, given_digest) = (fields[0], fields[1]);

    let mut mac =
        HmacMd5::new_from_slice(configured_password.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.raw.as_bytes());
    let expected_digest = hex(&mac.finalize().into_bytes());

    let user_ok: bool = configured_user.as_bytes().ct_eq(given_user.as_bytes()).into();
    let digest_ok: bool = expected_digest
        .as_bytes()
        .ct_eq(given_digest.as_bytes())
        .into();

    if user_ok && digest_ok {
        (true, "authentication successful".to_string())
    } else {
        (false, "authenticate failure".to_string())
    }
}

/// Verifies a raw `LOGIN <user> <password>` argument pair against the
/// configured downstream credentials. Both sides are SHA-256 hashed first
/// purely to normalize length for the constant-time compare; downstream
/// credentials are a local shared secret, not a remote one.
pub fn verify_plain(configured_user: &str, configured_password: &str, arg: &str) -> (bool, String) {
    let given: Vec<&str> = arg.splitn(2, ' ').collect();
    if given.len() != 2 {
        return (false, "authenticate failure".to_string());
    }

    let known = [configured_user, configured_password];
    let given = [given[0], given[1]];

    let mut matches = 0;
    for i in 0..known.len() {
        let k = sha256_hex(known[i]);
        let g = sha256_hex(given[i]);
        let ok: bool = k.as_bytes().ct_eq(g.as_bytes()).into();
        if ok {
            matches += 1;
        }
    }

    if matches == known.len() {
        (true, "authentication successful".to_string())
    } else {
        (false, "authenticate failure".to_string())
    }
}

fn sha256_hex(s: &str) -> String {
    hex(&Sha256::digest(s.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cram_md5_accepts_matching_digest() {
        let challenge = CramChallenge {
            raw: "<42.1000000000.7@oauth2imap>".to_string(),
            base64: String::new(),
        };

        let mut mac = HmacMd5::new_from_slice(b"p").unwrap();
        mac.update(challenge.raw.as_bytes());
        let digest = hex(&mac.finalize().into_bytes());

        let response = STANDARD.encode(format!("alice {digest}"));
        let (ok, msg) = verify_cram_md5(&challenge, "alice", "p", &response);
        assert!(ok);
        assert_eq!(msg, "authentication successful");
    }

    #[test]
    fn cram_md5_rejects_wrong_password() {
        let challenge = CramChallenge {
            raw: "<42.1000000000.7@oauth2imap>".to_string(),
            base64: String::new(),
        };

        let mut mac = HmacMd5::new_from_slice(b"wrong").unwrap();
        mac.update(challenge.raw.as_bytes());
        let digest = hex(&mac.finalize().into_bytes());

        let response = STANDARD.encode(format!("alice {digest}"));
        let (ok, msg) = verify_cram_md5(&challenge, "alice", "p", &response);
        assert!(!ok);
        assert_eq!(msg, "authenticate failure");
    }

    #[test]
    fn cram_md5_rejects_malformed_base64() {
        let challenge = CramChallenge {
            raw: "<x@oauth2imap>".to_string(),
            base64: String::new(),
        };
        let (ok, msg) = verify_cram_md5(&challenge, "alice", "p", "not base64!!!");
        assert!(!ok);
        assert_eq!(msg, "couldn't decode your credentials");
    }

    #[test]
    fn plain_login_success() {
        let (ok, _) = verify_plain("alice", "s3cret", "alice s3cret");
        assert!(ok);
    }

    #[test]
    fn plain_login_failure() {
        let (ok, msg) = verify_plain("alice", "s3cret", "alice wrong");
        assert!(!ok);
        assert_eq!(msg, "authenticate failure");
    }
}
