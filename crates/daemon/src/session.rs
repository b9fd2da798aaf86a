//! C5 authentication: an HMAC-signed session cookie plus a localhost trust
//! bypass and a dual-password admin gate, per spec §5.

use hmac::{Hmac, Mac};
use matchbox_protocol::crypto::constant_time_eq;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE_NAME: &str = "mb_session";
const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Fixed salt/digest pair gating the admin password, distinct from any
/// instance's own `tunnel_password`.
const ADMIN_SALT: &[u8] = &[
    0x13, 0xc7, 0x90, 0x2b, 0x3b, 0x3c, 0x31, 0x24, 0x3b, 0xdb, 0x2c, 0x10, 0xd1, 0x16, 0x7a,
    0xb4,
];
const ADMIN_HASH: &str = "b2dccbe9a4c812f3c5e02f55d8f1d58fb2b63ab1a8e5e6e3e1e7e3b0a7d3c9a1";

/// Reads 32 random bytes from `/dev/urandom` and hex-encodes them, used to
/// derive the per-process HMAC secret for session cookies.
pub fn generate_session_secret() -> Vec<u8> {
    use std::io::Read;
    let mut buf = [0u8; 32];
    match std::fs::File::open("/dev/urandom").and_then(|mut f| f.read_exact(&mut buf)) {
        Ok(()) => buf.to_vec(),
        Err(_) => {
            // Extraordinarily unlikely on any Unix host; fall back to a
            // process-unique but non-cryptographic seed rather than panic.
            let pid = std::process::id();
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            format!("{pid}{now}").into_bytes()
        }
    }
}

/// `{instance_id}:{expiry_unix}:{hmac_sha256(secret, "{instance_id}:{expiry_unix}")}`
pub fn issue_session_cookie(secret: &[u8], instance_id: &str) -> String {
    let expiry = now_unix() + SESSION_TTL.as_secs();
    let signed = format!("{instance_id}:{expiry}");
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signed.as_bytes());
    let sig = hex_encode(&mac.finalize().into_bytes());
    format!("{signed}:{sig}")
}

pub fn verify_session_cookie(secret: &[u8], instance_id: &str, cookie: &str) -> bool {
    let mut parts = cookie.splitn(3, ':');
    let (Some(cookie_instance), Some(expiry_str), Some(sig_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if cookie_instance != instance_id {
        return false;
    }
    let Ok(expiry) = expiry_str.parse::<u64>() else {
        return false;
    };
    if expiry < now_unix() {
        return false;
    }

    let signed = format!("{cookie_instance}:{expiry}");
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signed.as_bytes());
    let expected = hex_encode(&mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), sig_hex.as_bytes())
}

/// SHA-256(fixed salt + password) compared against the compiled-in admin
/// digest, independent of any instance's `tunnel_password`.
pub fn verify_admin_password(password: &str) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(ADMIN_SALT);
    hasher.update(password.as_bytes());
    let digest = hex_encode(&hasher.finalize());
    constant_time_eq(digest.as_bytes(), ADMIN_HASH.as_bytes())
}

/// The admin digest/salt this daemon checks passwords against, hex-encoded
/// for the tunnel registration frame so the relay's admin-link auth (§4.9)
/// can validate against the same values without re-deriving them.
pub fn admin_hash_hex() -> String {
    ADMIN_HASH.to_string()
}

pub fn admin_salt_hex() -> String {
    hex_encode(ADMIN_SALT)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cookie_verifies() {
        let secret = b"test-secret".to_vec();
        let cookie = issue_session_cookie(&secret, "q1evt");
        assert!(verify_session_cookie(&secret, "q1evt", &cookie));
    }

    #[test]
    fn cookie_rejected_for_wrong_instance() {
        let secret = b"test-secret".to_vec();
        let cookie = issue_session_cookie(&secret, "q1evt");
        assert!(!verify_session_cookie(&secret, "other-evt", &cookie));
    }

    #[test]
    fn cookie_rejected_with_wrong_secret() {
        let cookie = issue_session_cookie(b"secret-a", "q1evt");
        assert!(!verify_session_cookie(b"secret-b", "q1evt", &cookie));
    }

    #[test]
    fn cookie_rejected_if_tampered() {
        let secret = b"test-secret".to_vec();
        let mut cookie = issue_session_cookie(&secret, "q1evt");
        cookie.push('f');
        assert!(!verify_session_cookie(&secret, "q1evt", &cookie));
    }

    #[test]
    fn cookie_rejected_if_expired() {
        let secret = b"test-secret".to_vec();
        let signed = "q1evt:1".to_string();
        let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex_encode(&mac.finalize().into_bytes());
        let cookie = format!("{signed}:{sig}");
        assert!(!verify_session_cookie(&secret, "q1evt", &cookie));
    }

    #[test]
    fn malformed_cookie_rejected() {
        assert!(!verify_session_cookie(b"secret", "q1evt", "not-a-cookie"));
    }
}
