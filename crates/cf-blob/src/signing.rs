//! HMAC-SHA256 signed download links.
//!
//! A link is `{base_url}/{key}?expires={unix_secs}&sig={hex}` where `sig`
//! signs `"{key}\n{expires}"` with the storage secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use cf_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid signing secret: {e}")))
}

/// Hex signature for `key` expiring at `expires` (unix seconds).
pub fn sign(secret: &str, key: &str, expires: i64) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(format!("{key}\n{expires}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a link's signature and expiry.
///
/// Uses constant-time comparison via the `hmac` crate.
pub fn verify(secret: &str, key: &str, expires: i64, signature: &str, now: i64) -> bool {
    if now > expires {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = mac(secret) else {
        return false;
    };
    mac.update(format!("{key}\n{expires}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}
