//! HMAC helpers for signed feed frames

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha = Hmac<Sha256>;

/// Hex digest of HMAC-SHA256(`secret`, `body`).
pub fn sign_hex(body: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Direct byte-slice check, constant-time on the digest.
pub fn verify_hmac_bytes(body: &[u8], secret: &str, sig_hex: &str) -> bool {
    if sig_hex.len() != 64 {
        return false;
    }
    let Ok(mut mac) = HmacSha::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let calc = mac.finalize().into_bytes();
    match hex::decode(sig_hex) {
        Ok(given) => calc.ct_eq(&given).into(),
        Err(_) => false,
    }
}
