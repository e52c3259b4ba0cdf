//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw body and sends
//! the result as `X-Hub-Signature-256: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verifies the `sha256=<hex>` signature header against the raw body.
///
/// Comparison is constant-time. A missing or malformed header fails the
/// same way as a mismatched digest.
pub fn verify(secret: &str, body: &[u8], signature_header: Option<&str>) -> Result<()> {
    let header = signature_header.ok_or(Error::InvalidSignature)?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(Error::InvalidSignature)?;
    let provided = hex::decode(hex_digest).map_err(|_| Error::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| Error::InvalidSignature)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}
