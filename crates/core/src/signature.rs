//! `x-rulepay-signature` webhook signatures: `sha256=<hex>` over the raw body.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-rulepay-signature";
const SCHEME_PREFIX: &str = "sha256=";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature must look like `sha256=<hex>`")]
    Malformed,
    #[error("signature does not match the request body")]
    Mismatch,
    #[error("signing secret is unusable")]
    InvalidSecret,
}

pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    Ok(format!("{SCHEME_PREFIX}{}", encode_hex(mac.finalize().into_bytes().as_slice())))
}

/// Checks `header` against the body in constant time.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.map(str::trim).filter(|value| !value.is_empty()).ok_or(SignatureError::Missing)?;
    let hex = header.strip_prefix(SCHEME_PREFIX).ok_or(SignatureError::Malformed)?;
    let expected = decode_hex(hex).ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&text[index..index + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{sign, verify, SignatureError};

    const SECRET: &[u8] = b"scheduler-shared-secret";

    #[test]
    fn signed_bodies_verify() {
        let body = br#"{"chatId":"chat-1"}"#;
        let header = sign(SECRET, body).expect("sign");

        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert_eq!(verify(SECRET, body, Some(&header)), Ok(()));
        assert_eq!(verify(SECRET, body, Some(&header.to_uppercase().replace("SHA256=", "sha256="))), Ok(()));
    }

    #[test]
    fn tampering_and_bad_headers_are_rejected() {
        let header = sign(SECRET, b"original").expect("sign");

        assert_eq!(verify(SECRET, b"tampered", Some(&header)), Err(SignatureError::Mismatch));
        assert_eq!(verify(b"other-secret-value", b"original", Some(&header)), Err(SignatureError::Mismatch));
        assert_eq!(verify(SECRET, b"original", None), Err(SignatureError::Missing));
        assert_eq!(verify(SECRET, b"original", Some("md5=abcd")), Err(SignatureError::Malformed));
        assert_eq!(verify(SECRET, b"original", Some("sha256=zz")), Err(SignatureError::Malformed));
    }
}
