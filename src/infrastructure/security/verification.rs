//! Pairing verification key.
//!
//! The short human-checkable code both users compare during pairing. It is
//! derived from the two certificates' SubjectPublicKeyInfo blobs and the
//! timestamp of the initiating pair packet, and is never transmitted.

use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{DaemonError, Result};

/// Derive the 8-character verification key from two DER-encoded
/// SubjectPublicKeyInfo blobs and the pair-packet timestamp.
///
/// The blobs are concatenated larger-first under unsigned lexicographic
/// order, which makes the result symmetric in its first two arguments, then
/// the ASCII decimal timestamp is appended and the whole thing hashed:
///
/// ```text
/// key = uppercase(hex(sha256(max(A,B) || min(A,B) || dec(timestamp)))[..8])
/// ```
pub fn verification_key(spki_a: &[u8], spki_b: &[u8], timestamp: i64) -> String {
    let mut combined = Vec::with_capacity(spki_a.len() + spki_b.len() + 20);
    if spki_a < spki_b {
        combined.extend_from_slice(spki_b);
        combined.extend_from_slice(spki_a);
    } else {
        combined.extend_from_slice(spki_a);
        combined.extend_from_slice(spki_b);
    }
    combined.extend_from_slice(timestamp.to_string().as_bytes());

    let digest = Sha256::digest(&combined);
    let hex = hex_lower(&digest);
    hex[..8].to_ascii_uppercase()
}

/// Extract the raw SubjectPublicKeyInfo bytes from a DER certificate.
pub fn spki_from_cert_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| DaemonError::identity(format!("unparseable peer certificate: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

/// Lowercase hex SHA-256 of a DER certificate; the pinning fingerprint.
pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    hex_lower(&Sha256::digest(cert_der))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
