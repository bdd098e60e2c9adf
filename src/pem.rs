//! PEM wrapping of raw key material.
//!
//! openssl wants a textual key or certificate, while authenticators hand out
//! bare curve points and DER certificates.

use crate::error::WebAuthnError;
use base64::{engine::general_purpose, Engine};
use openssl::{
    pkey::{PKey, Public},
    x509::X509,
};

/// DER prefix of a SubjectPublicKeyInfo holding a P-256 (prime256v1) point:
/// SEQUENCE { SEQUENCE { id-ecPublicKey, prime256v1 }, BIT STRING (66 bytes) }.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

const PEM_LINE_LEN: usize = 64;

/// Wraps an uncompressed P-256 point as a `PUBLIC KEY` PEM, or any other
/// input as a DER `CERTIFICATE` PEM.
pub fn point_or_cert_to_pem(bytes: &[u8]) -> Result<String, WebAuthnError> {
    if bytes.is_empty() {
        return Err(WebAuthnError::malformed_response(
            "empty key or certificate",
        ));
    }

    let (label, der) = if bytes.len() == 65 && bytes[0] == 0x04 {
        let mut der = Vec::with_capacity(P256_SPKI_PREFIX.len() + bytes.len());
        der.extend_from_slice(&P256_SPKI_PREFIX);
        der.extend_from_slice(bytes);
        ("PUBLIC KEY", der)
    } else {
        ("CERTIFICATE", bytes.to_vec())
    };

    let encoded = general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(PEM_LINE_LEN) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    Ok(pem)
}

pub(crate) fn public_key_from_pem(pem: &str) -> Result<PKey<Public>, WebAuthnError> {
    PKey::public_key_from_pem(pem.as_bytes())
        .map_err(|_| WebAuthnError::malformed_data("failed to parse the public key"))
}

/// Public key of the certificate in a `CERTIFICATE` PEM.
pub(crate) fn certificate_key_from_pem(pem: &str) -> Result<PKey<Public>, WebAuthnError> {
    X509::from_pem(pem.as_bytes())
        .and_then(|cert| cert.public_key())
        .map_err(|_| WebAuthnError::malformed_response("failed to parse attestation certificate"))
}
