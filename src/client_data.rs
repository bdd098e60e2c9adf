use crate::error::WebAuthnError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub(crate) const TYPE_CREATE: &str = "webauthn.create";
pub(crate) const TYPE_GET: &str = "webauthn.get";

/// The subset of `CollectedClientData` the verifiers look at.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    #[serde(rename = "type")]
    pub ceremony: String,
    /// base64url of the challenge bytes handed out at `begin_*`.
    pub challenge: String,
    pub origin: String,
    #[serde(default)]
    pub cross_origin: bool,
}

impl ClientData {
    pub fn from_json(client_data_json: &[u8]) -> Result<Self, WebAuthnError> {
        serde_json::from_slice(client_data_json)
            .map_err(|e| WebAuthnError::malformed_response(format!("invalid client data: {}", e)))
    }

    pub fn challenge_bytes(&self) -> Result<Vec<u8>, WebAuthnError> {
        URL_SAFE_NO_PAD
            .decode(self.challenge.trim_end_matches('='))
            .map_err(|_| WebAuthnError::malformed_response("client data challenge is not base64url"))
    }

    pub(crate) fn verify_type(&self, expected: &str) -> Result<(), WebAuthnError> {
        if self.ceremony != expected {
            return Err(WebAuthnError::malformed_response(format!(
                "client data type {} (expected {})",
                self.ceremony, expected
            )));
        }
        Ok(())
    }

    /// The origin must match exactly and the ceremony must not have run in a
    /// cross-origin iframe.
    pub(crate) fn verify_origin(&self, expected: &str) -> Result<(), WebAuthnError> {
        if self.origin != expected {
            return Err(WebAuthnError::OriginMismatch {
                expected: expected.to_string(),
                actual: self.origin.clone(),
            });
        }
        if self.cross_origin {
            return Err(WebAuthnError::OriginMismatch {
                expected: expected.to_string(),
                actual: format!("{} (cross-origin)", self.origin),
            });
        }
        Ok(())
    }
}

/// SHA-256 of the exact client data bytes the authenticator signed over.
pub fn client_data_hash(client_data_json: &[u8]) -> [u8; 32] {
    Sha256::digest(client_data_json).into()
}
