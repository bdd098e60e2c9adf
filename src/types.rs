//! Wire shapes exchanged with the client and records exchanged with the host.

use crate::error::{FailureReason, WebAuthnError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PUBLIC_KEY_TYPE: &str = "public-key";

/// Attestation format a credential was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "fido-u2f")]
    FidoU2f,
    #[serde(rename = "tpm")]
    Tpm,
    /// Records whose format was never captured. Assertions against them fail.
    #[serde(rename = "unknown")]
    Unknown,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::FidoU2f => "fido-u2f",
            Format::Tpm => "tpm",
            Format::Unknown => "unknown",
        }
    }

    fn default_display_name(self) -> &'static str {
        match self {
            Format::FidoU2f => "FIDO U2F security key",
            Format::Tpm => "TPM platform authenticator",
            Format::Unknown => "Authenticator",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = WebAuthnError;

    /// Only formats this crate can verify parse; `unknown` is never accepted
    /// from an attestation object.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fido-u2f" => Ok(Format::FidoU2f),
            "tpm" => Ok(Format::Tpm),
            other => Err(WebAuthnError::UnsupportedAttestationFormat(other.to_string())),
        }
    }
}

/// A registered authenticator as persisted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// base64url (unpadded) of the authenticator-chosen credential id.
    pub id: String,
    /// fido-u2f: 65-byte uncompressed P-256 point. tpm: JWK JSON bytes.
    pub public_key: Vec<u8>,
    pub signature_counter: u32,
    pub format: Format,
    pub owner_account_id: String,
    pub display_name: String,
}

impl Credential {
    pub(crate) fn new(
        raw_id: &[u8],
        public_key: Vec<u8>,
        signature_counter: u32,
        format: Format,
        owner_account_id: &str,
    ) -> Self {
        Self {
            id: encode_credential_id(raw_id),
            public_key,
            signature_counter,
            format,
            owner_account_id: owner_account_id.to_string(),
            display_name: format.default_display_name().to_string(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

pub fn encode_credential_id(raw_id: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(raw_id)
}

/// Outcome of a `finish_*` call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub credential: Option<Credential>,
    pub failure_reason: Option<FailureReason>,
}

impl VerificationResult {
    pub fn success(credential: Option<Credential>) -> Self {
        Self {
            verified: true,
            credential,
            failure_reason: None,
        }
    }

    pub fn failure(err: &WebAuthnError) -> Self {
        Self {
            verified: false,
            credential: None,
            failure_reason: Some(err.reason()),
        }
    }

    /// Text safe to return to a remote caller; it never names the failed check.
    pub fn public_message(&self) -> &'static str {
        if self.verified {
            "verified"
        } else {
            "verification failed"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Option<String>,
    pub attestation_object: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Option<String>,
    pub authenticator_data: Option<String>,
    pub signature: Option<String>,
    #[serde(default)]
    pub user_handle: Option<String>,
}

/// `PublicKeyCredential` returned by `navigator.credentials.create()`.
/// Fields are optional so missing ones surface as `MalformedResponse`
/// instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: Option<String>,
    pub raw_id: Option<String>,
    #[serde(rename = "type")]
    pub credential_type: Option<String>,
    pub response: Option<AuthenticatorAttestationResponse>,
}

/// `PublicKeyCredential` returned by `navigator.credentials.get()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub id: Option<String>,
    pub raw_id: Option<String>,
    #[serde(rename = "type")]
    pub credential_type: Option<String>,
    pub response: Option<AuthenticatorAssertionResponse>,
}

/// Decoded registration fields, all required.
pub(crate) struct RegistrationRequest {
    pub raw_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub attestation_object: Vec<u8>,
}

/// Decoded authentication fields, all required.
pub(crate) struct AuthenticationRequest {
    pub raw_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, WebAuthnError> {
    field
        .as_deref()
        .ok_or_else(|| WebAuthnError::malformed_response(format!("missing {}", name)))
}

fn decode_b64url(value: &str, name: &str) -> Result<Vec<u8>, WebAuthnError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| WebAuthnError::malformed_response(format!("{} is not base64url", name)))
}

fn check_type(credential_type: &Option<String>) -> Result<(), WebAuthnError> {
    let ty = required(credential_type, "type")?;
    if ty != PUBLIC_KEY_TYPE {
        return Err(WebAuthnError::malformed_response(format!(
            "credential type {}",
            ty
        )));
    }
    Ok(())
}

impl RegistrationResponse {
    pub(crate) fn decode(&self) -> Result<RegistrationRequest, WebAuthnError> {
        required(&self.id, "id")?;
        check_type(&self.credential_type)?;
        let response = self
            .response
            .as_ref()
            .ok_or_else(|| WebAuthnError::malformed_response("missing response"))?;

        Ok(RegistrationRequest {
            raw_id: decode_b64url(required(&self.raw_id, "rawId")?, "rawId")?,
            client_data_json: decode_b64url(
                required(&response.client_data_json, "clientDataJSON")?,
                "clientDataJSON",
            )?,
            attestation_object: decode_b64url(
                required(&response.attestation_object, "attestationObject")?,
                "attestationObject",
            )?,
        })
    }
}

impl AuthenticationResponse {
    pub(crate) fn decode(&self) -> Result<AuthenticationRequest, WebAuthnError> {
        required(&self.id, "id")?;
        check_type(&self.credential_type)?;
        let response = self
            .response
            .as_ref()
            .ok_or_else(|| WebAuthnError::malformed_response("missing response"))?;

        Ok(AuthenticationRequest {
            raw_id: decode_b64url(required(&self.raw_id, "rawId")?, "rawId")?,
            client_data_json: decode_b64url(
                required(&response.client_data_json, "clientDataJSON")?,
                "clientDataJSON",
            )?,
            authenticator_data: decode_b64url(
                required(&response.authenticator_data, "authenticatorData")?,
                "authenticatorData",
            )?,
            signature: decode_b64url(required(&response.signature, "signature")?, "signature")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyCredentialParameters {
    #[serde(rename = "type")]
    pub credential_type: String,
    pub alg: i64,
}

/// Returned by `begin_registration`, forwarded to `navigator.credentials.create()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOptions {
    /// base64url challenge.
    pub challenge: String,
    pub relying_party_name: String,
    pub relying_party_id: String,
    /// base64url of the account id.
    pub user_handle: String,
    pub algorithms: Vec<PublicKeyCredentialParameters>,
    pub excluded_credential_ids: Vec<String>,
    pub timeout_ms: u64,
}

/// Returned by `begin_authentication`, forwarded to `navigator.credentials.get()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOptions {
    pub challenge: String,
    pub relying_party_id: String,
    pub allowed_credential_ids: Vec<String>,
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing_is_closed() {
        assert_eq!("fido-u2f".parse::<Format>().unwrap(), Format::FidoU2f);
        assert_eq!("tpm".parse::<Format>().unwrap(), Format::Tpm);
        assert!(matches!(
            "packed".parse::<Format>(),
            Err(WebAuthnError::UnsupportedAttestationFormat(_))
        ));
        assert!("unknown".parse::<Format>().is_err());
    }

    #[test]
    fn test_format_serializes_as_wire_name() {
        assert_eq!(serde_json::to_string(&Format::FidoU2f).unwrap(), "\"fido-u2f\"");
        let f: Format = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(f, Format::Unknown);
    }

    #[test]
    fn test_registration_response_requires_fields() {
        let json = r#"{"id":"AQ","rawId":"AQ","type":"public-key","response":{"clientDataJSON":"e30"}}"#;
        let response: RegistrationResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            response.decode(),
            Err(WebAuthnError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_registration_response_requires_public_key_type() {
        let json = r#"{"id":"AQ","rawId":"AQ","type":"password","response":{"clientDataJSON":"e30","attestationObject":"oA"}}"#;
        let response: RegistrationResponse = serde_json::from_str(json).unwrap();
        assert!(response.decode().is_err());
    }

    #[test]
    fn test_authentication_response_decodes() {
        let json = r#"{"id":"AQI","rawId":"AQI","type":"public-key","response":{"clientDataJSON":"e30","authenticatorData":"AAAA","signature":"MEU="}}"#;
        let response: AuthenticationResponse = serde_json::from_str(json).unwrap();
        let decoded = response.decode().unwrap();
        assert_eq!(decoded.raw_id, vec![1, 2]);
        assert_eq!(decoded.client_data_json, b"{}".to_vec());
        assert_eq!(decoded.signature, vec![0x30, 0x45]);
    }

    #[test]
    fn test_public_message_is_generic() {
        let result = VerificationResult::failure(&WebAuthnError::SignatureInvalid);
        assert_eq!(result.public_message(), "verification failed");
        assert_eq!(result.failure_reason, Some(FailureReason::SignatureInvalid));
    }
}
