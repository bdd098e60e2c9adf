use crate::{
    authenticator::AuthenticatorData,
    challenge::{Challenge, ChallengeManager},
    client_data::{client_data_hash, ClientData, TYPE_CREATE},
    config::RelyingPartyConfig,
    cose::{compact_key_to_point, decode_compact_key},
    error::WebAuthnError,
    pem::{certificate_key_from_pem, point_or_cert_to_pem},
    types::{Credential, Format, RegistrationRequest},
};
use chrono::{DateTime, Utc};
use ciborium::Value;
use openssl::{hash::MessageDigest, sign::Verifier};
use tracing::{debug, warn};
use x509_parser::{public_key::PublicKey, x509::SubjectPublicKeyInfo};

const TPM_VERSION: &str = "2.0";

/// A decoded attestation object: `{ fmt, authData, attStmt }`.
#[derive(Debug, Clone)]
pub struct Attestation {
    fmt: String,
    raw_authenticator_data: Vec<u8>,
    statement: Vec<(Value, Value)>,
}

impl Attestation {
    /// Parse an `Attestation` from raw CBOR bytes.
    pub fn from_cbor(cbor: &[u8]) -> Result<Self, WebAuthnError> {
        let value: Value = ciborium::from_reader(cbor).map_err(|e| {
            WebAuthnError::malformed_response(format!("invalid attestation object: {}", e))
        })?;
        let Value::Map(entries) = value else {
            return Err(WebAuthnError::malformed_response(
                "attestation object is not a CBOR map",
            ));
        };

        let mut fmt = None;
        let mut raw_authenticator_data = None;
        let mut statement = None;

        for (key, value) in entries {
            match (key.as_text(), value) {
                (Some("fmt"), Value::Text(text)) => fmt = Some(text),
                (Some("authData"), Value::Bytes(bytes)) => raw_authenticator_data = Some(bytes),
                (Some("attStmt"), Value::Map(map)) => statement = Some(map),
                (Some(name @ ("fmt" | "authData" | "attStmt")), _) => {
                    return Err(WebAuthnError::malformed_response(format!(
                        "attestation field {} has the wrong type",
                        name
                    )))
                }
                _ => {}
            }
        }

        Ok(Attestation {
            fmt: fmt.ok_or_else(|| WebAuthnError::malformed_response("missing fmt"))?,
            raw_authenticator_data: raw_authenticator_data
                .ok_or_else(|| WebAuthnError::malformed_response("missing authData"))?,
            statement: statement
                .ok_or_else(|| WebAuthnError::malformed_response("missing attStmt"))?,
        })
    }

    pub fn format_name(&self) -> &str {
        &self.fmt
    }

    /// Verifies the statement for a response whose client data hashed to
    /// `client_data_hash`, and extracts the credential to persist.
    pub fn verify(
        &self,
        config: &RelyingPartyConfig,
        client_data_hash: &[u8; 32],
        raw_id: &[u8],
        account_id: &str,
    ) -> Result<Credential, WebAuthnError> {
        let auth_data = AuthenticatorData::new(&self.raw_authenticator_data)?;
        let Some(attested) = auth_data.attested_credential_data.as_ref() else {
            return Err(WebAuthnError::MissingCredentialData);
        };
        auth_data.verify_credential_id(raw_id)?;
        auth_data.verify_rp_id(&config.rp_id)?;

        let format: Format = self.fmt.parse()?;
        let credential_key = decode_compact_key(attested.credential_public_key)?;

        let public_key = match format {
            Format::FidoU2f => {
                let point = compact_key_to_point(&credential_key)?;

                // 0x00 || rpIdHash || clientDataHash || credentialId || publicKey
                let mut signature_base = Vec::with_capacity(1 + 32 + 32 + raw_id.len() + 65);
                signature_base.push(0x00);
                signature_base.extend_from_slice(&auth_data.rp_id_hash);
                signature_base.extend_from_slice(client_data_hash);
                signature_base.extend_from_slice(attested.credential_id);
                signature_base.extend_from_slice(&point);

                self.verify_u2f_statement(&signature_base)?;
                point.to_vec()
            }
            Format::Tpm => {
                if !config.accept_unverified_tpm {
                    return Err(WebAuthnError::UnsupportedAttestationFormat(
                        "tpm attestation is disabled".to_string(),
                    ));
                }
                verify_tpm_flags(&auth_data)?;
                self.verify_tpm_statement()?;
                credential_key.to_jwk_bytes()?
            }
            Format::Unknown => {
                return Err(WebAuthnError::UnsupportedAttestationFormat(
                    self.fmt.clone(),
                ))
            }
        };

        debug!(format = %format, counter = auth_data.counter, "attestation statement verified");

        Ok(Credential::new(
            attested.credential_id,
            public_key,
            auth_data.counter,
            format,
            account_id,
        ))
    }

    fn statement_field(&self, name: &str) -> Option<&Value> {
        self.statement
            .iter()
            .find(|(k, _)| k.as_text() == Some(name))
            .map(|(_, v)| v)
    }

    fn verify_u2f_statement(&self, signature_base: &[u8]) -> Result<(), WebAuthnError> {
        let signature = self
            .statement_field("sig")
            .and_then(Value::as_bytes)
            .ok_or_else(|| WebAuthnError::malformed_response("fido-u2f statement missing sig"))?;

        // fido-u2f carries exactly one certificate
        let leaf = match self.statement_field("x5c").and_then(Value::as_array) {
            Some(certs) if certs.len() == 1 => certs[0].as_bytes().ok_or_else(|| {
                WebAuthnError::malformed_response("x5c entry is not a byte string")
            })?,
            _ => {
                return Err(WebAuthnError::malformed_response(
                    "fido-u2f statement needs exactly one x5c certificate",
                ))
            }
        };

        require_ec_certificate(leaf)?;

        let pem = point_or_cert_to_pem(leaf)?;
        let attestation_key = certificate_key_from_pem(&pem)?;
        verify_signature(&attestation_key, signature_base, signature)
    }

    /// Checks the statement's `ver` and `alg` only; the x5c chain, certInfo
    /// and pubArea are not validated. Only reached when
    /// `RelyingPartyConfig::accept_unverified_tpm` is set.
    fn verify_tpm_statement(&self) -> Result<(), WebAuthnError> {
        match self.statement_field("ver").and_then(Value::as_text) {
            Some(TPM_VERSION) => {}
            other => {
                return Err(WebAuthnError::malformed_response(format!(
                    "unsupported tpm statement version {:?}",
                    other
                )))
            }
        }
        if self.statement_field("alg").and_then(Value::as_integer).is_none() {
            return Err(WebAuthnError::malformed_response("tpm statement missing alg"));
        }
        warn!("accepting tpm attestation without certificate-chain validation");
        Ok(())
    }
}

/// User presence, user verification and no extensions, as required for tpm
/// in both ceremonies.
pub(crate) fn verify_tpm_flags(auth_data: &AuthenticatorData<'_>) -> Result<(), WebAuthnError> {
    auth_data.require_user_present()?;
    auth_data.require_user_verified()?;
    if auth_data.extensions.is_some() {
        return Err(WebAuthnError::malformed_data(
            "unexpected extension data in authenticator data",
        ));
    }
    Ok(())
}

fn require_ec_certificate(der: &[u8]) -> Result<(), WebAuthnError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| WebAuthnError::malformed_response("failed to parse attestation certificate"))?;
    let spki: &SubjectPublicKeyInfo = cert.public_key();
    match spki.parsed() {
        Ok(PublicKey::EC(_)) => Ok(()),
        _ => Err(WebAuthnError::UnsupportedAlgorithm(
            "fido-u2f attestation certificate key is not EC".to_string(),
        )),
    }
}

pub(crate) fn verify_signature(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Public>,
    message: &[u8],
    signature: &[u8],
) -> Result<(), WebAuthnError> {
    let verified = Verifier::new(MessageDigest::sha256(), key)
        .and_then(|mut verifier| verifier.verify_oneshot(signature, message))
        .unwrap_or(false);
    if verified {
        Ok(())
    } else {
        Err(WebAuthnError::SignatureInvalid)
    }
}

/// Registration: structural checks, client data, challenge, then the
/// attestation statement.
pub(crate) fn verify_registration(
    config: &RelyingPartyConfig,
    challenges: &ChallengeManager,
    request: &RegistrationRequest,
    account_id: &str,
    stored_challenge: Option<&Challenge>,
    now: DateTime<Utc>,
) -> Result<Credential, WebAuthnError> {
    let client_data = ClientData::from_json(&request.client_data_json)?;
    client_data.verify_type(TYPE_CREATE)?;
    client_data.verify_origin(&config.expected_origin())?;
    challenges.validate(
        &client_data.challenge_bytes()?,
        stored_challenge,
        account_id,
        now,
    )?;

    let client_data_hash = client_data_hash(&request.client_data_json);
    let attestation = Attestation::from_cbor(&request.attestation_object)?;
    attestation.verify(config, &client_data_hash, &request.raw_id, account_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, SyntheticAuthenticator};
    use sha2::{Digest, Sha256};

    fn hash_of(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    #[test]
    fn test_u2f_attestation_verifies() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f();
        let client_data = authenticator.client_data("webauthn.create", b"nonce", &config);
        let cbor = authenticator.attestation_object(&config, &hash_of(&client_data));

        let credential = Attestation::from_cbor(&cbor)
            .unwrap()
            .verify(&config, &hash_of(&client_data), authenticator.credential_id(), "alice")
            .unwrap();
        assert_eq!(credential.format, Format::FidoU2f);
        assert_eq!(credential.public_key, authenticator.public_point());
        assert_eq!(credential.signature_counter, 0);
        assert_eq!(credential.owner_account_id, "alice");
    }

    #[test]
    fn test_u2f_attestation_rejects_other_client_data() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f();
        let client_data = authenticator.client_data("webauthn.create", b"nonce", &config);
        let cbor = authenticator.attestation_object(&config, &hash_of(&client_data));

        let mut flipped = hash_of(&client_data);
        flipped[7] ^= 0x01;
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &flipped,
            authenticator.credential_id(),
            "alice",
        );
        assert_eq!(result, Err(WebAuthnError::SignatureInvalid));
    }

    #[test]
    fn test_rejects_raw_id_mismatch() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f();
        let hash = [0u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor)
            .unwrap()
            .verify(&config, &hash, b"other-id", "alice");
        assert!(matches!(result, Err(WebAuthnError::MalformedResponse(_))));
    }

    #[test]
    fn test_tpm_disabled_by_default() {
        let config = test_config().with_unverified_tpm(false);
        let authenticator = SyntheticAuthenticator::tpm();
        let hash = [1u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert!(matches!(
            result,
            Err(WebAuthnError::UnsupportedAttestationFormat(_))
        ));
    }

    #[test]
    fn test_tpm_attestation_yields_jwk() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::tpm();
        let hash = [1u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let credential = Attestation::from_cbor(&cbor)
            .unwrap()
            .verify(&config, &hash, authenticator.credential_id(), "alice")
            .unwrap();
        assert_eq!(credential.format, Format::Tpm);
        let jwk: serde_json::Value = serde_json::from_slice(&credential.public_key).unwrap();
        assert_eq!(jwk["kty"], "RSA");
    }

    #[test]
    fn test_tpm_requires_user_verification() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::tpm().with_flags(0x41);
        let hash = [1u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert_eq!(result, Err(WebAuthnError::UserNotVerified));
    }

    #[test]
    fn test_tpm_rejects_extension_data() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::tpm().with_extensions();
        let hash = [1u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert!(matches!(
            result,
            Err(WebAuthnError::MalformedAuthenticatorData(_))
        ));
    }

    #[test]
    fn test_u2f_tolerates_extension_data() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f().with_extensions();
        let hash = [2u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        assert!(Attestation::from_cbor(&cbor)
            .unwrap()
            .verify(&config, &hash, authenticator.credential_id(), "alice")
            .is_ok());
    }

    #[test]
    fn test_rejects_rp_id_mismatch() {
        let config = test_config();
        let other = RelyingPartyConfig::new("other.example", "https://other.example", "x").unwrap();
        let authenticator = SyntheticAuthenticator::fido_u2f();
        let hash = [0u8; 32];
        let cbor = authenticator.attestation_object(&other, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert_eq!(result, Err(WebAuthnError::RelyingPartyMismatch));
    }

    #[test]
    fn test_u2f_rejects_rsa_attestation_certificate() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f().with_rsa_attestation_cert();
        let hash = [0u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert!(matches!(result, Err(WebAuthnError::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_missing_credential_data() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f();
        let cbor = authenticator.attestation_object_without_credential(&config);
        let result = Attestation::from_cbor(&cbor)
            .unwrap()
            .verify(&config, &[0u8; 32], b"", "alice");
        assert_eq!(result, Err(WebAuthnError::MissingCredentialData));
    }

    #[test]
    fn test_unsupported_format() {
        let config = test_config();
        let authenticator = SyntheticAuthenticator::fido_u2f().with_format("packed");
        let hash = [0u8; 32];
        let cbor = authenticator.attestation_object(&config, &hash);
        let result = Attestation::from_cbor(&cbor).unwrap().verify(
            &config,
            &hash,
            authenticator.credential_id(),
            "alice",
        );
        assert!(matches!(
            result,
            Err(WebAuthnError::UnsupportedAttestationFormat(_))
        ));
    }

    #[test]
    fn test_rejects_non_map_attestation() {
        let mut buf = Vec::new();
        ciborium::into_writer(&Value::Text("fido-u2f".into()), &mut buf).unwrap();
        assert!(matches!(
            Attestation::from_cbor(&buf),
            Err(WebAuthnError::MalformedResponse(_))
        ));
    }
}
