use crate::{
    attestation::{verify_signature, verify_tpm_flags},
    authenticator::AuthenticatorData,
    challenge::{Challenge, ChallengeManager},
    client_data::{client_data_hash, ClientData, TYPE_GET},
    config::RelyingPartyConfig,
    cose::NormalizedKey,
    error::WebAuthnError,
    pem::{point_or_cert_to_pem, public_key_from_pem},
    types::{encode_credential_id, AuthenticationRequest, Credential, Format},
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Result of a verified assertion: which credential signed, and the counter
/// the host must now store for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub credential_id: String,
    pub previous_counter: u32,
    pub new_counter: u32,
}

#[derive(Debug, Clone)]
pub struct Assertion<'a> {
    raw_authenticator_data: &'a [u8],
    signature: &'a [u8],
}

impl<'a> Assertion<'a> {
    pub fn new(raw_authenticator_data: &'a [u8], signature: &'a [u8]) -> Self {
        Assertion {
            raw_authenticator_data,
            signature,
        }
    }

    /// Verifies the assertion against a stored credential and returns the
    /// counter reported by the authenticator.
    pub fn verify(
        self,
        config: &RelyingPartyConfig,
        client_data_json: &[u8],
        credential: &Credential,
    ) -> Result<AssertionOutcome, WebAuthnError> {
        let auth_data = AuthenticatorData::new(self.raw_authenticator_data)?;
        auth_data.require_user_present()?;
        auth_data.verify_rp_id(&config.rp_id)?;

        let client_data_hash = client_data_hash(client_data_json);

        match credential.format {
            Format::FidoU2f => {
                // rpIdHash || flags || counter || clientDataHash
                let mut signature_base = Vec::with_capacity(37 + 32);
                signature_base.extend_from_slice(&self.raw_authenticator_data[..37]);
                signature_base.extend_from_slice(&client_data_hash);

                let pem = point_or_cert_to_pem(&credential.public_key)?;
                let key = public_key_from_pem(&pem)?;
                verify_signature(&key, &signature_base, self.signature)?;
            }
            Format::Tpm => {
                verify_tpm_flags(&auth_data)?;

                let mut signature_base =
                    Vec::with_capacity(self.raw_authenticator_data.len() + 32);
                signature_base.extend_from_slice(self.raw_authenticator_data);
                signature_base.extend_from_slice(&client_data_hash);

                // RS256 or ES256 both sign SHA-256 of the concatenation
                let key = NormalizedKey::from_jwk_bytes(&credential.public_key)?.to_pkey()?;
                verify_signature(&key, &signature_base, self.signature)?;
            }
            Format::Unknown => {
                return Err(WebAuthnError::UnsupportedAttestationFormat(
                    Format::Unknown.to_string(),
                ))
            }
        }

        // Verify counter is greater than previous.
        if auth_data.counter <= credential.signature_counter {
            return Err(WebAuthnError::CounterReplay {
                stored: credential.signature_counter,
                presented: auth_data.counter,
            });
        }

        debug!(
            credential_id = %credential.id,
            counter = auth_data.counter,
            "assertion signature verified"
        );

        Ok(AssertionOutcome {
            credential_id: credential.id.clone(),
            previous_counter: credential.signature_counter,
            new_counter: auth_data.counter,
        })
    }
}

/// Authentication: locate the credential, check client data and challenge,
/// then verify the assertion.
pub(crate) fn verify_authentication(
    config: &RelyingPartyConfig,
    challenges: &ChallengeManager,
    request: &AuthenticationRequest,
    stored_credentials: &[Credential],
    stored_challenge: Option<&Challenge>,
    now: DateTime<Utc>,
) -> Result<AssertionOutcome, WebAuthnError> {
    let credential_id = encode_credential_id(&request.raw_id);
    let credential = stored_credentials
        .iter()
        .find(|c| c.id == credential_id)
        .ok_or(WebAuthnError::UnknownCredential)?;

    let client_data = ClientData::from_json(&request.client_data_json)?;
    client_data.verify_type(TYPE_GET)?;
    client_data.verify_origin(&config.expected_origin())?;
    challenges.validate(
        &client_data.challenge_bytes()?,
        stored_challenge,
        &credential.owner_account_id,
        now,
    )?;

    Assertion::new(&request.authenticator_data, &request.signature).verify(
        config,
        &request.client_data_json,
        credential,
    )
}
