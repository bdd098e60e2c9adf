//! Host-facing registration and authentication ceremonies.
//!
//! `begin_*` issues a challenge and the options the client needs;
//! `finish_*` verifies the client's response. Verification failures come
//! back as an unverified [`VerificationResult`]; only store failures (and,
//! for `begin_*`, challenge issuance failures) are returned as `Err`.

use crate::{
    assertion::verify_authentication,
    attestation::verify_registration,
    challenge::{Challenge, ChallengeManager},
    client_data::ClientData,
    config::RelyingPartyConfig,
    cose::{ALG_ES256, ALG_RS256},
    error::{CeremonyError, StoreError, WebAuthnError},
    store::CredentialStore,
    types::{
        encode_credential_id, AuthenticationOptions, AuthenticationResponse,
        PublicKeyCredentialParameters, RegistrationOptions, RegistrationResponse,
        VerificationResult, PUBLIC_KEY_TYPE,
    },
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use tracing::{info, warn};

pub struct RelyingParty<S> {
    config: RelyingPartyConfig,
    challenges: ChallengeManager,
    store: S,
}

impl<S: CredentialStore> RelyingParty<S> {
    pub fn new(config: RelyingPartyConfig, store: S) -> Self {
        if config.accept_unverified_tpm {
            warn!(
                rp_id = %config.rp_id,
                "tpm attestation enabled without certificate-chain validation; \
                 tpm registrations are not tied to a trusted manufacturer"
            );
        }
        let challenges = ChallengeManager::new(config.challenge_mode.clone(), config.challenge_ttl);
        Self {
            config,
            challenges,
            store,
        }
    }

    pub fn config(&self) -> &RelyingPartyConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn issue_challenge(&self, account_id: &str) -> Result<Challenge, CeremonyError> {
        let challenge = self
            .challenges
            .issue(account_id)
            .map_err(CeremonyError::ChallengeIssuance)?;
        self.store.save_challenge(challenge.clone()).await?;
        Ok(challenge)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.config.challenge_ttl.num_milliseconds()).unwrap_or(u64::MAX)
    }

    pub async fn begin_registration(
        &self,
        account_id: &str,
    ) -> Result<RegistrationOptions, CeremonyError> {
        let challenge = self.issue_challenge(account_id).await?;
        let excluded_credential_ids = self
            .store
            .credentials_for(account_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        info!(account_id = %account_id, "registration started");

        Ok(RegistrationOptions {
            challenge: challenge.encoded(),
            relying_party_name: self.config.rp_name.clone(),
            relying_party_id: self.config.rp_id.clone(),
            user_handle: URL_SAFE_NO_PAD.encode(account_id.as_bytes()),
            algorithms: [ALG_ES256, ALG_RS256]
                .into_iter()
                .map(|alg| PublicKeyCredentialParameters {
                    credential_type: PUBLIC_KEY_TYPE.to_string(),
                    alg,
                })
                .collect(),
            excluded_credential_ids,
            timeout_ms: self.timeout_ms(),
        })
    }

    /// Verifies a registration response. The returned credential is not
    /// persisted; hand it to [`CredentialStore::save_credential`], which
    /// rejects ids already on file.
    pub async fn finish_registration(
        &self,
        account_id: &str,
        response: &RegistrationResponse,
    ) -> Result<VerificationResult, StoreError> {
        let stored = self.store.take_challenge(account_id).await?;

        let outcome = response.decode().and_then(|request| {
            verify_registration(
                &self.config,
                &self.challenges,
                &request,
                account_id,
                stored.as_ref(),
                Utc::now(),
            )
        });

        Ok(match outcome {
            Ok(credential) => {
                info!(
                    account_id = %account_id,
                    credential_id = %credential.id,
                    format = %credential.format,
                    "registration verified"
                );
                VerificationResult::success(Some(credential))
            }
            Err(err) => {
                warn!(
                    account_id = %account_id,
                    reason = ?err.reason(),
                    error = %err,
                    "registration rejected"
                );
                VerificationResult::failure(&err)
            }
        })
    }

    pub async fn begin_authentication(
        &self,
        account_id: &str,
    ) -> Result<AuthenticationOptions, CeremonyError> {
        let challenge = self.issue_challenge(account_id).await?;
        let allowed_credential_ids = self
            .store
            .credentials_for(account_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        info!(account_id = %account_id, "authentication started");

        Ok(AuthenticationOptions {
            challenge: challenge.encoded(),
            relying_party_id: self.config.rp_id.clone(),
            allowed_credential_ids,
            timeout_ms: self.timeout_ms(),
        })
    }

    /// Verifies an authentication response and, on success, advances the
    /// stored signature counter.
    ///
    /// Submitting the same response twice fails either way, but with a
    /// different reason per challenge mode. With
    /// [`ChallengeMode::Opaque`](crate::ChallengeMode::Opaque) the
    /// first attempt consumed the challenge, so the second fails with
    /// `ChallengeMismatch`. A signed token still validates on its own, so the
    /// second attempt reaches the counter check and fails with `CounterReplay`.
    pub async fn finish_authentication(
        &self,
        response: &AuthenticationResponse,
    ) -> Result<VerificationResult, StoreError> {
        let request = match response.decode() {
            Ok(request) => request,
            Err(err) => return Ok(self.reject_authentication(None, err)),
        };

        let credential_id = encode_credential_id(&request.raw_id);
        let Some(credential) = self.store.find_credential(&credential_id).await? else {
            return Ok(self.reject_authentication(None, WebAuthnError::UnknownCredential));
        };
        let account_id = credential.owner_account_id;

        let stored_credentials = self.store.credentials_for(&account_id).await?;
        let stored_challenge = self.store.take_challenge(&account_id).await?;

        let outcome = match verify_authentication(
            &self.config,
            &self.challenges,
            &request,
            &stored_credentials,
            stored_challenge.as_ref(),
            Utc::now(),
        ) {
            Ok(outcome) => outcome,
            Err(err) => return Ok(self.reject_authentication(Some(&account_id), err)),
        };

        // A concurrent assertion may have advanced the counter since it was read.
        if !self
            .store
            .update_counter(&outcome.credential_id, outcome.new_counter)
            .await?
        {
            let err = WebAuthnError::CounterReplay {
                stored: outcome.previous_counter,
                presented: outcome.new_counter,
            };
            return Ok(self.reject_authentication(Some(&account_id), err));
        }

        info!(
            account_id = %account_id,
            credential_id = %outcome.credential_id,
            counter = outcome.new_counter,
            "authentication verified"
        );
        Ok(VerificationResult::success(None))
    }

    fn reject_authentication(&self, account_id: Option<&str>, err: WebAuthnError) -> VerificationResult {
        warn!(
            account_id = account_id.unwrap_or("<unresolved>"),
            reason = ?err.reason(),
            error = %err,
            "authentication rejected"
        );
        VerificationResult::failure(&err)
    }
}

/// Reads the challenge a client echoed back, for hosts that key their own
/// challenge storage by value rather than by account.
pub fn presented_challenge(client_data_json: &[u8]) -> Result<Vec<u8>, WebAuthnError> {
    ClientData::from_json(client_data_json)?.challenge_bytes()
}
