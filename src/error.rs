use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a registration or authentication response is rejected.
///
/// Every variant is terminal for the attempt that produced it. Hosts should
/// log the variant and show end users [`crate::VerificationResult::public_message`]
/// instead of the error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebAuthnError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("malformed authenticator data: {0}")]
    MalformedAuthenticatorData(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported attestation format: {0}")]
    UnsupportedAttestationFormat(String),

    #[error("origin mismatch: expected {expected}, got {actual}")]
    OriginMismatch { expected: String, actual: String },

    #[error("relying party id hash does not match the configured relying party")]
    RelyingPartyMismatch,

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("attested credential data missing from authenticator data")]
    MissingCredentialData,

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("unknown credential")]
    UnknownCredential,

    #[error("user presence flag not set")]
    UserNotPresent,

    #[error("user verification flag not set")]
    UserNotVerified,

    #[error("signature counter {presented} is not greater than stored counter {stored}")]
    CounterReplay { stored: u32, presented: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl WebAuthnError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::MalformedResponse(_) => FailureReason::MalformedResponse,
            Self::MalformedAuthenticatorData(_) => FailureReason::MalformedAuthenticatorData,
            Self::UnsupportedAlgorithm(_) => FailureReason::UnsupportedAlgorithm,
            Self::UnsupportedAttestationFormat(_) => FailureReason::UnsupportedAttestationFormat,
            Self::OriginMismatch { .. } => FailureReason::OriginMismatch,
            Self::RelyingPartyMismatch => FailureReason::RelyingPartyMismatch,
            Self::ChallengeExpired => FailureReason::ChallengeExpired,
            Self::ChallengeMismatch => FailureReason::ChallengeMismatch,
            Self::MissingCredentialData => FailureReason::MissingCredentialData,
            Self::SignatureInvalid => FailureReason::SignatureInvalid,
            Self::UnknownCredential => FailureReason::UnknownCredential,
            Self::UserNotPresent => FailureReason::UserNotPresent,
            Self::UserNotVerified => FailureReason::UserNotVerified,
            Self::CounterReplay { .. } => FailureReason::CounterReplay,
            Self::Configuration(_) => FailureReason::Configuration,
        }
    }

    pub(crate) fn malformed_data(msg: impl Into<String>) -> Self {
        Self::MalformedAuthenticatorData(msg.into())
    }

    pub(crate) fn malformed_response(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }
}

/// Field-free counterpart of [`WebAuthnError`], suitable for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MalformedResponse,
    MalformedAuthenticatorData,
    UnsupportedAlgorithm,
    UnsupportedAttestationFormat,
    OriginMismatch,
    RelyingPartyMismatch,
    ChallengeExpired,
    ChallengeMismatch,
    MissingCredentialData,
    SignatureInvalid,
    UnknownCredential,
    UserNotPresent,
    UserNotVerified,
    CounterReplay,
    Configuration,
}

/// Errors raised by a [`crate::store::CredentialStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("credential {0} is already registered")]
    DuplicateCredential(String),

    #[error("credential {0} not found")]
    UnknownCredential(String),
}

/// Errors from `RelyingParty::begin_registration` and
/// `RelyingParty::begin_authentication`.
#[derive(Debug, Error)]
pub enum CeremonyError {
    /// The random source or the challenge token signer failed.
    #[error("challenge could not be issued: {0}")]
    ChallengeIssuance(#[source] WebAuthnError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
