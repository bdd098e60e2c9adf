pub mod assertion;
pub mod attestation;
pub mod authenticator;
pub mod ceremony;
pub mod challenge;
pub mod client_data;
pub mod config;
pub mod cose;
pub mod error;
pub mod pem;
pub mod store;
pub mod types;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ceremony::RelyingParty;
pub use config::{ChallengeMode, RelyingPartyConfig};
pub use error::{CeremonyError, FailureReason, StoreError, WebAuthnError};
pub use store::{CredentialStore, MemoryStore};
pub use types::{
    AuthenticationOptions, AuthenticationResponse, Credential, Format, RegistrationOptions,
    RegistrationResponse, VerificationResult,
};
