//! Relying-party configuration.

use crate::error::WebAuthnError;
use chrono::Duration;
use url::Url;

const DEFAULT_CHALLENGE_TTL_SECS: i64 = 300;
const MIN_SECRET_LEN: usize = 32;

/// How challenges are produced and checked. Exactly one mode is active.
#[derive(Clone, PartialEq, Eq)]
pub enum ChallengeMode {
    /// Random bytes stored by the host and compared on return.
    Opaque,
    /// Self-contained HS256 token carrying its own account binding and expiry.
    SignedToken { secret: Vec<u8> },
}

impl std::fmt::Debug for ChallengeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeMode::Opaque => f.write_str("Opaque"),
            ChallengeMode::SignedToken { .. } => f.write_str("SignedToken(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelyingPartyConfig {
    pub rp_id: String,
    pub rp_name: String,
    origin: Url,
    pub challenge_ttl: Duration,
    pub challenge_mode: ChallengeMode,
    /// Accept tpm attestation statements without certificate-chain checks.
    pub accept_unverified_tpm: bool,
}

impl RelyingPartyConfig {
    /// # Arguments
    ///
    /// * `rp_id` - Relying Party ID (typically the domain name)
    /// * `origin` - origin the browser reports in client data
    /// * `rp_name` - Human-readable name for the Relying Party
    pub fn new(rp_id: &str, origin: &str, rp_name: &str) -> Result<Self, WebAuthnError> {
        if rp_id.is_empty() {
            return Err(WebAuthnError::Configuration(
                "Relying party ID cannot be empty".into(),
            ));
        }

        let origin = Url::parse(origin)
            .map_err(|e| WebAuthnError::Configuration(format!("Invalid origin URL: {}", e)))?;
        let is_localhost = origin.host_str() == Some("localhost");
        if origin.scheme() != "https" && !(origin.scheme() == "http" && is_localhost) {
            return Err(WebAuthnError::Configuration(
                "Origin must be https:// except for localhost".into(),
            ));
        }

        Ok(Self {
            rp_id: rp_id.to_string(),
            rp_name: rp_name.to_string(),
            origin,
            challenge_ttl: Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS),
            challenge_mode: ChallengeMode::Opaque,
            accept_unverified_tpm: false,
        })
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WEBAUTHN_RP_ID` - Relying Party ID (default: "localhost")
    /// - `WEBAUTHN_RP_ORIGIN` - RP origin URL (default: "http://localhost:3001")
    /// - `WEBAUTHN_RP_NAME` - RP display name (default: "WebAuthn Verify")
    /// - `WEBAUTHN_CHALLENGE_TTL_SECS` - challenge lifetime (default: 300)
    /// - `WEBAUTHN_CHALLENGE_MODE` - `opaque` or `signed` (default: `opaque`)
    /// - `WEBAUTHN_CHALLENGE_SECRET` - HMAC secret, required for `signed`
    /// - `WEBAUTHN_ACCEPT_UNVERIFIED_TPM` - `true` to accept tpm attestation
    pub fn from_env() -> Result<Self, WebAuthnError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let rp_id = var("WEBAUTHN_RP_ID").unwrap_or_else(|| "localhost".to_string());
        let rp_origin =
            var("WEBAUTHN_RP_ORIGIN").unwrap_or_else(|| "http://localhost:3001".to_string());
        let rp_name = var("WEBAUTHN_RP_NAME").unwrap_or_else(|| "WebAuthn Verify".to_string());

        let mut config = Self::new(&rp_id, &rp_origin, &rp_name)?;

        if let Some(ttl) = var("WEBAUTHN_CHALLENGE_TTL_SECS") {
            let secs: i64 = ttl.parse().map_err(|_| {
                WebAuthnError::Configuration(format!("Invalid challenge TTL: {}", ttl))
            })?;
            config = config.with_challenge_ttl(Duration::seconds(secs))?;
        }

        match var("WEBAUTHN_CHALLENGE_MODE").as_deref() {
            None | Some("opaque") => {}
            Some("signed") => {
                let secret = var("WEBAUTHN_CHALLENGE_SECRET").ok_or_else(|| {
                    WebAuthnError::Configuration(
                        "WEBAUTHN_CHALLENGE_SECRET is required for signed challenges".into(),
                    )
                })?;
                config = config.with_signed_challenges(secret.into_bytes())?;
            }
            Some(other) => {
                return Err(WebAuthnError::Configuration(format!(
                    "Unknown challenge mode: {}",
                    other
                )))
            }
        }

        if let Some(flag) = var("WEBAUTHN_ACCEPT_UNVERIFIED_TPM") {
            config.accept_unverified_tpm = flag.parse().map_err(|_| {
                WebAuthnError::Configuration(format!("Invalid boolean: {}", flag))
            })?;
        }

        Ok(config)
    }

    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Result<Self, WebAuthnError> {
        if ttl <= Duration::zero() {
            return Err(WebAuthnError::Configuration(
                "Challenge TTL must be positive".into(),
            ));
        }
        self.challenge_ttl = ttl;
        Ok(self)
    }

    pub fn with_signed_challenges(mut self, secret: Vec<u8>) -> Result<Self, WebAuthnError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(WebAuthnError::Configuration(format!(
                "Challenge secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        self.challenge_mode = ChallengeMode::SignedToken { secret };
        Ok(self)
    }

    pub fn with_unverified_tpm(mut self, accept: bool) -> Self {
        self.accept_unverified_tpm = accept;
        self
    }

    /// Origin in the serialized form browsers put into client data.
    pub fn expected_origin(&self) -> String {
        self.origin.origin().ascii_serialization()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config =
            RelyingPartyConfig::new("example.com", "https://example.com/", "Example").unwrap();
        assert_eq!(config.expected_origin(), "https://example.com");
        assert_eq!(config.challenge_mode, ChallengeMode::Opaque);
        assert!(!config.accept_unverified_tpm);
    }

    #[test]
    fn test_origin_port_is_kept() {
        let config =
            RelyingPartyConfig::new("localhost", "http://localhost:3001", "Local").unwrap();
        assert_eq!(config.expected_origin(), "http://localhost:3001");
    }

    #[test]
    fn test_rejects_plain_http() {
        assert!(RelyingPartyConfig::new("example.com", "http://example.com", "x").is_err());
        assert!(RelyingPartyConfig::new("", "https://example.com", "x").is_err());
    }

    #[test]
    fn test_signed_mode_needs_long_secret() {
        let config = RelyingPartyConfig::new("example.com", "https://example.com", "x").unwrap();
        assert!(config.clone().with_signed_challenges(b"short".to_vec()).is_err());
        let config = config.with_signed_challenges(vec![7u8; 32]).unwrap();
        assert!(matches!(
            config.challenge_mode,
            ChallengeMode::SignedToken { .. }
        ));
        assert!(!format!("{:?}", config).contains("7, 7"));
    }

    #[test]
    fn test_ttl_must_be_positive() {
        let config = RelyingPartyConfig::new("example.com", "https://example.com", "x").unwrap();
        assert!(config.with_challenge_ttl(Duration::zero()).is_err());
    }
}
