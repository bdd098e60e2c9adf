//! Challenge issuance and validation.
//!
//! A challenge is bound to one account and expires `ttl` after issuance. The
//! active [`ChallengeMode`] decides whether the value is an opaque nonce the
//! host must keep, or a signed token that carries its own expiry.

use crate::config::ChallengeMode;
use crate::error::WebAuthnError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use openssl::memcmp;
use serde::{Deserialize, Serialize};

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Raw challenge bytes: the nonce itself, or the UTF-8 token.
    pub value: Vec<u8>,
    pub account_id: String,
    pub issued_at: DateTime<Utc>,
    #[serde(with = "ttl_seconds")]
    pub ttl: Duration,
}

mod ttl_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(ttl.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::seconds)
    }
}

impl Challenge {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// The form placed in options and echoed back in client data.
    pub fn encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.value)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengeClaims {
    sub: String,
    iat: i64,
    exp: i64,
    nonce: String,
}

#[derive(Debug, Clone)]
pub struct ChallengeManager {
    mode: ChallengeMode,
    ttl: Duration,
}

impl ChallengeManager {
    pub fn new(mode: ChallengeMode, ttl: Duration) -> Self {
        Self { mode, ttl }
    }

    pub fn is_stateless(&self) -> bool {
        matches!(self.mode, ChallengeMode::SignedToken { .. })
    }

    pub fn issue(&self, account_id: &str) -> Result<Challenge, WebAuthnError> {
        self.issue_at(account_id, Utc::now())
    }

    pub fn issue_at(&self, account_id: &str, now: DateTime<Utc>) -> Result<Challenge, WebAuthnError> {
        let nonce = random_bytes(NONCE_LEN)?;

        let value = match &self.mode {
            ChallengeMode::Opaque => nonce,
            ChallengeMode::SignedToken { secret } => {
                let claims = ChallengeClaims {
                    sub: account_id.to_string(),
                    iat: now.timestamp(),
                    exp: (now + self.ttl).timestamp(),
                    nonce: URL_SAFE_NO_PAD.encode(nonce),
                };
                jsonwebtoken::encode(
                    &Header::new(Algorithm::HS256),
                    &claims,
                    &EncodingKey::from_secret(secret),
                )
                .map_err(|e| {
                    WebAuthnError::Configuration(format!("failed to sign challenge: {}", e))
                })?
                .into_bytes()
            }
        };

        Ok(Challenge {
            value,
            account_id: account_id.to_string(),
            issued_at: now,
            ttl: self.ttl,
        })
    }

    /// Checks a presented challenge against what was issued to `account_id`.
    ///
    /// Opaque mode requires `stored` and compares bytes within its expiry.
    /// Signed mode verifies the token on its own; when `stored` is given it
    /// must also match, which keeps a stored token single-use.
    pub fn validate(
        &self,
        presented: &[u8],
        stored: Option<&Challenge>,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebAuthnError> {
        if let Some(stored) = stored {
            if stored.account_id != account_id {
                return Err(WebAuthnError::ChallengeMismatch);
            }
        }

        match &self.mode {
            ChallengeMode::Opaque => {
                let stored = stored.ok_or(WebAuthnError::ChallengeMismatch)?;
                if !constant_time_eq(presented, &stored.value) {
                    return Err(WebAuthnError::ChallengeMismatch);
                }
                if stored.is_expired(now) {
                    return Err(WebAuthnError::ChallengeExpired);
                }
                Ok(())
            }
            ChallengeMode::SignedToken { secret } => {
                if let Some(stored) = stored {
                    if !constant_time_eq(presented, &stored.value) {
                        return Err(WebAuthnError::ChallengeMismatch);
                    }
                }
                let token =
                    std::str::from_utf8(presented).map_err(|_| WebAuthnError::ChallengeMismatch)?;

                let mut validation = Validation::new(Algorithm::HS256);
                // expiry is compared against the caller's clock below
                validation.validate_exp = false;
                validation.required_spec_claims.clear();
                let claims = jsonwebtoken::decode::<ChallengeClaims>(
                    token,
                    &DecodingKey::from_secret(secret),
                    &validation,
                )
                .map_err(|_| WebAuthnError::ChallengeMismatch)?
                .claims;

                if claims.sub != account_id {
                    return Err(WebAuthnError::ChallengeMismatch);
                }
                if now.timestamp() >= claims.exp {
                    return Err(WebAuthnError::ChallengeExpired);
                }
                Ok(())
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && memcmp::eq(a, b)
}

pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>, WebAuthnError> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)
        .map_err(|e| WebAuthnError::Configuration(format!("random source failed: {}", e)))?;
    Ok(buf)
}
