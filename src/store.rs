//! Credential store contract.
//!
//! Provides storage for:
//! - **Challenges**: one outstanding challenge per account. Taking it removes
//!   it, so a value can satisfy at most one verification.
//! - **Credentials**: registered authenticators keyed by credential id.
//!
//! [`MemoryStore`] is a process-local implementation; production hosts put
//! their own database behind [`CredentialStore`].

use crate::challenge::Challenge;
use crate::error::StoreError;
use crate::types::Credential;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Replaces any outstanding challenge for the challenge's account.
    async fn save_challenge(&self, challenge: Challenge) -> Result<(), StoreError>;

    /// Atomically removes and returns the account's outstanding challenge.
    async fn take_challenge(&self, account_id: &str) -> Result<Option<Challenge>, StoreError>;

    async fn credentials_for(&self, account_id: &str) -> Result<Vec<Credential>, StoreError>;

    async fn find_credential(&self, credential_id: &str)
        -> Result<Option<Credential>, StoreError>;

    /// Fails with [`StoreError::DuplicateCredential`] if the id is on file.
    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError>;

    /// Stores `counter` only if it is strictly greater than the stored one.
    /// Returns `false` when the stored counter was not advanced.
    async fn update_counter(&self, credential_id: &str, counter: u32) -> Result<bool, StoreError>;
}

/// In-memory store backed by `DashMap`.
#[derive(Default)]
pub struct MemoryStore {
    challenges: DashMap<String, Challenge>,
    credentials: DashMap<String, Credential>,
}

/// Store statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub pending_challenges: usize,
    pub credentials: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired challenges (called periodically by the host)
    pub fn cleanup_expired(&self, now: DateTime<Utc>) {
        self.challenges.retain(|_, challenge| !challenge.is_expired(now));
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pending_challenges: self.challenges.len(),
            credentials: self.credentials.len(),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("challenges", &self.challenges.len())
            .field("credentials", &self.credentials.len())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn save_challenge(&self, challenge: Challenge) -> Result<(), StoreError> {
        self.challenges
            .insert(challenge.account_id.clone(), challenge);
        Ok(())
    }

    async fn take_challenge(&self, account_id: &str) -> Result<Option<Challenge>, StoreError> {
        Ok(self.challenges.remove(account_id).map(|(_, c)| c))
    }

    async fn credentials_for(&self, account_id: &str) -> Result<Vec<Credential>, StoreError> {
        Ok(self
            .credentials
            .iter()
            .filter(|entry| entry.owner_account_id == account_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_credential(
        &self,
        credential_id: &str,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .credentials
            .get(credential_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError> {
        match self.credentials.entry(credential.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateCredential(credential.id)),
            Entry::Vacant(slot) => {
                slot.insert(credential);
                Ok(())
            }
        }
    }

    async fn update_counter(&self, credential_id: &str, counter: u32) -> Result<bool, StoreError> {
        let mut entry = self
            .credentials
            .get_mut(credential_id)
            .ok_or_else(|| StoreError::UnknownCredential(credential_id.to_string()))?;
        if counter <= entry.signature_counter {
            return Ok(false);
        }
        entry.signature_counter = counter;
        Ok(true)
    }
}
