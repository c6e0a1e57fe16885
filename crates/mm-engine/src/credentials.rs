//! Profile lookup contract.
//!
//! Credential storage itself lives outside the engine; instances only
//! need a way to resolve an opaque profile id into signing material and
//! API credentials at start.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
}

/// Credentials and signing material for one trading profile.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    /// Hex private key for on-chain settlement signing.
    pub private_key: String,
    /// Funder / proxy wallet address holding positions.
    pub funder_address: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Inactive profiles cannot start instances.
    pub active: bool,
}

/// Profile lookup contract. `Ok(None)` means "not found", which rejects
/// the instance start outright.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn lookup(&self, profile_id: &str) -> Result<Option<Profile>, ProfileError>;
}

/// In-memory profile store, seeded at composition time (e.g. from
/// environment variables in `main`).
#[derive(Default)]
pub struct StaticProfileStore {
    profiles: DashMap<String, Profile>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl ProfileStore for StaticProfileStore {
    async fn lookup(&self, profile_id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.get(profile_id).map(|p| p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, active: bool) -> Profile {
        Profile {
            id: id.to_string(),
            private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .to_string(),
            funder_address: "0x0000000000000000000000000000000000000001".to_string(),
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            api_passphrase: "p".to_string(),
            active,
        }
    }

    #[tokio::test]
    async fn test_lookup_hit_and_miss() {
        let store = StaticProfileStore::new();
        store.insert(profile("p1", true));

        let found = store.lookup("p1").await.unwrap();
        assert!(found.is_some());
        assert!(found.unwrap().active);

        assert!(store.lookup("missing").await.unwrap().is_none());
    }
}
