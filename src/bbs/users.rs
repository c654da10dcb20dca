//! BBS user directory: the name/QTH profile captured during first-connect.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::persistence::{keys, MemStore, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub callsign_base: String,
    pub name: String,
    pub qth: String,
}

pub struct BbsUsers<P: Store = MemStore> {
    profiles: Mutex<HashMap<String, UserProfile>>,
    persistence: Option<Arc<P>>,
}

impl<P: Store> BbsUsers<P> {
    pub fn new() -> Self {
        BbsUsers {
            profiles: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Arc<P>) -> Self {
        let loaded = persistence
            .load::<Vec<UserProfile>>(keys::BBS_USERS)
            .ok()
            .flatten()
            .unwrap_or_default();
        let profiles = loaded
            .into_iter()
            .map(|p| (p.callsign_base.clone(), p))
            .collect();
        BbsUsers {
            profiles: Mutex::new(profiles),
            persistence: Some(persistence),
        }
    }

    pub async fn get(&self, callsign_base: &str) -> Option<UserProfile> {
        self.profiles.lock().await.get(&callsign_base.to_ascii_uppercase()).cloned()
    }

    pub async fn upsert(&self, callsign_base: &str, name: String, qth: String) {
        let base = callsign_base.to_ascii_uppercase();
        {
            let mut profiles = self.profiles.lock().await;
            profiles.insert(
                base.clone(),
                UserProfile {
                    callsign_base: base,
                    name,
                    qth,
                },
            );
        }
        if let Some(persistence) = &self.persistence {
            let snapshot: Vec<UserProfile> = self.profiles.lock().await.values().cloned().collect();
            let _ = persistence.save(keys::BBS_USERS, &snapshot);
        }
    }
}

impl<P: Store> Default for BbsUsers<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let users: BbsUsers<MemStore> = BbsUsers::new();
        users.upsert("N0CALL", "Alice".into(), "Anytown, ST".into()).await;
        let profile = users.get("N0CALL").await.unwrap();
        assert_eq!(profile.name, "Alice");
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let users: BbsUsers<MemStore> = BbsUsers::new();
        users.upsert("n0call", "Alice".into(), "Anytown, ST".into()).await;
        assert!(users.get("N0CALL").await.is_some());
    }
}
