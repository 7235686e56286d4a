use std::env;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{errors::Error, Result};

/// Environment variable that mirrors `blockedGroups`.
pub const BLOCKED_GROUPS_ENV: &str = "BLOCKED_GROUPS";

/// Operator-editable configuration exposed by the status surface.
///
/// The write-guard secret is never part of this struct so it cannot leak
/// through serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySettings {
    #[serde(default)]
    pub blocked_groups: Vec<String>,
}

/// In-memory settings with a shared-secret write gate.
///
/// Nothing here is durable: accepted writes are mirrored into the process
/// environment only.
pub struct SettingsStore {
    secret: Option<String>,
    current: RwLock<RelaySettings>,
}

impl SettingsStore {
    pub fn new(blocked_groups: Vec<String>, secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            current: RwLock::new(RelaySettings { blocked_groups }),
        }
    }

    pub async fn current(&self) -> RelaySettings {
        self.current.read().await.clone()
    }

    /// Compare `candidate` with the configured secret.
    ///
    /// Errors with `Config` when no secret is configured at all.
    pub fn verify(&self, candidate: &str) -> Result<bool> {
        let Some(secret) = &self.secret else {
            return Err(Error::Config("PAGE_PASSWORD is not set".to_string()));
        };
        Ok(constant_time_eq(secret.as_bytes(), candidate.as_bytes()))
    }

    /// Replace `blockedGroups` if `candidate` matches the secret.
    pub async fn replace_blocked_groups(
        &self,
        candidate: &str,
        blocked_groups: Vec<String>,
    ) -> Result<RelaySettings> {
        if !self.verify(candidate)? {
            tracing::warn!("settings write rejected: wrong password");
            return Err(Error::Unauthorized("wrong password".to_string()));
        }

        let updated = {
            let mut cur = self.current.write().await;
            cur.blocked_groups = blocked_groups;
            cur.clone()
        };

        let json = serde_json::to_string(&updated.blocked_groups)?;
        env::set_var(BLOCKED_GROUPS_ENV, &json);
        tracing::info!("blockedGroups updated: {json}");

        Ok(updated)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized_and_leaves_settings() {
        let store = SettingsStore::new(groups(&["G1"]), Some("s3cret".to_string()));

        let err = store
            .replace_blocked_groups("nope", groups(&["G2"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(store.current().await.blocked_groups, groups(&["G1"]));
    }

    #[tokio::test]
    async fn right_secret_replaces_and_mirrors_env() {
        let store = SettingsStore::new(Vec::new(), Some("s3cret".to_string()));

        let out = store
            .replace_blocked_groups("s3cret", groups(&["G2", "G3"]))
            .await
            .unwrap();

        assert_eq!(out.blocked_groups, groups(&["G2", "G3"]));
        assert_eq!(store.current().await, out);
        assert_eq!(
            env::var(BLOCKED_GROUPS_ENV).unwrap(),
            r#"["G2","G3"]"#.to_string()
        );
    }

    #[test]
    fn verify_without_secret_is_config_error() {
        let store = SettingsStore::new(Vec::new(), Some(String::new()));
        assert!(matches!(store.verify("x"), Err(Error::Config(_))));
    }

    #[test]
    fn serializes_without_secret() {
        let s = RelaySettings {
            blocked_groups: groups(&["G1"]),
        };
        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            serde_json::json!({"blockedGroups": ["G1"]})
        );
    }
}
