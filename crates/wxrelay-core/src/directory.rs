use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::{domain::GroupInfo, ports::GroupSource, Result};

/// Immutable view of the directory at one point in time.
#[derive(Clone, Debug, Default)]
pub struct GroupSnapshot {
    ids: Arc<HashSet<String>>,
}

impl GroupSnapshot {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Arc::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.ids.contains(group_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in sorted order (stable output for the status surface).
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = self.ids.iter().cloned().collect();
        out.sort();
        out
    }
}

/// Membership cache of the groups the session can see.
///
/// The set is replaced wholesale on every successful refresh; readers always
/// get either the old or the new snapshot.
pub struct GroupDirectory {
    settle: Duration,
    current: RwLock<GroupSnapshot>,
}

impl GroupDirectory {
    /// `settle` is waited before each listing so the backend can converge
    /// membership after recent changes.
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            current: RwLock::new(GroupSnapshot::default()),
        }
    }

    pub async fn snapshot(&self) -> GroupSnapshot {
        self.current.read().await.clone()
    }

    pub async fn contains(&self, group_id: &str) -> bool {
        self.current.read().await.contains(group_id)
    }

    /// Re-list groups from `source` and swap the set in.
    ///
    /// On failure the existing set is left untouched and the error returned;
    /// the directory never retries on its own.
    pub async fn refresh<S>(&self, source: &S) -> Result<Vec<GroupInfo>>
    where
        S: GroupSource + ?Sized,
    {
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }

        let groups = source.list_groups().await?;
        let next = GroupSnapshot::from_ids(groups.iter().map(|g| g.id.clone()));
        let count = next.len();
        *self.current.write().await = next;

        tracing::info!(groups = count, "group directory refreshed");
        Ok(groups)
    }
}
