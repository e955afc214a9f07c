//! In-memory [`Backend`], for tests and ephemeral stores.
//!
//! History is a `Vec` in revision order behind an `RwLock`. Listings scan it,
//! which is fine for the sizes this backend is meant for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Backend;
use crate::error::{Error, Result};
use crate::types::{KeyPattern, KeyValue, Revision};

#[derive(Debug, Default)]
struct State {
    /// Every row, ascending by revision.
    rows: Vec<KeyValue>,
    next_id: i64,
    high_water: Revision,
    compacted: Revision,
}

impl State {
    /// Latest row per matching key at or below `at`, tombstones removed.
    fn latest(
        &self,
        pattern: &KeyPattern,
        at: Option<Revision>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Vec<KeyValue> {
        let mut latest: BTreeMap<&str, &KeyValue> = BTreeMap::new();

        for row in &self.rows {
            if at.is_some_and(|at| row.revision > at) {
                break;
            }
            if !pattern.matches(&row.key) {
                continue;
            }
            if after_key.is_some_and(|after| row.key.as_str() <= after) {
                continue;
            }
            latest.insert(row.key.as_str(), row);
        }

        latest
            .into_values()
            .filter(|row| !row.del)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// [`Backend`] that keeps all history in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of history rows held, tombstones included.
    pub fn len(&self) -> usize {
        self.read().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Backend("memory backend lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Backend("memory backend lock poisoned".to_string()))
    }
}

impl Backend for MemoryBackend {
    fn max_revision(&self) -> Result<Revision> {
        Ok(self.read()?.high_water)
    }

    fn insert(&self, row: &KeyValue) -> Result<i64> {
        let mut state = self.write()?;

        if let Some(last) = state.rows.last() {
            if row.revision <= last.revision {
                return Err(Error::Backend(format!(
                    "revision {} is not after last stored revision {}",
                    row.revision, last.revision
                )));
            }
        }

        state.next_id += 1;
        let id = state.next_id;

        let mut stored = row.clone();
        stored.id = id;
        state.high_water = state.high_water.max(stored.revision);
        state.rows.push(stored);

        Ok(id)
    }

    fn list_current(&self, pattern: &KeyPattern, limit: usize) -> Result<Vec<KeyValue>> {
        Ok(self.read()?.latest(pattern, None, None, limit))
    }

    fn list_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        Ok(self.read()?.latest(pattern, Some(revision), None, limit))
    }

    fn list_resume_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        resume_from_key: &str,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        Ok(self
            .read()?
            .latest(pattern, Some(revision), Some(resume_from_key), limit))
    }

    fn replay_history(&self, pattern: &KeyPattern, up_to: Revision) -> Result<Vec<KeyValue>> {
        Ok(self
            .read()?
            .rows
            .iter()
            .take_while(|row| row.revision <= up_to)
            .filter(|row| pattern.matches(&row.key))
            .cloned()
            .collect())
    }

    fn sweep(&self, cutoff_secs: i64) -> Result<usize> {
        let mut state = self.write()?;

        // Keys whose latest row has expired lose their whole chain.
        let mut latest: BTreeMap<&str, &KeyValue> = BTreeMap::new();
        for row in &state.rows {
            latest.insert(row.key.as_str(), row);
        }
        let expired_keys: BTreeSet<String> = latest
            .into_iter()
            .filter(|(_, row)| row.is_expired(cutoff_secs))
            .map(|(key, _)| key.to_string())
            .collect();

        let before = state.rows.len();
        state
            .rows
            .retain(|row| !row.is_expired(cutoff_secs) && !expired_keys.contains(&row.key));
        Ok(before - state.rows.len())
    }

    fn compact(&self, revision: Revision) -> Result<usize> {
        let mut state = self.write()?;

        // Latest revision per key at or below the compaction point.
        let mut settled: BTreeMap<String, Revision> = BTreeMap::new();
        for row in state.rows.iter().take_while(|row| row.revision <= revision) {
            settled.insert(row.key.clone(), row.revision);
        }

        let before = state.rows.len();
        state.rows.retain(|row| {
            if row.revision > revision {
                return true;
            }
            let superseded = settled
                .get(&row.key)
                .is_some_and(|latest| *latest > row.revision);
            !(superseded || row.del)
        });

        state.compacted = state.compacted.max(revision);
        Ok(before - state.rows.len())
    }

    fn compacted_revision(&self) -> Result<Revision> {
        Ok(self.read()?.compacted)
    }
}
