//! Queue storage.
//!
//! Every write that follows a claim carries the claim token (the `trigger_at`
//! the claim wrote) and only applies while the stored value still matches.
//! Such writes return `false` instead of failing when the row moved on.
//!
//! A unique-key overwrite always changes `trigger_at`, moving it back one
//! microsecond when the requested value equals the stored one, so a claim
//! racing the overwrite fails instead of running the replaced state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobforge_core::{EntryId, FailedEntryId};

use super::types::{FailedEntry, NewEntry, QueueEntry, QueueStats};

/// Queue store abstraction.
pub trait QueueStore: Send + Sync {
    /// Insert an entry, or overwrite the entry holding the same unique key.
    ///
    /// Returns the id of the stored row (the original id on overwrite). An
    /// overwrite clears `last_run_at` and resets `attempts`.
    fn upsert(&self, entry: NewEntry) -> Result<EntryId, StoreError>;

    fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError>;

    fn get_by_key(&self, unique_key: &str) -> Result<Option<QueueEntry>, StoreError>;

    /// Entries due at `now` with the given manual flag, `priority DESC, trigger_at ASC`.
    fn select_runnable(
        &self,
        manual: bool,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Compare-and-swap claim: set `trigger_at := claimed_until` and
    /// `last_run_at := now` only if `trigger_at` still equals `observed`.
    fn claim(
        &self,
        id: EntryId,
        observed: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Restore `trigger_at` to `original` if the claim `token` is still in place.
    fn revert_claim(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        original: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete a claimed entry.
    fn complete_claimed(&self, id: EntryId, token: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Persist new state and schedule of a claimed entry.
    fn reschedule(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        state: &[u8],
        trigger_at: DateTime<Utc>,
        increment_attempts: bool,
    ) -> Result<bool, StoreError>;

    /// Record `failed` and delete the claimed entry.
    ///
    /// The failed entry is always written; the return value says whether the
    /// queue row was still there to delete.
    fn dead_letter(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        failed: FailedEntry,
    ) -> Result<bool, StoreError>;

    /// Unconditional delete (cancellation).
    fn delete(&self, id: EntryId) -> Result<bool, StoreError>;

    fn delete_by_key(&self, unique_key: &str) -> Result<bool, StoreError>;

    /// Most recent failures first.
    fn list_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError>;

    fn get_failed(&self, id: FailedEntryId) -> Result<Option<FailedEntry>, StoreError>;

    fn delete_failed(&self, id: FailedEntryId) -> Result<bool, StoreError>;

    /// Delete failures recorded before `before`; returns how many.
    fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Earliest `trigger_at` among automatic entries.
    fn next_automatic_trigger(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError>;

    /// Entries with `trigger_at < before`, oldest first.
    fn overdue(
        &self,
        manual: bool,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError>;
}

/// `trigger_at` for an overwrite of a row currently holding `stored`.
///
/// The value must differ from `stored`: a claim in flight observed `stored`
/// and would otherwise run the replaced state and then delete the new one.
fn overwrite_trigger_at(stored: DateTime<Utc>, requested: DateTime<Utc>) -> DateTime<Utc> {
    if stored == requested {
        requested - chrono::Duration::microseconds(1)
    } else {
        requested
    }
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
struct Tables {
    entries: HashMap<EntryId, QueueEntry>,
    unique: HashMap<String, EntryId>,
    failed: HashMap<FailedEntryId, FailedEntry>,
}

impl Tables {
    /// Entry `id` if its `trigger_at` equals `token`.
    fn claimed_mut(&mut self, id: EntryId, token: DateTime<Utc>) -> Option<&mut QueueEntry> {
        self.entries.get_mut(&id).filter(|e| e.trigger_at == token)
    }

    fn remove(&mut self, id: EntryId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(key) = &entry.unique_key {
            self.unique.remove(key);
        }
        Some(entry)
    }
}

/// In-memory queue store for tests/dev.
///
/// One lock guards both tables so every operation is atomic, including
/// the claim compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    tables: RwLock<Tables>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl QueueStore for InMemoryQueueStore {
    fn upsert(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
        let mut tables = self.write()?;

        if let Some(key) = &entry.unique_key {
            if let Some(&id) = tables.unique.get(key) {
                if let Some(existing) = tables.entries.get_mut(&id) {
                    existing.work_type = entry.work_type;
                    existing.state = entry.state;
                    existing.trigger_at = overwrite_trigger_at(existing.trigger_at, entry.trigger_at);
                    existing.is_manual = entry.is_manual;
                    existing.priority = entry.priority;
                    existing.last_run_at = None;
                    existing.attempts = 0;
                    return Ok(id);
                }
            }
        }

        let id = EntryId::new();
        if let Some(key) = &entry.unique_key {
            tables.unique.insert(key.clone(), id);
        }
        tables.entries.insert(
            id,
            QueueEntry {
                id,
                work_type: entry.work_type,
                state: entry.state,
                unique_key: entry.unique_key,
                trigger_at: entry.trigger_at,
                last_run_at: None,
                is_manual: entry.is_manual,
                priority: entry.priority,
                attempts: 0,
            },
        );
        Ok(id)
    }

    fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.read()?.entries.get(&id).cloned())
    }

    fn get_by_key(&self, unique_key: &str) -> Result<Option<QueueEntry>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .unique
            .get(unique_key)
            .and_then(|id| tables.entries.get(id))
            .cloned())
    }

    fn select_runnable(
        &self,
        manual: bool,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .entries
            .values()
            .filter(|e| e.is_manual == manual && e.trigger_at <= now)
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.trigger_at.cmp(&b.trigger_at))
                .then(a.id.cmp(&b.id))
        });
        result.truncate(limit);
        Ok(result)
    }

    fn claim(
        &self,
        id: EntryId,
        observed: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.claimed_mut(id, observed) {
            Some(entry) => {
                entry.trigger_at = claimed_until;
                entry.last_run_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn revert_claim(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        original: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.claimed_mut(id, token) {
            Some(entry) => {
                entry.trigger_at = original;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn complete_claimed(&self, id: EntryId, token: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        if tables.claimed_mut(id, token).is_none() {
            return Ok(false);
        }
        Ok(tables.remove(id).is_some())
    }

    fn reschedule(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        state: &[u8],
        trigger_at: DateTime<Utc>,
        increment_attempts: bool,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.claimed_mut(id, token) {
            Some(entry) => {
                entry.state = state.to_vec();
                entry.trigger_at = trigger_at;
                if increment_attempts {
                    entry.attempts = entry.attempts.saturating_add(1);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dead_letter(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        failed: FailedEntry,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        tables.failed.insert(failed.id, failed);
        if tables.claimed_mut(id, token).is_none() {
            return Ok(false);
        }
        Ok(tables.remove(id).is_some())
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove(id).is_some())
    }

    fn delete_by_key(&self, unique_key: &str) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.unique.get(unique_key).copied() {
            Some(id) => Ok(tables.remove(id).is_some()),
            None => Ok(false),
        }
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables.failed.values().cloned().collect();
        result.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn get_failed(&self, id: FailedEntryId) -> Result<Option<FailedEntry>, StoreError> {
        Ok(self.read()?.failed.get(&id).cloned())
    }

    fn delete_failed(&self, id: FailedEntryId) -> Result<bool, StoreError> {
        Ok(self.write()?.failed.remove(&id).is_some())
    }

    fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let len = tables.failed.len();
        tables.failed.retain(|_, f| f.failed_at >= before);
        Ok((len - tables.failed.len()) as u64)
    }

    fn next_automatic_trigger(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read()?
            .entries
            .values()
            .filter(|e| !e.is_manual)
            .map(|e| e.trigger_at)
            .min())
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let tables = self.read()?;
        let mut stats = QueueStats {
            failed: tables.failed.len() as u64,
            ..QueueStats::default()
        };

        for entry in tables.entries.values() {
            if entry.is_manual {
                stats.manual_pending += 1;
                continue;
            }
            stats.automatic_pending += 1;
            if entry.trigger_at <= now {
                stats.automatic_runnable += 1;
            }
            stats.next_automatic_trigger = Some(match stats.next_automatic_trigger {
                Some(t) => t.min(entry.trigger_at),
                None => entry.trigger_at,
            });
        }

        Ok(stats)
    }

    fn overdue(
        &self,
        manual: bool,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .entries
            .values()
            .filter(|e| e.is_manual == manual && e.trigger_at < before)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.trigger_at.cmp(&b.trigger_at).then(a.id.cmp(&b.id)));
        result.truncate(limit);
        Ok(result)
    }
}
