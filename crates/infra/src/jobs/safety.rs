//! Claim safety net.
//!
//! While a job runs, its queue row carries the claim token instead of its
//! real `trigger_at`. If the process dies before the result is persisted the
//! row would stay invisible until the claim window expires. The safety net
//! remembers the active claim so it can be put back:
//!
//! - [`ClaimGuard`] reverts on drop unless disarmed (early returns, unwinding);
//! - [`SafetyNet::restore`] reverts from outside the running job;
//! - [`SafetyNet::install_signal_hook`] calls it on SIGINT/SIGTERM and exits.
//!
//! Reverting is itself a conditional write, so restoring a claim that has
//! already been persisted or reclaimed does nothing.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use jobforge_core::EntryId;

use super::store::{QueueStore, StoreError};

/// Exit status after a termination signal (128 + SIGINT).
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// The claim currently held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveClaim {
    pub entry_id: EntryId,
    pub work_type: String,
    /// `trigger_at` written by the claim.
    pub token: DateTime<Utc>,
    /// `trigger_at` before the claim.
    pub original: DateTime<Utc>,
}

/// Shared slot for the active claim. Cloning shares the slot.
pub struct SafetyNet<S: QueueStore> {
    store: Arc<S>,
    active: Arc<Mutex<Option<ActiveClaim>>>,
}

impl<S: QueueStore> Clone for SafetyNet<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            active: self.active.clone(),
        }
    }
}

impl<S: QueueStore> SafetyNet<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Register `claim` as active until the returned guard is disarmed or dropped.
    pub fn arm(&self, claim: ActiveClaim) -> ClaimGuard<S> {
        *self.slot() = Some(claim.clone());
        ClaimGuard {
            net: self.clone(),
            claim,
            armed: true,
        }
    }

    pub fn active(&self) -> Option<ActiveClaim> {
        self.slot().clone()
    }

    pub fn is_armed(&self) -> bool {
        self.slot().is_some()
    }

    /// Revert the active claim, if any. Returns the entry that was restored.
    pub fn restore(&self) -> Result<Option<EntryId>, StoreError> {
        let Some(claim) = self.slot().take() else {
            return Ok(None);
        };
        let restored = self.revert(&claim)?;
        Ok(restored.then_some(claim.entry_id))
    }

    /// Body of the signal hook. Errors are logged, never returned.
    pub fn on_termination(&self) -> Option<EntryId> {
        warn!("termination signal received");
        match self.restore() {
            Ok(restored) => restored,
            Err(e) => {
                error!(error = %e, "failed to restore claim on termination");
                None
            }
        }
    }

    fn revert(&self, claim: &ActiveClaim) -> Result<bool, StoreError> {
        let restored = self
            .store
            .revert_claim(claim.entry_id, claim.token, claim.original)?;
        if restored {
            warn!(
                entry_id = %claim.entry_id,
                work_type = %claim.work_type,
                "restored claimed entry"
            );
        } else {
            debug!(entry_id = %claim.entry_id, "claim no longer held; nothing to restore");
        }
        Ok(restored)
    }

    /// Clear the slot if it still holds `claim`.
    fn release(&self, claim: &ActiveClaim) -> bool {
        let mut slot = self.slot();
        if slot.as_ref() == Some(claim) {
            *slot = None;
            return true;
        }
        false
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveClaim>> {
        // the slot is plain data, a poisoned lock still holds a valid value
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: QueueStore + 'static> SafetyNet<S> {
    /// Restore the active claim on Ctrl-C or SIGTERM, then exit with
    /// [`SIGNAL_EXIT_CODE`].
    ///
    /// A process holds one handler; installing a second one fails with
    /// [`ctrlc::Error::MultipleHandlers`].
    pub fn install_signal_hook(&self) -> Result<(), ctrlc::Error> {
        let net = self.clone();
        ctrlc::set_handler(move || {
            net.on_termination();
            std::process::exit(SIGNAL_EXIT_CODE);
        })
    }
}

/// Reverts its claim when dropped while armed.
pub struct ClaimGuard<S: QueueStore> {
    net: SafetyNet<S>,
    claim: ActiveClaim,
    armed: bool,
}

impl<S: QueueStore> ClaimGuard<S> {
    pub fn claim(&self) -> &ActiveClaim {
        &self.claim
    }

    /// The result was persisted; forget the claim.
    pub fn disarm(mut self) {
        self.armed = false;
        self.net.release(&self.claim);
    }

    /// Put the entry back the way it was before the claim.
    pub fn revert(mut self) -> Result<bool, StoreError> {
        self.armed = false;
        if !self.net.release(&self.claim) {
            // already restored from outside
            return Ok(false);
        }
        self.net.revert(&self.claim)
    }
}

impl<S: QueueStore> Drop for ClaimGuard<S> {
    fn drop(&mut self) {
        if !self.armed || !self.net.release(&self.claim) {
            return;
        }
        if let Err(e) = self.net.revert(&self.claim) {
            warn!(entry_id = %self.claim.entry_id, error = %e, "failed to restore claim");
        }
    }
}
