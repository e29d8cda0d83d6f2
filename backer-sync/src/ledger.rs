//! The version ledger: the committed counter, its durable store, and the
//! versions currently reserved by running cycles.
//!
//! A cycle reserves its version right before its first copy, copies with no
//! lock held, then commits. Commits land in reservation order: a cycle whose
//! reservation is not the lowest outstanding one waits for the earlier
//! cycles to commit or release theirs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backer_core::version::step;
use backer_core::{Bump, Thresholds, Version, VersionCounter};

use crate::error::SyncError;
use crate::state_store::VersionStateStore;

const TURN_POLL: Duration = Duration::from_millis(50);

/// A version handed to one cycle for naming its backup folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub version: Version,
    pub bump: Bump,
}

struct LedgerState {
    counter: VersionCounter,
    store: Box<dyn VersionStateStore>,
    outstanding: BTreeMap<Version, Bump>,
}

impl LedgerState {
    fn is_turn_of(&self, version: &Version) -> bool {
        self.outstanding.keys().next() == Some(version)
    }
}

pub struct VersionLedger {
    thresholds: Thresholds,
    state: Mutex<LedgerState>,
    turn: Condvar,
}

impl std::fmt::Debug for VersionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("VersionLedger")
            .field("counter", &state.counter)
            .field("outstanding", &state.outstanding)
            .finish_non_exhaustive()
    }
}

impl VersionLedger {
    /// Load the last committed version from `store`.
    pub fn open(
        store: impl VersionStateStore + 'static,
        thresholds: Thresholds,
    ) -> Result<Self, SyncError> {
        let current = store.load()?;
        thresholds.check(&current)?;
        Ok(Self {
            thresholds,
            state: Mutex::new(LedgerState {
                counter: VersionCounter::new(current, thresholds),
                store: Box::new(store),
                outstanding: BTreeMap::new(),
            }),
            turn: Condvar::new(),
        })
    }

    /// Last durably committed version.
    pub fn current(&self) -> Version {
        self.read().counter.current()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// The version the next reservation will receive.
    pub fn peek_next(&self) -> Version {
        let state = self.read();
        self.next_after(&state).0
    }

    /// Reserve the next version for a cycle about to copy.
    pub fn reserve(&self) -> Result<Reservation, SyncError> {
        let mut state = self.lock()?;
        let (version, bump) = self.next_after(&state);
        state.outstanding.insert(version, bump);
        tracing::debug!(%version, pending = state.outstanding.len(), "version reserved");
        Ok(Reservation { version, bump })
    }

    /// Persist `reservation` as the new current version.
    ///
    /// Blocks until every lower reservation is committed or released.
    /// Returns `Ok(None)` when `cancel` is set while waiting; the
    /// reservation is released in that case and on a failed save. On a
    /// failed save the current version stays at the last persisted value.
    pub fn commit(
        &self,
        reservation: Reservation,
        cancel: &AtomicBool,
    ) -> Result<Option<(Version, Bump)>, SyncError> {
        let Reservation { version, bump } = reservation;
        let mut state = self.lock()?;
        while !state.is_turn_of(&version) {
            if !state.outstanding.contains_key(&version) {
                return Err(SyncError::UnknownReservation(version));
            }
            if cancel.load(Ordering::SeqCst) {
                self.release_locked(&mut state, &version);
                return Ok(None);
            }
            let (guard, _) = self
                .turn
                .wait_timeout(state, TURN_POLL)
                .map_err(|_| SyncError::LedgerPoisoned)?;
            state = guard;
        }

        let expected = state.counter.peek_next().0;
        if version != expected {
            tracing::warn!(
                %version,
                skipped = %expected,
                "committing past a version released by an uncommitted cycle",
            );
        }

        let saved = state.store.save(&version);
        state.outstanding.remove(&version);
        if saved.is_ok() {
            state.counter = VersionCounter::new(version, self.thresholds);
        }
        drop(state);
        self.turn.notify_all();

        saved?;
        tracing::debug!(%version, %bump, "version committed");
        Ok(Some((version, bump)))
    }

    /// Give back a reservation that will not be committed.
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.read();
        self.release_locked(&mut state, &reservation.version);
    }

    fn release_locked(&self, state: &mut LedgerState, version: &Version) {
        if state.outstanding.remove(version).is_some() {
            tracing::debug!(%version, "version reservation released");
            self.turn.notify_all();
        }
    }

    fn next_after(&self, state: &LedgerState) -> (Version, Bump) {
        match state.outstanding.keys().next_back() {
            Some(highest) => step(*highest, &self.thresholds),
            None => state.counter.peek_next(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, SyncError> {
        self.state.lock().map_err(|_| SyncError::LedgerPoisoned)
    }

    /// The counter only changes after a successful save, so state behind a
    /// poisoned lock is still consistent for reads and releases.
    fn read(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
