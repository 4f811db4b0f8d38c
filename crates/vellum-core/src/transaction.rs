//! # Write Transactions
//!
//! State machine over a live reference:
//!
//! ```text
//! Idle ──begin_transaction()──► InTransaction ──commit_transaction()──► Idle
//!                                     │
//!                                     └──────cancel_write()───────────► Idle
//! ```
//!
//! The state is never cached here; [`WriteTransactionManager::is_in_transaction`]
//! always asks the engine, so an engine-side rollback is seen immediately.
//!
//! Committing only advances the live handle. Refreshing schema metadata and
//! publishing the new version is the caller's job, in that order.

use crate::realm::{LiveRealmReference, RealmReference, VersionId};
use crate::{Error, Result};

/// Transaction state of a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No write in progress.
    Idle,
    /// A write transaction is open.
    InTransaction,
}

impl TransactionState {
    /// Check if a transaction can be started.
    #[must_use]
    pub fn can_begin(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if commit or rollback is valid.
    #[must_use]
    pub fn can_finish(&self) -> bool {
        matches!(self, Self::InTransaction)
    }
}

/// Begin/commit/rollback over a live reference.
///
/// Implementors only provide the reference; every method must be called on
/// the scheduler context the reference was opened on.
pub trait WriteTransactionManager {
    /// The live reference transactions run against.
    fn live_reference(&self) -> &LiveRealmReference;

    /// Opens a write transaction.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransactionState`] if one is already open,
    /// [`Error::ClosedHandle`] if the reference is closed.
    fn begin_transaction(&self) -> Result<()> {
        let reference = self.live_reference();
        reference.check_closed()?;
        if !self.transaction_state().can_begin() {
            return Err(Error::InvalidTransactionState(format!(
                "nested transactions are not supported: a write transaction is already open on {}",
                reference.owner()
            )));
        }
        reference.engine().begin_write(reference.realm_ptr())?;
        tracing::trace!(owner = %reference.owner(), "began write transaction");
        Ok(())
    }

    /// Returns `true` while a write transaction is open.
    fn is_in_transaction(&self) -> bool {
        let reference = self.live_reference();
        reference.engine().is_in_transaction(reference.realm_ptr())
    }

    /// Current state.
    fn transaction_state(&self) -> TransactionState {
        if self.is_in_transaction() {
            TransactionState::InTransaction
        } else {
            TransactionState::Idle
        }
    }

    /// Commits and returns the version the live handle advanced to.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransactionState`] if no transaction is open.
    fn commit_transaction(&self) -> Result<VersionId> {
        self.ensure_in_transaction("commit")?;
        let reference = self.live_reference();
        reference.engine().commit(reference.realm_ptr())?;
        let version = reference.version()?;
        tracing::trace!(owner = %reference.owner(), %version, "committed write transaction");
        Ok(version)
    }

    /// Discards the open transaction.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransactionState`] if no transaction is open.
    fn cancel_write(&self) -> Result<()> {
        self.ensure_in_transaction("cancel")?;
        let reference = self.live_reference();
        reference.engine().rollback(reference.realm_ptr())?;
        tracing::trace!(owner = %reference.owner(), "rolled back write transaction");
        Ok(())
    }

    /// Fails if a transaction is open. Used by operations that must not run
    /// inside one, like closing the handle or registering observers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransactionState`] naming `operation`.
    fn ensure_not_in_transaction(&self, operation: &str) -> Result<()> {
        if self.is_in_transaction() {
            return Err(Error::InvalidTransactionState(format!(
                "cannot {operation} while a write transaction is open on {}",
                self.live_reference().owner()
            )));
        }
        Ok(())
    }

    /// Fails unless a transaction is open.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransactionState`] naming `operation`.
    fn ensure_in_transaction(&self, operation: &str) -> Result<()> {
        let reference = self.live_reference();
        reference.check_closed()?;
        if !self.transaction_state().can_finish() {
            return Err(Error::InvalidTransactionState(format!(
                "cannot {operation}: no write transaction is open on {}",
                reference.owner()
            )));
        }
        Ok(())
    }
}

impl WriteTransactionManager for LiveRealmReference {
    fn live_reference(&self) -> &LiveRealmReference {
        self
    }
}

// ---------------------------------------------------------------------------
// TransactionGuard
// ---------------------------------------------------------------------------

/// RAII write scope.
///
/// Rolls the transaction back when dropped unless [`commit`](Self::commit)
/// or [`cancel`](Self::cancel) finished it first.
///
/// ```rust,ignore
/// let guard = TransactionGuard::begin(&manager)?;
/// mutate()?;            // an early return rolls back
/// let version = guard.commit()?;
/// ```
pub struct TransactionGuard<'a, M: WriteTransactionManager + ?Sized> {
    manager: &'a M,
    finished: bool,
}

impl<'a, M: WriteTransactionManager + ?Sized> TransactionGuard<'a, M> {
    /// Begins a transaction on `manager`.
    ///
    /// # Errors
    ///
    /// Same as [`WriteTransactionManager::begin_transaction`].
    pub fn begin(manager: &'a M) -> Result<Self> {
        manager.begin_transaction()?;
        Ok(Self {
            manager,
            finished: false,
        })
    }

    /// Commits. On failure the guard still rolls back when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`WriteTransactionManager::commit_transaction`].
    pub fn commit(mut self) -> Result<VersionId> {
        let version = self.manager.commit_transaction()?;
        self.finished = true;
        Ok(version)
    }

    /// Rolls back now.
    ///
    /// # Errors
    ///
    /// Same as [`WriteTransactionManager::cancel_write`].
    pub fn cancel(mut self) -> Result<()> {
        self.finished = true;
        self.manager.cancel_write()
    }
}

impl<M: WriteTransactionManager + ?Sized> Drop for TransactionGuard<'_, M> {
    fn drop(&mut self) {
        if self.finished || !self.manager.is_in_transaction() {
            return;
        }
        if let Err(e) = self.manager.cancel_write() {
            tracing::warn!(
                owner = %self.manager.live_reference().owner(),
                error = %e,
                "failed to roll back abandoned write transaction"
            );
        }
    }
}

impl<M: WriteTransactionManager + ?Sized> std::fmt::Debug for TransactionGuard<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("owner", &self.manager.live_reference().owner())
            .field("finished", &self.finished)
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
