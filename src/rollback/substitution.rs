//! Temporary state substitution with a guaranteed restore.

use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::model::StateSnapshot;
use crate::operator::{BackendError, RollbackStack};

/// A stack whose committed state has been temporarily replaced.
///
/// Created only after the replacement import succeeds. The original state is
/// imported back exactly once: by [`StateSubstitution::restore`], or on drop
/// if restore was never called. The restoring import runs with a
/// never-cancelled token so that a cancelled caller still gets its state back.
pub(super) struct StateSubstitution<'s, S: RollbackStack + ?Sized> {
    stack: &'s S,
    original: Option<StateSnapshot>,
}

impl<'s, S: RollbackStack + ?Sized> StateSubstitution<'s, S> {
    /// Import `replacement` into `stack`, remembering `original` for the restore.
    pub(super) fn begin(
        stack: &'s S,
        original: StateSnapshot,
        replacement: &StateSnapshot,
        cancel: &Cancellation,
    ) -> Result<Self, BackendError> {
        stack.import(replacement, cancel)?;
        debug!(
            original = %original.short_digest(),
            replacement = %replacement.short_digest(),
            "substituted committed state"
        );
        Ok(Self {
            stack,
            original: Some(original),
        })
    }

    /// Import the original state back.
    pub(super) fn restore(mut self) -> Result<(), BackendError> {
        match self.original.take() {
            Some(original) => self.put_back(&original),
            None => Ok(()),
        }
    }

    fn put_back(&self, original: &StateSnapshot) -> Result<(), BackendError> {
        self.stack.import(original, &Cancellation::never())?;
        debug!(digest = %original.short_digest(), "restored committed state");
        Ok(())
    }
}

impl<S: RollbackStack + ?Sized> Drop for StateSubstitution<'_, S> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take()
            && let Err(e) = self.put_back(&original)
        {
            warn!("failed to restore current state: {e}");
        }
    }
}
