//! Native notification token ownership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::{NativeEngine, NotificationTokenPtr};
use crate::scheduler::SchedulerContext;

/// Owns one native callback registration.
///
/// Cancelling is idempotent and may happen on any thread: off the owning
/// context the release is posted there and the caller does not wait.
pub struct NotificationToken {
    token: NotificationTokenPtr,
    engine: Arc<dyn NativeEngine>,
    context: Weak<SchedulerContext>,
    cancelled: AtomicBool,
}

impl NotificationToken {
    /// Wraps `token`, registered on a handle owned by `context`.
    #[must_use]
    pub fn new(
        token: NotificationTokenPtr,
        engine: Arc<dyn NativeEngine>,
        context: Weak<SchedulerContext>,
    ) -> Self {
        Self {
            token,
            engine,
            context,
            cancelled: AtomicBool::new(false),
        }
    }

    /// The native token.
    #[must_use]
    pub fn token(&self) -> NotificationTokenPtr {
        self.token
    }

    /// Returns `true` once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Releases the registration.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let token = self.token;
        // A dropped context took its handles, and their tokens, with it.
        let Some(context) = self.context.upgrade() else {
            return;
        };
        if context.is_on_context() {
            release(self.engine.as_ref(), token);
        } else {
            let engine = Arc::clone(&self.engine);
            context.post(move || release(engine.as_ref(), token));
        }
    }
}

fn release(engine: &dyn NativeEngine, token: NotificationTokenPtr) {
    match engine.release_token(token) {
        Ok(()) => tracing::debug!(%token, "released notification token"),
        Err(e) => tracing::warn!(%token, error = %e, "failed to release notification token"),
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationToken")
            .field("token", &self.token)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
