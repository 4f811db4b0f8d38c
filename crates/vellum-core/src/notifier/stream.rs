//! Async streams handed out by the [`ChangeNotifier`](super::ChangeNotifier).
//!
//! - [`VersionStream`]: `Stream<Item = VersionId>` over a watch channel; a
//!   new subscriber immediately sees the latest version, and a slow one only
//!   ever misses intermediate versions.
//! - [`ObserverStream`]: `Stream<Item = Result<ChangeEvent<C>>>` over a
//!   bounded channel. Nothing is dropped silently: if the producer finds the
//!   channel full, the stream yields what was buffered, then a single
//!   [`Error::BackpressureExceeded`], then ends.
//!
//! Dropping either stream detaches it. For observers this releases the
//! native token, deferred onto the notifier's context when needed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};
use tokio_stream::Stream;

use super::event::ChangeEvent;
use super::token::NotificationToken;
use crate::engine::EntityKey;
use crate::realm::VersionId;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// VersionStream
// ---------------------------------------------------------------------------

/// Versions of the notifier's live handle, latest first.
pub struct VersionStream {
    inner: WatchStream<VersionId>,
    terminated: bool,
}

impl VersionStream {
    pub(crate) fn new(inner: WatchStream<VersionId>) -> Self {
        Self {
            inner,
            terminated: false,
        }
    }

    /// Returns `true` once the notifier closed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Stream for VersionStream {
    type Item = VersionId;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for VersionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStream")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ObserverShared
// ---------------------------------------------------------------------------

/// State shared between an observer stream and its native callback.
pub(crate) struct ObserverShared {
    description: String,
    failure: Mutex<Option<Error>>,
    token: Mutex<Option<NotificationToken>>,
}

impl ObserverShared {
    pub(crate) fn new(description: String) -> Self {
        Self {
            description,
            failure: Mutex::new(None),
            token: Mutex::new(None),
        }
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn set_token(&self, token: NotificationToken) {
        *self.token.lock() = Some(token);
    }

    /// Records the error the stream ends with. The first one wins.
    pub(crate) fn fail(&self, error: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Releases the native registration. Idempotent.
    pub(crate) fn release_token(&self) {
        let token = self.token.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// ObserverStream
// ---------------------------------------------------------------------------

/// Events of one observed entity.
///
/// Cold and per subscriber: every call to
/// [`register_observer`](super::ChangeNotifier::register_observer) creates a
/// separate native registration.
pub struct ObserverStream<C> {
    inner: ReceiverStream<ChangeEvent<C>>,
    shared: Arc<ObserverShared>,
    entity: EntityKey,
    terminated: bool,
}

impl<C> ObserverStream<C> {
    pub(crate) fn new(
        inner: ReceiverStream<ChangeEvent<C>>,
        shared: Arc<ObserverShared>,
        entity: EntityKey,
    ) -> Self {
        Self {
            inner,
            shared,
            entity,
            terminated: false,
        }
    }

    /// The observed entity.
    #[must_use]
    pub fn entity(&self) -> EntityKey {
        self.entity
    }

    /// Returns `true` once the stream ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Detaches: releases the native token and ends the stream.
    pub fn cancel(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.inner.close();
        }
        self.shared.release_token();
    }
}

impl<C> Unpin for ObserverStream<C> {}

impl<C> Stream for ObserverStream<C> {
    type Item = Result<ChangeEvent<C>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                this.terminated = true;
                this.shared.release_token();
                match this.shared.take_failure() {
                    Some(error) => {
                        tracing::debug!(observer = this.shared.description(), error = %error, "observer stream failed");
                        Poll::Ready(Some(Err(error)))
                    }
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C> Drop for ObserverStream<C> {
    fn drop(&mut self) {
        self.shared.release_token();
    }
}

impl<C> std::fmt::Debug for ObserverStream<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverStream")
            .field("entity", &self.entity)
            .field("observer", &self.shared.description())
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, watch};
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_version_stream_replays_latest() {
        let (sender, receiver) = watch::channel(VersionId::from(3_u64));
        sender.send_replace(VersionId::from(5_u64));
        let mut stream = VersionStream::new(WatchStream::new(receiver));
        assert_eq!(stream.next().await, Some(VersionId::from(5_u64)));
        drop(sender);
        assert_eq!(stream.next().await, None);
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_observer_stream_ends_with_recorded_failure() {
        let (sender, receiver) = mpsc::channel::<ChangeEvent<()>>(1);
        let shared = Arc::new(ObserverShared::new("list entity-1".into()));
        let mut stream =
            ObserverStream::new(ReceiverStream::new(receiver), Arc::clone(&shared), EntityKey::from_raw(1));

        sender
            .try_send(ChangeEvent::Deleted {
                version: VersionId::from(2_u64),
            })
            .unwrap();
        shared.fail(Error::BackpressureExceeded("list entity-1".into()));
        drop(sender);

        assert!(stream.next().await.unwrap().unwrap().is_deleted());
        assert!(matches!(
            stream.next().await,
            Some(Err(Error::BackpressureExceeded(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_observer_stream_cancel() {
        let (sender, receiver) = mpsc::channel::<ChangeEvent<()>>(4);
        let shared = Arc::new(ObserverShared::new("set entity-2".into()));
        let mut stream =
            ObserverStream::new(ReceiverStream::new(receiver), shared, EntityKey::from_raw(2));
        stream.cancel();
        assert!(stream.is_terminated());
        assert!(stream.next().await.is_none());
        assert!(sender.is_closed());
    }
}
