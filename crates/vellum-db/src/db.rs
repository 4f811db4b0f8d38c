//! The main `Database` struct.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vellum_core::engine::{KeyFilter, NativeEngine, OpenConfig};
use vellum_core::notifier::{ChangeSetOf, Observable, ObserverStream, VersionStream};
use vellum_core::realm::{FrozenRealmReference, SchemaMetadata, VersionId};
use vellum_core::scheduler::{SchedulerConfig, SchedulerContext};
use vellum_core::ChangeNotifier;

use crate::config::DatabaseConfig;
use crate::error::{DbError, Result};
use crate::writer::{MutableRealm, Writer};

/// An open database: one writer handle plus a change notifier, each on its
/// own scheduler context.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open(Arc::new(MemoryEngine::new()), "todo.vellum").await?;
/// let mut versions = db.realm_changed().await?;
///
/// let list = db.write(|realm| Ok(realm.engine().create_list(realm.realm_ptr())?)).await?;
/// let mut items = db.observe(ObservedList(list), KeyFilter::all()).await?;
/// ```
pub struct Database<E: NativeEngine> {
    config: DatabaseConfig,
    engine: Arc<E>,
    writer_context: Arc<SchedulerContext>,
    notifier_context: Arc<SchedulerContext>,
    writer: Arc<Writer<E>>,
    notifier: ChangeNotifier,
    closed: AtomicBool,
}

impl<E: NativeEngine> Database<E> {
    /// Open `path` with default settings.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if either context or the writer handle cannot be
    /// created.
    pub async fn open(engine: Arc<E>, path: impl Into<String>) -> Result<Self> {
        Self::open_with_config(
            engine,
            DatabaseConfig {
                path: path.into(),
                ..DatabaseConfig::default()
            },
        )
        .await
    }

    /// Open with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if either context or the writer handle cannot be
    /// created.
    pub async fn open_with_config(engine: Arc<E>, config: DatabaseConfig) -> Result<Self> {
        let shared: Arc<dyn NativeEngine> = engine.clone();
        let writer_context = Arc::new(SchedulerContext::create(
            Arc::clone(&shared),
            &SchedulerConfig::new(config.writer_thread_name.clone()),
        )?);
        let notifier_context = Arc::new(SchedulerContext::create(
            shared,
            &SchedulerConfig::new(config.notifier_thread_name.clone()),
        )?);

        let writer = {
            let engine = Arc::clone(&engine);
            let config = config.clone();
            let scheduler = writer_context.scheduler();
            writer_context
                .run_on(move || Writer::open(engine, &config, scheduler))
                .await??
        };

        let notifier = ChangeNotifier::new(
            OpenConfig::new(config.path.clone()),
            Arc::clone(&notifier_context),
            config.notifier.clone(),
        );

        tracing::info!(path = %config.path, version = %writer.version()?, "opened database");
        Ok(Self {
            config,
            engine,
            writer_context,
            notifier_context,
            writer: Arc::new(writer),
            notifier,
            closed: AtomicBool::new(false),
        })
    }

    /// The configuration this database was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// The change notifier.
    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Shutdown);
        }
        Ok(())
    }

    /// Run `f` in a write transaction on the writer context.
    ///
    /// An error or panic in `f` rolls the transaction back. On success the
    /// writer's schema metadata is refreshed and the new version is
    /// snapshotted before this returns.
    ///
    /// # Errors
    ///
    /// The error `f` returned, [`DbError::Shutdown`] after close,
    /// `InvalidTransactionState` if a write is already open on the writer
    /// (for example a nested [`write_blocking`](Self::write_blocking) from
    /// inside `f`).
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MutableRealm<'_, E>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.check_open()?;
        let writer = Arc::clone(&self.writer);
        let (value, _) = self.writer_context.run_on(move || writer.write(f)).await??;
        Ok(value)
    }

    /// Blocking variant of [`write`](Self::write). Runs inline when called
    /// from the writer context.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub fn write_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MutableRealm<'_, E>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.check_open()?;
        let writer = Arc::clone(&self.writer);
        let (value, _) = self.writer_context.run_blocking(move || writer.write(f))??;
        Ok(value)
    }

    /// Current version of the writer handle.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close.
    pub fn version(&self) -> Result<VersionId> {
        self.check_open()?;
        self.writer.version()
    }

    /// Frozen snapshot of the writer's current version. Holding it keeps
    /// that version readable; dropping it lets the next write reclaim it.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close.
    pub fn snapshot(&self) -> Result<Arc<FrozenRealmReference>> {
        self.check_open()?;
        self.writer.snapshot()
    }

    /// Schema metadata of the writer's current version.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close.
    pub fn schema(&self) -> Result<Arc<SchemaMetadata>> {
        self.check_open()?;
        Ok(self.writer.schema())
    }

    /// Versions of the writer's snapshots that are still held.
    #[must_use]
    pub fn tracked_versions(&self) -> BTreeSet<VersionId> {
        self.writer.tracked_versions()
    }

    /// Stream of database versions, starting with the latest known one.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close; notifier initialization failures.
    pub async fn realm_changed(&self) -> Result<VersionStream> {
        self.check_open()?;
        Ok(self.notifier.realm_changed().await?)
    }

    /// Observe one entity.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close; `InvalidTransactionState` when
    /// called from inside a write block; registration failures.
    pub async fn observe<O: Observable>(
        &self,
        observable: O,
        filter: KeyFilter,
    ) -> Result<ObserverStream<ChangeSetOf<O>>> {
        self.check_open()?;
        self.writer
            .ensure_no_write_open(&self.writer_context, "register an observer")?;
        Ok(self.notifier.register_observer(observable, filter).await?)
    }

    /// Bring the writer and the notifier up to the latest version,
    /// delivering every pending notification. Returns the notifier's
    /// version.
    ///
    /// # Errors
    ///
    /// [`DbError::Shutdown`] after close; `InternalConsistency` if the
    /// notifier's snapshot fell out of step.
    pub async fn refresh(&self) -> Result<VersionId> {
        self.check_open()?;
        let writer = Arc::clone(&self.writer);
        self.writer_context.run_on(move || writer.refresh()).await??;
        Ok(self.notifier.refresh().await?)
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the notifier, the writer handle with its snapshots, then both
    /// contexts. Idempotent.
    ///
    /// # Errors
    ///
    /// `InvalidTransactionState`, with nothing closed, when called from
    /// inside a write block. Otherwise the first failure to release a native
    /// handle; every step still runs.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.writer.ensure_no_write_open(&self.writer_context, "close")?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error: Option<DbError> = None;

        if let Err(e) = self.notifier.close() {
            tracing::warn!(path = %self.config.path, error = %e, "failed to close notifier");
            first_error = Some(e.into());
        }

        let writer = Arc::clone(&self.writer);
        let closed = match self.writer_context.run_blocking(move || writer.close()) {
            Ok(result) => result,
            Err(_) => self.writer.close(),
        };
        if let Err(e) = closed {
            tracing::warn!(path = %self.config.path, error = %e, "failed to close writer");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        self.notifier_context.close();
        self.writer_context.close();
        tracing::info!(path = %self.config.path, "closed database");
        first_error.map_or(Ok(()), Err)
    }
}

impl<E: NativeEngine> Drop for Database<E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.config.path, error = %e, "failed to close database on drop");
        }
    }
}

impl<E: NativeEngine> std::fmt::Debug for Database<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.config.path)
            .field("version", &self.writer.version().ok())
            .field("notifier", &self.notifier)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
