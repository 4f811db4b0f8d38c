//! # Scheduler Context
//!
//! One dedicated thread plus the native scheduler bound to it. Every native
//! call for the handles a context owns runs on that thread; callers on other
//! threads hop onto it with [`SchedulerContext::run_on`] (async) or
//! [`SchedulerContext::run_blocking`] (sync) and wait for the result.
//!
//! ## Architecture
//!
//! ```text
//!   caller ──run_on(task)──► queue ──► context thread ──► NativeEngine
//!      ▲                                   │
//!      └────────── oneshot result ◄────────┘
//!
//!   engine ──post(perform work)──► queue   (notification delivery)
//! ```
//!
//! Tasks and engine work share one FIFO queue, so a task submitted after a
//! commit observes every callback that commit triggered on this context.
//!
//! ## Shutdown
//!
//! [`SchedulerContext::close`] releases the native scheduler first and only
//! then stops the thread: in-flight engine work may still look the scheduler
//! up, never the other way round.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{NativeEngine, SchedulerExecutor, SchedulerPtr, Task};

// ---------------------------------------------------------------------------
// SchedulerError
// ---------------------------------------------------------------------------

/// Errors from scheduler context operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The context thread could not be started.
    #[error("failed to spawn scheduler thread '{name}': {message}")]
    SpawnFailed {
        /// Thread name.
        name: String,
        /// OS error.
        message: String,
    },

    /// The engine refused to create a scheduler for the context.
    #[error("failed to create native scheduler for '{name}': {message}")]
    CreateFailed {
        /// Context name.
        name: String,
        /// Engine error.
        message: String,
    },

    /// The context was closed before the task could run.
    #[error("scheduler context '{0}' is closed")]
    Closed(String),

    /// The task panicked on the context thread.
    #[error("task panicked on scheduler context '{0}'")]
    TaskPanicked(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`SchedulerContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Name of the context thread.
    pub name: String,
}

impl SchedulerConfig {
    /// Creates a configuration with the given thread name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new("vellum-scheduler")
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

enum ContextMessage {
    Run(Task),
    Shutdown,
}

/// The queue end the engine posts onto.
struct ContextExecutor {
    name: String,
    thread_id: ThreadId,
    sender: mpsc::UnboundedSender<ContextMessage>,
    tasks_run: Arc<AtomicU64>,
}

impl SchedulerExecutor for ContextExecutor {
    fn post(&self, task: Task) {
        if self.sender.send(ContextMessage::Run(task)).is_err() {
            tracing::debug!(context = %self.name, "dropped task posted to a stopped context");
        }
    }

    fn is_on_context(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

fn context_thread_main(
    name: &str,
    mut receiver: mpsc::UnboundedReceiver<ContextMessage>,
    tasks_run: &AtomicU64,
) {
    tracing::debug!(context = name, "scheduler context started");
    while let Some(message) = receiver.blocking_recv() {
        match message {
            ContextMessage::Run(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!(context = name, "task panicked on scheduler context");
                }
                tasks_run.fetch_add(1, Ordering::Relaxed);
            }
            ContextMessage::Shutdown => break,
        }
    }
    tracing::debug!(context = name, "scheduler context stopped");
}

// ---------------------------------------------------------------------------
// SchedulerContext
// ---------------------------------------------------------------------------

/// A single-threaded execution context bound to one native scheduler.
pub struct SchedulerContext {
    name: String,
    engine: Arc<dyn NativeEngine>,
    executor: Arc<ContextExecutor>,
    scheduler: Mutex<Option<SchedulerPtr>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SchedulerContext {
    /// Starts the context thread and creates the native scheduler on it.
    ///
    /// On failure nothing is retained: the thread (if started) is stopped
    /// and joined before the error is returned.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::SpawnFailed`] if the thread cannot be started,
    /// [`SchedulerError::CreateFailed`] if the engine refuses the scheduler.
    pub fn create(
        engine: Arc<dyn NativeEngine>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let name = config.name.clone();
        let (sender, receiver) = mpsc::unbounded_channel();
        let tasks_run = Arc::new(AtomicU64::new(0));

        let thread_name = name.clone();
        let thread_tasks = Arc::clone(&tasks_run);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || context_thread_main(&thread_name, receiver, &thread_tasks))
            .map_err(|e| SchedulerError::SpawnFailed {
                name: name.clone(),
                message: e.to_string(),
            })?;

        let executor = Arc::new(ContextExecutor {
            name: name.clone(),
            thread_id: thread.thread().id(),
            sender,
            tasks_run,
        });
        let context = Self {
            name,
            engine,
            executor,
            scheduler: Mutex::new(None),
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        };

        let engine = Arc::clone(&context.engine);
        let executor: Arc<dyn SchedulerExecutor> = Arc::clone(&context.executor) as _;
        let created = context
            .run_blocking(move || engine.create_scheduler(executor))
            .and_then(|result| {
                result.map_err(|e| SchedulerError::CreateFailed {
                    name: context.name.clone(),
                    message: e.to_string(),
                })
            });
        match created {
            Ok(scheduler) => {
                *context.scheduler.lock() = Some(scheduler);
                Ok(context)
            }
            Err(e) => {
                context.close();
                Err(e)
            }
        }
    }

    /// Returns the context name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the engine this context schedules for.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    /// Returns the native scheduler, or `None` once closed.
    #[must_use]
    pub fn scheduler(&self) -> Option<SchedulerPtr> {
        *self.scheduler.lock()
    }

    /// Returns `true` if the calling thread is this context's thread.
    #[must_use]
    pub fn is_on_context(&self) -> bool {
        self.executor.is_on_context()
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of tasks the context thread has executed.
    #[must_use]
    pub fn tasks_run(&self) -> u64 {
        self.executor.tasks_run.load(Ordering::Relaxed)
    }

    /// Enqueues `task` without waiting for it. Dropped if the context is closed.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.post(Box::new(task));
    }

    /// Runs `task` on the context and awaits its result.
    ///
    /// The task is always enqueued, never run inline.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] if the context stopped before running the
    /// task, [`SchedulerError::TaskPanicked`] if the task panicked.
    pub async fn run_on<F, T>(&self, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.submit(task)?;
        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(())) => Err(SchedulerError::TaskPanicked(self.name.clone())),
            Err(_) => Err(SchedulerError::Closed(self.name.clone())),
        }
    }

    /// Runs `task` on the context and blocks the calling thread until it
    /// completes. Runs inline when already on the context.
    ///
    /// # Errors
    ///
    /// Same as [`run_on`](Self::run_on).
    pub fn run_blocking<F, T>(&self, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_on_context() {
            return panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|_| SchedulerError::TaskPanicked(self.name.clone()));
        }
        futures::executor::block_on(self.run_on(task))
    }

    fn submit<F, T>(
        &self,
        task: F,
    ) -> Result<oneshot::Receiver<Result<T, ()>>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Task = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|_| ());
            let _ = sender.send(outcome);
        });
        self.executor
            .sender
            .send(ContextMessage::Run(job))
            .map_err(|_| SchedulerError::Closed(self.name.clone()))?;
        Ok(receiver)
    }

    /// Releases the native scheduler, then stops and joins the thread.
    ///
    /// Idempotent. When called from the context thread itself the thread is
    /// told to stop but not joined.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            self.engine.release_scheduler(scheduler);
        }
        let _ = self.executor.sender.send(ContextMessage::Shutdown);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if self.is_on_context() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(context = %self.name, "scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SchedulerContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler())
            .field("closed", &self.is_closed())
            .field("tasks_run", &self.tasks_run())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
