//! Database facade for `vellum`.
//!
//! Provides a single entry point ([`Database`]) that ties together a writer
//! handle, a change notifier and the version tracking of both.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vellum_core::engine::{memory::MemoryEngine, KeyFilter};
//! use vellum_core::notifier::ObservedList;
//! use vellum_db::Database;
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let db = Database::open(Arc::clone(&engine), "todo.vellum").await?;
//!
//! let list = db.write(|realm| Ok(realm.engine().create_list(realm.realm_ptr())?)).await?;
//! let mut events = db.observe(ObservedList(list), KeyFilter::all()).await?;
//!
//! db.write(move |realm| Ok(realm.engine().list_push(realm.realm_ptr(), list, "milk")?)).await?;
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event?.event_type());
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod builder;
mod config;
mod db;
mod error;
mod writer;

pub use builder::DatabaseBuilder;
pub use config::DatabaseConfig;
pub use db::Database;
pub use error::{DbError, Result};
pub use writer::MutableRealm;
