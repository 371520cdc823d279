//! SQLite persistence for meshbot.
//!
//! [`SqliteStore`] implements [`meshbot_core::Store`]: station upserts with
//! name history, bounded per-conversation message history, cursor-paged
//! history queries and aggregate stats. Schema changes go through
//! [`schema::migrate`].

mod ops;
pub mod schema;
mod sqlite;

pub use sqlite::{SqliteStore, StoreOptions};
