// Quell Infrastructure - SQLite Adapter
// Implements: QueueStore (lists, counters, hashes), ConnectionPool

mod connection;
mod error;
mod migration;
mod store;

pub use connection::{create_pool, PoolSettings};
pub use migration::run_migrations;
pub use store::SqliteQueueStore;

// sqlx::Error is mapped to StoreError in `error`; orphan rules keep the
// conversion a plain function rather than a From impl on a core type.
