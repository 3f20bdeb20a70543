//! Client Store (component C): SQLite-backed persistence for client
//! records and their replay state.
//!
//! Provides connection pooling (`r2d2`), WAL-mode initialization, embedded
//! SQL migrations, and the `ClientStore` trait the Auth Pipeline depends on.

mod migrations;
mod pool;
mod store;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, create_pool_with_settings, DbPool, DbRuntimeSettings, PoolError};
pub use store::{insert_client, ClientStore, DbError, SqliteClientStore};
