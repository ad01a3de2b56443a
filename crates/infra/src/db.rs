//! Postgres connection pool and error mapping shared by the durable stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent append of the same step index |
//! | Database (serialization failure) | `40001` | `Conflict` | Concurrent transaction lost |
//! | Database (other) | Any other | `Transient` | Other database errors |
//! | RowNotFound | N/A | `NotFound` | Row expected by the operation is absent |
//! | PoolClosed / Io / Tls / other | N/A | `Transient` | Connectivity problems |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use billrun_core::{StoreError, StoreResult};

/// Open a connection pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;
    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Transient(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}
