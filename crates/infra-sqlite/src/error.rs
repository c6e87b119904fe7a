// sqlx -> StoreError mapping

use quell_core::port::StoreError;

/// SQLite primary result codes treated as transient
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Busy/locked databases, pool exhaustion and I/O failures are transient;
/// everything else is a backend error.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            // Extended codes carry the primary code in the low byte
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                    StoreError::Unavailable(format!("Database locked: {}", db_err.message()))
                }
                Some(code) => {
                    StoreError::Backend(format!("Database error [{}]: {}", code, db_err.message()))
                }
                None => StoreError::Backend(format!("Database error: {}", db_err.message())),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}
