// Schema Migrations

use crate::error::map_sqlx_error;
use quell_core::port::StoreResult;
use sqlx::SqlitePool;
use tracing::info;

/// Ordered (version, label, sql). Versions only ever grow.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "store schema",
    include_str!("../migrations/001_store_schema.sql"),
)];

/// Bring the schema up to the latest version
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(map_sqlx_error)?;

    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _, _)| *v > current).collect();
    if pending.is_empty() {
        info!(schema_version = current, "Store schema up to date");
        return Ok(());
    }

    for (version, label, sql) in pending {
        info!(version = version, label = label, "Applying store migration");
        apply(pool, *version, sql).await?;
    }
    Ok(())
}

/// Statements of a migration file, comments stripped
fn statements(sql: &str) -> impl Iterator<Item = String> + '_ {
    sql.split(';').filter_map(|chunk| {
        let body = chunk
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let body = body.trim();
        (!body.is_empty()).then(|| body.to_string())
    })
}

/// One migration and its version row, in one transaction
async fn apply(pool: &SqlitePool, version: i64, sql: &str) -> StoreResult<()> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    for statement in statements(sql) {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
    }
    sqlx::query(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, CAST(strftime('%s', 'now') AS INTEGER) * 1000)",
    )
    .bind(version)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    tx.commit().await.map_err(map_sqlx_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, PoolSettings};

    #[test]
    fn test_statements_skip_comments_and_blanks() {
        let sql = "-- header\nCREATE TABLE a (x INTEGER);\n\n-- note\nCREATE INDEX i ON a(x);\n";
        let parsed: Vec<_> = statements(sql).collect();
        assert_eq!(
            parsed,
            vec!["CREATE TABLE a (x INTEGER)", "CREATE INDEX i ON a(x)"]
        );
    }

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let settings = PoolSettings {
            max_connections: 1,
            ..PoolSettings::default()
        };
        let pool = create_pool("sqlite::memory:", &settings).await.unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        for table in ["kv_lists", "kv_counters", "kv_hashes"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0);
        }
        let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }
}
