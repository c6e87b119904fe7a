// SQLite QueueStore / ConnectionPool Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use quell_core::port::{ConnectionPool, PoolStats, QueueStore, StoreResult};
use sqlx::SqlitePool;
use tracing::debug;

/// Durable store over three tables: `kv_lists`, `kv_counters`, `kv_hashes`.
///
/// Every call is a single statement or a single transaction.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn push(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("INSERT INTO kv_lists (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(to_u64(len))
    }

    async fn pop(&self, key: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM kv_lists
            WHERE seq = (SELECT seq FROM kv_lists WHERE key = ? ORDER BY seq LIMIT 1)
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn peek(&self, key: &str, start: u64, count: u64) -> StoreResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_lists WHERE key = ? ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(key)
        .bind(to_i64(count))
        .bind(to_i64(start))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn remove(&self, key: &str, value: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM kv_lists WHERE key = ? AND value = ?")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn len(&self, key: &str) -> StoreResult<u64> {
        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(to_u64(len))
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO kv_counters (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = value + excluded.value
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(by)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn counter(&self, key: &str) -> StoreResult<i64> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM kv_counters WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(value.unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_hashes (key, field, value) VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_hashes WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv_hashes WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_hashes WHERE key = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl ConnectionPool for SqliteQueueStore {
    fn stats(&self) -> PoolStats {
        let total = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(total);
        PoolStats {
            active: total - idle,
            idle,
            total,
        }
    }

    async fn shrink(&self, target_idle: u32) -> StoreResult<u32> {
        let mut closed = 0;
        while self.stats().idle > target_idle {
            // Only idle connections are handed out by try_acquire
            let Some(conn) = self.pool.try_acquire() else {
                break;
            };
            conn.close().await.map_err(map_sqlx_error)?;
            closed += 1;
        }
        debug!(closed = closed, target_idle = target_idle, "SQLite pool shrunk");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, PoolSettings};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup_test_store(dir: &TempDir, max_connections: u32) -> SqliteQueueStore {
        let url = format!("sqlite://{}", dir.path().join("quell.db").display());
        let settings = PoolSettings {
            max_connections,
            ..PoolSettings::default()
        };
        let pool = create_pool(&url, &settings).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteQueueStore::new(pool)
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let dir = TempDir::new().unwrap();
        let store = setup_test_store(&dir, 2).await;

        assert_eq!(store.push("q", "a").await.unwrap(), 1);
        assert_eq!(store.push("q", "b").await.unwrap(), 2);
        assert_eq!(store.push("other", "x").await.unwrap(), 1);

        assert_eq!(store.peek("q", 0, 10).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.peek("q", 1, 10).await.unwrap(), vec!["b"]);
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.len("q").await.unwrap(), 1);
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop("q").await.unwrap(), None);
        assert_eq!(store.len("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_drops_every_occurrence() {
        let dir = TempDir::new().unwrap();
        let store = setup_test_store(&dir, 2).await;

        for value in ["a", "b", "a"] {
            store.push("q", value).await.unwrap();
        }
        assert_eq!(store.remove("q", "a").await.unwrap(), 2);
        assert_eq!(store.remove("q", "zzz").await.unwrap(), 0);
        assert_eq!(store.peek("q", 0, 10).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_counters() {
        let dir = TempDir::new().unwrap();
        let store = setup_test_store(&dir, 2).await;

        assert_eq!(store.counter("c").await.unwrap(), 0);
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr("c", 5).await.unwrap(), 6);
        assert_eq!(store.incr("c", -2).await.unwrap(), 4);
        assert_eq!(store.counter("c").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_hashes() {
        let dir = TempDir::new().unwrap();
        let store = setup_test_store(&dir, 2).await;

        store.hset("h", "f1", "v1").await.unwrap();
        store.hset("h", "f1", "v2").await.unwrap();
        store.hset("h", "f2", "v3").await.unwrap();

        assert_eq!(store.hget("h", "f1").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(store.hget("h", "missing").await.unwrap(), None);

        let mut values = store.hvals("h").await.unwrap();
        values.sort();
        assert_eq!(values, vec!["v2", "v3"]);

        assert!(store.hdel("h", "f1").await.unwrap());
        assert!(!store.hdel("h", "f1").await.unwrap());
        assert_eq!(store.hvals("h").await.unwrap(), vec!["v3"]);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = setup_test_store(&dir, 1).await;
            store.push("q", "a").await.unwrap();
            store.incr("c", 3).await.unwrap();
            store.hset("h", "f", "v").await.unwrap();
            store.pool().close().await;
        }

        let store = setup_test_store(&dir, 1).await;
        assert_eq!(store.peek("q", 0, 10).await.unwrap(), vec!["a"]);
        assert_eq!(store.counter("c").await.unwrap(), 3);
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_shrink_closes_idle_connections() {
        let dir = TempDir::new().unwrap();
        let store = setup_test_store(&dir, 4).await;

        {
            let mut held = Vec::new();
            for _ in 0..3 {
                held.push(store.pool().acquire().await.unwrap());
            }
        }
        // Released connections return to the idle set asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = store.stats();
        assert!(before.total >= before.idle);

        store.shrink(1).await.unwrap();

        let after = store.stats();
        assert!(after.idle <= 1);
        assert_eq!(after.total, after.active + after.idle);
    }
}
