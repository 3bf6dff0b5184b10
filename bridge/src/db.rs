use crate::errors::{Error, Result};
use crate::metrics::REGISTRY_FAILURES_TOTAL;
use crate::model::{Device, DeviceUpdate};
use crate::registry::DeviceRegistry;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const DEVICE_COLUMNS: &str = "id, uid, name, device_type, status";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed device registry
pub struct PgDeviceRegistry {
    pool: PgPool,
}

impl PgDeviceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRegistry for PgDeviceRegistry {
    async fn find_by_uid(&self, uid: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE uid = $1", DEVICE_COLUMNS);
        let device = sqlx::query_as::<_, Device>(&query)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn exists_by_uid(&self, uid: &str) -> Result<bool> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM devices WHERE uid = $1)")
                .bind(uid)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn upsert(&self, device: Device) -> Result<Device> {
        if device.uid.trim().is_empty() {
            return Err(Error::Validation("device uid cannot be empty".to_string()));
        }

        let query = format!(
            r#"
            INSERT INTO devices (uid, name, device_type, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uid) DO UPDATE
                SET name = EXCLUDED.name,
                    device_type = EXCLUDED.device_type,
                    status = EXCLUDED.status
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );

        with_retry("upsert", || {
            sqlx::query_as::<_, Device>(&query)
                .bind(&device.uid)
                .bind(&device.name)
                .bind(&device.device_type)
                .bind(&device.status)
                .fetch_one(&self.pool)
        })
        .await
    }

    async fn update_status(&self, uid: &str, status: &str) -> Result<bool> {
        let result = with_retry("update_status", || {
            sqlx::query("UPDATE devices SET status = $2 WHERE uid = $1")
                .bind(uid)
                .bind(status)
                .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let query = format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS);
        let devices = sqlx::query_as::<_, Device>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        let device = sqlx::query_as::<_, Device>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn update(&self, id: i64, update: DeviceUpdate) -> Result<Option<Device>> {
        let query = format!(
            r#"
            UPDATE devices
                SET name = COALESCE($2, name),
                    device_type = COALESCE($3, device_type),
                    status = COALESCE($4, status)
            WHERE id = $1
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );

        with_retry("update", || {
            sqlx::query_as::<_, Device>(&query)
                .bind(id)
                .bind(&update.name)
                .bind(&update.device_type)
                .bind(&update.status)
                .fetch_optional(&self.pool)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = with_retry("delete", || {
            sqlx::query("DELETE FROM devices WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Retries writes on connection-class failures with exponential backoff.
async fn with_retry<T, F, Fut>(operation: &str, mut attempt_once: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match attempt_once().await {
            Ok(value) => return Ok(value),
            Err(db_err) => {
                if attempts >= max_attempts || !is_transient_error(&db_err) {
                    error!(
                        "Registry {} failed permanently after {} attempts: {}",
                        operation, attempts, db_err
                    );
                    return Err(Error::Database(db_err));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1);
                warn!(
                    "Registry {} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation, attempts, max_attempts, wait_ms, db_err
                );
                REGISTRY_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
