//! SQLite-backed shared state store.
//!
//! Every read and every merge runs in its own short transaction; that is
//! the only serialisation point between the bus ingestion path and the
//! controller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{DeviceReport, RelayState, Snapshot, Store};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    light_intensity: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    gas_resistance: Option<f64>,
    water_level: Option<f64>,
    updated_at: i64,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/home/pi/greenhouse/greenhouse.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    async fn ensure_record(&self) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO snapshot (id) VALUES (1)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT light_intensity, temperature, humidity, pressure,
                   gas_resistance, water_level, updated_at
            FROM snapshot
            WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // First boot: nothing has reported yet.
            tx.rollback().await?;
            self.ensure_record().await?;
            debug!("store: created default snapshot record");
            return Ok(Snapshot::default());
        };

        let relay_rows = sqlx::query_as::<_, (String, String)>(
            "SELECT relay_key, state FROM relay_states ORDER BY relay_key",
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut snapshot = Snapshot {
            light_intensity: row.light_intensity,
            temperature: row.temperature,
            humidity: row.humidity,
            pressure: row.pressure,
            gas_resistance: row.gas_resistance,
            water_level: row.water_level,
            updated_at: row.updated_at,
            ..Default::default()
        };
        for (key, state) in relay_rows {
            match RelayState::parse(&state) {
                Some(s) => {
                    snapshot.relays.insert(key, s);
                }
                None => warn!(relay = %key, state = %state, "store: ignoring bad relay state row"),
            }
        }

        Ok(snapshot)
    }

    async fn apply_relay_update(&self, report: &DeviceReport) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let s = &report.sensors;

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO snapshot (id) VALUES (1)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE snapshot SET
              light_intensity = COALESCE(?, light_intensity),
              temperature     = COALESCE(?, temperature),
              humidity        = COALESCE(?, humidity),
              pressure        = COALESCE(?, pressure),
              gas_resistance  = COALESCE(?, gas_resistance),
              water_level     = COALESCE(?, water_level),
              updated_at      = ?
            WHERE id = 1
            "#,
        )
        .bind(s.light_intensity)
        .bind(s.temperature)
        .bind(s.humidity)
        .bind(s.pressure)
        .bind(s.gas_resistance)
        .bind(s.water_level)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (relay, state) in &report.relays {
            sqlx::query(
                r#"
                INSERT INTO relay_states (relay_key, state, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(relay_key) DO UPDATE SET
                  state=excluded.state,
                  updated_at=excluded.updated_at
                "#,
            )
            .bind(format!("{}/{relay}", report.device))
            .bind(state.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
