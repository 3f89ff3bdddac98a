//! SQLite persistence for the proxy pool, ping log and scanner settings

use crate::proxy::models::{Anonymity, HistoricalPing, Location, ProxyFilter, ProxyRecord, ProxyType};
use crate::scanner::settings::ScannerSettings;
use crate::store::{PingLog, ProxyStore, SettingsStore};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS proxies (
        uri TEXT PRIMARY KEY NOT NULL,
        proxy_type TEXT NOT NULL,
        speed REAL NOT NULL,
        anonymity INTEGER NOT NULL,
        reliability REAL NOT NULL,
        last_check TEXT NOT NULL,
        last_check_status INTEGER NOT NULL,
        location TEXT,
        accessible_websites TEXT NOT NULL,
        inaccessible_websites TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_proxies_status_speed ON proxies(last_check_status, speed)",
    "CREATE TABLE IF NOT EXISTS historical_pings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL,
        raw_headers TEXT NOT NULL,
        speed REAL NOT NULL,
        error_type TEXT NOT NULL,
        ping_time TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pings_uri ON historical_pings(uri)",
    "CREATE TABLE IF NOT EXISTS scanner_settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        body TEXT NOT NULL
    )",
];

/// Database handle implementing every repository trait
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url` and apply the schema
    pub async fn new(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL {}", url))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to :memory: is its own database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", url))?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("Database ready at {}", url);

        Ok(Self { pool })
    }

    pub async fn memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }
}

fn proxy_from_row(row: &SqliteRow) -> Result<ProxyRecord> {
    let proxy_type: String = row.try_get("proxy_type")?;
    let anonymity: i64 = row.try_get("anonymity")?;
    let location: Option<String> = row.try_get("location")?;
    let accessible: String = row.try_get("accessible_websites")?;
    let inaccessible: String = row.try_get("inaccessible_websites")?;

    Ok(ProxyRecord {
        uri: row.try_get("uri")?,
        proxy_type: ProxyType::from_scheme(&proxy_type)
            .with_context(|| format!("Unknown proxy type {:?}", proxy_type))?,
        speed: row.try_get("speed")?,
        anonymity: Anonymity::from_i64(anonymity)
            .with_context(|| format!("Unknown anonymity level {}", anonymity))?,
        reliability: row.try_get("reliability")?,
        last_check: row.try_get::<DateTime<Utc>, _>("last_check")?,
        last_check_status: row.try_get("last_check_status")?,
        location: location
            .map(|l| serde_json::from_str::<Location>(&l))
            .transpose()?,
        accessible_websites: serde_json::from_str(&accessible)?,
        inaccessible_websites: serde_json::from_str(&inaccessible)?,
    })
}

#[async_trait]
impl ProxyStore for Database {
    async fn find_by(&self, filter: &ProxyFilter) -> Result<Vec<ProxyRecord>> {
        // keyed and status filters run in SQL, the rest on decoded rows
        let rows = match (&filter.uri, filter.last_check_status) {
            (Some(uri), _) => {
                sqlx::query("SELECT * FROM proxies WHERE uri = ?")
                    .bind(uri)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(status)) => {
                sqlx::query("SELECT * FROM proxies WHERE last_check_status = ? ORDER BY speed ASC")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM proxies ORDER BY speed ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut found = Vec::new();
        for row in &rows {
            let record = proxy_from_row(row)?;
            if filter.matches(&record) {
                found.push(record);
                if filter.limit.is_some_and(|limit| found.len() >= limit) {
                    break;
                }
            }
        }
        Ok(found)
    }

    async fn save(&self, proxy: &ProxyRecord) -> Result<()> {
        let location = proxy.location.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO proxies (uri, proxy_type, speed, anonymity, reliability, last_check,
                last_check_status, location, accessible_websites, inaccessible_websites)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(uri) DO UPDATE SET
                proxy_type = excluded.proxy_type,
                speed = excluded.speed,
                anonymity = excluded.anonymity,
                reliability = excluded.reliability,
                last_check = excluded.last_check,
                last_check_status = excluded.last_check_status,
                location = excluded.location,
                accessible_websites = excluded.accessible_websites,
                inaccessible_websites = excluded.inaccessible_websites",
        )
        .bind(&proxy.uri)
        .bind(proxy.proxy_type.to_string())
        .bind(proxy.speed)
        .bind(proxy.anonymity.as_i64())
        .bind(proxy.reliability)
        .bind(proxy.last_check)
        .bind(proxy.last_check_status)
        .bind(location)
        .bind(serde_json::to_string(&proxy.accessible_websites)?)
        .bind(serde_json::to_string(&proxy.inaccessible_websites)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        sqlx::query("DELETE FROM proxies WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PingLog for Database {
    async fn save(&self, ping: &HistoricalPing) -> Result<()> {
        sqlx::query(
            "INSERT INTO historical_pings (uri, raw_headers, speed, error_type, ping_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&ping.uri)
        .bind(&ping.raw_headers)
        .bind(ping.speed)
        .bind(&ping.error_type)
        .bind(ping.ping_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_uri(&self, uri: &str) -> Result<Vec<HistoricalPing>> {
        let rows = sqlx::query(
            "SELECT uri, raw_headers, speed, error_type, ping_time
             FROM historical_pings WHERE uri = ? ORDER BY id ASC",
        )
        .bind(uri)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HistoricalPing {
                    uri: row.try_get("uri")?,
                    raw_headers: row.try_get("raw_headers")?,
                    speed: row.try_get("speed")?,
                    error_type: row.try_get("error_type")?,
                    ping_time: row.try_get("ping_time")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SettingsStore for Database {
    async fn load(&self) -> Result<Option<ScannerSettings>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM scanner_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((body,)) => Ok(Some(
                serde_json::from_str(&body).context("Stored scanner settings are corrupt")?,
            )),
            None => Ok(None),
        }
    }

    async fn save(&self, settings: &ScannerSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO scanner_settings (id, body) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(serde_json::to_string(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
