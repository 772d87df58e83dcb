//! SQLite-backed forecast persistence and HTTP fetch utilities for wxsync.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;
use wxsync_core::{ForecastDay, Location, LocationId, NewLocation, NotificationState};

pub use reqwest::Url;

pub const CRATE_NAME: &str = "wxsync-storage";

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DAY_COLUMNS: &str = "location_id, date_ms, humidity_percent, pressure_hpa, wind_speed, \
     wind_direction, high_temp_c, low_temp_c, short_description, weather_condition_id";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("location key already stored: {0}")]
    DuplicateLocationKey(String),
    #[error("unknown location id {0}")]
    UnknownLocation(LocationId),
    #[error("creating state directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub trait LocationRepository: Send + Sync {
    fn find_by_key(&self, location_key: &str) -> Result<Option<Location>, RepositoryError>;

    /// Fails with [`RepositoryError::DuplicateLocationKey`] when the key is already stored.
    fn insert(&self, location: NewLocation) -> Result<LocationId, RepositoryError>;

    fn all(&self) -> Result<Vec<Location>, RepositoryError>;
}

pub trait ForecastRepository: Send + Sync {
    /// Writes every row, replacing an existing row with the same `(location_id, date)`.
    fn upsert_days(&self, days: &[ForecastDay]) -> Result<usize, RepositoryError>;

    /// Deletes rows of `location_id` dated strictly before `cutoff`.
    fn delete_before(
        &self,
        location_id: LocationId,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, RepositoryError>;

    fn find_day(
        &self,
        location_id: LocationId,
        date: DateTime<Utc>,
    ) -> Result<Option<ForecastDay>, RepositoryError>;

    /// All rows of a location ordered by date.
    fn days_for(&self, location_id: LocationId) -> Result<Vec<ForecastDay>, RepositoryError>;
}

pub trait SettingsStore: Send + Sync {
    fn notifications_enabled(&self) -> Result<bool, RepositoryError>;
    fn set_notifications_enabled(&self, enabled: bool) -> Result<(), RepositoryError>;
    fn notification_state(&self) -> Result<NotificationState, RepositoryError>;
    fn record_notified(&self, at: DateTime<Utc>) -> Result<(), RepositoryError>;
}

/// Per-location cycle slot shared by every process using the same database.
pub trait RunLeaseStore: Send + Sync {
    /// Claims the slot for `location_key`. A lease acquired before `stale_before` is
    /// taken over; any other held lease makes this return `false`.
    fn try_acquire_run(
        &self,
        location_key: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Frees the slot if `holder` still owns it.
    fn release_run(&self, location_key: &str, holder: Uuid) -> Result<(), RepositoryError>;
}

/// Locations, forecast rows, settings and run leases in one SQLite database.
///
/// Every mutation is a row-level statement, so several processes can share the file
/// without overwriting each other's changes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`, creating missing parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RepositoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, RepositoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RepositoryError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            location_key TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS forecast_days (
            location_id INTEGER NOT NULL REFERENCES locations(id),
            date_ms INTEGER NOT NULL,
            humidity_percent INTEGER NOT NULL,
            pressure_hpa REAL NOT NULL,
            wind_speed REAL NOT NULL,
            wind_direction REAL NOT NULL,
            high_temp_c REAL NOT NULL,
            low_temp_c REAL NOT NULL,
            short_description TEXT NOT NULL,
            weather_condition_id INTEGER NOT NULL,
            UNIQUE (location_id, date_ms) ON CONFLICT REPLACE
        );

        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            notifications_enabled INTEGER NOT NULL DEFAULT 1,
            last_notified_ms INTEGER
        );
        INSERT OR IGNORE INTO settings (id) VALUES (1);

        CREATE TABLE IF NOT EXISTS run_leases (
            location_key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn millis_to_utc(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        id: LocationId(row.get(0)?),
        location_key: row.get(1)?,
        display_name: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
    })
}

fn day_from_row(row: &Row<'_>) -> rusqlite::Result<ForecastDay> {
    Ok(ForecastDay {
        location_id: LocationId(row.get(0)?),
        date: millis_to_utc(1, row.get(1)?)?,
        humidity_percent: row.get(2)?,
        pressure_hpa: row.get(3)?,
        wind_speed_meters_per_sec: row.get(4)?,
        wind_direction_degrees: row.get(5)?,
        high_temp_c: row.get(6)?,
        low_temp_c: row.get(7)?,
        short_description: row.get(8)?,
        weather_condition_id: row.get(9)?,
    })
}

impl LocationRepository for SqliteStore {
    fn find_by_key(&self, location_key: &str) -> Result<Option<Location>, RepositoryError> {
        let conn = self.conn.lock();
        let location = conn
            .query_row(
                "SELECT id, location_key, display_name, latitude, longitude \
                 FROM locations WHERE location_key = ?1",
                params![location_key],
                location_from_row,
            )
            .optional()?;
        Ok(location)
    }

    fn insert(&self, location: NewLocation) -> Result<LocationId, RepositoryError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO locations (location_key, display_name, latitude, longitude) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(location_key) DO NOTHING",
            params![
                location.location_key,
                location.display_name,
                location.latitude,
                location.longitude,
            ],
        )?;
        if changed == 0 {
            return Err(RepositoryError::DuplicateLocationKey(location.location_key));
        }
        Ok(LocationId(conn.last_insert_rowid()))
    }

    fn all(&self) -> Result<Vec<Location>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, location_key, display_name, latitude, longitude FROM locations ORDER BY id",
        )?;
        let rows = stmt.query_map([], location_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl ForecastRepository for SqliteStore {
    fn upsert_days(&self, days: &[ForecastDay]) -> Result<usize, RepositoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let location_ids: BTreeSet<LocationId> = days.iter().map(|day| day.location_id).collect();
        for location_id in location_ids {
            let known: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM locations WHERE id = ?1)",
                params![location_id.0],
                |row| row.get(0),
            )?;
            if !known {
                return Err(RepositoryError::UnknownLocation(location_id));
            }
        }

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO forecast_days ({DAY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ))?;
            for day in days {
                stmt.execute(params![
                    day.location_id.0,
                    day.date.timestamp_millis(),
                    day.humidity_percent,
                    day.pressure_hpa,
                    day.wind_speed_meters_per_sec,
                    day.wind_direction_degrees,
                    day.high_temp_c,
                    day.low_temp_c,
                    day.short_description,
                    day.weather_condition_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(days.len())
    }

    fn delete_before(
        &self,
        location_id: LocationId,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM forecast_days WHERE location_id = ?1 AND date_ms < ?2",
            params![location_id.0, cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    fn find_day(
        &self,
        location_id: LocationId,
        date: DateTime<Utc>,
    ) -> Result<Option<ForecastDay>, RepositoryError> {
        let conn = self.conn.lock();
        let day = conn
            .query_row(
                &format!(
                    "SELECT {DAY_COLUMNS} FROM forecast_days WHERE location_id = ?1 AND date_ms = ?2"
                ),
                params![location_id.0, date.timestamp_millis()],
                day_from_row,
            )
            .optional()?;
        Ok(day)
    }

    fn days_for(&self, location_id: LocationId) -> Result<Vec<ForecastDay>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DAY_COLUMNS} FROM forecast_days WHERE location_id = ?1 ORDER BY date_ms"
        ))?;
        let rows = stmt.query_map(params![location_id.0], day_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl SettingsStore for SqliteStore {
    fn notifications_enabled(&self) -> Result<bool, RepositoryError> {
        let conn = self.conn.lock();
        let enabled = conn.query_row(
            "SELECT notifications_enabled FROM settings WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(enabled)
    }

    fn set_notifications_enabled(&self, enabled: bool) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE settings SET notifications_enabled = ?1 WHERE id = 1",
            params![enabled],
        )?;
        Ok(())
    }

    fn notification_state(&self) -> Result<NotificationState, RepositoryError> {
        let conn = self.conn.lock();
        let last_notified_at = conn.query_row(
            "SELECT last_notified_ms FROM settings WHERE id = 1",
            [],
            |row| {
                row.get::<_, Option<i64>>(0)?
                    .map(|millis| millis_to_utc(0, millis))
                    .transpose()
            },
        )?;
        Ok(NotificationState { last_notified_at })
    }

    fn record_notified(&self, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE settings SET last_notified_ms = ?1 WHERE id = 1",
            params![at.timestamp_millis()],
        )?;
        Ok(())
    }
}

impl RunLeaseStore for SqliteStore {
    fn try_acquire_run(
        &self,
        location_key: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO run_leases (location_key, holder, acquired_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(location_key) DO UPDATE \
             SET holder = excluded.holder, acquired_ms = excluded.acquired_ms \
             WHERE run_leases.acquired_ms < ?4",
            params![
                location_key,
                holder.to_string(),
                now.timestamp_millis(),
                stale_before.timestamp_millis(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn release_run(&self, location_key: &str, holder: Uuid) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM run_leases WHERE location_key = ?1 AND holder = ?2",
            params![location_key, holder.to_string()],
        )?;
        Ok(())
    }
}

/// Maps a location query to a stable id, inserting the location on first use.
///
/// Metadata is first-write-wins: a later call with a different display name or
/// coordinates for a known key returns the stored id and leaves the record as it was.
#[derive(Clone)]
pub struct LocationResolver {
    repo: Arc<dyn LocationRepository>,
}

impl LocationResolver {
    pub fn new(repo: Arc<dyn LocationRepository>) -> Self {
        Self { repo }
    }

    pub fn resolve(&self, location: NewLocation) -> Result<LocationId, RepositoryError> {
        if let Some(existing) = self.repo.find_by_key(&location.location_key)? {
            return Ok(existing.id);
        }

        match self.repo.insert(location) {
            Ok(id) => {
                info!(location_id = %id, "stored new location");
                Ok(id)
            }
            // Another writer inserted the key between lookup and insert.
            Err(RepositoryError::DuplicateLocationKey(key)) => self
                .repo
                .find_by_key(&key)?
                .map(|existing| existing.id)
                .ok_or(RepositoryError::DuplicateLocationKey(key)),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bulk write failed: {0}")]
    WriteFailed(#[source] RepositoryError),
    #[error("prune failed after writing {inserted} rows: {source}")]
    PruneFailed {
        inserted: usize,
        #[source]
        source: RepositoryError,
    },
}

/// Replaces the forecast window of one location and evicts its stale rows.
#[derive(Clone)]
pub struct ForecastStore {
    repo: Arc<dyn ForecastRepository>,
}

impl ForecastStore {
    pub fn new(repo: Arc<dyn ForecastRepository>) -> Self {
        Self { repo }
    }

    /// Upserts `days` (all belonging to `location_id`) and then deletes that location's
    /// rows dated strictly before `window_start`. Returns the number of rows written.
    pub fn replace_window(
        &self,
        location_id: LocationId,
        days: &[ForecastDay],
        window_start: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        debug_assert!(days.iter().all(|day| day.location_id == location_id));

        let inserted = self.repo.upsert_days(days).map_err(StoreError::WriteFailed)?;
        let pruned = self
            .repo
            .delete_before(location_id, window_start)
            .map_err(|source| StoreError::PruneFailed { inserted, source })?;
        debug!(%location_id, inserted, pruned, cutoff = %window_start, "forecast window replaced");
        Ok(inserted)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Transport-level failure. Messages never carry the request query string.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Single-shot GET client. Retrying is left to the next scheduled cycle.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Body of a successful response; any non-2xx status is an error.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: Url) -> Result<Vec<u8>, FetchError> {
        let display_url = redacted(&url);
        let span = info_span!("http_fetch", %run_id, url = %display_url);

        async move {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: display_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Scheme, host and path only; query parameters may hold credentials.
pub fn redacted(url: &Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    )
}
