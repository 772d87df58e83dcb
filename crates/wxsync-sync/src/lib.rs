//! Sync cycle orchestration, the daily notification gate, and scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;
use wxsync_adapters::{
    parse_forecast, AdapterContext, FixtureWeatherSource, ForecastRequest, OpenWeatherMapSource,
    ParseError, TransportError, WeatherSource, DEFAULT_BASE_URL,
};
use wxsync_core::{
    Clock, ForecastDay, LocationId, NewLocation, RawDayForecast, SyncWindow, SystemClock,
};
use wxsync_storage::{
    ForecastRepository, ForecastStore, HttpClientConfig, HttpFetcher, LocationRepository,
    LocationResolver, RepositoryError, RunLeaseStore, SettingsStore, SqliteStore, StoreError,
    Url,
};

mod scheduler;

pub use scheduler::{is_due, ScheduleConfig, SyncScheduler, TriggerOutcome};

pub const CRATE_NAME: &str = "wxsync-sync";

pub const DEFAULT_LOCATION_QUERY: &str = "94043";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60 * 60 * 3;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STATE_PATH: &str = "./state/wxsync.sqlite3";
pub const NOTIFICATION_TITLE: &str = "Weather";

const MAX_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Minimum spacing between two daily notifications.
pub fn notification_interval() -> chrono::Duration {
    chrono::Duration::hours(24)
}

/// A run lease older than this belongs to a process that died mid-cycle and may be taken over.
pub fn run_lease_ttl() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

/// Temperature units used when rendering notifications. Stored values stay metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayUnits {
    #[default]
    Metric,
    Imperial,
}

impl DisplayUnits {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("imperial") {
            Self::Imperial
        } else {
            Self::Metric
        }
    }

    pub fn format_temperature(self, celsius: f64) -> String {
        let value = match self {
            Self::Metric => celsius,
            Self::Imperial => celsius * 1.8 + 32.0,
        };
        format!("{value:.0}°")
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub location_query: String,
    pub api_key: Option<String>,
    pub base_url: String,
    /// SQLite database shared by every wxsync process on this host.
    pub state_path: PathBuf,
    /// When set, payloads are read from this file instead of the network.
    pub fixture_path: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub units: DisplayUnits,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let secs = |key: &str, default: u64| {
            var(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let interval_secs = secs("WXSYNC_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS);
        let flex_secs = secs("WXSYNC_SYNC_FLEX_SECS", interval_secs / 3);

        Self {
            location_query: var("WXSYNC_LOCATION")
                .unwrap_or_else(|| DEFAULT_LOCATION_QUERY.to_string()),
            api_key: var("WXSYNC_API_KEY").or_else(|| var("OPEN_WEATHER_MAP_API_KEY")),
            base_url: var("WXSYNC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            state_path: var("WXSYNC_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
            fixture_path: var("WXSYNC_FIXTURE_PATH").map(PathBuf::from),
            schedule: ScheduleConfig::from_secs(interval_secs, flex_secs),
            http_timeout_secs: secs("WXSYNC_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            user_agent: var("WXSYNC_USER_AGENT").unwrap_or_else(|| "wxsync/0.1".to_string()),
            units: var("WXSYNC_UNITS")
                .map(|value| DisplayUnits::parse(&value))
                .unwrap_or_default(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            connect_timeout: Duration::from_secs(self.http_timeout_secs.min(MAX_CONNECT_TIMEOUT_SECS)),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Rendered daily notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherNotification {
    pub title: String,
    pub body: String,
    pub weather_condition_id: i32,
}

impl WeatherNotification {
    pub fn for_day(day: &ForecastDay, units: DisplayUnits) -> Self {
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body: format!(
                "Forecast: {} High: {} Low: {}",
                day.short_description,
                units.format_temperature(day.high_temp_c),
                units.format_temperature(day.low_temp_c),
            ),
            weather_condition_id: day.weather_condition_id,
        }
    }
}

/// Delivery surface for the daily notification. Posting replaces any previous one.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &WeatherNotification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notification: &WeatherNotification) -> Result<()> {
        info!(
            title = %notification.title,
            condition = notification.weather_condition_id,
            "{}",
            notification.body
        );
        Ok(())
    }
}

/// True when notifications are enabled and none was delivered in the last 24 hours.
pub fn should_notify(
    now: DateTime<Utc>,
    last_notified_at: Option<DateTime<Utc>>,
    enabled: bool,
) -> bool {
    if !enabled {
        return false;
    }
    match last_notified_at {
        None => true,
        Some(last) => now - last >= notification_interval(),
    }
}

/// Why a cycle stopped before writing forecast rows.
#[derive(Debug, Error)]
pub enum CycleAbort {
    #[error("another process is already syncing this location")]
    AlreadyRunning,
    #[error("run lease unavailable: {0}")]
    Lease(#[source] RepositoryError),
    #[error("fetch failed: {0}")]
    Network(#[source] TransportError),
    #[error("provider returned an empty body")]
    EmptyResponse,
    #[error("payload rejected: {0}")]
    Parse(#[source] ParseError),
    #[error("location could not be resolved: {0}")]
    Location(#[source] RepositoryError),
    #[error("forecast write failed: {0}")]
    Store(#[source] StoreError),
    #[error("storage task did not complete: {0}")]
    Interrupted(#[source] JoinError),
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub location_query: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: usize,
    pub aborted: Option<CycleAbort>,
    /// Stale rows could not be evicted; the fresh window was still written.
    pub prune_error: Option<RepositoryError>,
    pub notified: bool,
}

impl SyncOutcome {
    fn started(run_id: Uuid, location_query: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            location_query: location_query.to_string(),
            started_at,
            finished_at: started_at,
            inserted: 0,
            aborted: None,
            prune_error: None,
            notified: false,
        }
    }

    fn abort(mut self, abort: CycleAbort) -> Self {
        self.aborted = Some(abort);
        self
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Storage seams used by a cycle.
#[derive(Clone)]
pub struct Repositories {
    pub locations: Arc<dyn LocationRepository>,
    pub forecasts: Arc<dyn ForecastRepository>,
    pub settings: Arc<dyn SettingsStore>,
    pub leases: Arc<dyn RunLeaseStore>,
}

impl Repositories {
    pub fn shared(store: Arc<SqliteStore>) -> Self {
        Self {
            locations: store.clone(),
            forecasts: store.clone(),
            settings: store.clone(),
            leases: store,
        }
    }
}

/// What the storage half of a cycle reports back.
#[derive(Debug, Default)]
struct Persisted {
    inserted: usize,
    prune_error: Option<RepositoryError>,
    notified: bool,
}

/// Blocking half of a cycle: resolve, write the window, gate the notification.
/// Cloned into the blocking pool so database calls never stall the runtime.
#[derive(Clone)]
struct CycleStore {
    resolver: LocationResolver,
    forecast_store: ForecastStore,
    forecasts: Arc<dyn ForecastRepository>,
    settings: Arc<dyn SettingsStore>,
    sink: Arc<dyn NotificationSink>,
    units: DisplayUnits,
}

impl CycleStore {
    fn persist(
        &self,
        location: NewLocation,
        raw_days: Vec<RawDayForecast>,
        window: SyncWindow,
        now: DateTime<Utc>,
    ) -> Result<Persisted, CycleAbort> {
        let location_id = self.resolver.resolve(location).map_err(|err| {
            warn!(error = %err, "location resolution failed");
            CycleAbort::Location(err)
        })?;

        let days: Vec<ForecastDay> = raw_days
            .into_iter()
            .zip(0u32..)
            .map(|(raw, index)| ForecastDay::from_raw(location_id, window.date_for(index), raw))
            .collect();

        let mut persisted = Persisted::default();
        match self
            .forecast_store
            .replace_window(location_id, &days, window.prune_cutoff())
        {
            Ok(inserted) => persisted.inserted = inserted,
            Err(StoreError::PruneFailed { inserted, source }) => {
                warn!(error = %source, inserted, "stale rows were not evicted");
                persisted.inserted = inserted;
                persisted.prune_error = Some(source);
            }
            Err(err) => {
                warn!(error = %err, "forecast window write failed");
                return Err(CycleAbort::Store(err));
            }
        }
        info!(%location_id, inserted = persisted.inserted, "sync complete");

        persisted.notified = self.maybe_notify(now, window, location_id);
        Ok(persisted)
    }

    /// Delivers today's forecast when the gate allows it. Returns whether a
    /// notification was delivered and recorded.
    fn maybe_notify(&self, now: DateTime<Utc>, window: SyncWindow, location_id: LocationId) -> bool {
        let enabled = match self.settings.notifications_enabled() {
            Ok(enabled) => enabled,
            Err(err) => {
                warn!(error = %err, "reading notification preference failed");
                return false;
            }
        };
        let state = match self.settings.notification_state() {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "reading notification state failed");
                return false;
            }
        };

        if !should_notify(now, state.last_notified_at, enabled) {
            debug!(enabled, "notification not due");
            return false;
        }

        let today = window.start_date();
        let day = match self.forecasts.find_day(location_id, today) {
            Ok(Some(day)) => day,
            Ok(None) => {
                info!(date = %today, "no forecast stored for today; notification deferred");
                return false;
            }
            Err(err) => {
                warn!(error = %err, "reading today's forecast failed");
                return false;
            }
        };

        let notification = WeatherNotification::for_day(&day, self.units);
        if let Err(err) = self.sink.notify(&notification) {
            warn!(error = %format!("{err:#}"), "notification delivery failed");
            return false;
        }
        // Without a recorded time the gate stays open, so the next cycle notifies again.
        if let Err(err) = self.settings.record_notified(now) {
            warn!(error = %err, "recording notification time failed");
            return false;
        }
        true
    }
}

pub struct SyncPipeline {
    source: Arc<dyn WeatherSource>,
    store: CycleStore,
    leases: Arc<dyn RunLeaseStore>,
    clock: Arc<dyn Clock>,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn WeatherSource>, repos: Repositories) -> Self {
        Self {
            source,
            store: CycleStore {
                resolver: LocationResolver::new(repos.locations),
                forecast_store: ForecastStore::new(repos.forecasts.clone()),
                forecasts: repos.forecasts,
                settings: repos.settings,
                sink: Arc::new(TracingNotificationSink),
                units: DisplayUnits::default(),
            },
            leases: repos.leases,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wires the SQLite store and the configured source.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.state_path)
            .with_context(|| format!("opening state database {}", config.state_path.display()))?;

        let source: Arc<dyn WeatherSource> = match &config.fixture_path {
            Some(path) => Arc::new(FixtureWeatherSource::new(path.clone())),
            None => {
                let http = HttpFetcher::new(config.http_client_config())?;
                let base_url = Url::parse(&config.base_url)
                    .with_context(|| format!("invalid base url {}", config.base_url))?;
                if config.api_key.is_none() {
                    warn!("no api key configured; requests will be sent without APPID");
                }
                Arc::new(OpenWeatherMapSource::new(http, base_url, config.api_key.clone()))
            }
        };

        Ok(Self::new(source, Repositories::shared(Arc::new(store))).with_units(config.units))
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.store.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_units(mut self, units: DisplayUnits) -> Self {
        self.store.units = units;
        self
    }

    pub(crate) fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    /// Runs one fetch, parse, persist, notify cycle. Failures are reported in the outcome.
    ///
    /// The cycle holds the location's run lease throughout, so processes sharing the
    /// database never sync the same location at once.
    pub async fn run_once(&self, location_query: &str) -> SyncOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_cycle", %run_id, location = %location_query);
        let mut outcome = self.run_leased(run_id, location_query).instrument(span).await;
        outcome.finished_at = self.now_utc();
        outcome
    }

    async fn run_leased(&self, run_id: Uuid, location_query: &str) -> SyncOutcome {
        let now = self.clock.now();
        let started_at = now.with_timezone(&Utc);

        let leases = self.leases.clone();
        let key = location_query.to_string();
        let acquired = tokio::task::spawn_blocking(move || {
            leases.try_acquire_run(&key, run_id, started_at, started_at - run_lease_ttl())
        })
        .await;
        let outcome = SyncOutcome::started(run_id, location_query, started_at);
        match acquired {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                info!("another process holds the run lease; cycle skipped");
                return outcome.abort(CycleAbort::AlreadyRunning);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "acquiring run lease failed");
                return outcome.abort(CycleAbort::Lease(err));
            }
            Err(err) => {
                warn!(error = %err, "run lease task failed");
                return outcome.abort(CycleAbort::Interrupted(err));
            }
        }

        let outcome = self.run_cycle(outcome, now).await;

        let leases = self.leases.clone();
        let key = location_query.to_string();
        match tokio::task::spawn_blocking(move || leases.release_run(&key, run_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "releasing run lease failed; it lapses after the ttl"),
            Err(err) => warn!(error = %err, "run lease release task failed"),
        }
        outcome
    }

    async fn run_cycle(&self, mut outcome: SyncOutcome, now: DateTime<FixedOffset>) -> SyncOutcome {
        info!(source = self.source.source_id(), "sync cycle started");

        let ctx = AdapterContext {
            run_id: outcome.run_id,
        };
        let request = ForecastRequest::daily(&outcome.location_query);

        let payload = match self.source.fetch(&ctx, &request).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "fetch failed; waiting for next cycle");
                return outcome.abort(CycleAbort::Network(err));
            }
        };
        if payload.is_empty() {
            info!("empty response body; nothing to sync");
            return outcome.abort(CycleAbort::EmptyResponse);
        }

        let parsed = match parse_forecast(&payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, bytes = payload.len(), "payload rejected");
                return outcome.abort(CycleAbort::Parse(err));
            }
        };
        if parsed.days.is_empty() {
            info!("forecast list is empty; nothing to write");
            return outcome;
        }

        let window = SyncWindow::anchored_at(&now);
        let mut raw_days = parsed.days;
        let window_len = window.num_days as usize;
        if raw_days.len() > window_len {
            warn!(
                received = raw_days.len(),
                kept = window_len,
                "provider returned more days than the window holds; extra days dropped"
            );
            raw_days.truncate(window_len);
        }

        let store = self.store.clone();
        let location = parsed.location.into_new_location(&outcome.location_query);
        let now_utc = now.with_timezone(&Utc);
        let span = Span::current();
        let persisted = tokio::task::spawn_blocking(move || {
            span.in_scope(|| store.persist(location, raw_days, window, now_utc))
        })
        .await;

        match persisted {
            Ok(Ok(persisted)) => {
                outcome.inserted = persisted.inserted;
                outcome.prune_error = persisted.prune_error;
                outcome.notified = persisted.notified;
                outcome
            }
            Ok(Err(abort)) => outcome.abort(abort),
            Err(err) => {
                warn!(error = %err, "storage task failed");
                outcome.abort(CycleAbort::Interrupted(err))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::collections::HashMap;
    use std::thread::ThreadId;
    use wxsync_core::NotificationState;

    struct Harness {
        store: Arc<SqliteStore>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self::over(SqliteStore::in_memory().expect("in-memory store"))
        }

        fn over(store: SqliteStore) -> Self {
            Self {
                store: Arc::new(store),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn repos(&self) -> Repositories {
            Repositories::shared(self.store.clone())
        }

        fn pipeline(&self, source: StaticSource, now: &str) -> SyncPipeline {
            self.pipeline_over(source, self.repos(), now)
        }

        fn pipeline_over(&self, source: StaticSource, repos: Repositories, now: &str) -> SyncPipeline {
            SyncPipeline::new(Arc::new(source), repos)
                .with_sink(self.sink.clone())
                .with_clock(clock(now))
        }

        fn location_id(&self) -> LocationId {
            self.store
                .find_by_key("94043")
                .expect("lookup")
                .expect("stored location")
                .id
        }
    }

    #[tokio::test]
    async fn full_cycle_writes_window_and_notifies() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(
            StaticSource::Body(DAILY_14.to_vec()),
            "2026-10-16T08:00:00-07:00",
        );

        let outcome = pipeline.run_once("94043").await;
        assert!(outcome.is_success(), "{:?}", outcome.aborted);
        assert_eq!(outcome.inserted, 14);
        assert!(outcome.prune_error.is_none());
        assert!(outcome.notified);

        let location = harness
            .store
            .find_by_key("94043")
            .expect("lookup")
            .expect("location");
        assert_eq!(location.display_name, "Mountain View");

        let days = harness.store.days_for(location.id).expect("days");
        assert_eq!(days.len(), 14);
        assert_eq!(
            days[0].date.date_naive(),
            NaiveDate::from_ymd_opt(2026, 10, 16).expect("date")
        );
        assert_eq!(days[13].date - days[0].date, ChronoDuration::days(13));

        let sent = harness.sink.sent.lock().expect("sink lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, NOTIFICATION_TITLE);
        assert_eq!(sent[0].body, "Forecast: Clear High: 25° Low: 14°");
        assert_eq!(sent[0].weather_condition_id, 800);
        assert_eq!(
            harness.store.notification_state().expect("state").last_notified_at,
            Some(at("2026-10-16T15:00:00Z").with_timezone(&Utc))
        );
    }

    #[tokio::test]
    async fn repeated_cycle_replaces_rows_and_respects_gate() {
        let harness = Harness::new();
        let now = "2026-10-16T08:00:00-07:00";
        harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), now)
            .run_once("94043")
            .await;
        let second = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T11:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(second.is_success());
        assert_eq!(second.inserted, 14);
        assert!(!second.notified);
        assert_eq!(harness.sink.count(), 1);
        assert_eq!(harness.store.all().expect("locations").len(), 1);
        assert_eq!(harness.store.days_for(harness.location_id()).expect("days").len(), 14);
    }

    #[tokio::test]
    async fn later_cycle_evicts_rows_before_yesterday() {
        let harness = Harness::new();
        harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;
        let outcome = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-18T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(outcome.notified);
        let days = harness.store.days_for(harness.location_id()).expect("days");
        // Oct 16 is evicted; Oct 17 survives as yesterday; Oct 18..=31 are fresh.
        assert_eq!(days.len(), 15);
        assert_eq!(
            days[0].date.date_naive(),
            NaiveDate::from_ymd_opt(2026, 10, 17).expect("date")
        );
        assert_eq!(harness.sink.count(), 2);
    }

    #[tokio::test]
    async fn empty_list_is_a_successful_no_op() {
        let harness = Harness::new();
        let outcome = harness
            .pipeline(StaticSource::Body(EMPTY_LIST.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.inserted, 0);
        assert!(!outcome.notified);
        assert!(harness.store.all().expect("locations").is_empty());
        assert_eq!(harness.sink.count(), 0);
        assert_eq!(
            harness.store.notification_state().expect("state"),
            NotificationState::default()
        );
    }

    #[tokio::test]
    async fn network_failure_aborts_without_writes() {
        let harness = Harness::new();
        let outcome = harness
            .pipeline(StaticSource::Unavailable, "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(matches!(outcome.aborted, Some(CycleAbort::Network(_))));
        assert!(harness.store.all().expect("locations").is_empty());
        assert_eq!(harness.sink.count(), 0);
    }

    #[tokio::test]
    async fn empty_body_is_reported_distinctly() {
        let harness = Harness::new();
        let outcome = harness
            .pipeline(StaticSource::Body(Vec::new()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(matches!(outcome.aborted, Some(CycleAbort::EmptyResponse)));
        assert_eq!(outcome.inserted, 0);
    }

    #[tokio::test]
    async fn provider_error_document_is_a_parse_abort() {
        let harness = Harness::new();
        let outcome = harness
            .pipeline(StaticSource::Body(CITY_NOT_FOUND.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(matches!(
            outcome.aborted,
            Some(CycleAbort::Parse(ParseError::MissingList))
        ));
        assert!(harness.store.all().expect("locations").is_empty());
    }

    #[tokio::test]
    async fn disabled_notifications_leave_state_untouched() {
        let harness = Harness::new();
        harness
            .store
            .set_notifications_enabled(false)
            .expect("preference");
        let outcome = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert_eq!(outcome.inserted, 14);
        assert!(!outcome.notified);
        assert_eq!(harness.sink.count(), 0);
        assert_eq!(
            harness.store.notification_state().expect("state").last_notified_at,
            None
        );
    }

    /// Forecast repository that never reports a row for the requested day.
    struct NoTodayRows(Arc<SqliteStore>);

    impl ForecastRepository for NoTodayRows {
        fn upsert_days(&self, days: &[ForecastDay]) -> Result<usize, RepositoryError> {
            self.0.upsert_days(days)
        }

        fn delete_before(
            &self,
            location_id: LocationId,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, RepositoryError> {
            self.0.delete_before(location_id, cutoff)
        }

        fn find_day(
            &self,
            _location_id: LocationId,
            _date: DateTime<Utc>,
        ) -> Result<Option<ForecastDay>, RepositoryError> {
            Ok(None)
        }

        fn days_for(&self, location_id: LocationId) -> Result<Vec<ForecastDay>, RepositoryError> {
            self.0.days_for(location_id)
        }
    }

    /// Forecast repository whose eviction step always fails.
    struct FailingPrune(Arc<SqliteStore>);

    impl ForecastRepository for FailingPrune {
        fn upsert_days(&self, days: &[ForecastDay]) -> Result<usize, RepositoryError> {
            self.0.upsert_days(days)
        }

        fn delete_before(
            &self,
            location_id: LocationId,
            _cutoff: DateTime<Utc>,
        ) -> Result<usize, RepositoryError> {
            Err(RepositoryError::UnknownLocation(location_id))
        }

        fn find_day(
            &self,
            location_id: LocationId,
            date: DateTime<Utc>,
        ) -> Result<Option<ForecastDay>, RepositoryError> {
            self.0.find_day(location_id, date)
        }

        fn days_for(&self, location_id: LocationId) -> Result<Vec<ForecastDay>, RepositoryError> {
            self.0.days_for(location_id)
        }
    }

    fn pipeline_with_forecasts(
        harness: &Harness,
        forecasts: Arc<dyn ForecastRepository>,
    ) -> SyncPipeline {
        let repos = Repositories {
            forecasts,
            ..harness.repos()
        };
        harness.pipeline_over(
            StaticSource::Body(DAILY_14.to_vec()),
            repos,
            "2026-10-16T08:00:00-07:00",
        )
    }

    #[tokio::test]
    async fn missing_today_row_defers_notification() {
        let harness = Harness::new();
        let pipeline =
            pipeline_with_forecasts(&harness, Arc::new(NoTodayRows(harness.store.clone())));

        let outcome = pipeline.run_once("94043").await;
        assert!(outcome.is_success());
        assert!(!outcome.notified);
        assert_eq!(harness.sink.count(), 0);
        assert_eq!(
            harness.store.notification_state().expect("state").last_notified_at,
            None
        );
    }

    #[tokio::test]
    async fn prune_failure_keeps_cycle_successful() {
        let harness = Harness::new();
        let pipeline =
            pipeline_with_forecasts(&harness, Arc::new(FailingPrune(harness.store.clone())));

        let outcome = pipeline.run_once("94043").await;
        assert!(outcome.is_success());
        assert_eq!(outcome.inserted, 14);
        assert!(matches!(
            outcome.prune_error,
            Some(RepositoryError::UnknownLocation(_))
        ));
        assert!(outcome.notified);
    }

    /// Settings store that cannot persist the notification time.
    struct RecordFails(Arc<SqliteStore>);

    impl SettingsStore for RecordFails {
        fn notifications_enabled(&self) -> Result<bool, RepositoryError> {
            self.0.notifications_enabled()
        }

        fn set_notifications_enabled(&self, enabled: bool) -> Result<(), RepositoryError> {
            self.0.set_notifications_enabled(enabled)
        }

        fn notification_state(&self) -> Result<NotificationState, RepositoryError> {
            self.0.notification_state()
        }

        fn record_notified(&self, _at: DateTime<Utc>) -> Result<(), RepositoryError> {
            Err(RepositoryError::Io {
                path: PathBuf::from("/state"),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    #[tokio::test]
    async fn unrecorded_notification_is_not_reported() {
        let harness = Harness::new();
        let repos = Repositories {
            settings: Arc::new(RecordFails(harness.store.clone())),
            ..harness.repos()
        };
        let outcome = harness
            .pipeline_over(
                StaticSource::Body(DAILY_14.to_vec()),
                repos,
                "2026-10-16T08:00:00-07:00",
            )
            .run_once("94043")
            .await;

        assert!(outcome.is_success());
        assert_eq!(harness.sink.count(), 1);
        assert!(!outcome.notified);
        assert_eq!(
            harness.store.notification_state().expect("state").last_notified_at,
            None
        );
    }

    #[tokio::test]
    async fn extra_days_beyond_window_are_dropped() {
        let mut payload: serde_json::Value =
            serde_json::from_slice(DAILY_14).expect("fixture json");
        let list = payload["list"].as_array_mut().expect("forecast list");
        let extra = list[..2].to_vec();
        list.extend(extra);
        let body = serde_json::to_vec(&payload).expect("encode payload");

        let harness = Harness::new();
        let outcome = harness
            .pipeline(StaticSource::Body(body), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.inserted, 14);
        let days = harness.store.days_for(harness.location_id()).expect("days");
        assert_eq!(days.len(), 14);
        assert_eq!(
            days[13].date.date_naive(),
            NaiveDate::from_ymd_opt(2026, 10, 29).expect("date")
        );
    }

    /// Forecast repository that notes which thread each write ran on.
    struct ThreadRecording {
        inner: Arc<SqliteStore>,
        threads: std::sync::Mutex<Vec<ThreadId>>,
    }

    impl ForecastRepository for ThreadRecording {
        fn upsert_days(&self, days: &[ForecastDay]) -> Result<usize, RepositoryError> {
            self.threads
                .lock()
                .expect("threads lock")
                .push(std::thread::current().id());
            self.inner.upsert_days(days)
        }

        fn delete_before(
            &self,
            location_id: LocationId,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, RepositoryError> {
            self.inner.delete_before(location_id, cutoff)
        }

        fn find_day(
            &self,
            location_id: LocationId,
            date: DateTime<Utc>,
        ) -> Result<Option<ForecastDay>, RepositoryError> {
            self.inner.find_day(location_id, date)
        }

        fn days_for(&self, location_id: LocationId) -> Result<Vec<ForecastDay>, RepositoryError> {
            self.inner.days_for(location_id)
        }
    }

    // The current-thread runtime polls the cycle on the test thread itself.
    #[tokio::test]
    async fn storage_work_runs_on_the_blocking_pool() {
        let harness = Harness::new();
        let recording = Arc::new(ThreadRecording {
            inner: harness.store.clone(),
            threads: std::sync::Mutex::new(Vec::new()),
        });
        let outcome = pipeline_with_forecasts(&harness, recording.clone())
            .run_once("94043")
            .await;

        assert!(outcome.is_success());
        let threads = recording.threads.lock().expect("threads lock").clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn lease_held_by_another_process_skips_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wxsync.sqlite3");
        let other = SqliteStore::open(&path).expect("other process");
        let harness = Harness::over(SqliteStore::open(&path).expect("this process"));

        let holder = Uuid::new_v4();
        let held_at = at("2026-10-16T14:55:00Z").with_timezone(&Utc);
        assert!(other
            .try_acquire_run("94043", holder, held_at, held_at - run_lease_ttl())
            .expect("lease"));

        let skipped = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;
        assert!(matches!(skipped.aborted, Some(CycleAbort::AlreadyRunning)));
        assert!(other.all().expect("locations").is_empty());
        assert_eq!(harness.sink.count(), 0);

        other.release_run("94043", holder).expect("release");
        let outcome = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;
        assert!(outcome.is_success());

        // Rows written through one handle are visible through the other.
        let location = other
            .find_by_key("94043")
            .expect("lookup")
            .expect("location");
        assert_eq!(other.days_for(location.id).expect("days").len(), 14);
        assert!(other.notification_state().expect("state").last_notified_at.is_some());
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over_and_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wxsync.sqlite3");
        let crashed = SqliteStore::open(&path).expect("crashed process");
        let harness = Harness::over(SqliteStore::open(&path).expect("this process"));

        let held_at = at("2026-10-16T14:45:00Z").with_timezone(&Utc);
        assert!(crashed
            .try_acquire_run("94043", Uuid::new_v4(), held_at, held_at - run_lease_ttl())
            .expect("lease"));

        let outcome = harness
            .pipeline(StaticSource::Body(DAILY_14.to_vec()), "2026-10-16T08:00:00-07:00")
            .run_once("94043")
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.aborted);

        let now = at("2026-10-16T15:00:00Z").with_timezone(&Utc);
        assert!(crashed
            .try_acquire_run("94043", Uuid::new_v4(), now, now - run_lease_ttl())
            .expect("lease after cycle"));
    }

    #[test]
    fn gate_opens_after_a_full_day() {
        let last = at("2026-10-15T07:00:00Z").with_timezone(&Utc);
        let almost = last + ChronoDuration::hours(23) + ChronoDuration::minutes(59);
        let exactly = last + ChronoDuration::hours(24);

        assert!(should_notify(almost, None, true));
        assert!(!should_notify(almost, Some(last), true));
        assert!(should_notify(exactly, Some(last), true));
        assert!(!should_notify(exactly, Some(exactly), true));
        assert!(!should_notify(exactly, None, false));
    }

    #[test]
    fn imperial_units_convert_for_display() {
        assert_eq!(DisplayUnits::Metric.format_temperature(14.4), "14°");
        assert_eq!(DisplayUnits::Imperial.format_temperature(25.0), "77°");
        assert_eq!(DisplayUnits::Imperial.format_temperature(14.0), "57°");
        assert_eq!(DisplayUnits::parse(" Imperial "), DisplayUnits::Imperial);
        assert_eq!(DisplayUnits::parse("kelvin"), DisplayUnits::Metric);
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(|_| None);
        assert_eq!(defaults.location_query, DEFAULT_LOCATION_QUERY);
        assert_eq!(defaults.base_url, DEFAULT_BASE_URL);
        assert_eq!(defaults.schedule.interval, Duration::from_secs(10_800));
        assert_eq!(defaults.schedule.flex, Duration::from_secs(3_600));
        assert_eq!(defaults.http_client_config().connect_timeout, Duration::from_secs(10));
        assert!(defaults.api_key.is_none());
        assert!(defaults.fixture_path.is_none());
        assert_eq!(defaults.state_path, PathBuf::from(DEFAULT_STATE_PATH));

        let vars: HashMap<&str, &str> = HashMap::from([
            ("WXSYNC_LOCATION", "London,UK"),
            ("WXSYNC_API_KEY", "  "),
            ("OPEN_WEATHER_MAP_API_KEY", "secret"),
            ("WXSYNC_SYNC_INTERVAL_SECS", "600"),
            ("WXSYNC_HTTP_TIMEOUT_SECS", "5"),
            ("WXSYNC_UNITS", "imperial"),
            ("WXSYNC_STATE_PATH", "/var/lib/wxsync/state.sqlite3"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.location_query, "London,UK");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.schedule.interval, Duration::from_secs(600));
        assert_eq!(config.schedule.flex, Duration::from_secs(200));
        assert_eq!(config.http_client_config().connect_timeout, Duration::from_secs(5));
        assert_eq!(config.units, DisplayUnits::Imperial);
        assert_eq!(config.state_path, PathBuf::from("/var/lib/wxsync/state.sqlite3"));
    }
}
