use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::{SyncOutcome, SyncPipeline, DEFAULT_SYNC_INTERVAL_SECS};

const MIN_TICK: Duration = Duration::from_secs(1);

/// Periodic cadence. A cycle becomes due once `interval` has elapsed since the last
/// start and runs within `flex` of that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub flex: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::from_secs(DEFAULT_SYNC_INTERVAL_SECS, DEFAULT_SYNC_INTERVAL_SECS / 3)
    }
}

impl ScheduleConfig {
    pub fn from_secs(interval_secs: u64, flex_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            flex: Duration::from_secs(flex_secs),
        }
    }

    /// How often the scheduler checks whether a cycle is due.
    pub fn tick(&self) -> Duration {
        self.flex.clamp(MIN_TICK, self.interval.max(MIN_TICK))
    }
}

pub fn is_due(last_started_at: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last_started_at {
        None => true,
        Some(last) => (now - last)
            .to_std()
            .map(|elapsed| elapsed >= interval)
            .unwrap_or(false),
    }
}

#[derive(Debug, Default)]
struct SlotState {
    last_started_at: Option<DateTime<Utc>>,
}

pub enum TriggerOutcome {
    Started(JoinHandle<SyncOutcome>),
    /// A cycle was already in flight; this request folded into it.
    Coalesced,
}

/// Runs cycles for one location, never more than one at a time.
#[derive(Clone)]
pub struct SyncScheduler {
    pipeline: Arc<SyncPipeline>,
    location_query: Arc<str>,
    slot: Arc<Mutex<SlotState>>,
}

impl SyncScheduler {
    pub fn new(pipeline: Arc<SyncPipeline>, location_query: impl Into<String>) -> Self {
        Self {
            pipeline,
            location_query: Arc::from(location_query.into()),
            slot: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    /// Starts a cycle immediately unless one is already running.
    pub fn trigger_now(&self) -> TriggerOutcome {
        let Ok(mut slot) = self.slot.clone().try_lock_owned() else {
            info!(location = %self.location_query, "sync already in flight; trigger coalesced");
            return TriggerOutcome::Coalesced;
        };
        slot.last_started_at = Some(self.pipeline.now_utc());

        let pipeline = self.pipeline.clone();
        let location_query = self.location_query.clone();
        TriggerOutcome::Started(tokio::spawn(async move {
            let outcome = pipeline.run_once(&location_query).await;
            drop(slot);
            outcome
        }))
    }

    /// One scheduler tick: runs a cycle when due and the slot is free.
    pub(crate) async fn periodic_tick(&self, interval: Duration) -> Option<SyncOutcome> {
        let Ok(mut slot) = self.slot.clone().try_lock_owned() else {
            debug!("tick skipped; cycle in flight");
            return None;
        };
        let now = self.pipeline.now_utc();
        if !is_due(slot.last_started_at, now, interval) {
            return None;
        }
        slot.last_started_at = Some(now);
        Some(self.pipeline.run_once(&self.location_query).await)
    }

    /// Registers the periodic job and starts the scheduler. Calling this again builds
    /// a fresh scheduler sharing the same slot, so cycles still never overlap.
    pub async fn schedule_periodic(&self, config: ScheduleConfig) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let interval = config.interval;
        let this = self.clone();
        let job = Job::new_repeated_async(config.tick(), move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                let Some(outcome) = this.periodic_tick(interval).await else {
                    return;
                };
                match &outcome.aborted {
                    None => info!(
                        run_id = %outcome.run_id,
                        inserted = outcome.inserted,
                        notified = outcome.notified,
                        "scheduled sync finished"
                    ),
                    Some(abort) => warn!(run_id = %outcome.run_id, error = %abort, "scheduled sync aborted"),
                }
            })
        })
        .context("creating periodic sync job")?;
        sched.add(job).await.context("adding periodic sync job")?;
        sched.start().await.context("starting scheduler")?;

        info!(
            location = %self.location_query,
            interval_secs = config.interval.as_secs(),
            flex_secs = config.flex.as_secs(),
            "periodic sync scheduled"
        );
        Ok(sched)
    }
}
