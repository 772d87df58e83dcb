//! Core domain model and calendar-day math for wxsync.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wxsync-core";

/// Julian day number of 1970-01-01.
pub const EPOCH_JULIAN_DAY: i64 = 2_440_588;

/// Number of forecast days requested and written per cycle.
pub const FORECAST_DAYS: u32 = 14;

const DAY_IN_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Opaque, stable identifier of a stored location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored location. `location_key` is the query string used to request data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub location_key: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Location metadata decoded from a payload, before it has been assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    pub location_key: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// City block of a forecast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLocation {
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl ParsedLocation {
    pub fn into_new_location(self, location_key: impl Into<String>) -> NewLocation {
        NewLocation {
            location_key: location_key.into(),
            display_name: self.display_name,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// One element of the forecast list, in forecast-day order, not yet dated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDayForecast {
    pub humidity_percent: i32,
    pub pressure_hpa: f64,
    pub wind_speed_meters_per_sec: f64,
    pub wind_direction_degrees: f64,
    pub high_temp_c: f64,
    pub low_temp_c: f64,
    pub short_description: String,
    pub weather_condition_id: i32,
}

/// Persisted forecast row. At most one per `(location_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub location_id: LocationId,
    /// UTC midnight of the forecast's calendar day.
    pub date: DateTime<Utc>,
    pub humidity_percent: i32,
    pub pressure_hpa: f64,
    pub wind_speed_meters_per_sec: f64,
    pub wind_direction_degrees: f64,
    pub high_temp_c: f64,
    pub low_temp_c: f64,
    pub short_description: String,
    pub weather_condition_id: i32,
}

impl ForecastDay {
    pub fn from_raw(location_id: LocationId, date: DateTime<Utc>, raw: RawDayForecast) -> Self {
        Self {
            location_id,
            date,
            humidity_percent: raw.humidity_percent,
            pressure_hpa: raw.pressure_hpa,
            wind_speed_meters_per_sec: raw.wind_speed_meters_per_sec,
            wind_direction_degrees: raw.wind_direction_degrees,
            high_temp_c: raw.high_temp_c,
            low_temp_c: raw.low_temp_c,
            short_description: raw.short_description,
            weather_condition_id: raw.weather_condition_id,
        }
    }
}

/// Day-granularity count anchored at [`EPOCH_JULIAN_DAY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JulianDay(pub i64);

impl JulianDay {
    /// Julian day of the local calendar date at `epoch_millis` for a zone `gmtoff_secs`
    /// east of UTC.
    pub fn from_epoch_millis(epoch_millis: i64, gmtoff_secs: i32) -> Self {
        let local_millis = epoch_millis + i64::from(gmtoff_secs) * 1000;
        Self(local_millis.div_euclid(DAY_IN_MILLIS) + EPOCH_JULIAN_DAY)
    }

    /// Julian day of the anchor's own local calendar date.
    pub fn of_local(anchor: &DateTime<FixedOffset>) -> Self {
        Self::from_epoch_millis(anchor.timestamp_millis(), anchor.offset().local_minus_utc())
    }

    pub fn offset(self, days: i64) -> Self {
        Self(self.0 + days)
    }

    /// Midnight UTC of this day.
    pub fn utc_midnight(self) -> DateTime<Utc> {
        DateTime::<Utc>::default() + Duration::days(self.0 - EPOCH_JULIAN_DAY)
    }
}

/// Converts a forecast sequence index into the UTC midnight of the anchor's local day
/// plus `day_offset`.
pub fn normalize(anchor_epoch_millis: i64, gmtoff_secs: i32, day_offset: u32) -> DateTime<Utc> {
    JulianDay::from_epoch_millis(anchor_epoch_millis, gmtoff_secs)
        .offset(i64::from(day_offset))
        .utc_midnight()
}

pub fn normalize_local(anchor: &DateTime<FixedOffset>, day_offset: u32) -> DateTime<Utc> {
    JulianDay::of_local(anchor)
        .offset(i64::from(day_offset))
        .utc_midnight()
}

/// Span of dates one cycle writes, recomputed from the clock every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub julian_start_day: JulianDay,
    pub num_days: u32,
}

impl SyncWindow {
    pub fn anchored_at(now: &DateTime<FixedOffset>) -> Self {
        Self {
            julian_start_day: JulianDay::of_local(now),
            num_days: FORECAST_DAYS,
        }
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.julian_start_day.utc_midnight()
    }

    pub fn date_for(&self, index: u32) -> DateTime<Utc> {
        self.julian_start_day.offset(i64::from(index)).utc_midnight()
    }

    /// Rows dated strictly before this are evicted.
    pub fn prune_cutoff(&self) -> DateTime<Utc> {
        self.julian_start_day.offset(-1).utc_midnight()
    }
}

/// Persisted across cycles to space notifications at least a day apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    pub last_notified_at: Option<DateTime<Utc>>,
}

pub trait Clock: Send + Sync {
    /// Current instant expressed in the host's local offset.
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        DateTime::<FixedOffset>::from(Local::now())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}
