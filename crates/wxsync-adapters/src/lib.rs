//! Weather source contracts, the OpenWeatherMap daily source + forecast payload parser.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use wxsync_core::{ParsedLocation, RawDayForecast, FORECAST_DAYS};
use wxsync_storage::{FetchError, HttpFetcher, Url};

pub const CRATE_NAME: &str = "wxsync-adapters";

pub const DEFAULT_BASE_URL: &str = "http://api.openweathermap.org/data/2.5/forecast/daily";
pub const RESULT_FORMAT: &str = "json";
pub const UNIT_SYSTEM: &str = "metric";

pub type TransportError = FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastRequest {
    pub location_query: String,
    pub format: &'static str,
    pub units: &'static str,
    pub num_days: u32,
}

impl ForecastRequest {
    /// JSON, metric, [`FORECAST_DAYS`] days.
    pub fn daily(location_query: impl Into<String>) -> Self {
        Self {
            location_query: location_query.into(),
            format: RESULT_FORMAT,
            units: UNIT_SYSTEM,
            num_days: FORECAST_DAYS,
        }
    }
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Raw response body. An empty body is returned as-is; interpreting it is up to the caller.
    async fn fetch(
        &self,
        ctx: &AdapterContext,
        request: &ForecastRequest,
    ) -> Result<Vec<u8>, TransportError>;
}

pub struct OpenWeatherMapSource {
    http: HttpFetcher,
    base_url: Url,
    api_key: Option<String>,
}

impl OpenWeatherMapSource {
    pub fn new(http: HttpFetcher, base_url: Url, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn request_url(&self, request: &ForecastRequest) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", &request.location_query)
                .append_pair("mode", request.format)
                .append_pair("units", request.units)
                .append_pair("cnt", &request.num_days.to_string());
            if let Some(key) = &self.api_key {
                pairs.append_pair("APPID", key);
            }
        }
        url
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherMapSource {
    fn source_id(&self) -> &'static str {
        "openweathermap"
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        request: &ForecastRequest,
    ) -> Result<Vec<u8>, TransportError> {
        self.http
            .fetch_bytes(ctx.run_id, self.request_url(request))
            .await
    }
}

/// Serves a payload captured on disk, for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureWeatherSource {
    path: PathBuf,
}

impl FixtureWeatherSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WeatherSource for FixtureWeatherSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        request: &ForecastRequest,
    ) -> Result<Vec<u8>, TransportError> {
        debug!(run_id = %ctx.run_id, location = %request.location_query, path = %self.path.display(), "serving fixture payload");
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload has no forecast list")]
    MissingList,
    #[error("malformed forecast payload: {0}")]
    MalformedStructure(String),
}

/// Decoded payload: the city block plus one record per list entry, day 0 first.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedForecast {
    pub location: ParsedLocation,
    pub days: Vec<RawDayForecast>,
}

#[derive(Debug, Deserialize)]
struct ForecastEnvelope {
    city: CityBlock,
    list: Vec<DayBlock>,
}

#[derive(Debug, Deserialize)]
struct CityBlock {
    name: String,
    coord: CoordBlock,
}

#[derive(Debug, Deserialize)]
struct CoordBlock {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct DayBlock {
    pressure: f64,
    #[serde(deserialize_with = "whole_number")]
    humidity: i32,
    speed: f64,
    deg: f64,
    weather: Vec<ConditionBlock>,
    temp: TemperatureBlock,
}

#[derive(Debug, Deserialize)]
struct ConditionBlock {
    main: String,
    #[serde(deserialize_with = "whole_number")]
    id: i32,
}

#[derive(Debug, Deserialize)]
struct TemperatureBlock {
    max: f64,
    min: f64,
}

// The API emits integers for these, but fractional values are truncated rather than rejected.
fn whole_number<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return Err(D::Error::custom(format!("{value} is not a valid integer")));
    }
    Ok(value.trunc() as i32)
}

impl DayBlock {
    fn into_raw(self, index: usize) -> Result<RawDayForecast, ParseError> {
        let condition = self.weather.into_iter().next().ok_or_else(|| {
            ParseError::MalformedStructure(format!("list[{index}].weather is empty"))
        })?;
        Ok(RawDayForecast {
            humidity_percent: self.humidity,
            pressure_hpa: self.pressure,
            wind_speed_meters_per_sec: self.speed,
            wind_direction_degrees: self.deg,
            high_temp_c: self.temp.max,
            low_temp_c: self.temp.min,
            short_description: condition.main,
            weather_condition_id: condition.id,
        })
    }
}

/// Decodes a daily forecast payload. Pure; nothing is persisted.
pub fn parse_forecast(payload: &[u8]) -> Result<ParsedForecast, ParseError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::EmptyPayload);
    }

    let value: JsonValue = serde_json::from_slice(payload)
        .map_err(|err| ParseError::MalformedStructure(err.to_string()))?;
    let Some(root) = value.as_object() else {
        return Err(ParseError::MalformedStructure(
            "payload root is not an object".to_string(),
        ));
    };
    if root.get("list").map_or(true, JsonValue::is_null) {
        return Err(ParseError::MissingList);
    }

    let envelope: ForecastEnvelope = serde_json::from_value(value)
        .map_err(|err| ParseError::MalformedStructure(err.to_string()))?;
    let days = envelope
        .list
        .into_iter()
        .enumerate()
        .map(|(index, day)| day.into_raw(index))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedForecast {
        location: ParsedLocation {
            display_name: envelope.city.name,
            latitude: envelope.city.coord.lat,
            longitude: envelope.city.coord.lon,
        },
        days,
    })
}
