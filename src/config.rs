//! Runtime configuration, loaded from `VIBEWATCH_*` environment variables.
//!
//! Every setting has a default, so an empty environment yields a working
//! local setup (push and geocoding disabled).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::aggregation::{DEFAULT_SUMMARY_LOOKBACK_MINUTES, DEFAULT_SUMMARY_MIN_REPORTS};
use crate::cluster::DEFAULT_MAX_DISTANCE_KM;
use crate::error::{EngineError, Result, validate_radius};
use crate::notify::{CooldownScope, DEFAULT_COOLDOWN_SECS, DEFAULT_NOTIFICATION_RADIUS_KM};
use crate::push::DEFAULT_PUSH_RADIUS_KM;
use crate::realtime::BackoffPolicy;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:vibewatch.db?mode=rwc";

const DEFAULT_ROUTE_DELAY_MS: u64 = 1000;
const DEFAULT_SUMMARY_INTERVAL_MINS: u64 = 30;
const DEFAULT_SNAPSHOT_LOOKBACK_HOURS: i64 = 24;
const DEFAULT_SNAPSHOT_REFRESH_MINS: u64 = 5;
const DEFAULT_RECONNECT_INITIAL_SECS: u64 = 5;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 300;
const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u64 = 10;

/// Everything the engine and its background tasks need.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub database_url: String,

    /// Per-event notification radius.
    pub notification_radius_km: f64,
    /// Seed radius for clustering.
    pub cluster_distance_km: f64,
    pub cooldown: TimeDelta,
    pub cooldown_scope: CooldownScope,

    /// Pause between a report change's commit and its routing, so viewer
    /// locations settle.
    pub route_delay: Duration,

    pub summary_interval: Duration,
    pub summary_lookback_minutes: u32,
    pub summary_min_reports: usize,

    /// How far back the in-memory snapshot reaches.
    pub snapshot_lookback: TimeDelta,
    pub snapshot_refresh: Duration,

    pub push_url: Option<String>,
    pub push_api_key: Option<String>,
    pub push_radius_km: f64,

    pub geocoder_url: Option<String>,

    pub backoff: BackoffPolicy,
    pub subscribe_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            notification_radius_km: DEFAULT_NOTIFICATION_RADIUS_KM,
            cluster_distance_km: DEFAULT_MAX_DISTANCE_KM,
            cooldown: TimeDelta::seconds(DEFAULT_COOLDOWN_SECS),
            cooldown_scope: CooldownScope::Global,
            route_delay: Duration::from_millis(DEFAULT_ROUTE_DELAY_MS),
            summary_interval: Duration::from_secs(DEFAULT_SUMMARY_INTERVAL_MINS * 60),
            summary_lookback_minutes: DEFAULT_SUMMARY_LOOKBACK_MINUTES,
            summary_min_reports: DEFAULT_SUMMARY_MIN_REPORTS,
            snapshot_lookback: TimeDelta::hours(DEFAULT_SNAPSHOT_LOOKBACK_HOURS),
            snapshot_refresh: Duration::from_secs(DEFAULT_SNAPSHOT_REFRESH_MINS * 60),
            push_url: None,
            push_api_key: None,
            push_radius_km: DEFAULT_PUSH_RADIUS_KM,
            geocoder_url: None,
            backoff: BackoffPolicy::default(),
            subscribe_timeout: Duration::from_secs(DEFAULT_SUBSCRIBE_TIMEOUT_SECS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cooldown_scope = match get("VIBEWATCH_COOLDOWN_SCOPE").as_deref() {
            None | Some("global") => CooldownScope::Global,
            Some("per_severity") => CooldownScope::PerSeverity,
            Some(other) => {
                return Err(EngineError::Config(format!(
                    "VIBEWATCH_COOLDOWN_SCOPE must be global or per_severity, got {other:?}"
                )));
            }
        };

        let backoff = BackoffPolicy::new(
            Duration::from_secs(parse_or(
                &get,
                "VIBEWATCH_RECONNECT_INITIAL_SECS",
                DEFAULT_RECONNECT_INITIAL_SECS,
            )?),
            Duration::from_secs(parse_or(
                &get,
                "VIBEWATCH_RECONNECT_MAX_SECS",
                DEFAULT_RECONNECT_MAX_SECS,
            )?),
            defaults.backoff.multiplier(),
        )?;

        let config = Self {
            port: parse_or(&get, "VIBEWATCH_PORT", defaults.port)?,
            database_url: get("VIBEWATCH_DATABASE_URL").unwrap_or(defaults.database_url),
            notification_radius_km: parse_or(
                &get,
                "VIBEWATCH_NOTIFICATION_RADIUS_KM",
                defaults.notification_radius_km,
            )?,
            cluster_distance_km: parse_or(
                &get,
                "VIBEWATCH_CLUSTER_DISTANCE_KM",
                defaults.cluster_distance_km,
            )?,
            cooldown: TimeDelta::seconds(parse_or(
                &get,
                "VIBEWATCH_COOLDOWN_SECS",
                DEFAULT_COOLDOWN_SECS,
            )?),
            cooldown_scope,
            route_delay: Duration::from_millis(parse_or(
                &get,
                "VIBEWATCH_ROUTE_DELAY_MS",
                DEFAULT_ROUTE_DELAY_MS,
            )?),
            summary_interval: Duration::from_secs(
                parse_or(
                    &get,
                    "VIBEWATCH_SUMMARY_INTERVAL_MINS",
                    DEFAULT_SUMMARY_INTERVAL_MINS,
                )? * 60,
            ),
            summary_lookback_minutes: parse_or(
                &get,
                "VIBEWATCH_SUMMARY_LOOKBACK_MINS",
                defaults.summary_lookback_minutes,
            )?,
            summary_min_reports: parse_or(
                &get,
                "VIBEWATCH_SUMMARY_MIN_REPORTS",
                defaults.summary_min_reports,
            )?,
            snapshot_lookback: TimeDelta::hours(parse_or(
                &get,
                "VIBEWATCH_SNAPSHOT_LOOKBACK_HOURS",
                DEFAULT_SNAPSHOT_LOOKBACK_HOURS,
            )?),
            snapshot_refresh: Duration::from_secs(
                parse_or(
                    &get,
                    "VIBEWATCH_SNAPSHOT_REFRESH_MINS",
                    DEFAULT_SNAPSHOT_REFRESH_MINS,
                )? * 60,
            ),
            push_url: get("VIBEWATCH_PUSH_URL"),
            push_api_key: get("VIBEWATCH_PUSH_API_KEY"),
            push_radius_km: parse_or(&get, "VIBEWATCH_PUSH_RADIUS_KM", defaults.push_radius_km)?,
            geocoder_url: get("VIBEWATCH_GEOCODER_URL"),
            backoff,
            subscribe_timeout: Duration::from_secs(parse_or(
                &get,
                "VIBEWATCH_SUBSCRIBE_TIMEOUT_SECS",
                DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that indicate a deployment mistake.
    pub fn validate(&self) -> Result<()> {
        validate_radius(self.notification_radius_km)?;
        validate_radius(self.cluster_distance_km)?;
        validate_radius(self.push_radius_km)?;

        if self.cooldown < TimeDelta::zero() {
            return Err(EngineError::Config("cooldown must not be negative".into()));
        }
        if self.summary_interval.is_zero() {
            return Err(EngineError::Config("summary interval must be positive".into()));
        }
        if self.snapshot_refresh.is_zero() {
            return Err(EngineError::Config("snapshot refresh must be positive".into()));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}
