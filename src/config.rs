//! Runtime configuration
//!
//! All settings carry defaults, so an empty JSON object (or a missing file)
//! produces a working configuration.

use crate::error::{Result, TripError};
use crate::types::{CostCategory, Pace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a trip planner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TripConfig {
    pub broker: BrokerConfig,
    pub scoring: ScoringWeights,
    pub budget: BudgetPolicy,
    pub schedule: ScheduleConfig,
    pub coordinator: CoordinatorConfig,
    pub negotiation: NegotiationConfig,
}

impl TripConfig {
    /// Load configuration from a JSON file
    ///
    /// Returns the default configuration if the file does not exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TripError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: TripConfig = serde_json::from_str(&content).map_err(|e| {
            TripError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Reject settings the planner cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.broker.max_attempts == 0 {
            return Err(TripError::Config("broker.maxAttempts must be at least 1".into()));
        }
        if self.broker.base_backoff_ms == 0 {
            return Err(TripError::Config("broker.baseBackoffMs must be at least 1".into()));
        }
        if self.broker.max_backoff_ms < self.broker.base_backoff_ms.saturating_mul(2) {
            return Err(TripError::Config(format!(
                "broker.maxBackoffMs must be at least twice baseBackoffMs ({}), got {}",
                self.broker.base_backoff_ms, self.broker.max_backoff_ms
            )));
        }
        if self.scoring.has_negative() {
            return Err(TripError::Config("scoring weights must not be negative".into()));
        }
        if self.scoring.total() <= 0.0 {
            return Err(TripError::Config("scoring weights must sum to a positive value".into()));
        }
        if !(self.negotiation.quorum > 0.0 && self.negotiation.quorum <= 1.0) {
            return Err(TripError::Config(format!(
                "negotiation.quorum must be in (0, 1], got {}",
                self.negotiation.quorum
            )));
        }
        if self.schedule.daily_cutoff_hour <= self.schedule.day_start_hour
            || self.schedule.daily_cutoff_hour > 24
        {
            return Err(TripError::Config(
                "schedule.dailyCutoffHour must fall after dayStartHour".into(),
            ));
        }
        if self.coordinator.top_n == 0 {
            return Err(TripError::Config("coordinator.topN must be at least 1".into()));
        }
        Ok(())
    }
}

/// Message broker retry and retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Delivery attempts before a message is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failed attempt; doubles per attempt
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Lifetime of at-most-once offers before they are discarded as late
    #[serde(default = "default_quote_ttl_ms")]
    pub quote_ttl_ms: u64,

    /// Maximum dead letters retained in memory
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Exactly-once keys remembered before the oldest are forgotten
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_quote_ttl_ms() -> u64 {
    30_000
}

fn default_dead_letter_capacity() -> usize {
    10_000
}

fn default_dedupe_capacity() -> usize {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            quote_ttl_ms: default_quote_ttl_ms(),
            dead_letter_capacity: default_dead_letter_capacity(),
            dedupe_capacity: default_dedupe_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Delay before the next attempt after `failed_attempts` failures (1-based)
    ///
    /// `base * 2^(failed_attempts - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Flight ranking weights
///
/// The composite score is `sum(weight * normalized_factor)`; weights need not
/// sum to one. `departure_time` favours mid-morning departures and is off by
/// default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringWeights {
    pub price: f64,
    pub duration: f64,
    pub stops: f64,
    pub departure_time: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            price: 0.4,
            duration: 0.3,
            stops: 0.3,
            departure_time: 0.0,
        }
    }
}

impl ScoringWeights {
    /// Weighting with an explicit time-of-day factor
    pub fn with_time_factor() -> Self {
        Self {
            price: 0.4,
            duration: 0.3,
            stops: 0.2,
            departure_time: 0.1,
        }
    }

    pub fn total(&self) -> f64 {
        self.price + self.duration + self.stops + self.departure_time
    }

    fn has_negative(&self) -> bool {
        [self.price, self.duration, self.stops, self.departure_time]
            .iter()
            .any(|w| *w < 0.0 || w.is_nan())
    }
}

/// Budget allocation and tolerance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetPolicy {
    /// Fraction above the budget maximum tolerated before the plan is over budget
    pub contingency: f64,
    pub flights: f64,
    pub lodging: f64,
    pub activities: f64,
    pub misc: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            contingency: 0.10,
            flights: 0.40,
            lodging: 0.35,
            activities: 0.15,
            misc: 0.10,
        }
    }
}

impl BudgetPolicy {
    /// Share of the budget maximum allotted to a category
    pub fn allocation(&self, category: CostCategory) -> f64 {
        match category {
            CostCategory::Flights => self.flights,
            CostCategory::Lodging => self.lodging,
            CostCategory::Activities => self.activities,
            CostCategory::Misc => self.misc,
        }
    }
}

/// Daily scheduling limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    pub day_start_hour: u32,
    /// No activity may end after this hour
    pub daily_cutoff_hour: u32,
    /// Earliest activity start on the arrival day
    pub arrival_day_start_hour: u32,
    /// Activities on the departure day end by this hour
    pub departure_day_cutoff_hour: u32,
    /// Hotel check-in and check-out times
    pub check_in_hour: u32,
    pub check_out_hour: u32,
    /// Fixed gap inserted after a rescheduled item and between activities
    pub buffer_minutes: i64,
    pub relaxed_cap: usize,
    pub moderate_cap: usize,
    pub packed_cap: usize,
    /// Average ground speed used to estimate travel between locations
    pub travel_speed_kmh: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            day_start_hour: 9,
            daily_cutoff_hour: 22,
            arrival_day_start_hour: 14,
            departure_day_cutoff_hour: 12,
            check_in_hour: 15,
            check_out_hour: 11,
            buffer_minutes: 15,
            relaxed_cap: 2,
            moderate_cap: 3,
            packed_cap: 4,
            travel_speed_kmh: 25.0,
        }
    }
}

impl ScheduleConfig {
    pub fn daily_cap(&self, pace: Pace) -> usize {
        match pace {
            Pace::Relaxed => self.relaxed_cap,
            Pace::Moderate => self.moderate_cap,
            Pace::Packed => self.packed_cap,
        }
    }

    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes)
    }
}

/// Planning workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// Per-agent search deadline
    pub search_timeout_ms: u64,
    /// Ranked options returned per category
    pub top_n: usize,
    /// Detect/resolve rounds before remaining conflicts go to manual review
    pub max_resolve_iterations: usize,
    /// Restarts granted to a failed agent per run
    pub agent_restarts: u32,
    /// Minimum distinct location clusters in hotel results
    pub hotel_min_clusters: usize,
    /// Finished runs kept for `status` and `wait`; oldest are evicted first
    pub retained_runs: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            search_timeout_ms: 10_000,
            top_n: 5,
            max_resolve_iterations: 16,
            agent_restarts: 1,
            hotel_min_clusters: 2,
            retained_runs: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

/// Group booking negotiation window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NegotiationConfig {
    /// Collection window for traveler responses
    pub window_ms: u64,
    /// Fraction of travelers that must opt in for a pooled booking
    pub quorum: f64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            quorum: 0.8,
        }
    }
}

impl NegotiationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}
