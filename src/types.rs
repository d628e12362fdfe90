//! Core trip types
//!
//! All wire types use camelCase JSON serialization.

use crate::error::{Result, TripError};
use crate::itinerary::Itinerary;
use crate::resolver::Conflict;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inbound planning request from the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripRequest {
    /// Departure airport code
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Destination airport/city code (e.g., "LAS")
    pub destination: String,

    pub dates: DateRange,

    pub travelers: u32,

    pub budget: BudgetRange,

    #[serde(default)]
    pub preferences: Preferences,
}

fn default_origin() -> String {
    "SFO".to_string()
}

impl TripRequest {
    /// Validate and freeze the request into broadcastable constraints
    pub fn into_constraints(self) -> Result<TripConstraints> {
        if self.destination.trim().is_empty() {
            return Err(TripError::InvalidRequest("destination is required".into()));
        }
        if self.travelers == 0 {
            return Err(TripError::InvalidRequest("at least one traveler is required".into()));
        }
        if self.dates.end < self.dates.start {
            return Err(TripError::InvalidRequest(format!(
                "date range ends ({}) before it starts ({})",
                self.dates.end, self.dates.start
            )));
        }
        if self.budget.max <= 0.0 || self.budget.min < 0.0 || self.budget.min > self.budget.max {
            return Err(TripError::InvalidRequest(format!(
                "invalid budget range [{}, {}]",
                self.budget.min, self.budget.max
            )));
        }

        Ok(TripConstraints {
            origin: self.origin.trim().to_uppercase(),
            destination: self.destination.trim().to_uppercase(),
            dates: self.dates,
            travelers: self.travelers,
            budget: self.budget,
            preferences: self.preferences,
        })
    }
}

/// Immutable constraints broadcast to every agent for one planning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripConstraints {
    pub origin: String,
    pub destination: String,
    pub dates: DateRange,
    pub travelers: u32,
    pub budget: BudgetRange,
    pub preferences: Preferences,
}

impl TripConstraints {
    /// Budget ceiling for a cost category
    pub fn category_ceiling(&self, share: f64) -> f64 {
        self.budget.max * share
    }
}

/// Inclusive travel dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// A range covering `days` calendar days starting at `start`
    pub fn starting(start: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start,
            end: start + chrono::Duration::days(span),
        }
    }

    /// Number of calendar days, inclusive
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Number of hotel nights
    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    /// Date and time on the given day
    pub fn at(day: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
        day.and_time(NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or_default())
    }
}

/// Total trip budget for the whole party
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRange {
    pub min: f64,
    pub max: f64,
}

impl BudgetRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Hard ceiling once the contingency tolerance is applied
    pub fn ceiling(&self, contingency: f64) -> f64 {
        self.max * (1.0 + contingency)
    }
}

/// Traveler preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Activity categories of interest (e.g., "shows", "dining", "outdoors")
    #[serde(default)]
    pub activity_types: Vec<String>,

    #[serde(default)]
    pub pace: Pace,

    #[serde(default)]
    pub accommodation: AccommodationTier,

    /// Desired hotel amenities (e.g., "pool", "spa")
    #[serde(default)]
    pub amenities: Vec<String>,
}

/// Daily activity intensity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Pace {
    Relaxed,
    #[default]
    Moderate,
    Packed,
}

/// Hotel class preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccommodationTier {
    Budget,
    #[default]
    Standard,
    Luxury,
}

/// A named place with coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub name: String,
    /// District / cluster the place belongs to
    pub district: String,
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(name: impl Into<String>, district: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            name: name.into(),
            district: district.into(),
            lat,
            lng,
        }
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &Location) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Specialist agent variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentKind {
    Flight,
    Hotel,
    Activity,
    Budget,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::Flight,
        AgentKind::Hotel,
        AgentKind::Activity,
        AgentKind::Budget,
    ];

    /// Agents that search in parallel
    pub const SEARCHERS: [AgentKind; 3] = [AgentKind::Flight, AgentKind::Hotel, AgentKind::Activity];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Flight => "flight",
            AgentKind::Hotel => "hotel",
            AgentKind::Activity => "activity",
            AgentKind::Budget => "budget",
        }
    }

    /// Cost category an agent reports into
    pub fn cost_category(&self) -> Option<CostCategory> {
        match self {
            AgentKind::Flight => Some(CostCategory::Flights),
            AgentKind::Hotel => Some(CostCategory::Lodging),
            AgentKind::Activity => Some(CostCategory::Activities),
            AgentKind::Budget => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status reported through `agent:status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Idle,
    Searching,
    Completed,
    Restarting,
    Failed,
}

/// Budget line items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CostCategory {
    Flights,
    Lodging,
    Activities,
    Misc,
}

/// Severity for alerts and conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Broker queue tier, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Tiers in drain order
    pub const ORDERED: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

/// Delivery semantics selected per logical message type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryGuarantee {
    /// State-changing messages; applied once per correlation id
    ExactlyOnce,
    /// Advisory and status messages; retried until delivered or dead-lettered
    #[default]
    AtLeastOnce,
    /// Time-bound offers; never retried, discarded when late
    AtMostOnce,
}

/// Plaintext message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
}

/// Standard message actions
pub mod actions {
    pub const CONSTRAINTS_BROADCAST: &str = "constraints.broadcast";
    pub const SEARCH_COMPLETED: &str = "search.completed";
    pub const COST_NOTIFY: &str = "cost.notify";
    pub const STATUS_QUERY: &str = "status.query";
    pub const STATUS_REPORT: &str = "status.report";
    pub const ALTERNATIVES_REQUEST: &str = "alternatives.request";
    pub const ALTERNATIVES_OFFER: &str = "alternatives.offer";
    pub const BUDGET_ALERT: &str = "budget.alert";
}

/// Plaintext payload carried inside every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentMessage {
    pub fn new(kind: MessageKind, action: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            action: action.into(),
            data,
        }
    }

    pub fn request(action: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(MessageKind::Request, action, data)
    }

    pub fn response(action: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(MessageKind::Response, action, data)
    }

    pub fn notification(action: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(MessageKind::Notification, action, data)
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error,
            action,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Build a message with a typed payload
    pub fn with_data<T: Serialize>(
        kind: MessageKind,
        action: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        Ok(Self::new(kind, action, serde_json::to_value(data)?))
    }

    /// Decode the payload into a typed value
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(Into::into)
    }

    /// Queue tier and delivery guarantee for this message type
    ///
    /// Cost commits change budget state and are applied exactly once;
    /// alternative offers are time-bound quotes; everything else is
    /// advisory and retried until delivered.
    pub fn delivery(&self) -> (Priority, DeliveryGuarantee) {
        if self.kind == MessageKind::Error {
            return (Priority::Critical, DeliveryGuarantee::AtLeastOnce);
        }
        match self.action.as_str() {
            actions::COST_NOTIFY => (Priority::Medium, DeliveryGuarantee::ExactlyOnce),
            actions::CONSTRAINTS_BROADCAST | actions::BUDGET_ALERT => {
                (Priority::High, DeliveryGuarantee::AtLeastOnce)
            }
            actions::ALTERNATIVES_OFFER => (Priority::Low, DeliveryGuarantee::AtMostOnce),
            _ => (Priority::Medium, DeliveryGuarantee::AtLeastOnce),
        }
    }
}

/// Cost report sent to the budget agent by every searching agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostNotification {
    pub category: CostCategory,
    /// Price of the agent's top-ranked selection
    pub amount: f64,
    /// Prices of the other ranked options, best first
    #[serde(default)]
    pub alternatives: Vec<f64>,
}

/// Outbound events consumed by the transport/UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum TripEvent {
    #[serde(rename = "agent:status")]
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
        progress: f32,
    },

    #[serde(rename = "itinerary:update")]
    ItineraryUpdate {
        trip_id: String,
        delta: serde_json::Value,
    },

    #[serde(rename = "budget:alert")]
    BudgetAlert {
        severity: Severity,
        message: String,
        totals: serde_json::Value,
    },

    #[serde(rename = "conflict:detected")]
    ConflictDetected { conflict: Conflict },

    #[serde(rename = "planning:complete")]
    PlanningComplete { itinerary: Itinerary },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl TripEvent {
    /// Build an `error` event from a trip error
    pub fn from_error(err: &TripError) -> Self {
        TripEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            TripEvent::AgentStatus { .. } => "agent:status",
            TripEvent::ItineraryUpdate { .. } => "itinerary:update",
            TripEvent::BudgetAlert { .. } => "budget:alert",
            TripEvent::ConflictDetected { .. } => "conflict:detected",
            TripEvent::PlanningComplete { .. } => "planning:complete",
            TripEvent::Error { .. } => "error",
        }
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn las_request() -> TripRequest {
        TripRequest {
            origin: "sfo".to_string(),
            destination: " las ".to_string(),
            dates: DateRange::starting(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(), 5),
            travelers: 1,
            budget: BudgetRange::new(2000.0, 3500.0),
            preferences: Preferences::default(),
        }
    }

    #[test]
    fn test_request_into_constraints_normalizes_codes() {
        let constraints = las_request().into_constraints().unwrap();
        assert_eq!(constraints.destination, "LAS");
        assert_eq!(constraints.origin, "SFO");
        assert_eq!(constraints.dates.days(), 5);
        assert_eq!(constraints.dates.nights(), 4);
    }

    #[test]
    fn test_request_validation() {
        let mut req = las_request();
        req.travelers = 0;
        assert!(matches!(req.into_constraints(), Err(TripError::InvalidRequest(_))));

        let mut req = las_request();
        req.budget = BudgetRange::new(4000.0, 3500.0);
        assert!(req.into_constraints().is_err());

        let mut req = las_request();
        req.dates = DateRange {
            start: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
        };
        assert!(req.into_constraints().is_err());
    }

    #[test]
    fn test_request_deserialize_defaults() {
        let json = r#"{
            "destination": "LAS",
            "dates": {"start": "2026-03-10", "end": "2026-03-14"},
            "travelers": 2,
            "budget": {"min": 2000, "max": 3500}
        }"#;
        let req: TripRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.origin, "SFO");
        assert_eq!(req.preferences.pace, Pace::Moderate);
        assert_eq!(req.preferences.accommodation, AccommodationTier::Standard);
    }

    #[test]
    fn test_iter_days() {
        let range = DateRange::starting(NaiveDate::from_ymd_opt(2026, 3, 30).unwrap(), 4);
        let days: Vec<_> = range.iter_days().collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[3], NaiveDate::from_ymd_opt(2026, 4, 2).unwrap());
    }

    #[test]
    fn test_location_distance() {
        let strip = Location::new("Bellagio", "center-strip", 36.1126, -115.1767);
        let downtown = Location::new("Fremont Street", "downtown", 36.1707, -115.1440);
        let d = strip.distance_km(&downtown);
        assert!(d > 6.0 && d < 8.0, "distance was {}", d);
        assert_eq!(strip.distance_km(&strip), 0.0);
    }

    #[test]
    fn test_agent_message_wire_shape() {
        let msg = AgentMessage::notification(actions::COST_NOTIFY, serde_json::json!({"amount": 10}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["action"], "cost.notify");
        assert_eq!(json["data"]["amount"], 10);
    }

    #[test]
    fn test_delivery_policy() {
        let cost = AgentMessage::notification(actions::COST_NOTIFY, serde_json::Value::Null);
        assert_eq!(cost.delivery(), (Priority::Medium, DeliveryGuarantee::ExactlyOnce));

        let offer = AgentMessage::response(actions::ALTERNATIVES_OFFER, serde_json::Value::Null);
        assert_eq!(offer.delivery().1, DeliveryGuarantee::AtMostOnce);

        let status = AgentMessage::response(actions::STATUS_REPORT, serde_json::Value::Null);
        assert_eq!(status.delivery().1, DeliveryGuarantee::AtLeastOnce);

        let failure = AgentMessage::error(actions::COST_NOTIFY, "bad amount");
        assert_eq!(failure.delivery(), (Priority::Critical, DeliveryGuarantee::AtLeastOnce));
    }

    #[test]
    fn test_parse_typed_data() {
        let note = CostNotification {
            category: CostCategory::Flights,
            amount: 420.0,
            alternatives: vec![455.0, 510.0],
        };
        let msg = AgentMessage::with_data(MessageKind::Notification, actions::COST_NOTIFY, &note)
            .unwrap();
        let parsed: CostNotification = msg.parse_data().unwrap();
        assert_eq!(parsed, note);
    }

    #[test]
    fn test_trip_event_wire_names() {
        let event = TripEvent::AgentStatus {
            agent_id: "flight-agent".to_string(),
            status: AgentStatus::Searching,
            progress: 0.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent:status");
        assert_eq!(json["data"]["agentId"], "flight-agent");
        assert_eq!(event.name(), "agent:status");

        let err = TripEvent::from_error(&TripError::Timeout("search".into()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "TIMEOUT");
    }

    #[test]
    fn test_priority_order() {
        let mut tiers = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        tiers.sort();
        assert_eq!(tiers, Priority::ORDERED.to_vec());
        assert_eq!(Priority::Low.index(), 3);
    }
}
