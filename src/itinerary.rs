//! Costed, chronologically ordered trip timeline
//!
//! Items are only reachable through methods that keep the timeline sorted
//! and the running total equal to the sum of item prices.

use crate::agents::budget::BudgetReport;
use crate::negotiation::BookingMode;
use crate::resolver::Conflict;
use crate::types::{AgentKind, Location};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Timeline entry category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Flight,
    Lodging,
    Activity,
}

impl ItemKind {
    /// Lodging spans the whole stay and never blocks other items
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ItemKind::Lodging)
    }

    /// Default scheduling priority; higher items anchor conflicts
    pub fn default_priority(&self) -> u8 {
        match self {
            ItemKind::Flight => 3,
            ItemKind::Lodging => 2,
            ItemKind::Activity => 1,
        }
    }
}

/// One selected flight, stay, or activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryItem {
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub location: Location,
    pub price: f64,
    pub priority: u8,
    /// Insertion order, assigned by the itinerary
    #[serde(default)]
    pub sequence: u64,
}

impl ItineraryItem {
    pub fn new(
        id: impl Into<String>,
        kind: ItemKind,
        title: impl Into<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        location: Location,
        price: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            start,
            end,
            location,
            price,
            priority: kind.default_priority(),
            sequence: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &ItineraryItem) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Ordered, costed plan for one trip
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Itinerary {
    pub trip_id: String,
    items: Vec<ItineraryItem>,
    total_cost: f64,
    next_sequence: u64,
    /// Categories omitted after an unrecoverable agent failure
    #[serde(default)]
    pub degraded: Vec<AgentKind>,
    /// Every conflict found during planning, with its final status
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_mode: Option<BookingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetReport>,
}

impl Itinerary {
    pub fn new(trip_id: impl Into<String>) -> Self {
        Self {
            trip_id: trip_id.into(),
            ..Default::default()
        }
    }

    /// Add an item, returning its id
    pub fn add_item(&mut self, mut item: ItineraryItem) -> String {
        item.sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = item.id.clone();
        self.items.push(item);
        self.normalize();
        id
    }

    pub fn remove_item(&mut self, id: &str) -> Option<ItineraryItem> {
        let index = self.items.iter().position(|i| i.id == id)?;
        let removed = self.items.remove(index);
        self.normalize();
        Some(removed)
    }

    /// Move an item to a new start time, keeping its duration
    pub fn reschedule(&mut self, id: &str, start: NaiveDateTime) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        let duration = item.duration();
        item.start = start;
        item.end = start + duration;
        self.normalize();
        true
    }

    pub fn reprice(&mut self, id: &str, price: f64) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        item.price = price;
        self.normalize();
        true
    }

    pub fn items(&self) -> &[ItineraryItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&ItineraryItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Items that occupy the party's time, in chronological order
    pub fn blocking_items(&self) -> impl Iterator<Item = &ItineraryItem> {
        self.items.iter().filter(|i| i.kind.is_blocking())
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn normalize(&mut self) {
        self.items
            .sort_by(|a, b| a.start.cmp(&b.start).then(a.sequence.cmp(&b.sequence)));
        self.total_cost = self.items.iter().map(|i| i.price).sum();
    }
}
