//! Conflict detection and repair for aggregated itineraries
//!
//! Detection walks the blocking timeline chronologically. Time and location
//! conflicts are repaired structurally by moving the lower-ranked item;
//! budget conflicts are handed back to the caller for the budget agent's
//! suggestions.

use crate::itinerary::{Itinerary, ItineraryItem};
use crate::types::{BudgetRange, Location, Severity};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Conflict category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    Time,
    Location,
    Budget,
}

/// Where a conflict ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStatus {
    Open,
    Resolved,
    /// Handed to the budget agent's suggestion list
    Delegated,
    ManualReview,
}

/// A detected inconsistency in an itinerary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConflictType,
    pub severity: Severity,
    pub affected: Vec<String>,
    pub suggested_resolution: String,
    pub status: ConflictStatus,
}

impl Conflict {
    fn new(
        id: String,
        kind: ConflictType,
        severity: Severity,
        affected: Vec<String>,
        suggested_resolution: String,
    ) -> Self {
        Self {
            id,
            kind,
            severity,
            affected,
            suggested_resolution,
            status: ConflictStatus::Open,
        }
    }

    pub fn is_structural(&self) -> bool {
        !matches!(self.kind, ConflictType::Budget)
    }
}

/// Estimates ground travel time between two places
pub trait TravelTimeEstimator: Send + Sync {
    fn estimate(&self, from: &Location, to: &Location) -> Duration;
}

/// Distance-based estimate at a constant average speed
#[derive(Debug, Clone)]
pub struct DistanceEstimator {
    pub speed_kmh: f64,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self { speed_kmh: 25.0 }
    }
}

impl TravelTimeEstimator for DistanceEstimator {
    fn estimate(&self, from: &Location, to: &Location) -> Duration {
        if from.name == to.name || self.speed_kmh <= 0.0 {
            return Duration::zero();
        }
        let minutes = (from.distance_km(to) / self.speed_kmh * 60.0).ceil();
        Duration::minutes(minutes as i64)
    }
}

/// Same travel time between any two distinct places
#[derive(Debug, Clone)]
pub struct FixedTravelTime(pub Duration);

impl TravelTimeEstimator for FixedTravelTime {
    fn estimate(&self, from: &Location, to: &Location) -> Duration {
        if from.name == to.name {
            Duration::zero()
        } else {
            self.0
        }
    }
}

/// Outcome of repeated detect/resolve rounds
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    pub rounds: usize,
    /// Structural conflicts that were repaired
    pub resolved: Vec<Conflict>,
    /// Budget conflicts for the budget agent
    pub delegated: Vec<Conflict>,
    /// Structural conflicts still present when the round limit was hit
    pub unresolved: Vec<Conflict>,
}

impl ResolutionReport {
    pub fn all(&self) -> impl Iterator<Item = &Conflict> {
        self.resolved
            .iter()
            .chain(self.delegated.iter())
            .chain(self.unresolved.iter())
    }
}

/// Detects and repairs time, location, and budget conflicts
pub struct ConflictResolver {
    buffer: Duration,
    contingency: f64,
    estimator: Arc<dyn TravelTimeEstimator>,
}

impl ConflictResolver {
    pub fn new(buffer: Duration, contingency: f64, estimator: Arc<dyn TravelTimeEstimator>) -> Self {
        Self {
            buffer,
            contingency,
            estimator,
        }
    }

    /// Find every conflict in the itinerary
    pub fn detect(&self, itinerary: &Itinerary, budget: Option<&BudgetRange>) -> Vec<Conflict> {
        let timeline: Vec<&ItineraryItem> = itinerary.blocking_items().collect();
        let mut conflicts = Vec::new();

        for (i, item) in timeline.iter().enumerate() {
            let overlapping = timeline[i + 1..]
                .iter()
                .take_while(|l| l.start < item.end)
                .filter(|l| item.overlaps(l));
            for later in overlapping {
                let (anchor, moved) = rank(item, later);
                conflicts.push(Conflict::new(
                    format!("time:{}:{}", item.id, later.id),
                    ConflictType::Time,
                    if item.priority >= 3 || later.priority >= 3 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    vec![item.id.clone(), later.id.clone()],
                    format!(
                        "Move '{}' to start after '{}' ends plus {} min buffer",
                        moved.title,
                        anchor.title,
                        self.buffer.num_minutes()
                    ),
                ));
            }
        }

        for pair in timeline.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if prev.overlaps(next) {
                continue;
            }
            let needed = self.estimator.estimate(&prev.location, &next.location);
            let gap = next.start - prev.end;
            if gap < needed {
                conflicts.push(Conflict::new(
                    format!("location:{}:{}", prev.id, next.id),
                    ConflictType::Location,
                    Severity::Medium,
                    vec![prev.id.clone(), next.id.clone()],
                    format!(
                        "Extend buffer between '{}' and '{}' from {} to {} min",
                        prev.title,
                        next.title,
                        gap.num_minutes(),
                        needed.num_minutes()
                    ),
                ));
            }
        }

        if let Some(budget) = budget {
            let ceiling = budget.ceiling(self.contingency);
            let total = itinerary.total_cost();
            if total > ceiling {
                let mut priciest: Vec<&ItineraryItem> = itinerary.items().iter().collect();
                priciest.sort_by(|a, b| b.price.total_cmp(&a.price));
                let overage = total - ceiling;
                conflicts.push(Conflict::new(
                    format!("budget:{}", itinerary.trip_id),
                    ConflictType::Budget,
                    if overage > budget.max * 0.2 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    priciest.iter().take(3).map(|i| i.id.clone()).collect(),
                    format!(
                        "Reduce spend by {:.2} to meet the {:.2} ceiling",
                        overage, ceiling
                    ),
                ));
            }
        }

        conflicts
    }

    /// Apply one round of structural repairs
    ///
    /// Returns the conflicts that were repaired; budget conflicts and
    /// conflicts that no longer apply are skipped.
    pub fn resolve(&self, itinerary: &mut Itinerary, conflicts: &[Conflict]) -> Vec<Conflict> {
        let mut repaired = Vec::new();

        for conflict in conflicts {
            let [first, second] = match conflict.affected.as_slice() {
                [a, b] => [a.clone(), b.clone()],
                _ => continue,
            };
            let (Some(a), Some(b)) = (itinerary.get(&first), itinerary.get(&second)) else {
                continue;
            };

            let fix = match conflict.kind {
                ConflictType::Time => {
                    if !a.overlaps(b) {
                        continue;
                    }
                    let (anchor, moved) = rank(a, b);
                    let travel = self.estimator.estimate(&anchor.location, &moved.location);
                    Some((moved.id.clone(), anchor.end + self.buffer.max(travel)))
                }
                ConflictType::Location => {
                    let (prev, next) = if a.start <= b.start { (a, b) } else { (b, a) };
                    let needed = self.estimator.estimate(&prev.location, &next.location);
                    if next.start - prev.end >= needed || prev.overlaps(next) {
                        continue;
                    }
                    if next.priority > prev.priority {
                        Some((prev.id.clone(), next.start - needed - prev.duration()))
                    } else {
                        Some((next.id.clone(), prev.end + needed))
                    }
                }
                ConflictType::Budget => None,
            };

            if let Some((id, start)) = fix {
                tracing::debug!(conflict = %conflict.id, item = %id, start = %start, "Rescheduling item");
                itinerary.reschedule(&id, start);
                let mut done = conflict.clone();
                done.status = ConflictStatus::Resolved;
                repaired.push(done);
            }
        }

        repaired
    }

    /// Detect and resolve until no structural conflict remains
    pub fn resolve_all(
        &self,
        itinerary: &mut Itinerary,
        budget: Option<&BudgetRange>,
        max_rounds: usize,
    ) -> ResolutionReport {
        let mut report = ResolutionReport::default();

        loop {
            let conflicts = self.detect(itinerary, budget);
            let (structural, budget_conflicts): (Vec<_>, Vec<_>) =
                conflicts.into_iter().partition(Conflict::is_structural);
            report.delegated = budget_conflicts
                .into_iter()
                .map(|mut c| {
                    c.status = ConflictStatus::Delegated;
                    c
                })
                .collect();

            if structural.is_empty() {
                break;
            }
            if report.rounds >= max_rounds {
                report.unresolved = structural
                    .into_iter()
                    .map(|mut c| {
                        c.status = ConflictStatus::ManualReview;
                        c
                    })
                    .collect();
                tracing::warn!(
                    trip = %itinerary.trip_id,
                    remaining = report.unresolved.len(),
                    "Conflicts left for manual review"
                );
                break;
            }

            report.rounds += 1;
            let repaired = self.resolve(itinerary, &structural);
            if repaired.is_empty() {
                report.rounds = max_rounds;
                continue;
            }
            for conflict in repaired {
                if !report.resolved.iter().any(|c| c.id == conflict.id) {
                    report.resolved.push(conflict);
                }
            }
        }

        report
    }
}

/// Order two items into (anchor, moved): higher priority anchors,
/// ties go to the earlier-added item
fn rank<'a>(a: &'a ItineraryItem, b: &'a ItineraryItem) -> (&'a ItineraryItem, &'a ItineraryItem) {
    if a.priority > b.priority || (a.priority == b.priority && a.sequence <= b.sequence) {
        (a, b)
    } else {
        (b, a)
    }
}
