//! Activity selection and day scheduling
//!
//! Candidates matching the party's interests are ranked, then packed day by
//! day: a candidate joins a day only if the whole day can still be laid out
//! inside opening hours, with buffers and travel between stops, under the
//! pace cap and the activity allocation.

use super::{common_reply, publish_results, LastResults, SearchResults, SpecialistAgent};
use crate::catalog::ActivityListing;
use crate::config::ScheduleConfig;
use crate::context::RunContext;
use crate::error::Result;
use crate::resolver::{DistanceEstimator, TravelTimeEstimator};
use crate::session::{AgentChannel, Inbound};
use crate::types::{actions, AgentKind, AgentMessage, CostCategory, DateRange, Location, TripConstraints};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An activity placed at a concrete time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledActivity {
    pub id: String,
    pub name: String,
    pub category: String,
    pub location: Location,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Price for the whole party
    pub price: f64,
    pub rating: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub activities: Vec<ScheduledActivity>,
}

/// Activities for the whole trip
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySchedule {
    pub days: Vec<DaySchedule>,
    pub total_cost: f64,
    /// Matching candidates that did not fit anywhere
    pub unscheduled: Vec<String>,
}

impl ActivitySchedule {
    pub fn activities(&self) -> impl Iterator<Item = &ScheduledActivity> {
        self.days.iter().flat_map(|d| d.activities.iter())
    }

    pub fn len(&self) -> usize {
        self.days.iter().map(|d| d.activities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Totals after dropping the 1..=k most expensive activities
    pub fn trimmed_totals(&self, k: usize) -> Vec<f64> {
        let mut prices: Vec<f64> = self.activities().map(|a| a.price).collect();
        prices.sort_by(|a, b| b.total_cmp(a));
        let mut total = self.total_cost;
        prices
            .into_iter()
            .take(k)
            .map(|p| {
                total -= p;
                total.max(0.0)
            })
            .collect()
    }
}

#[derive(Default)]
pub struct ActivityAgent {
    last: LastResults,
}

impl ActivityAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the trip's schedule from `listings`
    pub fn plan(
        listings: &[ActivityListing],
        constraints: &TripConstraints,
        schedule: &ScheduleConfig,
        ceiling: f64,
        travel: &dyn TravelTimeEstimator,
    ) -> ActivitySchedule {
        let travelers = f64::from(constraints.travelers);
        let ranked = rank(listings, &constraints.preferences.activity_types);
        let cap = schedule.daily_cap(constraints.preferences.pace);

        let mut used: HashSet<&str> = HashSet::new();
        let mut total = 0.0;
        let mut days = Vec::new();
        let last_day = constraints.dates.end;

        for date in constraints.dates.iter_days() {
            let window = DayWindow::for_day(date, constraints.dates.start, last_day, schedule);
            let mut chosen: Vec<&ActivityListing> = Vec::new();
            let mut placed = Vec::new();

            for &candidate in &ranked {
                if chosen.len() >= cap {
                    break;
                }
                let price = candidate.price * travelers;
                if used.contains(candidate.id.as_str()) || total + price > ceiling {
                    continue;
                }
                chosen.push(candidate);
                match window.place(&chosen, schedule.buffer(), travel, travelers) {
                    Some(layout) => {
                        placed = layout;
                        used.insert(candidate.id.as_str());
                        total += price;
                    }
                    None => {
                        chosen.pop();
                    }
                }
            }

            days.push(DaySchedule {
                date,
                activities: placed,
            });
        }

        let unscheduled = ranked
            .iter()
            .filter(|a| !used.contains(a.id.as_str()))
            .map(|a| a.id.clone())
            .collect();

        ActivitySchedule {
            days,
            total_cost: (total * 100.0).round() / 100.0,
            unscheduled,
        }
    }
}

#[async_trait]
impl SpecialistAgent for ActivityAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Activity
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let constraints = &ctx.constraints;
        let destination = ctx.catalog.destination(&constraints.destination)?;
        let ceiling = constraints.category_ceiling(ctx.config.budget.allocation(CostCategory::Activities));
        let travel = DistanceEstimator {
            speed_kmh: ctx.config.schedule.travel_speed_kmh,
        };

        let schedule = Self::plan(
            &destination.activities,
            constraints,
            &ctx.config.schedule,
            ceiling,
            &travel,
        );
        tracing::info!(
            agent = %channel.agent_id(),
            city = %destination.city,
            scheduled = schedule.len(),
            unscheduled = schedule.unscheduled.len(),
            total = schedule.total_cost,
            "Activity schedule built"
        );

        let results = SearchResults::Activities(schedule);
        publish_results(ctx, channel, &results)?;
        self.last.store(&results);
        Ok(results)
    }

    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        _inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        if let Some(reply) = common_reply(ctx, channel, self.last.status(), &message) {
            return Ok(Some(reply));
        }
        match message.action.as_str() {
            actions::ALTERNATIVES_REQUEST => Ok(Some(self.last.offer())),
            _ => Ok(None),
        }
    }
}

/// Listings matching the interests, best rated first, then cheapest
///
/// Falls back to every listing when nothing matches.
fn rank<'a>(listings: &'a [ActivityListing], interests: &[String]) -> Vec<&'a ActivityListing> {
    let wanted = |a: &ActivityListing| interests.iter().any(|i| i.eq_ignore_ascii_case(&a.category));
    let mut ranked: Vec<&ActivityListing> = listings.iter().filter(|&a| wanted(a)).collect();
    if ranked.is_empty() {
        ranked = listings.iter().collect();
    }
    ranked.sort_by(|a, b| {
        b.rating
            .total_cmp(&a.rating)
            .then(a.price.total_cmp(&b.price))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Usable hours of one trip day
struct DayWindow {
    date: NaiveDate,
    start_hour: u32,
    cutoff_hour: u32,
}

impl DayWindow {
    fn for_day(date: NaiveDate, first: NaiveDate, last: NaiveDate, schedule: &ScheduleConfig) -> Self {
        let mut start_hour = schedule.day_start_hour;
        let mut cutoff_hour = schedule.daily_cutoff_hour;
        if date == first {
            start_hour = start_hour.max(schedule.arrival_day_start_hour);
        }
        if date == last {
            cutoff_hour = cutoff_hour.min(schedule.departure_day_cutoff_hour);
        }
        Self {
            date,
            start_hour,
            cutoff_hour,
        }
    }

    /// Lay out `set` in opening order, or `None` if it cannot fit
    fn place(
        &self,
        set: &[&ActivityListing],
        buffer: Duration,
        travel: &dyn TravelTimeEstimator,
        travelers: f64,
    ) -> Option<Vec<ScheduledActivity>> {
        let mut ordered = set.to_vec();
        ordered.sort_by(|a, b| a.opens_hour.cmp(&b.opens_hour).then_with(|| a.id.cmp(&b.id)));

        let cutoff = hour_mark(self.date, self.cutoff_hour);
        let mut cursor = hour_mark(self.date, self.start_hour);
        let mut previous: Option<&ActivityListing> = None;
        let mut placed = Vec::with_capacity(ordered.len());

        for listing in ordered {
            let ready = match previous {
                Some(prev) => cursor + buffer + travel.estimate(&prev.location, &listing.location),
                None => cursor,
            };
            let start = ready.max(hour_mark(self.date, listing.opens_hour));
            let end = start + Duration::minutes(listing.duration_minutes);
            if end > hour_mark(self.date, listing.closes_hour).min(cutoff) {
                return None;
            }

            placed.push(ScheduledActivity {
                id: listing.id.clone(),
                name: listing.name.clone(),
                category: listing.category.clone(),
                location: listing.location.clone(),
                start,
                end,
                price: listing.price * travelers,
                rating: listing.rating,
            });
            cursor = end;
            previous = Some(listing);
        }
        Some(placed)
    }
}

/// `hour` o'clock on `date`; 24 is midnight at the end of the day
fn hour_mark(date: NaiveDate, hour: u32) -> NaiveDateTime {
    DateRange::at(date, 0, 0) + Duration::hours(i64::from(hour.min(24)))
}
