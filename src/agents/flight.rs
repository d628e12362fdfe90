//! Flight search and ranking
//!
//! Candidates are every carrier crossed with every route shape (direct,
//! one hub, two hubs) and departure slot. Round trips whose party fare fits
//! the flight allocation are scored with min-max normalized factors.

use super::{common_reply, publish_results, LastResults, SearchResults, SpecialistAgent};
use crate::catalog::Catalog;
use crate::config::ScoringWeights;
use crate::context::RunContext;
use crate::error::Result;
use crate::session::{AgentChannel, Inbound};
use crate::types::{actions, AgentKind, AgentMessage, CostCategory, DateRange, Location, TripConstraints};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Departure slots: (hour, minute, fare multiplier)
const SLOTS: [(u32, u32, f64); 4] = [(6, 0, 0.88), (9, 30, 1.0), (13, 15, 0.96), (17, 45, 1.08)];

const CRUISE_KMH: f64 = 800.0;
const TAXI_MINUTES: i64 = 40;
const LAYOVER_MINUTES: i64 = 75;
const BASE_FARE: f64 = 49.0;
const FARE_PER_KM: f64 = 0.11;
const STOP_DISCOUNT: f64 = 0.82;
/// Departure hour that scores best on the time-of-day factor
const PREFERRED_HOUR: f64 = 10.0;

/// One direction of a round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightLeg {
    pub from: String,
    pub to: String,
    /// Connection airports, in order
    pub via: Vec<String>,
    pub depart: NaiveDateTime,
    pub arrive: NaiveDateTime,
}

impl FlightLeg {
    pub fn stops(&self) -> usize {
        self.via.len()
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.arrive - self.depart).num_minutes()
    }
}

/// A ranked round-trip option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightOption {
    pub id: String,
    pub carrier: String,
    pub carrier_name: String,
    pub outbound: FlightLeg,
    pub inbound: FlightLeg,
    /// Fare for the whole party
    pub price: f64,
    pub stops: usize,
    pub duration_minutes: i64,
    pub score: f64,
}

#[derive(Default)]
pub struct FlightAgent {
    last: LastResults,
}

impl FlightAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranked options within the flight allocation
    pub fn rank(
        catalog: &Catalog,
        constraints: &TripConstraints,
        weights: &ScoringWeights,
        ceiling: f64,
        top_n: usize,
    ) -> Vec<FlightOption> {
        let mut options: Vec<FlightOption> = candidates(catalog, constraints)
            .into_iter()
            .filter(|o| o.price <= ceiling)
            .collect();
        score(&mut options, weights);

        options.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.price.total_cmp(&b.price))
                .then_with(|| a.id.cmp(&b.id))
        });
        options.truncate(top_n);
        options
    }
}

#[async_trait]
impl SpecialistAgent for FlightAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Flight
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let constraints = &ctx.constraints;
        let ceiling = constraints.category_ceiling(ctx.config.budget.allocation(CostCategory::Flights));

        let options = Self::rank(
            &ctx.catalog,
            constraints,
            &ctx.config.scoring,
            ceiling,
            ctx.config.coordinator.top_n,
        );
        tracing::info!(
            agent = %channel.agent_id(),
            route = %format!("{}-{}", constraints.origin, constraints.destination),
            options = options.len(),
            ceiling,
            "Flight search complete"
        );

        let results = SearchResults::Flights(options);
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
            other => {
                tracing::debug!(agent = %channel.agent_id(), action = other, "Ignoring message");
                Ok(None)
            }
        }
    }
}

fn candidates(catalog: &Catalog, constraints: &TripConstraints) -> Vec<FlightOption> {
    let origin = constraints.origin.as_str();
    let destination = constraints.destination.as_str();
    if origin == destination {
        tracing::warn!(airport = origin, "Origin and destination are the same airport");
        return Vec::new();
    }

    let hubs = catalog.hubs_between(origin, destination);
    let mut routes: Vec<Vec<String>> = vec![Vec::new()];
    routes.extend(hubs.iter().map(|h| vec![h.clone()]));
    routes.extend(hubs.windows(2).take(2).map(|pair| pair.to_vec()));

    let travelers = f64::from(constraints.travelers);
    let mut options = Vec::new();

    for carrier in catalog.carriers() {
        for (r, route) in routes.iter().enumerate() {
            let back: Vec<String> = route.iter().rev().cloned().collect();
            for (s, slot) in SLOTS.iter().enumerate() {
                let return_slot = SLOTS[(s + 2) % SLOTS.len()];
                let (outbound, out_km) =
                    leg(catalog, origin, destination, route, constraints.dates.start, *slot);
                let (inbound, in_km) =
                    leg(catalog, destination, origin, &back, constraints.dates.end, return_slot);

                let per_person = (fare(out_km, outbound.stops()) * slot.2
                    + fare(in_km, inbound.stops()) * return_slot.2)
                    * carrier.fare_factor;

                options.push(FlightOption {
                    id: format!("{}-{}{}-r{}s{}", carrier.code, origin, destination, r, s),
                    carrier: carrier.code.to_string(),
                    carrier_name: carrier.name.to_string(),
                    stops: outbound.stops() + inbound.stops(),
                    duration_minutes: outbound.duration_minutes() + inbound.duration_minutes(),
                    price: round2(per_person * travelers),
                    outbound,
                    inbound,
                    score: 0.0,
                });
            }
        }
    }
    options
}

fn leg(
    catalog: &Catalog,
    from: &str,
    to: &str,
    via: &[String],
    date: NaiveDate,
    slot: (u32, u32, f64),
) -> (FlightLeg, f64) {
    let mut path: Vec<Location> = vec![catalog.airport(from)];
    path.extend(via.iter().map(|code| catalog.airport(code)));
    path.push(catalog.airport(to));

    let segments = path.len() as i64 - 1;
    let km: f64 = path.windows(2).map(|p| p[0].distance_km(&p[1])).sum();
    let minutes =
        (km / CRUISE_KMH * 60.0).round() as i64 + TAXI_MINUTES * segments + LAYOVER_MINUTES * (segments - 1);

    let depart = DateRange::at(date, slot.0, slot.1);
    (
        FlightLeg {
            from: from.to_string(),
            to: to.to_string(),
            via: via.to_vec(),
            depart,
            arrive: depart + Duration::minutes(minutes),
        },
        km,
    )
}

fn fare(km: f64, stops: usize) -> f64 {
    (BASE_FARE + FARE_PER_KM * km) * STOP_DISCOUNT.powi(stops as i32)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Position of `value` within `[min, max]`, 0 when the range is empty
fn normalized(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (value - min) / (max - min)
    } else {
        0.0
    }
}

fn score(options: &mut [FlightOption], weights: &ScoringWeights) {
    let bounds = |f: fn(&FlightOption) -> f64| {
        options.iter().map(f).fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
    };
    let (price_lo, price_hi) = bounds(|o| o.price);
    let (dur_lo, dur_hi) = bounds(|o| o.duration_minutes as f64);
    let (stops_lo, stops_hi) = bounds(|o| o.stops as f64);

    for option in options.iter_mut() {
        let depart = option.outbound.depart.time();
        let hour = f64::from(depart.hour()) + f64::from(depart.minute()) / 60.0;
        let time_fit = 1.0 - ((hour - PREFERRED_HOUR).abs() / 12.0).min(1.0);

        option.score = weights.price * (1.0 - normalized(option.price, price_lo, price_hi))
            + weights.duration * (1.0 - normalized(option.duration_minutes as f64, dur_lo, dur_hi))
            + weights.stops * (1.0 - normalized(option.stops as f64, stops_lo, stops_hi))
            + weights.departure_time * time_fit;
    }
}
