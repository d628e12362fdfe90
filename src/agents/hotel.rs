//! Hotel search
//!
//! Hotels are grouped by district. A district's location score is how close
//! its center is to the activities the party cares about; the final pick
//! spans several districts so the plan is not tied to one neighborhood.

use super::{common_reply, publish_results, LastResults, SearchResults, SpecialistAgent};
use crate::catalog::{ActivityListing, Destination, District};
use crate::context::RunContext;
use crate::error::Result;
use crate::session::{AgentChannel, Inbound};
use crate::types::{actions, AccommodationTier, AgentKind, AgentMessage, CostCategory, Location, TripConstraints};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

const RATING_WEIGHT: f64 = 0.35;
const PRICE_WEIGHT: f64 = 0.30;
const LOCATION_WEIGHT: f64 = 0.20;
const AMENITY_WEIGHT: f64 = 0.15;

/// Travelers sharing one room
const ROOM_OCCUPANCY: u32 = 2;

/// A costed stay for the whole party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotelOption {
    pub id: String,
    pub name: String,
    /// District the hotel belongs to
    pub cluster: String,
    pub location: Location,
    pub tier: AccommodationTier,
    pub rating: f64,
    pub nightly_rate: f64,
    pub nights: i64,
    pub rooms: u32,
    /// Total for every room and night
    pub price: f64,
    pub amenities: Vec<String>,
    pub score: f64,
}

#[derive(Default)]
pub struct HotelAgent {
    last: LastResults,
}

impl HotelAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranked stays within `ceiling`, spread over at least `min_clusters`
    /// districts when the inventory allows it
    pub fn rank(
        destination: &Destination,
        constraints: &TripConstraints,
        ceiling: f64,
        top_n: usize,
        min_clusters: usize,
    ) -> Vec<HotelOption> {
        let nights = constraints.dates.nights();
        let rooms = constraints.travelers.div_ceil(ROOM_OCCUPANCY);
        let location_scores = location_scores(destination, &constraints.preferences.activity_types);

        let mut options: Vec<HotelOption> = destination
            .hotels
            .iter()
            .map(|h| HotelOption {
                id: h.id.clone(),
                name: h.name.clone(),
                cluster: h.location.district.clone(),
                location: h.location.clone(),
                tier: h.tier,
                rating: h.rating,
                nightly_rate: h.nightly_rate,
                nights,
                rooms,
                price: h.nightly_rate * nights as f64 * f64::from(rooms),
                amenities: h.amenities.clone(),
                score: 0.0,
            })
            .filter(|o| o.price <= ceiling)
            .collect();

        let (lo, hi) = options
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), o| (lo.min(o.price), hi.max(o.price)));
        for option in options.iter_mut() {
            let price_fit = if hi > lo { 1.0 - (option.price - lo) / (hi - lo) } else { 1.0 };
            let location = location_scores.get(&option.cluster).copied().unwrap_or(0.0);
            let amenities = amenity_match(&option.amenities, &constraints.preferences.amenities);

            option.score = (RATING_WEIGHT * option.rating / 5.0
                + PRICE_WEIGHT * price_fit
                + LOCATION_WEIGHT * location
                + AMENITY_WEIGHT * amenities)
                * tier_factor(option.tier, constraints.preferences.accommodation);
        }

        options.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        diversify(options, top_n, min_clusters)
    }
}

#[async_trait]
impl SpecialistAgent for HotelAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Hotel
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let constraints = &ctx.constraints;
        let destination = ctx.catalog.destination(&constraints.destination)?;
        let ceiling = constraints.category_ceiling(ctx.config.budget.allocation(CostCategory::Lodging));

        let options = Self::rank(
            &destination,
            constraints,
            ceiling,
            ctx.config.coordinator.top_n,
            ctx.config.coordinator.hotel_min_clusters,
        );
        let clusters: BTreeSet<&str> = options.iter().map(|o| o.cluster.as_str()).collect();
        tracing::info!(
            agent = %channel.agent_id(),
            city = %destination.city,
            options = options.len(),
            clusters = clusters.len(),
            ceiling,
            "Hotel search complete"
        );

        let results = SearchResults::Hotels(options);
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

/// 1.0 for the requested tier, less the further away a hotel's tier is
fn tier_factor(tier: AccommodationTier, wanted: AccommodationTier) -> f64 {
    match (tier as i32 - wanted as i32).abs() {
        0 => 1.0,
        1 => 0.75,
        _ => 0.5,
    }
}

/// Share of the requested amenities a hotel offers
fn amenity_match(offered: &[String], wanted: &[String]) -> f64 {
    if wanted.is_empty() {
        return 1.0;
    }
    let hits = wanted
        .iter()
        .filter(|w| offered.iter().any(|o| o.eq_ignore_ascii_case(w)))
        .count();
    hits as f64 / wanted.len() as f64
}

/// Per-district closeness to the activities of interest, in `[0, 1]`
fn location_scores(destination: &Destination, interests: &[String]) -> HashMap<String, f64> {
    let relevant: Vec<&ActivityListing> = destination
        .activities
        .iter()
        .filter(|a| interests.iter().any(|i| i.eq_ignore_ascii_case(&a.category)))
        .collect();
    let relevant = if relevant.is_empty() {
        destination.activities.iter().collect()
    } else {
        relevant
    };

    let clusters: Vec<&District> = destination
        .districts
        .iter()
        .filter(|d| destination.hotels.iter().any(|h| h.location.district == d.name))
        .collect();
    let mean_distance = |district: &District| {
        if relevant.is_empty() {
            return 0.0;
        }
        relevant
            .iter()
            .map(|a| district.center.distance_km(&a.location))
            .sum::<f64>()
            / relevant.len() as f64
    };
    let distances: Vec<(String, f64)> = clusters
        .iter()
        .map(|d| (d.name.clone(), mean_distance(d)))
        .collect();

    let (lo, hi) = distances
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, d)| (lo.min(*d), hi.max(*d)));
    distances
        .into_iter()
        .map(|(name, d)| {
            let score = if hi > lo { 1.0 - (d - lo) / (hi - lo) } else { 1.0 };
            (name, score)
        })
        .collect()
}

/// Take the best `top_n`, swapping in the best option of unrepresented
/// districts until `min_clusters` are covered
fn diversify(ranked: Vec<HotelOption>, top_n: usize, min_clusters: usize) -> Vec<HotelOption> {
    let (mut picked, mut rest): (Vec<HotelOption>, Vec<HotelOption>) = {
        let mut iter = ranked.into_iter();
        let picked: Vec<_> = iter.by_ref().take(top_n).collect();
        (picked, iter.collect())
    };

    loop {
        let covered: BTreeSet<String> = picked.iter().map(|o| o.cluster.clone()).collect();
        if covered.len() >= min_clusters {
            break;
        }
        let Some(candidate) = rest.iter().position(|o| !covered.contains(&o.cluster)) else {
            break;
        };
        // Lowest-ranked pick whose district is represented twice
        let Some(victim) = picked
            .iter()
            .rposition(|o| picked.iter().filter(|p| p.cluster == o.cluster).count() > 1)
        else {
            break;
        };
        let incoming = rest.remove(candidate);
        let outgoing = std::mem::replace(&mut picked[victim], incoming);
        rest.push(outgoing);
    }

    picked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    picked
}
