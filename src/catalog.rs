//! Built-in destination inventory
//!
//! Agents search this catalog instead of live supplier APIs. Known
//! destinations carry curated listings; any other airport code gets a
//! deterministic synthetic inventory so searches are reproducible.

use crate::error::{Result, TripError};
use crate::types::{AccommodationTier, Location};
use std::collections::HashMap;

/// A neighbourhood used as a hotel location cluster
#[derive(Debug, Clone)]
pub struct District {
    pub name: String,
    pub center: Location,
}

#[derive(Debug, Clone)]
pub struct HotelListing {
    pub id: String,
    pub name: String,
    pub location: Location,
    pub tier: AccommodationTier,
    /// Guest rating out of 5
    pub rating: f64,
    /// Nightly rate per room
    pub nightly_rate: f64,
    pub amenities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ActivityListing {
    pub id: String,
    pub name: String,
    pub category: String,
    pub location: Location,
    pub duration_minutes: i64,
    /// Price per person
    pub price: f64,
    pub rating: f64,
    pub opens_hour: u32,
    pub closes_hour: u32,
}

#[derive(Debug, Clone)]
pub struct Carrier {
    pub code: &'static str,
    pub name: &'static str,
    pub fare_factor: f64,
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub code: String,
    pub city: String,
    pub airport: Location,
    pub districts: Vec<District>,
    pub hotels: Vec<HotelListing>,
    pub activities: Vec<ActivityListing>,
}

impl Destination {
    pub fn district(&self, name: &str) -> Option<&District> {
        self.districts.iter().find(|d| d.name == name)
    }
}

/// Airport, carrier, and destination inventory
#[derive(Debug, Clone)]
pub struct Catalog {
    airports: HashMap<String, Location>,
    destinations: HashMap<String, Destination>,
    carriers: Vec<Carrier>,
    hubs: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    pub fn builtin() -> Self {
        let airports = [
            ("SFO", 37.6213, -122.3790),
            ("LAX", 33.9416, -118.4085),
            ("SEA", 47.4502, -122.3088),
            ("DEN", 39.8561, -104.6737),
            ("PHX", 33.4352, -112.0101),
            ("SLC", 40.7899, -111.9791),
            ("ORD", 41.9742, -87.9073),
            ("JFK", 40.6413, -73.7781),
            ("BOS", 42.3656, -71.0096),
            ("ATL", 33.6407, -84.4277),
            ("MCO", 28.4312, -81.3081),
            ("LAS", 36.0840, -115.1537),
        ]
        .into_iter()
        .map(|(code, lat, lng)| {
            (
                code.to_string(),
                Location::new(format!("{} Airport", code), "airport", lat, lng),
            )
        })
        .collect();

        let carriers = vec![
            Carrier { code: "UA", name: "United", fare_factor: 1.0 },
            Carrier { code: "AA", name: "American", fare_factor: 0.95 },
            Carrier { code: "WN", name: "Southwest", fare_factor: 0.85 },
            Carrier { code: "DL", name: "Delta", fare_factor: 1.05 },
            Carrier { code: "NK", name: "Spirit", fare_factor: 0.7 },
        ];

        let mut catalog = Self {
            airports,
            destinations: HashMap::new(),
            carriers,
            hubs: ["DEN", "PHX", "SLC", "LAX", "ORD"].iter().map(|s| s.to_string()).collect(),
        };
        catalog.insert(las_vegas());
        catalog
    }

    /// Register or replace a destination
    pub fn insert(&mut self, destination: Destination) {
        self.airports
            .entry(destination.code.clone())
            .or_insert_with(|| destination.airport.clone());
        self.destinations.insert(destination.code.clone(), destination);
    }

    /// Inventory for a destination code, synthesized when not curated
    pub fn destination(&self, code: &str) -> Result<Destination> {
        let code = code.trim().to_uppercase();
        if code.len() < 3 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TripError::InvalidRequest(format!(
                "'{}' is not a destination code",
                code
            )));
        }
        Ok(self
            .destinations
            .get(&code)
            .cloned()
            .unwrap_or_else(|| synthetic(&code, self.airport(&code))))
    }

    pub fn airport(&self, code: &str) -> Location {
        self.airports.get(code).cloned().unwrap_or_else(|| {
            let h = fnv(code);
            Location::new(
                format!("{} Airport", code),
                "airport",
                25.0 + (h % 2000) as f64 / 100.0,
                -120.0 + ((h >> 16) % 4500) as f64 / 100.0,
            )
        })
    }

    pub fn carriers(&self) -> &[Carrier] {
        &self.carriers
    }

    /// Connection hubs usable between two airports
    pub fn hubs_between(&self, origin: &str, destination: &str) -> Vec<String> {
        self.hubs
            .iter()
            .filter(|h| h.as_str() != origin && h.as_str() != destination)
            .cloned()
            .collect()
    }
}

fn fnv(text: &str) -> u64 {
    text.bytes().fold(0xcbf29ce484222325u64, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x100000001b3)
    })
}

#[allow(clippy::too_many_arguments)]
fn hotel(
    id: &str,
    name: &str,
    district: &District,
    offset: (f64, f64),
    tier: AccommodationTier,
    rating: f64,
    nightly_rate: f64,
    amenities: &[&str],
) -> HotelListing {
    HotelListing {
        id: id.to_string(),
        name: name.to_string(),
        location: Location::new(
            name,
            district.name.clone(),
            district.center.lat + offset.0,
            district.center.lng + offset.1,
        ),
        tier,
        rating,
        nightly_rate,
        amenities: amenities.iter().map(|a| a.to_string()).collect(),
    }
}

#[allow(clippy::too_many_arguments)]
fn activity(
    id: &str,
    name: &str,
    category: &str,
    district: &District,
    offset: (f64, f64),
    duration_minutes: i64,
    price: f64,
    rating: f64,
    hours: (u32, u32),
) -> ActivityListing {
    ActivityListing {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        location: Location::new(
            name,
            district.name.clone(),
            district.center.lat + offset.0,
            district.center.lng + offset.1,
        ),
        duration_minutes,
        price,
        rating,
        opens_hour: hours.0,
        closes_hour: hours.1,
    }
}

fn district(name: &str, lat: f64, lng: f64) -> District {
    District {
        name: name.to_string(),
        center: Location::new(name, name, lat, lng),
    }
}

fn las_vegas() -> Destination {
    let north = district("north-strip", 36.1447, -115.1569);
    let center = district("center-strip", 36.1147, -115.1728);
    let south = district("south-strip", 36.0955, -115.1761);
    let downtown = district("downtown", 36.1699, -115.1398);
    let outskirts = district("red-rock", 36.1350, -115.4270);

    use AccommodationTier::*;
    let hotels = vec![
        hotel("las-h01", "Bellagio", &center, (0.0, 0.0), Luxury, 4.7, 289.0, &["pool", "spa", "casino", "gym"]),
        hotel("las-h02", "The Linq", &center, (0.003, 0.002), Standard, 4.1, 139.0, &["pool", "casino"]),
        hotel("las-h03", "Flamingo", &center, (0.002, 0.001), Budget, 3.8, 89.0, &["pool", "casino"]),
        hotel("las-h04", "Resorts World", &north, (0.0, 0.0), Luxury, 4.6, 249.0, &["pool", "spa", "gym"]),
        hotel("las-h05", "Treasure Island", &north, (-0.012, -0.002), Standard, 4.0, 119.0, &["pool", "casino", "gym"]),
        hotel("las-h06", "Circus Circus", &north, (0.001, 0.003), Budget, 3.4, 59.0, &["casino"]),
        hotel("las-h07", "Mandalay Bay", &south, (-0.003, 0.0), Luxury, 4.5, 229.0, &["pool", "spa", "beach"]),
        hotel("las-h08", "Luxor", &south, (0.0, 0.0), Standard, 3.9, 109.0, &["pool", "casino"]),
        hotel("las-h09", "Excalibur", &south, (0.002, 0.001), Budget, 3.6, 69.0, &["pool", "casino"]),
        hotel("las-h10", "Circa", &downtown, (0.0, 0.0), Luxury, 4.6, 219.0, &["pool", "casino", "gym"]),
        hotel("las-h11", "Golden Nugget", &downtown, (0.001, -0.002), Standard, 4.2, 99.0, &["pool", "casino"]),
        hotel("las-h12", "El Cortez", &downtown, (-0.001, 0.004), Budget, 3.7, 55.0, &["casino"]),
    ];

    let activities = vec![
        activity("las-a01", "Cirque du Soleil O", "shows", &center, (0.0, 0.001), 120, 149.0, 4.8, (19, 23)),
        activity("las-a02", "Fountains of Bellagio", "sightseeing", &center, (0.0, 0.002), 30, 0.0, 4.7, (11, 24)),
        activity("las-a03", "High Roller Observation Wheel", "sightseeing", &center, (0.004, 0.003), 45, 35.0, 4.5, (12, 24)),
        activity("las-a04", "Neon Museum", "museums", &downtown, (0.007, 0.004), 90, 28.0, 4.6, (10, 22)),
        activity("las-a05", "Mob Museum", "museums", &downtown, (0.006, 0.0), 120, 30.0, 4.7, (9, 21)),
        activity("las-a06", "Fremont Street Experience", "nightlife", &downtown, (0.0, 0.0), 90, 0.0, 4.4, (18, 24)),
        activity("las-a07", "Red Rock Canyon Hike", "outdoors", &outskirts, (0.0, 0.0), 180, 20.0, 4.9, (8, 17)),
        activity("las-a08", "Hoover Dam Tour", "tours", &outskirts, (-0.120, 0.480), 240, 99.0, 4.6, (9, 16)),
        activity("las-a09", "Strat SkyPod", "sightseeing", &north, (0.012, 0.004), 60, 25.0, 4.3, (10, 24)),
        activity("las-a10", "Shark Reef Aquarium", "museums", &south, (-0.003, 0.001), 75, 29.0, 4.2, (10, 20)),
        activity("las-a11", "Tasting Menu at Eiffel Tower", "dining", &center, (-0.001, 0.001), 120, 125.0, 4.5, (17, 23)),
        activity("las-a12", "Chef's Buffet", "dining", &center, (0.002, 0.0), 90, 65.0, 4.3, (11, 21)),
        activity("las-a13", "Blue Man Group", "shows", &south, (0.0, 0.0), 90, 89.0, 4.5, (19, 23)),
        activity("las-a14", "Valley of Fire Day Trip", "outdoors", &outskirts, (0.35, 0.55), 300, 140.0, 4.8, (7, 17)),
    ];

    Destination {
        code: "LAS".to_string(),
        city: "Las Vegas".to_string(),
        airport: Location::new("LAS Airport", "airport", 36.0840, -115.1537),
        districts: vec![north, center, south, downtown, outskirts],
        hotels,
        activities,
    }
}

fn synthetic(code: &str, airport: Location) -> Destination {
    let h = fnv(code);
    let names = ["old-town", "waterfront", "midtown"];
    let districts: Vec<District> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            district(
                name,
                airport.lat + 0.05 + i as f64 * 0.02,
                airport.lng + 0.03 - i as f64 * 0.025,
            )
        })
        .collect();

    let tiers = [
        AccommodationTier::Budget,
        AccommodationTier::Standard,
        AccommodationTier::Luxury,
    ];
    let mut hotels = Vec::new();
    for (d, dist) in districts.iter().enumerate() {
        for (t, tier) in tiers.iter().enumerate() {
            let jitter = ((h >> (d * 3 + t)) % 40) as f64;
            hotels.push(hotel(
                &format!("{}-h{}{}", code.to_lowercase(), d, t),
                &format!("{} {} Hotel {}", code, dist.name, t + 1),
                dist,
                (0.001 * t as f64, 0.001 * d as f64),
                *tier,
                3.5 + 0.4 * t as f64 - 0.1 * d as f64,
                70.0 + 80.0 * t as f64 + jitter,
                &["wifi", "gym", "pool"][..=t],
            ));
        }
    }

    let categories = [
        ("museums", 90, 25.0),
        ("tours", 180, 60.0),
        ("dining", 90, 55.0),
        ("outdoors", 150, 15.0),
        ("shows", 120, 80.0),
        ("sightseeing", 60, 20.0),
        ("nightlife", 120, 30.0),
        ("shopping", 90, 0.0),
    ];
    let activities = categories
        .iter()
        .enumerate()
        .map(|(i, (category, minutes, price))| {
            let dist = &districts[i % districts.len()];
            let evening = matches!(*category, "shows" | "nightlife");
            activity(
                &format!("{}-a{:02}", code.to_lowercase(), i),
                &format!("{} {}", dist.name, category),
                category,
                dist,
                (0.002 * i as f64, -0.001 * i as f64),
                *minutes,
                *price,
                4.0 + ((h >> i) % 10) as f64 / 20.0,
                if evening { (18, 24) } else { (9, 20) },
            )
        })
        .collect();

    Destination {
        code: code.to_string(),
        city: code.to_string(),
        airport,
        districts,
        hotels,
        activities,
    }
}
