//! # a3s-trip
//!
//! Encrypted multi-agent trip coordination for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-trip` turns a trip request into a conflict-free itinerary by running
//! four specialist agents (flights, hotels, activities, budget) under one
//! coordinator. Agents never call each other directly: every exchange is a
//! signed and encrypted envelope routed through a priority message broker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_trip::{TripConfig, TripPlanner, TripRequest};
//!
//! # async fn example() -> a3s_trip::Result<()> {
//! let planner = TripPlanner::new(TripConfig::default())?;
//! let mut events = planner.subscribe();
//!
//! let request: TripRequest = serde_json::from_value(serde_json::json!({
//!     "destination": "LAS",
//!     "dates": {"start": "2026-03-10", "end": "2026-03-14"},
//!     "travelers": 1,
//!     "budget": {"min": 2000.0, "max": 3500.0},
//!     "preferences": {"activityTypes": ["shows", "dining"]}
//! }))?;
//!
//! let outcome = planner.plan(request).await?;
//! println!("{} items, total {}", outcome.itinerary.len(), outcome.itinerary.total_cost());
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{}", event.name());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **AgentIdentity** / **KeyRegistry**: Ed25519 identities, X25519 agreement, AES-256-GCM envelopes
//! - **MessageBroker**: strict-priority queues, retries with backoff, dead letters
//! - **SpecialistAgent** trait: flight, hotel, activity, and budget agents
//! - **ConflictResolver**: time, location, and budget conflicts with structural repair
//! - **StateManager**: versioned shared state with path locks and snapshots
//! - **TripPlanner**: the coordinator state machine driving each run

pub mod agents;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod crypto;
pub mod dlq;
pub mod error;
pub mod itinerary;
pub mod negotiation;
pub mod resolver;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod transport;
pub mod types;

// Re-export core types
pub use agents::{
    AgentFactory, AgentRegistry, BudgetReport, SearchResults, SpecialistAgent,
};
pub use broker::{BrokerEvent, BrokerStats, MessageBroker};
pub use config::TripConfig;
pub use coordinator::{PlanOutcome, RunPhase, TripPlanner};
pub use crypto::{EncryptedEnvelope, KeyRegistry};
pub use error::{Result, TripError};
pub use itinerary::{Itinerary, ItineraryItem};
pub use negotiation::{BookingMode, ParticipationResponse};
pub use resolver::{Conflict, ConflictResolver, ConflictStatus};
pub use state::{StateManager, StateSnapshot};
pub use types::{
    AgentKind, AgentMessage, AgentStatus, BudgetRange, DateRange, Preferences, TripConstraints,
    TripEvent, TripRequest,
};

// Re-export stores for convenience
pub use dlq::{DeadLetterStore, MemoryDeadLetterStore};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
