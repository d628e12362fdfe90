//! Planner integration tests
//!
//! End-to-end runs through the full coordinator: broadcast, parallel
//! search, budget analysis, aggregation, and conflict handling. Covers the
//! outbound event stream, cancellation, agent restarts, degraded plans,
//! group negotiation, and snapshots.

use a3s_trip::agents::{ActivityAgent, FlightAgent, HotelAgent};
use a3s_trip::context::RunContext;
use a3s_trip::itinerary::ItemKind;
use a3s_trip::resolver::ConflictType;
use a3s_trip::session::{AgentChannel, Inbound};
use a3s_trip::types::{actions, CostCategory, CostNotification, MessageKind, Severity};
use a3s_trip::{
    AgentFactory, AgentKind, AgentMessage, AgentStatus, BookingMode, BudgetRange, ConflictStatus,
    DateRange, FileSnapshotStore, ParticipationResponse, Preferences, Result, RunPhase,
    SearchResults, SpecialistAgent, TripConfig, TripError, TripEvent, TripPlanner, TripRequest,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

fn las_request() -> TripRequest {
    TripRequest {
        origin: "SFO".to_string(),
        destination: "LAS".to_string(),
        dates: DateRange::starting(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(), 5),
        travelers: 1,
        budget: BudgetRange::new(2000.0, 3500.0),
        preferences: Preferences {
            activity_types: vec!["shows".into(), "sightseeing".into(), "dining".into()],
            ..Default::default()
        },
    }
}

fn drain(rx: &mut broadcast::Receiver<TripEvent>) -> Vec<TripEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn position(events: &[TripEvent], name: &str) -> Option<usize> {
    events.iter().position(|e| e.name() == name)
}

fn error_codes(events: &[TripEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TripEvent::Error { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

fn statuses_for(events: &[TripEvent], agent: &str) -> Vec<AgentStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            TripEvent::AgentStatus {
                agent_id, status, ..
            } if agent_id == agent => Some(*status),
            _ => None,
        })
        .collect()
}

// ─── Test agents ─────────────────────────────────────────────────

/// Flight agent whose first `failures` searches fail across generations
struct FlakyFlight {
    inner: FlightAgent,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl SpecialistAgent for FlakyFlight {
    fn kind(&self) -> AgentKind {
        AgentKind::Flight
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TripError::AgentFailure {
                agent: channel.agent_id().to_string(),
                reason: "carrier feed unavailable".to_string(),
            });
        }
        self.inner.search(ctx, channel).await
    }

    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        self.inner.handle(ctx, channel, inbound, message).await
    }
}

fn flaky_flight(failures: u32) -> AgentFactory {
    let counter = Arc::new(AtomicU32::new(failures));
    Arc::new(move || {
        Arc::new(FlakyFlight {
            inner: FlightAgent::new(),
            failures: counter.clone(),
        }) as Arc<dyn SpecialistAgent>
    })
}

/// Hotel agent that never answers within any reasonable deadline
struct StalledHotel;

#[async_trait]
impl SpecialistAgent for StalledHotel {
    fn kind(&self) -> AgentKind {
        AgentKind::Hotel
    }

    async fn search(&self, _ctx: &RunContext, _channel: &AgentChannel) -> Result<SearchResults> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(SearchResults::Hotels(Vec::new()))
    }

    async fn handle(
        &self,
        _ctx: &RunContext,
        _channel: &AgentChannel,
        _inbound: &Inbound,
        _message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        Ok(None)
    }
}

/// Hotel agent that reprices its top pick far above the budget
///
/// Reports the runner-up hotels as alternatives unless `alternatives` is set.
struct RepricedHotel {
    inner: HotelAgent,
    price: f64,
    alternatives: Option<Vec<f64>>,
}

fn repriced_hotel(price: f64, alternatives: Option<Vec<f64>>) -> AgentFactory {
    Arc::new(move || {
        Arc::new(RepricedHotel {
            inner: HotelAgent::new(),
            price,
            alternatives: alternatives.clone(),
        }) as Arc<dyn SpecialistAgent>
    })
}

#[async_trait]
impl SpecialistAgent for RepricedHotel {
    fn kind(&self) -> AgentKind {
        AgentKind::Hotel
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let SearchResults::Hotels(mut options) = self.inner.search(ctx, channel).await? else {
            unreachable!("hotel agent returns hotels");
        };
        options[0].price = self.price;
        let revised = CostNotification {
            category: CostCategory::Lodging,
            amount: self.price,
            alternatives: self
                .alternatives
                .clone()
                .unwrap_or_else(|| options.iter().skip(1).map(|o| o.price).collect()),
        };
        channel.post_to(
            AgentKind::Budget,
            &ctx.correlation("cost:repriced"),
            &AgentMessage::with_data(MessageKind::Notification, actions::COST_NOTIFY, &revised)?,
        )?;
        Ok(SearchResults::Hotels(options))
    }

    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        self.inner.handle(ctx, channel, inbound, message).await
    }
}

/// Activity agent that double-books the first afternoon
#[derive(Default)]
struct DoubleBookedActivities {
    inner: ActivityAgent,
}

#[async_trait]
impl SpecialistAgent for DoubleBookedActivities {
    fn kind(&self) -> AgentKind {
        AgentKind::Activity
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let SearchResults::Activities(mut schedule) = self.inner.search(ctx, channel).await? else {
            unreachable!("activity agent returns a schedule");
        };
        let day = &mut schedule.days[0];
        let first = &day.activities[0];
        let midpoint = first.start + (first.end - first.start) / 2;
        let length = day.activities[1].end - day.activities[1].start;
        day.activities[1].start = midpoint;
        day.activities[1].end = midpoint + length;
        Ok(SearchResults::Activities(schedule))
    }

    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        self.inner.handle(ctx, channel, inbound, message).await
    }
}

// ─── End to end ──────────────────────────────────────────────────

#[tokio::test]
async fn test_las_plan_end_to_end() {
    let planner = TripPlanner::new(TripConfig::default()).unwrap();
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    let itinerary = &outcome.itinerary;

    assert!(!itinerary.is_empty());
    assert!(itinerary.degraded.is_empty());
    assert!(itinerary.items().iter().any(|i| i.kind == ItemKind::Flight));
    assert!(itinerary.items().iter().any(|i| i.kind == ItemKind::Lodging));
    assert!(itinerary.items().iter().any(|i| i.kind == ItemKind::Activity));
    assert!(itinerary.total_cost() < 3500.0);

    let report = outcome.budget().unwrap();
    assert!(!report.over_budget);
    assert!(report.missing.is_empty());
    assert_eq!(report.totals.len(), 3);
    assert_eq!(itinerary.budget.as_ref(), Some(report));

    let events = drain(&mut rx);
    assert_eq!(events.last().map(TripEvent::name), Some("planning:complete"));
    assert!(error_codes(&events).is_empty());
    assert_eq!(
        planner.status(&outcome.run_id).await,
        Some(RunPhase::Complete)
    );
}

#[tokio::test]
async fn test_event_order() {
    let planner = TripPlanner::new(TripConfig::default()).unwrap();
    let mut rx = planner.subscribe();
    planner.plan(las_request()).await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(events[0].name(), "agent:status");
    let alert = position(&events, "budget:alert").unwrap();
    let update = position(&events, "itinerary:update").unwrap();
    let complete = position(&events, "planning:complete").unwrap();
    assert!(alert < update);
    assert!(update < complete);

    for agent in ["flight-agent", "hotel-agent", "activity-agent", "budget-agent"] {
        let statuses = statuses_for(&events, agent);
        assert_eq!(statuses.first(), Some(&AgentStatus::Idle), "{}", agent);
        assert!(statuses.contains(&AgentStatus::Searching), "{}", agent);
        assert!(statuses.contains(&AgentStatus::Completed), "{}", agent);
    }
}

#[tokio::test]
async fn test_events_serialize_with_wire_names() {
    let planner = TripPlanner::new(TripConfig::default()).unwrap();
    let mut rx = planner.subscribe();
    planner.plan(las_request()).await.unwrap();

    let wire: Vec<serde_json::Value> = drain(&mut rx)
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();
    let complete = wire
        .iter()
        .find(|v| v["event"] == "planning:complete")
        .unwrap();
    assert!(complete["data"]["itinerary"]["tripId"]
        .as_str()
        .unwrap()
        .starts_with("trip-"));
    let status = wire.iter().find(|v| v["event"] == "agent:status").unwrap();
    assert!(status["data"]["agentId"].is_string());
}

#[tokio::test]
async fn test_submit_and_wait() {
    let planner = Arc::new(TripPlanner::new(TripConfig::default()).unwrap());
    let run_id = planner.submit(las_request()).await.unwrap();
    assert!(planner.status(&run_id).await.is_some());

    let outcome = planner.wait(&run_id).await.unwrap();
    assert_eq!(outcome.run_id, run_id);
    assert_eq!(planner.status(&run_id).await, Some(RunPhase::Complete));

    // The task is consumed by the first wait
    assert!(matches!(
        planner.wait(&run_id).await,
        Err(TripError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let planner = Arc::new(TripPlanner::new(TripConfig::default()).unwrap());
    let first = planner.submit(las_request()).await.unwrap();
    let second = planner.submit(las_request()).await.unwrap();
    assert_ne!(first, second);

    let a = planner.wait(&first).await.unwrap();
    let b = planner.wait(&second).await.unwrap();
    assert_eq!(a.itinerary.len(), b.itinerary.len());
    assert!(planner
        .state()
        .get(&format!("trips.{}.itinerary", first))
        .is_some());
    assert!(planner
        .state()
        .get(&format!("trips.{}.itinerary", second))
        .is_some());
}

// ─── Cancellation & failures ─────────────────────────────────────

#[tokio::test]
async fn test_abort_stops_run() {
    let planner = Arc::new(
        TripPlanner::new(TripConfig::default())
            .unwrap()
            .with_agent(AgentKind::Hotel, Arc::new(|| Arc::new(StalledHotel) as Arc<dyn SpecialistAgent>)),
    );
    let mut rx = planner.subscribe();
    let run_id = planner.submit(las_request()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    planner.abort(&run_id).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), planner.wait(&run_id))
        .await
        .unwrap();
    assert!(matches!(result, Err(TripError::Aborted(_))));
    assert_eq!(planner.status(&run_id).await, Some(RunPhase::Aborted));

    let events = drain(&mut rx);
    assert!(error_codes(&events).contains(&"ABORTED".to_string()));
    assert!(position(&events, "planning:complete").is_none());
    assert_eq!(
        planner.state().get(&format!("trips.{}.phase", run_id)),
        Some(serde_json::json!("aborted"))
    );
}

#[tokio::test]
async fn test_flaky_agent_restarted() {
    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_agent(AgentKind::Flight, flaky_flight(1));
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    assert!(outcome.itinerary.degraded.is_empty());
    assert_eq!(
        outcome
            .itinerary
            .items()
            .iter()
            .filter(|i| i.kind == ItemKind::Flight)
            .count(),
        2
    );
    assert!(outcome.budget().unwrap().missing.is_empty());

    let events = drain(&mut rx);
    assert!(statuses_for(&events, "flight-agent").contains(&AgentStatus::Restarting));
    let second = statuses_for(&events, "flight-agent.2");
    assert_eq!(second.first(), Some(&AgentStatus::Idle));
    assert!(second.contains(&AgentStatus::Completed));
}

#[tokio::test]
async fn test_unrecoverable_agent_degrades_plan() {
    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_agent(AgentKind::Flight, flaky_flight(u32::MAX));
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    assert_eq!(outcome.itinerary.degraded, vec![AgentKind::Flight]);
    assert!(outcome
        .itinerary
        .items()
        .iter()
        .all(|i| i.kind != ItemKind::Flight));
    assert!(outcome.itinerary.items().iter().any(|i| i.kind == ItemKind::Lodging));

    let report = outcome.budget().unwrap();
    assert_eq!(report.missing, vec![CostCategory::Flights]);
    assert_eq!(report.severity(), Severity::Medium);

    let events = drain(&mut rx);
    assert!(error_codes(&events).contains(&"AGENT_FAILURE".to_string()));
    assert!(statuses_for(&events, "flight-agent.2").contains(&AgentStatus::Failed));
    assert_eq!(events.last().map(TripEvent::name), Some("planning:complete"));
}

#[tokio::test]
async fn test_search_timeout_degrades_plan() {
    let mut config = TripConfig::default();
    config.coordinator.search_timeout_ms = 100;
    config.coordinator.agent_restarts = 0;
    let planner = TripPlanner::new(config)
        .unwrap()
        .with_agent(AgentKind::Hotel, Arc::new(|| Arc::new(StalledHotel) as Arc<dyn SpecialistAgent>));

    let outcome = planner.plan(las_request()).await.unwrap();
    assert_eq!(outcome.itinerary.degraded, vec![AgentKind::Hotel]);
    assert!(outcome
        .itinerary
        .items()
        .iter()
        .all(|i| i.kind != ItemKind::Lodging));
}

// ─── Conflicts & budget ──────────────────────────────────────────

#[tokio::test]
async fn test_over_budget_delegated_to_budget_agent() {
    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_agent(
            AgentKind::Hotel,
            repriced_hotel(5000.0, None),
        );
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    let report = outcome.budget().unwrap();
    assert!(report.over_budget);
    assert_eq!(report.totals[&CostCategory::Lodging], 5000.0);
    assert_eq!(report.severity(), Severity::Critical);

    let budget_conflicts: Vec<_> = outcome
        .itinerary
        .conflicts
        .iter()
        .filter(|c| c.kind == ConflictType::Budget)
        .collect();
    assert_eq!(budget_conflicts.len(), 1);
    assert_eq!(budget_conflicts[0].status, ConflictStatus::Delegated);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        TripEvent::BudgetAlert { severity: Severity::Critical, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TripEvent::ConflictDetected { conflict } if conflict.kind == ConflictType::Budget
    )));
}

#[tokio::test]
async fn test_uncovered_overage_needs_manual_review() {
    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_agent(AgentKind::Hotel, repriced_hotel(5000.0, Some(vec![4990.0])));
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    let report = outcome.budget().unwrap();
    assert!(report.over_budget);
    let overage = outcome.itinerary.total_cost() - report.ceiling;
    let savings: f64 = report
        .suggestions
        .iter()
        .filter(|s| s.amount_delta < 0.0)
        .map(|s| -s.amount_delta)
        .sum();
    assert!(savings < overage);

    let budget_conflict = outcome
        .itinerary
        .conflicts
        .iter()
        .find(|c| c.kind == ConflictType::Budget)
        .unwrap();
    assert_eq!(budget_conflict.status, ConflictStatus::ManualReview);

    let events = drain(&mut rx);
    assert!(error_codes(&events).contains(&"CONFLICT_UNRESOLVED".to_string()));
}

#[tokio::test]
async fn test_time_conflict_detected_and_resolved() {
    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_agent(
            AgentKind::Activity,
            Arc::new(|| Arc::new(DoubleBookedActivities::default()) as Arc<dyn SpecialistAgent>),
        );
    let mut rx = planner.subscribe();

    let outcome = planner.plan(las_request()).await.unwrap();
    let time_conflicts: Vec<_> = outcome
        .itinerary
        .conflicts
        .iter()
        .filter(|c| c.kind == ConflictType::Time)
        .collect();
    assert!(!time_conflicts.is_empty());
    assert!(time_conflicts
        .iter()
        .all(|c| c.status == ConflictStatus::Resolved));

    let timeline: Vec<_> = outcome.itinerary.blocking_items().collect();
    for (i, item) in timeline.iter().enumerate() {
        for later in &timeline[i + 1..] {
            assert!(!item.overlaps(later), "{} overlaps {}", item.id, later.id);
        }
    }

    let events = drain(&mut rx);
    let detected = position(&events, "conflict:detected").unwrap();
    assert!(detected < position(&events, "planning:complete").unwrap());
}

// ─── Group negotiation ───────────────────────────────────────────

fn group_planner() -> TripPlanner {
    let mut config = TripConfig::default();
    config.negotiation.window_ms = 200;
    TripPlanner::new(config).unwrap()
}

#[tokio::test]
async fn test_group_pooled_booking() {
    let planner = group_planner();
    let mut request = las_request();
    request.travelers = 4;

    let (tx, rx) = mpsc::channel(8);
    for traveler in ["ana", "ben", "cy", "dee"] {
        tx.send(ParticipationResponse::accept(traveler)).await.unwrap();
    }

    let outcome = planner.plan_group(request, rx).await.unwrap();
    let negotiation = outcome.negotiation.as_ref().unwrap();
    assert_eq!(negotiation.mode, BookingMode::Pooled);
    assert!(!negotiation.timed_out);
    assert_eq!(outcome.itinerary.booking_mode, Some(BookingMode::Pooled));
}

#[tokio::test]
async fn test_group_individual_after_window() {
    let planner = group_planner();
    let mut request = las_request();
    request.travelers = 4;

    let (tx, rx) = mpsc::channel(8);
    tx.send(ParticipationResponse::accept("ana")).await.unwrap();
    tx.send(ParticipationResponse::decline("ben")).await.unwrap();

    let outcome = planner.plan_group(request, rx).await.unwrap();
    let negotiation = outcome.negotiation.as_ref().unwrap();
    assert_eq!(negotiation.mode, BookingMode::Individual);
    assert!(negotiation.timed_out);
    assert_eq!(negotiation.declined, vec!["ben".to_string()]);
    assert_eq!(outcome.itinerary.booking_mode, Some(BookingMode::Individual));
    drop(tx);
}

#[tokio::test]
async fn test_abort_during_negotiation_window() {
    let planner = Arc::new(TripPlanner::new(TripConfig::default()).unwrap());
    let mut request = las_request();
    request.travelers = 4;

    let (tx, rx) = mpsc::channel(8);
    tx.send(ParticipationResponse::accept("ana")).await.unwrap();
    let run_id = planner.submit_group(request, rx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    planner.abort(&run_id).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), planner.wait(&run_id))
        .await
        .unwrap();
    assert!(matches!(result, Err(TripError::Aborted(_))));
    assert_eq!(planner.status(&run_id).await, Some(RunPhase::Aborted));
    drop(tx);
}

// ─── Snapshots ───────────────────────────────────────────────────

#[tokio::test]
async fn test_file_snapshot_survives_restart() {
    let path = std::env::temp_dir().join(format!("a3s-trip-{}.json", uuid::Uuid::new_v4()));
    let store = Arc::new(FileSnapshotStore::new(&path));

    let planner = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_snapshot_store(store.clone());
    let outcome = planner.plan(las_request()).await.unwrap();
    assert!(path.exists());

    let restarted = TripPlanner::new(TripConfig::default())
        .unwrap()
        .with_snapshot_store(store);
    assert!(restarted.recover().unwrap().is_some());
    let itinerary = restarted
        .state()
        .get(&format!("trips.{}.itinerary.items", outcome.run_id))
        .unwrap();
    assert_eq!(
        itinerary.as_array().unwrap().len(),
        outcome.itinerary.len()
    );

    let _ = std::fs::remove_file(&path);
}
