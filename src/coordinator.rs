//! Planning workflow
//!
//! [`TripPlanner`] drives each run through a fixed sequence of phases:
//!
//! ```text
//! Init -> Broadcast -> ParallelSearch -> BudgetAnalysis -> Aggregate
//!      -> ConflictDetect <-> ConflictResolve -> Complete
//! ```
//!
//! with `Aborted` reachable from every non-terminal phase. Each run gets its
//! own key registry, broker and agent generation; agents only ever see each
//! other through the broker. Progress is published as [`TripEvent`]s.

use crate::agents::{
    AgentEndpoint, AgentFactory, AgentRegistry, BudgetReport, BudgetSuggestion, SearchResults,
    SpecialistAgent, SuggestionAction,
};
use crate::broker::{BrokerEvent, BrokerStats};
use crate::catalog::Catalog;
use crate::config::TripConfig;
use crate::context::RunContext;
use crate::crypto::EncryptedEnvelope;
use crate::dlq::{DeadLetterStore, MemoryDeadLetterStore};
use crate::error::{Result, TripError};
use crate::itinerary::{ItemKind, Itinerary, ItineraryItem};
use crate::negotiation::{negotiate, NegotiationOutcome, ParticipationResponse};
use crate::resolver::{Conflict, ConflictResolver, ConflictStatus, DistanceEstimator, TravelTimeEstimator};
use crate::session::{agent_id, AgentChannel, Inbound, Mesh};
use crate::snapshot::SnapshotStore;
use crate::state::StateManager;
use crate::transport::EnvelopeHandler;
use crate::types::{
    actions, AgentKind, AgentMessage, AgentStatus, CostCategory, DateRange, MessageKind, TripConstraints,
    TripEvent, TripRequest,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Agent id and state writer of the coordinator
pub const COORDINATOR_ID: &str = "coordinator";

/// Interval at which a blocked phase checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Workflow position of a planning run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Init,
    Broadcast,
    ParallelSearch,
    BudgetAnalysis,
    Aggregate,
    ConflictDetect,
    ConflictResolve,
    Complete,
    Aborted,
    /// Stopped by an error other than cancellation
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Aborted | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Broadcast => "broadcast",
            RunPhase::ParallelSearch => "parallelSearch",
            RunPhase::BudgetAnalysis => "budgetAnalysis",
            RunPhase::Aggregate => "aggregate",
            RunPhase::ConflictDetect => "conflictDetect",
            RunPhase::ConflictResolve => "conflictResolve",
            RunPhase::Complete => "complete",
            RunPhase::Aborted => "aborted",
            RunPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub run_id: String,
    pub itinerary: Itinerary,
    pub results: HashMap<AgentKind, SearchResults>,
    pub negotiation: Option<NegotiationOutcome>,
    pub broker: BrokerStats,
    /// State version after the itinerary was persisted
    pub state_version: u64,
}

impl PlanOutcome {
    pub fn budget(&self) -> Option<&BudgetReport> {
        match self.results.get(&AgentKind::Budget) {
            Some(SearchResults::Budget(report)) => Some(report),
            _ => None,
        }
    }
}

/// Bookkeeping for one submitted run
struct RunHandle {
    registered: Instant,
    phase: Mutex<RunPhase>,
    cancelled: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<PlanOutcome>>>>,
}

impl RunHandle {
    fn new() -> Self {
        Self {
            registered: Instant::now(),
            phase: Mutex::new(RunPhase::Init),
            cancelled: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn phase(&self) -> RunPhase {
        self.phase.lock().map(|p| *p).unwrap_or(RunPhase::Failed)
    }

    fn set_phase(&self, phase: RunPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }
}

// ============================================================================
// Coordinator inbox
// ============================================================================

/// Receives every message addressed to the coordinator
struct CoordinatorInbox {
    channel: Arc<AgentChannel>,
    events: broadcast::Sender<TripEvent>,
    /// Alternative offers by correlation id
    offers: Mutex<HashMap<String, AgentMessage>>,
}

impl CoordinatorInbox {
    fn take_offer(&self, correlation_id: &str) -> Option<AgentMessage> {
        self.offers.lock().ok()?.remove(correlation_id)
    }

    fn dispatch(&self, inbound: &Inbound, message: AgentMessage) {
        let directory = self.channel.directory();

        if message.kind == MessageKind::Error {
            let reason = message
                .data
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unspecified agent error")
                .to_string();
            tracing::warn!(from = %inbound.sender, action = %message.action, reason = %reason, "Agent reported an error");
            let _ = self.events.send(TripEvent::from_error(&TripError::AgentFailure {
                agent: inbound.sender.clone(),
                reason,
            }));
            return;
        }

        let action = message.action.clone();
        match action.as_str() {
            actions::SEARCH_COMPLETED => {
                if directory.kind_of(&inbound.sender).is_none() {
                    tracing::warn!(from = %inbound.sender, "Ignoring completion from a superseded agent");
                    return;
                }
                let _ = self.events.send(TripEvent::AgentStatus {
                    agent_id: inbound.sender.clone(),
                    status: AgentStatus::Completed,
                    progress: 1.0,
                });
            }
            actions::ALTERNATIVES_OFFER => {
                if let Ok(mut offers) = self.offers.lock() {
                    offers.insert(inbound.correlation_id.clone(), message);
                }
            }
            actions::BUDGET_ALERT => {
                tracing::info!(from = %inbound.sender, alert = %message.data, "Budget alert received");
            }
            other => {
                tracing::debug!(from = %inbound.sender, action = other, "Coordinator message");
            }
        }
    }
}

#[async_trait]
impl EnvelopeHandler for CoordinatorInbox {
    async fn on_envelope(&self, envelope: EncryptedEnvelope) -> Result<()> {
        let message = self.channel.inspect(&envelope)?;
        self.channel.accept(&envelope)?;
        self.dispatch(&Inbound::from_envelope(&envelope), message);
        Ok(())
    }
}

// ============================================================================
// Run
// ============================================================================

/// Current generation of one agent kind
struct Member {
    agent: Arc<dyn SpecialistAgent>,
    channel: Arc<AgentChannel>,
    generation: u32,
}

/// Working set of one run
struct Run {
    ctx: RunContext,
    handle: Arc<RunHandle>,
    mesh: Mesh,
    inbox: Arc<CoordinatorInbox>,
    members: HashMap<AgentKind, Member>,
    /// Messages the coordinator sent each kind, replayed after a restart
    outbox: HashMap<AgentKind, Vec<(String, AgentMessage)>>,
    results: HashMap<AgentKind, SearchResults>,
    degraded: Vec<AgentKind>,
    broker_events: broadcast::Receiver<BrokerEvent>,
    consumer: Option<JoinHandle<()>>,
}

impl Run {
    fn member(&self, kind: AgentKind) -> Result<&Member> {
        self.members
            .get(&kind)
            .ok_or_else(|| TripError::NotFound(format!("no {} agent in run {}", kind, self.ctx.run_id)))
    }

    /// Send to the current agent of `kind`, remembering the message for replay
    fn send_recorded(&mut self, kind: AgentKind, correlation_id: &str, message: AgentMessage) -> Result<()> {
        self.inbox.channel.post_to(kind, correlation_id, &message)?;
        self.outbox
            .entry(kind)
            .or_default()
            .push((correlation_id.to_string(), message));
        Ok(())
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Coordinates specialist agents into a conflict-free itinerary
pub struct TripPlanner {
    config: Arc<TripConfig>,
    catalog: Arc<Catalog>,
    agents: AgentRegistry,
    state: Arc<StateManager>,
    dead_letters: Arc<dyn DeadLetterStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    travel: Arc<dyn TravelTimeEstimator>,
    events: broadcast::Sender<TripEvent>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl TripPlanner {
    pub fn new(config: TripConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            dead_letters: Arc::new(MemoryDeadLetterStore::new(config.broker.dead_letter_capacity)),
            travel: Arc::new(DistanceEstimator {
                speed_kmh: config.schedule.travel_speed_kmh,
            }),
            config: Arc::new(config),
            catalog: Arc::new(Catalog::builtin()),
            agents: AgentRegistry::builtin(),
            state: Arc::new(StateManager::new()),
            snapshots: None,
            events,
            runs: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Replace the factory for one agent kind
    pub fn with_agent(mut self, kind: AgentKind, factory: AgentFactory) -> Self {
        self.agents.register(kind, factory);
        self
    }

    /// Save a state snapshot after every completed run
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    pub fn with_travel_estimator(mut self, estimator: Arc<dyn TravelTimeEstimator>) -> Self {
        self.travel = estimator;
        self
    }

    pub fn config(&self) -> &TripConfig {
        &self.config
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    pub fn dead_letters(&self) -> Arc<dyn DeadLetterStore> {
        self.dead_letters.clone()
    }

    /// Subscribe to outbound events of every run
    pub fn subscribe(&self) -> broadcast::Receiver<TripEvent> {
        self.events.subscribe()
    }

    /// Outbound events as a stream; lagged events are skipped
    pub fn event_stream(&self) -> impl Stream<Item = TripEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Restore state from the snapshot store
    ///
    /// Returns the new state version, or `None` when nothing was saved.
    pub fn recover(&self) -> Result<Option<u64>> {
        let Some(store) = &self.snapshots else {
            return Ok(None);
        };
        match store.load()? {
            Some(snapshot) => Ok(Some(self.state.restore(&snapshot, COORDINATOR_ID)?)),
            None => Ok(None),
        }
    }

    /// Start a run in the background and return its id
    pub async fn submit(self: &Arc<Self>, request: TripRequest) -> Result<String> {
        self.spawn_run(request, None).await
    }

    /// Start a group run in the background; see [`TripPlanner::plan_group`]
    pub async fn submit_group(
        self: &Arc<Self>,
        request: TripRequest,
        responses: mpsc::Receiver<ParticipationResponse>,
    ) -> Result<String> {
        self.spawn_run(request, Some(responses)).await
    }

    async fn spawn_run(
        self: &Arc<Self>,
        request: TripRequest,
        responses: Option<mpsc::Receiver<ParticipationResponse>>,
    ) -> Result<String> {
        let constraints = request.into_constraints()?;
        let run_id = new_run_id();
        let handle = self.register_run(&run_id).await;

        let planner = Arc::clone(self);
        let task_handle = handle.clone();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            planner
                .execute(task_handle, task_run_id, constraints, responses)
                .await
        });
        *handle.task.lock().await = Some(task);

        tracing::info!(run = %run_id, "Run submitted");
        Ok(run_id)
    }

    /// Wait for a submitted run to finish
    pub async fn wait(&self, run_id: &str) -> Result<PlanOutcome> {
        let handle = self.run_handle(run_id).await?;
        let task = handle
            .task
            .lock()
            .await
            .take()
            .ok_or_else(|| TripError::NotFound(format!("run {} has no pending task", run_id)))?;
        task.await.map_err(|e| TripError::AgentFailure {
            agent: COORDINATOR_ID.to_string(),
            reason: format!("run task failed: {}", e),
        })?
    }

    /// Plan a trip inline
    pub async fn plan(&self, request: TripRequest) -> Result<PlanOutcome> {
        let constraints = request.into_constraints()?;
        let run_id = new_run_id();
        let handle = self.register_run(&run_id).await;
        self.execute(handle, run_id, constraints, None).await
    }

    /// Plan a group trip, first negotiating pooled bookings
    ///
    /// Participation responses are collected for the negotiation window
    /// before any agent is asked to search.
    pub async fn plan_group(
        &self,
        request: TripRequest,
        responses: mpsc::Receiver<ParticipationResponse>,
    ) -> Result<PlanOutcome> {
        let constraints = request.into_constraints()?;
        let run_id = new_run_id();
        let handle = self.register_run(&run_id).await;
        self.execute(handle, run_id, constraints, Some(responses)).await
    }

    /// Cancel a run; it stops at its next phase check
    pub async fn abort(&self, run_id: &str) -> Result<()> {
        let handle = self.run_handle(run_id).await?;
        handle.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(run = %run_id, phase = %handle.phase(), "Abort requested");
        Ok(())
    }

    /// Current phase of a run
    pub async fn status(&self, run_id: &str) -> Option<RunPhase> {
        self.runs.read().await.get(run_id).map(|h| h.phase())
    }

    async fn register_run(&self, run_id: &str) -> Arc<RunHandle> {
        let handle = Arc::new(RunHandle::new());
        let mut runs = self.runs.write().await;
        evict_finished(&mut runs, self.config.coordinator.retained_runs);
        runs.insert(run_id.to_string(), handle.clone());
        handle
    }

    async fn run_handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| TripError::NotFound(format!("run {}", run_id)))
    }

    fn emit(&self, event: TripEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, agent_id: &str, status: AgentStatus, progress: f32) {
        self.emit(TripEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            status,
            progress,
        });
    }

    async fn execute(
        &self,
        handle: Arc<RunHandle>,
        run_id: String,
        constraints: TripConstraints,
        responses: Option<mpsc::Receiver<ParticipationResponse>>,
    ) -> Result<PlanOutcome> {
        let ctx = RunContext::new(
            run_id,
            constraints,
            self.config.clone(),
            self.catalog.clone(),
            self.state.clone(),
        )
        .with_cancellation(handle.cancelled.clone());
        tracing::info!(
            run = %ctx.run_id,
            destination = %ctx.constraints.destination,
            travelers = ctx.constraints.travelers,
            "Run started"
        );

        let result = match self.provision_run(ctx.clone(), handle.clone()) {
            Ok(mut run) => {
                let result = self.drive(&mut run, responses).await;
                self.teardown(&mut run).await;
                result
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            let phase = if matches!(err, TripError::Aborted(_)) {
                RunPhase::Aborted
            } else {
                RunPhase::Failed
            };
            handle.set_phase(phase);
            tracing::warn!(run = %ctx.run_id, phase = %phase, error = %err, "Run stopped");
            let _ = self
                .state
                .update(&ctx.state_path("phase"), serde_json::json!(phase), COORDINATOR_ID);
            self.emit(TripEvent::from_error(err));
        }
        result
    }

    /// Init: per-run mesh, coordinator inbox, and one agent per kind
    fn provision_run(&self, ctx: RunContext, handle: Arc<RunHandle>) -> Result<Run> {
        handle.set_phase(RunPhase::Init);
        let mesh = Mesh::new(
            self.config.broker.clone(),
            ctx.registry.clone(),
            self.dead_letters.clone(),
            COORDINATOR_ID,
        );
        let inbox = Arc::new(CoordinatorInbox {
            channel: mesh.channel(COORDINATOR_ID)?,
            events: self.events.clone(),
            offers: Mutex::new(HashMap::new()),
        });
        mesh.attach(COORDINATOR_ID, inbox.clone())?;
        let broker_events = mesh.broker.subscribe();

        let mut members = HashMap::new();
        for kind in AgentKind::ALL {
            members.insert(kind, self.provision(&mesh, &ctx, kind, 1)?);
        }
        let consumer = Some(mesh.broker.start());

        Ok(Run {
            ctx,
            handle,
            mesh,
            inbox,
            members,
            outbox: HashMap::new(),
            results: HashMap::new(),
            degraded: Vec::new(),
            broker_events,
            consumer,
        })
    }

    /// Create, register, and route one agent generation
    fn provision(&self, mesh: &Mesh, ctx: &RunContext, kind: AgentKind, generation: u32) -> Result<Member> {
        let id = agent_id(kind, generation);
        let agent = self.agents.create(kind)?;
        let channel = mesh.channel(&id)?;
        mesh.attach(
            &id,
            Arc::new(AgentEndpoint::new(agent.clone(), channel.clone(), ctx.clone())),
        )?;
        mesh.directory.set(kind, id.clone());
        self.emit_status(&id, AgentStatus::Idle, 0.0);
        Ok(Member {
            agent,
            channel,
            generation,
        })
    }

    fn enter(&self, run: &Run, phase: RunPhase) -> Result<()> {
        run.ctx.ensure_active()?;
        run.handle.set_phase(phase);
        tracing::info!(run = %run.ctx.run_id, phase = %phase, "Run phase");
        self.state.update(
            &run.ctx.state_path("phase"),
            serde_json::json!(phase),
            COORDINATOR_ID,
        )?;
        Ok(())
    }

    async fn drive(
        &self,
        run: &mut Run,
        responses: Option<mpsc::Receiver<ParticipationResponse>>,
    ) -> Result<PlanOutcome> {
        let negotiation = match responses {
            Some(mut responses) => {
                let outcome = tokio::select! {
                    outcome = negotiate(&mut responses, run.ctx.constraints.travelers, &self.config.negotiation) => outcome,
                    _ = cancelled(&run.ctx) => return Err(TripError::Aborted(run.ctx.run_id.clone())),
                };
                self.state.update(
                    &run.ctx.state_path("negotiation"),
                    serde_json::to_value(&outcome)?,
                    COORDINATOR_ID,
                )?;
                Some(outcome)
            }
            None => None,
        };

        self.enter(run, RunPhase::Broadcast)?;
        self.broadcast(run).await?;

        self.enter(run, RunPhase::ParallelSearch)?;
        self.parallel_search(run).await?;

        self.enter(run, RunPhase::BudgetAnalysis)?;
        self.budget_analysis(run).await?;

        self.enter(run, RunPhase::Aggregate)?;
        let mut itinerary = self.aggregate(run, negotiation.as_ref())?;

        self.resolve_conflicts(run, &mut itinerary).await?;

        self.enter(run, RunPhase::Complete)?;
        self.complete(run, itinerary, negotiation)
    }

    async fn broadcast(&self, run: &mut Run) -> Result<()> {
        let message = AgentMessage::with_data(
            MessageKind::Request,
            actions::CONSTRAINTS_BROADCAST,
            &*run.ctx.constraints,
        )?;
        let correlation = run.ctx.correlation("constraints");
        for kind in AgentKind::ALL {
            run.send_recorded(kind, &correlation, message.clone())?;
        }
        self.settle(run).await;
        Ok(())
    }

    async fn parallel_search(&self, run: &mut Run) -> Result<()> {
        let deadline = self.config.coordinator.search_timeout();
        let mut searches = Vec::new();
        for kind in AgentKind::SEARCHERS {
            let member = run.member(kind)?;
            self.emit_status(member.channel.agent_id(), AgentStatus::Searching, 0.1);
            searches.push(search_with_deadline(member, &run.ctx, deadline));
        }

        let outcomes = tokio::select! {
            outcomes = join_all(searches) => outcomes,
            _ = cancelled(&run.ctx) => return Err(TripError::Aborted(run.ctx.run_id.clone())),
        };

        for (kind, outcome) in AgentKind::SEARCHERS.into_iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    run.results.insert(kind, results);
                }
                Err(err) => self.recover_agent(run, kind, err).await?,
            }
        }
        self.settle(run).await;
        Ok(())
    }

    async fn budget_analysis(&self, run: &mut Run) -> Result<()> {
        // Cost notifications must land before the budget agent reads them
        self.settle(run).await;

        let member = run.member(AgentKind::Budget)?;
        self.emit_status(member.channel.agent_id(), AgentStatus::Searching, 0.1);
        let outcome = tokio::select! {
            outcome = search_with_deadline(member, &run.ctx, self.config.coordinator.search_timeout()) => outcome,
            _ = cancelled(&run.ctx) => return Err(TripError::Aborted(run.ctx.run_id.clone())),
        };
        match outcome {
            Ok(results) => {
                run.results.insert(AgentKind::Budget, results);
            }
            Err(err) => self.recover_agent(run, AgentKind::Budget, err).await?,
        }
        self.settle(run).await;

        if let Some(SearchResults::Budget(report)) = run.results.get(&AgentKind::Budget) {
            self.emit(TripEvent::BudgetAlert {
                severity: report.severity(),
                message: report.message(),
                totals: serde_json::json!({
                    "categories": report.totals,
                    "total": report.total,
                    "ceiling": report.ceiling,
                    "overBudget": report.over_budget,
                    "underBudget": report.under_budget,
                }),
            });
        }
        Ok(())
    }

    /// Restart a failed agent, or degrade its category once restarts run out
    async fn recover_agent(&self, run: &mut Run, kind: AgentKind, err: TripError) -> Result<()> {
        if matches!(err, TripError::Aborted(_)) {
            return Err(err);
        }
        let mut last_error = err;

        for _ in 0..self.config.coordinator.agent_restarts {
            run.ctx.ensure_active()?;
            let failed_id = run.member(kind)?.channel.agent_id().to_string();
            tracing::warn!(
                run = %run.ctx.run_id,
                agent = %failed_id,
                error = %last_error,
                "Agent failed, restarting"
            );
            self.restart(run, kind).await?;

            let member = run.member(kind)?;
            let outcome = tokio::select! {
                outcome = search_with_deadline(member, &run.ctx, self.config.coordinator.search_timeout()) => outcome,
                _ = cancelled(&run.ctx) => return Err(TripError::Aborted(run.ctx.run_id.clone())),
            };
            match outcome {
                Ok(results) => {
                    run.results.insert(kind, results);
                    return Ok(());
                }
                Err(TripError::Aborted(id)) => return Err(TripError::Aborted(id)),
                Err(e) => last_error = e,
            }
        }

        run.ctx.ensure_active()?;
        let failed_id = run.member(kind)?.channel.agent_id().to_string();
        let failure = TripError::AgentFailure {
            agent: failed_id.clone(),
            reason: last_error.to_string(),
        };
        tracing::error!(run = %run.ctx.run_id, agent = %failed_id, error = %last_error, "Agent unrecoverable, degrading plan");
        run.mesh.detach(&failed_id);
        run.degraded.push(kind);
        self.emit_status(&failed_id, AgentStatus::Failed, 0.0);
        self.emit(TripEvent::from_error(&failure));
        Ok(())
    }

    /// Replace an agent with a fresh generation and replay its traffic
    async fn restart(&self, run: &mut Run, kind: AgentKind) -> Result<()> {
        let (old_id, generation) = {
            let member = run.member(kind)?;
            (member.channel.agent_id().to_string(), member.generation + 1)
        };
        self.emit_status(&old_id, AgentStatus::Restarting, 0.0);
        run.mesh.detach(&old_id);

        // Letters for the old generation are superseded by the replay below
        let prefix = run.ctx.correlation("");
        let stranded = run.mesh.broker.dead_letters().take_for(&old_id).await?;
        let mut superseded = 0;
        for letter in stranded {
            if letter.message.envelope.correlation_id.starts_with(&prefix) {
                superseded += 1;
            } else {
                run.mesh.broker.dead_letters().handle(letter).await?;
            }
        }

        let member = self.provision(&run.mesh, &run.ctx, kind, generation)?;
        let new_id = member.channel.agent_id().to_string();
        run.members.insert(kind, member);

        let replay = run.outbox.get(&kind).cloned().unwrap_or_default();
        for (correlation_id, message) in &replay {
            run.inbox.channel.post_to(kind, correlation_id, message)?;
        }
        if kind == AgentKind::Budget {
            for (source, results) in &run.results {
                if let Some(note) = results.cost_notification() {
                    let message =
                        AgentMessage::with_data(MessageKind::Notification, actions::COST_NOTIFY, &note)?;
                    run.inbox.channel.post_to(
                        AgentKind::Budget,
                        &run.ctx.correlation(&format!("cost:replay:{}", source)),
                        &message,
                    )?;
                }
            }
        }
        self.settle(run).await;

        tracing::info!(
            run = %run.ctx.run_id,
            old = %old_id,
            agent = %new_id,
            replayed = replay.len(),
            superseded,
            "Agent restarted"
        );
        Ok(())
    }

    /// Aggregate: top choices of every category on one timeline
    fn aggregate(&self, run: &Run, negotiation: Option<&NegotiationOutcome>) -> Result<Itinerary> {
        let ctx = &run.ctx;
        let constraints = &ctx.constraints;
        let schedule = &self.config.schedule;
        let mut itinerary = Itinerary::new(ctx.run_id.clone());

        if let Some(SearchResults::Flights(options)) = run.results.get(&AgentKind::Flight) {
            if let Some(best) = options.first() {
                let airport = self.catalog.airport(&constraints.destination);
                let outbound_price = (best.price * 50.0).round() / 100.0;
                itinerary.add_item(ItineraryItem::new(
                    format!("{}-out", best.id),
                    ItemKind::Flight,
                    format!("{} {}-{}", best.carrier_name, best.outbound.from, best.outbound.to),
                    best.outbound.depart,
                    best.outbound.arrive,
                    airport.clone(),
                    outbound_price,
                ));
                itinerary.add_item(ItineraryItem::new(
                    format!("{}-ret", best.id),
                    ItemKind::Flight,
                    format!("{} {}-{}", best.carrier_name, best.inbound.from, best.inbound.to),
                    best.inbound.depart,
                    best.inbound.arrive,
                    airport,
                    best.price - outbound_price,
                ));
            }
        }

        if let Some(SearchResults::Hotels(options)) = run.results.get(&AgentKind::Hotel) {
            if let Some(best) = options.first() {
                let check_out = constraints.dates.start + chrono::Duration::days(constraints.dates.nights());
                itinerary.add_item(ItineraryItem::new(
                    best.id.clone(),
                    ItemKind::Lodging,
                    best.name.clone(),
                    DateRange::at(constraints.dates.start, schedule.check_in_hour, 0),
                    DateRange::at(check_out, schedule.check_out_hour, 0),
                    best.location.clone(),
                    best.price,
                ));
            }
        }

        if let Some(SearchResults::Activities(plan)) = run.results.get(&AgentKind::Activity) {
            for activity in plan.activities() {
                itinerary.add_item(ItineraryItem::new(
                    activity.id.clone(),
                    ItemKind::Activity,
                    activity.name.clone(),
                    activity.start,
                    activity.end,
                    activity.location.clone(),
                    activity.price,
                ));
            }
        }

        itinerary.degraded = run.degraded.clone();
        itinerary.booking_mode = negotiation.map(|n| n.mode);
        if let Some(SearchResults::Budget(report)) = run.results.get(&AgentKind::Budget) {
            itinerary.budget = Some(report.clone());
        }

        self.state.update(
            &ctx.state_path("itinerary"),
            serde_json::to_value(&itinerary)?,
            COORDINATOR_ID,
        )?;
        self.emit(TripEvent::ItineraryUpdate {
            trip_id: ctx.run_id.clone(),
            delta: serde_json::json!({
                "items": itinerary.items(),
                "totalCost": itinerary.total_cost(),
                "degraded": itinerary.degraded,
            }),
        });
        tracing::info!(
            run = %ctx.run_id,
            items = itinerary.len(),
            total = itinerary.total_cost(),
            "Itinerary aggregated"
        );
        Ok(itinerary)
    }

    /// ConflictDetect and ConflictResolve until nothing structural is left
    async fn resolve_conflicts(&self, run: &mut Run, itinerary: &mut Itinerary) -> Result<()> {
        let resolver = ConflictResolver::new(
            self.config.schedule.buffer(),
            self.config.budget.contingency,
            self.travel.clone(),
        );
        let budget = run.ctx.constraints.budget;
        let max_rounds = self.config.coordinator.max_resolve_iterations;

        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut leftover = Vec::new();
        let mut rounds = 0;

        let over_budget = loop {
            self.enter(run, RunPhase::ConflictDetect)?;
            let detected = resolver.detect(itinerary, Some(&budget));
            for conflict in &detected {
                if !conflicts.iter().any(|c| c.id == conflict.id) {
                    tracing::info!(run = %run.ctx.run_id, conflict = %conflict.id, "Conflict detected");
                    self.emit(TripEvent::ConflictDetected {
                        conflict: conflict.clone(),
                    });
                    conflicts.push(conflict.clone());
                }
            }

            let (structural, budget_side): (Vec<_>, Vec<_>) =
                detected.into_iter().partition(Conflict::is_structural);
            if structural.is_empty() {
                break budget_side;
            }
            if rounds >= max_rounds {
                leftover = structural;
                break budget_side;
            }

            self.enter(run, RunPhase::ConflictResolve)?;
            rounds += 1;
            let repaired = resolver.resolve(itinerary, &structural);
            if repaired.is_empty() {
                leftover = structural;
                break budget_side;
            }
            for conflict in repaired {
                set_status(&mut conflicts, &conflict.id, ConflictStatus::Resolved, None);
            }
        };

        for conflict in leftover {
            set_status(&mut conflicts, &conflict.id, ConflictStatus::ManualReview, None);
            self.emit(TripEvent::from_error(&TripError::ConflictUnresolved(format!(
                "{}: {}",
                conflict.id, conflict.suggested_resolution
            ))));
        }
        // Anything still open was fixed as a side effect of another repair
        for conflict in conflicts.iter_mut() {
            if conflict.is_structural() && conflict.status == ConflictStatus::Open {
                conflict.status = ConflictStatus::Resolved;
            }
        }

        let overage = itinerary.total_cost() - budget.ceiling(self.config.budget.contingency);
        for conflict in over_budget {
            match self.delegate_budget(run, &conflict, overage).await? {
                Some(suggestion) => {
                    set_status(&mut conflicts, &conflict.id, ConflictStatus::Delegated, Some(suggestion));
                }
                None => {
                    set_status(&mut conflicts, &conflict.id, ConflictStatus::ManualReview, None);
                    self.emit(TripEvent::from_error(&TripError::ConflictUnresolved(format!(
                        "{}: no budget suggestion covers the overage",
                        conflict.id
                    ))));
                }
            }
        }

        itinerary.conflicts = conflicts;
        Ok(())
    }

    /// Ask the budget agent for reductions covering `overage`
    ///
    /// Takes the deepest reduction per category; `None` when even those
    /// together fall short.
    async fn delegate_budget(&self, run: &mut Run, conflict: &Conflict, overage: f64) -> Result<Option<String>> {
        if run.degraded.contains(&AgentKind::Budget) {
            return Ok(None);
        }
        let correlation = run.ctx.correlation(&format!("alternatives:{}", conflict.id));
        let request = AgentMessage::with_data(MessageKind::Request, actions::ALTERNATIVES_REQUEST, conflict)?;
        run.inbox.channel.post_to(AgentKind::Budget, &correlation, &request)?;
        self.settle(run).await;

        let suggestions: Vec<BudgetSuggestion> = run
            .inbox
            .take_offer(&correlation)
            .and_then(|offer| offer.data.get("suggestions").cloned())
            .map(serde_json::from_value::<Vec<BudgetSuggestion>>)
            .transpose()?
            .unwrap_or_default();

        let mut deepest: HashMap<CostCategory, &BudgetSuggestion> = HashMap::new();
        for suggestion in &suggestions {
            if suggestion.action != SuggestionAction::Reduce || suggestion.amount_delta >= 0.0 {
                continue;
            }
            let entry = deepest.entry(suggestion.category).or_insert(suggestion);
            if suggestion.amount_delta < entry.amount_delta {
                *entry = suggestion;
            }
        }
        let savings: f64 = deepest.values().map(|s| -s.amount_delta).sum();
        if deepest.is_empty() || savings + 0.005 < overage {
            tracing::warn!(
                run = %run.ctx.run_id,
                conflict = %conflict.id,
                overage,
                savings,
                "Budget suggestions do not cover the overage"
            );
            return Ok(None);
        }

        let mut chosen: Vec<_> = deepest.into_values().collect();
        chosen.sort_by(|a, b| a.amount_delta.total_cmp(&b.amount_delta));
        Ok(Some(
            chosen
                .iter()
                .map(|s| s.description.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        ))
    }

    /// Complete: persist, snapshot, and announce the itinerary
    fn complete(
        &self,
        run: &mut Run,
        itinerary: Itinerary,
        negotiation: Option<NegotiationOutcome>,
    ) -> Result<PlanOutcome> {
        let ctx = &run.ctx;
        let state_version = self.state.update(
            &ctx.state_path("itinerary"),
            serde_json::to_value(&itinerary)?,
            COORDINATOR_ID,
        )?;
        if let Some(store) = &self.snapshots {
            store.save(&self.state.snapshot())?;
        }

        tracing::info!(
            run = %ctx.run_id,
            items = itinerary.len(),
            total = itinerary.total_cost(),
            conflicts = itinerary.conflicts.len(),
            degraded = ?itinerary.degraded,
            "Planning complete"
        );
        self.emit(TripEvent::PlanningComplete {
            itinerary: itinerary.clone(),
        });

        Ok(PlanOutcome {
            run_id: ctx.run_id.clone(),
            itinerary,
            results: std::mem::take(&mut run.results),
            negotiation,
            broker: run.mesh.broker.stats(),
            state_version,
        })
    }

    /// Drain the broker and surface its failures as `error` events
    async fn settle(&self, run: &mut Run) {
        run.mesh.broker.flush().await;
        loop {
            match run.broker_events.try_recv() {
                Ok(BrokerEvent::DeadLettered {
                    message_id,
                    recipient,
                    attempts,
                    reason,
                    ..
                }) => {
                    self.emit(TripEvent::from_error(&TripError::DeliveryFailure {
                        message_id,
                        attempts,
                        reason: format!("{} unreachable: {}", recipient, reason),
                    }));
                }
                Ok(BrokerEvent::Rejected {
                    sender, reason, ..
                }) => {
                    self.emit(TripEvent::from_error(&TripError::SignatureInvalid { sender, reason }));
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(run = %run.ctx.run_id, skipped, "Broker events lagged");
                }
                Err(_) => break,
            }
        }
    }

    async fn teardown(&self, run: &mut Run) {
        for member in run.members.values() {
            run.mesh.detach(member.channel.agent_id());
        }
        run.mesh.detach(COORDINATOR_ID);
        run.mesh.broker.shutdown();
        if let Some(consumer) = run.consumer.take() {
            let _ = consumer.await;
        }
    }
}

/// Drop the oldest finished runs beyond `keep`
fn evict_finished(runs: &mut HashMap<String, Arc<RunHandle>>, keep: usize) {
    let mut finished: Vec<(Instant, String)> = runs
        .iter()
        .filter(|(_, handle)| handle.phase().is_terminal())
        .map(|(id, handle)| (handle.registered, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
        tracing::debug!(run = %run_id, "Finished run evicted");
    }
}

fn new_run_id() -> String {
    format!("trip-{}", uuid::Uuid::new_v4())
}

fn set_status(conflicts: &mut [Conflict], id: &str, status: ConflictStatus, resolution: Option<String>) {
    if let Some(conflict) = conflicts.iter_mut().find(|c| c.id == id) {
        conflict.status = status;
        if let Some(resolution) = resolution {
            conflict.suggested_resolution = resolution;
        }
    }
}

/// Run one agent's search as its own task, bounded by `deadline`
async fn search_with_deadline(member: &Member, ctx: &RunContext, deadline: Duration) -> Result<SearchResults> {
    let agent = member.agent.clone();
    let channel = member.channel.clone();
    let task_ctx = ctx.clone();
    let id = channel.agent_id().to_string();

    let mut task = tokio::spawn(async move { agent.search(&task_ctx, &channel).await });
    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(TripError::AgentFailure {
            agent: id,
            reason: format!("search task failed: {}", join),
        }),
        Err(_) => {
            task.abort();
            Err(TripError::Timeout(format!(
                "{} search exceeded {} ms",
                id,
                deadline.as_millis()
            )))
        }
    }
}

/// Resolves once the run is cancelled
async fn cancelled(ctx: &RunContext) {
    while !ctx.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}
