//! Specialist agents
//!
//! Each agent owns one domain of the plan and only talks to its peers
//! through the broker. The coordinator looks agents up by [`AgentKind`] in an
//! [`AgentRegistry`] and drives them through [`SpecialistAgent::search`];
//! everything else arrives as sealed messages handled by
//! [`SpecialistAgent::handle`].

pub mod activity;
pub mod budget;
pub mod flight;
pub mod hotel;

pub use activity::{ActivityAgent, ActivitySchedule, DaySchedule, ScheduledActivity};
pub use budget::{BudgetAgent, BudgetReport, BudgetSuggestion, SuggestionAction};
pub use flight::{FlightAgent, FlightLeg, FlightOption};
pub use hotel::{HotelAgent, HotelOption};

use crate::context::RunContext;
use crate::crypto::EncryptedEnvelope;
use crate::error::{Result, TripError};
use crate::session::{AgentChannel, Inbound};
use crate::transport::EnvelopeHandler;
use crate::types::{actions, AgentKind, AgentMessage, CostNotification, MessageKind, TripConstraints};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A domain specialist taking part in a planning run
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Produce this agent's ranked results for the run
    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults>;

    /// Handle one delivered message, optionally replying to its sender
    ///
    /// An error is reported to the broker as a failed delivery.
    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>>;
}

/// Output of one agent's search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "results", rename_all = "camelCase")]
pub enum SearchResults {
    Flights(Vec<FlightOption>),
    Hotels(Vec<HotelOption>),
    Activities(ActivitySchedule),
    Budget(BudgetReport),
}

impl SearchResults {
    pub fn kind(&self) -> AgentKind {
        match self {
            SearchResults::Flights(_) => AgentKind::Flight,
            SearchResults::Hotels(_) => AgentKind::Hotel,
            SearchResults::Activities(_) => AgentKind::Activity,
            SearchResults::Budget(_) => AgentKind::Budget,
        }
    }

    /// Cost report for the budget agent; `None` when nothing was selected
    pub fn cost_notification(&self) -> Option<CostNotification> {
        let category = self.kind().cost_category()?;
        match self {
            SearchResults::Flights(options) => {
                let (best, rest) = options.split_first()?;
                Some(CostNotification {
                    category,
                    amount: best.price,
                    alternatives: rest.iter().map(|o| o.price).collect(),
                })
            }
            SearchResults::Hotels(options) => {
                let (best, rest) = options.split_first()?;
                Some(CostNotification {
                    category,
                    amount: best.price,
                    alternatives: rest.iter().map(|o| o.price).collect(),
                })
            }
            SearchResults::Activities(schedule) => {
                if schedule.is_empty() {
                    return None;
                }
                Some(CostNotification {
                    category,
                    amount: schedule.total_cost,
                    alternatives: schedule.trimmed_totals(3),
                })
            }
            SearchResults::Budget(_) => None,
        }
    }

    /// Compact view written to shared state
    pub fn summary(&self) -> serde_json::Value {
        let (count, best) = match self {
            SearchResults::Flights(o) => (o.len(), o.first().map(|f| f.price)),
            SearchResults::Hotels(o) => (o.len(), o.first().map(|h| h.price)),
            SearchResults::Activities(s) => (s.len(), Some(s.total_cost)),
            SearchResults::Budget(r) => (r.suggestions.len(), Some(r.total)),
        };
        serde_json::json!({ "count": count, "amount": best })
    }

    pub fn len(&self) -> usize {
        match self {
            SearchResults::Flights(o) => o.len(),
            SearchResults::Hotels(o) => o.len(),
            SearchResults::Activities(s) => s.len(),
            SearchResults::Budget(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record results in shared state and report them over the broker
///
/// Writes `trips.{run}.results.{kind}`, sends the cost notification to the
/// budget agent, and tells the coordinator the search completed. Results of
/// an aborted run or a superseded agent generation are discarded.
pub(crate) fn publish_results(
    ctx: &RunContext,
    channel: &AgentChannel,
    results: &SearchResults,
) -> Result<()> {
    ctx.ensure_active()?;
    let kind = results.kind();
    if channel.directory().get(kind).ok().as_deref() != Some(channel.agent_id()) {
        tracing::warn!(agent = %channel.agent_id(), "Discarding results from a superseded agent");
        return Err(TripError::AgentFailure {
            agent: channel.agent_id().to_string(),
            reason: "superseded by a newer generation".to_string(),
        });
    }

    ctx.state.update(
        &ctx.state_path(&format!("results.{}", kind)),
        results.summary(),
        channel.agent_id(),
    )?;

    if let Some(note) = results.cost_notification() {
        let message = AgentMessage::with_data(MessageKind::Notification, actions::COST_NOTIFY, &note)?;
        channel.post_to(
            AgentKind::Budget,
            &ctx.correlation(&format!("cost:{}", channel.agent_id())),
            &message,
        )?;
    }

    channel.post_to_coordinator(
        &ctx.correlation("search"),
        &AgentMessage::notification(
            actions::SEARCH_COMPLETED,
            serde_json::json!({
                "agentId": channel.agent_id(),
                "kind": kind,
                "count": results.len(),
            }),
        ),
    )?;
    Ok(())
}

/// Replies shared by every agent: constraint acknowledgement and status
///
/// Returns `None` for actions the caller must handle itself.
pub(crate) fn common_reply(
    ctx: &RunContext,
    channel: &AgentChannel,
    status: &str,
    message: &AgentMessage,
) -> Option<AgentMessage> {
    match message.action.as_str() {
        actions::CONSTRAINTS_BROADCAST => match message.parse_data::<TripConstraints>() {
            Ok(received) if received == *ctx.constraints => Some(status_report(channel, "ready")),
            Ok(_) => Some(AgentMessage::error(
                actions::CONSTRAINTS_BROADCAST,
                format!("{} received constraints for a different run", channel.agent_id()),
            )),
            Err(e) => Some(AgentMessage::error(actions::CONSTRAINTS_BROADCAST, e.to_string())),
        },
        actions::STATUS_QUERY => Some(status_report(channel, status)),
        _ => None,
    }
}

fn status_report(channel: &AgentChannel, status: &str) -> AgentMessage {
    AgentMessage::response(
        actions::STATUS_REPORT,
        serde_json::json!({ "agentId": channel.agent_id(), "status": status }),
    )
}

/// Last search outcome kept for status and alternatives requests
#[derive(Default)]
pub(crate) struct LastResults(Mutex<Option<SearchResults>>);

impl LastResults {
    pub(crate) fn store(&self, results: &SearchResults) {
        if let Ok(mut last) = self.0.lock() {
            *last = Some(results.clone());
        }
    }

    pub(crate) fn status(&self) -> &'static str {
        match self.0.lock() {
            Ok(last) if last.is_some() => "completed",
            _ => "idle",
        }
    }

    /// Offer carrying the stored cost alternatives
    pub(crate) fn offer(&self) -> AgentMessage {
        let note = self
            .0
            .lock()
            .ok()
            .and_then(|last| last.as_ref().and_then(SearchResults::cost_notification));
        AgentMessage::response(
            actions::ALTERNATIVES_OFFER,
            serde_json::to_value(note).unwrap_or_default(),
        )
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Builds a fresh agent instance
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn SpecialistAgent> + Send + Sync>;

/// Factory building `A::default()`
pub fn factory_of<A: SpecialistAgent + Default + 'static>() -> AgentFactory {
    Arc::new(|| Arc::new(A::default()) as Arc<dyn SpecialistAgent>)
}

/// Agent factories keyed by kind
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: HashMap<AgentKind, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in specialists
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(AgentKind::Flight, factory_of::<FlightAgent>());
        registry.register(AgentKind::Hotel, factory_of::<HotelAgent>());
        registry.register(AgentKind::Activity, factory_of::<ActivityAgent>());
        registry.register(AgentKind::Budget, factory_of::<BudgetAgent>());
        registry
    }

    /// Register or replace the factory for a kind
    pub fn register(&mut self, kind: AgentKind, factory: AgentFactory) {
        self.factories.insert(kind, factory);
    }

    /// Build a new instance of a kind
    pub fn create(&self, kind: AgentKind) -> Result<Arc<dyn SpecialistAgent>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| TripError::NotFound(format!("no factory for {} agent", kind)))?;
        let agent = factory();
        if agent.kind() != kind {
            return Err(TripError::Config(format!(
                "factory for {} built a {} agent",
                kind,
                agent.kind()
            )));
        }
        Ok(agent)
    }

    pub fn contains(&self, kind: AgentKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Receives an agent's envelopes: opens, handles, and replies
pub struct AgentEndpoint {
    agent: Arc<dyn SpecialistAgent>,
    channel: Arc<AgentChannel>,
    ctx: RunContext,
}

impl AgentEndpoint {
    pub fn new(agent: Arc<dyn SpecialistAgent>, channel: Arc<AgentChannel>, ctx: RunContext) -> Self {
        Self {
            agent,
            channel,
            ctx,
        }
    }
}

#[async_trait]
impl EnvelopeHandler for AgentEndpoint {
    async fn on_envelope(&self, envelope: EncryptedEnvelope) -> Result<()> {
        let message = self.channel.inspect(&envelope)?;
        let inbound = Inbound::from_envelope(&envelope);
        tracing::trace!(
            agent = %self.channel.agent_id(),
            from = %inbound.sender,
            action = %message.action,
            "Handling message"
        );

        let reply = self
            .agent
            .handle(&self.ctx, &self.channel, &inbound, message)
            .await?;
        self.channel.accept(&envelope)?;

        if let Some(reply) = reply {
            self.channel
                .post(&inbound.sender, &inbound.correlation_id, &reply)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::harness::Harness;
    use super::*;
    use crate::session::agent_id;

    #[test]
    fn test_registry_builtin_kinds() {
        let registry = AgentRegistry::builtin();
        for kind in AgentKind::ALL {
            assert!(registry.contains(kind));
            assert_eq!(registry.create(kind).unwrap().kind(), kind);
        }
        assert!(AgentRegistry::new().create(AgentKind::Flight).is_err());
    }

    #[test]
    fn test_registry_rejects_mismatched_factory() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentKind::Hotel, factory_of::<FlightAgent>());
        assert!(matches!(
            registry.create(AgentKind::Hotel),
            Err(TripError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_endpoint_acknowledges_constraints() {
        let h = Harness::las();
        let flight = Arc::new(FlightAgent::new());
        let channel = h.channel_for(AgentKind::Flight);
        h.mesh
            .attach(
                &agent_id(AgentKind::Flight, 1),
                Arc::new(AgentEndpoint::new(flight, channel, h.ctx.clone())),
            )
            .unwrap();

        let broadcast = AgentMessage::with_data(
            MessageKind::Request,
            actions::CONSTRAINTS_BROADCAST,
            &*h.ctx.constraints,
        )
        .unwrap();
        h.coordinator
            .channel
            .post_to(AgentKind::Flight, &h.ctx.correlation("broadcast"), &broadcast)
            .unwrap();
        h.mesh.broker.flush().await;

        let received = h.coordinator.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].action, actions::STATUS_REPORT);
        assert_eq!(received[0].data["status"], "ready");
        assert_eq!(received[0].data["agentId"], "flight-agent");
    }

    #[tokio::test]
    async fn test_endpoint_flags_foreign_constraints() {
        let h = Harness::las();
        let hotel = Arc::new(HotelAgent::new());
        let channel = h.channel_for(AgentKind::Hotel);
        h.mesh
            .attach(
                &agent_id(AgentKind::Hotel, 1),
                Arc::new(AgentEndpoint::new(hotel, channel, h.ctx.clone())),
            )
            .unwrap();

        let mut other = (*h.ctx.constraints).clone();
        other.travelers = 4;
        let broadcast = AgentMessage::with_data(
            MessageKind::Request,
            actions::CONSTRAINTS_BROADCAST,
            &other,
        )
        .unwrap();
        h.coordinator
            .channel
            .post_to(AgentKind::Hotel, &h.ctx.correlation("broadcast"), &broadcast)
            .unwrap();
        h.mesh.broker.flush().await;

        let received = h.coordinator.received.lock().unwrap().clone();
        assert_eq!(received[0].kind, MessageKind::Error);
    }

    #[tokio::test]
    async fn test_superseded_generation_results_discarded() {
        let h = Harness::las();
        let old = h.channel_for(AgentKind::Flight);
        h.mesh.directory.set(AgentKind::Flight, agent_id(AgentKind::Flight, 2));

        let err = FlightAgent::new().search(&h.ctx, &old).await.unwrap_err();
        assert!(matches!(err, TripError::AgentFailure { .. }));
        assert!(h.ctx.state.get("trips.run-test.results.flight").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_results_discarded() {
        let h = Harness::las();
        let channel = h.channel_for(AgentKind::Hotel);
        h.ctx.cancel();

        let err = HotelAgent::new().search(&h.ctx, &channel).await.unwrap_err();
        assert!(matches!(err, TripError::Aborted(_)));
        h.mesh.broker.flush().await;
        assert!(h.coordinator.actions().is_empty());
    }

    #[test]
    fn test_search_results_wire_shape() {
        let results = SearchResults::Flights(Vec::new());
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["kind"], "flights");
        assert!(results.cost_notification().is_none());
        assert!(results.is_empty());
    }
}
