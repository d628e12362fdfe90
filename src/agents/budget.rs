//! Budget tracking
//!
//! Collects the latest cost notification per category, compares the total
//! against the traveler's range plus the contingency tolerance, and turns the
//! other agents' alternatives into ranked reduction or upgrade suggestions.

use super::{common_reply, publish_results, LastResults, SearchResults, SpecialistAgent};
use crate::config::BudgetPolicy;
use crate::context::RunContext;
use crate::error::Result;
use crate::session::{AgentChannel, Inbound};
use crate::types::{
    actions, AgentKind, AgentMessage, BudgetRange, CostCategory, CostNotification, MessageKind, Severity,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Suggestions kept per report
const MAX_SUGGESTIONS: usize = 6;

/// Overage share of the maximum at which an alert becomes critical
const CRITICAL_OVERAGE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuggestionAction {
    Reduce,
    Upgrade,
}

/// Switch one category to another ranked option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSuggestion {
    pub category: CostCategory,
    pub action: SuggestionAction,
    /// Change to the total; negative for reductions
    pub amount_delta: f64,
    pub description: String,
}

/// Aggregate cost position of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub budget: BudgetRange,
    pub totals: BTreeMap<CostCategory, f64>,
    pub total: f64,
    /// Budget maximum plus contingency
    pub ceiling: f64,
    pub over_budget: bool,
    pub under_budget: bool,
    /// Headroom below the ceiling; negative when over
    pub remaining: f64,
    /// Categories with no cost reported
    pub missing: Vec<CostCategory>,
    pub suggestions: Vec<BudgetSuggestion>,
}

impl BudgetReport {
    pub fn severity(&self) -> Severity {
        if self.over_budget {
            if self.total - self.budget.max > self.budget.max * CRITICAL_OVERAGE {
                Severity::Critical
            } else {
                Severity::High
            }
        } else if !self.missing.is_empty() {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Human-readable summary for `budget:alert`
    pub fn message(&self) -> String {
        if self.over_budget {
            format!(
                "Plan total {:.2} exceeds the {:.2} ceiling by {:.2}",
                self.total, self.ceiling, -self.remaining
            )
        } else if self.under_budget {
            format!(
                "Plan total {:.2} is below the {:.2} minimum",
                self.total, self.budget.min
            )
        } else {
            format!("Plan total {:.2} is within budget", self.total)
        }
    }
}

#[derive(Default)]
pub struct BudgetAgent {
    costs: Mutex<BTreeMap<CostCategory, CostNotification>>,
    last: LastResults,
}

impl BudgetAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cost reported for a category
    pub fn reported(&self, category: CostCategory) -> Option<CostNotification> {
        self.costs.lock().ok()?.get(&category).cloned()
    }

    pub fn record(&self, note: CostNotification) {
        if let Ok(mut costs) = self.costs.lock() {
            costs.insert(note.category, note);
        }
    }

    /// Current position against `budget`
    pub fn report(&self, budget: &BudgetRange, policy: &BudgetPolicy) -> BudgetReport {
        let costs = self
            .costs
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        build_report(&costs, budget, policy)
    }
}

fn build_report(
    costs: &BTreeMap<CostCategory, CostNotification>,
    budget: &BudgetRange,
    policy: &BudgetPolicy,
) -> BudgetReport {
    let totals: BTreeMap<CostCategory, f64> = costs.iter().map(|(c, n)| (*c, n.amount)).collect();
    let total = round2(totals.values().sum());
    let ceiling = budget.ceiling(policy.contingency);
    let over_budget = total > ceiling;
    let under_budget = total < budget.min;

    let missing = AgentKind::SEARCHERS
        .iter()
        .filter_map(AgentKind::cost_category)
        .filter(|c| !totals.contains_key(c))
        .collect();

    let suggestions = if over_budget {
        reductions(costs)
    } else if under_budget {
        upgrades(costs, budget.max - total)
    } else {
        Vec::new()
    };

    BudgetReport {
        budget: *budget,
        totals,
        total,
        ceiling,
        over_budget,
        under_budget,
        remaining: round2(ceiling - total),
        missing,
        suggestions,
    }
}

/// Cheaper alternatives, largest saving first
fn reductions(costs: &BTreeMap<CostCategory, CostNotification>) -> Vec<BudgetSuggestion> {
    let mut suggestions: Vec<BudgetSuggestion> = costs
        .values()
        .flat_map(|note| {
            note.alternatives
                .iter()
                .filter(move |alt| **alt < note.amount)
                .map(move |alt| BudgetSuggestion {
                    category: note.category,
                    action: SuggestionAction::Reduce,
                    amount_delta: round2(alt - note.amount),
                    description: format!(
                        "Switch {} to the {:.2} option, saving {:.2}",
                        label(note.category),
                        alt,
                        note.amount - alt
                    ),
                })
        })
        .collect();
    suggestions.sort_by(|a, b| a.amount_delta.total_cmp(&b.amount_delta));
    suggestions.dedup_by(|a, b| a.category == b.category && a.amount_delta == b.amount_delta);
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

/// Pricier alternatives that stay within `headroom`, largest upgrade first
fn upgrades(costs: &BTreeMap<CostCategory, CostNotification>, headroom: f64) -> Vec<BudgetSuggestion> {
    let mut suggestions: Vec<BudgetSuggestion> = costs
        .values()
        .flat_map(|note| {
            note.alternatives
                .iter()
                .filter(move |alt| **alt > note.amount && **alt - note.amount <= headroom)
                .map(move |alt| BudgetSuggestion {
                    category: note.category,
                    action: SuggestionAction::Upgrade,
                    amount_delta: round2(alt - note.amount),
                    description: format!(
                        "Upgrade {} to the {:.2} option for {:.2} more",
                        label(note.category),
                        alt,
                        alt - note.amount
                    ),
                })
        })
        .collect();
    suggestions.sort_by(|a, b| b.amount_delta.total_cmp(&a.amount_delta));
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

fn label(category: CostCategory) -> &'static str {
    match category {
        CostCategory::Flights => "flights",
        CostCategory::Lodging => "lodging",
        CostCategory::Activities => "activities",
        CostCategory::Misc => "misc",
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl SpecialistAgent for BudgetAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Budget
    }

    async fn search(&self, ctx: &RunContext, channel: &AgentChannel) -> Result<SearchResults> {
        let report = self.report(&ctx.constraints.budget, &ctx.config.budget);
        if !report.missing.is_empty() {
            tracing::warn!(
                agent = %channel.agent_id(),
                missing = ?report.missing,
                "Budget analysed with categories missing"
            );
        }
        tracing::info!(
            agent = %channel.agent_id(),
            total = report.total,
            ceiling = report.ceiling,
            over = report.over_budget,
            under = report.under_budget,
            suggestions = report.suggestions.len(),
            "Budget analysis complete"
        );

        ctx.state.update(
            &ctx.state_path("budget"),
            serde_json::to_value(&report)?,
            channel.agent_id(),
        )?;
        if report.over_budget {
            let alert = AgentMessage::notification(
                actions::BUDGET_ALERT,
                serde_json::json!({
                    "severity": report.severity(),
                    "message": report.message(),
                }),
            );
            channel.post_to_coordinator(&ctx.correlation("budget-alert"), &alert)?;
        }

        let results = SearchResults::Budget(report);
        publish_results(ctx, channel, &results)?;
        self.last.store(&results);
        Ok(results)
    }

    async fn handle(
        &self,
        ctx: &RunContext,
        channel: &AgentChannel,
        inbound: &Inbound,
        message: AgentMessage,
    ) -> Result<Option<AgentMessage>> {
        if let Some(reply) = common_reply(ctx, channel, self.last.status(), &message) {
            return Ok(Some(reply));
        }

        match message.action.as_str() {
            actions::COST_NOTIFY => {
                let note: CostNotification = message.parse_data()?;
                let directory = channel.directory();
                let from_owner = directory.kind_of(&inbound.sender).and_then(|k| k.cost_category())
                    == Some(note.category);
                if !from_owner && inbound.sender != directory.coordinator() {
                    tracing::warn!(
                        agent = %channel.agent_id(),
                        from = %inbound.sender,
                        category = ?note.category,
                        "Ignoring stale cost notification"
                    );
                    return Ok(None);
                }
                tracing::debug!(
                    agent = %channel.agent_id(),
                    category = ?note.category,
                    amount = note.amount,
                    "Cost recorded"
                );
                self.record(note);
                Ok(None)
            }
            actions::ALTERNATIVES_REQUEST => {
                let report = self.report(&ctx.constraints.budget, &ctx.config.budget);
                Ok(Some(AgentMessage::with_data(
                    MessageKind::Response,
                    actions::ALTERNATIVES_OFFER,
                    &serde_json::json!({
                        "total": report.total,
                        "ceiling": report.ceiling,
                        "suggestions": report.suggestions,
                    }),
                )?))
            }
            other => {
                tracing::debug!(agent = %channel.agent_id(), action = other, "Ignoring message");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::harness::Harness;
    use crate::agents::{ActivityAgent, FlightAgent, HotelAgent};

    fn note(category: CostCategory, amount: f64, alternatives: &[f64]) -> CostNotification {
        CostNotification {
            category,
            amount,
            alternatives: alternatives.to_vec(),
        }
    }

    fn agent_with(notes: Vec<CostNotification>) -> BudgetAgent {
        let agent = BudgetAgent::new();
        for n in notes {
            agent.record(n);
        }
        agent
    }

    #[test]
    fn test_over_budget_reductions_ranked_by_saving() {
        let agent = agent_with(vec![
            note(CostCategory::Flights, 1500.0, &[1200.0, 900.0, 1700.0]),
            note(CostCategory::Lodging, 2000.0, &[1000.0]),
            note(CostCategory::Activities, 500.0, &[300.0]),
        ]);
        let report = agent.report(&BudgetRange::new(2000.0, 3500.0), &BudgetPolicy::default());

        assert_eq!(report.total, 4000.0);
        assert!(report.over_budget);
        assert_eq!(report.remaining, -150.0);
        assert_eq!(report.severity(), Severity::High);

        let deltas: Vec<_> = report
            .suggestions
            .iter()
            .map(|s| (s.category, s.amount_delta))
            .collect();
        assert_eq!(
            deltas,
            vec![
                (CostCategory::Lodging, -1000.0),
                (CostCategory::Flights, -600.0),
                (CostCategory::Flights, -300.0),
                (CostCategory::Activities, -200.0),
            ]
        );
        assert!(report.suggestions.iter().all(|s| s.action == SuggestionAction::Reduce));
    }

    #[test]
    fn test_contingency_tolerates_small_overage() {
        let agent = agent_with(vec![
            note(CostCategory::Flights, 1400.0, &[]),
            note(CostCategory::Lodging, 1200.0, &[]),
            note(CostCategory::Activities, 1200.0, &[]),
        ]);
        let report = agent.report(&BudgetRange::new(2000.0, 3500.0), &BudgetPolicy::default());
        assert_eq!(report.total, 3800.0);
        assert!(!report.over_budget);
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn test_under_budget_upgrades_fit_maximum() {
        let agent = agent_with(vec![
            note(CostCategory::Flights, 300.0, &[450.0, 3000.0]),
            note(CostCategory::Lodging, 600.0, &[1100.0, 500.0]),
        ]);
        let report = agent.report(&BudgetRange::new(2000.0, 3500.0), &BudgetPolicy::default());
        assert!(report.under_budget);
        assert_eq!(report.missing, vec![CostCategory::Activities]);

        let deltas: Vec<_> = report.suggestions.iter().map(|s| s.amount_delta).collect();
        assert_eq!(deltas, vec![500.0, 150.0]);
        assert!(report.suggestions.iter().all(|s| s.action == SuggestionAction::Upgrade));
    }

    #[test]
    fn test_latest_notification_wins() {
        let agent = agent_with(vec![
            note(CostCategory::Flights, 900.0, &[]),
            note(CostCategory::Flights, 700.0, &[]),
        ]);
        assert_eq!(agent.reported(CostCategory::Flights).unwrap().amount, 700.0);
    }

    #[test]
    fn test_critical_overage() {
        let agent = agent_with(vec![note(CostCategory::Lodging, 5000.0, &[])]);
        let report = agent.report(&BudgetRange::new(2000.0, 3500.0), &BudgetPolicy::default());
        assert_eq!(report.severity(), Severity::Critical);
        assert!(report.message().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_las_plan_is_not_over_budget() {
        let h = Harness::las();
        let searches: Vec<(AgentKind, Box<dyn SpecialistAgent>)> = vec![
            (AgentKind::Flight, Box::new(FlightAgent::new())),
            (AgentKind::Hotel, Box::new(HotelAgent::new())),
            (AgentKind::Activity, Box::new(ActivityAgent::new())),
        ];
        for (kind, agent) in searches {
            let channel = h.channel_for(kind);
            agent.search(&h.ctx, &channel).await.unwrap();
        }
        h.mesh.broker.flush().await;

        let SearchResults::Budget(report) = h.budget.search(&h.ctx, &h.budget_channel).await.unwrap() else {
            panic!("expected a budget report");
        };
        assert!(!report.over_budget);
        assert!(report.missing.is_empty());
        assert!(report.total <= 3500.0 * 1.1);
        assert_eq!(report.totals.len(), 3);
        assert!(h.ctx.state.get("trips.run-test.budget.total").is_some());
    }

    #[tokio::test]
    async fn test_stale_sender_is_ignored() {
        let h = Harness::las();
        let current = h.channel_for(AgentKind::Flight);
        let stale = h.mesh.channel("flight-agent.old").unwrap();
        let message = |amount: f64| {
            AgentMessage::with_data(
                MessageKind::Notification,
                actions::COST_NOTIFY,
                &note(CostCategory::Flights, amount, &[]),
            )
            .unwrap()
        };

        current
            .post_to(AgentKind::Budget, &h.ctx.correlation("cost:a"), &message(400.0))
            .unwrap();
        stale
            .post_to(AgentKind::Budget, &h.ctx.correlation("cost:b"), &message(10.0))
            .unwrap();
        h.mesh.broker.flush().await;

        assert_eq!(h.budget.reported(CostCategory::Flights).unwrap().amount, 400.0);
    }

    #[tokio::test]
    async fn test_alternatives_request_returns_suggestions() {
        let h = Harness::las();
        h.budget.record(note(CostCategory::Lodging, 4000.0, &[1500.0]));

        let request = AgentMessage::request(actions::ALTERNATIVES_REQUEST, serde_json::json!({}));
        h.coordinator
            .channel
            .post_to(AgentKind::Budget, &h.ctx.correlation("alternatives"), &request)
            .unwrap();
        h.mesh.broker.flush().await;

        let received = h.coordinator.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].action, actions::ALTERNATIVES_OFFER);
        assert_eq!(received[0].data["suggestions"][0]["amountDelta"], -2500.0);
    }
}
