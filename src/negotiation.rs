//! Group booking negotiation
//!
//! For multi-traveler trips the coordinator collects participation
//! responses within a fixed window. When the accepted share reaches the
//! quorum, bookings are pooled; otherwise each traveler books individually.

use crate::config::NegotiationConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How the party's bookings are made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookingMode {
    /// One shared booking for every participant
    Pooled,
    Individual,
}

/// One traveler's answer to the participation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipationResponse {
    pub traveler_id: String,
    pub accepted: bool,
}

impl ParticipationResponse {
    pub fn accept(traveler_id: impl Into<String>) -> Self {
        Self {
            traveler_id: traveler_id.into(),
            accepted: true,
        }
    }

    pub fn decline(traveler_id: impl Into<String>) -> Self {
        Self {
            traveler_id: traveler_id.into(),
            accepted: false,
        }
    }
}

/// Result of a negotiation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationOutcome {
    pub mode: BookingMode,
    pub expected: u32,
    pub participants: Vec<String>,
    pub declined: Vec<String>,
    /// Accepted share of the expected travelers
    pub participation: f64,
    /// Window closed before every traveler answered
    pub timed_out: bool,
}

/// Collect responses until every traveler answered, the sender side closed,
/// or the window elapsed
///
/// A traveler's latest response wins; silence counts as not participating.
pub async fn negotiate(
    responses: &mut mpsc::Receiver<ParticipationResponse>,
    expected: u32,
    config: &NegotiationConfig,
) -> NegotiationOutcome {
    let deadline = Instant::now() + config.window();
    let mut answers: Vec<ParticipationResponse> = Vec::new();
    let mut timed_out = false;

    while answers.len() < expected as usize {
        match tokio::time::timeout_at(deadline, responses.recv()).await {
            Ok(Some(response)) => {
                tracing::debug!(
                    traveler = %response.traveler_id,
                    accepted = response.accepted,
                    "Participation response"
                );
                match answers.iter_mut().find(|a| a.traveler_id == response.traveler_id) {
                    Some(existing) => *existing = response,
                    None => answers.push(response),
                }
            }
            Ok(None) => break,
            Err(_) => {
                timed_out = true;
                break;
            }
        }
    }

    let (accepted, declined): (Vec<_>, Vec<_>) = answers.into_iter().partition(|a| a.accepted);
    let participation = if expected == 0 {
        0.0
    } else {
        accepted.len() as f64 / f64::from(expected)
    };
    let mode = if participation >= config.quorum {
        BookingMode::Pooled
    } else {
        BookingMode::Individual
    };

    tracing::info!(
        expected,
        accepted = accepted.len(),
        participation,
        timed_out,
        mode = ?mode,
        "Group negotiation closed"
    );

    NegotiationOutcome {
        mode,
        expected,
        participants: accepted.into_iter().map(|a| a.traveler_id).collect(),
        declined: declined.into_iter().map(|a| a.traveler_id).collect(),
        participation,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_ms: u64) -> NegotiationConfig {
        NegotiationConfig {
            window_ms,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_quorum_reached_pools() {
        let (tx, mut rx) = mpsc::channel(16);
        for i in 0..4 {
            tx.send(ParticipationResponse::accept(format!("t{}", i))).await.unwrap();
        }
        tx.send(ParticipationResponse::decline("t4")).await.unwrap();

        let outcome = negotiate(&mut rx, 5, &config(1_000)).await;
        assert_eq!(outcome.mode, BookingMode::Pooled);
        assert_eq!(outcome.participation, 0.8);
        assert_eq!(outcome.declined, vec!["t4"]);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_below_quorum_books_individually() {
        let (tx, mut rx) = mpsc::channel(16);
        for i in 0..3 {
            tx.send(ParticipationResponse::accept(format!("t{}", i))).await.unwrap();
        }
        tx.send(ParticipationResponse::decline("t3")).await.unwrap();
        tx.send(ParticipationResponse::decline("t4")).await.unwrap();

        let outcome = negotiate(&mut rx, 5, &config(1_000)).await;
        assert_eq!(outcome.mode, BookingMode::Individual);
        assert_eq!(outcome.participants.len(), 3);
    }

    #[tokio::test]
    async fn test_window_closes_on_silence() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(ParticipationResponse::accept("t0")).await.unwrap();

        let started = std::time::Instant::now();
        let outcome = negotiate(&mut rx, 2, &config(50)).await;
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        assert!(outcome.timed_out);
        assert_eq!(outcome.participation, 0.5);
        assert_eq!(outcome.mode, BookingMode::Individual);
        drop(tx);
    }

    #[tokio::test]
    async fn test_latest_response_wins() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(ParticipationResponse::decline("t0")).await.unwrap();
        tx.send(ParticipationResponse::accept("t0")).await.unwrap();
        tx.send(ParticipationResponse::accept("t1")).await.unwrap();
        drop(tx);

        let outcome = negotiate(&mut rx, 2, &config(1_000)).await;
        assert_eq!(outcome.participants, vec!["t0", "t1"]);
        assert_eq!(outcome.mode, BookingMode::Pooled);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_early() {
        let (tx, mut rx) = mpsc::channel::<ParticipationResponse>(1);
        drop(tx);
        let outcome = negotiate(&mut rx, 3, &config(60_000)).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.participation, 0.0);
        assert_eq!(outcome.mode, BookingMode::Individual);
    }
}
