use crate::{
    error::Result,
    interfaces::ReputationService,
    model::{PeerId, TradeId, TradeOutcome},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const COMPLETED_BONUS: i32 = 5;
const DISPUTED_PENALTY: i32 = -3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationScore {
    pub peer: PeerId,
    pub score: u32,
    pub completed_trades: u32,
    pub cancelled_trades: u32,
    pub disputed_trades: u32,
    pub last_updated: DateTime<Utc>,
    pub trust_level: TrustLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,     // 0-49
    Neutral,       // 50-74
    Trusted,       // 75-89
    HighlyTrusted, // 90-100
}

impl From<u32> for TrustLevel {
    fn from(score: u32) -> Self {
        match score {
            0..=49 => TrustLevel::Untrusted,
            50..=74 => TrustLevel::Neutral,
            75..=89 => TrustLevel::Trusted,
            _ => TrustLevel::HighlyTrusted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustActivity {
    pub peer: PeerId,
    pub trade_id: TradeId,
    pub outcome: TradeOutcome,
    pub score_change: i32,
    pub timestamp: DateTime<Utc>,
}

/// Local reputation ledger keyed by trader identity.
pub struct TrustSystem {
    initial_score: u32,
    scores: RwLock<HashMap<PeerId, ReputationScore>>,
    recorded: RwLock<HashSet<(PeerId, TradeId)>>,
}

impl TrustSystem {
    pub fn new(initial_score: u32) -> Self {
        Self {
            initial_score: initial_score.min(100),
            scores: RwLock::new(HashMap::new()),
            recorded: RwLock::new(HashSet::new()),
        }
    }

    pub fn get_reputation(&self, peer: &PeerId) -> u32 {
        self.scores
            .read()
            .get(peer)
            .map(|cached| cached.score)
            .unwrap_or(self.initial_score)
    }

    pub fn get_trust_level(&self, peer: &PeerId) -> TrustLevel {
        TrustLevel::from(self.get_reputation(peer))
    }

    pub fn check_min_reputation(&self, peer: &PeerId, min_score: u32) -> bool {
        self.get_reputation(peer) >= min_score
    }

    pub fn get_peer_trust_info(&self, peer: &PeerId) -> ReputationScore {
        self.scores.read().get(peer).cloned().unwrap_or_else(|| ReputationScore {
            peer: peer.clone(),
            score: self.initial_score,
            completed_trades: 0,
            cancelled_trades: 0,
            disputed_trades: 0,
            last_updated: Utc::now(),
            trust_level: TrustLevel::from(self.initial_score),
        })
    }

    pub fn get_all_reputations(&self) -> Vec<ReputationScore> {
        let mut all: Vec<ReputationScore> = self.scores.read().values().cloned().collect();
        all.sort_by(|a, b| b.score.cmp(&a.score));
        all
    }

    /// Applies a finished trade to the peer's score once per trade.
    pub fn record(&self, peer: &PeerId, trade_id: &TradeId, outcome: TradeOutcome) -> Option<TrustActivity> {
        if !self.recorded.write().insert((peer.clone(), trade_id.clone())) {
            return None;
        }

        let score_change = match outcome {
            TradeOutcome::Completed => COMPLETED_BONUS,
            TradeOutcome::Disputed => DISPUTED_PENALTY,
            TradeOutcome::Cancelled => 0,
        };
        let now = Utc::now();
        let mut scores = self.scores.write();
        let entry = scores.entry(peer.clone()).or_insert_with(|| ReputationScore {
            peer: peer.clone(),
            score: self.initial_score,
            completed_trades: 0,
            cancelled_trades: 0,
            disputed_trades: 0,
            last_updated: now,
            trust_level: TrustLevel::from(self.initial_score),
        });

        entry.score = (entry.score as i32 + score_change).clamp(0, 100) as u32;
        entry.trust_level = TrustLevel::from(entry.score);
        entry.last_updated = now;
        match outcome {
            TradeOutcome::Completed => entry.completed_trades += 1,
            TradeOutcome::Cancelled => entry.cancelled_trades += 1,
            TradeOutcome::Disputed => entry.disputed_trades += 1,
        }

        let activity = TrustActivity {
            peer: peer.clone(),
            trade_id: trade_id.clone(),
            outcome,
            score_change,
            timestamp: now,
        };
        log_trust_activity(&activity, entry.score);
        Some(activity)
    }
}

impl Default for TrustSystem {
    fn default() -> Self {
        Self::new(50)
    }
}

fn log_trust_activity(activity: &TrustActivity, score: u32) {
    tracing::info!(
        peer = %activity.peer,
        trade_id = %activity.trade_id,
        outcome = ?activity.outcome,
        score_change = activity.score_change,
        score,
        "Trust activity recorded"
    );
}

#[async_trait]
impl ReputationService for TrustSystem {
    async fn get_score(&self, peer: &PeerId) -> Result<u32> {
        Ok(self.get_reputation(peer))
    }

    async fn record_outcome(&self, peer: &PeerId, trade_id: &TradeId, outcome: TradeOutcome) -> Result<()> {
        self.record(peer, trade_id, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(n: u8) -> TradeId {
        TradeId::parse(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    #[test]
    fn test_trust_levels() {
        assert_eq!(TrustLevel::from(0), TrustLevel::Untrusted);
        assert_eq!(TrustLevel::from(50), TrustLevel::Neutral);
        assert_eq!(TrustLevel::from(80), TrustLevel::Trusted);
        assert_eq!(TrustLevel::from(95), TrustLevel::HighlyTrusted);
    }

    #[test]
    fn test_outcomes_adjust_score_once_per_trade() {
        let trust = TrustSystem::new(50);
        let peer = PeerId::new("ab".repeat(32));

        assert!(trust.record(&peer, &trade(1), TradeOutcome::Completed).is_some());
        assert!(trust.record(&peer, &trade(1), TradeOutcome::Completed).is_none());
        assert_eq!(trust.get_reputation(&peer), 55);

        trust.record(&peer, &trade(2), TradeOutcome::Disputed);
        trust.record(&peer, &trade(3), TradeOutcome::Cancelled);
        let info = trust.get_peer_trust_info(&peer);
        assert_eq!(info.score, 52);
        assert_eq!(info.completed_trades, 1);
        assert_eq!(info.disputed_trades, 1);
        assert_eq!(info.cancelled_trades, 1);
    }

    #[test]
    fn test_score_is_clamped() {
        let trust = TrustSystem::new(98);
        let peer = PeerId::new("cd".repeat(32));
        trust.record(&peer, &trade(1), TradeOutcome::Completed);
        assert_eq!(trust.get_reputation(&peer), 100);

        let low = TrustSystem::new(1);
        low.record(&peer, &trade(2), TradeOutcome::Disputed);
        assert_eq!(low.get_reputation(&peer), 0);
        assert!(!low.check_min_reputation(&peer, 1));
    }

    #[tokio::test]
    async fn test_reputation_service_defaults_to_initial_score() {
        let trust = TrustSystem::default();
        let peer = PeerId::new("ef".repeat(32));
        assert_eq!(trust.get_score(&peer).await.unwrap(), 50);
        trust.record_outcome(&peer, &trade(9), TradeOutcome::Completed).await.unwrap();
        assert_eq!(trust.get_score(&peer).await.unwrap(), 55);
        assert_eq!(trust.get_trust_level(&peer), TrustLevel::Neutral);
    }
}
