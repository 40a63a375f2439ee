//! Dispute escalation gate.
//!
//! Opens at most one mediation case per trade, however many timeouts, violations or
//! complaints arrive for it. The gate only talks to the mediator; notifying the
//! counterparty is the engine's job.

use crate::{
    clock::Clock,
    error::{Collaborator, RejectCode, Result, TradeError},
    interfaces::Mediator,
    model::{AgreedTerms, DisputeReason, JournalEntry, LoggedMessage, MediationCaseHandle, TradeEntry, TradeId, TradeState},
    retry::RetryPolicy,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub message_count: usize,
    pub journal_count: usize,
    pub timezone: String,
}

/// Everything a mediator needs to judge a trade without asking either party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub trade_id: TradeId,
    pub exported_at: DateTime<Utc>,
    pub metadata: EvidenceMetadata,
    pub state: TradeState,
    pub reason: Option<DisputeReason>,
    pub terms: AgreedTerms,
    pub messages: Vec<LoggedMessage>,
    pub journal: Vec<JournalEntry>,
}

impl EvidenceBundle {
    pub fn from_entry(entry: &TradeEntry, exported_at: DateTime<Utc>) -> Self {
        Self {
            trade_id: entry.trade_id.clone(),
            exported_at,
            metadata: EvidenceMetadata {
                message_count: entry.message_log.len(),
                journal_count: entry.journal.len(),
                timezone: "UTC".to_string(),
            },
            state: entry.state,
            reason: entry.dispute.as_ref().map(|dispute| dispute.reason.clone()),
            terms: entry.terms.clone(),
            messages: entry.message_log.clone(),
            journal: entry.journal.clone(),
        }
    }
}

pub struct DisputeGate {
    mediator: Arc<dyn Mediator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cases: Mutex<HashMap<TradeId, MediationCaseHandle>>,
    in_flight: Mutex<HashMap<TradeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DisputeGate {
    pub fn new(mediator: Arc<dyn Mediator>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            mediator,
            clock,
            retry,
            cases: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a case that was opened before a restart.
    pub fn seed(&self, trade_id: &TradeId, case: MediationCaseHandle) {
        self.cases.lock().entry(trade_id.clone()).or_insert(case);
    }

    pub fn case_for(&self, trade_id: &TradeId) -> Option<MediationCaseHandle> {
        self.cases.lock().get(trade_id).cloned()
    }

    /// Drops everything held for a finished trade.
    pub fn forget(&self, trade_id: &TradeId) {
        self.cases.lock().remove(trade_id);
        self.in_flight.lock().remove(trade_id);
    }

    /// Opens the mediation case for a disputed trade, or returns the one already open.
    pub async fn escalate(&self, entry: &TradeEntry) -> Result<MediationCaseHandle> {
        if let Some(case) = entry.case() {
            self.seed(&entry.trade_id, case.clone());
            return Ok(case.clone());
        }
        if entry.dispute.is_none() {
            return Err(TradeError::violation(
                RejectCode::IllegalTransition,
                format!("Trade {} has no dispute to escalate", entry.trade_id),
            ));
        }

        let lock = Arc::clone(self.in_flight.lock().entry(entry.trade_id.clone()).or_default());
        let _guard = lock.lock().await;

        if let Some(case) = self.case_for(&entry.trade_id) {
            return Ok(case);
        }

        let evidence = EvidenceBundle::from_entry(entry, self.clock.now());
        let case = self
            .retry
            .run(
                "open_mediation_case",
                || self.mediator.open_case(&entry.trade_id, &evidence),
                |_| true,
            )
            .await
            .map_err(|e| {
                error!(trade_id = %entry.trade_id, error = %e, "Mediation escalation failed");
                TradeError::collaborator(Collaborator::Mediation, e)
            })?;

        info!(
            trade_id = %entry.trade_id,
            case_id = %case.case_id,
            messages = evidence.metadata.message_count,
            "Dispute escalated to mediation"
        );
        self.cases.lock().insert(entry.trade_id.clone(), case.clone());
        self.in_flight.lock().remove(&entry.trade_id);
        Ok(case)
    }
}
