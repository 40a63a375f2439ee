//! Collaborator seams of the trade manager.
//!
//! The manager only talks to the outside world through these traits. Every call may be
//! slow or fail; the manager wraps them in [`RetryPolicy`](crate::retry::RetryPolicy)
//! and turns exhaustion into a dispute.

use crate::{
    codec::SignedEnvelope,
    dispute::EvidenceBundle,
    error::{RejectCode, Result},
    model::{MediationCaseHandle, PeerId, TradeId, TradeOutcome, TxHandle},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryAck {
    Accepted,
    /// The peer already held this message.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryFailure {
    pub retryable: bool,
    pub code: Option<RejectCode>,
    pub reason: String,
}

impl DeliveryFailure {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            code: None,
            reason: reason.into(),
        }
    }

    /// Verdict of a peer that received the message and refused it.
    pub fn rejected(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            retryable: code == RejectCode::OutOfOrder,
            code: Some(code),
            reason: reason.into(),
        }
    }
}

/// Authenticated, at-least-once channel to the counterparty.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &PeerId, envelope: &SignedEnvelope) -> std::result::Result<DeliveryAck, DeliveryFailure>;
}

/// Bitcoin wallet of the local trader.
///
/// `request_payment` must be idempotent per trade id: a repeated call after a restart
/// returns the transaction created by the first one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn request_payment(&self, trade_id: &TradeId, amount_sats: u64, destination: &str) -> Result<TxHandle>;

    /// Resolves once a transfer of at least `amount_sats` to `destination` is seen.
    async fn watch_incoming(&self, trade_id: &TradeId, amount_sats: u64, destination: &str) -> Result<TxHandle>;

    /// Resolves once `tx` reached the configured confirmation depth.
    async fn await_confirmation(&self, tx: &TxHandle) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReputationService: Send + Sync {
    async fn get_score(&self, peer: &PeerId) -> Result<u32>;

    async fn record_outcome(&self, peer: &PeerId, trade_id: &TradeId, outcome: TradeOutcome) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn open_case(&self, trade_id: &TradeId, evidence: &EvidenceBundle) -> Result<MediationCaseHandle>;
}
