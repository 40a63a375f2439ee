use crate::model::TradeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TradeError>;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Protocol violation ({code}): {detail}")]
    ProtocolViolation { code: RejectCode, detail: String },

    #[error("Unknown trade: {0}")]
    UnknownTrade(TradeId),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("{collaborator} unavailable: {detail}")]
    CollaboratorFailure { collaborator: Collaborator, detail: String },

    #[error("Trade already exists: {0}")]
    TradeExists(TradeId),

    #[error("Invalid trade terms: {0}")]
    InvalidTerms(String),

    #[error("Insufficient reputation score: {score} (required {required})")]
    InsufficientReputation { score: u32, required: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Stable reason codes reported back to whoever initiated a rejected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    IllegalTransition,
    NotPermitted,
    OutOfOrder,
    UnexpectedSender,
    TermsMismatch,
    ConflictingRetransmission,
    WrongTrade,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::IllegalTransition => "illegal_transition",
            RejectCode::NotPermitted => "not_permitted",
            RejectCode::OutOfOrder => "out_of_order",
            RejectCode::UnexpectedSender => "unexpected_sender",
            RejectCode::TermsMismatch => "terms_mismatch",
            RejectCode::ConflictingRetransmission => "conflicting_retransmission",
            RejectCode::WrongTrade => "wrong_trade",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    Transport,
    Wallet,
    Reputation,
    Mediation,
    Persistence,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Collaborator::Transport => "transport",
            Collaborator::Wallet => "wallet",
            Collaborator::Reputation => "reputation",
            Collaborator::Mediation => "mediation",
            Collaborator::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

impl TradeError {
    pub fn violation(code: RejectCode, detail: impl Into<String>) -> Self {
        TradeError::ProtocolViolation {
            code,
            detail: detail.into(),
        }
    }

    pub fn collaborator(collaborator: Collaborator, detail: impl fmt::Display) -> Self {
        TradeError::CollaboratorFailure {
            collaborator,
            detail: detail.to_string(),
        }
    }

    /// Reason code for the initiating party, if this error is a protocol rejection.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            TradeError::ProtocolViolation { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TradeError {
    fn from(err: serde_json::Error) -> Self {
        TradeError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for TradeError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        TradeError::Signature(err.to_string())
    }
}

impl From<config::ConfigError> for TradeError {
    fn from(err: config::ConfigError) -> Self {
        TradeError::Config(err.to_string())
    }
}

impl From<std::io::Error> for TradeError {
    fn from(err: std::io::Error) -> Self {
        TradeError::Io(err.to_string())
    }
}
