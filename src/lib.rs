//! # PeerTrade - escrow-less peer-to-peer bitcoin trades
//!
//! Two traders settle a fiat-for-bitcoin trade by exchanging signed protocol messages.
//! Each node keeps its own ledger of the trades it takes part in.
//!
//! ## Architecture
//!
//! - **Engine**: pure state machine validating every message and local action against the trade ledger
//! - **Manager**: per-trade exclusive sections, persistence before delivery, collaborator dispatch
//! - **Supervisor**: one timer per armed deadline; an expired deadline forces the trade into dispute
//! - **Dispute gate**: escalates each disputed trade to mediation exactly once
//! - **Collaborators**: HTTP transport, bitcoind wallet, local reputation ledger, SQLite store and case book

pub mod clock;
pub mod codec;
pub mod config;
pub mod database;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod manager;
pub mod model;
pub mod retry;
pub mod settlement;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod trust;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{MessageCodec, NodeIdentity, SignedEnvelope};
pub use config::AppConfig;
pub use database::Database;
pub use dispute::{DisputeGate, EvidenceBundle};
pub use engine::{LocalAction, Outcome, SideEffect, TradeEngine, TradeEvent, Transition};
pub use error::{Collaborator, RejectCode, Result, TradeError};
pub use interfaces::{DeliveryAck, DeliveryFailure, Mediator, ReputationService, Transport, Wallet};
pub use manager::{Collaborators, InboundOutcome, ManagerSettings, TradeManager};
pub use model::{AgreedTerms, Direction, OfferAcceptance, PaymentMethod, PeerId, Role, TradeEntry, TradeId, TradeState};
pub use retry::RetryPolicy;
pub use settlement::BitcoindWallet;
pub use store::{MemoryStore, TradeStore};
pub use transport::HttpTransport;
pub use trust::{ReputationScore, TrustSystem};
