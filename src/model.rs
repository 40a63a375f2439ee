use crate::error::{Collaborator, RejectCode, Result, TradeError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type OfferId = Uuid;

const SATS_PER_BTC: u128 = 100_000_000;

/// Hex encoded Ed25519 verifying key of a trader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(String);

impl TradeId {
    /// Both traders derive the same id from the offer and the two identities.
    pub fn derive(offer_id: &OfferId, maker: &PeerId, taker: &PeerId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(offer_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(maker.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(taker.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn parse(id: &str) -> Result<Self> {
        let valid = id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(TradeError::Serialization(format!("Malformed trade id: {}", id)));
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Maker,
    Taker,
}

impl Role {
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Maker => Role::Taker,
            Role::Taker => Role::Maker,
        }
    }
}

/// Side of the offer maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buyer,
    Seller,
}

impl Direction {
    pub fn side_of(&self, role: Role) -> Side {
        match (self, role) {
            (Direction::Buy, Role::Maker) | (Direction::Sell, Role::Taker) => Side::Buyer,
            _ => Side::Seller,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Sepa,
    SepaInstant,
    Zelle,
    Revolut,
    Wise,
    Strike,
    CashByMail,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreedTerms {
    pub btc_amount_sats: u64,
    pub fiat_amount_minor: u64,
    pub price_minor_per_btc: u64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub direction: Direction,
}

impl AgreedTerms {
    pub fn new(
        btc_amount_sats: u64,
        price_minor_per_btc: u64,
        currency: impl Into<String>,
        payment_method: PaymentMethod,
        direction: Direction,
    ) -> Self {
        Self {
            btc_amount_sats,
            fiat_amount_minor: Self::fiat_for(btc_amount_sats, price_minor_per_btc),
            price_minor_per_btc,
            currency: currency.into(),
            payment_method,
            direction,
        }
    }

    /// Fiat minor units for `sats` at `price` minor units per BTC, rounded down.
    pub fn fiat_for(sats: u64, price_minor_per_btc: u64) -> u64 {
        let fiat = sats as u128 * price_minor_per_btc as u128 / SATS_PER_BTC;
        u64::try_from(fiat).unwrap_or(u64::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.btc_amount_sats == 0 {
            return Err(TradeError::InvalidTerms("BTC amount must be greater than 0".to_string()));
        }
        if self.price_minor_per_btc == 0 {
            return Err(TradeError::InvalidTerms("Price must be greater than 0".to_string()));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(TradeError::InvalidTerms(format!("Invalid currency code: {}", self.currency)));
        }
        let expected = Self::fiat_for(self.btc_amount_sats, self.price_minor_per_btc);
        if self.fiat_amount_minor != expected {
            return Err(TradeError::InvalidTerms(format!(
                "Fiat amount {} does not match price (expected {})",
                self.fiat_amount_minor, expected
            )));
        }
        if self.fiat_amount_minor == 0 {
            return Err(TradeError::InvalidTerms("Fiat amount must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    Initiated,
    TermsConfirmed,
    PaymentAccountDataExchanged,
    FiatPaymentSent,
    FiatPaymentConfirmed,
    BtcTransferInitiated,
    Completed,
    Cancelled,
    InDispute,
}

impl TradeState {
    pub const ALL: [TradeState; 9] = [
        TradeState::Initiated,
        TradeState::TermsConfirmed,
        TradeState::PaymentAccountDataExchanged,
        TradeState::FiatPaymentSent,
        TradeState::FiatPaymentConfirmed,
        TradeState::BtcTransferInitiated,
        TradeState::Completed,
        TradeState::Cancelled,
        TradeState::InDispute,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Completed | TradeState::Cancelled)
    }

    /// The deadline guarding this state, if any party is expected to act.
    pub fn deadline_kind(&self) -> Option<DeadlineKind> {
        match self {
            TradeState::Initiated => Some(DeadlineKind::TermsResponse),
            TradeState::TermsConfirmed => Some(DeadlineKind::PaymentAccountData),
            TradeState::PaymentAccountDataExchanged => Some(DeadlineKind::FiatPayment),
            TradeState::FiatPaymentSent => Some(DeadlineKind::FiatConfirmation),
            TradeState::FiatPaymentConfirmed => Some(DeadlineKind::BtcTransfer),
            TradeState::BtcTransferInitiated => Some(DeadlineKind::BtcConfirmation),
            TradeState::Completed | TradeState::Cancelled | TradeState::InDispute => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Initiated => "initiated",
            TradeState::TermsConfirmed => "terms_confirmed",
            TradeState::PaymentAccountDataExchanged => "payment_account_data_exchanged",
            TradeState::FiatPaymentSent => "fiat_payment_sent",
            TradeState::FiatPaymentConfirmed => "fiat_payment_confirmed",
            TradeState::BtcTransferInitiated => "btc_transfer_initiated",
            TradeState::Completed => "completed",
            TradeState::Cancelled => "cancelled",
            TradeState::InDispute => "in_dispute",
        }
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeState {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self> {
        TradeState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| TradeError::Serialization(format!("Invalid trade state: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    TermsResponse,
    PaymentAccountData,
    FiatPayment,
    FiatConfirmation,
    BtcTransfer,
    BtcConfirmation,
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeadlineKind::TermsResponse => "terms_response",
            DeadlineKind::PaymentAccountData => "payment_account_data",
            DeadlineKind::FiatPayment => "fiat_payment",
            DeadlineKind::FiatConfirmation => "fiat_confirmation",
            DeadlineKind::BtcTransfer => "btc_transfer",
            DeadlineKind::BtcConfirmation => "btc_confirmation",
        };
        f.write_str(name)
    }
}

/// Response windows per deadline kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlinePolicy {
    pub terms_response: Duration,
    pub payment_account_data: Duration,
    pub fiat_payment: Duration,
    pub fiat_confirmation: Duration,
    pub btc_transfer: Duration,
    pub btc_confirmation: Duration,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            terms_response: Duration::hours(1),
            payment_account_data: Duration::hours(6),
            fiat_payment: Duration::hours(24),
            fiat_confirmation: Duration::hours(24),
            btc_transfer: Duration::hours(12),
            btc_confirmation: Duration::hours(48),
        }
    }
}

impl DeadlinePolicy {
    pub fn window(&self, kind: DeadlineKind) -> Duration {
        match kind {
            DeadlineKind::TermsResponse => self.terms_response,
            DeadlineKind::PaymentAccountData => self.payment_account_data,
            DeadlineKind::FiatPayment => self.fiat_payment,
            DeadlineKind::FiatConfirmation => self.fiat_confirmation,
            DeadlineKind::BtcTransfer => self.btc_transfer,
            DeadlineKind::BtcConfirmation => self.btc_confirmation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    TakeOffer {
        offer_id: OfferId,
        maker: PeerId,
        taker: PeerId,
    },
    AcceptTerms,
    PaymentAccountData {
        account: String,
    },
    FiatPaymentSent {
        btc_address: String,
    },
    FiatPaymentConfirmed,
    Cancel {
        reason: String,
    },
    RequestMutualCancel {
        reason: String,
    },
    AcceptMutualCancel,
    OpenDispute {
        reason: String,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::TakeOffer { .. } => "take_offer",
            MessagePayload::AcceptTerms => "accept_terms",
            MessagePayload::PaymentAccountData { .. } => "payment_account_data",
            MessagePayload::FiatPaymentSent { .. } => "fiat_payment_sent",
            MessagePayload::FiatPaymentConfirmed => "fiat_payment_confirmed",
            MessagePayload::Cancel { .. } => "cancel",
            MessagePayload::RequestMutualCancel { .. } => "request_mutual_cancel",
            MessagePayload::AcceptMutualCancel => "accept_mutual_cancel",
            MessagePayload::OpenDispute { .. } => "open_dispute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub trade_id: TradeId,
    pub seq: u64,
    pub sender: PeerId,
    pub terms: AgreedTerms,
    pub payload: MessagePayload,
    pub sent_at: DateTime<Utc>,
}

impl ProtocolMessage {
    pub fn take_offer(offer_id: OfferId, maker: PeerId, taker: PeerId, terms: AgreedTerms, sent_at: DateTime<Utc>) -> Self {
        Self {
            trade_id: TradeId::derive(&offer_id, &maker, &taker),
            seq: 0,
            sender: taker.clone(),
            terms,
            payload: MessagePayload::TakeOffer { offer_id, maker, taker },
            sent_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub message: ProtocolMessage,
    pub direction: MessageDirection,
    pub accepted_at: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle {
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisputeReason {
    Complaint { by: PeerId, reason: String },
    DeadlineExceeded { kind: DeadlineKind },
    ProtocolViolation { code: RejectCode, detail: String },
    CollaboratorFailure { collaborator: Collaborator, detail: String },
}

impl fmt::Display for DisputeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisputeReason::Complaint { reason, .. } => write!(f, "complaint: {}", reason),
            DisputeReason::DeadlineExceeded { kind } => write!(f, "deadline exceeded: {}", kind),
            DisputeReason::ProtocolViolation { code, detail } => {
                write!(f, "protocol violation ({}): {}", code, detail)
            }
            DisputeReason::CollaboratorFailure { collaborator, detail } => {
                write!(f, "{} failure: {}", collaborator, detail)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediationCaseHandle {
    pub case_id: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediationOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub reason: DisputeReason,
    pub opened_at: DateTime<Utc>,
    pub case: Option<MediationCaseHandle>,
    pub resolution: Option<MediationOutcome>,
}

/// Events the engine applied that did not arrive as protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalEvent {
    TransferSeen { tx: TxHandle },
    TransferConfirmed { tx: TxHandle },
    DeadlineExpired { kind: DeadlineKind },
    ForcedDispute { reason: DisputeReason },
    MediationClosed { outcome: MediationOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Message log length when the event was applied.
    pub after_seq: u64,
    pub event: LocalEvent,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    Completed,
    Cancelled,
    Disputed,
}

/// Offer acceptance as seen from the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAcceptance {
    pub offer_id: OfferId,
    pub maker: PeerId,
    pub taker: PeerId,
    pub role: Role,
    pub terms: AgreedTerms,
}

impl OfferAcceptance {
    pub fn trade_id(&self) -> TradeId {
        TradeId::derive(&self.offer_id, &self.maker, &self.taker)
    }
}

/// Trade ledger entry: immutable identity plus the mutable protocol state of one trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEntry {
    pub trade_id: TradeId,
    pub offer_id: OfferId,
    pub role: Role,
    pub me: PeerId,
    pub peer: PeerId,
    pub terms: AgreedTerms,
    pub origin: ProtocolMessage,
    pub state: TradeState,
    pub message_log: Vec<LoggedMessage>,
    pub journal: Vec<JournalEntry>,
    pub deadlines: BTreeMap<DeadlineKind, DateTime<Utc>>,
    pub dispute_flag: bool,
    pub dispute: Option<DisputeRecord>,
    pub payment_account: Option<String>,
    pub btc_address: Option<String>,
    pub settlement_tx: Option<TxHandle>,
    pub mutual_cancel_requested_by: Option<PeerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeEntry {
    /// Builds an `Initiated` entry from the take-offer message that opened the trade.
    pub fn from_origin(role: Role, origin: ProtocolMessage, created_at: DateTime<Utc>) -> Result<Self> {
        let (offer_id, maker, taker) = match &origin.payload {
            MessagePayload::TakeOffer { offer_id, maker, taker } => (*offer_id, maker.clone(), taker.clone()),
            other => {
                return Err(TradeError::violation(
                    RejectCode::IllegalTransition,
                    format!("Trade must start with take_offer, got {}", other.kind()),
                ))
            }
        };
        if maker == taker {
            return Err(TradeError::InvalidTerms("Maker and taker must differ".to_string()));
        }
        if origin.trade_id != TradeId::derive(&offer_id, &maker, &taker) {
            return Err(TradeError::violation(RejectCode::WrongTrade, "Trade id does not match offer and parties"));
        }
        if origin.sender != taker {
            return Err(TradeError::violation(RejectCode::UnexpectedSender, "Take-offer must be sent by the taker"));
        }
        origin.terms.validate()?;

        let (me, peer) = match role {
            Role::Maker => (maker, taker),
            Role::Taker => (taker, maker),
        };

        Ok(Self {
            trade_id: origin.trade_id.clone(),
            offer_id,
            role,
            me,
            peer,
            terms: origin.terms.clone(),
            origin,
            state: TradeState::Initiated,
            message_log: Vec::new(),
            journal: Vec::new(),
            deadlines: BTreeMap::new(),
            dispute_flag: false,
            dispute: None,
            payment_account: None,
            btc_address: None,
            settlement_tx: None,
            mutual_cancel_requested_by: None,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.message_log.len() as u64 + 1
    }

    pub fn logged(&self, seq: u64) -> Option<&LoggedMessage> {
        seq.checked_sub(1).and_then(|idx| self.message_log.get(idx as usize))
    }

    pub fn side(&self) -> Side {
        self.terms.direction.side_of(self.role)
    }

    pub fn side_of(&self, party: &PeerId) -> Option<(Role, Side)> {
        let role = if *party == self.me {
            self.role
        } else if *party == self.peer {
            self.role.counterpart()
        } else {
            return None;
        };
        Some((role, self.terms.direction.side_of(role)))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Outbound messages accepted locally but not yet acknowledged by the transport.
    pub fn undelivered(&self) -> impl Iterator<Item = &LoggedMessage> {
        self.message_log
            .iter()
            .filter(|logged| logged.direction == MessageDirection::Outbound && !logged.delivered)
    }

    pub fn case(&self) -> Option<&MediationCaseHandle> {
        self.dispute.as_ref().and_then(|dispute| dispute.case.as_ref())
    }

    /// An armed deadline that has already passed at `now`.
    pub fn overdue_deadline(&self, now: DateTime<Utc>) -> Option<(DeadlineKind, DateTime<Utc>)> {
        self.deadlines
            .iter()
            .find(|(_, expires_at)| **expires_at <= now)
            .map(|(kind, expires_at)| (*kind, *expires_at))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn maker() -> PeerId {
        PeerId::new("aa".repeat(32))
    }

    pub fn taker() -> PeerId {
        PeerId::new("bb".repeat(32))
    }

    /// 0.01 BTC at 60,000.00 EUR.
    pub fn terms(direction: Direction) -> AgreedTerms {
        AgreedTerms::new(1_000_000, 6_000_000, "EUR", PaymentMethod::Sepa, direction)
    }

    pub fn origin(direction: Direction, at: DateTime<Utc>) -> ProtocolMessage {
        let offer_id = Uuid::from_u128(0x1234);
        ProtocolMessage::take_offer(offer_id, maker(), taker(), terms(direction), at)
    }

    pub fn entry(role: Role, direction: Direction, at: DateTime<Utc>) -> TradeEntry {
        TradeEntry::from_origin(role, origin(direction, at), at).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_trade_id_is_deterministic() {
        let offer_id = Uuid::new_v4();
        let a = TradeId::derive(&offer_id, &maker(), &taker());
        let b = TradeId::derive(&offer_id, &maker(), &taker());
        let swapped = TradeId::derive(&offer_id, &taker(), &maker());
        assert_eq!(a, b);
        assert_ne!(a, swapped);
        assert_eq!(TradeId::parse(a.as_str()).unwrap(), a);
        assert!(TradeId::parse("not-a-trade").is_err());
    }

    #[test]
    fn test_terms_validation() {
        let terms = terms(Direction::Sell);
        assert_eq!(terms.fiat_amount_minor, 60_000);
        assert!(terms.validate().is_ok());

        let mut bad = terms.clone();
        bad.fiat_amount_minor += 1;
        assert!(bad.validate().is_err());

        let mut bad = terms.clone();
        bad.currency = "euro".to_string();
        assert!(bad.validate().is_err());

        let mut bad = terms;
        bad.btc_amount_sats = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_sides_follow_direction() {
        assert_eq!(Direction::Sell.side_of(Role::Maker), Side::Seller);
        assert_eq!(Direction::Sell.side_of(Role::Taker), Side::Buyer);
        assert_eq!(Direction::Buy.side_of(Role::Maker), Side::Buyer);
        assert_eq!(Direction::Buy.side_of(Role::Taker), Side::Seller);
    }

    #[test]
    fn test_entry_from_origin() {
        let now = Utc::now();
        let entry = entry(Role::Taker, Direction::Sell, now);
        assert_eq!(entry.state, TradeState::Initiated);
        assert_eq!(entry.me, taker());
        assert_eq!(entry.peer, maker());
        assert_eq!(entry.side(), Side::Buyer);
        assert_eq!(entry.next_seq(), 1);
        assert!(entry.logged(0).is_none());
        assert_eq!(entry.side_of(&maker()), Some((Role::Maker, Side::Seller)));
    }

    #[test]
    fn test_origin_must_be_take_offer_from_taker() {
        let now = Utc::now();
        let mut origin = origin(Direction::Sell, now);
        origin.sender = maker();
        assert!(TradeEntry::from_origin(Role::Maker, origin, now).is_err());
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in TradeState::ALL {
            assert_eq!(state.as_str().parse::<TradeState>().unwrap(), state);
        }
        assert!("bogus".parse::<TradeState>().is_err());
    }
}
