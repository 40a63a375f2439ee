//! Trade protocol state machine.
//!
//! [`TradeEngine::apply`] is pure: it takes the committed entry and one event and returns
//! either a complete [`Transition`] (new entry, outbound messages, side-effect
//! descriptors) or a [`Rejection`]. Nothing is mutated on rejection, and nothing is
//! performed against collaborators here; the trade manager persists the new entry and
//! then executes the returned effects.
//!
//! Legal moves are enumerated in [`transition_target`]. Non-message events (wallet
//! progress, timeouts, forced disputes, mediation verdicts) go to the entry's journal
//! so [`TradeEngine::replay`] can rebuild the state from the log alone.

use crate::{
    error::{Collaborator, RejectCode, TradeError},
    model::*,
};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    Inbound(ProtocolMessage),
    Local(LocalAction),
    Timeout {
        kind: DeadlineKind,
        expires_at: DateTime<Utc>,
    },
    Settlement(SettlementUpdate),
    CollaboratorExhausted {
        collaborator: Collaborator,
        detail: String,
    },
    Delivered {
        seq: u64,
    },
    Escalated {
        case: MediationCaseHandle,
    },
    MediationClosed {
        outcome: MediationOutcome,
    },
}

/// Protocol actions taken by the trader operating this node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LocalAction {
    AcceptTerms,
    SendPaymentAccountData { account: String },
    ConfirmFiatSent { btc_address: String },
    ConfirmFiatReceived,
    Cancel { reason: String },
    RequestMutualCancel { reason: String },
    AcceptMutualCancel,
    OpenDispute { reason: String },
}

impl LocalAction {
    fn into_payload(self) -> MessagePayload {
        match self {
            LocalAction::AcceptTerms => MessagePayload::AcceptTerms,
            LocalAction::SendPaymentAccountData { account } => MessagePayload::PaymentAccountData { account },
            LocalAction::ConfirmFiatSent { btc_address } => MessagePayload::FiatPaymentSent { btc_address },
            LocalAction::ConfirmFiatReceived => MessagePayload::FiatPaymentConfirmed,
            LocalAction::Cancel { reason } => MessagePayload::Cancel { reason },
            LocalAction::RequestMutualCancel { reason } => MessagePayload::RequestMutualCancel { reason },
            LocalAction::AcceptMutualCancel => MessagePayload::AcceptMutualCancel,
            LocalAction::OpenDispute { reason } => MessagePayload::OpenDispute { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementUpdate {
    TransferSeen { tx: TxHandle },
    TransferConfirmed { tx: TxHandle },
}

/// Work the trade manager performs against collaborators after committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    RequestBtcTransfer { amount_sats: u64, destination: String },
    WatchIncomingTransfer { amount_sats: u64, destination: String },
    AwaitConfirmation { tx: TxHandle },
    RecordOutcome { peer: PeerId, outcome: TradeOutcome },
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Transitioned { from: TradeState, to: TradeState },
    /// Accepted and logged without a state change.
    Recorded,
    /// Harmless retransmission of an already logged message.
    Acknowledged { seq: u64 },
    /// Deadline no longer guards the current state.
    Stale,
    Disputed { from: TradeState, reason: DisputeReason },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub entry: TradeEntry,
    pub outcome: Outcome,
    pub outbound: Vec<ProtocolMessage>,
    pub effects: Vec<SideEffect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: RejectCode,
    pub detail: String,
}

impl Rejection {
    fn new(code: RejectCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    fn illegal(payload: &MessagePayload, state: TradeState) -> Self {
        Self::new(
            RejectCode::IllegalTransition,
            format!("{} is not allowed in state {}", payload.kind(), state),
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl From<Rejection> for TradeError {
    fn from(rejection: Rejection) -> Self {
        TradeError::ProtocolViolation {
            code: rejection.code,
            detail: rejection.detail,
        }
    }
}

#[derive(Default)]
struct Emitted {
    outbound: Vec<ProtocolMessage>,
    effects: Vec<SideEffect>,
}

/// State a message moves the trade to, or why it may not be applied.
pub fn transition_target(entry: &TradeEntry, sender: &PeerId, payload: &MessagePayload) -> Result<TradeState, Rejection> {
    use MessagePayload as P;
    use TradeState::*;

    let (role, side) = entry
        .side_of(sender)
        .ok_or_else(|| Rejection::new(RejectCode::UnexpectedSender, format!("{} is not a party to this trade", sender)))?;
    let permit = |allowed: bool, to: TradeState, who: &str| {
        if allowed {
            Ok(to)
        } else {
            Err(Rejection::new(
                RejectCode::NotPermitted,
                format!("only the {} may send {} in state {}", who, payload.kind(), entry.state),
            ))
        }
    };

    match (payload, entry.state) {
        (P::AcceptTerms, Initiated) => permit(role == Role::Maker, TermsConfirmed, "maker"),
        (P::PaymentAccountData { .. }, TermsConfirmed) => {
            permit(side == Side::Seller, PaymentAccountDataExchanged, "seller")
        }
        (P::FiatPaymentSent { .. }, PaymentAccountDataExchanged) => permit(side == Side::Buyer, FiatPaymentSent, "buyer"),
        (P::FiatPaymentConfirmed, FiatPaymentSent) => permit(side == Side::Seller, FiatPaymentConfirmed, "seller"),
        (P::Cancel { .. }, Initiated | TermsConfirmed) => Ok(Cancelled),
        // The buyer may already be paying once account data is out, so the seller cannot walk away.
        (P::Cancel { .. }, PaymentAccountDataExchanged) => permit(side == Side::Buyer, Cancelled, "buyer"),
        (P::RequestMutualCancel { .. }, FiatPaymentSent) => match &entry.mutual_cancel_requested_by {
            None => Ok(FiatPaymentSent),
            Some(_) => Err(Rejection::new(RejectCode::IllegalTransition, "mutual cancellation already requested")),
        },
        (P::AcceptMutualCancel, FiatPaymentSent) => match &entry.mutual_cancel_requested_by {
            Some(requester) if requester != sender => Ok(Cancelled),
            Some(_) => Err(Rejection::new(RejectCode::NotPermitted, "cannot accept own cancellation request")),
            None => Err(Rejection::new(RejectCode::IllegalTransition, "no mutual cancellation pending")),
        },
        (P::OpenDispute { .. }, state) if !state.is_terminal() => Ok(InDispute),
        (payload, state) => Err(Rejection::illegal(payload, state)),
    }
}

fn terms_diff(expected: &AgreedTerms, declared: &AgreedTerms) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if expected.btc_amount_sats != declared.btc_amount_sats {
        fields.push("btc_amount_sats");
    }
    if expected.fiat_amount_minor != declared.fiat_amount_minor {
        fields.push("fiat_amount_minor");
    }
    if expected.price_minor_per_btc != declared.price_minor_per_btc {
        fields.push("price_minor_per_btc");
    }
    if expected.currency != declared.currency {
        fields.push("currency");
    }
    if expected.payment_method != declared.payment_method {
        fields.push("payment_method");
    }
    if expected.direction != declared.direction {
        fields.push("direction");
    }
    fields
}

#[derive(Debug, Clone, Default)]
pub struct TradeEngine {
    policy: DeadlinePolicy,
}

impl TradeEngine {
    pub fn new(policy: DeadlinePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DeadlinePolicy {
        &self.policy
    }

    /// Arms the deadline of the initial state on a freshly created entry.
    pub fn initialize(&self, entry: &mut TradeEntry) {
        entry.deadlines.clear();
        if let Some(kind) = entry.state.deadline_kind() {
            entry.deadlines.insert(kind, entry.created_at + self.policy.window(kind));
        }
    }

    pub fn apply(&self, entry: &TradeEntry, event: TradeEvent, now: DateTime<Utc>) -> Result<Transition, Rejection> {
        let mut next = entry.clone();
        let mut out = Emitted::default();

        let outcome = match event {
            TradeEvent::Inbound(message) => self.on_inbound(&mut next, message, now, &mut out)?,
            TradeEvent::Local(action) => self.emit(&mut next, action.into_payload(), now, &mut out)?,
            TradeEvent::Timeout { kind, expires_at } => self.on_timeout(&mut next, kind, expires_at, now, &mut out)?,
            TradeEvent::Settlement(SettlementUpdate::TransferSeen { tx }) => {
                self.apply_local_event(&mut next, LocalEvent::TransferSeen { tx }, now, &mut out)?
            }
            TradeEvent::Settlement(SettlementUpdate::TransferConfirmed { tx }) => {
                self.apply_local_event(&mut next, LocalEvent::TransferConfirmed { tx }, now, &mut out)?
            }
            TradeEvent::CollaboratorExhausted { collaborator, detail } => {
                if next.state == TradeState::InDispute || next.is_terminal() {
                    Outcome::Stale
                } else {
                    self.dispute(&mut next, DisputeReason::CollaboratorFailure { collaborator, detail }, now, &mut out)?
                }
            }
            TradeEvent::Delivered { seq } => {
                let logged = seq
                    .checked_sub(1)
                    .and_then(|idx| next.message_log.get_mut(idx as usize))
                    .filter(|logged| logged.direction == MessageDirection::Outbound)
                    .ok_or_else(|| Rejection::new(RejectCode::IllegalTransition, format!("no outbound message {}", seq)))?;
                logged.delivered = true;
                Outcome::Recorded
            }
            TradeEvent::Escalated { case } => {
                let dispute = next
                    .dispute
                    .as_mut()
                    .ok_or_else(|| Rejection::new(RejectCode::IllegalTransition, "trade has no open dispute"))?;
                if dispute.case.is_none() {
                    dispute.case = Some(case);
                }
                next.dispute_flag = true;
                Outcome::Recorded
            }
            TradeEvent::MediationClosed { outcome } => {
                self.apply_local_event(&mut next, LocalEvent::MediationClosed { outcome }, now, &mut out)?
            }
        };

        if next != *entry {
            next.updated_at = now;
        }

        Ok(Transition {
            entry: next,
            outcome,
            outbound: out.outbound,
            effects: out.effects,
        })
    }

    /// Collaborator work a restarted node must re-issue for the entry's current state.
    pub fn pending_effects(&self, entry: &TradeEntry) -> Vec<SideEffect> {
        let amount_sats = entry.terms.btc_amount_sats;
        match entry.state {
            TradeState::FiatPaymentConfirmed => match (entry.side(), entry.btc_address.clone()) {
                (Side::Seller, Some(destination)) => vec![SideEffect::RequestBtcTransfer { amount_sats, destination }],
                (Side::Buyer, Some(destination)) => vec![SideEffect::WatchIncomingTransfer { amount_sats, destination }],
                _ => Vec::new(),
            },
            TradeState::BtcTransferInitiated => entry
                .settlement_tx
                .clone()
                .map(|tx| vec![SideEffect::AwaitConfirmation { tx }])
                .unwrap_or_default(),
            TradeState::InDispute if !entry.dispute_flag => vec![SideEffect::Escalate],
            _ => Vec::new(),
        }
    }

    /// Rebuilds the entry from its origin, message log and journal.
    pub fn replay(&self, entry: &TradeEntry) -> Result<TradeEntry, TradeError> {
        let mut fresh = TradeEntry::from_origin(entry.role, entry.origin.clone(), entry.created_at)?;
        self.initialize(&mut fresh);
        let mut sink = Emitted::default();
        let mut journal = entry.journal.iter().peekable();

        for logged in &entry.message_log {
            while let Some(local) = journal.next_if(|local| local.after_seq < logged.message.seq) {
                self.apply_local_event(&mut fresh, local.event.clone(), local.at, &mut sink)?;
            }
            if logged.message.seq != fresh.next_seq() {
                return Err(TradeError::violation(
                    RejectCode::OutOfOrder,
                    format!("log holds seq {} at position {}", logged.message.seq, fresh.next_seq()),
                ));
            }
            let to = transition_target(&fresh, &logged.message.sender, &logged.message.payload)?;
            self.commit_message(&mut fresh, logged.message.clone(), logged.direction, to, logged.accepted_at, &mut sink);
        }
        for local in journal {
            self.apply_local_event(&mut fresh, local.event.clone(), local.at, &mut sink)?;
        }
        Ok(fresh)
    }

    fn on_inbound(
        &self,
        next: &mut TradeEntry,
        message: ProtocolMessage,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        if message.trade_id != next.trade_id {
            return Err(Rejection::new(RejectCode::WrongTrade, format!("message for trade {}", message.trade_id)));
        }
        if message.sender != next.peer {
            return Err(Rejection::new(
                RejectCode::UnexpectedSender,
                format!("{} is not the counterparty", message.sender),
            ));
        }

        let expected = next.next_seq();
        if message.seq == 0 {
            if message == next.origin {
                return Ok(Outcome::Acknowledged { seq: 0 });
            }
            return self.violation(next, RejectCode::ConflictingRetransmission, "take-offer differs from the one that opened the trade", now, out);
        }
        if message.seq < expected {
            let identical = next
                .logged(message.seq)
                .map(|logged| logged.message == message)
                .unwrap_or(false);
            if identical {
                debug!(trade_id = %next.trade_id, seq = message.seq, "Duplicate message acknowledged");
                return Ok(Outcome::Acknowledged { seq: message.seq });
            }
            let detail = format!("seq {} differs from the logged message", message.seq);
            return self.violation(next, RejectCode::ConflictingRetransmission, detail, now, out);
        }
        if message.seq > expected {
            return Err(Rejection::new(
                RejectCode::OutOfOrder,
                format!("expected seq {}, got {}", expected, message.seq),
            ));
        }

        let mismatched = terms_diff(&next.terms, &message.terms);
        if !mismatched.is_empty() {
            let detail = format!("declared terms differ in {}", mismatched.join(", "));
            return self.violation(next, RejectCode::TermsMismatch, detail, now, out);
        }

        let to = transition_target(next, &message.sender, &message.payload)?;
        Ok(self.commit_message(next, message, MessageDirection::Inbound, to, now, out))
    }

    fn on_timeout(
        &self,
        next: &mut TradeEntry,
        kind: DeadlineKind,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        if next.deadlines.get(&kind) != Some(&expires_at) {
            debug!(trade_id = %next.trade_id, %kind, "Ignoring stale deadline");
            return Ok(Outcome::Stale);
        }
        let from = next.state;
        self.apply_local_event(next, LocalEvent::DeadlineExpired { kind }, now, out)?;
        let reason = DisputeReason::DeadlineExceeded { kind };
        self.emit(next, MessagePayload::OpenDispute { reason: reason.to_string() }, now, out)?;
        Ok(Outcome::Disputed { from, reason })
    }

    /// Forces a dispute for a peer violation, or rejects it once a dispute is already open.
    fn violation(
        &self,
        next: &mut TradeEntry,
        code: RejectCode,
        detail: impl Into<String>,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        let detail = detail.into();
        if next.state == TradeState::InDispute || next.is_terminal() {
            return Err(Rejection::new(code, detail));
        }
        warn!(trade_id = %next.trade_id, %code, %detail, "Protocol violation, opening dispute");
        self.dispute(next, DisputeReason::ProtocolViolation { code, detail }, now, out)
    }

    fn dispute(
        &self,
        next: &mut TradeEntry,
        reason: DisputeReason,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        let from = next.state;
        self.apply_local_event(next, LocalEvent::ForcedDispute { reason: reason.clone() }, now, out)?;
        self.emit(next, MessagePayload::OpenDispute { reason: reason.to_string() }, now, out)?;
        Ok(Outcome::Disputed { from, reason })
    }

    /// Appends a message from this node to the log and queues it for delivery.
    fn emit(
        &self,
        next: &mut TradeEntry,
        payload: MessagePayload,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        let message = ProtocolMessage {
            trade_id: next.trade_id.clone(),
            seq: next.next_seq(),
            sender: next.me.clone(),
            terms: next.terms.clone(),
            payload,
            sent_at: now,
        };
        let to = transition_target(next, &message.sender, &message.payload)?;
        out.outbound.push(message.clone());
        Ok(self.commit_message(next, message, MessageDirection::Outbound, to, now, out))
    }

    fn commit_message(
        &self,
        next: &mut TradeEntry,
        message: ProtocolMessage,
        direction: MessageDirection,
        to: TradeState,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Outcome {
        match &message.payload {
            MessagePayload::PaymentAccountData { account } => next.payment_account = Some(account.clone()),
            MessagePayload::FiatPaymentSent { btc_address } => next.btc_address = Some(btc_address.clone()),
            MessagePayload::RequestMutualCancel { .. } => {
                next.mutual_cancel_requested_by = Some(message.sender.clone());
            }
            MessagePayload::OpenDispute { reason } => {
                if next.dispute.is_none() {
                    next.dispute = Some(DisputeRecord {
                        reason: DisputeReason::Complaint {
                            by: message.sender.clone(),
                            reason: reason.clone(),
                        },
                        opened_at: now,
                        case: None,
                        resolution: None,
                    });
                }
            }
            _ => {}
        }
        debug!(
            trade_id = %next.trade_id,
            seq = message.seq,
            kind = message.payload.kind(),
            ?direction,
            "Message accepted"
        );
        next.message_log.push(LoggedMessage {
            message,
            direction,
            accepted_at: now,
            delivered: direction == MessageDirection::Inbound,
        });
        self.enter(next, to, now, out)
    }

    fn apply_local_event(
        &self,
        next: &mut TradeEntry,
        event: LocalEvent,
        now: DateTime<Utc>,
        out: &mut Emitted,
    ) -> Result<Outcome, Rejection> {
        let illegal = |what: &str, state: TradeState| {
            Rejection::new(RejectCode::IllegalTransition, format!("{} is not allowed in state {}", what, state))
        };

        let to = match &event {
            LocalEvent::TransferSeen { tx } => {
                if next.state != TradeState::FiatPaymentConfirmed {
                    return Err(illegal("transfer_seen", next.state));
                }
                next.settlement_tx = Some(tx.clone());
                out.effects.push(SideEffect::AwaitConfirmation { tx: tx.clone() });
                TradeState::BtcTransferInitiated
            }
            LocalEvent::TransferConfirmed { tx } => {
                if next.state != TradeState::BtcTransferInitiated {
                    return Err(illegal("transfer_confirmed", next.state));
                }
                if next.settlement_tx.as_ref() != Some(tx) {
                    return Err(Rejection::new(
                        RejectCode::WrongTrade,
                        format!("transaction {} does not belong to this trade", tx.txid),
                    ));
                }
                TradeState::Completed
            }
            LocalEvent::DeadlineExpired { kind } => {
                if next.state == TradeState::InDispute || next.is_terminal() {
                    return Err(illegal("deadline_expired", next.state));
                }
                open_dispute_record(next, DisputeReason::DeadlineExceeded { kind: *kind }, now);
                TradeState::InDispute
            }
            LocalEvent::ForcedDispute { reason } => {
                if next.state == TradeState::InDispute || next.is_terminal() {
                    return Err(illegal("forced_dispute", next.state));
                }
                open_dispute_record(next, reason.clone(), now);
                TradeState::InDispute
            }
            LocalEvent::MediationClosed { outcome } => {
                if next.state != TradeState::InDispute {
                    return Err(illegal("mediation_closed", next.state));
                }
                if let Some(dispute) = next.dispute.as_mut() {
                    dispute.resolution = Some(*outcome);
                }
                match outcome {
                    MediationOutcome::Completed => TradeState::Completed,
                    MediationOutcome::Cancelled => TradeState::Cancelled,
                }
            }
        };

        next.journal.push(JournalEntry {
            after_seq: next.message_log.len() as u64,
            event,
            at: now,
        });
        Ok(self.enter(next, to, now, out))
    }

    fn enter(&self, next: &mut TradeEntry, to: TradeState, now: DateTime<Utc>, out: &mut Emitted) -> Outcome {
        let from = next.state;
        if from == to {
            return Outcome::Recorded;
        }

        next.state = to;
        next.deadlines.clear();
        if let Some(kind) = to.deadline_kind() {
            next.deadlines.insert(kind, now + self.policy.window(kind));
        }

        match to {
            TradeState::FiatPaymentConfirmed => {
                if let Some(destination) = next.btc_address.clone() {
                    let amount_sats = next.terms.btc_amount_sats;
                    out.effects.push(match next.side() {
                        Side::Seller => SideEffect::RequestBtcTransfer { amount_sats, destination },
                        Side::Buyer => SideEffect::WatchIncomingTransfer { amount_sats, destination },
                    });
                }
            }
            TradeState::InDispute => out.effects.push(SideEffect::Escalate),
            TradeState::Completed | TradeState::Cancelled => {
                let outcome = match (from, to) {
                    (TradeState::InDispute, _) => TradeOutcome::Disputed,
                    (_, TradeState::Completed) => TradeOutcome::Completed,
                    _ => TradeOutcome::Cancelled,
                };
                out.effects.push(SideEffect::RecordOutcome {
                    peer: next.peer.clone(),
                    outcome,
                });
            }
            _ => {}
        }

        info!(trade_id = %next.trade_id, %from, %to, "Trade state changed");
        Outcome::Transitioned { from, to }
    }
}

fn open_dispute_record(next: &mut TradeEntry, reason: DisputeReason, now: DateTime<Utc>) {
    if next.dispute.is_none() {
        next.dispute = Some(DisputeRecord {
            reason,
            opened_at: now,
            case: None,
            resolution: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{self, maker, taker};
    use chrono::Duration;

    fn engine() -> TradeEngine {
        TradeEngine::new(DeadlinePolicy::default())
    }

    fn start(role: Role, direction: Direction) -> (TradeEngine, TradeEntry, DateTime<Utc>) {
        let now = Utc::now();
        let engine = engine();
        let mut entry = fixtures::entry(role, direction, now);
        engine.initialize(&mut entry);
        (engine, entry, now)
    }

    fn message(entry: &TradeEntry, seq: u64, sender: PeerId, payload: MessagePayload, at: DateTime<Utc>) -> ProtocolMessage {
        ProtocolMessage {
            trade_id: entry.trade_id.clone(),
            seq,
            sender,
            terms: entry.terms.clone(),
            payload,
            sent_at: at,
        }
    }

    fn apply(engine: &TradeEngine, entry: &TradeEntry, event: TradeEvent, now: DateTime<Utc>) -> Transition {
        engine.apply(entry, event, now).unwrap()
    }

    /// Taker is the buyer: maker sells BTC.
    fn through_fiat_sent(engine: &TradeEngine, entry: TradeEntry, now: DateTime<Utc>) -> TradeEntry {
        let accept = message(&entry, 1, maker(), MessagePayload::AcceptTerms, now);
        let entry = apply(engine, &entry, TradeEvent::Inbound(accept), now).entry;
        let account = MessagePayload::PaymentAccountData { account: "IBAN DE00 1234".to_string() };
        let account = message(&entry, 2, maker(), account, now);
        let entry = apply(engine, &entry, TradeEvent::Inbound(account), now).entry;
        let sent = LocalAction::ConfirmFiatSent { btc_address: "bc1qbuyer".to_string() };
        apply(engine, &entry, TradeEvent::Local(sent), now).entry
    }

    #[test]
    fn test_happy_path_as_buyer() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        assert_eq!(entry.deadlines.len(), 1);

        let entry = through_fiat_sent(&engine, entry, now);
        assert_eq!(entry.state, TradeState::FiatPaymentSent);
        assert_eq!(
            entry.deadlines.get(&DeadlineKind::FiatConfirmation),
            Some(&(now + Duration::hours(24)))
        );

        let confirm = message(&entry, 4, maker(), MessagePayload::FiatPaymentConfirmed, now);
        let t = apply(&engine, &entry, TradeEvent::Inbound(confirm), now);
        assert_eq!(t.entry.state, TradeState::FiatPaymentConfirmed);
        assert_eq!(
            t.effects,
            vec![SideEffect::WatchIncomingTransfer {
                amount_sats: 1_000_000,
                destination: "bc1qbuyer".to_string()
            }]
        );

        let tx = TxHandle { txid: "ab".repeat(32) };
        let t = apply(&engine, &t.entry, TradeEvent::Settlement(SettlementUpdate::TransferSeen { tx: tx.clone() }), now);
        assert_eq!(t.entry.state, TradeState::BtcTransferInitiated);
        assert_eq!(t.effects, vec![SideEffect::AwaitConfirmation { tx: tx.clone() }]);

        let t = apply(&engine, &t.entry, TradeEvent::Settlement(SettlementUpdate::TransferConfirmed { tx }), now);
        assert_eq!(t.entry.state, TradeState::Completed);
        assert!(t.entry.deadlines.is_empty());
        assert_eq!(
            t.effects,
            vec![SideEffect::RecordOutcome {
                peer: maker(),
                outcome: TradeOutcome::Completed
            }]
        );

        let seqs: Vec<u64> = t.entry.message_log.iter().map(|l| l.message.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(engine.replay(&t.entry).unwrap().state, TradeState::Completed);
    }

    #[test]
    fn test_seller_requests_wallet_transfer_on_confirmation() {
        let (engine, entry, now) = start(Role::Maker, Direction::Sell);
        let t = apply(&engine, &entry, TradeEvent::Local(LocalAction::AcceptTerms), now);
        assert_eq!(t.outbound.len(), 1);
        assert_eq!(t.outbound[0].seq, 1);

        let account = LocalAction::SendPaymentAccountData { account: "IBAN".to_string() };
        let entry = apply(&engine, &t.entry, TradeEvent::Local(account), now).entry;
        let sent = MessagePayload::FiatPaymentSent { btc_address: "bc1qbuyer".to_string() };
        let sent = message(&entry, 3, taker(), sent, now);
        let entry = apply(&engine, &entry, TradeEvent::Inbound(sent), now).entry;

        let t = apply(&engine, &entry, TradeEvent::Local(LocalAction::ConfirmFiatReceived), now);
        assert_eq!(t.entry.state, TradeState::FiatPaymentConfirmed);
        assert_eq!(
            t.effects,
            vec![SideEffect::RequestBtcTransfer {
                amount_sats: 1_000_000,
                destination: "bc1qbuyer".to_string()
            }]
        );
        assert_eq!(t.outbound[0].payload, MessagePayload::FiatPaymentConfirmed);
    }

    #[test]
    fn test_duplicate_is_acknowledged_without_change() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let accept = message(&entry, 1, maker(), MessagePayload::AcceptTerms, now);
        let first = apply(&engine, &entry, TradeEvent::Inbound(accept.clone()), now);
        let second = apply(&engine, &first.entry, TradeEvent::Inbound(accept), now + Duration::minutes(5));

        assert_eq!(second.outcome, Outcome::Acknowledged { seq: 1 });
        assert_eq!(second.entry, first.entry);
        assert!(second.outbound.is_empty());
    }

    #[test]
    fn test_conflicting_retransmission_forces_dispute() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let accept = message(&entry, 1, maker(), MessagePayload::AcceptTerms, now);
        let entry = apply(&engine, &entry, TradeEvent::Inbound(accept), now).entry;

        let forged = message(&entry, 1, maker(), MessagePayload::Cancel { reason: "nope".to_string() }, now);
        let t = apply(&engine, &entry, TradeEvent::Inbound(forged), now);
        assert!(matches!(
            t.outcome,
            Outcome::Disputed {
                reason: DisputeReason::ProtocolViolation {
                    code: RejectCode::ConflictingRetransmission,
                    ..
                },
                ..
            }
        ));
        assert_eq!(t.entry.state, TradeState::InDispute);
        assert!(t.effects.contains(&SideEffect::Escalate));
        assert!(matches!(t.outbound[0].payload, MessagePayload::OpenDispute { .. }));
        assert_eq!(t.outbound[0].seq, 2);
    }

    #[test]
    fn test_any_terms_mismatch_forces_dispute() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let mutations: Vec<fn(&mut AgreedTerms)> = vec![
            |t| t.btc_amount_sats += 1,
            |t| t.fiat_amount_minor += 1,
            |t| t.price_minor_per_btc += 1,
            |t| t.currency = "USD".to_string(),
            |t| t.payment_method = PaymentMethod::Zelle,
            |t| t.direction = Direction::Buy,
        ];

        for mutate in mutations {
            let mut accept = message(&entry, 1, maker(), MessagePayload::AcceptTerms, now);
            mutate(&mut accept.terms);
            let t = apply(&engine, &entry, TradeEvent::Inbound(accept), now);
            assert_eq!(t.entry.state, TradeState::InDispute);
            assert!(matches!(
                t.entry.dispute.as_ref().map(|d| &d.reason),
                Some(DisputeReason::ProtocolViolation {
                    code: RejectCode::TermsMismatch,
                    ..
                })
            ));
            assert_eq!(t.entry.terms, entry.terms);
        }
    }

    #[test]
    fn test_illegal_transition_is_rejected_not_queued() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let confirm = message(&entry, 1, maker(), MessagePayload::FiatPaymentConfirmed, now);
        let err = engine.apply(&entry, TradeEvent::Inbound(confirm), now).unwrap_err();
        assert_eq!(err.code, RejectCode::IllegalTransition);
    }

    #[test]
    fn test_gap_in_sequence_is_rejected() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let ahead = message(&entry, 2, maker(), MessagePayload::AcceptTerms, now);
        let err = engine.apply(&entry, TradeEvent::Inbound(ahead), now).unwrap_err();
        assert_eq!(err.code, RejectCode::OutOfOrder);
    }

    #[test]
    fn test_only_counterparty_may_send() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let own = message(&entry, 1, taker(), MessagePayload::AcceptTerms, now);
        let err = engine.apply(&entry, TradeEvent::Inbound(own), now).unwrap_err();
        assert_eq!(err.code, RejectCode::UnexpectedSender);
    }

    #[test]
    fn test_taker_cannot_accept_terms() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let err = engine
            .apply(&entry, TradeEvent::Local(LocalAction::AcceptTerms), now)
            .unwrap_err();
        assert_eq!(err.code, RejectCode::NotPermitted);
    }

    #[test]
    fn test_unilateral_cancel_after_fiat_sent_is_rejected() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let entry = through_fiat_sent(&engine, entry, now);

        let cancel = LocalAction::Cancel { reason: "changed my mind".to_string() };
        let err = engine.apply(&entry, TradeEvent::Local(cancel), now).unwrap_err();
        assert_eq!(err.code, RejectCode::IllegalTransition);
        assert_eq!(entry.state, TradeState::FiatPaymentSent);

        let peer_cancel = message(&entry, 4, maker(), MessagePayload::Cancel { reason: "x".to_string() }, now);
        let err = engine.apply(&entry, TradeEvent::Inbound(peer_cancel), now).unwrap_err();
        assert_eq!(err.code, RejectCode::IllegalTransition);
    }

    #[test]
    fn test_cancel_permissions_after_account_data() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let accept = message(&entry, 1, maker(), MessagePayload::AcceptTerms, now);
        let entry = apply(&engine, &entry, TradeEvent::Inbound(accept), now).entry;
        let account = message(&entry, 2, maker(), MessagePayload::PaymentAccountData { account: "a".to_string() }, now);
        let entry = apply(&engine, &entry, TradeEvent::Inbound(account), now).entry;

        let seller_cancel = message(&entry, 3, maker(), MessagePayload::Cancel { reason: "x".to_string() }, now);
        let err = engine.apply(&entry, TradeEvent::Inbound(seller_cancel), now).unwrap_err();
        assert_eq!(err.code, RejectCode::NotPermitted);

        let t = apply(&engine, &entry, TradeEvent::Local(LocalAction::Cancel { reason: "x".to_string() }), now);
        assert_eq!(t.entry.state, TradeState::Cancelled);
        assert!(t.entry.deadlines.is_empty());
    }

    #[test]
    fn test_mutual_cancel_after_fiat_sent() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let entry = through_fiat_sent(&engine, entry, now);

        let request = LocalAction::RequestMutualCancel { reason: "bank bounced".to_string() };
        let t = apply(&engine, &entry, TradeEvent::Local(request), now);
        assert_eq!(t.outcome, Outcome::Recorded);
        assert_eq!(t.entry.state, TradeState::FiatPaymentSent);
        assert_eq!(t.entry.deadlines, entry.deadlines);

        let err = engine
            .apply(&t.entry, TradeEvent::Local(LocalAction::AcceptMutualCancel), now)
            .unwrap_err();
        assert_eq!(err.code, RejectCode::NotPermitted);

        let accept = message(&t.entry, 5, maker(), MessagePayload::AcceptMutualCancel, now);
        let t = apply(&engine, &t.entry, TradeEvent::Inbound(accept), now);
        assert_eq!(t.entry.state, TradeState::Cancelled);
    }

    #[test]
    fn test_timeout_forces_dispute_and_stale_timeout_is_noop() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let entry = through_fiat_sent(&engine, entry, now);
        let expires_at = entry.deadlines[&DeadlineKind::FiatConfirmation];

        let stale = TradeEvent::Timeout {
            kind: DeadlineKind::FiatPayment,
            expires_at,
        };
        let t = apply(&engine, &entry, stale, expires_at);
        assert_eq!(t.outcome, Outcome::Stale);
        assert_eq!(t.entry, entry);

        let fired = TradeEvent::Timeout {
            kind: DeadlineKind::FiatConfirmation,
            expires_at,
        };
        let t = apply(&engine, &entry, fired.clone(), expires_at);
        assert_eq!(t.entry.state, TradeState::InDispute);
        assert!(t.entry.deadlines.is_empty());
        assert_eq!(t.effects, vec![SideEffect::Escalate]);
        assert_eq!(t.outbound.len(), 1);

        let again = apply(&engine, &t.entry, fired, expires_at);
        assert_eq!(again.outcome, Outcome::Stale);
    }

    #[test]
    fn test_single_deadline_in_each_waiting_state() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let mut entry = entry;
        for step in 0..3 {
            assert_eq!(entry.deadlines.len(), 1, "step {}", step);
            entry = match step {
                0 => apply(&engine, &entry, TradeEvent::Inbound(message(&entry, 1, maker(), MessagePayload::AcceptTerms, now)), now).entry,
                1 => {
                    let payload = MessagePayload::PaymentAccountData { account: "a".to_string() };
                    apply(&engine, &entry, TradeEvent::Inbound(message(&entry, 2, maker(), payload, now)), now).entry
                }
                _ => {
                    let action = LocalAction::ConfirmFiatSent { btc_address: "bc1q".to_string() };
                    apply(&engine, &entry, TradeEvent::Local(action), now).entry
                }
            };
        }
        assert_eq!(entry.deadlines.len(), 1);
    }

    #[test]
    fn test_replay_reproduces_disputed_trade() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let entry = through_fiat_sent(&engine, entry, now);
        let expires_at = entry.deadlines[&DeadlineKind::FiatConfirmation];
        let disputed = apply(
            &engine,
            &entry,
            TradeEvent::Timeout {
                kind: DeadlineKind::FiatConfirmation,
                expires_at,
            },
            expires_at,
        )
        .entry;
        let closed = apply(
            &engine,
            &disputed,
            TradeEvent::MediationClosed {
                outcome: MediationOutcome::Cancelled,
            },
            expires_at,
        )
        .entry;

        for entry in [&entry, &disputed, &closed] {
            let replayed = engine.replay(entry).unwrap();
            assert_eq!(replayed.state, entry.state);
            assert_eq!(replayed.journal, entry.journal);
            assert_eq!(replayed.deadlines, entry.deadlines);
        }
        assert_eq!(closed.state, TradeState::Cancelled);
    }

    #[test]
    fn test_escalated_case_sets_dispute_flag() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let err = engine
            .apply(
                &entry,
                TradeEvent::Escalated {
                    case: MediationCaseHandle {
                        case_id: "case-1".to_string(),
                        opened_at: now,
                    },
                },
                now,
            )
            .unwrap_err();
        assert_eq!(err.code, RejectCode::IllegalTransition);

        let complaint = LocalAction::OpenDispute { reason: "unresponsive".to_string() };
        let disputed = apply(&engine, &entry, TradeEvent::Local(complaint), now).entry;
        assert!(!disputed.dispute_flag);
        let case = MediationCaseHandle {
            case_id: "case-1".to_string(),
            opened_at: now,
        };
        let t = apply(&engine, &disputed, TradeEvent::Escalated { case: case.clone() }, now);
        assert!(t.entry.dispute_flag);
        assert_eq!(t.entry.case(), Some(&case));
        assert!(engine.pending_effects(&t.entry).is_empty());
        assert_eq!(engine.pending_effects(&disputed), vec![SideEffect::Escalate]);
    }

    #[test]
    fn test_pending_effects_after_fiat_confirmation() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let entry = through_fiat_sent(&engine, entry, now);
        assert!(engine.pending_effects(&entry).is_empty());

        let confirm = message(&entry, 4, maker(), MessagePayload::FiatPaymentConfirmed, now);
        let t = apply(&engine, &entry, TradeEvent::Inbound(confirm), now);
        assert_eq!(engine.pending_effects(&t.entry), t.effects);
    }

    #[test]
    fn test_collaborator_exhaustion_disputes_once() {
        let (engine, entry, now) = start(Role::Taker, Direction::Sell);
        let event = TradeEvent::CollaboratorExhausted {
            collaborator: Collaborator::Transport,
            detail: "peer unreachable".to_string(),
        };
        let t = apply(&engine, &entry, event.clone(), now);
        assert_eq!(t.entry.state, TradeState::InDispute);
        let again = apply(&engine, &t.entry, event, now);
        assert_eq!(again.outcome, Outcome::Stale);
    }

    #[test]
    fn test_delivery_marks_outbound_message() {
        let (engine, entry, now) = start(Role::Maker, Direction::Sell);
        let t = apply(&engine, &entry, TradeEvent::Local(LocalAction::AcceptTerms), now);
        assert_eq!(t.entry.undelivered().count(), 1);
        let t = apply(&engine, &t.entry, TradeEvent::Delivered { seq: 1 }, now);
        assert_eq!(t.entry.undelivered().count(), 0);
        assert!(engine.apply(&t.entry, TradeEvent::Delivered { seq: 9 }, now).is_err());
    }
}
