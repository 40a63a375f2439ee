//! Trade manager: owns the live trades of this node and drives them through the engine.
//!
//! Every event for a trade runs under that trade's exclusive section: the engine computes
//! the transition, the store persists it, the in-memory snapshot is replaced, deadlines
//! are re-synced, and only then are deliveries and collaborator calls dispatched.
//! Collaborator results come back as ordinary events through the same path.
//!
//! A trade stays resident until it is finished and its last outbound message is
//! delivered; after that it is only read back from the store.

use crate::{
    clock::Clock,
    codec::{MessageCodec, NodeIdentity, SignedEnvelope},
    dispute::DisputeGate,
    engine::{LocalAction, Outcome, SideEffect, SettlementUpdate, TradeEngine, TradeEvent, Transition},
    error::{Collaborator, Result, TradeError},
    interfaces::{DeliveryFailure, Mediator, ReputationService, Transport, Wallet},
    model::*,
    retry::RetryPolicy,
    store::TradeStore,
    supervisor::{DeadlineFired, DeadlineSupervisor},
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub deadlines: DeadlinePolicy,
    pub retry: RetryPolicy,
    /// Minimum seller score a buyer accepts; 0 disables the check.
    pub min_seller_score: u32,
}

pub struct Collaborators {
    pub store: Arc<dyn TradeStore>,
    pub transport: Arc<dyn Transport>,
    pub wallet: Arc<dyn Wallet>,
    pub reputation: Arc<dyn ReputationService>,
    pub mediator: Arc<dyn Mediator>,
}

/// Result reported to the peer that delivered a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InboundOutcome {
    Created { trade_id: TradeId },
    Accepted { trade_id: TradeId, state: TradeState },
    Duplicate { trade_id: TradeId, seq: u64 },
}

struct TradeSlot {
    section: Arc<tokio::sync::Mutex<()>>,
    snapshot: RwLock<TradeEntry>,
    outbox: mpsc::UnboundedSender<u64>,
    /// Wallet polls started for the current settlement step.
    settlement: Mutex<Vec<AbortHandle>>,
}

impl TradeSlot {
    fn stop_settlement(&self, trade_id: &TradeId) {
        let running = std::mem::take(&mut *self.settlement.lock());
        for poll in running.iter().filter(|poll| !poll.is_finished()) {
            poll.abort();
            debug!(%trade_id, "Wallet poll stopped");
        }
    }
}

fn awaits_settlement(state: TradeState) -> bool {
    matches!(state, TradeState::FiatPaymentConfirmed | TradeState::BtcTransferInitiated)
}

struct Inner {
    engine: TradeEngine,
    codec: MessageCodec,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    min_seller_score: u32,
    store: Arc<dyn TradeStore>,
    transport: Arc<dyn Transport>,
    wallet: Arc<dyn Wallet>,
    reputation: Arc<dyn ReputationService>,
    gate: DisputeGate,
    supervisor: DeadlineSupervisor,
    trades: RwLock<HashMap<TradeId, Arc<TradeSlot>>>,
}

#[derive(Clone)]
pub struct TradeManager {
    inner: Arc<Inner>,
}

impl TradeManager {
    /// Must be called from within a tokio runtime.
    pub fn new(identity: NodeIdentity, settings: ManagerSettings, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let (supervisor, fired) = DeadlineSupervisor::new(Arc::clone(&clock));
        let gate = DisputeGate::new(collaborators.mediator, Arc::clone(&clock), settings.retry.clone());
        let inner = Arc::new(Inner {
            engine: TradeEngine::new(settings.deadlines),
            codec: MessageCodec::new(identity),
            clock,
            retry: settings.retry,
            min_seller_score: settings.min_seller_score,
            store: collaborators.store,
            transport: collaborators.transport,
            wallet: collaborators.wallet,
            reputation: collaborators.reputation,
            gate,
            supervisor,
            trades: RwLock::new(HashMap::new()),
        });
        Inner::spawn_deadline_loop(Arc::downgrade(&inner), fired);
        info!(peer_id = %inner.codec.local_peer(), "Trade manager started");
        Self { inner }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.codec.local_peer()
    }

    pub async fn create_trade(&self, acceptance: OfferAcceptance) -> Result<TradeId> {
        let inner = &self.inner;
        acceptance.terms.validate()?;

        let me = inner.codec.local_peer();
        let local = match acceptance.role {
            Role::Maker => &acceptance.maker,
            Role::Taker => &acceptance.taker,
        };
        if *local != me {
            return Err(TradeError::InvalidTerms(format!(
                "Local identity {} is not the {:?} of offer {}",
                me, acceptance.role, acceptance.offer_id
            )));
        }

        let trade_id = acceptance.trade_id();
        inner.ensure_new(&trade_id).await?;

        let origin = ProtocolMessage::take_offer(
            acceptance.offer_id,
            acceptance.maker,
            acceptance.taker,
            acceptance.terms,
            inner.clock.now(),
        );
        let entry = TradeEntry::from_origin(acceptance.role, origin, inner.clock.now())?;
        inner.check_seller_reputation(&entry).await?;

        let slot = inner.open_trade(entry).await?;
        if acceptance.role == Role::Taker {
            let _ = slot.outbox.send(0);
        }
        Ok(trade_id)
    }

    pub async fn handle_inbound_envelope(&self, envelope: SignedEnvelope) -> Result<InboundOutcome> {
        let message = self.inner.codec.open(envelope)?;
        self.handle_inbound_message(message).await
    }

    pub async fn handle_inbound_message(&self, message: ProtocolMessage) -> Result<InboundOutcome> {
        let inner = &self.inner;
        let trade_id = message.trade_id.clone();

        if inner.slot(&trade_id).await?.is_none() {
            match inner.accept_take_offer(message.clone()).await {
                // A concurrent delivery of the same take-offer opened it first.
                Err(TradeError::TradeExists(_)) => {}
                other => return other,
            }
        }

        let transition = inner.apply_event(&trade_id, TradeEvent::Inbound(message)).await?;
        Ok(match transition.outcome {
            Outcome::Acknowledged { seq } => InboundOutcome::Duplicate { trade_id, seq },
            _ => InboundOutcome::Accepted {
                trade_id,
                state: transition.entry.state,
            },
        })
    }

    /// Applies a local action.
    ///
    /// An action arriving after the current state's deadline has passed is refused with
    /// `DeadlineExceeded`, and the expiry is applied in its place.
    pub async fn perform(&self, trade_id: &TradeId, action: LocalAction) -> Result<Outcome> {
        let transition = self.inner.apply_event(trade_id, TradeEvent::Local(action)).await?;
        Ok(transition.outcome)
    }

    /// Applies the mediator's verdict to a disputed trade.
    pub async fn close_mediation(&self, trade_id: &TradeId, outcome: MediationOutcome) -> Result<Outcome> {
        let transition = self
            .inner
            .apply_event(trade_id, TradeEvent::MediationClosed { outcome })
            .await?;
        Ok(transition.outcome)
    }

    /// Snapshot of a resident trade.
    pub fn get_trade(&self, trade_id: &TradeId) -> Option<TradeEntry> {
        let slot = self.inner.trades.read().get(trade_id).cloned();
        slot.map(|slot| slot.snapshot.read().clone())
    }

    /// Like `get_trade`, but also finds finished trades that are no longer resident.
    pub async fn find_trade(&self, trade_id: &TradeId) -> Result<Option<TradeEntry>> {
        if let Some(entry) = self.get_trade(trade_id) {
            return Ok(Some(entry));
        }
        self.inner.store.load(trade_id).await
    }

    /// Resident trades, oldest first.
    pub fn list_trades(&self) -> Vec<TradeEntry> {
        let slots: Vec<Arc<TradeSlot>> = self.inner.trades.read().values().cloned().collect();
        let mut entries: Vec<TradeEntry> = slots.iter().map(|slot| slot.snapshot.read().clone()).collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }

    /// Reloads every unfinished trade and resumes it where it stopped.
    pub async fn recover(&self) -> Result<usize> {
        let inner = &self.inner;
        let entries = inner.store.list_non_terminal().await?;
        let mut recovered = 0;

        for entry in entries {
            match inner.engine.replay(&entry) {
                Ok(replayed) if replayed.state == entry.state => {}
                Ok(replayed) => warn!(
                    trade_id = %entry.trade_id,
                    stored = %entry.state,
                    replayed = %replayed.state,
                    "Stored state disagrees with its log"
                ),
                Err(e) => warn!(trade_id = %entry.trade_id, error = %e, "Trade log does not replay"),
            }

            let trade_id = entry.trade_id.clone();
            if let Some(case) = entry.case() {
                inner.gate.seed(&trade_id, case.clone());
            }
            let resend_origin = entry.role == Role::Taker && entry.message_log.is_empty();
            let undelivered: Vec<u64> = entry.undelivered().map(|logged| logged.message.seq).collect();
            let effects = inner.engine.pending_effects(&entry);

            let slot = match inner.install(entry.clone()).await {
                Ok((slot, _section)) => slot,
                Err(TradeError::TradeExists(_)) => continue,
                Err(e) => return Err(e),
            };
            inner.supervisor.sync(&trade_id, &entry.deadlines);
            if resend_origin {
                let _ = slot.outbox.send(0);
            }
            for seq in &undelivered {
                let _ = slot.outbox.send(*seq);
            }
            inner.dispatch_effects(&slot, &entry, effects);

            info!(
                trade_id = %trade_id,
                state = %entry.state,
                resend = undelivered.len(),
                "Trade recovered"
            );
            recovered += 1;
        }

        Ok(recovered)
    }
}

impl Inner {
    fn spawn_deadline_loop(weak: Weak<Inner>, mut fired: mpsc::UnboundedReceiver<DeadlineFired>) {
        tokio::spawn(async move {
            while let Some(deadline) = fired.recv().await {
                if weak.strong_count() == 0 {
                    break;
                }
                tokio::spawn(Inner::expire(weak.clone(), deadline));
            }
        });
    }

    /// Applies an expired deadline, retrying with backoff until it is committed or the
    /// trade no longer accepts it.
    async fn expire(weak: Weak<Inner>, deadline: DeadlineFired) {
        let trade_id = deadline.trade_id;
        let mut attempt = 1;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let event = TradeEvent::Timeout {
                kind: deadline.kind,
                expires_at: deadline.expires_at,
            };
            let delay = match inner.apply_event(&trade_id, event).await {
                Ok(_) | Err(TradeError::UnknownTrade(_)) => return,
                Err(e) if e.reject_code().is_some() => {
                    warn!(%trade_id, kind = %deadline.kind, error = %e, "Deadline not applicable");
                    return;
                }
                Err(e) => {
                    let delay = inner.retry.delay_for(attempt);
                    error!(
                        %trade_id,
                        kind = %deadline.kind,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to apply deadline"
                    );
                    delay
                }
            };
            drop(inner);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Escalates a disputed trade until its mediation case is recorded on the entry.
    async fn escalate(weak: Weak<Inner>, trade_id: TradeId) {
        let mut attempt = 1;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let entry = inner.trades.read().get(&trade_id).map(|slot| slot.snapshot.read().clone());
            let Some(entry) = entry else {
                return;
            };
            if entry.state != TradeState::InDispute || entry.dispute_flag {
                return;
            }

            let recorded = match inner.gate.escalate(&entry).await {
                Ok(case) => inner.apply_event(&trade_id, TradeEvent::Escalated { case }).await.map(|_| ()),
                Err(e) => Err(e),
            };
            let failure = match recorded {
                Ok(()) => return,
                Err(e) if e.reject_code().is_some() => {
                    warn!(%trade_id, error = %e, "Escalation refused");
                    return;
                }
                Err(e) => e,
            };

            let delay = inner.retry.delay_for(attempt);
            error!(
                %trade_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure,
                "Escalation failed"
            );
            drop(inner);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn ensure_new(&self, trade_id: &TradeId) -> Result<()> {
        let known = self.trades.read().contains_key(trade_id);
        if known || self.store.load(trade_id).await?.is_some() {
            return Err(TradeError::TradeExists(trade_id.clone()));
        }
        Ok(())
    }

    async fn check_seller_reputation(&self, entry: &TradeEntry) -> Result<()> {
        if self.min_seller_score == 0 || entry.side() != Side::Buyer {
            return Ok(());
        }
        let score = self
            .retry
            .run("get_seller_score", || self.reputation.get_score(&entry.peer), |_| true)
            .await
            .map_err(|e| TradeError::collaborator(Collaborator::Reputation, e))?;
        if score < self.min_seller_score {
            warn!(trade_id = %entry.trade_id, peer = %entry.peer, score, "Seller reputation too low");
            return Err(TradeError::InsufficientReputation {
                score,
                required: self.min_seller_score,
            });
        }
        Ok(())
    }

    /// A take-offer for an offer this node made opens a new trade.
    async fn accept_take_offer(self: &Arc<Self>, message: ProtocolMessage) -> Result<InboundOutcome> {
        let trade_id = message.trade_id.clone();
        let addressed_to_us = matches!(
            &message.payload,
            MessagePayload::TakeOffer { maker, .. } if *maker == self.codec.local_peer()
        );
        if message.seq != 0 || !addressed_to_us {
            warn!(%trade_id, seq = message.seq, kind = message.payload.kind(), "Message for unknown trade");
            return Err(TradeError::UnknownTrade(trade_id));
        }

        let entry = TradeEntry::from_origin(Role::Maker, message, self.clock.now())?;
        self.check_seller_reputation(&entry).await?;
        self.open_trade(entry).await?;
        Ok(InboundOutcome::Created { trade_id })
    }

    /// Reserves the trade id, then persists the new entry while holding its section.
    async fn open_trade(self: &Arc<Self>, mut entry: TradeEntry) -> Result<Arc<TradeSlot>> {
        self.engine.initialize(&mut entry);
        let (slot, _section) = self.install(entry.clone()).await?;

        if let Err(e) = self.persist(&entry).await {
            self.release(&entry.trade_id, &slot);
            return Err(e);
        }
        self.supervisor.sync(&entry.trade_id, &entry.deadlines);
        info!(
            trade_id = %entry.trade_id,
            role = ?entry.role,
            side = ?entry.side(),
            sats = entry.terms.btc_amount_sats,
            "Trade created"
        );
        Ok(slot)
    }

    /// Makes `entry` resident unless the trade already is. The new slot's section is
    /// returned held.
    async fn install(self: &Arc<Self>, entry: TradeEntry) -> Result<(Arc<TradeSlot>, OwnedMutexGuard<()>)> {
        let trade_id = entry.trade_id.clone();
        let section = Arc::new(tokio::sync::Mutex::new(()));
        let held = Arc::clone(&section).lock_owned().await;
        let (outbox, queued) = mpsc::unbounded_channel();
        let slot = Arc::new(TradeSlot {
            section,
            snapshot: RwLock::new(entry),
            outbox,
            settlement: Mutex::new(Vec::new()),
        });
        {
            let mut trades = self.trades.write();
            if trades.contains_key(&trade_id) {
                return Err(TradeError::TradeExists(trade_id));
            }
            trades.insert(trade_id.clone(), Arc::clone(&slot));
        }
        self.spawn_outbox(trade_id, queued);
        Ok((slot, held))
    }

    fn is_resident(&self, trade_id: &TradeId, slot: &Arc<TradeSlot>) -> bool {
        self.trades
            .read()
            .get(trade_id)
            .is_some_and(|live| Arc::ptr_eq(live, slot))
    }

    /// Removes `slot` from the resident set if it is still the live one.
    fn release(&self, trade_id: &TradeId, slot: &Arc<TradeSlot>) -> bool {
        let mut trades = self.trades.write();
        match trades.get(trade_id) {
            Some(live) if Arc::ptr_eq(live, slot) => {
                trades.remove(trade_id);
                true
            }
            _ => false,
        }
    }

    fn retire(&self, trade_id: &TradeId, slot: &Arc<TradeSlot>) {
        if !self.release(trade_id, slot) {
            return;
        }
        slot.stop_settlement(trade_id);
        self.supervisor.disarm(trade_id);
        self.gate.forget(trade_id);
        debug!(%trade_id, "Finished trade released");
    }

    fn retire_if_finished(&self, trade_id: &TradeId, slot: &Arc<TradeSlot>) {
        let finished = {
            let entry = slot.snapshot.read();
            entry.is_terminal() && entry.undelivered().next().is_none()
        };
        if finished {
            self.retire(trade_id, slot);
        }
    }

    /// Looks up a live trade, falling back to the store for trades not resident.
    async fn slot(self: &Arc<Self>, trade_id: &TradeId) -> Result<Option<Arc<TradeSlot>>> {
        let live = self.trades.read().get(trade_id).cloned();
        if live.is_some() {
            return Ok(live);
        }
        let Some(entry) = self.store.load(trade_id).await? else {
            return Ok(None);
        };
        match self.install(entry).await {
            Ok((slot, _section)) => Ok(Some(slot)),
            Err(TradeError::TradeExists(_)) => Ok(self.trades.read().get(trade_id).cloned()),
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, entry: &TradeEntry) -> Result<()> {
        self.retry
            .run("persist_trade", || self.store.save(entry), |_| true)
            .await
            .map_err(|e| {
                error!(trade_id = %entry.trade_id, error = %e, "Failed to persist trade");
                TradeError::collaborator(Collaborator::Persistence, e)
            })
    }

    async fn apply_event(self: &Arc<Self>, trade_id: &TradeId, event: TradeEvent) -> Result<Transition> {
        let (slot, _section) = loop {
            let slot = self
                .slot(trade_id)
                .await?
                .ok_or_else(|| TradeError::UnknownTrade(trade_id.clone()))?;
            let section = Arc::clone(&slot.section).lock_owned().await;
            // The slot may have been released while we waited for it.
            if self.is_resident(trade_id, &slot) {
                break (slot, section);
            }
        };

        let result = self.apply_locked(trade_id, &slot, event).await;
        self.retire_if_finished(trade_id, &slot);
        result
    }

    async fn apply_locked(self: &Arc<Self>, trade_id: &TradeId, slot: &Arc<TradeSlot>, event: TradeEvent) -> Result<Transition> {
        let now = self.clock.now();
        let overdue = match &event {
            TradeEvent::Local(_) => slot.snapshot.read().overdue_deadline(now),
            _ => None,
        };
        if let Some((kind, expires_at)) = overdue {
            warn!(%trade_id, %kind, %expires_at, "Local action after deadline");
            self.commit(trade_id, slot, TradeEvent::Timeout { kind, expires_at }, now)
                .await?;
            return Err(TradeError::DeadlineExceeded(format!(
                "{} deadline passed at {}",
                kind, expires_at
            )));
        }
        self.commit(trade_id, slot, event, now).await
    }

    /// Runs one event through the engine and commits the result; the caller holds the section.
    async fn commit(
        self: &Arc<Self>,
        trade_id: &TradeId,
        slot: &Arc<TradeSlot>,
        event: TradeEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let current = slot.snapshot.read().clone();
        let transition = match self.engine.apply(&current, event, now) {
            Ok(transition) => transition,
            Err(rejection) => {
                warn!(
                    %trade_id,
                    state = %current.state,
                    code = %rejection.code,
                    detail = %rejection.detail,
                    "Event rejected"
                );
                return Err(rejection.into());
            }
        };

        if transition.entry != current {
            self.persist(&transition.entry).await?;
            *slot.snapshot.write() = transition.entry.clone();
            self.supervisor.sync(trade_id, &transition.entry.deadlines);
            if !awaits_settlement(transition.entry.state) {
                slot.stop_settlement(trade_id);
            }
        }

        for message in &transition.outbound {
            let _ = slot.outbox.send(message.seq);
        }
        self.dispatch_effects(slot, &transition.entry, transition.effects.clone());
        Ok(transition)
    }

    fn spawn_outbox(self: &Arc<Self>, trade_id: TradeId, mut queued: mpsc::UnboundedReceiver<u64>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(seq) = queued.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.deliver(&trade_id, seq).await;
            }
        });
    }

    async fn deliver(self: &Arc<Self>, trade_id: &TradeId, seq: u64) {
        let Some(slot) = self.trades.read().get(trade_id).cloned() else {
            return;
        };
        let pending = {
            let entry = slot.snapshot.read();
            let message = if seq == 0 {
                Some(entry.origin.clone())
            } else {
                entry
                    .logged(seq)
                    .filter(|logged| logged.direction == MessageDirection::Outbound && !logged.delivered)
                    .map(|logged| logged.message.clone())
            };
            message.map(|message| (entry.peer.clone(), message))
        };
        let Some((peer, message)) = pending else {
            return;
        };

        let envelope = match self.codec.seal(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(%trade_id, seq, error = %e, "Failed to seal message");
                return;
            }
        };

        let sent = self
            .retry
            .run(
                "deliver_message",
                || self.transport.send(&peer, &envelope),
                |failure: &DeliveryFailure| failure.retryable,
            )
            .await;

        let event = match sent {
            Ok(ack) => {
                debug!(%trade_id, seq, ?ack, "Message delivered");
                if seq == 0 {
                    return;
                }
                TradeEvent::Delivered { seq }
            }
            Err(failure) => {
                warn!(%trade_id, seq, reason = %failure.reason, "Delivery abandoned");
                TradeEvent::CollaboratorExhausted {
                    collaborator: Collaborator::Transport,
                    detail: failure.reason,
                }
            }
        };
        let abandoned = matches!(event, TradeEvent::CollaboratorExhausted { .. });
        if let Err(e) = self.apply_event(trade_id, event).await {
            warn!(%trade_id, seq, error = %e, "Failed to record delivery result");
        }
        // A finished trade cannot dispute an undeliverable message; stop holding it.
        if abandoned && slot.snapshot.read().is_terminal() {
            self.retire(trade_id, &slot);
        }
    }

    /// Runs a wallet call under the slot so it can be stopped when the trade moves on.
    fn spawn_settlement<F>(self: &Arc<Self>, slot: &TradeSlot, trade_id: TradeId, work: F)
    where
        F: Future<Output = Result<SettlementUpdate>> + Send + 'static,
    {
        let poll = tokio::spawn(work);
        slot.settlement.lock().push(poll.abort_handle());

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let update = match poll.await {
                Ok(update) => update,
                Err(e) if e.is_cancelled() => return,
                Err(e) => Err(TradeError::collaborator(Collaborator::Wallet, e)),
            };
            if let Some(inner) = weak.upgrade() {
                inner.settle(&trade_id, update).await;
            }
        });
    }

    fn dispatch_effects(self: &Arc<Self>, slot: &TradeSlot, entry: &TradeEntry, effects: Vec<SideEffect>) {
        for effect in effects {
            let trade_id = entry.trade_id.clone();
            match effect {
                SideEffect::RequestBtcTransfer { amount_sats, destination } => {
                    let (wallet, retry, id) = (Arc::clone(&self.wallet), self.retry.clone(), trade_id.clone());
                    self.spawn_settlement(slot, trade_id, async move {
                        retry
                            .run(
                                "request_payment",
                                || wallet.request_payment(&id, amount_sats, &destination),
                                |_| true,
                            )
                            .await
                            .map(|tx| SettlementUpdate::TransferSeen { tx })
                    });
                }
                SideEffect::WatchIncomingTransfer { amount_sats, destination } => {
                    let (wallet, retry, id) = (Arc::clone(&self.wallet), self.retry.clone(), trade_id.clone());
                    self.spawn_settlement(slot, trade_id, async move {
                        retry
                            .run(
                                "watch_incoming",
                                || wallet.watch_incoming(&id, amount_sats, &destination),
                                |_| true,
                            )
                            .await
                            .map(|tx| SettlementUpdate::TransferSeen { tx })
                    });
                }
                SideEffect::AwaitConfirmation { tx } => {
                    let (wallet, retry) = (Arc::clone(&self.wallet), self.retry.clone());
                    self.spawn_settlement(slot, trade_id, async move {
                        retry
                            .run("await_confirmation", || wallet.await_confirmation(&tx), |_| true)
                            .await
                            .map(|()| SettlementUpdate::TransferConfirmed { tx: tx.clone() })
                    });
                }
                SideEffect::RecordOutcome { peer, outcome } => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        let recorded = inner
                            .retry
                            .run(
                                "record_outcome",
                                || inner.reputation.record_outcome(&peer, &trade_id, outcome),
                                |_| true,
                            )
                            .await;
                        if let Err(e) = recorded {
                            error!(%trade_id, %peer, ?outcome, error = %e, "Failed to record trade outcome");
                        }
                    });
                }
                SideEffect::Escalate => {
                    tokio::spawn(Inner::escalate(Arc::downgrade(self), trade_id));
                }
            }
        }
    }

    async fn settle(self: &Arc<Self>, trade_id: &TradeId, update: Result<SettlementUpdate>) {
        let event = match update {
            Ok(update) => TradeEvent::Settlement(update),
            Err(e) => {
                error!(%trade_id, error = %e, "Wallet operation exhausted retries");
                TradeEvent::CollaboratorExhausted {
                    collaborator: Collaborator::Wallet,
                    detail: e.to_string(),
                }
            }
        };
        if let Err(e) = self.apply_event(trade_id, event).await {
            warn!(%trade_id, error = %e, "Settlement progress not applied");
        }
    }
}
