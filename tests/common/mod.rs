#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use peertrade::{
    dispute::EvidenceBundle,
    error::Result,
    model::{AgreedTerms, DeadlinePolicy, MediationCaseHandle, TxHandle},
    Collaborators, DeliveryAck, DeliveryFailure, Direction, InboundOutcome, ManagerSettings, Mediator, MemoryStore,
    NodeIdentity, OfferAcceptance, PaymentMethod, PeerId, RetryPolicy, Role, SignedEnvelope, SystemClock, TradeError,
    TradeId, TradeManager, TradeStore, Transport, TrustSystem, Wallet,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Routes envelopes straight into the receiving node's manager.
#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<PeerId, TradeManager>>,
    offline: RwLock<HashSet<PeerId>>,
    /// Sends to these peers hang and never complete.
    stalled: RwLock<HashSet<PeerId>>,
    received: Mutex<Vec<(PeerId, TradeId, u64)>>,
}

impl Network {
    pub fn attach(&self, manager: &TradeManager) {
        self.nodes.write().insert(manager.local_peer(), manager.clone());
    }

    pub fn set_offline(&self, peer: &PeerId, offline: bool) {
        if offline {
            self.offline.write().insert(peer.clone());
        } else {
            self.offline.write().remove(peer);
        }
    }

    pub fn set_stalled(&self, peer: &PeerId, stalled: bool) {
        if stalled {
            self.stalled.write().insert(peer.clone());
        } else {
            self.stalled.write().remove(peer);
        }
    }

    /// Sequence numbers `peer` accepted for `trade_id`, duplicates included, in arrival order.
    pub fn received_by(&self, peer: &PeerId, trade_id: &TradeId) -> Vec<u64> {
        self.received
            .lock()
            .iter()
            .filter(|(to, id, _)| to == peer && id == trade_id)
            .map(|(_, _, seq)| *seq)
            .collect()
    }
}

pub struct LinkTransport {
    network: Arc<Network>,
}

#[async_trait]
impl Transport for LinkTransport {
    async fn send(&self, peer: &PeerId, envelope: &SignedEnvelope) -> std::result::Result<DeliveryAck, DeliveryFailure> {
        if self.network.stalled.read().contains(peer) {
            std::future::pending::<()>().await;
        }
        if self.network.offline.read().contains(peer) {
            return Err(DeliveryFailure::unreachable(format!("{} is offline", peer)));
        }
        let node = self.network.nodes.read().get(peer).cloned();
        let Some(node) = node else {
            return Err(DeliveryFailure::unreachable(format!("{} is not attached", peer)));
        };

        let outcome = node.handle_inbound_envelope(envelope.clone()).await;
        if outcome.is_ok() {
            let message = &envelope.message;
            self.network
                .received
                .lock()
                .push((peer.clone(), message.trade_id.clone(), message.seq));
        }
        match outcome {
            Ok(InboundOutcome::Duplicate { .. }) => Ok(DeliveryAck::Duplicate),
            Ok(_) => Ok(DeliveryAck::Accepted),
            Err(TradeError::UnknownTrade(trade_id)) => Err(DeliveryFailure::unreachable(format!("unknown trade {}", trade_id))),
            Err(e) => match e.reject_code() {
                Some(code) => Err(DeliveryFailure::rejected(code, e.to_string())),
                None => Err(DeliveryFailure {
                    retryable: false,
                    code: None,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Wallet that settles instantly and remembers what it was asked to do.
#[derive(Default)]
pub struct InstantWallet {
    pub payments: Mutex<Vec<(TradeId, u64, String)>>,
    pub watched: Mutex<Vec<TradeId>>,
}

#[async_trait]
impl Wallet for InstantWallet {
    async fn request_payment(&self, trade_id: &TradeId, amount_sats: u64, destination: &str) -> Result<TxHandle> {
        self.payments
            .lock()
            .push((trade_id.clone(), amount_sats, destination.to_string()));
        Ok(TxHandle {
            txid: format!("tx-{}", trade_id),
        })
    }

    async fn watch_incoming(&self, trade_id: &TradeId, _amount_sats: u64, _destination: &str) -> Result<TxHandle> {
        self.watched.lock().push(trade_id.clone());
        Ok(TxHandle {
            txid: format!("tx-{}", trade_id),
        })
    }

    async fn await_confirmation(&self, _tx: &TxHandle) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingMediator {
    pub opened: Mutex<Vec<TradeId>>,
}

impl CountingMediator {
    pub fn count(&self, trade_id: &TradeId) -> usize {
        self.opened.lock().iter().filter(|id| *id == trade_id).count()
    }
}

#[async_trait]
impl Mediator for CountingMediator {
    async fn open_case(&self, trade_id: &TradeId, evidence: &EvidenceBundle) -> Result<MediationCaseHandle> {
        self.opened.lock().push(trade_id.clone());
        Ok(MediationCaseHandle {
            case_id: format!("case-{}", &trade_id.as_str()[..8]),
            opened_at: evidence.exported_at,
        })
    }
}

pub struct Node {
    pub seed: String,
    pub peer: PeerId,
    pub manager: TradeManager,
    pub store: Arc<MemoryStore>,
    pub wallet: Arc<InstantWallet>,
    pub trust: Arc<TrustSystem>,
    pub mediator: Arc<CountingMediator>,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 5,
        max_delay_ms: 20,
    }
}

pub fn settings(deadlines: DeadlinePolicy) -> ManagerSettings {
    ManagerSettings {
        deadlines,
        retry: fast_retry(),
        min_seller_score: 0,
    }
}

/// Starts a node on `network`, reusing `seed` and `store` when given.
pub fn start_node(
    network: &Arc<Network>,
    deadlines: DeadlinePolicy,
    seed: Option<&str>,
    store: Option<Arc<MemoryStore>>,
) -> Node {
    let identity = match seed {
        Some(seed) => NodeIdentity::from_seed_hex(seed).unwrap(),
        None => NodeIdentity::generate(),
    };
    let seed = identity.seed_hex();
    let peer = identity.peer_id();
    let store = store.unwrap_or_default();
    let wallet = Arc::new(InstantWallet::default());
    let trust = Arc::new(TrustSystem::default());
    let mediator = Arc::new(CountingMediator::default());

    let collaborators = Collaborators {
        store: Arc::clone(&store) as Arc<dyn TradeStore>,
        transport: Arc::new(LinkTransport {
            network: Arc::clone(network),
        }),
        wallet: Arc::clone(&wallet) as Arc<dyn Wallet>,
        reputation: Arc::clone(&trust) as Arc<dyn peertrade::ReputationService>,
        mediator: Arc::clone(&mediator) as Arc<dyn Mediator>,
    };
    let manager = TradeManager::new(identity, settings(deadlines), collaborators, Arc::new(SystemClock));
    network.attach(&manager);

    Node {
        seed,
        peer,
        manager,
        store,
        wallet,
        trust,
        mediator,
    }
}

/// Maker sells 0.005 BTC to the taker at 60,000.00 EUR.
pub fn acceptance(maker: &PeerId, taker: &PeerId, role: Role) -> OfferAcceptance {
    OfferAcceptance {
        offer_id: uuid::Uuid::new_v4(),
        maker: maker.clone(),
        taker: taker.clone(),
        role,
        terms: AgreedTerms::new(500_000, 6_000_000, "EUR", PaymentMethod::SepaInstant, Direction::Sell),
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
