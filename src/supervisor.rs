//! Deadline supervision.
//!
//! Each armed deadline is one tokio task sleeping until its expiry. A firing task first
//! removes its own registry entry, so a deadline fires at most once and a deadline that
//! was re-armed or disarmed in the meantime never reaches the manager.

use crate::{
    clock::Clock,
    model::{DeadlineKind, TradeId},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineFired {
    pub trade_id: TradeId,
    pub kind: DeadlineKind,
    pub expires_at: DateTime<Utc>,
}

struct ArmedDeadline {
    expires_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<TradeId, HashMap<DeadlineKind, ArmedDeadline>>>>;

pub struct DeadlineSupervisor {
    clock: Arc<dyn Clock>,
    registry: Registry,
    fired: mpsc::UnboundedSender<DeadlineFired>,
}

impl DeadlineSupervisor {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<DeadlineFired>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            clock,
            registry: Arc::new(Mutex::new(HashMap::new())),
            fired,
        };
        (supervisor, rx)
    }

    /// Makes the armed set for `trade_id` equal to `deadlines`.
    pub fn sync(&self, trade_id: &TradeId, deadlines: &BTreeMap<DeadlineKind, DateTime<Utc>>) {
        let mut registry = self.registry.lock();
        let armed = registry.entry(trade_id.clone()).or_default();

        armed.retain(|kind, current| {
            let keep = deadlines.get(kind) == Some(&current.expires_at);
            if !keep {
                current.task.abort();
                debug!(%trade_id, %kind, "Deadline disarmed");
            }
            keep
        });

        for (kind, expires_at) in deadlines {
            if armed.contains_key(kind) {
                continue;
            }
            let task = self.spawn_timer(trade_id.clone(), *kind, *expires_at);
            armed.insert(
                *kind,
                ArmedDeadline {
                    expires_at: *expires_at,
                    task,
                },
            );
            debug!(%trade_id, %kind, %expires_at, "Deadline armed");
        }

        if armed.is_empty() {
            registry.remove(trade_id);
        }
    }

    pub fn disarm(&self, trade_id: &TradeId) {
        if let Some(armed) = self.registry.lock().remove(trade_id) {
            for deadline in armed.into_values() {
                deadline.task.abort();
            }
        }
    }

    pub fn armed(&self, trade_id: &TradeId) -> BTreeMap<DeadlineKind, DateTime<Utc>> {
        self.registry
            .lock()
            .get(trade_id)
            .map(|armed| {
                armed
                    .iter()
                    .map(|(kind, deadline)| (*kind, deadline.expires_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn spawn_timer(&self, trade_id: TradeId, kind: DeadlineKind, expires_at: DateTime<Utc>) -> JoinHandle<()> {
        let wait = (expires_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let registry = Arc::clone(&self.registry);
        let fired = self.fired.clone();

        tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            let still_armed = {
                let mut registry = registry.lock();
                let Some(armed) = registry.get_mut(&trade_id) else {
                    return;
                };
                let matches = armed
                    .get(&kind)
                    .map(|deadline| deadline.expires_at == expires_at)
                    .unwrap_or(false);
                if matches {
                    armed.remove(&kind);
                    if armed.is_empty() {
                        registry.remove(&trade_id);
                    }
                }
                matches
            };

            if still_armed {
                info!(%trade_id, %kind, %expires_at, "Deadline expired");
                let _ = fired.send(DeadlineFired {
                    trade_id,
                    kind,
                    expires_at,
                });
            }
        })
    }
}

impl Drop for DeadlineSupervisor {
    fn drop(&mut self) {
        for (_, armed) in self.registry.lock().drain() {
            for deadline in armed.into_values() {
                deadline.task.abort();
            }
        }
    }
}
