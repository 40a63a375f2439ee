//! HTTP delivery of signed envelopes to peer nodes.

use crate::{
    codec::SignedEnvelope,
    error::{RejectCode, Result},
    interfaces::{DeliveryAck, DeliveryFailure, Transport},
    manager::InboundOutcome,
    model::PeerId,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub const MESSAGES_PATH: &str = "/trade/messages";

/// Error body returned by node endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectCode>,
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: RwLock<HashMap<PeerId, String>>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_peers(timeout: Duration, peers: &HashMap<String, String>) -> Result<Self> {
        let transport = Self::new(timeout)?;
        for (peer, endpoint) in peers {
            transport.register_peer(PeerId::new(peer.to_ascii_lowercase()), endpoint.clone());
        }
        Ok(transport)
    }

    pub fn register_peer(&self, peer: PeerId, endpoint: impl Into<String>) {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        self.endpoints.write().insert(peer, endpoint);
    }

    fn endpoint(&self, peer: &PeerId) -> Option<String> {
        self.endpoints.read().get(peer).cloned()
    }
}

fn classify(status: StatusCode, body: Option<ErrorResponse>) -> DeliveryFailure {
    let reason = body
        .as_ref()
        .map(|body| body.error.clone())
        .unwrap_or_else(|| status.to_string());
    match (status, body.and_then(|body| body.code)) {
        (_, Some(code)) => DeliveryFailure::rejected(code, reason),
        // The peer may not have processed the take-offer yet.
        (StatusCode::NOT_FOUND, None) => DeliveryFailure::unreachable(reason),
        (status, None) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            DeliveryFailure::unreachable(reason)
        }
        (_, None) => DeliveryFailure {
            retryable: false,
            code: None,
            reason,
        },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, peer: &PeerId, envelope: &SignedEnvelope) -> std::result::Result<DeliveryAck, DeliveryFailure> {
        let endpoint = self.endpoint(peer).ok_or_else(|| DeliveryFailure {
            retryable: false,
            code: None,
            reason: format!("no endpoint known for peer {}", peer),
        })?;
        let url = format!("{}{}", endpoint, MESSAGES_PATH);

        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| DeliveryFailure::unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let outcome: InboundOutcome = response
                .json()
                .await
                .map_err(|e| DeliveryFailure::unreachable(format!("unreadable peer response: {}", e)))?;
            debug!(%peer, seq = envelope.message.seq, ?outcome, "Peer accepted message");
            return Ok(match outcome {
                InboundOutcome::Duplicate { .. } => DeliveryAck::Duplicate,
                _ => DeliveryAck::Accepted,
            });
        }

        let body = response.json::<ErrorResponse>().await.ok();
        Err(classify(status, body))
    }
}
