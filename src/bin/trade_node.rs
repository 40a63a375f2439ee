use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use peertrade::{
    config::create_default_config_file,
    engine::{LocalAction, Outcome},
    interfaces::{Mediator, ReputationService},
    model::{MediationOutcome, OfferAcceptance, TradeEntry, TradeId},
    settlement::{BitcoindWallet, WalletSettings},
    telemetry::init_logging,
    transport::{ErrorResponse, HttpTransport, MESSAGES_PATH},
    AppConfig, Collaborators, Database, InboundOutcome, NodeIdentity, PeerId, ReputationScore, SignedEnvelope,
    SystemClock, TradeError, TradeManager, TradeStore, TrustSystem,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "trade-node")]
#[command(about = "Peer-to-peer bitcoin trade node")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long, env = "PEERTRADE_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write a default configuration file and exit.
    #[arg(long)]
    init_config: bool,
}

#[derive(Clone)]
struct AppState {
    manager: TradeManager,
    database: Arc<Database>,
    trust: Arc<TrustSystem>,
}

struct ApiError(TradeError);

impl From<TradeError> for ApiError {
    fn from(err: TradeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TradeError::ProtocolViolation { .. } | TradeError::TradeExists(_) | TradeError::DeadlineExceeded(_) => {
                StatusCode::CONFLICT
            }
            TradeError::UnknownTrade(_) => StatusCode::NOT_FOUND,
            TradeError::Signature(_) | TradeError::Serialization(_) => StatusCode::BAD_REQUEST,
            TradeError::InvalidTerms(_) | TradeError::InsufficientReputation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TradeError::CollaboratorFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.reject_code(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct MediationRequest {
    outcome: MediationOutcome,
}

#[derive(Debug, Serialize)]
struct TradeSummary {
    trade_id: TradeId,
    state: String,
    role: String,
    peer: String,
    btc_amount_sats: u64,
    fiat_amount_minor: u64,
    currency: String,
    dispute_flag: bool,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&TradeEntry> for TradeSummary {
    fn from(entry: &TradeEntry) -> Self {
        Self {
            trade_id: entry.trade_id.clone(),
            state: entry.state.to_string(),
            role: format!("{:?}", entry.role).to_lowercase(),
            peer: entry.peer.to_string(),
            btc_amount_sats: entry.terms.btc_amount_sats,
            fiat_amount_minor: entry.terms.fiat_amount_minor,
            currency: entry.terms.currency.clone(),
            dispute_flag: entry.dispute_flag,
            updated_at: entry.updated_at,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        create_default_config_file(&args.config).context("writing default config")?;
        println!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let mut config = AppConfig::load_with_env_overrides(&args.config).context("loading configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    config.validate()?;
    init_logging(&config.logging)?;

    let identity = match &config.node.identity_seed {
        Some(seed) => NodeIdentity::from_seed_hex(seed)?,
        None => {
            warn!("No identity seed configured, using an ephemeral identity");
            NodeIdentity::generate()
        }
    };

    let database = Arc::new(Database::connect(&config.database).await?);
    let timeout = Duration::from_secs(config.node.request_timeout_seconds.unwrap_or(10));
    let transport = Arc::new(HttpTransport::with_peers(timeout, &config.node.peers)?);
    let wallet = Arc::new(BitcoindWallet::new(WalletSettings::from(&config.wallet))?);
    let trust = Arc::new(TrustSystem::new(config.reputation.initial_score));

    let collaborators = Collaborators {
        store: Arc::clone(&database) as Arc<dyn TradeStore>,
        transport,
        wallet,
        reputation: Arc::clone(&trust) as Arc<dyn ReputationService>,
        mediator: Arc::clone(&database) as Arc<dyn Mediator>,
    };
    let manager = TradeManager::new(identity, config.manager_settings(), collaborators, Arc::new(SystemClock));

    let recovered = manager.recover().await?;
    info!(
        peer_id = %manager.local_peer(),
        recovered,
        known = database.list_all().await?.len(),
        "Trade node ready"
    );

    let state = AppState {
        manager,
        database,
        trust,
    };

    let app = Router::new()
        .route(MESSAGES_PATH, post(receive_message))
        .route("/trades", get(list_trades).post(create_trade))
        .route("/trades/:trade_id", get(get_trade))
        .route("/trades/:trade_id/actions", post(perform_action))
        .route("/trades/:trade_id/mediation", post(close_mediation))
        .route("/reputation/:peer_id", get(get_reputation))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    info!(%address, "Trade node listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn parse_trade_id(raw: &str) -> std::result::Result<TradeId, ApiError> {
    Ok(TradeId::parse(raw)?)
}

async fn receive_message(State(state): State<AppState>, Json(envelope): Json<SignedEnvelope>) -> ApiResult<InboundOutcome> {
    Ok(Json(state.manager.handle_inbound_envelope(envelope).await?))
}

async fn create_trade(
    State(state): State<AppState>,
    Json(acceptance): Json<OfferAcceptance>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let trade_id = state.manager.create_trade(acceptance).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "trade_id": trade_id }))))
}

async fn perform_action(
    State(state): State<AppState>,
    Path(trade_id): Path<String>,
    Json(action): Json<LocalAction>,
) -> ApiResult<Outcome> {
    let trade_id = parse_trade_id(&trade_id)?;
    Ok(Json(state.manager.perform(&trade_id, action).await?))
}

async fn close_mediation(
    State(state): State<AppState>,
    Path(trade_id): Path<String>,
    Json(request): Json<MediationRequest>,
) -> ApiResult<Outcome> {
    let trade_id = parse_trade_id(&trade_id)?;
    let outcome = state.manager.close_mediation(&trade_id, request.outcome).await?;
    if let Err(e) = state.database.resolve_case(&trade_id, request.outcome).await {
        warn!(%trade_id, error = %e, "Verdict applied without a recorded case");
    }
    Ok(Json(outcome))
}

async fn get_trade(State(state): State<AppState>, Path(trade_id): Path<String>) -> ApiResult<TradeEntry> {
    let trade_id = parse_trade_id(&trade_id)?;
    match state.manager.find_trade(&trade_id).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(TradeError::UnknownTrade(trade_id).into()),
    }
}

async fn list_trades(State(state): State<AppState>) -> ApiResult<Vec<TradeSummary>> {
    let entries = state.database.list_all().await?;
    Ok(Json(entries.iter().map(TradeSummary::from).collect()))
}

async fn get_reputation(State(state): State<AppState>, Path(peer_id): Path<String>) -> Json<ReputationScore> {
    let peer = PeerId::new(peer_id.to_ascii_lowercase());
    Json(state.trust.get_peer_trust_info(&peer))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "peer_id": state.manager.local_peer(),
        "live_trades": state.manager.list_trades().len(),
        "timestamp": chrono::Utc::now()
    }))
}
