//! HTTP/WebSocket surface of the dispatch server
//!
//! Three routers: peer calls (plus the public routes) on the private
//! listener, public routes on the public listener, control calls on a
//! local listener. Network identifiers travel as hex in paths, `-` for
//! the empty identifier.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_core::net::{
    ChainInfoRequest, DkgInfoPacket, DkgPacket, HomeRequest, HomeResponse, IdentityRequest, PartialBeaconPacket,
    Peer, PublicRandRequest, PublicRandResponse, Service, SignalDkgPacket, SyncRequest,
};
use beacon_core::{ChainInfo, Error, Group, Identity, LoadReport, NetworkId, ReshareRequest, Server, SetupRequest};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Path segment standing for the empty identifier
pub const EMPTY_ID: &str = "-";

/// Queue between a streaming call and its socket
const SOCKET_BUFFER: usize = 16;

/// Error body of every failed call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// [`Error`] answered over HTTP
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: kind_of(&self.0).to_string(),
            message: self.0.to_string(),
        };
        (status_of(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::RoundNotFound(_) | Error::UnknownNetwork(_) | Error::NoGroup => StatusCode::NOT_FOUND,
        Error::MissingIdentifier
        | Error::UnknownVersion(_)
        | Error::BlacklistedVersion(_)
        | Error::InvalidPartial { .. }
        | Error::InvalidBeacon { .. }
        | Error::NonContiguousRound { .. }
        | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::InvalidSecret | Error::NotInGroup(_) => StatusCode::FORBIDDEN,
        Error::SetupInProgress
        | Error::NoDkgRunning
        | Error::NoSetupManager
        | Error::NoSetupReceiver
        | Error::DuplicateLegacyInstance(_)
        | Error::Terminated => StatusCode::CONFLICT,
        Error::BeaconNotStarted => StatusCode::PRECONDITION_FAILED,
        Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::Dkg(_)
        | Error::ThresholdNotMet { .. }
        | Error::Crypto(_)
        | Error::Storage(_)
        | Error::Io(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Stable name of an error, carried in [`ErrorBody::kind`]
pub fn kind_of(error: &Error) -> &'static str {
    match error {
        Error::UnknownVersion(_) => "unknown_version",
        Error::BlacklistedVersion(_) => "blacklisted_version",
        Error::DuplicateLegacyInstance(_) => "duplicate_legacy_instance",
        Error::MissingIdentifier => "missing_identifier",
        Error::UnknownNetwork(_) => "unknown_network",
        Error::SetupInProgress => "setup_in_progress",
        Error::NoDkgRunning => "no_dkg_running",
        Error::NoSetupManager => "no_setup_manager",
        Error::NoSetupReceiver => "no_setup_receiver",
        Error::BeaconNotStarted => "beacon_not_started",
        Error::NoGroup => "no_group",
        Error::RoundNotFound(_) => "round_not_found",
        Error::NotInGroup(_) => "not_in_group",
        Error::InvalidPartial { .. } => "invalid_partial",
        Error::InvalidBeacon { .. } => "invalid_beacon",
        Error::NonContiguousRound { .. } => "non_contiguous_round",
        Error::Dkg(_) => "dkg",
        Error::ThresholdNotMet { .. } => "threshold_not_met",
        Error::InvalidSecret => "invalid_secret",
        Error::Terminated => "terminated",
        Error::NotImplemented => "not_implemented",
        Error::Transport(_) => "transport",
        Error::Crypto(_) => "crypto",
        Error::Storage(_) => "storage",
        Error::Serialization(_) => "serialization",
        Error::Io(_) => "io",
        Error::Internal(_) => "internal",
    }
}

/// Rebuild the error a remote node answered with. Kinds the caller acts
/// on come back as themselves, the rest as a transport error.
pub fn error_from_wire(body: ErrorBody) -> Error {
    match body.kind.as_str() {
        "missing_identifier" => Error::MissingIdentifier,
        "setup_in_progress" => Error::SetupInProgress,
        "no_dkg_running" => Error::NoDkgRunning,
        "no_setup_manager" => Error::NoSetupManager,
        "no_setup_receiver" => Error::NoSetupReceiver,
        "beacon_not_started" => Error::BeaconNotStarted,
        "no_group" => Error::NoGroup,
        "invalid_secret" => Error::InvalidSecret,
        "terminated" => Error::Terminated,
        "not_implemented" => Error::NotImplemented,
        _ => Error::Transport(format!("{}: {}", body.kind, body.message)),
    }
}

pub fn id_to_path(id: &NetworkId) -> String {
    if id.is_empty() {
        EMPTY_ID.to_string()
    } else {
        id.to_hex()
    }
}

pub fn id_from_path(segment: &str) -> Result<NetworkId, ApiError> {
    if segment == EMPTY_ID {
        return Ok(NetworkId::empty());
    }
    NetworkId::from_hex(segment).map_err(ApiError)
}

fn peer_of(addr: SocketAddr) -> Peer {
    Peer::new(addr.to_string())
}

/// Peer calls, plus the public routes
pub fn private_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/peer/partial", post(partial_beacon))
        .route("/peer/dkg", post(broadcast_dkg))
        .route("/peer/signal", post(signal_dkg))
        .route("/peer/info", post(push_dkg_info))
        .route("/peer/identity", post(get_identity))
        .route("/peer/sync", get(sync_chain))
        .with_state(server.clone())
        .merge(public_routes(server))
        .layer(TraceLayer::new_for_http())
}

pub fn public_router(server: Arc<Server>) -> Router {
    public_routes(server)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn public_routes(server: Arc<Server>) -> Router {
    Router::new()
        .route("/public/home", get(home))
        .route("/public/:id/home", get(home_of))
        .route("/public/:id/info", get(chain_info))
        .route("/public/:id/stream/:round", get(public_rand_stream))
        .route("/public/:id/:round", get(public_rand))
        .with_state(server)
}

#[derive(Clone)]
struct ControlState {
    server: Arc<Server>,
    shutdown: Arc<Notify>,
}

/// Administrative calls; `shutdown` wakes the daemon through `shutdown`
pub fn control_router(server: Arc<Server>, shutdown: Arc<Notify>) -> Router {
    Router::new()
        .route("/control/load", post(load))
        .route("/control/setup", post(setup))
        .route("/control/reshare", post(reshare))
        .route("/control/terminate/:id", post(terminate))
        .route("/control/shutdown", post(shutdown_node))
        .route("/control/status", get(status))
        .with_state(ControlState { server, shutdown })
        .layer(TraceLayer::new_for_http())
}

async fn partial_beacon(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(packet): Json<PartialBeaconPacket>,
) -> ApiResult<()> {
    Ok(Json(server.partial_beacon(&peer_of(addr), packet).await?))
}

async fn broadcast_dkg(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(packet): Json<DkgPacket>,
) -> ApiResult<()> {
    Ok(Json(server.broadcast_dkg(&peer_of(addr), packet).await?))
}

async fn signal_dkg(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(packet): Json<SignalDkgPacket>,
) -> ApiResult<()> {
    Ok(Json(server.signal_dkg_participant(&peer_of(addr), packet).await?))
}

async fn push_dkg_info(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(packet): Json<DkgInfoPacket>,
) -> ApiResult<()> {
    Ok(Json(server.push_dkg_info(&peer_of(addr), packet).await?))
}

async fn get_identity(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<Identity> {
    Ok(Json(server.get_identity(&peer_of(addr), req).await?))
}

/// The first text message carries the [`SyncRequest`], beacons follow
async fn sync_chain(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        let req = match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<SyncRequest>(&text) {
                Ok(req) => req,
                Err(e) => {
                    close(socket, &Error::Serialization(e.to_string())).await;
                    return;
                }
            },
            _ => return,
        };
        debug!(peer = %addr, from_round = req.from_round, "sync stream opened");
        let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
        let call = async move { server.sync_chain(&peer_of(addr), req, tx).await };
        pump(socket, rx, call).await;
    })
}

async fn home(State(server): State<Arc<Server>>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> ApiResult<HomeResponse> {
    Ok(Json(server.home(&peer_of(addr), HomeRequest::default()).await?))
}

async fn home_of(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> ApiResult<HomeResponse> {
    let req = HomeRequest {
        beacon_id: id_from_path(&id)?,
    };
    Ok(Json(server.home(&peer_of(addr), req).await?))
}

async fn chain_info(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> ApiResult<ChainInfo> {
    let req = ChainInfoRequest {
        beacon_id: id_from_path(&id)?,
    };
    Ok(Json(server.chain_info(&peer_of(addr), req).await?))
}

async fn public_rand(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((id, round)): Path<(String, u64)>,
) -> ApiResult<PublicRandResponse> {
    let req = PublicRandRequest {
        beacon_id: id_from_path(&id)?,
        round,
    };
    Ok(Json(server.public_rand(&peer_of(addr), req).await?))
}

async fn public_rand_stream(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((id, round)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let req = PublicRandRequest {
        beacon_id: id_from_path(&id)?,
        round,
    };
    Ok(ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
        let call = async move { server.public_rand_stream(&peer_of(addr), req, tx).await };
        pump(socket, rx, call).await;
    }))
}

/// Forward what `call` produces to `socket` until either side stops.
/// A failed call closes the socket with its error as reason.
async fn pump<T, F>(socket: WebSocket, mut rx: mpsc::Receiver<T>, call: F)
where
    T: Serialize + Send + 'static,
    F: Future<Output = beacon_core::Result<()>> + Send + 'static,
{
    let call = tokio::spawn(call);
    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    let text = match serde_json::to_string(&item) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "dropping unencodable stream item");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    drop(rx);

    let outcome = match call.await {
        Ok(outcome) => outcome,
        Err(e) => Err(Error::Internal(e.to_string())),
    };
    let frame = match outcome {
        Ok(()) => None,
        Err(e) => Some(CloseFrame {
            code: 1011,
            reason: e.to_string().into(),
        }),
    };
    let _ = sink.send(Message::Close(frame)).await;
}

async fn close(mut socket: WebSocket, error: &Error) {
    let frame = CloseFrame {
        code: 1008,
        reason: error.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Serializable view of a [`LoadReport`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub loaded: Vec<NetworkId>,
    pub errors: Vec<LoadFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadFailure {
    pub folder: String,
    pub error: String,
}

impl From<&LoadReport> for LoadSummary {
    fn from(report: &LoadReport) -> Self {
        Self {
            loaded: report.loaded.clone(),
            errors: report
                .errors
                .iter()
                .map(|(folder, e)| LoadFailure {
                    folder: folder.clone(),
                    error: e.to_string(),
                })
                .collect(),
        }
    }
}

async fn load(State(state): State<ControlState>) -> Json<LoadSummary> {
    let report = state.server.load_instances();
    for id in &report.loaded {
        if let Some(instance) = state.server.instance(id) {
            if let Err(e) = instance.start_beacon(true).await {
                warn!(network = %id, error = %e, "beacon not started");
            }
        }
    }
    Json(LoadSummary::from(&report))
}

async fn setup(State(state): State<ControlState>, Json(req): Json<SetupRequest>) -> ApiResult<Group> {
    Ok(Json(state.server.setup(req).await?))
}

async fn reshare(State(state): State<ControlState>, Json(req): Json<ReshareRequest>) -> ApiResult<Group> {
    Ok(Json(state.server.reshare(req).await?))
}

async fn terminate(State(state): State<ControlState>, Path(id): Path<String>) -> ApiResult<()> {
    let id = id_from_path(&id)?;
    Ok(Json(state.server.terminate(&id).await?))
}

async fn shutdown_node(State(state): State<ControlState>) -> Json<()> {
    state.shutdown.notify_one();
    Json(())
}

async fn status(State(state): State<ControlState>) -> Json<Vec<String>> {
    Json(state.server.describe().await)
}
