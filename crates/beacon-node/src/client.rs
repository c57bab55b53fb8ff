//! Outgoing calls over HTTP/WebSocket: the peer transport of the daemon
//! and the client the CLI uses against the control listener

use crate::gateway::{error_from_wire, id_to_path, ErrorBody, LoadSummary};
use async_trait::async_trait;
use beacon_core::net::{
    ChainInfoRequest, DkgInfoPacket, DkgPacket, IdentityRequest, PartialBeaconPacket, ProtocolClient,
    PublicRandRequest, PublicRandResponse, SignalDkgPacket, SyncRequest,
};
use beacon_core::{Beacon, ChainInfo, Error, Group, Identity, NetworkId, ReshareRequest, Result, SetupRequest};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

/// Capacity of the channel behind a sync stream
const SYNC_BUFFER: usize = 64;

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    if response.status().is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::Serialization(e.to_string()));
    }
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(error_from_wire(body)),
        Err(_) => Err(Error::Transport(format!("request failed with status {}", status))),
    }
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

/// HTTP client for the peer routes of other nodes
pub struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    async fn post<B, T>(&self, to: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("http://{}{}", to, path))
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, to: &str, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("http://{}{}", to, path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for HttpClient {
    async fn partial_beacon(&self, to: &str, packet: PartialBeaconPacket) -> Result<()> {
        self.post(to, "/peer/partial", &packet).await
    }

    async fn broadcast_dkg(&self, to: &str, packet: DkgPacket) -> Result<()> {
        self.post(to, "/peer/dkg", &packet).await
    }

    async fn signal_dkg_participant(&self, to: &str, packet: SignalDkgPacket) -> Result<()> {
        self.post(to, "/peer/signal", &packet).await
    }

    async fn push_dkg_info(&self, to: &str, packet: DkgInfoPacket) -> Result<()> {
        self.post(to, "/peer/info", &packet).await
    }

    #[instrument(skip(self, req), fields(from_round = req.from_round))]
    async fn sync_chain(&self, to: &str, req: SyncRequest) -> Result<mpsc::Receiver<Beacon>> {
        let url = format!("ws://{}/peer/sync", to);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.map_err(transport)?;
        let request = serde_json::to_string(&req)?;
        ws.send(Message::Text(request)).await.map_err(transport)?;

        let (tx, rx) = mpsc::channel(SYNC_BUFFER);
        let peer = to.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Beacon>(&text) {
                            Ok(beacon) => {
                                if tx.send(beacon).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "undecodable beacon in sync stream");
                                break;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame.filter(|f| !f.reason.is_empty()) {
                                debug!(peer = %peer, reason = %frame.reason, "sync stream closed by peer");
                            }
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(peer = %peer, error = %e, "sync stream failed");
                            return;
                        }
                        None => return,
                    },
                    _ = tx.closed() => break,
                }
            }
            let _ = ws.close(None).await;
        });
        Ok(rx)
    }

    async fn get_identity(&self, to: &str, req: IdentityRequest) -> Result<Identity> {
        self.post(to, "/peer/identity", &req).await
    }

    async fn chain_info(&self, to: &str, req: ChainInfoRequest) -> Result<ChainInfo> {
        self.get(to, &format!("/public/{}/info", id_to_path(&req.beacon_id)))
            .await
    }

    async fn public_rand(&self, to: &str, req: PublicRandRequest) -> Result<PublicRandResponse> {
        let path = format!("/public/{}/{}", id_to_path(&req.beacon_id), req.round);
        match self.get(to, &path).await {
            Err(Error::Transport(m)) if m.starts_with("round_not_found") => Err(Error::RoundNotFound(req.round)),
            other => other,
        }
    }
}

/// Client of the local control listener
pub struct ControlClient {
    client: Client,
    url: String,
}

impl ControlClient {
    pub fn new(listen: &str) -> Self {
        Self {
            client: Client::new(),
            url: format!("http://{}", listen.trim_end_matches('/')),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    pub async fn setup(&self, req: &SetupRequest) -> Result<Group> {
        self.post("/control/setup", req).await
    }

    pub async fn reshare(&self, req: &ReshareRequest) -> Result<Group> {
        self.post("/control/reshare", req).await
    }

    pub async fn load(&self) -> Result<LoadSummary> {
        self.post("/control/load", &()).await
    }

    pub async fn terminate(&self, id: &NetworkId) -> Result<()> {
        self.post(&format!("/control/terminate/{}", id_to_path(id)), &())
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.post("/control/shutdown", &()).await
    }

    pub async fn status(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/control/status", self.url))
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }
}
