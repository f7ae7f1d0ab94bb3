//! HTTP Substrate
//!
//! Each rank serves `POST /internal/message` and pushes decoded envelopes into its inbox.
//! Outgoing messages are bincode bodies posted with `reqwest`. The network thread awaits
//! every send before starting the next, which keeps delivery ordered per destination.

use super::fabric::{Fabric, Inbox, SendFuture};
use super::types::{Message, Rank};
use crate::error::{Error, Result};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Internal endpoint receiving one envelope per request.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";

/// Peers may still be binding when the job starts, so connects are retried.
const CONNECT_ATTEMPTS: usize = 20;

pub struct HttpFabric {
    rank: Rank,
    peers: Vec<SocketAddr>,
    http_client: reqwest::Client,
}

impl HttpFabric {
    /// Binds the endpoint of `rank` (taken from `peers[rank]`) and starts serving it.
    pub async fn bind(rank: Rank, peers: Vec<SocketAddr>) -> Result<(Arc<dyn Fabric>, Inbox)> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| Error::Config(format!("no peer address for rank {}", rank)))?;

        let (tx, inbox) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Rank {} listening for messages on {}", rank, addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Message endpoint stopped: {}", e);
            }
        });

        let fabric: Arc<dyn Fabric> = Arc::new(Self {
            rank,
            peers,
            http_client: reqwest::Client::new(),
        });
        Ok((fabric, inbox))
    }

    async fn post_with_retry(&self, dst: Rank, body: Vec<u8>) -> Result<()> {
        let addr = self
            .peers
            .get(dst)
            .ok_or_else(|| Error::Transport(format!("no such rank {}", dst)))?;
        let url = format!("http://{}{}", addr, ENDPOINT_MESSAGE);
        let mut delay_ms = 150u64;

        for attempt in 0..CONNECT_ATTEMPTS {
            let response = self.http_client.post(url.clone()).body(body.clone()).send().await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    return Err(Error::Transport(format!(
                        "rank {} rejected message: {}",
                        dst,
                        resp.status()
                    )));
                }
                Err(e) if e.is_connect() && attempt + 1 < CONNECT_ATTEMPTS => {
                    tracing::warn!("Rank {} not reachable yet (attempt {}): {}", dst, attempt + 1, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
                Err(e) => return Err(Error::Transport(e.to_string())),
            }
        }

        Err(Error::Transport(format!("rank {} unreachable", dst)))
    }
}

impl Fabric for HttpFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dst: Rank, msg: Message) -> SendFuture<'_> {
        Box::pin(async move {
            let body = msg.encode()?;
            self.post_with_retry(dst, body).await
        })
    }
}

async fn handle_message(
    State(inbox): State<mpsc::UnboundedSender<Message>>,
    body: Bytes,
) -> StatusCode {
    match Message::decode(&body) {
        Ok(msg) => match inbox.send(msg) {
            Ok(()) => StatusCode::OK,
            Err(_) => StatusCode::SERVICE_UNAVAILABLE,
        },
        Err(e) => {
            tracing::error!("Failed to decode incoming message: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}
