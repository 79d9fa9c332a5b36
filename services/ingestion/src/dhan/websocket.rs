//! Dhan market-feed WebSocket transport
//!
//! Holds one persistent connection, sends chunked JSON subscriptions, and
//! pushes decoded packets onto a bounded channel. The channel send is the
//! backpressure point: a full pipeline pauses reads here. The server pings
//! every 10 s and drops peers that go quiet, so a 40 s read-idle window
//! means the transport is dead and triggers the reconnect policy.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use services_common::credentials::CredentialProvider;
use services_common::{ExchangeSegment, FeedError};

use super::parser::{parse_packet, split_frames, TickPacket};
use crate::pipeline::PipelineCounters;

/// The feed rejects subscription messages above this many instruments.
pub const MAX_INSTRUMENTS_PER_MESSAGE: usize = 100;

/// Pause between subscription chunks to stay under the server rate limit.
const SUBSCRIPTION_PACING: Duration = Duration::from_millis(100);

/// Subscription depth for the tick feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Ticker,
    Quote,
    Full,
    FullDepth,
}

impl SubscriptionMode {
    pub fn request_code(self) -> u16 {
        match self {
            Self::Ticker => 15,
            Self::Quote => 17,
            Self::Full => 21,
            Self::FullDepth => 23,
        }
    }
}

/// One instrument to subscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub security_id: String,
    pub segment: ExchangeSegment,
}

#[derive(Serialize)]
struct SubscribeInstrument {
    #[serde(rename = "ExchangeSegment")]
    exchange_segment: &'static str,
    #[serde(rename = "SecurityId")]
    security_id: String,
}

#[derive(Serialize)]
struct SubscribeRequest {
    #[serde(rename = "RequestCode")]
    request_code: u16,
    #[serde(rename = "InstrumentCount")]
    instrument_count: usize,
    #[serde(rename = "InstrumentList")]
    instrument_list: Vec<SubscribeInstrument>,
}

/// Build the chunked subscription messages for a set of instruments.
pub fn build_subscription_messages(
    mode: SubscriptionMode,
    entries: &[SubscriptionEntry],
) -> Result<Vec<String>, serde_json::Error> {
    entries
        .chunks(MAX_INSTRUMENTS_PER_MESSAGE)
        .map(|chunk| {
            let request = SubscribeRequest {
                request_code: mode.request_code(),
                instrument_count: chunk.len(),
                instrument_list: chunk
                    .iter()
                    .map(|entry| SubscribeInstrument {
                        exchange_segment: entry.segment.as_str(),
                        security_id: entry.security_id.clone(),
                    })
                    .collect(),
            };
            serde_json::to_string(&request)
        })
        .collect()
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct DhanFeedConfig {
    pub endpoint: String,
    pub mode: SubscriptionMode,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub read_idle_timeout: Duration,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Persistent WebSocket client for the Dhan tick feed.
pub struct DhanWebSocketFeed {
    config: DhanFeedConfig,
    credentials: Arc<CredentialProvider>,
    entries: Vec<SubscriptionEntry>,
    counters: Arc<PipelineCounters>,
    shutdown: watch::Receiver<bool>,
}

impl DhanWebSocketFeed {
    pub fn new(
        config: DhanFeedConfig,
        credentials: Arc<CredentialProvider>,
        entries: Vec<SubscriptionEntry>,
        counters: Arc<PipelineCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            credentials,
            entries,
            counters,
            shutdown,
        }
    }

    /// Run until shutdown or the reconnect budget is exhausted.
    pub async fn run(mut self, tx: mpsc::Sender<TickPacket>) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let parsed_before = self.counters.frames_parsed();
            match self.run_session(&tx).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    warn!("tick feed session ended");
                }
                Err(e) => {
                    error!(error = %e, "tick feed session failed");
                }
            }

            // A session that produced data resets the budget.
            if self.counters.frames_parsed() > parsed_before {
                attempts = 0;
            }
            attempts += 1;
            self.counters.record_reconnect();
            if attempts > self.config.reconnect_attempts {
                return Err(FeedError::ReconnectExhausted(self.config.reconnect_attempts).into());
            }

            info!(
                attempt = attempts,
                max = self.config.reconnect_attempts,
                delay_secs = self.config.reconnect_delay.as_secs(),
                "reconnecting tick feed"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn run_session(&mut self, tx: &mpsc::Sender<TickPacket>) -> Result<SessionEnd> {
        let creds = self.credentials.refresh().await?;
        let ws_url = format!(
            "{}?version=2&token={}&clientId={}&authType=2",
            self.config.endpoint,
            creds.access_token.trim(),
            creds.client_id.trim()
        );
        url::Url::parse(&ws_url).context("invalid feed URL")?;

        let (ws, response) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        info!(status = %response.status(), "tick feed connected");
        let (mut write, mut read) = ws.split();

        let messages = build_subscription_messages(self.config.mode, &self.entries)?;
        let chunk_count = messages.len();
        for (i, message) in messages.into_iter().enumerate() {
            write.send(Message::Text(message)).await?;
            if i + 1 < chunk_count {
                tokio::time::sleep(SUBSCRIPTION_PACING).await;
            }
        }
        info!(
            instruments = self.entries.len(),
            chunks = chunk_count,
            code = self.config.mode.request_code(),
            "subscriptions sent"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                next = timeout(self.config.read_idle_timeout, read.next()) => {
                    let message = match next {
                        Err(_) => {
                            warn!(
                                idle_secs = self.config.read_idle_timeout.as_secs(),
                                "read-idle budget exceeded, transport presumed dead"
                            );
                            return Ok(SessionEnd::Disconnected);
                        }
                        Ok(None) => return Ok(SessionEnd::Disconnected),
                        Ok(Some(Err(e))) => {
                            error!(error = %e, "websocket error");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Ok(Some(Ok(message))) => message,
                    };

                    match message {
                        Message::Binary(data) => {
                            for frame in split_frames(&data) {
                                self.counters.record_frame_received();
                                match parse_packet(frame) {
                                    Ok(TickPacket::Disconnect { reason_code, .. }) => {
                                        let _ = write.send(Message::Close(None)).await;
                                        return Err(FeedError::ServerDisconnect(i32::from(
                                            reason_code,
                                        ))
                                        .into());
                                    }
                                    Ok(packet) => {
                                        self.counters.record_frame_parsed();
                                        if tx.send(packet).await.is_err() {
                                            return Ok(SessionEnd::Shutdown);
                                        }
                                    }
                                    Err(e) => {
                                        self.counters.record_frame_failed();
                                        debug!(error = %e, "frame dropped");
                                    }
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Text(text) => {
                            debug!(message = %text, "feed text message");
                        }
                        Message::Close(_) => {
                            info!("websocket closed by server");
                            return Ok(SessionEnd::Disconnected);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
