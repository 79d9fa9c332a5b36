//! Kite WebSocket transport
//!
//! Authentication rides on the query string (`api_key` + `access_token`).
//! Subscriptions are the two-step JSON dance: subscribe to tokens, then
//! switch them to full mode for depth. One-byte binary messages are
//! heartbeats and are dropped without counting.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use services_common::credentials::CredentialProvider;
use services_common::FeedError;

use super::parser::{parse_packet, split_packets, KiteTick};
use crate::pipeline::PipelineCounters;

/// Transport configuration for the Kite feed.
#[derive(Debug, Clone)]
pub struct KiteFeedConfig {
    pub endpoint: String,
    pub api_key: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub read_idle_timeout: Duration,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Persistent WebSocket client for the Kite tick feed.
pub struct KiteWebSocketFeed {
    config: KiteFeedConfig,
    credentials: Arc<CredentialProvider>,
    tokens: Vec<u32>,
    counters: Arc<PipelineCounters>,
    shutdown: watch::Receiver<bool>,
}

impl KiteWebSocketFeed {
    pub fn new(
        config: KiteFeedConfig,
        credentials: Arc<CredentialProvider>,
        tokens: Vec<u32>,
        counters: Arc<PipelineCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            credentials,
            tokens,
            counters,
            shutdown,
        }
    }

    pub async fn run(mut self, tx: mpsc::Sender<KiteTick>) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let parsed_before = self.counters.frames_parsed();
            match self.run_session(&tx).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => warn!("kite feed session ended"),
                Err(e) => error!(error = %e, "kite feed session failed"),
            }
            if self.counters.frames_parsed() > parsed_before {
                attempts = 0;
            }
            attempts += 1;
            self.counters.record_reconnect();
            if attempts > self.config.reconnect_attempts {
                return Err(FeedError::ReconnectExhausted(self.config.reconnect_attempts).into());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn run_session(&mut self, tx: &mpsc::Sender<KiteTick>) -> Result<SessionEnd> {
        let creds = self.credentials.refresh().await?;
        let ws_url = format!(
            "{}?api_key={}&access_token={}",
            self.config.endpoint,
            self.config.api_key.trim(),
            creds.access_token.trim()
        );
        url::Url::parse(&ws_url).context("invalid kite feed URL")?;

        let (ws, response) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        info!(status = %response.status(), "kite feed connected");
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({ "a": "subscribe", "v": &self.tokens });
        write.send(Message::Text(subscribe.to_string())).await?;
        let mode = serde_json::json!({ "a": "mode", "v": ["full", &self.tokens] });
        write.send(Message::Text(mode.to_string())).await?;
        info!(tokens = self.tokens.len(), "subscribed in full mode");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                next = timeout(self.config.read_idle_timeout, read.next()) => {
                    let message = match next {
                        Err(_) => {
                            warn!("read-idle budget exceeded on kite feed");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Ok(None) => return Ok(SessionEnd::Disconnected),
                        Ok(Some(Err(e))) => {
                            error!(error = %e, "kite websocket error");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Ok(Some(Ok(message))) => message,
                    };

                    match message {
                        Message::Binary(data) => {
                            if data.len() <= 1 {
                                // Heartbeat byte.
                                continue;
                            }
                            let packets = match split_packets(&data) {
                                Ok(packets) => packets,
                                Err(e) => {
                                    self.counters.record_frame_received();
                                    self.counters.record_frame_failed();
                                    debug!(error = %e, "kite message dropped");
                                    continue;
                                }
                            };
                            for packet in packets {
                                self.counters.record_frame_received();
                                match parse_packet(packet) {
                                    Ok(tick) => {
                                        self.counters.record_frame_parsed();
                                        if tx.send(tick).await.is_err() {
                                            return Ok(SessionEnd::Shutdown);
                                        }
                                    }
                                    Err(e) => {
                                        self.counters.record_frame_failed();
                                        debug!(error = %e, "kite packet dropped");
                                    }
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Text(text) => debug!(message = %text, "kite text message"),
                        Message::Close(_) => return Ok(SessionEnd::Disconnected),
                        _ => {}
                    }
                }
            }
        }
    }
}
