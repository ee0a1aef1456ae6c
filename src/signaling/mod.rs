//! Signaling channel adapter.
//!
//! The channel is an HTTP push stream of newline-delimited
//! `data:<envelope-json>` messages plus a message POST for the outbound
//! direction. The stream is consumed on a background task; decoded
//! envelopes are handed to the controller over a channel in arrival
//! order. Undecodable input is logged and dropped, never fatal.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use crate::protocol::{self, SignalEnvelope};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling request failed: {0}")]
    Http(String),
    #[error("unexpected signaling status {0}")]
    Status(StatusCode),
    #[error("signaling channel closed")]
    Closed,
}

fn http_error(err: reqwest::Error) -> ChannelError {
    ChannelError::Http(err.to_string())
}

pub struct SignalingChannel {
    http: Client,
    base: String,
    identity: String,
    envelope_rx: AsyncMutex<mpsc::UnboundedReceiver<SignalEnvelope>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Opens the push stream and starts consuming it. The returned
    /// channel is live until the stream ends or the value is dropped.
    pub async fn connect(base_url: &str, identity: &str) -> Result<Arc<Self>, ChannelError> {
        Url::parse(base_url).map_err(|err| {
            ChannelError::Setup(format!("invalid signaling url {base_url}: {err}"))
        })?;
        let base = base_url.trim_end_matches('/').to_string();
        let http = Client::new();

        let response = http
            .get(format!("{base}/sse"))
            .query(&[("user", identity)])
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status()));
        }
        tracing::debug!(target = "signaling", %base, identity, "push stream connected");

        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_push_stream(response, envelope_tx));

        let channel = Arc::new(Self {
            http,
            base,
            identity: identity.to_string(),
            envelope_rx: AsyncMutex::new(envelope_rx),
            tasks: Mutex::new(vec![reader]),
        });
        Ok(channel)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Next decoded envelope, in arrival order. `None` once the push
    /// stream has ended.
    pub async fn recv(&self) -> Option<SignalEnvelope> {
        let mut rx = self.envelope_rx.lock().await;
        rx.recv().await
    }

    /// Delivers an outbound envelope to the counterpart.
    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/message", self.base))
            .query(&[("user", self.identity.as_str())])
            .json(envelope)
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status()));
        }
        tracing::trace!(
            target = "signaling",
            event = %envelope.event.as_str(),
            "envelope sent"
        );
        Ok(())
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn read_push_stream(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "push stream error");
                break;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&byte| byte == b'\n') {
            let line = buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            let Some(json) = extract_payload(line.trim_end_matches('\r')) else {
                continue;
            };
            match protocol::decode(json) {
                Ok(envelope) => {
                    tracing::trace!(
                        target = "signaling",
                        event = %envelope.event.as_str(),
                        from = %envelope.user_name,
                        "envelope received"
                    );
                    if tx.send(envelope).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    // Bad input is dropped; the channel keeps consuming.
                    tracing::warn!(
                        target = "signaling",
                        error = %err,
                        "dropping undecodable message"
                    );
                }
            }
        }
    }
    tracing::debug!(target = "signaling", "push stream ended");
}

/// Strips the `data:` framing tag. Keep-alive blanks, comment lines and
/// any other framing noise yield `None`.
fn extract_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    if rest.is_empty() { None } else { Some(rest) }
}
