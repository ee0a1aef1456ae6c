//! Session controller: top-level glue.
//!
//! Owns one signaling channel for the life of the process and, per
//! negotiation, exactly one media engine connection. All session state
//! is driven from the single loop in [`SessionController::run`]; inbound
//! envelopes, engine events and outbound envelopes are funneled through
//! it so no two inputs ever mutate the session concurrently.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::media::{MediaError, MediaSession, WebRtcMediaSession};
use crate::negotiation::{NegotiationMachine, NegotiationState};
use crate::signaling::{ChannelError, SignalingChannel};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Start the negotiation by publishing an offer.
    Offerer,
    /// Wait for the counterpart's offer.
    Answerer,
}

pub struct SessionController {
    config: CallConfig,
    signaling: Arc<SignalingChannel>,
    generation: u64,
}

impl SessionController {
    pub async fn connect(config: CallConfig) -> Result<Self, SessionError> {
        let signaling =
            SignalingChannel::connect(&config.signaling_base, &config.identity).await?;
        Ok(Self {
            config,
            signaling,
            generation: 0,
        })
    }

    /// Runs one negotiation until the session closes: engine failure,
    /// a teardown request, or loss of the signaling channel. Each call
    /// builds a fresh peer connection; the previous one was fully closed
    /// before the prior call returned, so no two connections coexist.
    pub async fn run(
        &mut self,
        role: CallRole,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<(), SessionError> {
        self.generation += 1;
        let generation = self.generation;
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        let media = WebRtcMediaSession::connect(&self.config, generation, engine_tx).await?;
        let mut machine = NegotiationMachine::new(
            media as Arc<dyn MediaSession>,
            self.config.identity.clone(),
            outbound_tx,
        );
        tracing::info!(target = "session", generation, ?role, "negotiation starting");

        if role == CallRole::Offerer {
            machine.start_offer().await;
        }

        let result = loop {
            if machine.state() == NegotiationState::Closed {
                break Ok(());
            }
            tokio::select! {
                inbound = self.signaling.recv() => match inbound {
                    Some(envelope) => machine.handle(envelope).await,
                    None => {
                        tracing::warn!(target = "session", "signaling stream ended");
                        break Err(SessionError::Channel(ChannelError::Closed));
                    }
                },
                Some(event) = engine_rx.recv() => {
                    if event.generation == generation {
                        machine.handle_engine_event(event.kind).await;
                    } else {
                        tracing::debug!(
                            target = "session",
                            stale = event.generation,
                            current = generation,
                            "discarding event from superseded connection"
                        );
                    }
                },
                Some(envelope) = outbound_rx.recv() => {
                    if let Err(err) = self.signaling.send(&envelope).await {
                        tracing::warn!(target = "session", error = %err, "outbound send failed");
                        break Err(SessionError::Channel(err));
                    }
                },
                Some(()) = shutdown.recv() => {
                    tracing::info!(target = "session", "teardown requested");
                    break Ok(());
                },
            }
        };

        // The media engine (and with it any attached local capture) is
        // released before the signaling channel: engine callbacks that
        // fire during teardown land on this generation's channel and are
        // never seen by a later session.
        machine.close().await;
        tracing::info!(target = "session", generation, "negotiation finished");
        result
    }
}
