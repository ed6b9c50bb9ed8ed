//! SDP offer/answer and ICE candidate exchange
//!
//! The engine never talks to a transport. Everything it wants delivered to a
//! remote participant is emitted as [`CallEvent::Signal`]; inbound messages
//! come back through the `handle_*` methods of the service.
//!
//! Per connection, candidates that arrive before the remote description are
//! queued and applied in arrival order right after it is set.

use crate::channels::CONTROL_CHANNEL_LABEL;
use crate::events::{CallEvent, EventSink};
use crate::media::{LocalTrack, MediaStream};
use crate::peer::{IceCandidate, PeerConnection, SessionDescription, SignalingState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message exchanged with a remote participant over the host transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

/// Candidates waiting for the remote description
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Take everything in arrival order
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Negotiation bookkeeping of one connection
///
/// `generation` increments on every offer sent or awaited. A timeout only
/// fails the generation it was armed for.
#[derive(Debug, Default)]
pub(crate) struct Negotiation {
    remote_description_set: bool,
    pending: CandidateBuffer,
    generation: u64,
    in_flight: bool,
    failed: bool,
}

impl Negotiation {
    fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.in_flight = true;
        self.failed = false;
        self.generation
    }

    fn complete(&mut self) {
        self.in_flight = false;
    }

    fn fail(&mut self) {
        self.in_flight = false;
        self.failed = true;
    }

    fn is_pending(&self, generation: u64) -> bool {
        self.in_flight && self.generation == generation
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending.len()
    }
}

/// What a timeout was waiting for
#[derive(Debug, Clone, Copy)]
enum Awaiting {
    Answer,
    Offer,
}

/// Runs after a timed-out negotiation was reported
pub(crate) type TimeoutHook = Arc<dyn Fn(Arc<PeerConnection>) + Send + Sync>;

/// Drives offer/answer on registry connections
pub(crate) struct NegotiationEngine {
    events: Arc<EventSink>,
    timeout: Duration,
    debug: bool,
    on_timeout: Option<TimeoutHook>,
}

impl NegotiationEngine {
    pub(crate) fn new(events: Arc<EventSink>, timeout: Duration, debug: bool) -> Self {
        Self {
            events,
            timeout,
            debug,
            on_timeout: None,
        }
    }

    pub(crate) fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.on_timeout = Some(hook);
        self
    }

    /// Initiator path: tracks, control channel, first offer
    pub(crate) async fn start_initiator(
        &self,
        connection: &Arc<PeerConnection>,
        stream: &MediaStream,
        video: Option<LocalTrack>,
    ) -> Result<()> {
        connection.add_local_tracks(stream, video).await?;

        let channel = connection
            .native()
            .create_data_channel(CONTROL_CHANNEL_LABEL)
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to create control channel: {}", e)))?;
        connection.set_data_channel(channel);

        self.send_offer(connection, false).await?;
        Ok(())
    }

    /// Create an offer, set it locally and emit it
    ///
    /// Returns the offer SDP. `ice_restart` gathers fresh credentials.
    pub(crate) async fn send_offer(
        &self,
        connection: &Arc<PeerConnection>,
        ice_restart: bool,
    ) -> Result<String> {
        let mut negotiation = connection.negotiation().lock().await;
        self.offer_locked(connection, &mut negotiation, ice_restart)
            .await
    }

    /// Re-offer on a native negotiation-needed event
    ///
    /// Only the initiator re-offers, and only from `Stable` with nothing in
    /// flight. Returns `None` when skipped.
    pub(crate) async fn on_negotiation_needed(
        &self,
        connection: &Arc<PeerConnection>,
    ) -> Result<Option<String>> {
        if !connection.is_initiator() {
            debug!(participant = %connection.participant(), "Responder ignores negotiation-needed");
            return Ok(None);
        }

        let mut negotiation = connection.negotiation().lock().await;
        let signaling = connection.native().signaling_state();
        if signaling != SignalingState::Stable || negotiation.in_flight {
            debug!(
                participant = %connection.participant(),
                ?signaling,
                in_flight = negotiation.in_flight,
                "Skipping renegotiation"
            );
            return Ok(None);
        }

        info!(participant = %connection.participant(), "Renegotiating");
        self.offer_locked(connection, &mut negotiation, false)
            .await
            .map(Some)
    }

    async fn offer_locked(
        &self,
        connection: &Arc<PeerConnection>,
        negotiation: &mut Negotiation,
        ice_restart: bool,
    ) -> Result<String> {
        let generation = negotiation.begin();
        let native = connection.native();

        let offer = match native.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(e) => {
                negotiation.fail();
                return Err(Error::Signaling(format!("Failed to create offer: {}", e)));
            }
        };
        if let Err(e) = native.set_local_description(offer.clone()).await {
            negotiation.fail();
            return Err(Error::Signaling(format!(
                "Failed to set local offer: {}",
                e
            )));
        }

        self.log_sdp(connection, "offer", &offer.sdp);
        debug!(
            participant = %connection.participant(),
            generation,
            ice_restart,
            "Offer created"
        );

        self.events.emit(CallEvent::Signal {
            call_id: connection.call_id().clone(),
            remote_id: connection.participant().clone(),
            message: SignalingMessage::Offer {
                sdp: offer.sdp.clone(),
            },
        });
        self.arm_timeout(connection, generation, Awaiting::Answer);

        Ok(offer.sdp)
    }

    /// Responder side: wait for the remote offer after join
    pub(crate) async fn arm_offer_wait(&self, connection: &Arc<PeerConnection>) {
        let generation = connection.negotiation().lock().await.begin();
        self.arm_timeout(connection, generation, Awaiting::Offer);
    }

    /// Apply a remote offer and emit the answer
    pub(crate) async fn apply_offer(
        &self,
        connection: &Arc<PeerConnection>,
        sdp: String,
    ) -> Result<()> {
        let mut negotiation = connection.negotiation().lock().await;
        let native = connection.native();

        self.log_sdp(connection, "remote offer", &sdp);
        if let Err(e) = native
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            negotiation.fail();
            return Err(Error::Signaling(format!(
                "Failed to apply remote offer: {}",
                e
            )));
        }
        negotiation.remote_description_set = true;
        self.flush_candidates(connection, &mut negotiation).await;

        let answer = match native.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                negotiation.fail();
                return Err(Error::Signaling(format!("Failed to create answer: {}", e)));
            }
        };
        if let Err(e) = native.set_local_description(answer.clone()).await {
            negotiation.fail();
            return Err(Error::Signaling(format!(
                "Failed to set local answer: {}",
                e
            )));
        }
        negotiation.complete();
        drop(negotiation);

        self.log_sdp(connection, "answer", &answer.sdp);
        self.events.emit(CallEvent::Signal {
            call_id: connection.call_id().clone(),
            remote_id: connection.participant().clone(),
            message: SignalingMessage::Answer { sdp: answer.sdp },
        });
        debug!(participant = %connection.participant(), "Answer sent");
        Ok(())
    }

    /// Apply the remote answer to an outstanding offer
    pub(crate) async fn apply_answer(
        &self,
        connection: &Arc<PeerConnection>,
        sdp: String,
    ) -> Result<()> {
        let mut negotiation = connection.negotiation().lock().await;

        self.log_sdp(connection, "remote answer", &sdp);
        if let Err(e) = connection
            .native()
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            negotiation.fail();
            return Err(Error::Signaling(format!(
                "Failed to apply remote answer: {}",
                e
            )));
        }
        negotiation.remote_description_set = true;
        self.flush_candidates(connection, &mut negotiation).await;
        negotiation.complete();

        debug!(participant = %connection.participant(), "Answer applied");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    ///
    /// Returns `true` when applied immediately.
    pub(crate) async fn add_candidate(
        &self,
        connection: &Arc<PeerConnection>,
        candidate: IceCandidate,
    ) -> Result<bool> {
        let mut negotiation = connection.negotiation().lock().await;
        if !negotiation.remote_description_set {
            negotiation.pending.push(candidate);
            debug!(
                participant = %connection.participant(),
                queued = negotiation.pending.len(),
                "Buffered early ICE candidate"
            );
            return Ok(false);
        }

        if self.debug {
            info!(
                participant = %connection.participant(),
                bytes = candidate.candidate.len(),
                "Applying remote candidate"
            );
        }
        connection
            .native()
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidate(e.to_string()))?;
        Ok(true)
    }

    /// Forward a locally gathered candidate to the remote participant
    pub(crate) fn emit_local_candidate(&self, connection: &PeerConnection, candidate: IceCandidate) {
        if self.debug {
            info!(
                participant = %connection.participant(),
                bytes = candidate.candidate.len(),
                "Local candidate gathered"
            );
        }
        self.events.emit(CallEvent::Signal {
            call_id: connection.call_id().clone(),
            remote_id: connection.participant().clone(),
            message: SignalingMessage::IceCandidate { candidate },
        });
    }

    async fn flush_candidates(&self, connection: &PeerConnection, negotiation: &mut Negotiation) {
        let pending = negotiation.pending.drain();
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        for candidate in pending {
            if let Err(e) = connection.native().add_ice_candidate(candidate).await {
                warn!(participant = %connection.participant(), "Buffered candidate rejected: {}", e);
            }
        }
        debug!(participant = %connection.participant(), count, "Flushed buffered candidates");
    }

    fn arm_timeout(&self, connection: &Arc<PeerConnection>, generation: u64, awaiting: Awaiting) {
        let weak = Arc::downgrade(connection);
        let events = self.events.clone();
        let timeout = self.timeout;
        let on_timeout = self.on_timeout.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(connection) = weak.upgrade() else {
                return;
            };
            {
                let mut negotiation = connection.negotiation().lock().await;
                if !negotiation.is_pending(generation) {
                    return;
                }
                negotiation.fail();
            }

            warn!(
                call_id = %connection.call_id(),
                participant = %connection.participant(),
                ?awaiting,
                generation,
                "Negotiation timed out"
            );
            events.emit(CallEvent::SignalError {
                call_id: Some(connection.call_id().clone()),
                participant: connection.participant().clone(),
                error: Error::NegotiationTimeout {
                    participant: connection.participant().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            });

            if let Some(hook) = on_timeout {
                hook(connection);
            }
        });

        connection.attach_task(task);
    }

    fn log_sdp(&self, connection: &PeerConnection, kind: &str, sdp: &str) {
        if self.debug {
            info!(participant = %connection.participant(), kind, bytes = sdp.len(), "SDP");
        }
    }
}
