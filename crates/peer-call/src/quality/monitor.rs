//! Periodic stats sampling per connection

use super::stats::QualitySampler;
use crate::events::{CallEvent, EventSink};
use crate::peer::PeerConnection;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Samples one connection every `interval` until it closes
///
/// Holds only a weak reference; the loop ends by itself once the
/// connection is dropped, and `PeerConnection::close` aborts it earlier.
pub(crate) struct QualityMonitor;

impl QualityMonitor {
    pub(crate) fn spawn(
        connection: Weak<PeerConnection>,
        interval: Duration,
        events: Arc<EventSink>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sampler = QualitySampler::new();
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if connection.is_closed() {
                    break;
                }

                let report = match connection.native().get_stats().await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(participant = %connection.participant(), "Failed to get stats: {}", e);
                        continue;
                    }
                };

                let Some(quality) = sampler.sample(&report, Instant::now()) else {
                    debug!(participant = %connection.participant(), "No succeeded candidate pair yet");
                    continue;
                };

                if !quality.is_acceptable() {
                    warn!(
                        call_id = %connection.call_id(),
                        participant = %connection.participant(),
                        score = quality.score(),
                        rtt_ms = quality.audio.round_trip_time,
                        "Degraded call quality"
                    );
                }

                connection.set_quality(quality.clone());
                events.emit(CallEvent::QualityUpdate {
                    call_id: connection.call_id().clone(),
                    participant: connection.participant().clone(),
                    quality,
                });
            }

            debug!("Quality monitor stopped");
        })
    }
}
