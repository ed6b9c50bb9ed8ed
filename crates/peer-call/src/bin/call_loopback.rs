//! In-process loopback call
//!
//! Runs two call services on the webrtc-rs backend and relays their
//! signaling to each other, exercising negotiation, the control channel and
//! quality sampling end to end.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin call_loopback -- --duration-secs 20
//!
//! # Log SDP and candidate sizes, JSON output
//! RUST_LOG=peer_call=debug cargo run --bin call_loopback -- --debug --log-json
//!
//! # Custom ICE servers and intervals
//! cargo run --bin call_loopback -- --config ./call.yaml
//! ```

use clap::Parser;
use peer_call::{
    CallEvent, CallEventReceiver, CallId, CallService, CallServiceConfig, SampleTrackDevices,
    SignalingMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Loopback call between two local participants
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// How long to keep the call up
    #[arg(long, default_value_t = 15, env = "CALL_DURATION_SECS")]
    duration_secs: u64,

    /// Service configuration file (.json, .yaml or .yml)
    #[arg(long, env = "CALL_CONFIG")]
    config: Option<PathBuf>,

    /// Quality sampling interval in milliseconds
    #[arg(long, env = "CALL_QUALITY_INTERVAL_MS")]
    quality_interval_ms: Option<u64>,

    /// Log signaling payload sizes and default to debug logging
    #[arg(long, default_value_t = false, env = "CALL_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.log_json);

    let mut config = match &args.config {
        Some(path) => CallServiceConfig::from_file(path)?,
        None => CallServiceConfig::default(),
    }
    .with_debug(args.debug);
    if let Some(ms) = args.quality_interval_ms {
        config = config.with_quality_interval(Duration::from_millis(ms));
    }
    config.validate()?;

    let (alice, alice_events) = CallService::with_webrtc(
        config.clone(),
        Arc::new(SampleTrackDevices::with_stream_prefix("alice")),
    )?;
    let (bob, bob_events) = CallService::with_webrtc(
        config,
        Arc::new(SampleTrackDevices::with_stream_prefix("bob")),
    )?;

    let alice_relay = tokio::spawn(relay("alice", alice_events, alice.clone(), bob.clone()));
    let bob_relay = tokio::spawn(relay("bob", bob_events, bob.clone(), alice.clone()));

    let call_id = CallId::generate();
    info!(call_id = %call_id, "Starting loopback call");

    bob.join_call(call_id.clone(), "alice", None).await?;
    alice.initiate_call(call_id.clone(), ["bob"], None).await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {
            info!("Call duration elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    if let Some(quality) = alice.quality("bob").await {
        info!(
            score = quality.score(),
            rtt_ms = quality.audio.round_trip_time,
            candidate = %quality.connection.candidate_type,
            "Final quality"
        );
    }

    alice.end_call(Some(&call_id)).await;
    bob.end_call(Some(&call_id)).await;
    alice.shutdown().await;
    bob.shutdown().await;

    let _ = tokio::join!(alice_relay, bob_relay);
    info!("Loopback call finished");
    Ok(())
}

/// Forward `local`'s signaling to `remote` and log the rest
async fn relay(
    name: &'static str,
    mut events: CallEventReceiver,
    local: CallService,
    remote: CallService,
) {
    while let Some(event) = events.recv().await {
        match event {
            CallEvent::Signal { message, .. } => match message {
                SignalingMessage::Offer { sdp } => remote.handle_offer(name, sdp).await,
                SignalingMessage::Answer { sdp } => remote.handle_answer(name, sdp).await,
                SignalingMessage::IceCandidate { candidate } => {
                    remote.handle_ice_candidate(name, candidate).await
                }
            },
            CallEvent::DataChannelOpen { participant, .. } => {
                let greeting = serde_json::json!({
                    "type": "greeting",
                    "from": name,
                });
                if !local.send_data_channel_message(participant, &greeting).await {
                    warn!(side = name, "Greeting not sent");
                }
            }
            CallEvent::DataChannelMessage {
                participant, data, ..
            } => {
                info!(side = name, from = %participant, "Data channel message: {}", data);
            }
            CallEvent::RemoteMediaState {
                participant, state, ..
            } => {
                info!(
                    side = name,
                    from = %participant,
                    audio = state.audio_enabled,
                    video = state.video_enabled,
                    "Remote media state"
                );
            }
            CallEvent::QualityUpdate {
                participant,
                quality,
                ..
            } => {
                info!(
                    side = name,
                    peer = %participant,
                    score = quality.score(),
                    audio_kbps = quality.audio.bitrate / 1000,
                    video_kbps = quality.video.bitrate / 1000,
                    "Quality"
                );
            }
            event if event.is_error() => {
                warn!(side = name, event = event.name(), "{:?}", event);
            }
            event => {
                info!(side = name, event = event.name(), "Call event");
            }
        }
    }
}

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "peer_call=debug,info" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
