//! Quality snapshots from raw stats reports
//!
//! The native layer hands over its stats report as JSON: an object (or
//! array) of W3C stats entries. Entries are read tolerantly; unknown or
//! malformed ones are skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use tokio::time::Instant;

/// Inbound audio figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioQuality {
    /// Bits per second over the last interval
    pub bitrate: u64,
    pub packets_lost: u64,
    pub packets_received: u64,
    /// Milliseconds
    pub jitter: f64,
    /// Milliseconds, from the selected candidate pair
    pub round_trip_time: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Inbound video figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoQuality {
    /// Bits per second over the last interval
    pub bitrate: u64,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub frame_rate: f64,
    pub resolution: Resolution,
}

/// The selected candidate pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// host, srflx, prflx or relay (local side)
    pub candidate_type: String,
    pub protocol: String,
    pub local_address: String,
    pub remote_address: String,
}

/// One quality sample for a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallQuality {
    pub audio: AudioQuality,
    pub video: VideoQuality,
    pub connection: ConnectionInfo,
    pub sampled_at: SystemTime,
}

impl CallQuality {
    /// Packet loss over both kinds (0.0 - 1.0)
    pub fn packet_loss_rate(&self) -> f64 {
        let lost = self.audio.packets_lost + self.video.packets_lost;
        let received = self.audio.packets_received + self.video.packets_received;
        if lost + received == 0 {
            return 0.0;
        }
        lost as f64 / (lost + received) as f64
    }

    /// Score from 0 to 100
    ///
    /// Starts at 100. Round trip above 100ms costs a point per 10ms (max 30),
    /// each 1% of loss costs 10 points (max 40), jitter above 30ms costs a
    /// point per 5ms (max 20).
    pub fn score(&self) -> u32 {
        let mut score = 100u32;

        let latency_ms = self.audio.round_trip_time;
        if latency_ms > 100.0 {
            let deduction = ((latency_ms - 100.0) / 10.0).min(30.0) as u32;
            score = score.saturating_sub(deduction);
        }

        let loss_deduction = (self.packet_loss_rate() * 100.0 * 10.0).min(40.0) as u32;
        score = score.saturating_sub(loss_deduction);

        let jitter_ms = self.audio.jitter;
        if jitter_ms > 30.0 {
            let deduction = ((jitter_ms - 30.0) / 5.0).min(20.0) as u32;
            score = score.saturating_sub(deduction);
        }

        score
    }

    pub fn is_acceptable(&self) -> bool {
        self.score() >= 50
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct InboundTotals {
    bytes: u64,
    packets_lost: u64,
    packets_received: u64,
    jitter_s: f64,
    frame_rate: f64,
    width: u32,
    height: u32,
}

#[derive(Debug, Default, Clone)]
struct ReportSummary {
    audio: InboundTotals,
    video: InboundTotals,
    round_trip_time_s: f64,
    connection: Option<ConnectionInfo>,
}

fn entries(report: &Value) -> Vec<&Value> {
    match report {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    }
}

/// Lowercase with separators dropped: "candidate-pair", "candidatePair"
/// and "CandidatePair" all become "candidatepair"
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn field<'a>(entry: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| entry.get(*name))
}

fn text(entry: &Value, names: &[&str]) -> Option<String> {
    field(entry, names).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number(entry: &Value, names: &[&str]) -> f64 {
    field(entry, names).and_then(Value::as_f64).unwrap_or(0.0)
}

fn count(entry: &Value, names: &[&str]) -> u64 {
    // packetsLost is signed in the W3C model
    number(entry, names).max(0.0) as u64
}

fn stats_type(entry: &Value) -> Option<String> {
    text(entry, &["type", "statsType", "stats_type"]).map(|t| normalize(&t))
}

fn candidate_type(raw: &str) -> String {
    match normalize(raw).as_str() {
        "serverreflexive" | "srflx" => "srflx".to_string(),
        "peerreflexive" | "prflx" => "prflx".to_string(),
        "relay" | "relayed" => "relay".to_string(),
        "host" => "host".to_string(),
        other => other.to_string(),
    }
}

fn address(entry: &Value) -> String {
    let ip = text(entry, &["address", "ip"]).unwrap_or_default();
    let port = text(entry, &["port"]);
    match port {
        Some(port) if !ip.is_empty() => format!("{}:{}", ip, port),
        _ => ip,
    }
}

fn summarize(report: &Value) -> ReportSummary {
    let all = entries(report);
    let mut summary = ReportSummary::default();

    let mut chosen_pair: Option<&Value> = None;
    for entry in &all {
        match stats_type(entry).as_deref() {
            Some("inboundrtp") => {
                let kind = text(entry, &["kind", "mediaType", "media_type"])
                    .map(|k| normalize(&k))
                    .unwrap_or_default();
                let totals = match kind.as_str() {
                    "audio" => &mut summary.audio,
                    "video" => &mut summary.video,
                    _ => continue,
                };
                totals.bytes += count(entry, &["bytesReceived", "bytes_received"]);
                totals.packets_lost += count(entry, &["packetsLost", "packets_lost"]);
                totals.packets_received += count(entry, &["packetsReceived", "packets_received"]);
                totals.jitter_s = totals.jitter_s.max(number(entry, &["jitter"]));
                totals.frame_rate = totals
                    .frame_rate
                    .max(number(entry, &["framesPerSecond", "frames_per_second"]));
                totals.width = totals
                    .width
                    .max(number(entry, &["frameWidth", "frame_width"]) as u32);
                totals.height = totals
                    .height
                    .max(number(entry, &["frameHeight", "frame_height"]) as u32);
            }
            Some("candidatepair") => {
                let succeeded = text(entry, &["state"])
                    .map(|s| normalize(&s) == "succeeded")
                    .unwrap_or(false);
                if !succeeded {
                    continue;
                }
                let nominated = field(entry, &["nominated"])
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let replace = match chosen_pair {
                    None => true,
                    Some(current) => {
                        nominated
                            && !field(current, &["nominated"])
                                .and_then(Value::as_bool)
                                .unwrap_or(false)
                    }
                };
                if replace {
                    chosen_pair = Some(*entry);
                }
            }
            _ => {}
        }
    }

    if let Some(pair) = chosen_pair {
        summary.round_trip_time_s = number(
            pair,
            &["currentRoundTripTime", "current_round_trip_time", "roundTripTime"],
        );

        let local_id = text(pair, &["localCandidateId", "local_candidate_id"]);
        let remote_id = text(pair, &["remoteCandidateId", "remote_candidate_id"]);
        let find = |id: &Option<String>| {
            id.as_ref().and_then(|id| {
                all.iter()
                    .find(|e| text(e, &["id"]).as_deref() == Some(id.as_str()))
                    .copied()
            })
        };

        let mut info = ConnectionInfo::default();
        if let Some(local) = find(&local_id) {
            info.candidate_type = text(local, &["candidateType", "candidate_type"])
                .map(|t| candidate_type(&t))
                .unwrap_or_default();
            info.protocol = text(local, &["protocol", "networkType", "network_type"])
                .map(|p| p.to_ascii_lowercase())
                .unwrap_or_default();
            info.local_address = address(local);
        }
        if let Some(remote) = find(&remote_id) {
            info.remote_address = address(remote);
            if info.protocol.is_empty() {
                info.protocol = text(remote, &["protocol"])
                    .map(|p| p.to_ascii_lowercase())
                    .unwrap_or_default();
            }
        }
        summary.connection = Some(info);
    }

    summary
}

/// Turns successive reports into snapshots
///
/// Bitrate is the byte delta since the previous report over the time
/// measured between the two calls; the first report yields 0.
#[derive(Debug, Default)]
pub struct QualitySampler {
    last: Option<(Instant, u64, u64)>,
}

impl QualitySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the report has no succeeded candidate pair
    pub fn sample(&mut self, report: &Value, now: Instant) -> Option<CallQuality> {
        let summary = summarize(report);

        let (audio_bitrate, video_bitrate) = match self.last {
            Some((at, audio_bytes, video_bytes)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        (summary.audio.bytes.saturating_sub(audio_bytes) as f64 * 8.0 / elapsed)
                            as u64,
                        (summary.video.bytes.saturating_sub(video_bytes) as f64 * 8.0 / elapsed)
                            as u64,
                    )
                } else {
                    (0, 0)
                }
            }
            None => (0, 0),
        };
        self.last = Some((now, summary.audio.bytes, summary.video.bytes));

        let connection = summary.connection?;
        let round_trip_time = summary.round_trip_time_s * 1000.0;

        Some(CallQuality {
            audio: AudioQuality {
                bitrate: audio_bitrate,
                packets_lost: summary.audio.packets_lost,
                packets_received: summary.audio.packets_received,
                jitter: summary.audio.jitter_s * 1000.0,
                round_trip_time,
            },
            video: VideoQuality {
                bitrate: video_bitrate,
                packets_lost: summary.video.packets_lost,
                packets_received: summary.video.packets_received,
                frame_rate: summary.video.frame_rate,
                resolution: Resolution {
                    width: summary.video.width,
                    height: summary.video.height,
                },
            },
            connection,
            sampled_at: SystemTime::now(),
        })
    }
}
