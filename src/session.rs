//! Recorded sessions and deterministic offline replay.
//!
//! A session file is `{"patient_id": ..., "readings": [...]}` with an
//! optional `patient_id`. Each reading carries a timestamp on the receiver
//! clock and an optional radar cycle and/or IMU sample. `.gz` files are
//! decompressed transparently.
//!
//! Replay submits the same status payloads the daemon would, stamped with the
//! recorded clock as milliseconds since the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::EngineConfig;
use crate::error::{FallwatchError, Result};
use crate::escalation::{ActivityCounters, StatusChange};
use crate::link::{LinkPayload, LinkSender};
use crate::motion_classifier::MotionClassifier;
use crate::reporter::{StatusPayload, StatusSink};
use crate::sensor_fusion::{FusionEvent, ReceiverFusion};
use crate::types::{ImuSample, PatientStatus, RadarSample, TrackState};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp_ms: u64,
    #[serde(default)]
    pub radar: Option<RadarSample>,
    #[serde(default)]
    pub imu: Option<ImuSample>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub patient_id: Option<String>,
    pub readings: Vec<Reading>,
}

pub fn load_session(path: &Path) -> Result<Session> {
    let file = File::open(path)?;
    let parsed = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
    } else {
        serde_json::from_reader(BufReader::new(file))
    };
    parsed.map_err(|e| FallwatchError::Session(format!("{}: {}", path.display(), e)))
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplaySummary {
    pub readings: usize,
    pub duration_ms: u64,
    pub status_changes: Vec<StatusChange>,
    pub final_status: PatientStatus,
    pub final_track_state: TrackState,
    pub counters: ActivityCounters,
    pub link_dropped: u64,
    pub imu_samples_dropped: u64,
}

fn recorded_time(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_default()
}

struct Recorder<'a> {
    patient_id: &'a str,
    sink: &'a dyn StatusSink,
    changes: Vec<StatusChange>,
}

impl Recorder<'_> {
    fn record(&mut self, events: Vec<FusionEvent>, fusion: &ReceiverFusion) {
        for e in events {
            if let FusionEvent::StatusChanged(change) = e {
                self.sink.submit(StatusPayload::for_change(
                    self.patient_id,
                    &change,
                    &fusion.report_context(),
                    recorded_time(change.at_ms),
                ));
                self.changes.push(change);
            }
        }
    }
}

/// Run a session through classifier, link and fusion on the recorded clock.
/// Deadlines are evaluated every `tick_ms` of recorded time; every status
/// change is also submitted to `sink`.
pub fn run_session(
    session: &Session,
    config: &EngineConfig,
    tick_ms: u64,
    sink: &dyn StatusSink,
) -> ReplaySummary {
    let tick_ms = tick_ms.max(1);
    let mut readings: Vec<&Reading> = session.readings.iter().collect();
    readings.sort_by_key(|r| r.timestamp_ms);

    let mut fusion = ReceiverFusion::new(config.clone());
    let mut classifier = MotionClassifier::new(config);
    let mut sender = LinkSender::new();
    let mut recorder = Recorder {
        patient_id: session.patient_id.as_deref().unwrap_or("replay"),
        sink,
        changes: Vec::new(),
    };

    let start = readings.first().map(|r| r.timestamp_ms).unwrap_or(0);
    let mut next_tick = start;
    let mut last_telemetry: Option<u64> = None;

    for reading in &readings {
        let ts = reading.timestamp_ms;
        while next_tick <= ts {
            recorder.record(fusion.tick(next_tick), &fusion);
            next_tick += tick_ms;
        }

        if let Some(radar) = &reading.radar {
            let sample = RadarSample { timestamp_ms: ts, ..*radar };
            recorder.record(fusion.feed_radar(&sample), &fusion);
        }

        if let Some(imu) = &reading.imu {
            let sample = ImuSample { timestamp_ms: ts, ..*imu };
            for event in classifier.update(&sample) {
                let msg = sender.wrap(LinkPayload::Event(event), ts);
                recorder.record(fusion.feed_link(msg, ts), &fusion);
            }
            if last_telemetry.map_or(true, |t| ts.saturating_sub(t) >= config.espnow_send_ms) {
                last_telemetry = Some(ts);
                let msg = sender.wrap(LinkPayload::Telemetry(classifier.telemetry()), ts);
                recorder.record(fusion.feed_link(msg, ts), &fusion);
            }
        }
    }

    let end = readings.last().map(|r| r.timestamp_ms).unwrap_or(start);
    recorder.record(fusion.tick(end), &fusion);

    let snap = fusion.snapshot();
    ReplaySummary {
        readings: readings.len(),
        duration_ms: end - start,
        status_changes: recorder.changes,
        final_status: snap.status,
        final_track_state: snap.track.state,
        counters: snap.escalation.counters,
        link_dropped: snap.link_dropped,
        imu_samples_dropped: classifier.dropped_samples(),
    }
}
