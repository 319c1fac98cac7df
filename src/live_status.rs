use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::health_monitor::HealthReport;
use crate::sensor_fusion::FusionSnapshot;
use crate::types::{PatientStatus, RadarMotion, TrackState};

/// Status file the daemon rewrites every few seconds for local inspection.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub patient_id: String,
    pub status: PatientStatus,
    pub status_since_ms: u64,
    pub engine_ms: u64,
    // Radar
    pub radar_state: TrackState,
    pub radar_motion: RadarMotion,
    pub radar_pos_m: f64,
    pub radar_velocity: f64,
    pub radar_cycles: u64,
    // IMU link
    pub link_stale: bool,
    pub link_accepted: u64,
    pub link_dropped: u64,
    pub imu_still: bool,
    // Activity
    pub steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    // Timers
    pub suspect_deadline_ms: Option<u64>,
    pub immobility_deadline_ms: Option<u64>,
    pub immobility_paused: bool,
    // Health monitoring
    pub radar_healthy: bool,
    pub link_healthy: bool,
    pub radar_silence_duration_secs: f64,
    pub link_silence_duration_secs: f64,
    // Delivery
    pub reports_dropped: u64,
}

impl LiveStatus {
    pub fn from_snapshot(
        patient_id: &str,
        snap: &FusionSnapshot,
        health: &HealthReport,
        uptime_seconds: u64,
    ) -> Self {
        let esc = &snap.escalation;
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            patient_id: patient_id.to_string(),
            status: snap.status,
            status_since_ms: esc.entered_at_ms,
            engine_ms: esc.now_ms,
            radar_state: snap.track.state,
            radar_motion: snap.track.motion,
            radar_pos_m: snap.track.pos_m,
            radar_velocity: snap.track.velocity,
            radar_cycles: snap.radar_cycles,
            link_stale: snap.link_stale,
            link_accepted: snap.link_accepted,
            link_dropped: snap.link_dropped,
            imu_still: esc.imu_still,
            steps: esc.counters.steps,
            stairs_count: esc.counters.stair_segments,
            falls_count: esc.counters.falls,
            suspect_deadline_ms: esc.suspect_deadline_ms,
            immobility_deadline_ms: esc.immobility_deadline_ms,
            immobility_paused: esc.immobility_paused,
            radar_healthy: health.radar_healthy,
            link_healthy: health.link_healthy,
            radar_silence_duration_secs: health
                .radar_silence_duration
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            link_silence_duration_secs: health
                .link_silence_duration
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            reports_dropped: 0,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
