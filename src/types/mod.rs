pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

// ─── Radar ───────────────────────────────────────────────────────────────────

/// One radar cycle for the primary target. `valid == false` means "no target".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadarSample {
    pub range_m: f64,
    pub velocity: f64,
    pub timestamp_ms: u64,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl RadarSample {
    pub fn new(range_m: f64, velocity: f64, timestamp_ms: u64) -> Self {
        Self { range_m, velocity, timestamp_ms, valid: true }
    }

    pub fn absent(timestamp_ms: u64) -> Self {
        Self { range_m: 0.0, velocity: 0.0, timestamp_ms, valid: false }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Lost,
    Tracking,
    Locked,
}

/// Radar movement class of the filtered velocity. Single threshold, no hysteresis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadarMotion {
    Still,
    Moving,
    Fast,
}

impl RadarMotion {
    pub fn is_moving(&self) -> bool {
        matches!(self, RadarMotion::Moving | RadarMotion::Fast)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackEstimate {
    pub pos_m: f64,
    pub velocity: f64,
    pub state: TrackState,
    pub stable_count: u32,
    pub lost_count: u32,
    pub motion: RadarMotion,
    /// Timestamp of the radar cycle that produced this estimate.
    pub updated_at_ms: u64,
}

impl TrackEstimate {
    pub fn lost(updated_at_ms: u64) -> Self {
        Self {
            pos_m: 0.0,
            velocity: 0.0,
            state: TrackState::Lost,
            stable_count: 0,
            lost_count: 0,
            motion: RadarMotion::Still,
            updated_at_ms,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.state != TrackState::Lost
    }
}

// ─── IMU ─────────────────────────────────────────────────────────────────────

/// Calibrated IMU sample: acceleration in g, angular rate in deg/s.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub tilt_deg: f64,
    pub timestamp_ms: u64,
}

impl ImuSample {
    pub fn accel(&self) -> Vec3 {
        Vec3::new(self.ax, self.ay, self.az)
    }

    pub fn gyro(&self) -> Vec3 {
        Vec3::new(self.gx, self.gy, self.gz)
    }

    pub fn is_finite(&self) -> bool {
        [self.ax, self.ay, self.az, self.gx, self.gy, self.gz, self.tilt_deg]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StairDirection {
    Ascent,
    Descent,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionEventKind {
    Step,
    StairSegment { direction: StairDirection },
    Impact { magnitude_g: f64 },
    StillnessStart,
    StillnessEnd,
}

/// A discrete classifier event, timestamped on the sender's clock.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: MotionEventKind,
}

impl MotionEvent {
    pub fn new(timestamp_ms: u64, kind: MotionEventKind) -> Self {
        Self { timestamp_ms, kind }
    }

    /// Step or stair segment: explicit evidence of the patient moving on their feet.
    pub fn is_locomotion(&self) -> bool {
        matches!(self.kind, MotionEventKind::Step | MotionEventKind::StairSegment { .. })
    }
}

/// Periodic feature summary sent by the body-worn unit between events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuTelemetry {
    pub steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub imu_moving: bool,
    pub still: bool,
    pub tilt_deg: f64,
}

// ─── Patient status ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientStatus {
    Normal,
    SuspectFall,
    Alert,
    ImmobileTimeout,
}

impl PatientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStatus::Normal => "NORMAL",
            PatientStatus::SuspectFall => "SUSPECT_FALL",
            PatientStatus::Alert => "ALERT",
            PatientStatus::ImmobileTimeout => "IMMOBILE_TIMEOUT",
        }
    }
}

impl std::fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_event_wire_shape() {
        let event = MotionEvent::new(1200, MotionEventKind::Impact { magnitude_g: 2.5 });
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["type"], "impact");
        assert_eq!(json["timestamp_ms"], 1200);
        assert_eq!(json["magnitude_g"], 2.5);

        let back: MotionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_radar_sample_valid_defaults_true() {
        let sample: RadarSample =
            serde_json::from_str(r#"{"range_m":1.2,"velocity":0.05,"timestamp_ms":10}"#).unwrap();
        assert!(sample.valid);
    }

    #[test]
    fn test_status_serializes_screaming() {
        let json = serde_json::to_string(&PatientStatus::ImmobileTimeout).unwrap();
        assert_eq!(json, "\"IMMOBILE_TIMEOUT\"");
        assert_eq!(PatientStatus::SuspectFall.to_string(), "SUSPECT_FALL");
    }

    #[test]
    fn test_locomotion_events() {
        assert!(MotionEvent::new(0, MotionEventKind::Step).is_locomotion());
        assert!(MotionEvent::new(
            0,
            MotionEventKind::StairSegment { direction: StairDirection::Ascent }
        )
        .is_locomotion());
        assert!(!MotionEvent::new(0, MotionEventKind::StillnessEnd).is_locomotion());
    }
}
