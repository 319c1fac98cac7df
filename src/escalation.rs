//! Cross-sensor escalation state machine.
//!
//! Combines radar track estimates and IMU events/telemetry into a patient
//! status. All entry points take the receiver's clock (`now_ms`), which is
//! clamped to be non-decreasing, and return the status changes they caused.
//! Deadlines are plain `Option<u64>` fields: arming overwrites them, every
//! transition clears them.
//!
//! Motion opinions:
//!   - radar: usable when updated within `imu_fresh_ms` and not LOST
//!   - IMU: usable when any link input arrived within `imu_fresh_ms`
//!
//! Either sensor reporting motion is enough to recover. Arming the immobility
//! timeout needs every usable sensor to report stillness; when neither is
//! usable the timeout is paused and the current status is held.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::types::{ImuTelemetry, MotionEvent, MotionEventKind, PatientStatus, TrackEstimate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ImpactDetected,
    StillnessCorroborated,
    SuspectTimeout,
    MotionResumed,
    ImmobilityTimeout,
    Acknowledged,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::ImpactDetected => "impact_detected",
            TransitionReason::StillnessCorroborated => "stillness_corroborated",
            TransitionReason::SuspectTimeout => "suspect_timeout",
            TransitionReason::MotionResumed => "motion_resumed",
            TransitionReason::ImmobilityTimeout => "immobility_timeout",
            TransitionReason::Acknowledged => "acknowledged",
        }
    }
}

/// One status notification. `reminder` marks a periodic re-report of
/// IMMOBILE_TIMEOUT, where `from == to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: PatientStatus,
    pub to: PatientStatus,
    pub at_ms: u64,
    pub reason: TransitionReason,
    pub reminder: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActivityCounters {
    pub steps: u64,
    pub stair_segments: u64,
    pub falls: u64,
}

impl ActivityCounters {
    /// Events can be lost on the link; the sender's running totals win when ahead.
    fn absorb(&mut self, telemetry: &ImuTelemetry) {
        self.steps = self.steps.max(telemetry.steps);
        self.stair_segments = self.stair_segments.max(telemetry.stairs_count);
        self.falls = self.falls.max(telemetry.falls_count);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EscalationSnapshot {
    pub status: PatientStatus,
    pub entered_at_ms: u64,
    pub now_ms: u64,
    pub radar_available: bool,
    pub radar_moving: Option<bool>,
    pub imu_fresh: bool,
    pub imu_still: bool,
    pub suspect_deadline_ms: Option<u64>,
    pub ok_hold_deadline_ms: Option<u64>,
    pub immobility_deadline_ms: Option<u64>,
    pub immobility_paused: bool,
    pub counters: ActivityCounters,
    pub dropped_inputs: u64,
}

pub struct EscalationEngine {
    config: EngineConfig,

    status: PatientStatus,
    entered_at_ms: u64,
    now_ms: u64,

    // Radar side
    last_track: Option<TrackEstimate>,
    radar_seen_ms: Option<u64>,
    radar_still_since_ms: Option<u64>,
    // Smoothed radar velocity lags a fall; motion showing at the impact has to
    // clear once before radar motion counts as recovery.
    radar_motion_at_entry: bool,

    // IMU side
    imu_seen_ms: Option<u64>,
    imu_still: bool,
    last_locomotion_ms: Option<u64>,
    last_event_origin_ms: Option<u64>,

    // Timers
    suspect_deadline_ms: Option<u64>,
    ok_hold_deadline_ms: Option<u64>,
    immobility_deadline_ms: Option<u64>,
    immobility_paused_at_ms: Option<u64>,
    next_reminder_ms: Option<u64>,

    counters: ActivityCounters,
    dropped_inputs: u64,
}

impl EscalationEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            status: PatientStatus::Normal,
            entered_at_ms: 0,
            now_ms: 0,
            last_track: None,
            radar_seen_ms: None,
            radar_still_since_ms: None,
            radar_motion_at_entry: false,
            imu_seen_ms: None,
            imu_still: false,
            last_locomotion_ms: None,
            last_event_origin_ms: None,
            suspect_deadline_ms: None,
            ok_hold_deadline_ms: None,
            immobility_deadline_ms: None,
            immobility_paused_at_ms: None,
            next_reminder_ms: None,
            counters: ActivityCounters::default(),
            dropped_inputs: 0,
        }
    }

    pub fn status(&self) -> PatientStatus {
        self.status
    }

    pub fn counters(&self) -> ActivityCounters {
        self.counters
    }

    // ─── Entry points ────────────────────────────────────────────────────────

    pub fn on_track_update(&mut self, estimate: &TrackEstimate, now_ms: u64) -> Vec<StatusChange> {
        let now = self.advance(now_ms);
        if let Some(prev) = &self.last_track {
            if estimate.updated_at_ms < prev.updated_at_ms {
                log::debug!("stale radar estimate from {} ms dropped", estimate.updated_at_ms);
                self.dropped_inputs += 1;
                return Vec::new();
            }
        }

        let mut changes = self.evaluate(now);

        self.last_track = Some(*estimate);
        self.radar_seen_ms = Some(now);
        if estimate.is_tracked() && !estimate.motion.is_moving() {
            self.radar_still_since_ms.get_or_insert(now);
        } else {
            self.radar_still_since_ms = None;
        }
        if self.radar_moving(now) != Some(true) {
            self.radar_motion_at_entry = false;
        }

        changes.extend(self.evaluate(now));
        changes
    }

    pub fn on_motion_event(&mut self, event: &MotionEvent, now_ms: u64) -> Vec<StatusChange> {
        let now = self.advance(now_ms);
        if let Some(last) = self.last_event_origin_ms {
            if event.timestamp_ms < last {
                log::debug!("stale motion event from {} ms dropped", event.timestamp_ms);
                self.dropped_inputs += 1;
                return Vec::new();
            }
        }
        self.last_event_origin_ms = Some(event.timestamp_ms);

        let mut changes = self.evaluate(now);
        self.imu_seen_ms = Some(now);

        match event.kind {
            MotionEventKind::Impact { magnitude_g } => {
                self.counters.falls += 1;
                if self.status == PatientStatus::Normal {
                    log::info!("impact of {:.2} g, awaiting corroboration", magnitude_g);
                    changes.push(self.transition(
                        PatientStatus::SuspectFall,
                        TransitionReason::ImpactDetected,
                        now,
                    ));
                }
            }
            MotionEventKind::StillnessStart => {
                self.imu_still = true;
                if self.status == PatientStatus::SuspectFall {
                    changes.push(self.transition(
                        PatientStatus::Alert,
                        TransitionReason::StillnessCorroborated,
                        now,
                    ));
                }
            }
            MotionEventKind::StillnessEnd => {
                self.imu_still = false;
            }
            MotionEventKind::Step | MotionEventKind::StairSegment { .. } => {
                if matches!(event.kind, MotionEventKind::Step) {
                    self.counters.steps += 1;
                } else {
                    self.counters.stair_segments += 1;
                }
                self.imu_still = false;
                self.last_locomotion_ms = Some(now);
                if self.status == PatientStatus::SuspectFall {
                    changes.push(self.transition(
                        PatientStatus::Normal,
                        TransitionReason::MotionResumed,
                        now,
                    ));
                }
            }
        }

        changes.extend(self.evaluate(now));
        changes
    }

    /// Periodic feature summary from the body-worn unit. Keeps the IMU fresh
    /// between sparse events and refreshes its still/moving opinion.
    pub fn on_imu_telemetry(&mut self, telemetry: &ImuTelemetry, now_ms: u64) -> Vec<StatusChange> {
        let now = self.advance(now_ms);
        let mut changes = self.evaluate(now);

        self.imu_seen_ms = Some(now);
        self.imu_still = telemetry.still && !telemetry.imu_moving;
        self.counters.absorb(telemetry);

        changes.extend(self.evaluate(now));
        changes
    }

    /// The body-worn unit rebooted; its event clock starts over.
    pub fn reset_imu_clock(&mut self) {
        self.last_event_origin_ms = None;
    }

    /// Evaluate deadlines without new sensor input.
    pub fn tick(&mut self, now_ms: u64) -> Vec<StatusChange> {
        let now = self.advance(now_ms);
        self.evaluate(now)
    }

    /// External reset ("I'm OK" from the patient, or a caregiver handling the alert).
    pub fn acknowledge(&mut self, now_ms: u64) -> Vec<StatusChange> {
        let now = self.advance(now_ms);
        if self.status == PatientStatus::Normal {
            return Vec::new();
        }
        vec![self.transition(PatientStatus::Normal, TransitionReason::Acknowledged, now)]
    }

    pub fn snapshot(&self) -> EscalationSnapshot {
        let now = self.now_ms;
        EscalationSnapshot {
            status: self.status,
            entered_at_ms: self.entered_at_ms,
            now_ms: now,
            radar_available: self.radar_available(now),
            radar_moving: self.radar_moving(now),
            imu_fresh: self.imu_fresh(now),
            imu_still: self.imu_still,
            suspect_deadline_ms: self.suspect_deadline_ms,
            ok_hold_deadline_ms: self.ok_hold_deadline_ms,
            immobility_deadline_ms: self.immobility_deadline_ms,
            immobility_paused: self.immobility_paused_at_ms.is_some(),
            counters: self.counters,
            dropped_inputs: self.dropped_inputs,
        }
    }

    // ─── Evaluation ──────────────────────────────────────────────────────────

    fn evaluate(&mut self, now: u64) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        match self.status {
            PatientStatus::Normal => {}

            PatientStatus::SuspectFall => {
                let still_since = self
                    .radar_still_since_ms
                    .filter(|_| self.radar_available(now))
                    .map(|since| since.max(self.entered_at_ms));

                let radar_resumed =
                    self.radar_moving(now) == Some(true) && !self.radar_motion_at_entry;

                if radar_resumed {
                    changes.push(self.transition(
                        PatientStatus::Normal,
                        TransitionReason::MotionResumed,
                        now,
                    ));
                } else if still_since.is_some_and(|s| now.saturating_sub(s) >= self.config.still_time_ms) {
                    changes.push(self.transition(
                        PatientStatus::Alert,
                        TransitionReason::StillnessCorroborated,
                        now,
                    ));
                } else if self.suspect_deadline_ms.is_some_and(|d| now >= d) {
                    changes.push(self.transition(
                        PatientStatus::Alert,
                        TransitionReason::SuspectTimeout,
                        now,
                    ));
                }
            }

            PatientStatus::Alert | PatientStatus::ImmobileTimeout => {
                if self.motion_evidence(now) {
                    let deadline = *self
                        .ok_hold_deadline_ms
                        .get_or_insert(now.saturating_add(self.config.im_ok_hold_ms));
                    if now >= deadline {
                        changes.push(self.transition(
                            PatientStatus::Normal,
                            TransitionReason::MotionResumed,
                            now,
                        ));
                        return changes;
                    }
                } else {
                    self.ok_hold_deadline_ms = None;
                }

                if self.status == PatientStatus::Alert {
                    if let Some(change) = self.evaluate_immobility(now) {
                        changes.push(change);
                    }
                } else if self.next_reminder_ms.is_some_and(|r| now >= r) {
                    self.next_reminder_ms = Some(now.saturating_add(self.config.immobility_report_ms));
                    log::warn!("patient still immobile since {} ms", self.entered_at_ms);
                    changes.push(StatusChange {
                        from: PatientStatus::ImmobileTimeout,
                        to: PatientStatus::ImmobileTimeout,
                        at_ms: now,
                        reason: TransitionReason::ImmobilityTimeout,
                        reminder: true,
                    });
                }
            }
        }
        changes
    }

    fn evaluate_immobility(&mut self, now: u64) -> Option<StatusChange> {
        match self.still_agreement(now) {
            Some(true) => {
                if let (Some(paused_at), Some(deadline)) =
                    (self.immobility_paused_at_ms.take(), self.immobility_deadline_ms)
                {
                    self.immobility_deadline_ms =
                        Some(deadline.saturating_add(now.saturating_sub(paused_at)));
                }
                let deadline = *self
                    .immobility_deadline_ms
                    .get_or_insert(now.saturating_add(self.config.ok_timeout_ms));
                if now >= deadline {
                    return Some(self.transition(
                        PatientStatus::ImmobileTimeout,
                        TransitionReason::ImmobilityTimeout,
                        now,
                    ));
                }
            }
            Some(false) => {
                self.immobility_deadline_ms = None;
                self.immobility_paused_at_ms = None;
            }
            None => {
                if self.immobility_deadline_ms.is_some() && self.immobility_paused_at_ms.is_none() {
                    log::warn!("no usable sensor, immobility timer paused");
                    self.immobility_paused_at_ms = Some(now);
                }
            }
        }
        None
    }

    fn transition(&mut self, to: PatientStatus, reason: TransitionReason, now: u64) -> StatusChange {
        let change = StatusChange { from: self.status, to, at_ms: now, reason, reminder: false };
        log::info!("status {} -> {} at {} ms ({})", self.status, to, now, reason.as_str());

        self.status = to;
        self.entered_at_ms = now;
        self.suspect_deadline_ms = None;
        self.ok_hold_deadline_ms = None;
        self.immobility_deadline_ms = None;
        self.immobility_paused_at_ms = None;
        self.next_reminder_ms = None;
        self.radar_motion_at_entry = false;

        match to {
            PatientStatus::SuspectFall => {
                self.suspect_deadline_ms = Some(now.saturating_add(self.config.suspect_timeout_ms));
                self.radar_motion_at_entry = self.radar_moving(now) == Some(true);
            }
            PatientStatus::ImmobileTimeout => {
                self.next_reminder_ms = Some(now.saturating_add(self.config.immobility_report_ms));
            }
            PatientStatus::Normal | PatientStatus::Alert => {}
        }
        change
    }

    // ─── Sensor opinions ─────────────────────────────────────────────────────

    fn advance(&mut self, now_ms: u64) -> u64 {
        self.now_ms = self.now_ms.max(now_ms);
        self.now_ms
    }

    fn radar_available(&self, now: u64) -> bool {
        match (&self.last_track, self.radar_seen_ms) {
            (Some(track), Some(seen)) => {
                track.is_tracked() && now.saturating_sub(seen) <= self.config.imu_fresh_ms
            }
            _ => false,
        }
    }

    /// `Some(moving)` while radar is usable.
    fn radar_moving(&self, now: u64) -> Option<bool> {
        if !self.radar_available(now) {
            return None;
        }
        self.last_track.map(|t| t.motion.is_moving())
    }

    fn imu_fresh(&self, now: u64) -> bool {
        self.imu_seen_ms
            .is_some_and(|seen| now.saturating_sub(seen) <= self.config.imu_fresh_ms)
    }

    fn recent_locomotion(&self, now: u64) -> bool {
        self.last_locomotion_ms
            .is_some_and(|t| now.saturating_sub(t) <= self.config.imu_fresh_ms)
    }

    fn motion_evidence(&self, now: u64) -> bool {
        self.radar_moving(now) == Some(true) || self.recent_locomotion(now)
    }

    /// `Some(true)` when every usable sensor reports stillness, `None` when
    /// no sensor is usable.
    fn still_agreement(&self, now: u64) -> Option<bool> {
        let radar = self.radar_moving(now).map(|moving| !moving);
        let imu = if self.imu_fresh(now) {
            Some(self.imu_still && !self.recent_locomotion(now))
        } else {
            None
        };
        match (radar, imu) {
            (None, None) => None,
            (r, i) => Some(r.unwrap_or(true) && i.unwrap_or(true)),
        }
    }
}
