// sensor_fusion.rs — Receiver-side composition for fallwatch
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - UDP sockets and the body-worn unit transport
//   - Cloud delivery and status files
//
// Radar cycles and link messages go in, status changes come out. The daemon
// owns exactly one `ReceiverFusion` and calls it from a single consumer loop;
// replay and tests drive it directly on a recorded clock.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::escalation::{EscalationEngine, EscalationSnapshot, StatusChange};
use crate::link::{LinkMessage, LinkPayload, LinkReceiver};
use crate::radar_tracker::RadarTracker;
use crate::reporter::ReportContext;
use crate::types::{ImuTelemetry, PatientStatus, RadarSample, TrackEstimate, TrackState};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    StatusChanged(StatusChange),
    TrackStateChanged { from: TrackState, to: TrackState },
    LinkDropped { seq: u32 },
}

// ─── Fusion output snapshot ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct FusionSnapshot {
    pub status: PatientStatus,
    pub track: TrackEstimate,
    pub link_stale: bool,
    pub link_last_received_ms: Option<u64>,
    pub link_accepted: u64,
    pub link_dropped: u64,
    pub radar_cycles: u64,
    pub imu: Option<ImuTelemetry>,
    pub escalation: EscalationSnapshot,
}

// ─── ReceiverFusion ──────────────────────────────────────────────────────────

pub struct ReceiverFusion {
    config: EngineConfig,
    tracker: RadarTracker,
    link: LinkReceiver,
    engine: EscalationEngine,
    last_imu: Option<ImuTelemetry>,
    radar_cycles: u64,
}

impl ReceiverFusion {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            tracker: RadarTracker::new(&config),
            link: LinkReceiver::with_restart_gap(config.imu_fresh_ms),
            engine: EscalationEngine::new(&config),
            last_imu: None,
            radar_cycles: 0,
            config,
        }
    }

    // ── Per-input ────────────────────────────────────────────────────────

    /// One radar cycle. Radar runs on the receiver, so its timestamp is the
    /// receiver clock.
    pub fn feed_radar(&mut self, sample: &RadarSample) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        let before = self.tracker.estimate().state;
        let estimate = self.tracker.update(sample);
        self.radar_cycles += 1;

        if estimate.state != before {
            log::info!("radar track {:?} -> {:?}", before, estimate.state);
            events.push(FusionEvent::TrackStateChanged { from: before, to: estimate.state });
        }

        let now = sample.timestamp_ms;
        events.extend(
            self.engine
                .on_track_update(&estimate, now)
                .into_iter()
                .map(FusionEvent::StatusChanged),
        );
        events
    }

    pub fn feed_link(&mut self, msg: LinkMessage, received_ms: u64) -> Vec<FusionEvent> {
        let Some(delivery) = self.link.accept(msg, received_ms) else {
            return vec![FusionEvent::LinkDropped { seq: msg.seq }];
        };
        if delivery.restarted {
            self.engine.reset_imu_clock();
        }

        let changes = match delivery.message.payload {
            LinkPayload::Event(event) => self.engine.on_motion_event(&event, received_ms),
            LinkPayload::Telemetry(telemetry) => {
                self.last_imu = Some(telemetry);
                self.engine.on_imu_telemetry(&telemetry, received_ms)
            }
        };
        changes.into_iter().map(FusionEvent::StatusChanged).collect()
    }

    // ── Per-tick ─────────────────────────────────────────────────────────

    pub fn tick(&mut self, now_ms: u64) -> Vec<FusionEvent> {
        self.engine
            .tick(now_ms)
            .into_iter()
            .map(FusionEvent::StatusChanged)
            .collect()
    }

    /// Patient pressed "I'm OK" or a caregiver handled the alert.
    pub fn acknowledge(&mut self, now_ms: u64) -> Vec<FusionEvent> {
        self.engine
            .acknowledge(now_ms)
            .into_iter()
            .map(FusionEvent::StatusChanged)
            .collect()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn status(&self) -> PatientStatus {
        self.engine.status()
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        let escalation = self.engine.snapshot();
        FusionSnapshot {
            status: escalation.status,
            track: *self.tracker.estimate(),
            link_stale: self.link.is_stale(escalation.now_ms, self.config.imu_fresh_ms),
            link_last_received_ms: self.link.last_received_ms(),
            link_accepted: self.link.accepted(),
            link_dropped: self.link.dropped(),
            radar_cycles: self.radar_cycles,
            imu: self.last_imu,
            escalation,
        }
    }

    pub fn report_context(&self) -> ReportContext {
        let escalation = self.engine.snapshot();
        ReportContext {
            counters: escalation.counters,
            imu_moving: escalation.imu_fresh && !escalation.imu_still,
            radar_state: self.tracker.estimate().state,
        }
    }
}
