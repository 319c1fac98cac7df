//! Cloud reporting.
//!
//! The engine side only ever calls `StatusSink::submit`, which must not block.
//! `HttpReporter` queues payloads to a background task that owns the HTTP
//! client and retries failed posts with a capped exponential backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{FallwatchError, Result};
use crate::escalation::{ActivityCounters, StatusChange};
use crate::types::{PatientStatus, TrackState};

// ─── Payload ─────────────────────────────────────────────────────────────────

/// Discriminator the cloud function dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Telemetry,
    FallAlert,
    LongImmobility,
}

impl ReportKind {
    pub fn for_status(status: PatientStatus) -> Self {
        match status {
            PatientStatus::Alert => ReportKind::FallAlert,
            PatientStatus::ImmobileTimeout => ReportKind::LongImmobility,
            PatientStatus::Normal | PatientStatus::SuspectFall => ReportKind::Telemetry,
        }
    }
}

/// Context attached to every report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReportContext {
    pub counters: ActivityCounters,
    pub imu_moving: bool,
    pub radar_state: TrackState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub patient_id: String,
    #[serde(rename = "type")]
    pub kind: ReportKind,
    pub status: PatientStatus,
    /// Wall-clock time of the report, RFC 3339.
    pub timestamp: String,
    /// Receiver clock of the transition.
    pub engine_ms: u64,
    pub reason: Option<String>,
    pub reminder: bool,
    pub steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub imu_moving: bool,
    pub source: String,
    pub radar_state: TrackState,
}

impl StatusPayload {
    pub fn for_change(
        patient_id: &str,
        change: &StatusChange,
        ctx: &ReportContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut payload = Self::telemetry(patient_id, change.to, change.at_ms, ctx, timestamp);
        payload.kind = ReportKind::for_status(change.to);
        payload.reason = Some(change.reason.as_str().to_string());
        payload.reminder = change.reminder;
        payload
    }

    /// Periodic status report outside of any transition.
    pub fn telemetry(
        patient_id: &str,
        status: PatientStatus,
        engine_ms: u64,
        ctx: &ReportContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            kind: ReportKind::Telemetry,
            status,
            timestamp: timestamp.to_rfc3339(),
            engine_ms,
            reason: None,
            reminder: false,
            steps: ctx.counters.steps,
            stairs_count: ctx.counters.stair_segments,
            falls_count: ctx.counters.falls,
            imu_moving: ctx.imu_moving,
            source: "fusion".to_string(),
            radar_state: ctx.radar_state,
        }
    }
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Fire-and-forget destination for status payloads.
pub trait StatusSink: Send + Sync {
    fn submit(&self, payload: StatusPayload);
}

/// Logs payloads instead of delivering them (`--dry-run`).
pub struct LogSink;

impl StatusSink for LogSink {
    fn submit(&self, payload: StatusPayload) {
        match serde_json::to_string(&payload) {
            Ok(json) => log::info!("[REPORT] {}", json),
            Err(e) => log::warn!("[REPORT] unserializable payload: {}", e),
        }
    }
}

/// Collects payloads in memory.
#[derive(Default)]
pub struct MemorySink {
    payloads: Mutex<Vec<StatusPayload>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<StatusPayload> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl StatusSink for MemorySink {
    fn submit(&self, payload: StatusPayload) {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload);
        }
    }
}

// ─── Retry backoff ───────────────────────────────────────────────────────────

/// Cooldown grows by 1.5x per failure, capped at 30 s, for a bounded number of attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    const CAP_SECS: f64 = 30.0;

    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, current: base, attempts: 0, max_attempts }
    }

    /// Record a failed attempt. Returns how long to wait before the next one,
    /// or `None` once the attempts are used up.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let wait = self.current;
        self.current = Duration::from_secs_f64((self.current.as_secs_f64() * 1.5).min(Self::CAP_SECS));
        Some(wait)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.base;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ─── HTTP reporter ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ReporterConfig {
    pub cloud_url: String,
    pub patient_id: String,
    pub queue_len: usize,
    pub timeout: Duration,
    pub base_backoff: Duration,
    pub max_attempts: u32,
}

impl ReporterConfig {
    pub fn new(cloud_url: &str, patient_id: &str) -> Self {
        Self {
            cloud_url: cloud_url.to_string(),
            patient_id: patient_id.to_string(),
            queue_len: 64,
            timeout: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            max_attempts: 6,
        }
    }
}

pub struct HttpReporter {
    tx: mpsc::Sender<StatusPayload>,
    dropped: AtomicU64,
}

impl HttpReporter {
    /// Start the delivery task. Must be called from inside a tokio runtime.
    pub fn spawn(config: ReporterConfig) -> Result<(Self, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("fallwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FallwatchError::Delivery(e.to_string()))?;

        let (tx, mut rx) = mpsc::channel::<StatusPayload>(config.queue_len.max(1));
        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::new(config.base_backoff, config.max_attempts);
            while let Some(payload) = rx.recv().await {
                deliver(&client, &config, &payload, &mut backoff).await;
            }
            log::info!("[REPORT] queue closed, delivery task exiting");
        });

        Ok((Self { tx, dropped: AtomicU64::new(0) }, handle))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StatusSink for HttpReporter {
    fn submit(&self, payload: StatusPayload) {
        if let Err(e) = self.tx.try_send(payload) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("[REPORT] queue unavailable, payload dropped: {}", e);
        }
    }
}

async fn post(client: &reqwest::Client, config: &ReporterConfig, payload: &StatusPayload) -> Result<()> {
    let response = client
        .post(&config.cloud_url)
        .query(&[("patientId", config.patient_id.as_str())])
        .json(payload)
        .send()
        .await
        .map_err(|e| FallwatchError::Delivery(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FallwatchError::Delivery(format!("HTTP {}", status.as_u16())));
    }
    Ok(())
}

async fn deliver(
    client: &reqwest::Client,
    config: &ReporterConfig,
    payload: &StatusPayload,
    backoff: &mut Backoff,
) {
    backoff.reset();
    loop {
        match post(client, config, payload).await {
            Ok(()) => {
                log::debug!("[REPORT] delivered {} ({:?})", payload.status, payload.kind);
                return;
            }
            Err(e) => match backoff.record_failure() {
                Some(wait) => {
                    log::warn!(
                        "[REPORT] attempt {} failed: {}, retrying in {:.1}s",
                        backoff.attempts(),
                        e,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
                None => {
                    log::warn!(
                        "[REPORT] giving up on {} report after {} attempts: {}",
                        payload.status,
                        backoff.attempts(),
                        e
                    );
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::TransitionReason;
    use chrono::TimeZone;

    fn ctx() -> ReportContext {
        ReportContext {
            counters: ActivityCounters { steps: 120, stair_segments: 4, falls: 1 },
            imu_moving: false,
            radar_state: TrackState::Locked,
        }
    }

    fn change(to: PatientStatus, reminder: bool) -> StatusChange {
        StatusChange {
            from: PatientStatus::SuspectFall,
            to,
            at_ms: 4000,
            reason: TransitionReason::SuspectTimeout,
            reminder,
        }
    }

    #[test]
    fn test_payload_shape() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let payload = StatusPayload::for_change("p1", &change(PatientStatus::Alert, false), &ctx(), ts);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["patientId"], "p1");
        assert_eq!(json["type"], "fall_alert");
        assert_eq!(json["status"], "ALERT");
        assert_eq!(json["stairsCount"], 4);
        assert_eq!(json["fallsCount"], 1);
        assert_eq!(json["imuMoving"], false);
        assert_eq!(json["radarState"], "LOCKED");
        assert_eq!(json["reason"], "suspect_timeout");
        assert_eq!(json["timestamp"], "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ReportKind::for_status(PatientStatus::Alert), ReportKind::FallAlert);
        assert_eq!(ReportKind::for_status(PatientStatus::ImmobileTimeout), ReportKind::LongImmobility);
        assert_eq!(ReportKind::for_status(PatientStatus::SuspectFall), ReportKind::Telemetry);

        let p = StatusPayload::telemetry("p1", PatientStatus::Alert, 10, &ctx(), Utc::now());
        assert_eq!(p.kind, ReportKind::Telemetry);
        assert!(p.reason.is_none());
    }

    #[test]
    fn test_reminder_flag_carried() {
        let p = StatusPayload::for_change(
            "p1",
            &change(PatientStatus::ImmobileTimeout, true),
            &ctx(),
            Utc::now(),
        );
        assert!(p.reminder);
        assert_eq!(p.kind, ReportKind::LongImmobility);
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.submit(StatusPayload::telemetry("p1", PatientStatus::Normal, 0, &ctx(), Utc::now()));
        sink.submit(StatusPayload::telemetry("p1", PatientStatus::Normal, 50, &ctx(), Utc::now()));
        assert_eq!(sink.payloads().len(), 2);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut b = Backoff::new(Duration::from_secs(20), 5);
        assert_eq!(b.record_failure(), Some(Duration::from_secs(20)));
        assert_eq!(b.record_failure(), Some(Duration::from_secs(30)));
        assert_eq!(b.record_failure(), Some(Duration::from_secs(30)));
        assert_eq!(b.record_failure(), Some(Duration::from_secs(30)));
        assert_eq!(b.record_failure(), None);

        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.record_failure(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let reporter = HttpReporter { tx, dropped: AtomicU64::new(0) };
        let p = StatusPayload::telemetry("p1", PatientStatus::Normal, 0, &ctx(), Utc::now());
        reporter.submit(p.clone());
        reporter.submit(p);
        assert_eq!(reporter.dropped(), 1);
    }
}
