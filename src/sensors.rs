//! Input loops for the receiver daemon.
//!
//! Each loop reads one source and `try_send`s into a bounded channel; when
//! the consumer falls behind the newest input is dropped rather than queued.

use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration, Instant};

use crate::health_monitor::SourceHealth;
use crate::link::{LinkMessage, LinkPayload, LinkSender};
use crate::types::{ImuTelemetry, MotionEvent, MotionEventKind, RadarSample};

/// Milliseconds since the receiver started. All engine deadlines use this clock.
#[derive(Clone, Copy, Debug)]
pub struct ReceiverClock {
    start: Instant,
}

impl ReceiverClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for ReceiverClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Link datagram plus the receiver time it arrived at.
pub type LinkArrival = (LinkMessage, u64);

/// Returns false once the consumer is gone.
fn forward<T>(tx: &Sender<T>, item: T, tag: &str, count: &mut u64) -> bool {
    match tx.try_send(item) {
        Ok(_) => {
            *count += 1;
            if *count % 1000 == 0 {
                log::debug!("[{}] {} inputs", tag, count);
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            log::info!("[{}] channel closed after {} inputs", tag, count);
            false
        }
        Err(TrySendError::Full(_)) => {
            // Consumer behind, drop this input
            true
        }
    }
}

// ─── UDP sources ─────────────────────────────────────────────────────────────

/// Radar cycles arrive as JSON `RadarSample` datagrams. The radar sits on the
/// receiver, so each cycle is restamped with the receiver clock on arrival.
pub async fn radar_udp_loop(
    socket: UdpSocket,
    tx: Sender<RadarSample>,
    clock: ReceiverClock,
    health: Arc<SourceHealth>,
) {
    let mut buf = [0u8; 1024];
    let mut count = 0u64;
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                log::warn!("[radar] socket error: {}", e);
                continue;
            }
        };
        let mut sample: RadarSample = match serde_json::from_slice(&buf[..len]) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("[radar] bad datagram: {}", e);
                continue;
            }
        };
        sample.timestamp_ms = clock.now_ms();
        health.update();
        if !forward(&tx, sample, "radar", &mut count) {
            break;
        }
    }
}

pub async fn link_udp_loop(
    socket: UdpSocket,
    tx: Sender<LinkArrival>,
    clock: ReceiverClock,
    health: Arc<SourceHealth>,
) {
    let mut buf = [0u8; 2048];
    let mut count = 0u64;
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                log::warn!("[link] socket error: {}", e);
                continue;
            }
        };
        let msg = match LinkMessage::decode(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("[link] {}", e);
                continue;
            }
        };
        health.update();
        if !forward(&tx, (msg, clock.now_ms()), "link", &mut count) {
            break;
        }
    }
}

// ─── Simulated patient ───────────────────────────────────────────────────────

/// Scripted session for `--simulate`: walking until `fall_at_ms`, then a fall
/// followed by lying still in front of the radar.
#[derive(Clone, Copy, Debug)]
pub struct SimulatedPatient {
    pub fall_at_ms: u64,
    pub step_period_ms: u64,
}

impl Default for SimulatedPatient {
    fn default() -> Self {
        Self { fall_at_ms: 20_000, step_period_ms: 550 }
    }
}

impl SimulatedPatient {
    pub fn radar_at(&self, t_ms: u64) -> RadarSample {
        if t_ms < self.fall_at_ms {
            // Pacing between 1.0 m and 2.5 m at 0.3 m/s
            let phase = (t_ms % 10_000) as f64 / 10_000.0;
            let (pos, vel) = if phase < 0.5 {
                (1.0 + 3.0 * phase, 0.3)
            } else {
                (2.5 - 3.0 * (phase - 0.5), -0.3)
            };
            RadarSample::new(pos, vel, t_ms)
        } else {
            RadarSample::new(1.4, 0.0, t_ms)
        }
    }

    /// Link payloads the body-worn unit produces in `(from_ms, to_ms]`.
    pub fn imu_between(&self, from_ms: u64, to_ms: u64) -> Vec<(u64, LinkPayload)> {
        let mut out = Vec::new();
        let in_window = |t: u64| t > from_ms && t <= to_ms;

        if to_ms < self.fall_at_ms {
            let first = (from_ms / self.step_period_ms + 1) * self.step_period_ms;
            let mut t = first;
            while t <= to_ms {
                out.push((t, LinkPayload::Event(MotionEvent::new(t, MotionEventKind::Step))));
                t += self.step_period_ms;
            }
        }
        if in_window(self.fall_at_ms) {
            let impact = MotionEventKind::Impact { magnitude_g: 3.1 };
            out.push((self.fall_at_ms, LinkPayload::Event(MotionEvent::new(self.fall_at_ms, impact))));
        }
        let still_at = self.fall_at_ms + 1200;
        if in_window(still_at) {
            out.push((still_at, LinkPayload::Event(MotionEvent::new(still_at, MotionEventKind::StillnessStart))));
        }

        let still = to_ms >= still_at;
        let telemetry = ImuTelemetry {
            steps: (to_ms.min(self.fall_at_ms) / self.step_period_ms),
            falls_count: u64::from(to_ms >= self.fall_at_ms),
            imu_moving: to_ms < self.fall_at_ms,
            still,
            tilt_deg: if to_ms >= self.fall_at_ms { 85.0 } else { 5.0 },
            ..ImuTelemetry::default()
        };
        out.push((to_ms, LinkPayload::Telemetry(telemetry)));
        out
    }
}

pub async fn simulated_radar_loop(
    tx: Sender<RadarSample>,
    clock: ReceiverClock,
    patient: SimulatedPatient,
    health: Arc<SourceHealth>,
) {
    let mut ticker = interval(Duration::from_millis(100));
    let mut count = 0u64;
    loop {
        ticker.tick().await;
        health.update();
        if !forward(&tx, patient.radar_at(clock.now_ms()), "radar-sim", &mut count) {
            break;
        }
    }
}

pub async fn simulated_link_loop(
    tx: Sender<LinkArrival>,
    clock: ReceiverClock,
    patient: SimulatedPatient,
    send_every: Duration,
    health: Arc<SourceHealth>,
) {
    let mut ticker = interval(send_every);
    let mut sender = LinkSender::new();
    let mut last = clock.now_ms();
    let mut count = 0u64;
    loop {
        ticker.tick().await;
        let now = clock.now_ms();
        for (origin, payload) in patient.imu_between(last, now) {
            health.update();
            if !forward(&tx, (sender.wrap(payload, origin), now), "link-sim", &mut count) {
                return;
            }
        }
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sensor_fusion::{FusionEvent, ReceiverFusion};
    use crate::types::PatientStatus;
    use tokio::sync::mpsc;

    #[test]
    fn test_simulated_walk_then_fall() {
        let patient = SimulatedPatient::default();
        let mut fusion = ReceiverFusion::new(EngineConfig::default());
        let mut sender = LinkSender::new();
        let mut statuses = Vec::new();

        let mut last = 0;
        for t in (100..=60_000).step_by(100) {
            let mut events = fusion.feed_radar(&patient.radar_at(t));
            if t % 500 == 0 {
                for (origin, payload) in patient.imu_between(last, t) {
                    events.extend(fusion.feed_link(sender.wrap(payload, origin), t));
                }
                last = t;
            }
            events.extend(fusion.tick(t));
            for e in events {
                if let FusionEvent::StatusChanged(c) = e {
                    statuses.push(c.to);
                }
            }
        }

        assert_eq!(statuses.first(), Some(&PatientStatus::SuspectFall));
        assert_eq!(statuses.get(1), Some(&PatientStatus::Alert));
        assert_eq!(fusion.status(), PatientStatus::ImmobileTimeout);
    }

    #[test]
    fn test_steps_only_before_fall() {
        let patient = SimulatedPatient { fall_at_ms: 2000, step_period_ms: 500 };
        let steps = patient
            .imu_between(0, 1900)
            .iter()
            .filter(|(_, p)| matches!(p, LinkPayload::Event(e) if e.kind == MotionEventKind::Step))
            .count();
        assert_eq!(steps, 3);
        assert!(patient
            .imu_between(2000, 2500)
            .iter()
            .all(|(_, p)| !matches!(p, LinkPayload::Event(e) if e.kind == MotionEventKind::Step)));
    }

    #[test]
    fn test_forward_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut count = 0;
        assert!(forward(&tx, 1u32, "t", &mut count));
        assert!(forward(&tx, 2u32, "t", &mut count));
        assert_eq!(count, 1);
        assert_eq!(rx.try_recv().ok(), Some(1));

        drop(rx);
        assert!(!forward(&tx, 3u32, "t", &mut count));
    }
}
