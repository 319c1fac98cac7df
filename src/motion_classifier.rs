//! Body-worn IMU classifier.
//!
//! Consumes calibrated samples at the IMU rate and emits discrete events:
//! steps (rising edge of the detrended acceleration magnitude, debounced),
//! stair segments (lateral RMS plus tilt range over a short window, direction
//! from the vertical energy ratio), impacts (a high-energy transient followed
//! by an abnormal tilt) and stillness start/end (dual-threshold motion energy
//! held for `still_time_ms`).
//!
//! Tilt is taken from the low-pass gravity estimate; the sender's reported
//! tilt is used when it deviates further from the reference (the gravity
//! estimate lags a fast fall by a few hundred milliseconds).
//!
//! Invalid samples are dropped without touching any buffer.

use std::collections::VecDeque;

use crate::config::EngineConfig;
use crate::smoothing::{Ewma, GravityFilter, RollingWindow};
use crate::types::{
    lateral_magnitude, tilt_from_vertical_deg, vertical, ImuSample, ImuTelemetry, MotionEvent,
    MotionEventKind, StairDirection,
};

#[derive(Clone, Copy, Debug)]
struct StairPoint {
    timestamp_ms: u64,
    lateral: f64,
    vertical: f64,
    tilt_deg: f64,
}

#[derive(Clone, Copy, Debug)]
struct PendingImpact {
    since_ms: u64,
    peak_g: f64,
}

pub struct MotionClassifier {
    config: EngineConfig,

    // Signal processing
    gravity: GravityFilter,
    magnitude_history: RollingWindow,
    gyro_energy: Ewma,
    accel_energy: Ewma,

    // Step state
    prev_step_feature: f64,
    last_step_ms: Option<u64>,

    // Stair state
    stair_window: VecDeque<StairPoint>,
    last_stair_ms: Option<u64>,

    // Impact state
    pending_impact: Option<PendingImpact>,
    last_impact_ms: Option<u64>,

    // Stillness state
    quiet: bool,
    quiet_since_ms: Option<u64>,
    still: bool,

    last_timestamp_ms: Option<u64>,
    last_tilt_deg: f64,

    // Counters
    steps: u64,
    stair_segments: u64,
    impacts: u64,
    dropped_samples: u64,
}

impl MotionClassifier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            gravity: GravityFilter::new(config.alpha_g),
            magnitude_history: RollingWindow::new(config.buffer_length),
            gyro_energy: Ewma::new(config.still_energy_alpha),
            accel_energy: Ewma::new(config.still_energy_alpha),
            prev_step_feature: 0.0,
            last_step_ms: None,
            stair_window: VecDeque::new(),
            last_stair_ms: None,
            pending_impact: None,
            last_impact_ms: None,
            quiet: false,
            quiet_since_ms: None,
            still: false,
            last_timestamp_ms: None,
            last_tilt_deg: 0.0,
            steps: 0,
            stair_segments: 0,
            impacts: 0,
            dropped_samples: 0,
            config: config.clone(),
        }
    }

    /// Classify one sample. Returns zero or more events, in detection order.
    pub fn update(&mut self, sample: &ImuSample) -> Vec<MotionEvent> {
        let mut events = Vec::new();

        if !self.accept(sample) {
            self.dropped_samples += 1;
            return events;
        }
        let ts = sample.timestamp_ms;
        self.last_timestamp_ms = Some(ts);

        let accel = sample.accel();
        let accel_mag = accel.norm();
        let gyro_mag = sample.gyro().norm();
        let gravity = self.gravity.update(accel);
        let dynamic = accel - gravity;
        let tilt = self.tilt(tilt_from_vertical_deg(&gravity), sample.tilt_deg);
        self.last_tilt_deg = tilt;

        let spike = accel_mag > self.config.impact_g || gyro_mag > self.config.rot_dps;
        if let Some(event) = self.detect_impact(ts, spike, accel_mag, tilt) {
            events.push(event);
        }

        // The fall itself and the settling after it are not locomotion.
        let impact_active = spike
            || self.pending_impact.is_some()
            || self
                .last_impact_ms
                .is_some_and(|t| ts.saturating_sub(t) < self.config.impact_refractory_ms);
        let vertical_dyn = vertical(&dynamic, self.config.invert_y);

        if let Some(event) = self.detect_step(ts, accel_mag, vertical_dyn.abs(), impact_active) {
            events.push(event);
        }

        self.stair_window.push_back(StairPoint {
            timestamp_ms: ts,
            lateral: lateral_magnitude(&dynamic),
            vertical: vertical_dyn,
            tilt_deg: tilt,
        });
        if let Some(event) = self.detect_stairs(ts, impact_active) {
            events.push(event);
        }

        if let Some(event) = self.detect_stillness(ts, gyro_mag, dynamic.norm()) {
            events.push(event);
        }

        events
    }

    /// Feature summary for the periodic link telemetry.
    pub fn telemetry(&self) -> ImuTelemetry {
        ImuTelemetry {
            steps: self.steps,
            stairs_count: self.stair_segments,
            falls_count: self.impacts,
            imu_moving: !self.quiet,
            still: self.still,
            tilt_deg: self.last_tilt_deg,
        }
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Whichever of the gravity-derived and reported tilt is further from
    /// the reference orientation.
    fn tilt(&self, gravity_tilt_deg: f64, reported_tilt_deg: f64) -> f64 {
        let reference = self.config.reference_tilt_deg;
        if (gravity_tilt_deg - reference).abs() > (reported_tilt_deg - reference).abs() {
            gravity_tilt_deg
        } else {
            reported_tilt_deg
        }
    }

    // ── Validation ───────────────────────────────────────────────────────

    fn accept(&self, sample: &ImuSample) -> bool {
        if !sample.is_finite() {
            log::debug!("non-finite IMU sample at {} ms dropped", sample.timestamp_ms);
            return false;
        }
        let accel_ok = [sample.ax, sample.ay, sample.az]
            .iter()
            .all(|a| a.abs() <= self.config.max_accel_g);
        let gyro_ok = [sample.gx, sample.gy, sample.gz]
            .iter()
            .all(|g| g.abs() <= self.config.max_rate_dps);
        if !accel_ok || !gyro_ok || sample.tilt_deg.abs() > 180.0 {
            log::debug!("out-of-range IMU sample at {} ms dropped", sample.timestamp_ms);
            return false;
        }
        if let Some(last) = self.last_timestamp_ms {
            if sample.timestamp_ms < last {
                return false;
            }
        }
        true
    }

    // ── Detectors ────────────────────────────────────────────────────────

    fn detect_impact(
        &mut self,
        ts: u64,
        spike: bool,
        accel_mag: f64,
        tilt_deg: f64,
    ) -> Option<MotionEvent> {
        if let Some(last) = self.last_impact_ms {
            if ts.saturating_sub(last) < self.config.impact_refractory_ms {
                return None;
            }
        }

        if let Some(pending) = self.pending_impact {
            if ts.saturating_sub(pending.since_ms) > self.config.impact_confirm_ms {
                log::debug!("spike of {:.2} g without tilt, not an impact", pending.peak_g);
                self.pending_impact = None;
            }
        }

        if spike {
            let pending = self
                .pending_impact
                .get_or_insert(PendingImpact { since_ms: ts, peak_g: accel_mag });
            pending.peak_g = pending.peak_g.max(accel_mag);
        }

        let pending = self.pending_impact?;
        let tilt_dev = (tilt_deg - self.config.reference_tilt_deg).abs();
        if tilt_dev >= self.config.tilt_deg {
            self.pending_impact = None;
            self.last_impact_ms = Some(ts);
            self.impacts += 1;
            log::info!("impact {:.2} g with tilt {:.0} deg", pending.peak_g, tilt_deg);
            return Some(MotionEvent::new(ts, MotionEventKind::Impact { magnitude_g: pending.peak_g }));
        }
        None
    }

    fn detect_step(
        &mut self,
        ts: u64,
        accel_mag: f64,
        vertical_dyn: f64,
        impact_active: bool,
    ) -> Option<MotionEvent> {
        let baseline = self.magnitude_history.mean().unwrap_or(accel_mag);
        let feature = accel_mag - baseline;
        let rising = self.prev_step_feature < self.config.step_threshold
            && feature >= self.config.step_threshold;
        self.prev_step_feature = feature;
        self.magnitude_history.push(accel_mag);

        if !rising || impact_active || vertical_dyn < self.config.step_vertical_threshold {
            return None;
        }
        if let Some(last) = self.last_step_ms {
            if ts.saturating_sub(last) < self.config.debounce_delay_ms {
                return None;
            }
        }

        self.last_step_ms = Some(ts);
        self.steps += 1;
        Some(MotionEvent::new(ts, MotionEventKind::Step))
    }

    fn detect_stairs(&mut self, ts: u64, impact_active: bool) -> Option<MotionEvent> {
        let win = self.config.stair_win_ms;
        while let Some(front) = self.stair_window.front() {
            if ts.saturating_sub(front.timestamp_ms) > win {
                self.stair_window.pop_front();
            } else {
                break;
            }
        }

        if impact_active || self.stair_window.len() < 3 {
            return None;
        }
        let span = ts.saturating_sub(self.stair_window.front()?.timestamp_ms);
        if span < win / 2 {
            return None;
        }
        if let Some(last) = self.last_stair_ms {
            if ts.saturating_sub(last) < win {
                return None;
            }
        }

        let n = self.stair_window.len() as f64;
        let rms = (self.stair_window.iter().map(|p| p.lateral * p.lateral).sum::<f64>() / n).sqrt();
        let (tilt_min, tilt_max) = self
            .stair_window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.tilt_deg), hi.max(p.tilt_deg))
            });
        if rms < self.config.stairs_alim_rms_th
            || tilt_max - tilt_min < self.config.stairs_tilt_range_th
        {
            return None;
        }

        let (up, down) = self.stair_window.iter().fold((0.0, 0.0), |(up, down), p| {
            if p.vertical > 0.0 {
                (up + p.vertical * p.vertical, down)
            } else {
                (up, down + p.vertical * p.vertical)
            }
        });
        let ratio = self.config.stairs_dir_ratio;
        let direction = if up > 0.0 && up >= ratio * down {
            StairDirection::Ascent
        } else if down > 0.0 && down >= ratio * up {
            StairDirection::Descent
        } else {
            return None;
        };

        self.last_stair_ms = Some(ts);
        self.stair_segments += 1;
        Some(MotionEvent::new(ts, MotionEventKind::StairSegment { direction }))
    }

    fn detect_stillness(&mut self, ts: u64, gyro_mag: f64, dynamic_mag: f64) -> Option<MotionEvent> {
        let gyro_e = self.gyro_energy.update(gyro_mag);
        let accel_e = self.accel_energy.update(dynamic_mag);
        self.quiet = gyro_e < self.config.still_w && accel_e < self.config.still_al;

        if self.quiet {
            let since = *self.quiet_since_ms.get_or_insert(ts);
            if !self.still && ts.saturating_sub(since) >= self.config.still_time_ms {
                self.still = true;
                return Some(MotionEvent::new(ts, MotionEventKind::StillnessStart));
            }
            None
        } else {
            self.quiet_since_ms = None;
            if self.still {
                self.still = false;
                return Some(MotionEvent::new(ts, MotionEventKind::StillnessEnd));
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64, a: (f64, f64, f64), g: (f64, f64, f64), tilt: f64) -> ImuSample {
        ImuSample { ax: a.0, ay: a.1, az: a.2, gx: g.0, gy: g.1, gz: g.2, tilt_deg: tilt, timestamp_ms: ts }
    }

    fn upright(ts: u64) -> ImuSample {
        sample(ts, (0.0, 1.0, 0.0), (0.0, 0.0, 0.0), 0.0)
    }

    fn classifier() -> MotionClassifier {
        MotionClassifier::new(&EngineConfig::default())
    }

    fn run(c: &mut MotionClassifier, samples: &[ImuSample]) -> Vec<MotionEvent> {
        samples.iter().flat_map(|s| c.update(s)).collect()
    }

    fn count(events: &[MotionEvent], pred: impl Fn(&MotionEventKind) -> bool) -> usize {
        events.iter().filter(|e| pred(&e.kind)).count()
    }

    fn baseline(c: &mut MotionClassifier, from: u64, to: u64) -> Vec<MotionEvent> {
        let samples: Vec<_> = (from..to).step_by(10).map(upright).collect();
        run(c, &samples)
    }

    #[test]
    fn test_step_debounce() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);

        let mut events = Vec::new();
        events.extend(c.update(&sample(200, (0.0, 1.3, 0.0), (0.0, 0.0, 0.0), 0.0)));
        events.extend(baseline(&mut c, 210, 300));
        events.extend(c.update(&sample(300, (0.0, 1.3, 0.0), (0.0, 0.0, 0.0), 0.0)));
        events.extend(baseline(&mut c, 310, 400));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Step)), 1);

        events.extend(baseline(&mut c, 400, 600));
        events.extend(c.update(&sample(600, (0.0, 1.3, 0.0), (0.0, 0.0, 0.0), 0.0)));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Step)), 2);
        assert_eq!(c.telemetry().steps, 2);
    }

    #[test]
    fn test_sustained_level_is_one_crossing() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);
        let high: Vec<_> = (200..240).step_by(10)
            .map(|ts| sample(ts, (0.0, 1.3, 0.0), (0.0, 0.0, 0.0), 0.0))
            .collect();
        let events = run(&mut c, &high);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Step)), 1);
    }

    #[test]
    fn test_impact_with_tilt() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);

        let events = c.update(&sample(100, (2.5, 0.0, 0.0), (0.0, 0.0, 0.0), 70.0));
        assert_eq!(events.len(), 1);
        match events[0].kind {
            MotionEventKind::Impact { magnitude_g } => assert!((magnitude_g - 2.5).abs() < 1e-9),
            other => panic!("expected impact, got {:?}", other),
        }

        // Lying still afterwards does not re-trigger.
        let lying: Vec<_> = (110..1500).step_by(10)
            .map(|ts| sample(ts, (0.0, 0.0, 1.0), (0.0, 0.0, 0.0), 70.0))
            .collect();
        let events = run(&mut c, &lying);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 0);
        assert_eq!(c.telemetry().falls_count, 1);
    }

    #[test]
    fn test_spike_without_tilt_is_not_impact() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        let events = c.update(&sample(100, (2.5, 0.0, 0.0), (0.0, 0.0, 0.0), 10.0));
        assert!(events.is_empty());

        let events = baseline(&mut c, 110, 1000);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 0);
    }

    #[test]
    fn test_tilt_within_confirm_window() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        assert!(c.update(&sample(100, (2.8, 0.0, 0.0), (0.0, 0.0, 0.0), 15.0)).is_empty());
        assert!(c.update(&sample(200, (0.0, 0.3, 0.9), (0.0, 0.0, 0.0), 40.0)).is_empty());
        let events = c.update(&sample(300, (0.0, 0.2, 1.0), (0.0, 0.0, 0.0), 75.0));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 1);
    }

    #[test]
    fn test_tilt_after_confirm_window_is_ignored() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        c.update(&sample(100, (2.8, 0.0, 0.0), (0.0, 0.0, 0.0), 15.0));
        let events = c.update(&sample(800, (0.0, 0.2, 1.0), (0.0, 0.0, 0.0), 75.0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_fall_right_after_expired_stumble() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        assert!(c.update(&sample(100, (2.5, 0.0, 0.0), (0.0, 0.0, 0.0), 10.0)).is_empty());
        baseline(&mut c, 110, 710);

        let mut events = c.update(&sample(710, (3.0, 0.0, 0.0), (0.0, 0.0, 0.0), 80.0));
        let lying: Vec<_> = (720..2000).step_by(10)
            .map(|ts| sample(ts, (0.0, 0.0, 1.0), (0.0, 0.0, 0.0), 80.0))
            .collect();
        events.extend(run(&mut c, &lying));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 1);
    }

    #[test]
    fn test_gravity_axis_change_alone_gives_tilt() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);
        // Reported tilt stays upright; only the accelerometer shows the body lying down.
        c.update(&sample(200, (2.5, 0.0, 0.0), (0.0, 0.0, 0.0), 0.0));
        let lying: Vec<_> = (210..800).step_by(10)
            .map(|ts| sample(ts, (0.0, 0.0, 1.0), (0.0, 0.0, 0.0), 0.0))
            .collect();
        let events = run(&mut c, &lying);

        let impacts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, MotionEventKind::Impact { .. }))
            .collect();
        assert_eq!(impacts.len(), 1);
        assert!(impacts[0].timestamp_ms <= 800);
        assert!(c.telemetry().tilt_deg > 60.0);
    }

    #[test]
    fn test_rotation_spike_with_tilt() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        let events = c.update(&sample(100, (0.0, 0.5, 0.8), (300.0, 0.0, 0.0), 65.0));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 1);
    }

    #[test]
    fn test_impact_sample_is_not_a_step() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);
        let events = c.update(&sample(200, (0.0, 2.6, 0.0), (0.0, 0.0, 0.0), 80.0));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Step)), 0);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::Impact { .. })), 1);
    }

    #[test]
    fn test_no_locomotion_while_settling_after_impact() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);
        c.update(&sample(200, (2.5, 0.0, 0.0), (0.0, 0.0, 0.0), 70.0));
        let lying: Vec<_> = (210..2200).step_by(10)
            .map(|ts| sample(ts, (0.0, 0.0, 1.0), (0.0, 0.0, 0.0), 80.0))
            .collect();
        let events = run(&mut c, &lying);
        assert!(events.iter().all(|e| !e.is_locomotion()));
    }

    #[test]
    fn test_stillness_start_and_end() {
        let mut c = classifier();
        let events = baseline(&mut c, 0, 990);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::StillnessStart)), 0);

        let events = baseline(&mut c, 990, 1020);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::StillnessStart)), 1);
        assert!(c.telemetry().still);

        let events = c.update(&sample(1020, (0.8, 1.5, 0.5), (200.0, 0.0, 0.0), 5.0));
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::StillnessEnd)), 1);
        assert!(!c.telemetry().still);
        assert!(c.telemetry().imu_moving);
    }

    #[test]
    fn test_stillness_fires_once() {
        let mut c = classifier();
        let events = baseline(&mut c, 0, 5000);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::StillnessStart)), 1);
    }

    fn stair_pattern(c: &mut MotionClassifier) -> Vec<MotionEvent> {
        baseline(c, 0, 200);
        let samples: Vec<_> = (0..60u64)
            .map(|i| {
                let ts = 200 + i * 10;
                let lateral = if i % 2 == 0 { 0.5 } else { -0.5 };
                let vert = if i % 2 == 0 { 1.3 } else { 0.95 };
                sample(ts, (lateral, vert, 0.0), (0.0, 0.0, 0.0), (i % 20) as f64 * 0.15)
            })
            .collect();
        run(c, &samples)
    }

    #[test]
    fn test_stair_ascent() {
        let mut c = classifier();
        let events = stair_pattern(&mut c);
        let ascents = count(&events, |k| {
            matches!(k, MotionEventKind::StairSegment { direction: StairDirection::Ascent })
        });
        let descents = count(&events, |k| {
            matches!(k, MotionEventKind::StairSegment { direction: StairDirection::Descent })
        });
        assert!(ascents >= 1);
        assert_eq!(descents, 0);
    }

    #[test]
    fn test_invert_y_flips_stair_direction() {
        let config = EngineConfig { invert_y: true, ..EngineConfig::default() };
        let mut c = MotionClassifier::new(&config);
        let events = stair_pattern(&mut c);
        let descents = count(&events, |k| {
            matches!(k, MotionEventKind::StairSegment { direction: StairDirection::Descent })
        });
        assert!(descents >= 1);
    }

    #[test]
    fn test_flat_walking_is_not_stairs() {
        let mut c = classifier();
        baseline(&mut c, 0, 200);
        let samples: Vec<_> = (0..60u64)
            .map(|i| {
                let lateral = if i % 2 == 0 { 0.5 } else { -0.5 };
                let vert = if i % 2 == 0 { 1.3 } else { 0.95 };
                sample(200 + i * 10, (lateral, vert, 0.0), (0.0, 0.0, 0.0), 0.0)
            })
            .collect();
        let events = run(&mut c, &samples);
        assert_eq!(count(&events, |k| matches!(k, MotionEventKind::StairSegment { .. })), 0);
    }

    #[test]
    fn test_invalid_samples_dropped() {
        let mut c = classifier();
        baseline(&mut c, 0, 100);
        let before = c.telemetry();

        assert!(c.update(&sample(100, (f64::NAN, 1.0, 0.0), (0.0, 0.0, 0.0), 0.0)).is_empty());
        assert!(c.update(&sample(110, (20.0, 1.0, 0.0), (0.0, 0.0, 0.0), 80.0)).is_empty());
        assert!(c.update(&sample(120, (0.0, 1.0, 0.0), (5000.0, 0.0, 0.0), 0.0)).is_empty());
        assert!(c.update(&sample(50, (0.0, 1.0, 0.0), (0.0, 0.0, 0.0), 0.0)).is_empty());

        assert_eq!(c.dropped_samples(), 4);
        assert_eq!(c.telemetry(), before);
    }
}
