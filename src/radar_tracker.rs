//! Single-target radar track gating.
//!
//! Turns one (range, velocity) sample per radar cycle into a LOST / TRACKING /
//! LOCKED judgment with an exponentially smoothed position and velocity.
//! A sample is folded in only when it lands inside the position and velocity
//! gates around the current estimate; while LOST any in-range sample
//! re-acquires. `max_lost_frames` consecutive misses drop the track.

use crate::config::EngineConfig;
use crate::types::{RadarMotion, RadarSample, TrackEstimate, TrackState};

pub struct RadarTracker {
    gate_dpos_m: f64,
    gate_dv: f64,
    need_stable_to_lock: u32,
    max_lost_frames: u32,
    min_y_m: f64,
    max_y_m: f64,
    alpha: f64,
    v_move_th: f64,
    fast_v: f64,

    estimate: TrackEstimate,
    last_cycle_ms: Option<u64>,
}

impl RadarTracker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            gate_dpos_m: config.gate_dpos_m,
            gate_dv: config.gate_dv,
            need_stable_to_lock: config.need_stable_to_lock,
            max_lost_frames: config.max_lost_frames,
            min_y_m: config.min_y_m,
            max_y_m: config.max_y_m,
            alpha: config.track_alpha,
            v_move_th: config.v_move_th,
            fast_v: config.fast_v,
            estimate: TrackEstimate::lost(0),
            last_cycle_ms: None,
        }
    }

    /// Process one radar cycle. Absent targets come in as `RadarSample::absent`.
    pub fn update(&mut self, sample: &RadarSample) -> TrackEstimate {
        if let Some(last) = self.last_cycle_ms {
            if sample.timestamp_ms < last {
                log::debug!(
                    "radar cycle at {} ms older than last processed {} ms, ignored",
                    sample.timestamp_ms,
                    last
                );
                return self.estimate;
            }
        }
        self.last_cycle_ms = Some(sample.timestamp_ms);
        self.estimate.updated_at_ms = sample.timestamp_ms;

        if !self.in_range(sample) {
            self.miss();
        } else if self.estimate.state == TrackState::Lost {
            self.acquire(sample);
        } else {
            let d_pos = (sample.range_m - self.estimate.pos_m).abs();
            let d_v = (sample.velocity - self.estimate.velocity).abs();
            if d_pos <= self.gate_dpos_m && d_v <= self.gate_dv {
                self.accept(sample);
            } else {
                log::debug!("radar sample rejected by gate (dPos {:.2} m, dV {:.2})", d_pos, d_v);
                self.miss();
            }
        }

        self.estimate.motion = self.classify(self.estimate.velocity);
        self.estimate
    }

    pub fn estimate(&self) -> &TrackEstimate {
        &self.estimate
    }

    pub fn classify(&self, velocity: f64) -> RadarMotion {
        let speed = velocity.abs();
        if speed >= self.fast_v {
            RadarMotion::Fast
        } else if speed >= self.v_move_th {
            RadarMotion::Moving
        } else {
            RadarMotion::Still
        }
    }

    fn in_range(&self, sample: &RadarSample) -> bool {
        sample.valid
            && sample.range_m.is_finite()
            && sample.velocity.is_finite()
            && sample.range_m >= self.min_y_m
            && sample.range_m <= self.max_y_m
    }

    fn acquire(&mut self, sample: &RadarSample) {
        self.estimate.pos_m = sample.range_m;
        self.estimate.velocity = sample.velocity;
        self.estimate.stable_count = 1;
        self.estimate.lost_count = 0;
        self.estimate.state = if self.need_stable_to_lock <= 1 {
            TrackState::Locked
        } else {
            TrackState::Tracking
        };
        log::debug!("radar target acquired at {:.2} m", sample.range_m);
    }

    fn accept(&mut self, sample: &RadarSample) {
        let e = &mut self.estimate;
        e.pos_m += self.alpha * (sample.range_m - e.pos_m);
        e.velocity += self.alpha * (sample.velocity - e.velocity);
        e.stable_count = e.stable_count.saturating_add(1);
        e.lost_count = 0;
        if e.state == TrackState::Tracking && e.stable_count >= self.need_stable_to_lock {
            e.state = TrackState::Locked;
        }
    }

    fn miss(&mut self) {
        let e = &mut self.estimate;
        e.stable_count = 0;
        e.lost_count = e.lost_count.saturating_add(1);
        if e.state != TrackState::Lost && e.lost_count >= self.max_lost_frames {
            log::debug!("radar track lost after {} missed cycles", e.lost_count);
            e.state = TrackState::Lost;
            e.velocity = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tracker() -> RadarTracker {
        RadarTracker::new(&EngineConfig::default())
    }

    fn feed(tracker: &mut RadarTracker, start_ms: u64, n: u64, pos: f64, vel: f64) -> TrackEstimate {
        let mut est = *tracker.estimate();
        for i in 0..n {
            est = tracker.update(&RadarSample::new(pos, vel, start_ms + i * 100));
        }
        est
    }

    #[test]
    fn test_locks_after_stable_cycles() {
        let mut t = tracker();
        let est = feed(&mut t, 0, 5, 1.2, 0.05);
        assert_eq!(est.state, TrackState::Tracking);

        let est = t.update(&RadarSample::new(1.2, 0.05, 500));
        assert_eq!(est.state, TrackState::Locked);
        assert_eq!(est.motion, RadarMotion::Still);
        assert_relative_eq!(est.pos_m, 1.2, epsilon = 1e-9);
    }

    #[test]
    fn test_lost_after_max_lost_frames() {
        let mut t = tracker();
        feed(&mut t, 0, 10, 2.0, 0.0);
        assert_eq!(t.estimate().state, TrackState::Locked);

        for i in 0..39 {
            let est = t.update(&RadarSample::absent(1000 + i * 100));
            assert_eq!(est.state, TrackState::Locked);
        }
        let est = t.update(&RadarSample::absent(5000));
        assert_eq!(est.state, TrackState::Lost);
        assert_eq!(est.lost_count, 40);
    }

    #[test]
    fn test_gate_rejection_keeps_estimate() {
        let mut t = tracker();
        feed(&mut t, 0, 3, 1.5, 0.2);
        let before = *t.estimate();

        let est = t.update(&RadarSample::new(3.0, 0.2, 400));
        assert_relative_eq!(est.pos_m, before.pos_m);
        assert_eq!(est.lost_count, 1);
        assert_eq!(est.stable_count, 0);

        let est = t.update(&RadarSample::new(1.6, 0.2, 500));
        assert_eq!(est.lost_count, 0);
        assert_eq!(est.stable_count, 1);
    }

    #[test]
    fn test_out_of_range_counts_as_absent() {
        let mut t = tracker();
        feed(&mut t, 0, 2, 1.0, 0.0);
        let est = t.update(&RadarSample::new(4.5, 0.0, 300));
        assert_eq!(est.lost_count, 1);
        let est = t.update(&RadarSample::new(0.1, 0.0, 400));
        assert_eq!(est.lost_count, 2);
        let est = t.update(&RadarSample::new(f64::NAN, 0.0, 500));
        assert_eq!(est.lost_count, 3);
    }

    #[test]
    fn test_out_of_range_never_acquires() {
        let mut t = tracker();
        let est = t.update(&RadarSample::new(5.0, 0.0, 0));
        assert_eq!(est.state, TrackState::Lost);
    }

    #[test]
    fn test_reacquires_anywhere_in_range_when_lost() {
        let mut t = tracker();
        feed(&mut t, 0, 6, 1.0, 0.0);
        for i in 0..40 {
            t.update(&RadarSample::absent(1000 + i * 100));
        }
        assert_eq!(t.estimate().state, TrackState::Lost);

        let est = t.update(&RadarSample::new(3.5, -0.4, 6000));
        assert_eq!(est.state, TrackState::Tracking);
        assert_relative_eq!(est.pos_m, 3.5);
        assert_eq!(est.lost_count, 0);
    }

    #[test]
    fn test_position_stays_in_bounds_while_tracked() {
        let mut t = tracker();
        let positions = [0.35, 0.9, 1.5, 2.2, 2.9, 3.6, 3.95, 3.4, 2.7];
        for (i, p) in positions.iter().enumerate() {
            let est = t.update(&RadarSample::new(*p, 0.5, i as u64 * 100));
            if est.is_tracked() {
                assert!(est.pos_m >= 0.3 && est.pos_m <= 4.0);
            }
        }
    }

    #[test]
    fn test_motion_classification() {
        let t = tracker();
        assert_eq!(t.classify(0.05), RadarMotion::Still);
        assert_eq!(t.classify(-0.3), RadarMotion::Moving);
        assert_eq!(t.classify(0.9), RadarMotion::Fast);
        assert!(RadarMotion::Fast.is_moving());
    }

    #[test]
    fn test_older_cycle_ignored() {
        let mut t = tracker();
        feed(&mut t, 1000, 3, 1.0, 0.0);
        let before = *t.estimate();
        let est = t.update(&RadarSample::new(1.1, 0.0, 500));
        assert_eq!(est, before);
    }
}
