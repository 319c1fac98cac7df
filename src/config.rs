use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FallwatchError, Result};

/// Every threshold and timeout the tracker, classifier and escalation engine use.
///
/// Defaults are the values deployed on the ESP32 receiver/sender pair. A JSON
/// file may override any subset of fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ── Freshness ──
    pub imu_fresh_ms: u64,

    // ── Radar gating / track management ──
    pub gate_dpos_m: f64,
    pub gate_dv: f64,
    pub need_stable_to_lock: u32,
    pub max_lost_frames: u32,
    pub min_y_m: f64,
    pub max_y_m: f64,
    pub track_alpha: f64,

    // ── Radar movement classification ──
    pub v_move_th: f64,
    pub fast_v: f64,

    // ── Link cadence ──
    pub espnow_send_ms: u64,

    // ── Step detection ──
    pub step_threshold: f64,
    pub step_vertical_threshold: f64,
    pub buffer_length: usize,
    pub debounce_delay_ms: u64,

    // ── Stair detection ──
    pub stair_win_ms: u64,
    pub stairs_alim_rms_th: f64,
    pub stairs_tilt_range_th: f64,
    pub stairs_dir_ratio: f64,
    pub invert_y: bool,

    // ── Impact detection ──
    pub impact_g: f64,
    pub rot_dps: f64,
    pub tilt_deg: f64,
    pub reference_tilt_deg: f64,
    pub impact_confirm_ms: u64,
    pub impact_refractory_ms: u64,

    // ── Stillness ──
    pub still_w: f64,
    pub still_al: f64,
    pub still_energy_alpha: f64,
    pub still_time_ms: u64,

    // ── Gravity low-pass ──
    pub alpha_g: f64,

    // ── Physical sensor range ──
    pub max_accel_g: f64,
    pub max_rate_dps: f64,

    // ── Escalation timers ──
    pub suspect_timeout_ms: u64,
    pub ok_timeout_ms: u64,
    pub im_ok_hold_ms: u64,
    pub immobility_report_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            imu_fresh_ms: 2000,
            gate_dpos_m: 0.8,
            gate_dv: 0.7,
            need_stable_to_lock: 6,
            max_lost_frames: 40,
            min_y_m: 0.3,
            max_y_m: 4.0,
            track_alpha: 0.5,
            v_move_th: 0.12,
            fast_v: 0.85,
            espnow_send_ms: 50,
            step_threshold: 0.15,
            step_vertical_threshold: 0.15,
            buffer_length: 50,
            debounce_delay_ms: 300,
            stair_win_ms: 350,
            stairs_alim_rms_th: 0.34,
            stairs_tilt_range_th: 1.3,
            stairs_dir_ratio: 1.25,
            invert_y: false,
            impact_g: 2.0,
            rot_dps: 250.0,
            tilt_deg: 60.0,
            reference_tilt_deg: 0.0,
            impact_confirm_ms: 600,
            impact_refractory_ms: 2000,
            still_w: 120.0,
            still_al: 0.2,
            still_energy_alpha: 0.5,
            still_time_ms: 1000,
            alpha_g: 0.969_697,
            max_accel_g: 16.0,
            max_rate_dps: 2000.0,
            suspect_timeout_ms: 3000,
            ok_timeout_ms: 30_000,
            im_ok_hold_ms: 5000,
            immobility_report_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FallwatchError::Config(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| FallwatchError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(FallwatchError::InvalidConfig(msg.to_string()))
        }

        if self.gate_dpos_m <= 0.0 || self.gate_dv <= 0.0 {
            return invalid("radar gates must be positive");
        }
        if self.min_y_m >= self.max_y_m {
            return invalid("min_y_m must be below max_y_m");
        }
        if self.need_stable_to_lock == 0 || self.max_lost_frames == 0 {
            return invalid("lock and loss counts must be non-zero");
        }
        if self.fast_v < self.v_move_th {
            return invalid("fast_v must not be below v_move_th");
        }
        if self.buffer_length == 0 {
            return invalid("buffer_length must be non-zero");
        }
        for (name, alpha) in [
            ("alpha_g", self.alpha_g),
            ("track_alpha", self.track_alpha),
            ("still_energy_alpha", self.still_energy_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(FallwatchError::InvalidConfig(format!("{name} must be in (0, 1]")));
            }
        }
        for (name, threshold) in [
            ("step_threshold", self.step_threshold),
            ("impact_g", self.impact_g),
            ("rot_dps", self.rot_dps),
            ("tilt_deg", self.tilt_deg),
            ("still_w", self.still_w),
            ("still_al", self.still_al),
        ] {
            if !(threshold > 0.0) {
                return Err(FallwatchError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        for (name, ms) in [
            ("imu_fresh_ms", self.imu_fresh_ms),
            ("stair_win_ms", self.stair_win_ms),
            ("still_time_ms", self.still_time_ms),
            ("suspect_timeout_ms", self.suspect_timeout_ms),
            ("ok_timeout_ms", self.ok_timeout_ms),
            ("im_ok_hold_ms", self.im_ok_hold_ms),
            ("immobility_report_ms", self.immobility_report_ms),
            ("espnow_send_ms", self.espnow_send_ms),
        ] {
            if ms == 0 {
                return Err(FallwatchError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
