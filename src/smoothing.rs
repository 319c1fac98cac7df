use std::collections::VecDeque;

use crate::types::Vec3;

/// Single-pole low-pass on the accelerometer vector, tracking gravity.
///
/// `alpha` is the weight kept from the previous estimate, so values close to
/// 1.0 track orientation slowly and leave the dynamic part in `accel - gravity`.
pub struct GravityFilter {
    alpha: f64,
    estimate: Option<Vec3>,
}

impl GravityFilter {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, estimate: None }
    }

    pub fn update(&mut self, accel: Vec3) -> Vec3 {
        let next = match self.estimate {
            None => accel,
            Some(prev) => prev * self.alpha + accel * (1.0 - self.alpha),
        };
        self.estimate = Some(next);
        next
    }
}

/// Fixed-length window of recent scalar features.
pub struct RollingWindow {
    window: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        RollingWindow { window: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, value: f64) {
        self.window.push_back(value);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    /// Mean of the buffered values, `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }
}

/// Exponentially weighted moving average; `alpha` weights the newest value.
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }
}
