use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

/// Tracks arrival of one input source (radar socket or IMU link)
#[derive(Debug)]
pub struct SourceHealth {
    pub name: String,
    last_update: Mutex<Instant>,
    pub silence_threshold: Duration,
    messages: AtomicU64,
    reported_silent: AtomicBool,
}

impl SourceHealth {
    pub fn new(name: &str, silence_threshold: Duration) -> Self {
        SourceHealth {
            name: name.to_string(),
            last_update: Mutex::new(Instant::now()),
            silence_threshold,
            messages: AtomicU64::new(0),
            reported_silent: AtomicBool::new(false),
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// True exactly once per silence episode, so the warning is not repeated.
    fn should_report_silence(&self) -> bool {
        if self.is_silent() {
            !self.reported_silent.swap(true, Ordering::Relaxed)
        } else {
            if self.reported_silent.swap(false, Ordering::Relaxed) {
                log::info!("[HEALTH] {} back after silence", self.name);
            }
            false
        }
    }
}

/// Health monitor for the receiver's two input sources
pub struct HealthMonitor {
    pub radar: Arc<SourceHealth>,
    pub link: Arc<SourceHealth>,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new() -> Self {
        // Radar cycles every 100 ms, the link sends telemetry every 50 ms.
        HealthMonitor {
            radar: Arc::new(SourceHealth::new("Radar", Duration::from_secs(2))),
            link: Arc::new(SourceHealth::new("IMU link", Duration::from_secs(5))),
            check_interval: Duration::from_secs(2),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            radar_healthy: !self.radar.is_silent(),
            radar_silence_duration: self.radar.time_since_last_update(),
            radar_messages: self.radar.messages(),

            link_healthy: !self.link.is_silent(),
            link_silence_duration: self.link.time_since_last_update(),
            link_messages: self.link.messages(),
        }
    }

    /// Format health status for logging
    pub fn format_status(&self) -> String {
        let report = self.check_health();
        let fmt = |healthy: bool, silence: Option<Duration>| {
            if healthy {
                "✓".to_string()
            } else {
                format!("⚠ (silent {:.1}s)", silence.unwrap_or_default().as_secs_f64())
            }
        };
        format!(
            "Health: Radar {} | Link {}",
            fmt(report.radar_healthy, report.radar_silence_duration),
            fmt(report.link_healthy, report.link_silence_duration)
        )
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct HealthReport {
    pub radar_healthy: bool,
    pub radar_silence_duration: Option<Duration>,
    pub radar_messages: u64,

    pub link_healthy: bool,
    pub link_silence_duration: Option<Duration>,
    pub link_messages: u64,
}

/// Periodically log sources that went silent
pub async fn health_monitor_task(monitor: Arc<HealthMonitor>) {
    loop {
        sleep(monitor.check_interval).await;

        for source in [&monitor.radar, &monitor.link] {
            if source.should_report_silence() {
                log::warn!(
                    "[HEALTH] ⚠️ {} SILENT for {:.1}s",
                    source.name,
                    source.time_since_last_update().unwrap_or_default().as_secs_f64()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_source_silence_detection() {
        let health = SourceHealth::new("test", Duration::from_millis(200));
        assert!(!health.is_silent());

        thread::sleep(std::time::Duration::from_millis(300));
        assert!(health.is_silent());

        health.update();
        assert!(!health.is_silent());
        assert_eq!(health.messages(), 1);
    }

    #[test]
    fn test_silence_reported_once() {
        let health = SourceHealth::new("test", Duration::from_millis(50));
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(health.should_report_silence());
        assert!(!health.should_report_silence());

        health.update();
        assert!(!health.should_report_silence());
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(health.should_report_silence());
    }

    #[test]
    fn test_health_monitor() {
        let monitor = HealthMonitor::new();
        let report = monitor.check_health();
        assert!(report.radar_healthy);
        assert!(report.link_healthy);
        assert!(monitor.format_status().contains("✓"));
    }
}
