use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use fallwatch::config::EngineConfig;
use fallwatch::health_monitor::{health_monitor_task, HealthMonitor};
use fallwatch::live_status::LiveStatus;
use fallwatch::reporter::{HttpReporter, LogSink, ReporterConfig, StatusPayload, StatusSink};
use fallwatch::sensor_fusion::{FusionEvent, ReceiverFusion};
use fallwatch::sensors::{self, LinkArrival, ReceiverClock, SimulatedPatient};
use fallwatch::types::RadarSample;

#[derive(Parser, Debug)]
#[command(name = "fallwatch")]
#[command(about = "Fall detection receiver - radar + body-worn IMU escalation engine", long_about = None)]
struct Args {
    /// Patient identifier sent with every report
    #[arg(long, env = "FALLWATCH_PATIENT_ID", default_value = "p1")]
    patient_id: String,

    /// Cloud endpoint receiving status payloads (omit to only log them)
    #[arg(long, env = "FALLWATCH_CLOUD_URL")]
    cloud_url: Option<String>,

    /// UDP address for radar cycles
    #[arg(long, default_value = "0.0.0.0:4210")]
    radar_addr: String,

    /// UDP address for body-worn unit link messages
    #[arg(long, default_value = "0.0.0.0:4211")]
    link_addr: String,

    /// Engine config JSON (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for live_status.json
    #[arg(long, default_value = "fallwatch_status")]
    status_dir: PathBuf,

    /// Deadline evaluation period
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Periodic telemetry report period
    #[arg(long, default_value = "60")]
    telemetry_secs: u64,

    /// Log payloads instead of posting them
    #[arg(long)]
    dry_run: bool,

    /// Replace both sockets with a scripted walk-then-fall patient
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    log::info!("[{}] fallwatch starting", ts_now());
    log::info!("  Patient: {}", args.patient_id);
    log::info!("  Mode: {}", if args.simulate { "simulated" } else { "udp" });
    log::info!("  Status dir: {}", args.status_dir.display());

    std::fs::create_dir_all(&args.status_dir)
        .with_context(|| format!("creating {}", args.status_dir.display()))?;
    let status_path = args.status_dir.join("live_status.json");

    // Delivery
    let mut reporter: Option<Arc<HttpReporter>> = None;
    let sink: Arc<dyn StatusSink> = match (&args.cloud_url, args.dry_run) {
        (Some(url), false) => {
            let (http, _delivery) = HttpReporter::spawn(ReporterConfig::new(url, &args.patient_id))
                .context("starting cloud reporter")?;
            let http = Arc::new(http);
            reporter = Some(http.clone());
            log::info!("  Reporting to {}", url);
            http
        }
        _ => {
            log::info!("  Reporting to log only");
            Arc::new(LogSink)
        }
    };

    // Inputs
    let clock = ReceiverClock::new();
    let health = Arc::new(HealthMonitor::new());
    let (radar_tx, mut radar_rx) = mpsc::channel::<RadarSample>(256);
    let (link_tx, mut link_rx) = mpsc::channel::<LinkArrival>(256);

    if args.simulate {
        let patient = SimulatedPatient::default();
        tokio::spawn(sensors::simulated_radar_loop(radar_tx, clock, patient, health.radar.clone()));
        tokio::spawn(sensors::simulated_link_loop(
            link_tx,
            clock,
            patient,
            Duration::from_millis(config.espnow_send_ms),
            health.link.clone(),
        ));
    } else {
        let radar_socket = UdpSocket::bind(&args.radar_addr)
            .await
            .with_context(|| format!("binding radar socket {}", args.radar_addr))?;
        let link_socket = UdpSocket::bind(&args.link_addr)
            .await
            .with_context(|| format!("binding link socket {}", args.link_addr))?;
        tokio::spawn(sensors::radar_udp_loop(radar_socket, radar_tx, clock, health.radar.clone()));
        tokio::spawn(sensors::link_udp_loop(link_socket, link_tx, clock, health.link.clone()));
    }
    tokio::spawn(health_monitor_task(health.clone()));

    // "ack" on stdin = patient pressed I'm OK / caregiver handled the alert
    let (ack_tx, mut ack_rx) = mpsc::channel::<()>(4);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().eq_ignore_ascii_case("ack") && ack_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let mut fusion = ReceiverFusion::new(config);
    let started = Instant::now();

    let mut tick = interval(Duration::from_millis(args.tick_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut telemetry = interval(Duration::from_secs(args.telemetry_secs.max(1)));
    telemetry.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status_save = interval(Duration::from_secs(2));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut transitions = 0u64;

    loop {
        let events = tokio::select! {
            Some(sample) = radar_rx.recv() => fusion.feed_radar(&sample),
            Some((msg, received_ms)) = link_rx.recv() => fusion.feed_link(msg, received_ms),
            Some(()) = ack_rx.recv() => {
                log::info!("[ACK] acknowledged at {} ms", clock.now_ms());
                fusion.acknowledge(clock.now_ms())
            }
            _ = tick.tick() => fusion.tick(clock.now_ms()),
            _ = telemetry.tick() => {
                sink.submit(StatusPayload::telemetry(
                    &args.patient_id,
                    fusion.status(),
                    clock.now_ms(),
                    &fusion.report_context(),
                    Utc::now(),
                ));
                Vec::new()
            }
            _ = status_save.tick() => {
                let status = live_status(&args.patient_id, &fusion, &health, reporter.as_deref(), started);
                if let Err(e) = status.save(&status_path) {
                    log::warn!("[STATUS] failed to write {}: {}", status_path.display(), e);
                }
                log::debug!("{}", health.format_status());
                Vec::new()
            }
            _ = &mut shutdown => {
                log::info!("[{}] shutdown requested", ts_now());
                break;
            }
        };

        for event in events {
            match event {
                FusionEvent::StatusChanged(change) => {
                    transitions += 1;
                    sink.submit(StatusPayload::for_change(
                        &args.patient_id,
                        &change,
                        &fusion.report_context(),
                        Utc::now(),
                    ));
                }
                FusionEvent::LinkDropped { seq } => log::debug!("[LINK] dropped seq {}", seq),
                FusionEvent::TrackStateChanged { .. } => {}
            }
        }
    }

    // Final live status
    let final_status = live_status(&args.patient_id, &fusion, &health, reporter.as_deref(), started);
    let final_path = args.status_dir.join("live_status_final.json");
    final_status
        .save(&final_path)
        .with_context(|| format!("writing {}", final_path.display()))?;

    let snap = fusion.snapshot();
    log::info!("=== Final Stats ===");
    log::info!("Status: {}", snap.status);
    log::info!("Transitions: {}", transitions);
    log::info!("Radar cycles: {}", snap.radar_cycles);
    log::info!("Link messages: {} accepted, {} dropped", snap.link_accepted, snap.link_dropped);
    log::info!(
        "Activity: {} steps, {} stair segments, {} falls",
        snap.escalation.counters.steps,
        snap.escalation.counters.stair_segments,
        snap.escalation.counters.falls
    );

    Ok(())
}

fn live_status(
    patient_id: &str,
    fusion: &ReceiverFusion,
    health: &HealthMonitor,
    reporter: Option<&HttpReporter>,
    started: Instant,
) -> LiveStatus {
    let mut status = LiveStatus::from_snapshot(
        patient_id,
        &fusion.snapshot(),
        &health.check_health(),
        started.elapsed().as_secs(),
    );
    status.reports_dropped = reporter.map(|r| r.dropped()).unwrap_or(0);
    status
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
