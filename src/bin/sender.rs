//! Body-worn unit: reads `ImuSample` JSON lines on stdin, classifies them and
//! sends link datagrams to the receiver.
//!
//! ```text
//! imu_dump | sender --target 192.168.4.1:4211
//! ```

use std::io::BufRead;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::bounded;

use fallwatch::config::EngineConfig;
use fallwatch::link::{LinkMessage, LinkPayload, LinkSender};
use fallwatch::motion_classifier::MotionClassifier;
use fallwatch::types::ImuSample;

#[derive(Parser, Debug)]
#[command(name = "sender")]
#[command(about = "Body-worn IMU unit - classify samples and send link messages", long_about = None)]
struct Args {
    /// Receiver link address
    #[arg(long, default_value = "127.0.0.1:4211")]
    target: String,

    /// Engine config JSON (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn send(socket: &UdpSocket, msg: &LinkMessage) -> bool {
    let bytes = match msg.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("[SENDER] {}", e);
            return false;
        }
    };
    match socket.send(&bytes) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("[SENDER] seq {} not sent: {}", msg.seq, e);
            false
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding sender socket")?;
    socket
        .connect(&args.target)
        .with_context(|| format!("connecting to {}", args.target))?;
    log::info!("[SENDER] sending to {} (telemetry every {} ms)", args.target, config.espnow_send_ms);

    let (tx, rx) = bounded::<ImuSample>(512);
    let reader = thread::spawn(move || {
        let mut bad_lines = 0u64;
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ImuSample>(&line) {
                Ok(sample) => {
                    if tx.send(sample).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    bad_lines += 1;
                    log::debug!("[SENDER] bad sample line: {}", e);
                }
            }
        }
        bad_lines
    });

    let mut classifier = MotionClassifier::new(&config);
    let mut link = LinkSender::new();
    let mut last_telemetry: Option<u64> = None;
    let mut sent = 0u64;
    let mut failed = 0u64;

    for sample in rx.iter() {
        let ts = sample.timestamp_ms;
        let mut outgoing = Vec::new();
        for event in classifier.update(&sample) {
            log::info!("[SENDER] {:?} at {} ms", event.kind, event.timestamp_ms);
            outgoing.push(link.wrap(LinkPayload::Event(event), ts));
        }
        if last_telemetry.map_or(true, |t| ts.saturating_sub(t) >= config.espnow_send_ms) {
            last_telemetry = Some(ts);
            outgoing.push(link.wrap(LinkPayload::Telemetry(classifier.telemetry()), ts));
        }
        for msg in &outgoing {
            if send(&socket, msg) {
                sent += 1;
            } else {
                failed += 1;
            }
        }
    }

    let bad_lines = reader
        .join()
        .map_err(|_| anyhow::anyhow!("stdin reader thread panicked"))?;
    let telemetry = classifier.telemetry();
    log::info!("=== Sender Stats ===");
    log::info!("Messages: {} sent, {} failed", sent, failed);
    log::info!(
        "Samples: {} rejected by classifier, {} unparseable lines",
        classifier.dropped_samples(),
        bad_lines
    );
    log::info!(
        "Activity: {} steps, {} stair segments, {} falls",
        telemetry.steps,
        telemetry.stairs_count,
        telemetry.falls_count
    );
    Ok(())
}
