use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use fallwatch::config::EngineConfig;
use fallwatch::reporter::MemorySink;
use fallwatch::session::{load_session, run_session};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a recorded session *.json[.gz]
    #[arg(long, conflicts_with = "dir")]
    log: Option<PathBuf>,

    /// Directory of sessions to batch replay (processes *.json and *.json.gz)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Engine config JSON (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deadline evaluation period in recorded milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Write the JSON summary here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn run_once(path: &Path, config: &EngineConfig, args: &Args) -> anyhow::Result<serde_json::Value> {
    let session = load_session(path)?;
    let reports = MemorySink::new();
    let summary = run_session(&session, config, args.tick_ms, &reports);

    println!("== {} ({} readings, {:.1}s)", path.display(), summary.readings, summary.duration_ms as f64 / 1000.0);
    for change in &summary.status_changes {
        println!(
            "[{:>9} ms] {} -> {} ({}{})",
            change.at_ms,
            change.from,
            change.to,
            change.reason.as_str(),
            if change.reminder { ", reminder" } else { "" }
        );
    }

    Ok(json!({
        "log": path.display().to_string(),
        "tick_ms": args.tick_ms,
        "summary": serde_json::to_value(&summary)?,
        "reports": serde_json::to_value(reports.payloads())?,
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let mut results = Vec::new();
    if let Some(dir) = args.dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_file() && (name.ends_with(".json") || name.ends_with(".json.gz")) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &config, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &config, &args)?);
    } else {
        anyhow::bail!("Provide --log or --dir");
    }

    let json = serde_json::to_string_pretty(&results)?;
    match &args.output {
        Some(path) => std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
