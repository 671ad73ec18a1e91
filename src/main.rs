//! Demo binary for comic-orchestrator
//!
//! Starts the orchestrator, submits one topic and prints the finished artifact
//! as JSON.
//!
//! ```text
//! comic-orchestrator [--config path] [--topic t] [--panels n] [--tier n]
//!                    [--lang zh|en] [--style s] [--store-dir dir] [--offline]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)
//! - `COMIC_API_KEY`: API key for the chat-completions endpoint (not needed
//!   with `--offline`)

use std::path::PathBuf;
use std::sync::Arc;

use comic_orchestrator::config::{loader, OrchestratorConfig};
use comic_orchestrator::store::JsonFileStore;
use comic_orchestrator::{
    init_tracing, init_tracing_with, metrics, AgeTier, GenerationOptions, Language,
    OrchestratorBuilder, OrchestratorError, TemplateGenerator, VisualStyle,
};
use tracing::info;

struct Args {
    config: Option<PathBuf>,
    topic: String,
    panels: u8,
    tier: u8,
    language: Language,
    style: VisualStyle,
    store_dir: Option<PathBuf>,
    offline: bool,
}

fn usage() -> &'static str {
    "usage: comic-orchestrator [--config path] [--topic t] [--panels n] [--tier n] \
     [--lang zh|en] [--style cartoon|watercolor|realistic|minimalist] \
     [--store-dir dir] [--offline]"
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        topic: "加法运算".to_string(),
        panels: 4,
        tier: 2,
        language: Language::Chinese,
        style: VisualStyle::Cartoon,
        store_dir: None,
        offline: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().ok_or_else(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--config" => args.config = Some(PathBuf::from(value()?)),
            "--topic" => args.topic = value()?,
            "--panels" => {
                args.panels = value()?
                    .parse()
                    .map_err(|_| "--panels must be a number".to_string())?;
            }
            "--tier" => {
                args.tier = value()?
                    .parse()
                    .map_err(|_| "--tier must be a number".to_string())?;
            }
            "--lang" => {
                args.language = value()?
                    .parse()
                    .map_err(|e: OrchestratorError| e.to_string())?;
            }
            "--style" => {
                args.style = value()?
                    .parse()
                    .map_err(|e: OrchestratorError| e.to_string())?;
            }
            "--store-dir" => args.store_dir = Some(PathBuf::from(value()?)),
            "--offline" => args.offline = true,
            "-h" | "--help" => return Err(usage().to_string()),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None => OrchestratorConfig::default(),
    };

    // LOG_FORMAT overrides the config file
    let _ = match std::env::var("LOG_FORMAT") {
        Ok(_) => init_tracing(),
        Err(_) => init_tracing_with(config.observability.log_format),
    };

    if config.observability.metrics_enabled {
        metrics::init_metrics()?;
    }

    let options = GenerationOptions::new(
        args.panels,
        AgeTier::try_from(args.tier)?,
        args.style,
        args.language,
    )?;

    let mut builder = OrchestratorBuilder::new(config);
    if args.offline {
        builder = builder.generator(Arc::new(TemplateGenerator::new()));
    }
    if let Some(dir) = &args.store_dir {
        builder = builder.store(Arc::new(JsonFileStore::new(dir)));
    }
    let orchestrator = builder.start()?;

    let health = orchestrator.health();
    info!(
        memory_pct = health.memory_pct,
        cpu_pct = health.cpu_pct,
        disk_pct = health.disk_pct,
        available_slots = health.available_slots,
        "initial health"
    );

    let result = orchestrator.submit(args.topic.as_str(), options).await;
    orchestrator.shutdown().await;

    match result {
        Ok(artifact) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            let summary = metrics::get_metrics_summary();
            info!(requests = ?summary.requests_total, attempts = ?summary.upstream_attempts, "done");
            Ok(())
        }
        Err(e) => {
            eprintln!("error [{}]: {}", e.code(), e.user_message());
            if let Some(delay) = e.retry_after() {
                eprintln!("retry in about {}s", delay.as_secs().max(1));
            }
            std::process::exit(1);
        }
    }
}
