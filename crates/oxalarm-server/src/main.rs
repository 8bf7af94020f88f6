use anyhow::{Context, Result};
use chrono::Utc;
use oxalarm_core::dispatch::ChannelSink;
use oxalarm_core::{AlarmRouter, RuleBook};
use oxalarm_server::config::ServerConfig;
use oxalarm_server::rule_builder::FileRuleSource;
use oxalarm_server::{ingest, sinks};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxalarm-server [config.toml] [samples.jsonl|-]   Evaluate samples (stdin when omitted or '-')");
    eprintln!("  oxalarm-server check-rules <rules.toml>         Validate a rule file and exit");
}

#[cfg(unix)]
struct Hangup(signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        let sig = signal::unix::signal(signal::unix::SignalKind::hangup())
            .context("failed to install SIGHUP handler")?;
        Ok(Self(sig))
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oxalarm=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("check-rules") => {
            let path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check-rules requires a <rules.toml> argument")
            })?;
            run_check_rules(path)
        }
        Some("-h" | "--help") => {
            print_usage();
            Ok(())
        }
        config_path => {
            let config_path = config_path.unwrap_or("config/server.toml").to_string();
            run_server(&config_path, args.get(2).cloned()).await
        }
    }
}

fn run_check_rules(path: &str) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read rules {path}"))?;
    let set = oxalarm_server::rule_builder::parse_rules(&content)?;
    tracing::info!(path, strategies = set.len(), "Rule file is valid");
    Ok(())
}

async fn run_server(config_path: &str, input: Option<String>) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    oxalarm_common::id::init(config.machine_id, config.node_id);
    tracing::info!(
        config = config_path,
        rules = %config.rules_path,
        shards = config.shards,
        "oxalarm-server starting"
    );

    let source = Arc::new(FileRuleSource::new(&config.rules_path));
    let rules = Arc::new(RuleBook::new(source).context("failed to load initial rule set")?);

    let (sink, rx) = ChannelSink::new();
    let writer = sinks::spawn_event_writer(rx, config.events_path.as_ref().map(PathBuf::from));
    let router = Arc::new(AlarmRouter::start(
        config.router_config(),
        rules,
        Arc::new(sink),
    ));

    let mut ingest_task = {
        let router = router.clone();
        tokio::spawn(async move {
            match input.as_deref() {
                None | Some("-") => {
                    ingest::pump(BufReader::new(tokio::io::stdin()), &router).await
                }
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open samples {path}"))?;
                    ingest::pump(BufReader::new(file), &router).await
                }
            }
        })
    };

    let sweep_enabled = config.sweep_interval_secs > 0;
    let mut sweep_tick = interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut hangup = Hangup::new()?;

    loop {
        tokio::select! {
            _ = sweep_tick.tick(), if sweep_enabled => {
                if let Err(e) = router.sweep(Utc::now()) {
                    tracing::warn!(error = %e, "NO_DATA sweep skipped");
                }
            }
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading rules");
                router.reload();
            }
            result = &mut ingest_task => {
                match result {
                    Ok(Ok(summary)) => tracing::info!(submitted = summary.submitted, "Input exhausted"),
                    Ok(Err(e)) => tracing::error!(error = %e, "Ingestion failed"),
                    Err(e) => tracing::error!(error = %e, "Ingestion task panicked"),
                }
                if let Err(e) = router.flush().await {
                    tracing::warn!(error = %e, "Final flush failed");
                }
                break;
            }
            _ = signal::ctrl_c() => {
                tracing::info!("Shutting down gracefully");
                ingest_task.abort();
                break;
            }
        }
    }

    router.shutdown().await;
    let stats = router.stats();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "Final counters");
    drop(router);

    match writer.await {
        Ok(Ok(delivered)) => tracing::info!(delivered, "Event writer drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "Event writer failed"),
        Err(e) => tracing::error!(error = %e, "Event writer task panicked"),
    }
    Ok(())
}
