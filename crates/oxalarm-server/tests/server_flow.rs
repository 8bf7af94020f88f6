use anyhow::Result;
use oxalarm_common::types::{AlarmKey, TransitionKind};
use oxalarm_core::dispatch::ChannelSink;
use oxalarm_core::{AlarmRouter, AlarmStatus, RuleBook, RuleSource};
use oxalarm_server::config::ServerConfig;
use oxalarm_server::ingest;
use oxalarm_server::rule_builder::FileRuleSource;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const CPU_RULES: &str = r#"
[[strategies]]
id = "cpu-high"
metric = "cpu.usage"
raise_after = 2

[[strategies.conditions]]
operator = ">"
threshold = 90.0
"#;

const TWO_CPU_RULES: &str = r#"
[[strategies]]
id = "cpu-high"
metric = "cpu.usage"
raise_after = 2

[[strategies.conditions]]
operator = ">"
threshold = 90.0

[[strategies]]
id = "cpu-crit"
metric = "cpu.usage"
severity = "critical"

[[strategies.conditions]]
operator = ">"
threshold = 98.0
"#;

fn write(dir: &Path, name: &str, content: &str) -> Result<String> {
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    Ok(path.to_string_lossy().into_owned())
}

fn sample_line(entity: &str, value: f64, minute: u32) -> String {
    format!(
        r#"{{"entity":"{entity}","metric":"cpu.usage","value":{value},"timestamp":"2024-01-01T10:{minute:02}:00Z","step_secs":60,"labels":{{"dc":"eu-1"}}}}"#
    )
}

#[test]
fn config_defaults_fill_missing_fields() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write(dir.path(), "server.toml", "rules_path = \"rules.toml\"\n")?;

    let config = ServerConfig::load(&path)?;
    assert_eq!(config.rules_path, "rules.toml");
    assert_eq!(config.shards, 4);
    assert_eq!(config.queue_capacity, 1024);
    assert_eq!(config.sweep_interval_secs, 30);
    assert!(config.events_path.is_none());

    let router = config.router_config();
    assert_eq!(router.engine.min_window, 10);
    assert_eq!(router.engine.no_data_factor, 3);
    Ok(())
}

#[test]
fn config_rejects_zero_shards() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write(dir.path(), "server.toml", "rules_path = \"r.toml\"\nshards = 0\n")?;
    let err = ServerConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("shards"));
    Ok(())
}

#[test]
fn config_bounds_window_retention() -> Result<()> {
    let dir = TempDir::new()?;
    for retention in ["0", "31536001"] {
        let path = write(
            dir.path(),
            "server.toml",
            &format!("rules_path = \"r.toml\"\nwindow_retention_secs = {retention}\n"),
        )?;
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("window_retention_secs"), "{retention}: {err:#}");
    }

    let path = write(
        dir.path(),
        "server.toml",
        "rules_path = \"r.toml\"\nwindow_retention_secs = 31536000\n",
    )?;
    assert_eq!(ServerConfig::load(&path)?.window_retention_secs, 31_536_000);
    Ok(())
}

#[test]
fn missing_config_reports_path() {
    let err = ServerConfig::load("/nonexistent/oxalarm.toml").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/oxalarm.toml"));
}

#[test]
fn file_source_picks_up_edits_on_reload() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write(dir.path(), "rules.toml", CPU_RULES)?;
    let book = RuleBook::new(Arc::new(FileRuleSource::new(&path)))?;
    assert_eq!(book.current().len(), 1);

    std::fs::write(&path, TWO_CPU_RULES)?;
    assert_eq!(book.current().len(), 1);
    book.reload();
    assert_eq!(book.current().len(), 2);

    // a broken edit keeps the last good set
    std::fs::write(&path, "[[strategies]]\nid = \"x\"\n")?;
    book.reload();
    assert_eq!(book.current().len(), 2);
    Ok(())
}

#[test]
fn missing_rule_file_is_a_config_error() {
    let source = FileRuleSource::new("/nonexistent/rules.toml");
    let err = source.load().unwrap_err();
    assert!(err.to_string().contains("rule source"));
}

#[tokio::test]
async fn pumped_samples_raise_and_recover() -> Result<()> {
    let dir = TempDir::new()?;
    let rules_path = write(dir.path(), "rules.toml", CPU_RULES)?;
    let book = Arc::new(RuleBook::new(Arc::new(FileRuleSource::new(&rules_path)))?);
    let (sink, mut rx) = ChannelSink::new();
    let router = AlarmRouter::start(
        oxalarm_core::RouterConfig::default(),
        book,
        Arc::new(sink),
    );

    let input = [
        sample_line("web-01", 95.0, 0),
        "# comment".to_string(),
        sample_line("web-01", 96.0, 1),
        "not json".to_string(),
        sample_line("web-01", 20.0, 2),
        String::new(),
    ]
    .join("\n");

    let summary = ingest::pump(input.as_bytes(), &router).await?;
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.malformed, 1);
    router.flush().await?;

    let key = AlarmKey::new("web-01", "cpu.usage", "cpu-high");
    assert_eq!(router.state_of(&key).map(|s| s.status), Some(AlarmStatus::Ok));

    let raised = rx.try_recv()?;
    assert_eq!(raised.kind, TransitionKind::Raised);
    assert_eq!(raised.labels.get("dc").map(String::as_str), Some("eu-1"));
    assert_eq!(rx.try_recv()?.kind, TransitionKind::Recovered);

    router.shutdown().await;
    Ok(())
}
