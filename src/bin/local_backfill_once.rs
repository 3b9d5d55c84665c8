use chrono::NaiveDate;
use tracing::info;
use vercel_runtime::Error;

use yt_backfill_rust::backfill::{BackfillOrchestrator, ComprehensiveReport, RunAborted};
use yt_backfill_rust::config::{database_url, default_to_date, historical_floor, BackfillConfig, OAuthAppConfig};
use yt_backfill_rust::credentials::TokenRefresher;
use yt_backfill_rust::db::{get_pool, MySqlMetricSink, MySqlTokenStore};
use yt_backfill_rust::error::backfill_error_to_vercel_error;
use yt_backfill_rust::metrics::MetricFamily;
use yt_backfill_rust::providers::youtube::OAuthTokenEndpoint;
use yt_backfill_rust::providers::youtube_analytics::YoutubeAnalyticsClient;
use yt_backfill_rust::sink::{MemorySink, UpsertSink};
use yt_backfill_rust::telemetry::init_tracing;

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
  args.iter().any(|a| a == flag)
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

fn print_usage() {
  eprintln!("Usage: local_backfill_once --account-id ID [--family NAME|comprehensive] [--from YYYY-MM-DD] [--to YYYY-MM-DD] [--dry-run]");
  eprintln!(
    "Families: {}",
    MetricFamily::ALL.iter().map(|f| f.name()).collect::<Vec<_>>().join(", ")
  );
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  database_url().map_err(backfill_error_to_vercel_error)?;
  let args: Vec<String> = std::env::args().collect();

  let account_id = parse_flag_value(&args, "--account-id")
    .or_else(|| parse_flag_value(&args, "--account"))
    .unwrap_or_default();
  if account_id.trim().is_empty() {
    eprintln!("Missing required --account-id");
    print_usage();
    return Ok(());
  }

  let family_arg = parse_flag_value(&args, "--family").unwrap_or_else(|| "comprehensive".to_string());
  let families: Vec<MetricFamily> = if family_arg.trim() == "comprehensive" {
    MetricFamily::ALL.to_vec()
  } else {
    match MetricFamily::parse(&family_arg) {
      Some(family) => vec![family],
      None => {
        eprintln!("Unknown --family {family_arg:?}");
        print_usage();
        return Ok(());
      }
    }
  };

  let from_dt = match parse_flag_value(&args, "--from") {
    Some(raw) => parse_dt(&raw).ok_or_else(|| -> Error { format!("invalid --from {raw:?}").into() })?,
    None => historical_floor(),
  };
  let to_dt = match parse_flag_value(&args, "--to") {
    Some(raw) => parse_dt(&raw).ok_or_else(|| -> Error { format!("invalid --to {raw:?}").into() })?,
    None => default_to_date(),
  };
  let dry_run = has_flag(&args, "--dry-run");

  let cfg = BackfillConfig::from_env().map_err(backfill_error_to_vercel_error)?;
  let oauth = OAuthAppConfig::from_env().map_err(backfill_error_to_vercel_error)?;
  let pool = get_pool().await.map_err(backfill_error_to_vercel_error)?;

  let store = MySqlTokenStore::new(pool.clone());
  let endpoint = OAuthTokenEndpoint::new(&oauth, cfg.http_timeout).map_err(backfill_error_to_vercel_error)?;
  let source = YoutubeAnalyticsClient::new(cfg.analytics_base_url.clone(), cfg.http_timeout);

  let memory_sink = MemorySink::new();
  let mysql_sink = MySqlMetricSink::new(pool.clone());
  let sink: &dyn UpsertSink = if dry_run { &memory_sink } else { &mysql_sink };

  info!(
    account_id = %account_id,
    families = families.len(),
    %from_dt,
    %to_dt,
    dry_run,
    "local backfill starting"
  );

  let orchestrator = BackfillOrchestrator::new(
    TokenRefresher::new(&store, &endpoint, cfg.token_margin),
    &source,
    sink,
    &cfg,
  );

  let result: Result<ComprehensiveReport, RunAborted> =
    orchestrator.run_families(account_id.trim(), &families, from_dt, to_dt).await;

  match result {
    Ok(report) => {
      let mut summary = report.summary();
      summary["dry_run"] = serde_json::Value::Bool(dry_run);
      if dry_run {
        summary["rows_buffered"] = serde_json::json!(memory_sink.len());
      }
      println!("{}", serde_json::to_string_pretty(&summary)?);
      Ok(())
    }
    Err(aborted) => {
      eprintln!("backfill aborted ({}): {}", aborted.error.kind(), aborted.error);
      if !aborted.partial.families.is_empty() {
        println!("{}", serde_json::to_string_pretty(&aborted.partial.summary())?);
      }
      Err(backfill_error_to_vercel_error(aborted.error))
    }
  }
}
