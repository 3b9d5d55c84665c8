use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::chunks::{plan_chunks, DateChunk};
use crate::config::BackfillConfig;
use crate::credentials::TokenRefresher;
use crate::error::{BackfillError, Result};
use crate::metrics::{rows_from_report, MetricFamily};
use crate::providers::youtube_analytics::ReportSource;
use crate::sink::{UpsertSink, UpsertTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FamilyStatus {
  Pending,
  InProgress,
  Done,
  Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
  pub chunk: DateChunk,
  pub rows_upserted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
  pub chunk: DateChunk,
  pub kind: &'static str,
  pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyReport {
  pub family: MetricFamily,
  pub status: FamilyStatus,
  pub total_inserted: u64,
  pub chunks_processed: usize,
  pub completed: Vec<ChunkOutcome>,
  pub failed_chunks: Vec<ChunkFailure>,
}

impl FamilyReport {
  fn pending(family: MetricFamily) -> Self {
    Self {
      family,
      status: FamilyStatus::Pending,
      total_inserted: 0,
      chunks_processed: 0,
      completed: Vec::new(),
      failed_chunks: Vec::new(),
    }
  }

  fn finish(&mut self, results: Vec<std::result::Result<ChunkOutcome, ChunkFailure>>) {
    self.chunks_processed = results.len();
    for result in results {
      match result {
        Ok(outcome) => {
          self.total_inserted += outcome.rows_upserted;
          self.completed.push(outcome);
        }
        Err(failure) => self.failed_chunks.push(failure),
      }
    }
    self.status = if self.failed_chunks.is_empty() {
      FamilyStatus::Done
    } else {
      FamilyStatus::Partial
    };
  }

  pub fn success(&self) -> bool {
    self.status == FamilyStatus::Done
  }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveReport {
  pub families: Vec<FamilyReport>,
}

impl ComprehensiveReport {
  pub fn total_inserted(&self) -> u64 {
    self.families.iter().map(|f| f.total_inserted).sum()
  }

  pub fn chunks_processed(&self) -> usize {
    self.families.iter().map(|f| f.chunks_processed).sum()
  }

  pub fn failed_chunks(&self) -> usize {
    self.families.iter().map(|f| f.failed_chunks.len()).sum()
  }

  pub fn success(&self) -> bool {
    self.families.iter().all(FamilyReport::success)
  }

  /// Caller-facing summary: `{success, totalInserted, chunksProcessed, failedChunks, families}`.
  pub fn summary(&self) -> Value {
    let failed_chunks: Vec<Value> = self
      .families
      .iter()
      .flat_map(|f| {
        f.failed_chunks.iter().map(move |c| {
          json!({
            "family": f.family,
            "start": c.chunk.start.to_string(),
            "end": c.chunk.end.to_string(),
            "kind": c.kind,
            "error": c.error,
          })
        })
      })
      .collect();

    let families: Vec<Value> = self
      .families
      .iter()
      .map(|f| {
        json!({
          "family": f.family,
          "status": f.status,
          "totalInserted": f.total_inserted,
          "chunksProcessed": f.chunks_processed,
          "failedChunks": f.failed_chunks.len(),
        })
      })
      .collect();

    json!({
      "success": self.success(),
      "totalInserted": self.total_inserted(),
      "chunksProcessed": self.chunks_processed(),
      "failedChunks": failed_chunks,
      "families": families,
    })
  }
}

/// A fatal error that stopped a multi-family run, with whatever finished before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunAborted {
  pub error: BackfillError,
  pub partial: ComprehensiveReport,
}

impl From<BackfillError> for RunAborted {
  fn from(error: BackfillError) -> Self {
    Self {
      error,
      partial: ComprehensiveReport::default(),
    }
  }
}

pub struct BackfillOrchestrator<'a> {
  refresher: TokenRefresher<'a>,
  source: &'a dyn ReportSource,
  sink: &'a dyn UpsertSink,
  cfg: &'a BackfillConfig,
}

impl<'a> BackfillOrchestrator<'a> {
  pub fn new(
    refresher: TokenRefresher<'a>,
    source: &'a dyn ReportSource,
    sink: &'a dyn UpsertSink,
    cfg: &'a BackfillConfig,
  ) -> Self {
    Self {
      refresher,
      source,
      sink,
      cfg,
    }
  }

  /// Backfills one family across `[from_dt, to_dt]`. Only fatal errors
  /// (auth, invalid range) come back as `Err`; chunk failures land in the report.
  pub async fn run_family(
    &self,
    account_id: &str,
    family: MetricFamily,
    from_dt: NaiveDate,
    to_dt: NaiveDate,
  ) -> Result<FamilyReport> {
    let chunks = plan_chunks(from_dt, to_dt, family.max_span_months())?;
    let mut report = FamilyReport::pending(family);

    report.status = FamilyStatus::InProgress;
    info!(account_id, %family, chunks = chunks.len(), %from_dt, %to_dt, "backfill family started");

    let mut results = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.into_iter().enumerate() {
      if idx > 0 {
        tokio::time::sleep(self.cfg.call_delay).await;
      }

      match self.process_chunk(account_id, family, chunk).await {
        Ok(outcome) => results.push(Ok(outcome)),
        Err(err) if err.is_fatal() => {
          error!(account_id, %family, %chunk, error = %err, "backfill aborted");
          return Err(err);
        }
        Err(err) => {
          warn!(account_id, %family, %chunk, error = %err, "chunk failed; continuing");
          results.push(Err(ChunkFailure {
            chunk,
            kind: err.kind(),
            error: err.to_string(),
          }));
        }
      }
    }

    report.finish(results);
    info!(
      account_id,
      %family,
      status = ?report.status,
      total_inserted = report.total_inserted,
      failed = report.failed_chunks.len(),
      "backfill family finished"
    );
    Ok(report)
  }

  /// Runs each family in turn. A family with failed chunks never blocks the
  /// next one; an auth failure ends the whole run, carrying the families that
  /// already finished.
  pub async fn run_families(
    &self,
    account_id: &str,
    families: &[MetricFamily],
    from_dt: NaiveDate,
    to_dt: NaiveDate,
  ) -> std::result::Result<ComprehensiveReport, RunAborted> {
    let mut report = ComprehensiveReport::default();
    if from_dt > to_dt {
      return Err(RunAborted {
        error: BackfillError::InvalidRange { from: from_dt, to: to_dt },
        partial: report,
      });
    }

    for (idx, family) in families.iter().copied().enumerate() {
      if idx > 0 {
        tokio::time::sleep(self.cfg.family_delay).await;
      }
      match self.run_family(account_id, family, from_dt, to_dt).await {
        Ok(family_report) => report.families.push(family_report),
        Err(error) => {
          return Err(RunAborted {
            error,
            partial: report,
          })
        }
      }
    }

    Ok(report)
  }

  pub async fn run_comprehensive(
    &self,
    account_id: &str,
    from_dt: NaiveDate,
    to_dt: NaiveDate,
  ) -> std::result::Result<ComprehensiveReport, RunAborted> {
    self.run_families(account_id, &MetricFamily::ALL, from_dt, to_dt).await
  }

  async fn process_chunk(&self, account_id: &str, family: MetricFamily, chunk: DateChunk) -> Result<ChunkOutcome> {
    let spec = family.spec();
    let mut token = self.refresher.get_valid_token(account_id).await?;

    let table = match self.source.fetch(&token.access_token, &token.scope_id, chunk, &spec).await {
      Ok(table) => table,
      Err(err) if err.is_unauthorized() => {
        warn!(account_id, %family, %chunk, "access token rejected; forcing refresh");
        token = self.refresher.force_refresh(account_id).await?;
        tokio::time::sleep(self.cfg.call_delay).await;
        self.source.fetch(&token.access_token, &token.scope_id, chunk, &spec).await?
      }
      Err(err) => return Err(err),
    };

    let rows = rows_from_report(family, &table);
    if rows.is_empty() && !table.rows.is_empty() {
      return Err(BackfillError::Api {
        status: Some(200),
        body: format!("unmappable report: none of {} rows matched {}", table.rows.len(), family),
      });
    }
    let target = UpsertTarget {
      account_id,
      scope_id: &token.scope_id,
      family,
      window: family.windowed().then_some(chunk),
    };
    let rows_upserted = self.sink.upsert(&target, &rows).await?;

    Ok(ChunkOutcome { chunk, rows_upserted })
  }
}
