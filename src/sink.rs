use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::chunks::DateChunk;
use crate::error::{BackfillError, Result};
use crate::metrics::{MetricFamily, MetricRow};

/// Where one chunk's rows land. `window` is set for families whose natural
/// key includes the queried window.
#[derive(Debug, Clone, Copy)]
pub struct UpsertTarget<'a> {
  pub account_id: &'a str,
  pub scope_id: &'a str,
  pub family: MetricFamily,
  pub window: Option<DateChunk>,
}

impl UpsertTarget<'_> {
  /// Values for `MetricFamily::conflict_key`, excluding the row's own dimensions.
  pub fn key_prefix(&self) -> Vec<String> {
    let mut prefix = vec![self.account_id.to_string(), self.scope_id.to_string()];
    if let Some(window) = self.window {
      prefix.push(window.start.to_string());
      prefix.push(window.end.to_string());
    }
    prefix
  }

  pub fn validate(&self) -> Result<()> {
    if self.family.windowed() != self.window.is_some() {
      return Err(BackfillError::Storage(format!(
        "{} rows {} a window",
        self.family,
        if self.family.windowed() { "require" } else { "must not carry" }
      )));
    }
    Ok(())
  }
}

#[async_trait]
pub trait UpsertSink: Send + Sync {
  /// Insert-or-update keyed by the family's natural key. Returns rows written.
  /// All-or-nothing per call.
  async fn upsert(&self, target: &UpsertTarget<'_>, rows: &[MetricRow]) -> Result<u64>;
}

type StoredKey = (&'static str, Vec<String>);

/// In-memory sink keyed like the SQL tables. Used for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
  rows: Mutex<BTreeMap<StoredKey, Vec<(String, Option<f64>)>>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.rows.lock().unwrap_or_else(|p| p.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn snapshot(&self) -> BTreeMap<StoredKey, Vec<(String, Option<f64>)>> {
    self.rows.lock().unwrap_or_else(|p| p.into_inner()).clone()
  }

  pub fn rows_in(&self, family: MetricFamily) -> usize {
    let guard = self.rows.lock().unwrap_or_else(|p| p.into_inner());
    guard.keys().filter(|(table, _)| *table == family.table()).count()
  }
}

#[async_trait]
impl UpsertSink for MemorySink {
  async fn upsert(&self, target: &UpsertTarget<'_>, rows: &[MetricRow]) -> Result<u64> {
    target.validate()?;
    let prefix = target.key_prefix();

    let mut staged = Vec::with_capacity(rows.len());
    for row in rows {
      if row.dimensions.len() != target.family.spec().dimensions.len() {
        return Err(BackfillError::Storage(format!(
          "row key has {} columns, {} expects {}",
          row.dimensions.len(),
          target.family.table(),
          target.family.spec().dimensions.len()
        )));
      }
      let mut key = prefix.clone();
      key.extend(row.key_values());
      staged.push(((target.family.table(), key), row.measures.clone()));
    }

    let mut guard = self.rows.lock().unwrap_or_else(|p| p.into_inner());
    for (key, measures) in staged {
      guard.insert(key, measures);
    }
    Ok(rows.len() as u64)
  }
}
