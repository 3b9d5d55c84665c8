use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::providers::youtube_analytics::ReportTable;

/// Query shape for one reporting call. Column order in the response follows
/// `dimensions` then `metrics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
  pub metrics: &'static [&'static str],
  pub dimensions: &'static [&'static str],
  pub sort: Option<&'static str>,
  pub max_results: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
  Revenue,
  Demographics,
  ChannelDaily,
  TrafficSources,
  Geography,
  Devices,
}

impl MetricFamily {
  /// Order used by the comprehensive backfill.
  pub const ALL: [MetricFamily; 6] = [
    MetricFamily::ChannelDaily,
    MetricFamily::Revenue,
    MetricFamily::Demographics,
    MetricFamily::TrafficSources,
    MetricFamily::Geography,
    MetricFamily::Devices,
  ];

  pub fn name(self) -> &'static str {
    match self {
      MetricFamily::Revenue => "revenue",
      MetricFamily::Demographics => "demographics",
      MetricFamily::ChannelDaily => "channel_daily",
      MetricFamily::TrafficSources => "traffic_sources",
      MetricFamily::Geography => "geography",
      MetricFamily::Devices => "devices",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
    MetricFamily::ALL.into_iter().find(|f| f.name() == normalized)
  }

  pub fn spec(self) -> MetricSpec {
    match self {
      MetricFamily::Revenue => MetricSpec {
        metrics: &[
          "estimatedRevenue",
          "estimatedAdRevenue",
          "grossRevenue",
          "cpm",
          "playbackBasedCpm",
          "monetizedPlaybacks",
          "adImpressions",
        ],
        dimensions: &["day"],
        sort: Some("day"),
        max_results: None,
      },
      MetricFamily::Demographics => MetricSpec {
        metrics: &["viewerPercentage"],
        dimensions: &["ageGroup", "gender"],
        sort: Some("gender,ageGroup"),
        max_results: None,
      },
      MetricFamily::ChannelDaily => MetricSpec {
        metrics: &[
          "views",
          "estimatedMinutesWatched",
          "averageViewDuration",
          "subscribersGained",
          "subscribersLost",
          "likes",
          "comments",
          "shares",
        ],
        dimensions: &["day"],
        sort: Some("day"),
        max_results: None,
      },
      MetricFamily::TrafficSources => MetricSpec {
        metrics: &["views", "estimatedMinutesWatched"],
        dimensions: &["day", "insightTrafficSourceType"],
        sort: Some("day"),
        max_results: None,
      },
      MetricFamily::Geography => MetricSpec {
        metrics: &["views", "estimatedMinutesWatched", "averageViewDuration", "subscribersGained"],
        dimensions: &["country"],
        sort: Some("-views"),
        max_results: Some(250),
      },
      MetricFamily::Devices => MetricSpec {
        metrics: &["views", "estimatedMinutesWatched"],
        dimensions: &["deviceType"],
        sort: Some("-views"),
        max_results: None,
      },
    }
  }

  /// Upper bound on a single query's date span, in calendar months.
  pub fn max_span_months(self) -> u32 {
    match self {
      MetricFamily::Revenue | MetricFamily::TrafficSources => 1,
      _ => 3,
    }
  }

  pub fn table(self) -> &'static str {
    match self {
      MetricFamily::Revenue => "yt_revenue_daily",
      MetricFamily::Demographics => "yt_demographics",
      MetricFamily::ChannelDaily => "yt_channel_daily",
      MetricFamily::TrafficSources => "yt_traffic_sources_daily",
      MetricFamily::Geography => "yt_geography",
      MetricFamily::Devices => "yt_devices",
    }
  }

  /// Families without a `day` dimension are aggregates over the queried
  /// window, so the window itself is part of their natural key.
  pub fn windowed(self) -> bool {
    !self.spec().dimensions.contains(&"day")
  }

  /// Natural key columns, in table order.
  pub fn conflict_key(self) -> Vec<String> {
    let mut key = vec!["account_id".to_string(), "scope_id".to_string()];
    if self.windowed() {
      key.push("window_start".to_string());
      key.push("window_end".to_string());
    }
    key.extend(self.spec().dimensions.iter().map(|d| column_name(d)));
    key
  }
}

impl std::fmt::Display for MetricFamily {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// `estimatedMinutesWatched` -> `estimated_minutes_watched`.
pub fn column_name(api_name: &str) -> String {
  let mut out = String::with_capacity(api_name.len() + 4);
  for (i, ch) in api_name.chars().enumerate() {
    if ch.is_ascii_uppercase() {
      if i > 0 {
        out.push('_');
      }
      out.push(ch.to_ascii_lowercase());
    } else {
      out.push(ch);
    }
  }
  out
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
  /// Dimension values in `MetricSpec::dimensions` order.
  pub dimensions: Vec<(String, String)>,
  /// Measures in `MetricSpec::metrics` order; `None` when the API omitted the column.
  pub measures: Vec<(String, Option<f64>)>,
}

impl MetricRow {
  pub fn key_values(&self) -> Vec<String> {
    self.dimensions.iter().map(|(_, v)| v.clone()).collect()
  }

  pub fn measure(&self, name: &str) -> Option<f64> {
    self
      .measures
      .iter()
      .find(|(n, _)| n == name)
      .and_then(|(_, v)| *v)
  }
}

fn dimension_value(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn measure_value(value: &Value) -> Option<f64> {
  value.as_f64().or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Maps a report table onto the family's rows by header name. A table without
/// headers is read positionally in request order (dimensions, then metrics).
/// Rows with a missing or malformed key dimension are dropped.
pub fn rows_from_report(family: MetricFamily, table: &ReportTable) -> Vec<MetricRow> {
  let spec = family.spec();

  let (dim_idx, metric_idx): (Vec<usize>, Vec<Option<usize>>) = if table.columns.is_empty() {
    let n = spec.dimensions.len();
    ((0..n).collect(), (0..spec.metrics.len()).map(|i| Some(n + i)).collect())
  } else {
    let dim_idx: Option<Vec<usize>> = spec.dimensions.iter().map(|d| table.column_index(d)).collect();
    let Some(dim_idx) = dim_idx else {
      if !table.rows.is_empty() {
        warn!(%family, columns = ?table.columns, dropped = table.rows.len(), "report is missing key dimension columns");
      }
      return vec![];
    };
    (dim_idx, spec.metrics.iter().map(|m| table.column_index(m)).collect())
  };

  let mut out = Vec::with_capacity(table.rows.len());
  'rows: for row in table.rows.iter() {
    let mut dimensions = Vec::with_capacity(dim_idx.len());
    for (name, idx) in spec.dimensions.iter().zip(dim_idx.iter()) {
      let Some(value) = row.get(*idx).and_then(dimension_value) else {
        continue 'rows;
      };
      if *name == "day" && NaiveDate::parse_from_str(&value, "%Y-%m-%d").is_err() {
        continue 'rows;
      }
      dimensions.push((column_name(name), value));
    }

    let measures = spec
      .metrics
      .iter()
      .zip(metric_idx.iter())
      .map(|(name, idx)| {
        let value = idx.and_then(|i| row.get(i)).and_then(measure_value);
        (column_name(name), value)
      })
      .collect();

    out.push(MetricRow { dimensions, measures });
  }

  let dropped = table.rows.len() - out.len();
  if dropped > 0 {
    warn!(%family, dropped, kept = out.len(), "dropped report rows with malformed key dimensions");
  }
  out
}
