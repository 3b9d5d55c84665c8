use chrono::{Duration, Months, NaiveDate};
use serde::Serialize;

use crate::error::{BackfillError, Result};

/// Inclusive day range `[start, end]`, matching the reporting API's
/// `startDate`/`endDate` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DateChunk {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateChunk {
  pub fn days(&self) -> i64 {
    (self.end - self.start).num_days() + 1
  }
}

impl std::fmt::Display for DateChunk {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}..{}", self.start, self.end)
  }
}

pub fn plan_chunks(from_dt: NaiveDate, to_dt: NaiveDate, max_span_months: u32) -> Result<Vec<DateChunk>> {
  if from_dt > to_dt {
    return Err(BackfillError::InvalidRange { from: from_dt, to: to_dt });
  }
  let span = Months::new(max_span_months.clamp(1, 12));

  let mut out = Vec::new();
  let mut start = from_dt;
  loop {
    // Past chrono's max date the step overflows; the last chunk then runs to `to_dt`.
    let end = match start.checked_add_months(span) {
      Some(next) => (next - Duration::days(1)).min(to_dt),
      None => to_dt,
    };
    out.push(DateChunk { start, end });

    if end >= to_dt {
      break;
    }
    start = end + Duration::days(1);
  }

  Ok(out)
}
