use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySql, MySqlPool, QueryBuilder};
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::database_url;
use crate::credentials::{Credential, TokenStore};
use crate::error::{BackfillError, Result};
use crate::metrics::{column_name, MetricFamily, MetricRow};
use crate::sink::{UpsertSink, UpsertTarget};

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

// Stays well under MySQL's 65535 placeholder limit for the widest family.
const UPSERT_BATCH_ROWS: usize = 500;

fn create_table_sql(family: MetricFamily) -> String {
  let spec = family.spec();
  let mut columns = vec![
    "account_id VARCHAR(128) NOT NULL".to_string(),
    "scope_id VARCHAR(128) NOT NULL".to_string(),
  ];
  if family.windowed() {
    columns.push("window_start DATE NOT NULL".to_string());
    columns.push("window_end DATE NOT NULL".to_string());
  }
  for dim in spec.dimensions {
    let ty = if *dim == "day" { "DATE" } else { "VARCHAR(64)" };
    columns.push(format!("{} {ty} NOT NULL", column_name(dim)));
  }
  for metric in spec.metrics {
    columns.push(format!("{} DOUBLE NULL", column_name(metric)));
  }
  columns.push(
    "updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)".to_string(),
  );
  columns.push(format!("PRIMARY KEY ({})", family.conflict_key().join(", ")));

  format!(
    "CREATE TABLE IF NOT EXISTS {} (\n        {}\n      );",
    family.table(),
    columns.join(",\n        ")
  )
}

async fn ensure_schema(pool: &MySqlPool) -> Result<()> {
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS channel_connections (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        account_id VARCHAR(128) NOT NULL,
        oauth_provider VARCHAR(32) NOT NULL,
        channel_id VARCHAR(128) NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NULL,
        expires_at TIMESTAMP(3) NULL,
        version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_channel_connections_provider (account_id, oauth_provider)
      );
    "#,
  )
  .execute(pool)
  .await?;

  for family in MetricFamily::ALL {
    sqlx::query(&create_table_sql(family)).execute(pool).await?;
  }

  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool> {
  POOL
    .get_or_try_init(|| async {
      let url = database_url()?;

      let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

      ensure_schema(&pool).await?;
      info!("database pool ready");
      Ok::<_, BackfillError>(pool)
    })
    .await
}

pub struct MySqlTokenStore {
  pool: MySqlPool,
}

impl MySqlTokenStore {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl TokenStore for MySqlTokenStore {
  async fn load(&self, account_id: &str) -> Result<Option<Credential>> {
    let row = sqlx::query_as::<_, (Option<String>, String, Option<String>, Option<DateTime<Utc>>, i64)>(
      r#"
        SELECT channel_id, access_token, refresh_token, expires_at, version
        FROM channel_connections
        WHERE account_id = ? AND oauth_provider = 'youtube'
        LIMIT 1;
      "#,
    )
    .bind(account_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(|(channel_id, access_token, refresh_token, expires_at, version)| Credential {
      account_id: account_id.to_string(),
      scope_id: channel_id.unwrap_or_default(),
      access_token,
      refresh_token,
      expires_at,
      version,
    }))
  }

  async fn store_refreshed(&self, updated: &Credential, expected_version: i64) -> Result<bool> {
    let result = sqlx::query(
      r#"
        UPDATE channel_connections
        SET access_token = ?,
            refresh_token = COALESCE(?, refresh_token),
            expires_at = ?,
            version = ?,
            updated_at = CURRENT_TIMESTAMP(3)
        WHERE account_id = ?
          AND oauth_provider = 'youtube'
          AND version = ?;
      "#,
    )
    .bind(&updated.access_token)
    .bind(updated.refresh_token.as_deref())
    .bind(updated.expires_at)
    .bind(updated.version)
    .bind(&updated.account_id)
    .bind(expected_version)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn save(&self, credential: &Credential) -> Result<()> {
    sqlx::query(
      r#"
        INSERT INTO channel_connections
          (account_id, oauth_provider, channel_id, access_token, refresh_token, expires_at, version)
        VALUES
          (?, 'youtube', ?, ?, ?, ?, 1)
        ON DUPLICATE KEY UPDATE
          channel_id = VALUES(channel_id),
          access_token = VALUES(access_token),
          refresh_token = COALESCE(VALUES(refresh_token), refresh_token),
          expires_at = VALUES(expires_at),
          version = version + 1,
          updated_at = CURRENT_TIMESTAMP(3);
      "#,
    )
    .bind(&credential.account_id)
    .bind(&credential.scope_id)
    .bind(&credential.access_token)
    .bind(credential.refresh_token.as_deref())
    .bind(credential.expires_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}

fn build_upsert_query<'a>(target: &UpsertTarget<'_>, rows: &'a [MetricRow]) -> QueryBuilder<'a, MySql> {
  let spec = target.family.spec();
  let mut columns = target.family.conflict_key();
  let measure_columns: Vec<String> = spec.metrics.iter().map(|m| column_name(m)).collect();
  columns.extend(measure_columns.iter().cloned());

  let mut qb = QueryBuilder::<MySql>::new(format!(
    "INSERT INTO {} ({}) ",
    target.family.table(),
    columns.join(", ")
  ));

  let account_id = target.account_id.to_string();
  let scope_id = target.scope_id.to_string();
  let window = target.window;
  qb.push_values(rows, |mut b, row| {
    b.push_bind(account_id.clone()).push_bind(scope_id.clone());
    if let Some(window) = window {
      b.push_bind(window.start).push_bind(window.end);
    }
    for (_, value) in row.dimensions.iter() {
      b.push_bind(value.as_str());
    }
    for name in measure_columns.iter() {
      let value = row.measures.iter().find(|(n, _)| n == name).and_then(|(_, v)| *v);
      b.push_bind(value);
    }
  });

  let updates = measure_columns
    .iter()
    .map(|c| format!("{c} = VALUES({c})"))
    .chain(std::iter::once("updated_at = CURRENT_TIMESTAMP(3)".to_string()))
    .collect::<Vec<_>>()
    .join(", ");
  qb.push(format!(" ON DUPLICATE KEY UPDATE {updates}"));
  qb
}

pub struct MySqlMetricSink {
  pool: MySqlPool,
}

impl MySqlMetricSink {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl UpsertSink for MySqlMetricSink {
  async fn upsert(&self, target: &UpsertTarget<'_>, rows: &[MetricRow]) -> Result<u64> {
    target.validate()?;
    if rows.is_empty() {
      return Ok(0);
    }

    // One transaction per chunk: a bad row rolls back this chunk only.
    let mut tx = self.pool.begin().await?;
    for batch in rows.chunks(UPSERT_BATCH_ROWS) {
      build_upsert_query(target, batch).build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(rows.len() as u64)
  }
}
