pub mod backfill;
pub mod chunks;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod metrics;
pub mod sink;
pub mod telemetry;

pub mod providers {
  pub mod youtube;
  pub mod youtube_analytics;
  pub mod youtube_api;
}
