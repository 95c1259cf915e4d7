use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scrape::budget::Usd;

const MIB: u64 = 1024 * 1024;

/// Settings shared by every job a worker runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub limits: IngestLimits,
    pub budget: BudgetConfig,
    pub throttle: ThrottleConfig,
    /// How often the scrape orchestrator polls for a cancellation request
    /// while the provider call is in flight.
    pub cancel_poll_interval: Duration,
    /// How often the server looks for queued jobs.
    pub poll_interval: Duration,
    /// Prefix under which re-hosted media is served.
    pub media_url_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            limits: IngestLimits::default(),
            budget: BudgetConfig::default(),
            throttle: ThrottleConfig::default(),
            cancel_poll_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            media_url_prefix: "/media".into(),
        }
    }
}

/// Resource ceilings for archive ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestLimits {
    pub max_archive_entries: usize,
    pub max_metadata_file_bytes: u64,
    /// Counts every media record of an artifact, including the record for
    /// the original archive itself.
    pub max_media_files: usize,
    pub max_media_entry_bytes: u64,
    pub max_total_media_bytes: u64,
}

impl Default for IngestLimits {
    fn default() -> Self {
        IngestLimits {
            max_archive_entries: 100_000,
            max_metadata_file_bytes: 256 * MIB,
            max_media_files: 20_000,
            max_media_entry_bytes: 512 * MIB,
            max_total_media_bytes: 8 * 1024 * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_cap: Usd,
    pub per_run_ceiling: Usd,
    /// Timeline window used when social-graph categories share the run.
    pub included_timeline_items: u64,
    pub timeline_price_per_thousand: Usd,
    pub social_price_per_thousand: Usd,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        BudgetConfig {
            monthly_cap: Usd::from_cents(1_000),
            per_run_ceiling: Usd::from_cents(500),
            included_timeline_items: 100,
            timeline_price_per_thousand: Usd::from_cents(40),
            social_price_per_thousand: Usd::from_cents(40),
        }
    }
}

/// Thresholds for persisting live scrape metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub counter_step: u64,
    pub cost_step: Usd,
    pub max_silence: Duration,
    pub min_spacing: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            counter_step: 10,
            cost_step: Usd::from_cents(1),
            max_silence: Duration::from_secs(15),
            min_spacing: Duration::from_secs(1),
        }
    }
}
