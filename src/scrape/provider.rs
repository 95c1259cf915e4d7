use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::budget::Usd;
use crate::snapshot::{Follow, Post, Profile};
use crate::ScrapeCategory;

/// What a provider run is allowed to fetch, as decided by the budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeParams {
    pub username: String,
    pub categories: Vec<ScrapeCategory>,
    pub timeline_count: Option<u64>,
    pub timeline_budget: Usd,
    pub social_max_items: Option<u64>,
    pub social_budget: Usd,
}

impl ScrapeParams {
    pub fn wants(&self, category: ScrapeCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Upper bound of items the run can return, used to scale progress.
    pub fn requested_items(&self) -> u64 {
        self.timeline_count.unwrap_or(0) + self.social_max_items.unwrap_or(0)
    }
}

/// Latest totals of a provider run. Every update carries the full current
/// state, not a delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderUpdate {
    pub phase: String,
    pub counts: BTreeMap<String, u64>,
    pub accrued_cost: Usd,
    pub run_ids: BTreeMap<String, String>,
}

impl ProviderUpdate {
    pub fn items(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// The upstream run ended without finishing; what it returned is kept.
    Failed(String),
    /// Stopped because the cancellation token fired.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutput {
    pub profile: Option<Profile>,
    pub posts: Vec<Post>,
    pub replies: Vec<Post>,
    pub followers: Vec<Follow>,
    pub following: Vec<Follow>,
    pub run_ids: BTreeMap<String, String>,
    pub cost: Usd,
    pub outcome: RunOutcome,
}

impl ScrapeOutput {
    pub fn empty(outcome: RunOutcome) -> Self {
        ScrapeOutput {
            profile: None,
            posts: vec![],
            replies: vec![],
            followers: vec![],
            following: vec![],
            run_ids: BTreeMap::new(),
            cost: Usd::ZERO,
            outcome,
        }
    }

    pub fn item_count(&self) -> u64 {
        (self.posts.len() + self.replies.len() + self.followers.len() + self.following.len()) as u64
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("posts".to_string(), self.posts.len() as u64),
            ("replies".to_string(), self.replies.len() as u64),
            ("followers".to_string(), self.followers.len() as u64),
            ("following".to_string(), self.following.len() as u64),
        ])
    }
}

/// A paid, metered scraping backend.
///
/// Implementations send [`ProviderUpdate`]s while the run is in flight and
/// must stop the upstream run once `cancel` fires, returning whatever was
/// fetched with [`RunOutcome::Aborted`].
#[async_trait]
pub trait ScrapeProvider: Send + Sync {
    async fn run_scrape(
        &self,
        params: &ScrapeParams,
        updates: UnboundedSender<ProviderUpdate>,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutput>;
}
