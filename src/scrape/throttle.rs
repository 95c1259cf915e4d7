//! Decides which live provider metrics are worth persisting.
//!
//! An update is written when the phase changes, a new upstream run id shows
//! up, a category counter moved by more than `counter_step`, the accrued
//! cost moved by more than `cost_step`, or nothing was written for
//! `max_silence`. No two writes are closer than `min_spacing`.

use std::time::Instant;

use super::provider::ProviderUpdate;
use crate::config::ThrottleConfig;

pub struct MetricsThrottle {
    config: ThrottleConfig,
    persisted: Option<(ProviderUpdate, Instant)>,
}

impl MetricsThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        MetricsThrottle {
            config,
            persisted: None,
        }
    }

    /// Returns true when `update` should be written, and records it as the
    /// last persisted state if so.
    pub fn admit(&mut self, update: &ProviderUpdate, now: Instant) -> bool {
        let Some((last, written_at)) = &self.persisted else {
            self.persisted = Some((update.clone(), now));
            return true;
        };
        let since = now.saturating_duration_since(*written_at);
        if since < self.config.min_spacing {
            return false;
        }
        let due = update.phase != last.phase
            || update.run_ids.keys().any(|id| !last.run_ids.contains_key(id))
            || counter_moved(last, update, self.config.counter_step)
            || update.accrued_cost.abs_diff(last.accrued_cost) > self.config.cost_step
            || since >= self.config.max_silence;
        if due {
            self.persisted = Some((update.clone(), now));
        }
        due
    }
}

fn counter_moved(last: &ProviderUpdate, update: &ProviderUpdate, step: u64) -> bool {
    update.counts.iter().any(|(category, count)| {
        let before = last.counts.get(category).copied().unwrap_or(0);
        count.abs_diff(before) > step
    })
}
