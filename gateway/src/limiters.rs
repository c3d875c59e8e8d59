use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota};
use metrics::gauge;
use rand::Rng;
use tokio::time::interval;

/// Answers whether a workspace went over its request quota.
#[async_trait]
pub trait RateLimiter {
    async fn limit_reached(&self, workspace_id: &str) -> bool;
}

type KeyedLimiter =
    governor::RateLimiter<String, DefaultKeyedStateStore<String>, clock::DefaultClock>;

const KEY_COUNT_PERIOD: Duration = Duration::from_secs(10);

/// Per-workspace request quota: a GCRA bucket per workspace id, shared by clones.
///
/// Workspaces in the blocklist are limited without consuming quota.
#[derive(Clone)]
pub struct WorkspaceLimiter {
    buckets: Arc<KeyedLimiter>,
    blocked: Arc<HashSet<String>>,
}

/// Splits a comma-separated list of workspace ids, ignoring blanks.
fn workspace_list(raw: Option<String>) -> HashSet<String> {
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

impl WorkspaceLimiter {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32, blocked: Option<String>) -> Self {
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            buckets: Arc::new(governor::RateLimiter::dashmap(quota)),
            blocked: Arc::new(workspace_list(blocked)),
        }
    }

    pub fn is_limited(&self, workspace_id: &str) -> bool {
        if self.blocked.contains(workspace_id) {
            return true;
        }
        self.buckets.check_key(&workspace_id.to_string()).is_err()
    }

    /// Background upkeep of the bucket map, to be spawned once: idle workspaces are
    /// pruned every minute or so, and the tracked workspace count is exported when
    /// `export_key_count` is set.
    pub async fn run_housekeeping(&self, export_key_count: bool) {
        // Replicas prune at slightly different moments
        let prune_period = Duration::from_secs(rand::thread_rng().gen_range(60..70));
        let mut prune = interval(prune_period);
        let mut key_count = interval(KEY_COUNT_PERIOD);

        loop {
            tokio::select! {
                _ = prune.tick() => {
                    self.buckets.retain_recent();
                    self.buckets.shrink_to_fit();
                }
                _ = key_count.tick(), if export_key_count => {
                    gauge!("gateway_rate_limiter_key_count").set(self.buckets.len() as f64);
                }
            }
        }
    }
}

#[async_trait]
impl RateLimiter for WorkspaceLimiter {
    async fn limit_reached(&self, workspace_id: &str) -> bool {
        self.is_limited(workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_second: u32, burst: u32, blocked: Option<&str>) -> WorkspaceLimiter {
        WorkspaceLimiter::new(
            NonZeroU32::new(per_second).unwrap(),
            NonZeroU32::new(burst).unwrap(),
            blocked.map(String::from),
        )
    }

    async fn admitted(limiter: &WorkspaceLimiter, workspace: &str, attempts: usize) -> usize {
        let mut admitted = 0;
        for _ in 0..attempts {
            if !limiter.limit_reached(workspace).await {
                admitted += 1;
            }
        }
        admitted
    }

    #[tokio::test]
    async fn burst_is_admitted_then_limited() {
        for burst in [1, 3, 5] {
            let limiter = limiter(1, burst, None);
            assert_eq!(admitted(&limiter, "workspace", 10).await, burst as usize);
        }
    }

    #[tokio::test]
    async fn quotas_are_per_workspace() {
        let limiter = limiter(1, 1, None);
        assert_eq!(admitted(&limiter, "busy", 5).await, 1);
        assert_eq!(admitted(&limiter, "quiet", 1).await, 1);
    }

    #[tokio::test]
    async fn blocked_workspaces_never_pass() {
        let limiter = limiter(1, 1, Some(" blocked-a,, blocked-b "));

        assert_eq!(admitted(&limiter, "blocked-a", 3).await, 0);
        assert_eq!(admitted(&limiter, "blocked-b", 3).await, 0);
        assert_eq!(admitted(&limiter, "other", 3).await, 1);
    }

    #[test]
    fn workspace_lists() {
        assert!(workspace_list(None).is_empty());
        assert!(workspace_list(Some(" , ".to_string())).is_empty());
        assert_eq!(
            workspace_list(Some("a, b".to_string())),
            HashSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
