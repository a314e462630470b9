//! Call budget enforcement for the upstream API.
//!
//! The platform allows a fixed number of calls per trailing second and per trailing minute. A
//! single [`RateLimiter`] is shared by every outbound request of a run; callers suspend in
//! [`RateLimiter::acquire`] until one more call fits both windows.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Calls allowed per trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    pub max_per_second: u32,
    pub max_per_minute: u32,
}

/// Named budget tiers published by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    ExtraSmall,
    #[default]
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl RateTier {
    pub fn budget(self) -> RateBudget {
        let (max_per_second, max_per_minute) = match self {
            RateTier::ExtraSmall => (1, 15),
            RateTier::Small => (3, 60),
            RateTier::Medium => (10, 150),
            RateTier::Large => (75, 700),
            RateTier::ExtraLarge => (350, 3500),
        };
        RateBudget {
            max_per_second,
            max_per_minute,
        }
    }
}

/// Sliding-window limiter over both budgets.
///
/// The window holds the start instants of calls made in the last minute. Pruning, checking, and
/// recording happen under one lock so concurrent callers can never both claim the last slot.
#[derive(Debug)]
pub struct RateLimiter {
    budget: RateBudget,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(budget: RateBudget) -> Self {
        // A zero budget would never admit a call
        let budget = RateBudget {
            max_per_second: budget.max_per_second.max(1),
            max_per_minute: budget.max_per_minute.max(1),
        };
        Self {
            budget,
            window: Mutex::new(VecDeque::with_capacity(budget.max_per_minute as usize)),
        }
    }

    pub fn for_tier(tier: RateTier) -> Self {
        Self::new(tier.budget())
    }

    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    /// Wait until one more call fits both windows, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                match self.next_slot(&mut window, now) {
                    None => {
                        window.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate budget exhausted, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a call if it fits right now, without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        if self.next_slot(&mut window, now).is_none() {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Prune stale entries and return how long until a call is admissible, `None` if it is now.
    fn next_slot(&self, window: &mut VecDeque<Instant>, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= MINUTE {
                window.pop_front();
            } else {
                break;
            }
        }

        let mut wait = Duration::ZERO;

        if window.len() >= self.budget.max_per_minute as usize {
            // The call that must age out is the one `max_per_minute` places from the end
            let idx = window.len() - self.budget.max_per_minute as usize;
            wait = wait.max(MINUTE - now.duration_since(window[idx]));
        }

        let in_last_second = window
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < SECOND)
            .count();
        if in_last_second >= self.budget.max_per_second as usize {
            let idx = window.len() - self.budget.max_per_second as usize;
            wait = wait.max(SECOND - now.duration_since(window[idx]));
        }

        if wait.is_zero() { None } else { Some(wait) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Assert no trailing window of `span` holds more than `limit` of the sorted instants.
    fn assert_window(calls: &[Instant], span: Duration, limit: u32) {
        for (i, &start) in calls.iter().enumerate() {
            let in_window = calls[i..].iter().take_while(|&&t| t.duration_since(start) < span).count();
            assert!(
                in_window <= limit as usize,
                "{in_window} calls within {span:?} of call {i}, limit {limit}"
            );
        }
    }

    async fn run_concurrent(budget: RateBudget, tasks: usize) -> Vec<Instant> {
        let limiter = Arc::new(RateLimiter::new(budget));
        let mut handles = Vec::new();
        for _ in 0..tasks {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut calls = Vec::new();
        for handle in handles {
            calls.push(handle.await.unwrap());
        }
        calls.sort();
        calls
    }

    #[test]
    fn test_tiers_are_ordered() {
        let tiers = [
            RateTier::ExtraSmall,
            RateTier::Small,
            RateTier::Medium,
            RateTier::Large,
            RateTier::ExtraLarge,
        ];
        for pair in tiers.windows(2) {
            assert!(pair[0].budget().max_per_second < pair[1].budget().max_per_second);
            assert!(pair[0].budget().max_per_minute < pair[1].budget().max_per_minute);
        }
        assert_eq!(RateTier::default(), RateTier::Small);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_per_second_budget_immediately() {
        let limiter = RateLimiter::new(RateBudget {
            max_per_second: 3,
            max_per_minute: 60,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert!(!limiter.try_acquire().await);

        limiter.acquire().await;
        assert!(start.elapsed() >= SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_budget_blocks_until_oldest_ages_out() {
        let limiter = RateLimiter::new(RateBudget {
            max_per_second: 10,
            max_per_minute: 12,
        });

        let start = Instant::now();
        for _ in 0..13 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_any_window() {
        for budget in [
            RateTier::ExtraSmall.budget(),
            RateTier::Small.budget(),
            RateTier::Medium.budget(),
            RateBudget {
                max_per_second: 5,
                max_per_minute: 7,
            },
        ] {
            let calls = run_concurrent(budget, 40).await;
            assert_eq!(calls.len(), 40);
            assert_window(&calls, SECOND, budget.max_per_second);
            assert_window(&calls, MINUTE, budget.max_per_minute);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_is_raised_to_one() {
        let limiter = RateLimiter::new(RateBudget {
            max_per_second: 0,
            max_per_minute: 0,
        });
        assert_eq!(limiter.budget().max_per_second, 1);
        limiter.acquire().await;
    }
}
