//! Retry budgets for retryable executor failures.
//!
//! Each [`ErrorClass`] has its own attempt counter and cooldown. A budget of
//! `n` allows `n` dispatches in total: the `n`-th failure of a class is
//! reported as [`RetryDecision::Exhausted`].

use std::collections::HashMap;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::models::outcome::ErrorClass;

/// Attempts and cooldown for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Dispatches allowed before giving up.
    pub max_attempts: u32,
    /// Sleep before each retry.
    pub cooldown: Duration,
}

/// Budgets for both retryable classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Budget for `TransientInfraError`.
    pub general: RetryBudget,
    /// Budget for `NoResponseError`.
    pub no_response: RetryBudget,
}

impl RetryPolicy {
    /// Budgets configured under `[retry]`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            general: RetryBudget {
                max_attempts: config.retry.max_retries,
                cooldown: config.general_cooldown(),
            },
            no_response: RetryBudget {
                max_attempts: config.retry.no_response_max_retries,
                cooldown: config.no_response_cooldown(),
            },
        }
    }

    /// Budget governing `class`.
    #[must_use]
    pub fn budget(&self, class: ErrorClass) -> RetryBudget {
        match class {
            ErrorClass::TransientInfra => self.general,
            ErrorClass::NoResponse => self.no_response,
        }
    }
}

/// What to do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `cooldown`, then dispatch again with a fresh session id.
    Retry {
        /// Failures of this class so far.
        attempt: u32,
        /// Dispatches left in this class's budget.
        remaining: u32,
        /// Sleep before the next dispatch.
        cooldown: Duration,
    },
    /// The class budget is spent.
    Exhausted {
        /// Failures of this class.
        attempts: u32,
    },
}

/// Failure counters for the dispatch of one job.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    failures: HashMap<ErrorClass, u32>,
}

impl RetryTracker {
    /// Fresh counters under `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Count a failure of `class` and decide whether to retry.
    pub fn record_failure(&mut self, class: ErrorClass) -> RetryDecision {
        let budget = self.policy.budget(class);
        let count = self.failures.entry(class).or_insert(0);
        *count += 1;
        let attempt = *count;

        if attempt < budget.max_attempts {
            RetryDecision::Retry {
                attempt,
                remaining: budget.max_attempts - attempt,
                cooldown: budget.cooldown,
            }
        } else {
            RetryDecision::Exhausted { attempts: attempt }
        }
    }

    /// Failures of `class` recorded so far.
    #[must_use]
    pub fn attempts(&self, class: ErrorClass) -> u32 {
        self.failures.get(&class).copied().unwrap_or(0)
    }

    /// Dispatches left in `class`'s budget.
    #[must_use]
    pub fn remaining(&self, class: ErrorClass) -> u32 {
        self.policy
            .budget(class)
            .max_attempts
            .saturating_sub(self.attempts(class))
    }
}
