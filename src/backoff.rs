//! Exponential backoff with jitter for publish retries.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::RetryPolicy;

/// Bounds `[floor, ceiling)` the delay before retry number `attempt` is drawn from.
///
/// The ceiling doubles with each attempt from `base_delay` up to `max_delay`;
/// the floor is half the ceiling, so successive ranges only touch at their
/// edges until the cap is reached.
pub fn delay_range(policy: &RetryPolicy, attempt: u32) -> (Duration, Duration) {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let ceiling = policy.base_delay.saturating_mul(factor).min(policy.max_delay);
    (ceiling / 2, ceiling)
}

/// Samples jittered delays from [`delay_range`].
pub struct Backoff {
    policy: RetryPolicy,
    rng: StdRng,
}

impl Backoff {
    /// Seeded from the policy when it carries a seed, from the OS otherwise.
    pub fn new(policy: RetryPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { policy, rng }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `attempt` (0 for the first retry)
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let (floor, ceiling) = delay_range(&self.policy, attempt);
        let floor_us = floor.as_micros().min(u128::from(u64::MAX)) as u64;
        let ceiling_us = ceiling.as_micros().min(u128::from(u64::MAX)) as u64;

        if ceiling_us <= floor_us {
            return floor;
        }
        Duration::from_micros(self.rng.random_range(floor_us..ceiling_us))
    }
}
