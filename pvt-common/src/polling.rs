//! Eventual-consistency assertion for properties updated by a background
//! process rather than synchronously on write.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::PropertyAddress;
use crate::error::{HarnessError, HarnessResult};
use crate::expectation::values_match;
use crate::mutator::PropertyAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_millis(100),
        }
    }
}

impl PollPolicy {
    /// Upper bound on the sleeping part of a poll.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// How a successful poll converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub address: String,
    pub value: String,
    /// Number of reads, including the final one.
    pub reads: u32,
    pub elapsed_ms: u64,
}

/// Read `address` until it matches `expected` or the attempt budget is
/// spent. After the budget a final read decides; a disagreement there is an
/// [`HarnessError::AssertionMismatch`] carrying the last value seen.
pub fn await_eventual_value(
    access: &dyn PropertyAccess,
    address: &PropertyAddress,
    expected: &str,
    policy: PollPolicy,
) -> HarnessResult<PollOutcome> {
    let started = Instant::now();
    let outcome = |value: String, reads: u32| PollOutcome {
        address: address.to_string(),
        value,
        reads,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    for attempt in 1..=policy.max_attempts {
        let value = access.get(address)?;
        if values_match(expected, &value) {
            debug!(%address, attempt, "Property converged");
            return Ok(outcome(value, attempt));
        }
        debug!(%address, attempt, %value, expected, "Property not converged yet");
        thread::sleep(policy.interval);
    }

    let value = access.get(address)?;
    if values_match(expected, &value) {
        return Ok(outcome(value, policy.max_attempts + 1));
    }
    warn!(%address, %value, expected, attempts = policy.max_attempts, "Property never converged");
    Err(HarnessError::AssertionMismatch {
        step: format!("poll {address}"),
        expected: expected.to_string(),
        actual: value,
    })
}
