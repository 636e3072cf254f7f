use anyhow::Result;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

#[derive(Debug)]
pub struct PollTimeout<S> {
    pub attempts: u32,
    pub last: Option<S>,
}

pub enum Attempt<T, S> {
    Ready(T),
    Pending(S),
}

/// Calls `check` until it reports [`Attempt::Ready`] or the attempt budget is
/// spent. Errors returned by `check` abort the poll immediately.
pub fn poll_until<T, S, F>(
    policy: PollPolicy,
    label: &str,
    mut check: F,
) -> Result<std::result::Result<T, PollTimeout<S>>>
where
    F: FnMut(u32) -> Result<Attempt<T, S>>,
{
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        match check(attempt)? {
            Attempt::Ready(value) => {
                tracing::debug!(label, attempt, "ready");
                return Ok(Ok(value));
            }
            Attempt::Pending(state) => {
                tracing::debug!(label, attempt, max = policy.max_attempts, "not ready yet");
                last = Some(state);
            }
        }
        if attempt < policy.max_attempts && !policy.interval.is_zero() {
            std::thread::sleep(policy.interval);
        }
    }
    Ok(Err(PollTimeout {
        attempts: policy.max_attempts,
        last,
    }))
}
