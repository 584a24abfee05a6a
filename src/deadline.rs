use std::time::{Duration, Instant};

use crate::error::{PublishError, PublishResult};

/// Time budget for one resolve + apply call
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// `timeout_ms <= 0` falls back to `config::DEFAULT_TIMEOUT_MS`; a zero
    /// default means no deadline.
    pub fn from_millis(timeout_ms: i64) -> Self {
        let ms = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .unwrap_or(crate::config::DEFAULT_TIMEOUT_MS);

        Self {
            started: Instant::now(),
            budget: (ms > 0).then_some(Duration::from_millis(ms)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            budget: None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Fail with `DeadlineExceeded` once the budget is spent
    pub fn check(&self, phase: &str) -> PublishResult<()> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(PublishError::DeadlineExceeded {
                    phase: phase.to_string(),
                    elapsed_ms: self.elapsed_ms(),
                })
            }
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn expired() -> Self {
        Self {
            started: Instant::now(),
            budget: Some(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_expires() {
        assert!(Deadline::unbounded().check("resolve").is_ok());
        assert!(Deadline::from_millis(0).check("resolve").is_ok());
        assert!(Deadline::from_millis(-5).check("resolve").is_ok());
    }

    #[test]
    fn test_generous_budget_passes() {
        assert!(Deadline::from_millis(60_000).check("apply").is_ok());
    }

    #[test]
    fn test_expired_budget_fails() {
        let err = Deadline::expired().check("resolve").unwrap_err();
        assert_eq!(err.sqlstate(), "57014");
        assert!(err.to_string().starts_with("resolve cancelled after"));
    }
}
