use crate::config::LimiterConfig;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// Failure bookkeeping for one username
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptRecord {
    pub failed_attempts: u32,

    /// Attempts that passed the limiter and are still being verified
    pub in_flight: u32,
    pub lockout_until: Option<SystemTime>,
}

impl AttemptRecord {
    /// Time left on the lockout, clamped at zero
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.lockout_until
            .and_then(|until| until.duration_since(now).ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Clears an expired lockout and reports whether one is still active
    fn refresh(&mut self, now: SystemTime) -> Option<Duration> {
        match self.lockout_until {
            Some(until) if now < until => Some(self.remaining(now)),
            Some(_) => {
                // Cooldown is over; start counting from scratch
                self.failed_attempts = 0;
                self.lockout_until = None;
                None
            }
            None => None,
        }
    }

    fn is_idle(&self) -> bool {
        *self == AttemptRecord::default()
    }
}

/// What the limiter decided for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Credentials may be checked; the attempt holds a reservation that
    /// must be settled with `fail`, `succeed` or `release`
    Allowed,

    /// Still cooling down; credentials must not be checked
    LockedOut { retry_after: Duration },
}

/// Result of recording a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// More attempts are allowed before a lockout
    Remaining(u32),

    /// The username is locked out
    LockedOut { retry_after: Duration },
}

/// Consecutive-failure limiter keyed by username
///
/// After `max_attempts` consecutive failures a username is locked out for
/// `cooldown`. A success or an expired cooldown resets the counter.
///
/// `begin` reserves an attempt under the same lock that checks the
/// counter, so no more than `max_attempts` verifications can be running or
/// failed at once, however many requests arrive together. Records that
/// drop back to their default state are removed.
#[derive(Debug)]
pub struct LoginLimiter {
    config: LimiterConfig,
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl LoginLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AttemptRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the record for `username`, dropping it if it ends idle
    fn settle<R>(&self, username: &str, f: impl FnOnce(&mut AttemptRecord) -> R) -> R {
        let mut records = self.lock();
        let record = records.entry(username.to_string()).or_default();
        let result = f(record);
        if record.is_idle() {
            records.remove(username);
        }
        result
    }

    /// Checks whether `username` may attempt a login at `now` and, if so,
    /// reserves the attempt
    pub fn begin(&self, username: &str, now: SystemTime) -> Verdict {
        let max_attempts = self.config.max_attempts;
        let mut records = self.lock();
        records.retain(|_, record| {
            record.refresh(now);
            !record.is_idle()
        });

        match records.get_mut(username) {
            Some(record) => {
                if let Some(retry_after) = record.refresh(now) {
                    return Verdict::LockedOut { retry_after };
                }
                if record.failed_attempts + record.in_flight >= max_attempts {
                    // Every remaining attempt is already being verified
                    return Verdict::LockedOut {
                        retry_after: self.config.cooldown,
                    };
                }
                record.in_flight += 1;
            }
            None => {
                records.insert(
                    username.to_string(),
                    AttemptRecord {
                        in_flight: 1,
                        ..AttemptRecord::default()
                    },
                );
            }
        }
        Verdict::Allowed
    }

    /// Settles a reserved attempt as a failure
    pub fn fail(&self, username: &str, now: SystemTime) -> FailureOutcome {
        let LimiterConfig {
            max_attempts,
            cooldown,
        } = self.config.clone();

        self.settle(username, |record| {
            record.in_flight = record.in_flight.saturating_sub(1);
            record.refresh(now);
            record.failed_attempts += 1;
            if record.failed_attempts < max_attempts {
                return FailureOutcome::Remaining(max_attempts - record.failed_attempts);
            }
            if record.lockout_until.is_none() {
                record.lockout_until = Some(now + cooldown);
                log::warn!(
                    "locking out '{}' for {}s after {} failed attempts",
                    username,
                    cooldown.as_secs(),
                    record.failed_attempts
                );
            }
            FailureOutcome::LockedOut {
                retry_after: record.remaining(now),
            }
        })
    }

    /// Settles a reserved attempt as a success, resetting the counter
    pub fn succeed(&self, username: &str) {
        self.settle(username, |record| {
            record.in_flight = record.in_flight.saturating_sub(1);
            record.failed_attempts = 0;
            record.lockout_until = None;
        });
    }

    /// Drops a reservation whose credentials could not be checked
    pub fn release(&self, username: &str) {
        self.settle(username, |record| {
            record.in_flight = record.in_flight.saturating_sub(1);
        });
    }

    /// Snapshot of the record for `username`
    pub fn record(&self, username: &str) -> AttemptRecord {
        self.lock().get(username).cloned().unwrap_or_default()
    }

    /// Number of usernames with a live record
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn limiter(cooldown_secs: u64) -> LoginLimiter {
        LoginLimiter::new(LimiterConfig {
            max_attempts: 3,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    fn failed_attempt(limiter: &LoginLimiter, username: &str, now: SystemTime) -> FailureOutcome {
        assert_eq!(limiter.begin(username, now), Verdict::Allowed);
        limiter.fail(username, now)
    }

    #[test]
    fn third_failure_starts_lockout() {
        let limiter = limiter(30);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        assert_eq!(failed_attempt(&limiter, "ann", t0), FailureOutcome::Remaining(2));
        assert_eq!(failed_attempt(&limiter, "ann", t0), FailureOutcome::Remaining(1));
        assert_eq!(
            failed_attempt(&limiter, "ann", t0),
            FailureOutcome::LockedOut {
                retry_after: Duration::from_secs(30)
            }
        );

        let later = t0 + Duration::from_secs(10);
        assert_eq!(
            limiter.begin("ann", later),
            Verdict::LockedOut {
                retry_after: Duration::from_secs(20)
            }
        );
        // Other usernames are unaffected
        assert_eq!(limiter.begin("bob", later), Verdict::Allowed);
    }

    #[test]
    fn cooldown_expiry_resets_counter() {
        let limiter = limiter(300);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5_000);
        for _ in 0..3 {
            failed_attempt(&limiter, "ann", t0);
        }

        let after = t0 + Duration::from_secs(300);
        assert_eq!(limiter.begin("ann", after), Verdict::Allowed);
        assert_eq!(limiter.record("ann").failed_attempts, 0);
        assert_eq!(limiter.fail("ann", after), FailureOutcome::Remaining(2));
    }

    #[test]
    fn success_resets_counter() {
        let limiter = limiter(30);
        let t0 = SystemTime::UNIX_EPOCH;
        failed_attempt(&limiter, "ann", t0);
        failed_attempt(&limiter, "ann", t0);
        assert_eq!(limiter.begin("ann", t0), Verdict::Allowed);
        limiter.succeed("ann");
        assert_eq!(failed_attempt(&limiter, "ann", t0), FailureOutcome::Remaining(2));
    }

    #[test]
    fn records_are_dropped_once_reset() {
        let limiter = limiter(30);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        // Success and released reservations leave nothing behind
        assert_eq!(limiter.begin("ann", t0), Verdict::Allowed);
        limiter.succeed("ann");
        assert_eq!(limiter.begin("bob", t0), Verdict::Allowed);
        limiter.release("bob");
        assert_eq!(limiter.tracked(), 0);

        // Expired lockouts are pruned on the next attempt by anyone
        for _ in 0..3 {
            failed_attempt(&limiter, "mallory", t0);
        }
        assert_eq!(limiter.tracked(), 1);
        let after = t0 + Duration::from_secs(31);
        assert_eq!(limiter.begin("ann", after), Verdict::Allowed);
        limiter.succeed("ann");
        assert_eq!(limiter.tracked(), 0);
        assert_eq!(limiter.record("mallory"), AttemptRecord::default());
    }

    #[test]
    fn concurrent_attempts_cannot_exceed_the_limit() {
        let limiter = Arc::new(limiter(30));
        let barrier = Arc::new(Barrier::new(12));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    limiter.begin("ann", t0) == Verdict::Allowed
                })
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 3);
        assert_eq!(limiter.record("ann").in_flight, 3);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let record = AttemptRecord {
            failed_attempts: 3,
            in_flight: 0,
            lockout_until: Some(now - Duration::from_secs(5)),
        };
        assert_eq!(record.remaining(now), Duration::ZERO);
        assert_eq!(AttemptRecord::default().remaining(now), Duration::ZERO);
    }
}
